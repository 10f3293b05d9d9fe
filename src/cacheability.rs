//! Per-response cacheability decisions and cache metadata headers

use crate::config::VarnishConfig;
use crate::partition::{CachePartitionPolicy, Identity, PartitionOutcome, RequestContext};
use http::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, SET_COOKIE};
use serde::Serialize;
use tracing::{debug, warn};

pub const X_TAG: HeaderName = HeaderName::from_static("x-tag");
pub const X_GRACE: HeaderName = HeaderName::from_static("x-grace");
pub const X_TTL: HeaderName = HeaderName::from_static("x-ttl");
pub const X_DOESI: HeaderName = HeaderName::from_static("x-doesi");
pub const X_CACHE_DEBUG: HeaderName = HeaderName::from_static("x-cache-debug");
pub const X_BIN_ROLE: HeaderName = HeaderName::from_static("x-bin-role");
pub const X_PASS_VARNISH: HeaderName = HeaderName::from_static("x-pass-varnish");

/// URI that serves per-user data and never gets edge includes
pub const USERDATA_URI: &str = "/adv_varnish/userdata";

const NOT_CACHEABLE_CONTROL: &str = "must-revalidate, no-cache, private";
const ESI_CACHE_CONTROL: &str = "no-cache, no-store";

/// One `<server name>|<uri prefix>` exclusion rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionRule {
    pub server: String,
    pub prefix: String,
}

impl ExclusionRule {
    /// Parse one rule line; `None` for blank lines and lines without `|`
    pub fn parse(line: &str) -> Option<Self> {
        let (server, prefix) = line.trim().split_once('|')?;
        Some(ExclusionRule {
            server: server.trim().to_string(),
            prefix: prefix.trim().to_string(),
        })
    }

    /// Parse every valid rule from newline-separated text
    pub fn parse_rules(text: &str) -> Vec<Self> {
        text.lines().filter_map(Self::parse).collect()
    }

    pub fn matches(&self, server_name: &str, uri: &str) -> bool {
        let server = self.server == "*" || self.server == server_name;
        let prefix = self.prefix == "*" || uri.starts_with(self.prefix.as_str());
        server && prefix
    }
}

/// Why a response is not cacheable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassReason {
    Disabled,
    Authenticated,
    Bypass,
    Excluded,
    NoMaxAge,
}

/// Cacheability of one response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheDecision {
    pub cacheable: bool,
    pub grace: u64,
    pub ttl: u64,
    pub tags: Vec<String>,
    pub esi_enabled: bool,
    /// Cache-Control to send on a cacheable response
    pub cache_control: Option<String>,
    /// Partition cookies must be refreshed even though nothing is cached
    pub refresh_partition: bool,
    pub reason: Option<PassReason>,
}

impl CacheDecision {
    fn pass(reason: PassReason, esi_enabled: bool) -> Self {
        CacheDecision {
            cacheable: false,
            grace: 0,
            ttl: 0,
            tags: Vec::new(),
            esi_enabled,
            cache_control: None,
            refresh_partition: matches!(reason, PassReason::Authenticated | PassReason::Bypass),
            reason: Some(reason),
        }
    }
}

/// What the caller has to do after headers were emitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDirective {
    pub decision: CacheDecision,
    pub partition: Option<PartitionOutcome>,
    /// Replace the response with a redirect to this URI
    pub redirect_to: Option<String>,
}

/// Decides cacheability and writes the cache metadata headers
#[derive(Debug, Clone)]
pub struct CacheabilityDecider {
    config: VarnishConfig,
    exclusions: Vec<ExclusionRule>,
    policy: CachePartitionPolicy,
}

impl CacheabilityDecider {
    pub fn new(config: VarnishConfig) -> Self {
        let exclusions = ExclusionRule::parse_rules(&config.available.exclude);
        let policy = CachePartitionPolicy::from_config(&config);
        CacheabilityDecider {
            config,
            exclusions,
            policy,
        }
    }

    pub fn policy(&self) -> &CachePartitionPolicy {
        &self.policy
    }

    /// Edge includes apply to every page except the user data endpoint
    pub fn esi_enabled(&self, uri: &str) -> bool {
        self.config.general.esi && uri != USERDATA_URI
    }

    /// Decide whether a response may be cached; first failing rule wins
    pub fn decide(&self, identity: &Identity, request: &RequestContext, tags: &[String]) -> CacheDecision {
        let general = &self.config.general;
        let esi_enabled = self.esi_enabled(&request.uri);

        if !general.enabled {
            return CacheDecision::pass(PassReason::Disabled, esi_enabled);
        }

        if identity.is_authenticated && !self.config.available.authenticated_users {
            return CacheDecision::pass(PassReason::Authenticated, esi_enabled);
        }

        if identity.has_bypass_permission {
            return CacheDecision::pass(PassReason::Bypass, esi_enabled);
        }

        if let Some(rule) = self
            .exclusions
            .iter()
            .find(|rule| rule.matches(&request.server_name, &request.uri))
        {
            debug!(
                "{}{} excluded from cache by rule {}|{}",
                request.server_name, request.uri, rule.server, rule.prefix
            );
            return CacheDecision::pass(PassReason::Excluded, esi_enabled);
        }

        if general.page_cache_maximum_age == 0 {
            return CacheDecision::pass(PassReason::NoMaxAge, esi_enabled);
        }

        let ttl = general.page_cache_maximum_age;
        let cache_control = if esi_enabled {
            ESI_CACHE_CONTROL.to_string()
        } else {
            general
                .cache_control
                .clone()
                .unwrap_or_else(|| format!("public, max-age={}", ttl))
        };

        CacheDecision {
            cacheable: true,
            grace: general.grace,
            ttl,
            tags: tags.to_vec(),
            esi_enabled,
            cache_control: Some(cache_control),
            refresh_partition: false,
            reason: None,
        }
    }

    /// Decide and write every cache header for one response
    pub fn respond(
        &self,
        identity: &Identity,
        request: &RequestContext,
        tags: &[String],
        headers: &mut HeaderMap,
    ) -> ResponseDirective {
        let decision = self.decide(identity, request, tags);
        let debug_mode = self.config.general.debug;

        if decision.esi_enabled {
            headers.insert(X_DOESI, HeaderValue::from_static("YES"));
        }

        let partition = if decision.cacheable || decision.refresh_partition {
            let outcome = self.policy.evaluate(identity, request);
            for cookie in &outcome.set_cookies {
                append_header(headers, SET_COOKIE, cookie);
            }
            if debug_mode {
                set_header(headers, X_BIN_ROLE, &outcome.assignment.cookie_info);
            }
            Some(outcome)
        } else {
            None
        };

        let mut redirect_to = None;

        if decision.cacheable {
            if debug_mode {
                headers.insert(X_CACHE_DEBUG, HeaderValue::from(1u32));
            }
            headers.insert(X_GRACE, HeaderValue::from(decision.grace));
            set_header(headers, X_TAG, &tag_header(&decision.tags));
            headers.insert(X_TTL, HeaderValue::from(decision.ttl));
            if let Some(cache_control) = &decision.cache_control {
                set_header(headers, CACHE_CONTROL, cache_control);
            }
            redirect_to = partition.as_ref().and_then(|p| p.redirect_to.clone());
        } else {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static(NOT_CACHEABLE_CONTROL));
            headers.insert(X_PASS_VARNISH, HeaderValue::from_static("YES"));
        }

        ResponseDirective {
            decision,
            partition,
            redirect_to,
        }
    }
}

/// Tags joined with `;`, with a trailing `;`
pub fn tag_header(tags: &[String]) -> String {
    let mut value = tags.join(";");
    value.push(';');
    value
}

pub(crate) fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => warn!("Skipping {} header, invalid value {:?}: {}", name, value, e),
    }
}

fn append_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.append(name, value);
        }
        Err(e) => warn!("Skipping {} header, invalid value {:?}: {}", name, value, e),
    }
}
