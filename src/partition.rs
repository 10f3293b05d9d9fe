//! Cache partition ("bin") policy
//!
//! Every requester falls into a bucket: users allowed to bypass the cache,
//! authenticated users keyed by their sorted role set, and anonymous users.
//! The bucket is sent to the client in two cookies so the edge cache can vary
//! on it. When the client's bin cookie is missing or stale the cookies are
//! re-issued and, unless forbidden for this request, the client is redirected
//! back to the same URI so its next request carries the right bin.

use crate::config::{CookieSettings, RedirectSettings, VarnishConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::form_urlencoded;

/// Cookie carrying the hashed bin
pub const COOKIE_BIN: &str = "COMBIN";

/// Cookie carrying the readable bucket
pub const COOKIE_INFO: &str = "COMINF";

pub const BYPASS_BUCKET: &str = "bypass_varnish";
pub const ANONYMOUS_BUCKET: &str = "anonymous";

/// Who is making the request, as reported by the host application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub is_authenticated: bool,
    pub user_id: u64,
    pub roles: Vec<String>,
    pub has_bypass_permission: bool,
}

impl Identity {
    pub fn anonymous() -> Self {
        Identity::default()
    }

    pub fn authenticated<I, R>(user_id: u64, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Identity {
            is_authenticated: true,
            user_id,
            roles: roles.into_iter().map(Into::into).collect(),
            has_bypass_permission: false,
        }
    }

    pub fn with_bypass_permission(mut self) -> Self {
        self.has_bypass_permission = true;
        self
    }
}

/// Normalized class of requester sharing cached content
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Bucket {
    Bypass,
    /// Roles sorted ascending and joined with `__`
    Roles(String),
    Anonymous,
}

impl Bucket {
    pub fn of(identity: &Identity) -> Self {
        if identity.has_bypass_permission {
            Bucket::Bypass
        } else if identity.is_authenticated {
            let mut roles: Vec<&str> = identity.roles.iter().map(String::as_str).collect();
            roles.sort_unstable();
            roles.dedup();
            Bucket::Roles(roles.join("__"))
        } else {
            Bucket::Anonymous
        }
    }

    /// The readable bucket, sent as the info cookie
    pub fn info(&self) -> &str {
        match self {
            Bucket::Bypass => BYPASS_BUCKET,
            Bucket::Roles(roles) => roles,
            Bucket::Anonymous => ANONYMOUS_BUCKET,
        }
    }

    /// Hex SHA-256 of the bucket, sent as the bin cookie
    pub fn bin(&self) -> String {
        hex::encode(Sha256::digest(self.info().as_bytes()))
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.info())
    }
}

/// What the incoming request tells us about partitioning
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Server name the request was addressed to
    pub server_name: String,
    /// Path and query as requested
    pub uri: String,
    /// Bin cookie sent by the client, if any
    pub previous_bin: Option<String>,
    /// Whether the request carried any cookie at all
    pub has_cookies: bool,
    /// Host session flag forbidding partition redirects
    pub redirect_forbidden: bool,
}

impl RequestContext {
    pub fn new(server_name: impl Into<String>, uri: impl Into<String>) -> Self {
        RequestContext {
            server_name: server_name.into(),
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// Pick up the bin cookie from a `Cookie` header value
    pub fn with_cookie_header(mut self, header: &str) -> Self {
        for pair in header.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            self.has_cookies = true;

            if let Some((name, value)) = pair.split_once('=') {
                if name.trim() == COOKIE_BIN && !value.trim().is_empty() {
                    self.previous_bin = Some(value.trim().to_string());
                }
            }
        }
        self
    }

    pub fn with_redirect_forbidden(mut self, forbidden: bool) -> Self {
        self.redirect_forbidden = forbidden;
        self
    }
}

/// Cookie values for one requester and whether the client must reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinAssignment {
    pub cookie_info: String,
    pub cookie_bin: String,
    pub needs_reload: bool,
}

/// Result of evaluating the policy for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOutcome {
    pub assignment: BinAssignment,
    /// `Set-Cookie` values to send; empty when the client's bin is current
    pub set_cookies: Vec<String>,
    /// Where to redirect the client, when a reload is needed and allowed
    pub redirect_to: Option<String>,
    /// A reload was needed but this request may not be redirected
    pub reload_suppressed: bool,
}

/// Maps identities to bins and decides on cookie refresh and reload
#[derive(Debug, Clone, Default)]
pub struct CachePartitionPolicy {
    redirect: RedirectSettings,
    cookie: CookieSettings,
}

impl CachePartitionPolicy {
    pub fn new(redirect: RedirectSettings, cookie: CookieSettings) -> Self {
        CachePartitionPolicy { redirect, cookie }
    }

    pub fn from_config(config: &VarnishConfig) -> Self {
        Self::new(config.redirect.clone(), config.cookie.clone())
    }

    /// Compute the bin for an identity and compare it with the client's cookie
    pub fn assign(&self, identity: &Identity, previous_bin: Option<&str>) -> BinAssignment {
        let bucket = Bucket::of(identity);
        let cookie_bin = bucket.bin();
        let needs_reload = previous_bin != Some(cookie_bin.as_str());

        BinAssignment {
            cookie_info: bucket.info().to_string(),
            cookie_bin,
            needs_reload,
        }
    }

    /// Whether this request must never be answered with a reload redirect
    pub fn redirect_forbidden(&self, request: &RequestContext) -> bool {
        if request.redirect_forbidden || self.redirect.forbidden {
            return true;
        }

        // Crawlers carry no cookies and would loop forever
        if self.redirect.forbidden_no_cookie && !request.has_cookies {
            return true;
        }

        self.redirect
            .resource_prefixes
            .iter()
            .filter(|prefix| !prefix.trim().is_empty())
            .any(|prefix| request.uri.starts_with(prefix.as_str()))
    }

    /// `Set-Cookie` values for both partition cookies
    pub fn set_cookie_headers(&self, assignment: &BinAssignment) -> Vec<String> {
        vec![
            self.cookie(COOKIE_BIN, &assignment.cookie_bin),
            self.cookie(COOKIE_INFO, &assignment.cookie_info),
        ]
    }

    fn cookie(&self, name: &str, value: &str) -> String {
        let value: String = form_urlencoded::byte_serialize(value.as_bytes()).collect();
        let mut cookie = format!("{}={}; Path={}", name, value, self.cookie.path);

        if !self.cookie.domain.is_empty() {
            cookie.push_str(&format!("; Domain={}", self.cookie.domain));
        }
        if self.cookie.lifetime > 0 {
            cookie.push_str(&format!("; Max-Age={}", self.cookie.lifetime));
        }
        if self.cookie.http_only {
            cookie.push_str("; HttpOnly");
        }
        cookie
    }

    /// Run the whole policy for one request
    pub fn evaluate(&self, identity: &Identity, request: &RequestContext) -> PartitionOutcome {
        let assignment = self.assign(identity, request.previous_bin.as_deref());

        if !assignment.needs_reload {
            return PartitionOutcome {
                assignment,
                set_cookies: Vec::new(),
                redirect_to: None,
                reload_suppressed: false,
            };
        }

        let set_cookies = self.set_cookie_headers(&assignment);
        let suppressed = self.redirect_forbidden(request);

        PartitionOutcome {
            assignment,
            set_cookies,
            redirect_to: (!suppressed).then(|| request.uri.clone()),
            reload_suppressed: suppressed,
        }
    }
}
