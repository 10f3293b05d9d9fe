//! Edge-side include placeholders and fragment rendering
//!
//! Pages embed `<esi:include>` placeholders pointing at
//! `/adv-varnish/esi/<type>`. The proxy fetches those separately; the
//! registry resolves each fragment type through the handlers the host
//! application registered.

use crate::cacheability::{set_header, X_TAG, X_TTL};
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use url::form_urlencoded;

/// Path prefix fragment requests are routed under
pub const ESI_PATH_PREFIX: &str = "/adv-varnish/esi/";

/// Fragment TTL when none is configured
pub const DEFAULT_ESI_TTL: u64 = 3600;

/// Rendered fragment content and the cache tags it depends on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    pub markup: String,
    pub tags: Vec<String>,
}

impl Fragment {
    pub fn new(markup: impl Into<String>) -> Self {
        Fragment {
            markup: markup.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Renders fragments of the types it was registered for
#[async_trait]
pub trait FragmentHandler: Send + Sync {
    /// `None` lets the next handler for the type try
    async fn render(&self, fragment_type: &str, params: &[(String, String)]) -> Option<Fragment>;
}

/// Fragment type to handlers, in registration order
#[derive(Default, Clone)]
pub struct FragmentRegistry {
    handlers: HashMap<String, Vec<Arc<dyn FragmentHandler>>>,
}

impl FragmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fragment_type: impl Into<String>, handler: Arc<dyn FragmentHandler>) {
        self.handlers
            .entry(fragment_type.into())
            .or_default()
            .push(handler);
    }

    /// First non-empty fragment wins; later handlers are not asked
    pub async fn resolve(&self, fragment_type: &str, params: &[(String, String)]) -> Option<Fragment> {
        let handlers = self.handlers.get(fragment_type)?;

        for handler in handlers {
            if let Some(fragment) = handler.render(fragment_type, params).await {
                if !fragment.markup.is_empty() {
                    return Some(fragment);
                }
            }
        }

        debug!("No handler rendered fragment type {}", fragment_type);
        None
    }
}

/// Placeholder markup for a fragment
pub fn placeholder(fragment_type: &str, params: &[(&str, &str)]) -> String {
    let fragment_type: String = form_urlencoded::byte_serialize(fragment_type.as_bytes()).collect();
    let mut src = format!("{}{}", ESI_PATH_PREFIX, fragment_type);

    if !params.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        src.push('?');
        src.push_str(&query);
    }

    format!("<esi:include src=\"{}\" max-age=\"0\" />", src)
}

/// Split a fragment request path and query into type and parameters
pub fn parse_request(path: &str, query: Option<&str>) -> Option<(String, Vec<(String, String)>)> {
    let fragment_type = path.strip_prefix(ESI_PATH_PREFIX)?;
    if fragment_type.is_empty() || fragment_type.contains('/') {
        return None;
    }

    let fragment_type = form_urlencoded::parse(fragment_type.as_bytes())
        .map(|(key, _)| key.into_owned())
        .next()?;
    let params = query
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    Some((fragment_type, params))
}

/// A resolved fragment ready to send
#[derive(Debug, Clone)]
pub struct FragmentResponse {
    pub body: String,
    pub headers: HeaderMap,
}

impl FragmentResponse {
    /// `X-Tag` carries space-joined tags, `X-TTL` the fragment max age
    pub fn new(fragment: Fragment, esi_max_age: u64) -> Self {
        let mut headers = HeaderMap::new();
        set_header(&mut headers, X_TAG, &fragment.tags.join(" "));
        headers.insert(X_TTL, HeaderValue::from(esi_ttl(esi_max_age)));

        FragmentResponse {
            body: fragment.markup,
            headers,
        }
    }
}

pub fn esi_ttl(esi_max_age: u64) -> u64 {
    if esi_max_age == 0 {
        DEFAULT_ESI_TTL
    } else {
        esi_max_age
    }
}
