//! Ban command synthesis for tag and URL invalidation

use crate::config::PurgeSettings;
use crate::error::{Result, VarnishError};
use serde::{Deserialize, Serialize};

/// What a purge should invalidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PurgeTarget {
    /// Objects whose tag header matches any of the patterns
    Tag { patterns: Vec<String> },
    /// Objects whose request URL matches the pattern
    UrlPattern { pattern: String, exact: bool },
}

/// A single invalidation, turned into exactly one ban command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeRequest {
    pub target: PurgeTarget,
    /// Restrict the ban to the site's own host
    pub host_scoped: bool,
}

impl PurgeRequest {
    pub fn tags<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        PurgeRequest {
            target: PurgeTarget::Tag {
                patterns: tags.into_iter().map(Into::into).collect(),
            },
            host_scoped: false,
        }
    }

    pub fn url(pattern: impl Into<String>, exact: bool) -> Self {
        PurgeRequest {
            target: PurgeTarget::UrlPattern {
                pattern: pattern.into(),
                exact,
            },
            host_scoped: false,
        }
    }

    pub fn host_scoped(mut self, host_scoped: bool) -> Self {
        self.host_scoped = host_scoped;
        self
    }

    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self.target {
            PurgeTarget::Tag { .. } => "tag",
            PurgeTarget::UrlPattern { .. } => "url",
        }
    }
}

/// Builds ban commands for one site
#[derive(Debug, Clone)]
pub struct PurgeCommandBuilder {
    tag_header: String,
    host: String,
}

impl PurgeCommandBuilder {
    pub fn new(tag_header: impl Into<String>, host: impl Into<String>) -> Self {
        PurgeCommandBuilder {
            tag_header: tag_header.into(),
            host: host.into(),
        }
    }

    pub fn from_settings(settings: &PurgeSettings) -> Result<Self> {
        Ok(Self::new(settings.tag_header.clone(), settings.host()?))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Build the ban command for a request
    pub fn build(&self, request: &PurgeRequest) -> Result<String> {
        match &request.target {
            PurgeTarget::Tag { patterns } => {
                Self::build_tag_purge(patterns, &self.tag_header, request.host_scoped, &self.host)
            }
            PurgeTarget::UrlPattern { pattern, exact } => Ok(Self::build_url_purge(
                pattern,
                *exact,
                request.host_scoped,
                &self.host,
            )),
        }
    }

    /// `ban obj.http.<header> ~ "<tag>|<tag>..."`
    ///
    /// A single tag is used as-is; several are joined into an alternation.
    pub fn build_tag_purge(
        tags: &[String],
        header_name: &str,
        host_scoped: bool,
        current_host: &str,
    ) -> Result<String> {
        if tags.is_empty() {
            return Err(VarnishError::InvalidCommand(
                "tag purge needs at least one tag".to_string(),
            ));
        }

        let pattern = strip_quotes(&tags.join("|"));
        let condition = format!("obj.http.{} ~ \"{}\"", header_name, pattern);
        Ok(ban(&condition, host_scoped, current_host))
    }

    /// `ban req.url ~ "<pattern>"`, or `==` for an exact match
    pub fn build_url_purge(pattern: &str, exact: bool, host_scoped: bool, current_host: &str) -> String {
        let op = if exact { "==" } else { "~" };
        let condition = format!("req.url {} \"{}\"", op, strip_quotes(pattern));
        ban(&condition, host_scoped, current_host)
    }
}

fn ban(condition: &str, host_scoped: bool, current_host: &str) -> String {
    if host_scoped {
        format!("ban req.http.host ~ {} && {}", current_host, condition)
    } else {
        format!("ban {}", condition)
    }
}

/// Quotes would end the ban's string literal early
fn strip_quotes(pattern: &str) -> String {
    pattern.replace(['"', '\''], "")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_single_tag() {
        let cmd = PurgeCommandBuilder::build_tag_purge(&tags(&["node:12"]), "X-Tag", false, "").unwrap();
        assert_eq!(cmd, r#"ban obj.http.X-Tag ~ "node:12""#);
    }

    #[test]
    fn test_multiple_tags_alternation() {
        let cmd = PurgeCommandBuilder::build_tag_purge(
            &tags(&["node:12", "node_list", "user:3"]),
            "X-Tag",
            false,
            "",
        )
        .unwrap();
        assert_eq!(cmd, r#"ban obj.http.X-Tag ~ "node:12|node_list|user:3""#);
    }

    #[test]
    fn test_host_scoped_tag_purge() {
        let cmd = PurgeCommandBuilder::build_tag_purge(&tags(&["node:1"]), "X-Tag", true, "example.com")
            .unwrap();
        assert_eq!(
            cmd,
            r#"ban req.http.host ~ example.com && obj.http.X-Tag ~ "node:1""#
        );
    }

    #[test]
    fn test_quotes_are_stripped() {
        let cmd = PurgeCommandBuilder::build_tag_purge(&tags(&["a\"b", "c'd"]), "X-Tag", false, "")
            .unwrap();
        assert_eq!(cmd, r#"ban obj.http.X-Tag ~ "ab|cd""#);

        let cmd = PurgeCommandBuilder::build_url_purge("/it's\"here", false, false, "");
        assert_eq!(cmd, r#"ban req.url ~ "/itshere""#);
    }

    #[test]
    fn test_empty_tags_rejected() {
        assert!(PurgeCommandBuilder::build_tag_purge(&[], "X-Tag", false, "").is_err());
    }

    #[test]
    fn test_url_purge_modes() {
        assert_eq!(
            PurgeCommandBuilder::build_url_purge("^/node/.*", false, false, ""),
            r#"ban req.url ~ "^/node/.*""#
        );
        assert_eq!(
            PurgeCommandBuilder::build_url_purge("/node/1", true, true, "example.com"),
            r#"ban req.http.host ~ example.com && req.url == "/node/1""#
        );
    }

    #[test]
    fn test_build_from_request() {
        let builder = PurgeCommandBuilder::new("X-Cache-Tags", "www.example.org");

        let request = PurgeRequest::tags(["config:system.site"]).host_scoped(true);
        assert_eq!(request.kind(), "tag");
        assert_eq!(
            builder.build(&request).unwrap(),
            r#"ban req.http.host ~ www.example.org && obj.http.X-Cache-Tags ~ "config:system.site""#
        );

        let request = PurgeRequest::url("/sites/default/files/1.txt", true);
        assert_eq!(request.kind(), "url");
        assert_eq!(
            builder.build(&request).unwrap(),
            r#"ban req.url == "/sites/default/files/1.txt""#
        );
    }

    #[test]
    fn test_builder_from_settings() {
        let settings = PurgeSettings {
            base_url: "https://shop.example.com/".to_string(),
            ..Default::default()
        };
        let builder = PurgeCommandBuilder::from_settings(&settings).unwrap();
        assert_eq!(builder.host(), "shop.example.com");
    }
}
