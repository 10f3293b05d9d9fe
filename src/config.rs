//! Configuration management for the varnish integration

use crate::cacheability::ExclusionRule;
use crate::error::{Result, VarnishError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Control terminal used when none is configured
pub const DEFAULT_CONTROL_TERMINAL: &str = "127.0.0.1:6082";

/// Socket timeout in milliseconds used when none is configured
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 100;

/// Top-level configuration, populated once at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VarnishConfig {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub available: AvailabilitySettings,

    #[serde(default)]
    pub purge: PurgeSettings,

    #[serde(default)]
    pub redirect: RedirectSettings,

    #[serde(default)]
    pub cookie: CookieSettings,

    #[serde(default)]
    pub admin: AdminSettings,

    #[serde(default)]
    pub status: StatusSettings,
}

/// Caching behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralSettings {
    /// Whether responses may be cached at all (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Whether edge-side includes are processed (default: false)
    #[serde(default)]
    pub esi: bool,

    /// Emit debug headers (default: false)
    #[serde(default)]
    pub debug: bool,

    /// Log every ban command (default: false)
    #[serde(default)]
    pub logging: bool,

    /// Grace period in seconds (default: 60)
    #[serde(default = "default_grace")]
    pub grace: u64,

    /// Page TTL in seconds (default: 3600)
    #[serde(default = "default_max_age")]
    pub page_cache_maximum_age: u64,

    /// Fragment TTL in seconds (default: 3600)
    #[serde(default = "default_max_age")]
    pub esi_cache_maximum_age: u64,

    /// Cache-Control value for cacheable pages; `public, max-age=<ttl>` when unset
    #[serde(default)]
    pub cache_control: Option<String>,
}

/// How to reach the control terminals
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSettings {
    /// Space-separated `host:port` list
    #[serde(default = "default_control_terminal")]
    pub control_terminal: String,

    /// Shared secret for the authentication challenge
    #[serde(default)]
    pub control_key: String,

    /// Connect, send and receive timeout in milliseconds (default: 100)
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout: u64,
}

/// Which requests may be served from cache
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AvailabilitySettings {
    /// Newline-separated `<server name>|<uri prefix>` rules, `*` matches anything
    #[serde(default)]
    pub exclude: String,

    /// Whether authenticated users get cached pages (default: false)
    #[serde(default)]
    pub authenticated_users: bool,
}

/// Ban command scoping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurgeSettings {
    /// Ban across every host instead of the site's own (default: true)
    #[serde(default = "default_true")]
    pub all_hosts: bool,

    /// Base URL of the site; its host scopes bans when `all_hosts` is false
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Response header carrying cache tags (default: X-Tag)
    #[serde(default = "default_tag_header")]
    pub tag_header: String,
}

/// When a partition reload redirect must not happen
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedirectSettings {
    /// Never redirect (default: false)
    #[serde(default)]
    pub forbidden: bool,

    /// Never redirect requests that carry no cookies at all (default: false)
    #[serde(default)]
    pub forbidden_no_cookie: bool,

    /// Path prefixes of file and temp roots that are never redirected
    #[serde(default = "default_resource_prefixes")]
    pub resource_prefixes: Vec<String>,
}

/// Session cookie parameters inherited from the host framework
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CookieSettings {
    /// Lifetime in seconds, 0 for a session cookie (default: 0)
    #[serde(default)]
    pub lifetime: u64,

    #[serde(default = "default_cookie_path")]
    pub path: String,

    #[serde(default)]
    pub domain: String,

    #[serde(default = "default_true")]
    pub http_only: bool,
}

/// Admin HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminSettings {
    /// Address to bind (default: 127.0.0.1:6083)
    #[serde(default = "default_admin_address")]
    pub address: String,

    /// Token required for PURGE requests; unauthenticated when unset
    pub auth_token: Option<String>,

    /// Expose Prometheus metrics (default: true)
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
}

/// Backend status caching
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSettings {
    /// Seconds a status snapshot stays valid; unset keeps it for the process lifetime
    #[serde(default)]
    pub snapshot_lifetime: Option<u64>,
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_grace() -> u64 {
    60
}

fn default_max_age() -> u64 {
    3600 // 1 hour
}

fn default_control_terminal() -> String {
    DEFAULT_CONTROL_TERMINAL.to_string()
}

fn default_socket_timeout() -> u64 {
    DEFAULT_SOCKET_TIMEOUT_MS
}

fn default_base_url() -> String {
    "http://localhost".to_string()
}

fn default_tag_header() -> String {
    "X-Tag".to_string()
}

fn default_resource_prefixes() -> Vec<String> {
    vec![
        "/sites/default/files".to_string(),
        "/system/files".to_string(),
        "/tmp".to_string(),
    ]
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_admin_address() -> String {
    "127.0.0.1:6083".to_string()
}

impl Default for GeneralSettings {
    fn default() -> Self {
        GeneralSettings {
            enabled: false,
            esi: false,
            debug: false,
            logging: false,
            grace: default_grace(),
            page_cache_maximum_age: default_max_age(),
            esi_cache_maximum_age: default_max_age(),
            cache_control: None,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            control_terminal: default_control_terminal(),
            control_key: String::new(),
            socket_timeout: default_socket_timeout(),
        }
    }
}

impl Default for PurgeSettings {
    fn default() -> Self {
        PurgeSettings {
            all_hosts: true,
            base_url: default_base_url(),
            tag_header: default_tag_header(),
        }
    }
}

impl Default for RedirectSettings {
    fn default() -> Self {
        RedirectSettings {
            forbidden: false,
            forbidden_no_cookie: false,
            resource_prefixes: default_resource_prefixes(),
        }
    }
}

impl Default for CookieSettings {
    fn default() -> Self {
        CookieSettings {
            lifetime: 0,
            path: default_cookie_path(),
            domain: String::new(),
            http_only: true,
        }
    }
}

impl Default for AdminSettings {
    fn default() -> Self {
        AdminSettings {
            address: default_admin_address(),
            auth_token: None,
            enable_metrics: true,
        }
    }
}

impl ConnectionSettings {
    /// Configured terminal entries, falling back to the default terminal
    pub fn terminals(&self) -> Vec<String> {
        let terminals: Vec<String> = self
            .control_terminal
            .split_whitespace()
            .map(str::to_string)
            .collect();

        if terminals.is_empty() {
            vec![DEFAULT_CONTROL_TERMINAL.to_string()]
        } else {
            terminals
        }
    }

    /// Socket timeout, split into whole seconds and microseconds
    pub fn socket_timeout(&self) -> Duration {
        let millis = if self.socket_timeout == 0 {
            DEFAULT_SOCKET_TIMEOUT_MS
        } else {
            self.socket_timeout
        };
        let seconds = millis / 1000;
        let microseconds = (millis % 1000) * 1000;
        Duration::new(seconds, (microseconds * 1000) as u32)
    }
}

impl PurgeSettings {
    /// Host part of `base_url`, used for host-scoped bans
    pub fn host(&self) -> Result<String> {
        let url = url::Url::parse(&self.base_url).map_err(|e| {
            VarnishError::ConfigError(format!("Invalid purge.base_url '{}': {}", self.base_url, e))
        })?;

        url.host_str().map(str::to_string).ok_or_else(|| {
            VarnishError::ConfigError(format!("purge.base_url '{}' has no host", self.base_url))
        })
    }
}

impl StatusSettings {
    pub fn snapshot_lifetime(&self) -> Option<Duration> {
        self.snapshot_lifetime.map(Duration::from_secs)
    }
}

impl VarnishConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(VarnishConfig)` if loading and validation succeed
    /// * `Err(VarnishError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            VarnishError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: VarnishConfig = serde_yaml::from_str(&content).map_err(|e| {
            VarnishError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - connection.socket_timeout must not exceed 60000 ms
    /// - every non-empty available.exclude line must contain `|`
    /// - purge.base_url must be an absolute URL with a host
    /// - redirect.resource_prefixes entries must start with `/`
    /// - admin.address must be a socket address
    pub fn validate(&self) -> Result<()> {
        const MAX_SOCKET_TIMEOUT_MS: u64 = 60_000;

        if self.connection.socket_timeout > MAX_SOCKET_TIMEOUT_MS {
            return Err(VarnishError::ConfigError(format!(
                "connection.socket_timeout must be at most {}ms, got {}ms",
                MAX_SOCKET_TIMEOUT_MS, self.connection.socket_timeout
            )));
        }

        for line in self.available.exclude.lines() {
            if !line.trim().is_empty() && ExclusionRule::parse(line).is_none() {
                return Err(VarnishError::ConfigError(format!(
                    "available.exclude rule '{}' must look like '<server>|<uri prefix>'",
                    line.trim()
                )));
            }
        }

        self.purge.host()?;

        if let Some(prefix) = self
            .redirect
            .resource_prefixes
            .iter()
            .find(|p| !p.starts_with('/'))
        {
            return Err(VarnishError::ConfigError(format!(
                "redirect.resource_prefixes entry '{}' must start with '/'",
                prefix
            )));
        }

        self.admin.address.parse::<SocketAddr>().map_err(|e| {
            VarnishError::ConfigError(format!(
                "Invalid admin.address '{}': {}",
                self.admin.address, e
            ))
        })?;

        Ok(())
    }

    /// Update configuration from another config
    ///
    /// Validates `new_config` first; on failure the current configuration is
    /// left untouched.
    pub fn update_from(&mut self, new_config: &VarnishConfig) -> Result<ConfigChanges> {
        new_config.validate()?;

        let changes = ConfigChanges {
            general_changed: self.general != new_config.general,
            connection_changed: self.connection != new_config.connection,
            availability_changed: self.available != new_config.available,
            purge_changed: self.purge != new_config.purge,
            redirect_changed: self.redirect != new_config.redirect,
            cookie_changed: self.cookie != new_config.cookie,
            admin_changed: self.admin != new_config.admin,
            status_changed: self.status != new_config.status,
        };

        *self = new_config.clone();
        Ok(changes)
    }

    /// Reload configuration from file and apply changes
    pub fn reload_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<ConfigChanges> {
        let new_config = Self::from_file(path)?;
        self.update_from(&new_config)
    }
}

/// Description of configuration changes after hot reload
#[derive(Debug, Default, Clone)]
pub struct ConfigChanges {
    pub general_changed: bool,
    pub connection_changed: bool,
    pub availability_changed: bool,
    pub purge_changed: bool,
    pub redirect_changed: bool,
    pub cookie_changed: bool,
    pub admin_changed: bool,
    pub status_changed: bool,
}

impl ConfigChanges {
    /// Check if any changes were made
    pub fn has_changes(&self) -> bool {
        !self.summary().is_empty()
    }

    /// Check if the cached backend status no longer describes the configured terminals
    pub fn requires_status_refresh(&self) -> bool {
        self.connection_changed || self.status_changed
    }

    /// Names of the sections that changed
    pub fn summary(&self) -> Vec<String> {
        [
            (self.general_changed, "general"),
            (self.connection_changed, "connection"),
            (self.availability_changed, "available"),
            (self.purge_changed, "purge"),
            (self.redirect_changed, "redirect"),
            (self.cookie_changed, "cookie"),
            (self.admin_changed, "admin"),
            (self.status_changed, "status"),
        ]
        .iter()
        .filter(|(changed, _)| *changed)
        .map(|(_, name)| name.to_string())
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VarnishConfig::default();
        assert!(!config.general.enabled);
        assert_eq!(config.general.page_cache_maximum_age, 3600);
        assert_eq!(config.connection.control_terminal, "127.0.0.1:6082");
        assert_eq!(config.connection.socket_timeout, 100);
        assert!(config.purge.all_hosts);
        assert_eq!(config.purge.tag_header, "X-Tag");
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(VarnishConfig::default().validate().is_ok());
    }

    #[test]
    fn test_terminals_split_on_whitespace() {
        let mut config = VarnishConfig::default();
        config.connection.control_terminal = "10.0.0.1:6082  10.0.0.2:6082".to_string();
        assert_eq!(
            config.connection.terminals(),
            vec!["10.0.0.1:6082".to_string(), "10.0.0.2:6082".to_string()]
        );
    }

    #[test]
    fn test_empty_terminal_falls_back() {
        let mut config = VarnishConfig::default();
        config.connection.control_terminal = "   ".to_string();
        assert_eq!(config.connection.terminals(), vec![DEFAULT_CONTROL_TERMINAL]);
    }

    #[test]
    fn test_socket_timeout_conversion() {
        let mut config = VarnishConfig::default();
        config.connection.socket_timeout = 1250;
        assert_eq!(config.connection.socket_timeout(), Duration::from_millis(1250));

        config.connection.socket_timeout = 0;
        assert_eq!(config.connection.socket_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_validate_socket_timeout_too_large() {
        let mut config = VarnishConfig::default();
        config.connection.socket_timeout = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_exclude_rules() {
        let mut config = VarnishConfig::default();
        config.available.exclude = "*|/admin\nexample.com|*\n\n".to_string();
        assert!(config.validate().is_ok());

        config.available.exclude = "*|/admin\n/user".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_purge_host() {
        let mut config = VarnishConfig::default();
        config.purge.base_url = "https://www.example.com:8443/drupal".to_string();
        assert_eq!(config.purge.host().unwrap(), "www.example.com");

        config.purge.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_resource_prefixes() {
        let mut config = VarnishConfig::default();
        config.redirect.resource_prefixes = vec!["sites/default/files".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_hot_reload() {
        let mut config = VarnishConfig::default();
        let mut new_config = VarnishConfig::default();

        let changes = config.update_from(&new_config).unwrap();
        assert!(!changes.has_changes());

        new_config.connection.control_terminal = "10.0.0.5:6082".to_string();
        let changes = config.update_from(&new_config).unwrap();
        assert!(changes.connection_changed);
        assert!(changes.requires_status_refresh());
        assert_eq!(config.connection.control_terminal, "10.0.0.5:6082");

        new_config.general.grace = 300;
        let changes = config.update_from(&new_config).unwrap();
        assert!(changes.general_changed);
        assert!(!changes.requires_status_refresh());
        assert_eq!(changes.summary(), vec!["general".to_string()]);
    }

    #[test]
    fn test_config_hot_reload_validation() {
        let mut config = VarnishConfig::default();
        let mut new_config = VarnishConfig::default();
        new_config.connection.socket_timeout = 999_999;

        assert!(config.update_from(&new_config).is_err());
        assert_eq!(config.connection.socket_timeout, 100);
    }
}
