use adv_varnish::config::VarnishConfig;
use adv_varnish::ExclusionRule;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_sample_config() {
    let config = VarnishConfig::from_file("config/adv_varnish.yaml");
    assert!(config.is_ok(), "Failed to load sample config: {:?}", config.err());

    let config = config.unwrap();
    assert!(config.general.enabled);
    assert_eq!(config.general.grace, 60);
    assert_eq!(config.general.esi_cache_maximum_age, 600);
    assert_eq!(
        config.connection.terminals(),
        vec!["127.0.0.1:6082".to_string(), "127.0.0.1:6092".to_string()]
    );
    assert_eq!(config.connection.socket_timeout(), Duration::from_millis(100));
    assert!(!config.purge.all_hosts);
    assert_eq!(config.purge.host().unwrap(), "www.example.com");
    assert_eq!(ExclusionRule::parse_rules(&config.available.exclude).len(), 3);
    assert_eq!(config.status.snapshot_lifetime(), Some(Duration::from_secs(30)));
    assert_eq!(config.admin.auth_token.as_deref(), Some("purge-token"));
}

#[test]
fn test_load_minimal_config() {
    let file = write_config(
        r#"
connection:
  control_terminal: "10.0.0.5:6082"
"#,
    );

    let config = VarnishConfig::from_file(file.path()).unwrap();
    assert_eq!(config.connection.terminals(), vec!["10.0.0.5:6082".to_string()]);
    // Defaults are applied everywhere else
    assert!(!config.general.enabled);
    assert_eq!(config.general.page_cache_maximum_age, 3600);
    assert_eq!(config.connection.socket_timeout, 100);
    assert!(config.purge.all_hosts);
    assert_eq!(config.purge.tag_header, "X-Tag");
    assert!(config.cookie.http_only);
    assert!(config.status.snapshot_lifetime().is_none());
}

#[test]
fn test_load_empty_config_uses_defaults() {
    let file = write_config("{}\n");
    let config = VarnishConfig::from_file(file.path()).unwrap();
    assert_eq!(config, VarnishConfig::default());
}

#[test]
fn test_invalid_exclusion_rule() {
    let file = write_config(
        r#"
available:
  exclude: |
    *|/admin
    /no-server-part
"#,
    );

    let err = VarnishConfig::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("/no-server-part"));
}

#[test]
fn test_invalid_base_url() {
    let file = write_config(
        r#"
purge:
  base_url: "not a url"
"#,
    );
    assert!(VarnishConfig::from_file(file.path()).is_err());
}

#[test]
fn test_socket_timeout_too_large() {
    let file = write_config(
        r#"
connection:
  socket_timeout: 120000
"#,
    );
    assert!(VarnishConfig::from_file(file.path()).is_err());
}

#[test]
fn test_malformed_yaml() {
    let file = write_config("general: [enabled\n");
    assert!(VarnishConfig::from_file(file.path()).is_err());
}

#[test]
fn test_load_nonexistent_file() {
    let config = VarnishConfig::from_file("nonexistent.yaml");
    assert!(config.is_err(), "Should fail when file doesn't exist");
}

#[test]
fn test_reload_reports_changed_sections() {
    let mut config = VarnishConfig::default();
    let file = write_config(
        r#"
connection:
  control_terminal: "10.0.0.9:6082"
general:
  enabled: true
"#,
    );

    let changes = config.reload_from_file(file.path()).unwrap();
    assert!(changes.has_changes());
    assert!(changes.requires_status_refresh());
    assert_eq!(changes.summary(), vec!["general", "connection"]);
    assert!(config.general.enabled);

    // A failing reload leaves the current configuration in place
    let bad = write_config("connection:\n  socket_timeout: 999999\n");
    assert!(config.reload_from_file(bad.path()).is_err());
    assert_eq!(config.connection.control_terminal, "10.0.0.9:6082");
}
