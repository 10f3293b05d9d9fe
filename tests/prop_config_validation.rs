// Configuration validation across generated settings

use adv_varnish::config::VarnishConfig;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Socket timeouts up to one minute are accepted, longer ones rejected
    #[test]
    fn prop_socket_timeout_bound(timeout in 0u64..200_000) {
        let mut config = VarnishConfig::default();
        config.connection.socket_timeout = timeout;
        prop_assert_eq!(config.validate().is_ok(), timeout <= 60_000);
    }

    /// A zero timeout falls back to the default instead of disabling the limit
    #[test]
    fn prop_socket_timeout_never_zero(timeout in 0u64..=60_000) {
        let mut config = VarnishConfig::default();
        config.connection.socket_timeout = timeout;
        prop_assert!(!config.connection.socket_timeout().is_zero());
    }

    /// Every exclusion line needs a `|` separator
    #[test]
    fn prop_exclusion_lines(
        server in "[a-z*]{1,10}",
        prefix in "/[a-z/]{0,10}",
        with_separator in any::<bool>(),
    ) {
        let mut config = VarnishConfig::default();
        config.available.exclude = if with_separator {
            format!("{}|{}\n\n", server, prefix)
        } else {
            format!("{}{}\n", server, prefix)
        };
        prop_assert_eq!(config.validate().is_ok(), with_separator);
    }

    /// Terminal lists keep every whitespace-separated entry in order
    #[test]
    fn prop_terminal_list(hosts in prop::collection::vec("[a-z]{1,8}:[0-9]{2,5}", 1..6)) {
        let mut config = VarnishConfig::default();
        config.connection.control_terminal = hosts.join("  \t");
        prop_assert_eq!(config.connection.terminals(), hosts);
    }
}
