use olivinedb::config::Config;
use std::time::Duration;

#[tokio::test]
async fn test_defaults_parse_and_validate() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.port, 8970);
    assert!(config.enable_mutations);
    assert_eq!(config.gc.age, Duration::from_secs(30 * 24 * 60 * 60));
    assert_eq!(config.heartbeat.timeout, Duration::from_secs(20));
    assert_eq!(config.query.cluster_timeout, Duration::from_secs(5));
}

#[tokio::test]
async fn test_toml_overrides_apply() {
    let config: Config = toml::from_str(
        r#"
        port = 9000
        allowed_maps = ["tasks"]
        enable_mutations = false

        [gc]
        interval = "30m"

        [writer]
        preset = "aggressive"
        "#,
    )
    .unwrap();
    assert_eq!(config.port, 9000);
    assert_eq!(config.allowed_maps.as_deref(), Some(&["tasks".to_string()][..]));
    assert!(!config.enable_mutations);
    assert_eq!(config.gc.interval, Duration::from_secs(30 * 60));
    assert_eq!(config.writer.preset, "aggressive");
}

#[tokio::test]
async fn test_tls_requires_cert_and_key() {
    let config: Config = toml::from_str(
        r#"
        [tls]
        enabled = true
        "#,
    )
    .unwrap();
    assert!(config.validate().is_err());
}
