use std::{env, fs};

use skyrelay_cache::{LockFailureMode, RateLimitAlgorithm, namespaces};
use skyrelay_config::{Keyring, SecretSourceKind, SecretsConfig, SecretsProvider};
use skyrelay_gateway::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    // Create a temporary TOML configuration file
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("skyrelay.toml");

    let toml_content = r#"
[redis]
enabled = true
url = "redis://cache.internal:6379/1"
pool_size = 4
timeout_ms = 250
key_prefix = "test-fleet"

[cache]
local_max_entries = 500

[cache.ttl]
airport = 3600
flight_state = 5

[circuit_breaker]
failure_threshold = 3
reset_timeout_ms = 1000

[rate_limit.default]
max_requests = 50
window_ms = 1000

[rate_limit.classes.flights]
max_requests = 10
window_ms = 1000
algorithm = "sliding"

[locks]
failure_mode = "closed"

[auth.oauth]
client_id = "skyrelay"
token_url = "https://auth.example.com/oauth/token"

[logging]
level = "debug"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert!(cfg.redis.enabled);
    assert_eq!(cfg.redis.connection_url(), "redis://cache.internal:6379/1");
    assert_eq!(cfg.key_space().prefix(), "test-fleet");
    assert_eq!(cfg.cache.local_max_entries, 500);
    assert_eq!(cfg.cache.ttl.airport, 3600);
    assert_eq!(cfg.cache.ttl.track, 60);
    assert_eq!(cfg.circuit_breaker.failure_threshold, 3);
    assert_eq!(cfg.circuit_breaker.half_open_requests, 3);
    assert_eq!(cfg.locks.failure_mode, LockFailureMode::Closed);
    let flights = cfg.rate_limit.rule_for("flights:cli");
    assert_eq!(flights.max_requests, 10);
    assert_eq!(flights.algorithm, RateLimitAlgorithm::Sliding);
    assert_eq!(cfg.rate_limit.rule_for("other:cli").max_requests, 50);
    assert_eq!(cfg.logging.level.to_ascii_lowercase(), "debug");

    // 2) Env override should win over file
    unsafe {
        env::set_var("SKYRELAY__CIRCUIT_BREAKER__FAILURE_THRESHOLD", "9");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.circuit_breaker.failure_threshold, 9);
    // cleanup env var
    unsafe {
        env::remove_var("SKYRELAY__CIRCUIT_BREAKER__FAILURE_THRESHOLD");
    }

    // 3) Invalid config (zero window) should error
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[rate_limit.classes.airport]
max_requests = 60
window_ms = 0
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("rate_limit.airport"));
}

#[test]
fn missing_file_uses_defaults() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("absent.toml");

    let cfg = load_config(path.to_str()).expect("defaults are valid");
    assert!(!cfg.redis.enabled);
    assert_eq!(cfg.cache.ttl.for_namespace(namespaces::AIRPORT).as_secs(), 86_400);
    assert_eq!(cfg.auth.oauth.refresh_buffer_secs, 300);
}

#[test]
fn invalid_log_level_rejected() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("skyrelay.toml");
    fs::write(&path, "[logging]\nlevel = \"loud\"\n").expect("write toml");

    let err = load_config(path.to_str()).expect_err("expected validation error");
    assert!(err.contains("logging.level"));
}

#[tokio::test]
async fn secrets_fill_empty_slots_from_files() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let secrets_dir = dir.path().join("secrets");
    fs::create_dir(&secrets_dir).expect("secrets dir");
    fs::write(secrets_dir.join("redis_password"), "from-file\n").expect("write secret");
    fs::write(secrets_dir.join("oauth_client_secret"), "client-secret").expect("write secret");

    let key = Keyring::generate_key();
    let keyring = Keyring::new(key, "primary");
    let encrypted = keyring.encrypt("airport-key").await.expect("encrypt").encode();

    let path = dir.path().join("skyrelay.toml");
    fs::write(
        &path,
        format!(
            r#"
[upstream]
airport_api_key = "{encrypted}"

[auth.oauth]
client_id = "skyrelay"
token_url = "https://auth.example.com/oauth/token"
"#
        ),
    )
    .expect("write toml");

    let mut cfg = load_config(path.to_str()).expect("should parse config");
    let provider = SecretsProvider::with_keyring(
        &SecretsConfig {
            source: SecretSourceKind::File,
            dir: secrets_dir,
            ..Default::default()
        },
        Some(keyring),
    )
    .expect("provider");

    cfg.resolve_secrets(&provider).await.expect("resolve secrets");
    assert_eq!(cfg.redis.password, "from-file");
    assert_eq!(cfg.upstream.airport_api_key, "airport-key");
    assert_eq!(cfg.auth.oauth.client_secret, "client-secret");
    assert!(cfg.auth.token_cache_config().oauth.is_some());

    let shown = toml::to_string(&cfg.redacted()).expect("serialize");
    assert!(!shown.contains("from-file"));
    assert!(!shown.contains("client-secret"));
}

#[tokio::test]
async fn missing_client_secret_fails_resolution() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("skyrelay.toml");
    fs::write(
        &path,
        r#"
[auth.oauth]
client_id = "skyrelay"
token_url = "https://auth.example.com/oauth/token"
"#,
    )
    .expect("write toml");

    let mut cfg = load_config(path.to_str()).expect("should parse config");
    let provider = SecretsProvider::with_keyring(
        &SecretsConfig {
            source: SecretSourceKind::File,
            dir: dir.path().join("no-secrets-here"),
            ..Default::default()
        },
        None,
    )
    .expect("provider");

    let err = cfg.resolve_secrets(&provider).await.expect_err("secret is missing");
    assert!(err.to_string().contains("client_secret"));
}
