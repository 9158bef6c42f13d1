use itsm_bridge::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const KEY_B64: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        for (key, _) in env::vars() {
            if key.starts_with("BRIDGE_") {
                env::remove_var(key);
            }
        }
    }
}

fn set_credentials() {
    unsafe {
        env::set_var("BRIDGE_CRYPTO_KEY", KEY_B64);
        env::set_var("BRIDGE_OPERATOR_TOKEN", "test-operator-token");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    fs::write(dir.path().join(name), contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();
    set_credentials();

    let temp_dir = TempDir::new().unwrap();
    let cfg = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.crypto_key.as_ref().map(Vec::len), Some(32));
    assert_eq!(cfg.worker.max_attempts, 3);
    assert_eq!(cfg.rate_limit.requests_per_minute, 100);
    assert_eq!(cfg.rate_limit.max_consecutive_429, 3);
    assert_eq!(cfg.retention.days, 7);
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "BRIDGE_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "BRIDGE_API_BIND_ADDR=192.168.0.10:5000\nBRIDGE_WORKER_CONCURRENCY=4\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "BRIDGE_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        &format!(
            "BRIDGE_PROFILE=test\nBRIDGE_API_BIND_ADDR=127.0.0.1:4000\nBRIDGE_OPERATOR_TOKEN=layered-token\nBRIDGE_CRYPTO_KEY={KEY_B64}\n"
        ),
    );

    let cfg = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.worker.concurrency, 4);
    assert_eq!(cfg.operator_tokens, vec!["layered-token".to_string()]);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "BRIDGE_API_BIND_ADDR=127.0.0.1:3000\nBRIDGE_RETENTION_DAYS=30\n",
    );

    set_credentials();
    unsafe {
        env::set_var("BRIDGE_API_BIND_ADDR", "0.0.0.0:9090");
    }

    let cfg = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.retention.days, 30);

    clear_env();
}

#[test]
fn per_connector_rate_limit_overrides_are_collected() {
    let _guard = env_guard();
    clear_env();
    set_credentials();
    unsafe {
        env::set_var("BRIDGE_RATE_LIMIT_OVERRIDE_SERVICENOW_REQUESTS_PER_MINUTE", "500");
        env::set_var("BRIDGE_RATE_LIMIT_OVERRIDE_SERVICENOW_RETRY_AFTER_MS", "5000");
    }

    let temp_dir = TempDir::new().unwrap();
    let cfg = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect("config loads with overrides");

    let servicenow = cfg.rate_limit.settings_for("servicenow");
    assert_eq!(servicenow.requests_per_minute, 500);
    assert_eq!(servicenow.retry_after_ms, 5000);
    let freshservice = cfg.rate_limit.settings_for("freshservice");
    assert_eq!(freshservice.requests_per_minute, 100);

    clear_env();
}

#[test]
fn missing_operator_token_is_rejected() {
    let _guard = env_guard();
    clear_env();
    unsafe {
        env::set_var("BRIDGE_CRYPTO_KEY", KEY_B64);
    }

    let temp_dir = TempDir::new().unwrap();
    let err = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect_err("operator token is required");
    assert!(matches!(err, ConfigError::MissingOperatorTokens));

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();
    set_credentials();
    unsafe {
        env::set_var("BRIDGE_API_BIND_ADDR", "not-an-addr");
    }

    let temp_dir = TempDir::new().unwrap();
    let err = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect_err("invalid bind addr should fail");
    assert!(err.to_string().contains("invalid api bind address"));

    clear_env();
}
