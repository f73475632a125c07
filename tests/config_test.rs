use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

use kubeguard::config::{apply_env_overrides, load_config, load_from_yaml, Config};

/// Serialises the tests that read or write KUBEGUARD_* variables
static ENV_LOCK: Mutex<()> = Mutex::new(());

const ENV_VARS: [&str; 6] = [
    "KUBEGUARD_CONTEXT",
    "KUBEGUARD_MAX_CONNECTIONS",
    "KUBEGUARD_MIN_CONNECTIONS",
    "KUBEGUARD_ACQUIRE_TIMEOUT_MS",
    "KUBEGUARD_RETRY_MAX_ATTEMPTS",
    "KUBEGUARD_FAILURE_THRESHOLD",
];

fn write_config(dir: &TempDir, yaml: &str) -> PathBuf {
    let path = dir.path().join("kubeguard.yaml");
    fs::write(&path, yaml).unwrap();
    path
}

fn save_env() -> Vec<(&'static str, Option<String>)> {
    ENV_VARS.iter().map(|name| (*name, env::var(name).ok())).collect()
}

fn cleanup_env(key: &str, value: Option<String>) {
    match value {
        Some(v) => env::set_var(key, v),
        None => env::remove_var(key),
    }
}

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
context: staging
pool:
  max_connections: 6
  min_connections: 1
  max_idle_time_ms: 120000
  health_check_retries: 2
  enable_warmup: false
retry:
  max_attempts: 4
  initial_delay_ms: 250
  jitter_factor: 0.2
circuit_breaker:
  failure_threshold: 8
  reset_timeout_ms: 15000
error_monitor:
  max_history: 50
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = write_config(&temp_dir, yaml);

    let config = load_from_yaml(&config_path).unwrap();

    assert_eq!(config.context, "staging");
    assert_eq!(config.pool.max_connections, 6);
    assert_eq!(config.pool.min_connections, 1);
    assert!(!config.pool.enable_warmup);

    let pool = config.pool_config();
    assert_eq!(pool.max_idle_time, Duration::from_secs(120));
    assert_eq!(pool.health_check_retries, 2);
    // Unset fields keep their defaults
    assert_eq!(pool.acquire_timeout, Duration::from_secs(30));

    let retry = config.retry_config();
    assert_eq!(retry.max_attempts, 4);
    assert_eq!(retry.initial_delay, Duration::from_millis(250));
    assert_eq!(retry.max_delay, Duration::from_secs(30));
    assert_eq!(retry.timeout, None);

    let circuit = config.circuit_breaker_config();
    assert_eq!(circuit.failure_threshold, 8);
    assert_eq!(circuit.success_threshold, 2);
    assert_eq!(circuit.reset_timeout, Duration::from_secs(15));

    assert_eq!(config.error_monitor_config().max_history, 50);
    assert!(config.validate().is_ok());
}

/// Per-operation sections only replace the fields they name
#[test]
fn test_operation_overrides() {
    let yaml = r#"
retry:
  max_attempts: 3
circuit_breaker:
  failure_threshold: 5
operations:
  watch-events:
    retry:
      max_attempts: 10
      timeout_ms: 60000
  delete-namespace:
    circuit_breaker:
      failure_threshold: 1
      reset_timeout_ms: 300000
"#;

    let temp_dir = TempDir::new().unwrap();
    let config = load_from_yaml(write_config(&temp_dir, yaml)).unwrap();
    assert_eq!(config.operations.len(), 2);

    let defaults = config.operation_config();
    let overrides = config.operation_overrides();

    let watch = defaults.merged(&overrides["watch-events"]);
    assert_eq!(watch.retry.max_attempts, 10);
    assert_eq!(watch.retry.timeout, Some(Duration::from_secs(60)));
    assert_eq!(watch.circuit.failure_threshold, 5);

    let delete = defaults.merged(&overrides["delete-namespace"]);
    assert_eq!(delete.retry.max_attempts, 3);
    assert_eq!(delete.circuit.failure_threshold, 1);
    assert_eq!(delete.circuit.reset_timeout, Duration::from_secs(300));
}

#[test]
fn test_invalid_operation_override_rejected() {
    let yaml = r#"
operations:
  list-pods:
    retry:
      jitter_factor: 1.5
"#;

    let temp_dir = TempDir::new().unwrap();
    let config = load_from_yaml(write_config(&temp_dir, yaml)).unwrap();

    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("operations.list-pods.retry.jitter_factor"));
}

#[test]
fn test_missing_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("absent.yaml");

    let err = load_from_yaml(&missing).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_malformed_yaml_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, "pool: [not, a, mapping");

    assert!(load_from_yaml(&path).is_err());
}

/// Test environment overrides on top of a file
#[test]
fn test_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let saved = save_env();
    for name in ENV_VARS {
        env::remove_var(name);
    }

    env::set_var("KUBEGUARD_CONTEXT", "prod-us");
    env::set_var("KUBEGUARD_MAX_CONNECTIONS", "20");
    env::set_var("KUBEGUARD_ACQUIRE_TIMEOUT_MS", "750");
    env::set_var("KUBEGUARD_RETRY_MAX_ATTEMPTS", "6");

    let mut config = Config::default();
    apply_env_overrides(&mut config).unwrap();

    assert_eq!(config.context, "prod-us");
    assert_eq!(config.pool.max_connections, 20);
    assert_eq!(config.pool.min_connections, 2);
    assert_eq!(config.pool_config().acquire_timeout, Duration::from_millis(750));
    assert_eq!(config.retry.max_attempts, 6);
    assert_eq!(config.circuit_breaker.failure_threshold, 5);

    env::set_var("KUBEGUARD_FAILURE_THRESHOLD", "many");
    let err = apply_env_overrides(&mut Config::default()).unwrap_err();
    assert!(err.to_string().contains("KUBEGUARD_FAILURE_THRESHOLD"));

    for (name, value) in saved {
        cleanup_env(name, value);
    }
}

/// load_config validates after merging the file and the environment
#[test]
fn test_load_config_rejects_invalid_pool() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let saved = save_env();
    for name in ENV_VARS {
        env::remove_var(name);
    }

    let temp_dir = TempDir::new().unwrap();
    let path = write_config(
        &temp_dir,
        r#"
pool:
  max_connections: 3
  min_connections: 5
"#,
    );
    let err = load_config(path.to_str()).unwrap_err();
    assert!(format!("{:#}", err).contains("min_connections"));

    // The environment can repair what the file got wrong
    env::set_var("KUBEGUARD_MIN_CONNECTIONS", "1");
    let config = load_config(path.to_str()).unwrap();
    assert_eq!(config.pool.min_connections, 1);
    assert_eq!(config.pool.max_connections, 3);

    for (name, value) in saved {
        cleanup_env(name, value);
    }
}

#[test]
fn test_config_renders_back_to_yaml() {
    let mut config = Config::default();
    config.context = "edge".to_string();
    config.retry.timeout_ms = Some(5_000);

    let yaml = serde_yaml::to_string(&config).unwrap();
    let parsed: Config = serde_yaml::from_str(&yaml).unwrap();

    assert_eq!(parsed, config);
}
