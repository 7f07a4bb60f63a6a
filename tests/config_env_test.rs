//! Config environment variable tests
//!
//! These tests verify that Config::from_env() reads and applies environment
//! variable overrides, and that malformed values are reported as
//! configuration errors instead of being silently replaced by defaults.
//!
//! Tests use #[serial] to prevent race conditions with shared env vars.

use lag_rcr_engine::config::{Config, EngineConfig, LogFormat};
use lag_rcr_engine::router::Role;
use serial_test::serial;
use std::env;

/// Set `vars`, run `f`, then remove them again.
fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
    for (key, value) in vars {
        env::set_var(key, value);
    }
    let result = f();
    for (key, _) in vars {
        env::remove_var(key);
    }
    result
}

#[test]
#[serial]
fn test_config_from_env_defaults() {
    let config = Config::from_env().unwrap();
    assert_eq!(config.engine, EngineConfig::default());
    assert_eq!(config.invoker.timeout_ms, 30000);
}

#[test]
#[serial]
fn test_config_from_env_engine_overrides() {
    let config = with_env(
        &[
            ("ENGINE_MAX_DEPTH", "3"),
            ("ENGINE_LOAD_THRESHOLD", "0.55"),
            ("ENGINE_TOPK", "8"),
            ("ENGINE_MIN_SIM", "0.4"),
            ("ENGINE_BUDGET_SOLVER", "4096"),
            ("ENGINE_MAX_STEPS", "64"),
            ("ENGINE_KEYWORDS_CRITIC", "Flaw, risk"),
        ],
        Config::from_env,
    )
    .unwrap();

    let engine = &config.engine;
    assert_eq!(engine.decomposition.max_depth, 3);
    assert_eq!(engine.decomposition.load_threshold, 0.55);
    assert_eq!(engine.router.topk, 8);
    assert_eq!(engine.router.min_sim, 0.4);
    assert_eq!(engine.roles.get(Role::Solver).budget_tokens, 4096);
    assert_eq!(engine.controller.max_steps, 64);
    assert_eq!(
        engine.roles.get(Role::Critic).keywords,
        vec!["flaw".to_string(), "risk".to_string()]
    );
}

#[test]
#[serial]
fn test_config_from_env_contradiction_pairs() {
    let config = with_env(&[("ENGINE_CONTRADICTION_PAIRS", "hot:cold, Wet:Dry")], Config::from_env)
        .unwrap();
    assert_eq!(
        config.engine.decomposition.contradiction_pairs,
        vec![
            ("hot".to_string(), "cold".to_string()),
            ("wet".to_string(), "dry".to_string())
        ]
    );
}

#[test]
#[serial]
fn test_config_from_env_meta_overrides() {
    let config = with_env(
        &[("META_MIN_SAMPLES", "10"), ("META_SANDBOX_REPEATS", "3")],
        Config::from_env,
    )
    .unwrap();
    assert_eq!(config.meta.min_samples, 10);
    assert_eq!(config.meta.sandbox_repeats, 3);
}

#[test]
#[serial]
fn test_config_from_env_custom_database() {
    let config = with_env(
        &[
            ("DATABASE_PATH", "/custom/path.db"),
            ("DATABASE_MAX_CONNECTIONS", "10"),
        ],
        Config::from_env,
    )
    .unwrap();
    assert_eq!(config.database.path.to_str().unwrap(), "/custom/path.db");
    assert_eq!(config.database.max_connections, 10);
}

#[test]
#[serial]
fn test_config_from_env_json_log_format() {
    let config = with_env(&[("LOG_FORMAT", "json")], Config::from_env).unwrap();
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
#[serial]
fn test_config_from_env_invoker() {
    let config = with_env(
        &[
            ("INVOKER_BASE_URL", "http://localhost:8080"),
            ("INVOKER_TIMEOUT_MS", "5000"),
        ],
        Config::from_env,
    )
    .unwrap();
    assert_eq!(config.invoker.base_url.as_deref(), Some("http://localhost:8080"));
    assert_eq!(config.invoker.timeout_ms, 5000);
}

#[test]
#[serial]
fn test_config_from_env_artifacts_disabled() {
    let config = with_env(&[("ARTIFACTS_ENABLED", "false")], Config::from_env).unwrap();
    assert!(!config.artifacts.enabled);
}

#[test]
#[serial]
fn test_malformed_number_is_configuration_error() {
    let err = with_env(&[("ENGINE_MAX_DEPTH", "deep")], Config::from_env).unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("ENGINE_MAX_DEPTH"));
}

#[test]
#[serial]
fn test_out_of_range_value_is_configuration_error() {
    let err = with_env(&[("ENGINE_LOAD_THRESHOLD", "1.5")], Config::from_env).unwrap_err();
    assert!(err.is_configuration());

    let err = with_env(&[("META_SANDBOX_REPEATS", "0")], Config::from_env).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
#[serial]
fn test_malformed_contradiction_pair_is_rejected() {
    let err = with_env(&[("ENGINE_CONTRADICTION_PAIRS", "hot-cold")], Config::from_env)
        .unwrap_err();
    assert!(err.is_configuration());
}
