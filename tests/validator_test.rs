use serde_json::json;
use tempfile::TempDir;

use speedwatch::settings::SpeedTestConfig;
use speedwatch::validator::{
    load_config_file, schema_documentation, validate, validate_str, write_sample_config,
};

#[test]
fn test_empty_document_yields_defaults() {
    let (config, warnings) = validate(&json!({}));
    assert_eq!(config, SpeedTestConfig::default());
    assert!(warnings.is_empty());
}

#[test]
fn test_valid_values_are_accepted() {
    let (config, warnings) = validate(&json!({
        "max_retries": 5,
        "retry_delay": 3.5,
        "speedtest_timeout": 120,
        "show_detailed_progress": false,
        "max_typical_speed_gbps": 2.5,
        "max_reasonable_speed_gbps": 25
    }));
    assert!(warnings.is_empty(), "{:?}", warnings);
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.retry_delay, 3.5);
    assert_eq!(config.speedtest_timeout, 120.0);
    assert!(!config.show_detailed_progress);
    assert_eq!(config.max_typical_speed_gbps, 2.5);
    assert_eq!(config.max_reasonable_speed_gbps, 25.0);
}

#[test]
fn test_out_of_range_falls_back_to_default() {
    let (config, warnings) = validate(&json!({ "max_retries": 50, "retry_delay": 0.1 }));
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.retry_delay, 2.0);
    assert_eq!(warnings.len(), 2);
    assert!(warnings.iter().any(|w| w.starts_with("max_retries:") && w.contains("50")));
    assert!(warnings.iter().any(|w| w.starts_with("retry_delay:")));
}

#[test]
fn test_range_bounds_are_inclusive() {
    let (config, warnings) = validate(&json!({ "max_retries": 10, "retry_delay": 1 }));
    assert!(warnings.is_empty());
    assert_eq!(config.max_retries, 10);
    assert_eq!(config.retry_delay, 1.0);
}

#[test]
fn test_wrong_types_fall_back_to_default() {
    let (config, warnings) = validate(&json!({
        "speedtest_timeout": "sixty",
        "max_retries": 2.5,
        "save_results_to_database": "yes"
    }));
    assert_eq!(config.speedtest_timeout, 60.0);
    assert_eq!(config.max_retries, 3);
    assert!(config.save_results_to_database);
    assert_eq!(warnings.len(), 3);
}

#[test]
fn test_unknown_keys_warn_once() {
    let (config, warnings) = validate(&json!({ "zeta": 1, "alpha": true, "max_retries": 4 }));
    assert_eq!(config.max_retries, 4);
    assert_eq!(
        warnings,
        vec!["Ignoring unknown configuration keys: alpha, zeta".to_string()]
    );
}

#[test]
fn test_typical_above_reasonable_resets_both() {
    let (config, warnings) = validate(&json!({
        "max_typical_speed_gbps": 50,
        "max_reasonable_speed_gbps": 20,
        "max_typical_ping_ms": 500
    }));
    let defaults = SpeedTestConfig::default();
    assert_eq!(config.max_typical_speed_gbps, defaults.max_typical_speed_gbps);
    assert_eq!(config.max_reasonable_speed_gbps, defaults.max_reasonable_speed_gbps);
    assert_eq!(config.max_typical_ping_ms, 500.0);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("max_typical_speed_gbps"));
}

#[test]
fn test_non_object_document() {
    let (config, warnings) = validate(&json!([1, 2, 3]));
    assert_eq!(config, SpeedTestConfig::default());
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("array"));
}

#[test]
fn test_unparseable_text() {
    let (config, warnings) = validate_str("not json at all {{{");
    assert_eq!(config, SpeedTestConfig::default());
    assert_eq!(warnings.len(), 1);
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let (config, warnings) = load_config_file(&dir.path().join("nonexistent.json"));
    assert_eq!(config, SpeedTestConfig::default());
    assert!(warnings.is_empty());
}

#[test]
fn test_load_file_with_bad_value() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"max_retries": 0, "retry_delay": 5}"#).unwrap();

    let (config, warnings) = load_config_file(&path);
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.retry_delay, 5.0);
    assert_eq!(warnings.len(), 1);
}

#[test]
fn test_sample_config_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sub").join("speedtest_config.json");

    write_sample_config(&path).unwrap();
    let (config, warnings) = load_config_file(&path);
    assert!(warnings.is_empty(), "{:?}", warnings);
    assert_eq!(config, SpeedTestConfig::default());
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn test_sample_config_refuses_overwrite() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("speedtest_config.json");
    std::fs::write(&path, r#"{"max_retries": 7}"#).unwrap();

    assert!(write_sample_config(&path).is_err());
    let (config, _) = load_config_file(&path);
    assert_eq!(config.max_retries, 7);
}

#[test]
fn test_schema_lists_every_key() {
    let doc = schema_documentation();
    for key in SpeedTestConfig::default().to_document().as_object().unwrap().keys() {
        assert!(doc.contains(&format!("{}:", key)), "missing {}", key);
    }
}
