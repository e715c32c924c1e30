use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{Result, SpeedwatchError};
use crate::settings::{
    rule, ConfigValue, RuleKind, SpeedTestConfig, CONSISTENCY_PAIRS, VALIDATION_RULES,
};

/// Validate a configuration document against [`VALIDATION_RULES`].
///
/// Never fails: rejected values fall back to their defaults and are reported
/// in the returned warning list.
pub fn validate(document: &Value) -> (SpeedTestConfig, Vec<String>) {
    let mut config = SpeedTestConfig::default();
    let mut warnings = Vec::new();

    let Some(map) = document.as_object() else {
        warnings.push(format!(
            "Configuration document must be an object, got {}; using defaults",
            json_type_name(document)
        ));
        return (config, warnings);
    };

    let mut unknown: Vec<&str> = map
        .keys()
        .map(String::as_str)
        .filter(|k| rule(k).is_none())
        .collect();
    unknown.sort_unstable();
    if !unknown.is_empty() {
        warnings.push(format!(
            "Ignoring unknown configuration keys: {}",
            unknown.join(", ")
        ));
    }

    for rule in VALIDATION_RULES {
        let Some(raw) = map.get(rule.key) else {
            continue;
        };
        match check_value(&rule.kind, raw) {
            Ok(value) => {
                config.set(rule.key, value);
            }
            Err(problem) => warnings.push(format!(
                "{}: {} {} (accepted {}); using default {}",
                rule.key,
                problem,
                raw,
                rule.kind.range_text(),
                rule.kind.default_value()
            )),
        }
    }

    for (typical_key, reasonable_key) in CONSISTENCY_PAIRS {
        let typical = number(&config, typical_key);
        let reasonable = number(&config, reasonable_key);
        if typical > reasonable {
            reset(&mut config, typical_key);
            reset(&mut config, reasonable_key);
            warnings.push(format!(
                "{} ({}) cannot be greater than {} ({}); both reset to defaults",
                typical_key, typical, reasonable_key, reasonable
            ));
        }
    }

    (config, warnings)
}

/// Validate a serialized document. A document that does not parse yields the
/// default configuration and a single warning.
pub fn validate_str(text: &str) -> (SpeedTestConfig, Vec<String>) {
    match serde_json::from_str::<Value>(text) {
        Ok(document) => validate(&document),
        Err(e) => (
            SpeedTestConfig::default(),
            vec![format!("Invalid configuration document ({}); using defaults", e)],
        ),
    }
}

/// Load and validate the configuration file at `path`. A missing file is not
/// a problem and yields the defaults without warnings.
pub fn load_config_file(path: &Path) -> (SpeedTestConfig, Vec<String>) {
    // One whole-file read; writers replace the file by rename, so a reader
    // sees either the old or the new document.
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let (config, warnings) = validate_str(&text);
            for w in &warnings {
                warn!("Config {:?}: {}", path, w);
            }
            (config, warnings)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (SpeedTestConfig::default(), vec![]),
        Err(e) => (
            SpeedTestConfig::default(),
            vec![format!("Could not read {}: {}; using defaults", path.display(), e)],
        ),
    }
}

/// Write the default configuration document to `path`. Refuses to replace an
/// existing file.
pub fn write_sample_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(SpeedwatchError::InvalidArgument(format!(
            "{} already exists",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&SpeedTestConfig::default().to_document())?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    info!("Wrote sample configuration to {:?}", path);
    Ok(())
}

/// Render the rule table for humans.
pub fn schema_documentation() -> String {
    let mut lines = vec!["Configuration schema".to_string(), "=".repeat(50)];
    for rule in VALIDATION_RULES {
        lines.push(String::new());
        lines.push(format!("{}:", rule.key));
        lines.push(format!("  Type: {}", rule.kind.type_name()));
        lines.push(format!("  Accepted: {}", rule.kind.range_text()));
        lines.push(format!("  Default: {}", rule.kind.default_value()));
        lines.push(format!("  Description: {}", rule.description));
    }
    lines.join("\n")
}

fn check_value(kind: &RuleKind, raw: &Value) -> std::result::Result<ConfigValue, &'static str> {
    match *kind {
        RuleKind::Integer { min, max, .. } => {
            let v = raw.as_i64().ok_or("expected an integer, got")?;
            if v < min || v > max {
                return Err("value out of range:");
            }
            Ok(ConfigValue::Integer(v))
        }
        RuleKind::Number { min, max, .. } => {
            let v = raw.as_f64().ok_or("expected a number, got")?;
            if !v.is_finite() || v < min || v > max {
                return Err("value out of range:");
            }
            Ok(ConfigValue::Number(v))
        }
        RuleKind::Boolean { .. } => raw
            .as_bool()
            .map(ConfigValue::Boolean)
            .ok_or("expected true or false, got"),
    }
}

fn number(config: &SpeedTestConfig, key: &str) -> f64 {
    match config.get(key) {
        Some(ConfigValue::Number(v)) => v,
        Some(ConfigValue::Integer(v)) => v as f64,
        _ => 0.0,
    }
}

fn reset(config: &mut SpeedTestConfig, key: &str) {
    if let Some(rule) = rule(key) {
        config.set(key, rule.kind.default_value());
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
