use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Type and bounds of one configuration key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleKind {
    Integer { min: i64, max: i64, default: i64 },
    Number { min: f64, max: f64, default: f64 },
    Boolean { default: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigValue {
    Integer(i64),
    Number(f64),
    Boolean(bool),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Integer(v) => write!(f, "{}", v),
            ConfigValue::Number(v) => write!(f, "{}", v),
            ConfigValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValidationRule {
    pub key: &'static str,
    pub kind: RuleKind,
    pub description: &'static str,
}

impl RuleKind {
    pub fn default_value(&self) -> ConfigValue {
        match *self {
            RuleKind::Integer { default, .. } => ConfigValue::Integer(default),
            RuleKind::Number { default, .. } => ConfigValue::Number(default),
            RuleKind::Boolean { default } => ConfigValue::Boolean(default),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::Integer { .. } => "integer",
            RuleKind::Number { .. } => "number",
            RuleKind::Boolean { .. } => "boolean",
        }
    }

    /// Human-readable accepted range, e.g. `[1, 10]`.
    pub fn range_text(&self) -> String {
        match self {
            RuleKind::Integer { min, max, .. } => format!("[{}, {}]", min, max),
            RuleKind::Number { min, max, .. } => format!("[{}, {}]", min, max),
            RuleKind::Boolean { .. } => "true or false".to_string(),
        }
    }
}

/// Every configurable key, its type, bounds and default. The validator and
/// the engine defaults are both derived from this table.
pub const VALIDATION_RULES: &[ValidationRule] = &[
    ValidationRule {
        key: "bits_to_mbps",
        kind: RuleKind::Number {
            min: 1_000.0,
            max: 1_000_000_000.0,
            default: 1_000_000.0,
        },
        description: "Conversion factor from bits per second to Mbps",
    },
    ValidationRule {
        key: "connectivity_check_timeout",
        kind: RuleKind::Number {
            min: 1.0,
            max: 60.0,
            default: 10.0,
        },
        description: "Timeout for the network connectivity check (seconds)",
    },
    ValidationRule {
        key: "speedtest_timeout",
        kind: RuleKind::Number {
            min: 10.0,
            max: 300.0,
            default: 60.0,
        },
        description: "Timeout for one speed test attempt (seconds)",
    },
    ValidationRule {
        key: "max_retries",
        kind: RuleKind::Integer {
            min: 1,
            max: 10,
            default: 3,
        },
        description: "Maximum number of attempts per test",
    },
    ValidationRule {
        key: "retry_delay",
        kind: RuleKind::Number {
            min: 1.0,
            max: 60.0,
            default: 2.0,
        },
        description: "Delay between attempts (seconds)",
    },
    ValidationRule {
        key: "retry_backoff_multiplier",
        kind: RuleKind::Number {
            min: 1.0,
            max: 4.0,
            default: 1.0,
        },
        description: "Growth factor applied to the retry delay per attempt (1 keeps it fixed)",
    },
    ValidationRule {
        key: "max_typical_speed_gbps",
        kind: RuleKind::Number {
            min: 0.1,
            max: 100.0,
            default: 1.0,
        },
        description: "Speed above which a result is flagged as unusual (Gbps)",
    },
    ValidationRule {
        key: "max_reasonable_speed_gbps",
        kind: RuleKind::Number {
            min: 1.0,
            max: 1000.0,
            default: 10.0,
        },
        description: "Speed above which a result is rejected (Gbps)",
    },
    ValidationRule {
        key: "max_typical_ping_ms",
        kind: RuleKind::Number {
            min: 10.0,
            max: 10_000.0,
            default: 1000.0,
        },
        description: "Latency above which a result is flagged as slow (ms)",
    },
    ValidationRule {
        key: "max_reasonable_ping_ms",
        kind: RuleKind::Number {
            min: 100.0,
            max: 60_000.0,
            default: 10_000.0,
        },
        description: "Latency above which a result is rejected (ms)",
    },
    ValidationRule {
        key: "show_detailed_progress",
        kind: RuleKind::Boolean { default: true },
        description: "Report fractional progress during transfers",
    },
    ValidationRule {
        key: "save_results_to_database",
        kind: RuleKind::Boolean { default: true },
        description: "Persist results to the history database",
    },
];

/// Pairs that must satisfy `typical <= reasonable`.
pub const CONSISTENCY_PAIRS: &[(&str, &str)] = &[
    ("max_typical_speed_gbps", "max_reasonable_speed_gbps"),
    ("max_typical_ping_ms", "max_reasonable_ping_ms"),
];

pub fn rule(key: &str) -> Option<&'static ValidationRule> {
    VALIDATION_RULES.iter().find(|r| r.key == key)
}

/// Validated measurement configuration. Build it with
/// [`crate::validator::validate`] or [`SpeedTestConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedTestConfig {
    pub bits_to_mbps: f64,
    pub connectivity_check_timeout: f64,
    pub speedtest_timeout: f64,
    pub max_retries: u32,
    pub retry_delay: f64,
    pub retry_backoff_multiplier: f64,
    pub max_typical_speed_gbps: f64,
    pub max_reasonable_speed_gbps: f64,
    pub max_typical_ping_ms: f64,
    pub max_reasonable_ping_ms: f64,
    pub show_detailed_progress: bool,
    pub save_results_to_database: bool,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        let mut config = SpeedTestConfig {
            bits_to_mbps: 0.0,
            connectivity_check_timeout: 0.0,
            speedtest_timeout: 0.0,
            max_retries: 0,
            retry_delay: 0.0,
            retry_backoff_multiplier: 0.0,
            max_typical_speed_gbps: 0.0,
            max_reasonable_speed_gbps: 0.0,
            max_typical_ping_ms: 0.0,
            max_reasonable_ping_ms: 0.0,
            show_detailed_progress: false,
            save_results_to_database: false,
        };
        for rule in VALIDATION_RULES {
            config.set(rule.key, rule.kind.default_value());
        }
        config
    }
}

impl SpeedTestConfig {
    /// Assign a value by key. Returns false for unknown keys or a value of the
    /// wrong kind; bounds are the validator's job.
    pub fn set(&mut self, key: &str, value: ConfigValue) -> bool {
        use ConfigValue::*;
        match (key, value) {
            ("bits_to_mbps", Number(v)) => self.bits_to_mbps = v,
            ("connectivity_check_timeout", Number(v)) => self.connectivity_check_timeout = v,
            ("speedtest_timeout", Number(v)) => self.speedtest_timeout = v,
            ("max_retries", Integer(v)) => self.max_retries = v.max(0) as u32,
            ("retry_delay", Number(v)) => self.retry_delay = v,
            ("retry_backoff_multiplier", Number(v)) => self.retry_backoff_multiplier = v,
            ("max_typical_speed_gbps", Number(v)) => self.max_typical_speed_gbps = v,
            ("max_reasonable_speed_gbps", Number(v)) => self.max_reasonable_speed_gbps = v,
            ("max_typical_ping_ms", Number(v)) => self.max_typical_ping_ms = v,
            ("max_reasonable_ping_ms", Number(v)) => self.max_reasonable_ping_ms = v,
            ("show_detailed_progress", Boolean(v)) => self.show_detailed_progress = v,
            ("save_results_to_database", Boolean(v)) => self.save_results_to_database = v,
            _ => return false,
        }
        true
    }

    pub fn get(&self, key: &str) -> Option<ConfigValue> {
        use ConfigValue::*;
        let value = match key {
            "bits_to_mbps" => Number(self.bits_to_mbps),
            "connectivity_check_timeout" => Number(self.connectivity_check_timeout),
            "speedtest_timeout" => Number(self.speedtest_timeout),
            "max_retries" => Integer(self.max_retries as i64),
            "retry_delay" => Number(self.retry_delay),
            "retry_backoff_multiplier" => Number(self.retry_backoff_multiplier),
            "max_typical_speed_gbps" => Number(self.max_typical_speed_gbps),
            "max_reasonable_speed_gbps" => Number(self.max_reasonable_speed_gbps),
            "max_typical_ping_ms" => Number(self.max_typical_ping_ms),
            "max_reasonable_ping_ms" => Number(self.max_reasonable_ping_ms),
            "show_detailed_progress" => Boolean(self.show_detailed_progress),
            "save_results_to_database" => Boolean(self.save_results_to_database),
            _ => return None,
        };
        Some(value)
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connectivity_check_timeout)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.speedtest_timeout)
    }

    /// Wait before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn retry_wait(&self, attempt: u32) -> Duration {
        let growth = self
            .retry_backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(self.retry_delay * growth)
    }

    pub fn to_document(&self) -> serde_json::Value {
        // Serializing plain numbers and bools cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
