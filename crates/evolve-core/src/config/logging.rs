use serde::{Deserialize, Serialize};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or env-filter directive. `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output JSON format.
    #[serde(default)]
    pub json_format: bool,

    /// Steps slower than this are logged at warn level.
    #[serde(default = "default_slow_step_threshold")]
    pub slow_step_threshold_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            slow_step_threshold_ms: default_slow_step_threshold(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_slow_step_threshold() -> u64 {
    5_000
}
