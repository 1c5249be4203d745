use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Migration engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Root directory of step manifests (`<dir>/<schema>/<step>.toml`).
    #[serde(default = "default_dir")]
    pub dir: String,

    /// Which store the steps are applied to.
    #[serde(default)]
    pub backend: BackendKind,

    /// Abort the whole batch after this many seconds.
    #[serde(default)]
    pub batch_timeout_secs: Option<u64>,

    /// Give up waiting for the schema-modification lock after this many seconds.
    #[serde(default)]
    pub lock_timeout_secs: Option<u64>,

    /// Truncate over-long strings when AlterField shrinks `max_length`
    /// instead of rejecting the alteration.
    #[serde(default)]
    pub truncate_on_shrink: bool,
}

impl MigrationsConfig {
    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_secs.map(Duration::from_secs)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            backend: BackendKind::default(),
            batch_timeout_secs: None,
            lock_timeout_secs: None,
            truncate_on_shrink: false,
        }
    }
}

fn default_dir() -> String {
    "migrations".to_string()
}

/// Available schema backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Postgres,
    Memory,
}
