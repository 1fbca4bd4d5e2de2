//! Retry worker configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use qcretry_core::Step;
use tracing::warn;

pub const ENV_POLL_INTERVAL_MS: &str = "QCRETRY_POLL_INTERVAL_MS";
pub const ENV_STEP_TIMEOUT_SECS: &str = "QCRETRY_STEP_TIMEOUT_SECS";
pub const ENV_EXTERNAL_STEP_TIMEOUT_SECS: &str = "QCRETRY_EXTERNAL_STEP_TIMEOUT_SECS";
pub const ENV_WORKER_NAME: &str = "QCRETRY_WORKER_NAME";
pub const ENV_OUTPUT_DIR: &str = "QCRETRY_OUTPUT_DIR";
pub const ENV_STORE_PATH: &str = "QCRETRY_STORE_PATH";

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Thread name and log field.
    pub worker_name: String,
    /// Upper bound on how long an idle worker sleeps before re-checking the queue.
    pub poll_interval: Duration,
    /// Timeout for local image steps (trim, enhancement, convert).
    pub step_timeout: Duration,
    /// Timeout for steps backed by a remote service (remove_bg, metadata).
    pub external_step_timeout: Duration,
    /// Reported in the `completed` event.
    pub output_dir: Option<PathBuf>,
    /// Location of the JSON QC store, when file-backed.
    pub store_path: Option<PathBuf>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            worker_name: "qc-retry-worker".to_string(),
            poll_interval: Duration::from_millis(100),
            step_timeout: Duration::from_secs(60),
            external_step_timeout: Duration::from_secs(120),
            output_dir: None,
            store_path: None,
        }
    }
}

impl RetryConfig {
    /// Defaults overridden by `QCRETRY_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`RetryConfig::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, ENV_POLL_INTERVAL_MS) {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_STEP_TIMEOUT_SECS) {
            config.step_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_EXTERNAL_STEP_TIMEOUT_SECS) {
            config.external_step_timeout = Duration::from_secs(secs);
        }
        if let Some(name) = lookup(ENV_WORKER_NAME).filter(|v| !v.trim().is_empty()) {
            config.worker_name = name;
        }
        config.output_dir = lookup(ENV_OUTPUT_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        config.store_path = lookup(ENV_STORE_PATH)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        config
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_external_step_timeout(mut self, timeout: Duration) -> Self {
        self.external_step_timeout = timeout;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn timeout_for(&self, step: Step) -> Duration {
        if step.is_external() {
            self.external_step_timeout
        } else {
            self.step_timeout
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}
