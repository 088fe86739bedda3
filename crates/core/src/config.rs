use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Scheduler configuration, typically parsed from TOML or the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads. 0 = available parallelism.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Name prefix for worker threads; the worker index is appended.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// How long an idle worker waits on the queue before re-checking shutdown.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// How long a worker blocked in a join waits on the queue between checks
    /// of the awaited task.
    #[serde(default = "default_join_poll_interval_ms")]
    pub join_poll_interval_ms: u64,
    /// How long `close()` waits before warning that workers are still draining.
    #[serde(default = "default_close_warn_after_ms")]
    pub close_warn_after_ms: u64,
    /// Log every task map transition at trace level.
    #[serde(default)]
    pub trace_transitions: bool,
}

fn default_worker_threads() -> usize { 0 }
fn default_thread_name() -> String { "scheduler-worker".to_string() }
fn default_poll_timeout_ms() -> u64 { 1000 }
fn default_join_poll_interval_ms() -> u64 { 10 }
fn default_close_warn_after_ms() -> u64 { 5000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            thread_name: default_thread_name(),
            poll_timeout_ms: default_poll_timeout_ms(),
            join_poll_interval_ms: default_join_poll_interval_ms(),
            close_warn_after_ms: default_close_warn_after_ms(),
            trace_transitions: false,
        }
    }
}

impl SchedulerConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `TESSERA_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("TESSERA_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            worker_threads: profiled_env_parse(p, "SCHEDULER_WORKER_THREADS", default_worker_threads()),
            thread_name: profiled_env_opt(p, "SCHEDULER_THREAD_NAME").unwrap_or_else(default_thread_name),
            poll_timeout_ms: profiled_env_parse(p, "SCHEDULER_POLL_TIMEOUT_MS", default_poll_timeout_ms()),
            join_poll_interval_ms: profiled_env_parse(
                p,
                "SCHEDULER_JOIN_POLL_INTERVAL_MS",
                default_join_poll_interval_ms(),
            ),
            close_warn_after_ms: profiled_env_parse(
                p,
                "SCHEDULER_CLOSE_WARN_AFTER_MS",
                default_close_warn_after_ms(),
            ),
            trace_transitions: profiled_env_bool(p, "SCHEDULER_TRACE_TRANSITIONS", false),
        }
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> CoreResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.poll_timeout_ms == 0 {
            return Err(CoreError::Invalid {
                key: "poll_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.join_poll_interval_ms == 0 {
            return Err(CoreError::Invalid {
                key: "join_poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.close_warn_after_ms == 0 {
            return Err(CoreError::Invalid {
                key: "close_warn_after_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.thread_name.trim().is_empty() {
            return Err(CoreError::Invalid {
                key: "thread_name",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn join_poll_interval(&self) -> Duration {
        Duration::from_millis(self.join_poll_interval_ms)
    }

    pub fn close_warn_after(&self) -> Duration {
        Duration::from_millis(self.close_warn_after_ms)
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Scheduler config loaded:");
        tracing::info!(
            "  workers:     threads={} (resolved {}), name={}",
            self.worker_threads,
            self.resolved_worker_threads(),
            self.thread_name
        );
        tracing::info!(
            "  polling:     poll_timeout={}ms, join_poll_interval={}ms",
            self.poll_timeout_ms,
            self.join_poll_interval_ms
        );
        tracing::info!("  tracing:     transitions={}", self.trace_transitions);
    }

    /// Config as JSON, for status output.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "worker_threads": self.resolved_worker_threads(),
            "thread_name": self.thread_name,
            "poll_timeout_ms": self.poll_timeout_ms,
            "join_poll_interval_ms": self.join_poll_interval_ms,
            "close_warn_after_ms": self.close_warn_after_ms,
            "trace_transitions": self.trace_transitions,
        })
    }
}
