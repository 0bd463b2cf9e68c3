//! Engine configuration with environment overrides.
//!
//! Parsing is lenient: an unparseable value falls back to the default
//! rather than aborting startup, and truthiness accepts the usual
//! "0"/"false"/"no" spellings.

use std::env;
use std::time::Duration;

use crate::guard::SizeGuard;
use crate::policy::MergePolicy;

pub const DEFAULT_MAX_CHANGED_LINES: usize = 5000;
pub const DEFAULT_MAX_NEW_FILES: usize = 50;
pub const DEFAULT_ADAPTER_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_BRANCH_PREFIX: &str = "autogen/feature";

/// Tunables for the engine. Use `EngineConfig::default()` in tests and
/// `EngineConfig::from_env()` in deployments.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_changed_lines: usize,
    pub max_new_files: usize,
    pub guards_enabled: bool,
    pub merge_policy: MergePolicy,
    pub adapter_timeout: Duration,
    pub branch_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_changed_lines: DEFAULT_MAX_CHANGED_LINES,
            max_new_files: DEFAULT_MAX_NEW_FILES,
            guards_enabled: true,
            merge_policy: MergePolicy::Manual,
            adapter_timeout: Duration::from_secs(DEFAULT_ADAPTER_TIMEOUT_SECS),
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
        }
    }
}

impl EngineConfig {
    /// Read configuration from the process environment, falling back to
    /// defaults for anything missing or malformed.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_changed_lines: env_usize("MAX_CHANGED_LINES", defaults.max_changed_lines),
            max_new_files: env_usize("MAX_NEW_FILES", defaults.max_new_files),
            guards_enabled: env_bool("SIZE_GUARDS_ENABLED", defaults.guards_enabled),
            merge_policy: env::var("MERGE_POLICY")
                .ok()
                .and_then(|v| v.trim().to_lowercase().parse().ok())
                .unwrap_or(defaults.merge_policy),
            adapter_timeout: Duration::from_secs(env_u64(
                "ADAPTER_TIMEOUT_SECS",
                DEFAULT_ADAPTER_TIMEOUT_SECS,
            )),
            branch_prefix: env::var("BRANCH_PREFIX").unwrap_or(defaults.branch_prefix),
        }
    }

    /// The size guard derived from this configuration.
    pub fn size_guard(&self) -> SizeGuard {
        SizeGuard {
            max_changed_lines: self.max_changed_lines,
            max_new_files: self.max_new_files,
            enabled: self.guards_enabled,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => !matches!(
            v.trim().to_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        ),
        Err(_) => default,
    }
}
