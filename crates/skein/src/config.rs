// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! The only knob is the leak policy: what happens when a primitive is
//! destroyed before its handshake completed, or a continuation is resumed
//! twice. It is read from `SKEIN_LEAK_POLICY` on first use unless a
//! [`Config`] was installed before that.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

/// Environment variable consulted by [`Config::from_env`].
pub const LEAK_POLICY_ENV: &str = "SKEIN_LEAK_POLICY";

/// Reaction to a contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakPolicy {
    /// Log, then panic (unless the thread is already panicking).
    Assert,
    /// Log, then abort the process.
    Abort,
    /// Log and continue.
    Warn,
}

impl LeakPolicy {
    fn to_bits(self) -> u8 {
        match self {
            LeakPolicy::Assert => 1,
            LeakPolicy::Abort => 2,
            LeakPolicy::Warn => 3,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(LeakPolicy::Assert),
            2 => Some(LeakPolicy::Abort),
            3 => Some(LeakPolicy::Warn),
            _ => None,
        }
    }
}

impl Default for LeakPolicy {
    /// `Assert` in debug builds, `Abort` in release builds.
    fn default() -> Self {
        if cfg!(debug_assertions) {
            LeakPolicy::Assert
        } else {
            LeakPolicy::Abort
        }
    }
}

impl FromStr for LeakPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "assert" => Ok(LeakPolicy::Assert),
            "abort" => Ok(LeakPolicy::Abort),
            "warn" => Ok(LeakPolicy::Warn),
            _ => Err(ConfigError::UnknownLeakPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for LeakPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeakPolicy::Assert => "assert",
            LeakPolicy::Abort => "abort",
            LeakPolicy::Warn => "warn",
        };
        f.write_str(name)
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown leak policy `{0}` (expected one of: assert, abort, warn)")]
    UnknownLeakPolicy(String),
}

/// Process-wide runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Config {
    pub leak_policy: LeakPolicy,
}

impl Config {
    /// Read configuration from the environment. Unset variables keep defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Ok(raw) = std::env::var(LEAK_POLICY_ENV) {
            config.leak_policy = raw.parse()?;
        }
        Ok(config)
    }

    /// Make this configuration the active one for the whole process.
    pub fn install(self) {
        LEAK_POLICY.store(self.leak_policy.to_bits(), Ordering::Release);
        tracing::debug!(leak_policy = %self.leak_policy, "skein config installed");
    }
}

/// 0 = not yet resolved.
static LEAK_POLICY: AtomicU8 = AtomicU8::new(0);

/// The active leak policy, resolving it from the environment on first use.
pub fn leak_policy() -> LeakPolicy {
    if let Some(policy) = LeakPolicy::from_bits(LEAK_POLICY.load(Ordering::Acquire)) {
        return policy;
    }

    let resolved = match Config::from_env() {
        Ok(config) => config.leak_policy,
        Err(err) => {
            tracing::warn!(%err, "ignoring {}", LEAK_POLICY_ENV);
            LeakPolicy::default()
        }
    };

    // A concurrent install() wins over the lazily resolved value.
    match LEAK_POLICY.compare_exchange(0, resolved.to_bits(), Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => resolved,
        Err(bits) => LeakPolicy::from_bits(bits).unwrap_or(resolved),
    }
}

/// Shorthand for installing a config that only changes the leak policy.
pub fn set_leak_policy(policy: LeakPolicy) {
    Config { leak_policy: policy }.install();
}
