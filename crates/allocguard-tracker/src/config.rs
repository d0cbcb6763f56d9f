//! Runtime configuration.
//!
//! The tracker mode is set via the `ALLOCGUARD_MODE` environment variable:
//! - `canaries` (default): track every allocation and install guard regions.
//! - `tracking`: track every allocation, no guard regions.
//! - `off`: leave the tracker uninitialized; every call passes through.
//!
//! `ALLOCGUARD_ON_VIOLATION` picks what [`crate::TrackedAllocator`] does when
//! the tracker reports a violation: `abort` (default) or `report`.

use std::sync::OnceLock;

use serde::Serialize;

pub const MODE_ENV: &str = "ALLOCGUARD_MODE";
pub const VIOLATION_ENV: &str = "ALLOCGUARD_ON_VIOLATION";

/// How the tracker is initialized.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerMode {
    /// Tracker stays disabled.
    Off,
    /// Ledger only.
    Tracking,
    /// Ledger plus guard regions.
    #[default]
    Canaries,
}

impl TrackerMode {
    /// Parse from string (case-insensitive). Unknown values give the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" => Self::Off,
            "track" | "tracking" | "on" => Self::Tracking,
            "canary" | "canaries" | "guard" | "full" => Self::Canaries,
            _ => Self::default(),
        }
    }

    /// `Some(use_canaries)` when the tracker should be initialized.
    #[must_use]
    pub const fn init_canaries(self) -> Option<bool> {
        match self {
            Self::Off => None,
            Self::Tracking => Some(false),
            Self::Canaries => Some(true),
        }
    }

    /// Same mode with guard regions turned off; `Off` stays `Off`.
    #[must_use]
    pub const fn without_canaries(self) -> Self {
        match self {
            Self::Canaries => Self::Tracking,
            other => other,
        }
    }
}

/// What a caller does with a [`crate::TrackerError`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationPolicy {
    /// Log and abort the process.
    #[default]
    Abort,
    /// Hand the error back to the caller.
    Report,
}

impl ViolationPolicy {
    /// Parse from string (case-insensitive). Unknown values give the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" | "fatal" | "panic" => Self::Abort,
            "report" | "return" | "log" => Self::Report,
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackerConfig {
    pub mode: TrackerMode,
    pub on_violation: ViolationPolicy,
}

impl TrackerConfig {
    /// Read both variables from the environment; unset means default.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            mode: lookup(MODE_ENV)
                .map(|v| TrackerMode::from_str_loose(&v))
                .unwrap_or_default(),
            on_violation: lookup(VIOLATION_ENV)
                .map(|v| ViolationPolicy::from_str_loose(&v))
                .unwrap_or_default(),
        }
    }
}

static GLOBAL_CONFIG: OnceLock<TrackerConfig> = OnceLock::new();

/// Get the configuration (reads env vars on first call, caches thereafter).
#[must_use]
pub fn tracker_config() -> TrackerConfig {
    *GLOBAL_CONFIG.get_or_init(TrackerConfig::from_env)
}
