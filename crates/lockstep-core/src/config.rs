//! Process-wide protocol configuration.
//!
//! Set once at startup and validated before any replication group is built.
//! Injection rates are plain fields checked at runtime rather than
//! compile-time switches.

use std::path::Path;

use lockstep_error::{LockstepError, Result};
use lockstep_types::RegClass;
use serde::{Deserialize, Serialize};

use crate::snapshot::RegisterRef;

/// Smallest checkpoint interval the adaptive policy may shrink to.
pub const MIN_TIMEOUT: u64 = 5;

/// Records a load costs in the log.
pub const LOAD_COST: usize = 2;

/// Headroom kept free at the end of the log; a segment is full when
/// `used >= capacity - LOG_HEADROOM`.
pub const LOG_HEADROOM: usize = 2;

/// Digest used for the recorded/replayed segment hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestKind {
    /// SHA-256 compression over packed 64-bit words, bit-compatible with
    /// existing segment logs.
    #[default]
    Sha256Compat,
    /// Standard SHA-256 over the same word stream.
    Sha256,
    /// xxh3-64 over the same word stream.
    Xxh3,
}

/// Per-category injection rates.
///
/// A rate `r` means one injection every `r` opportunities on average;
/// `1.0` fires on every opportunity and `0.0` disables the category.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionRates {
    /// Load payloads (and targeted store payloads) in the segment log.
    pub load_store: f64,
    /// A checker's starting architectural state.
    pub arch_state: f64,
    /// A checker's thread-context registers while it replays.
    pub tc_state: f64,
    /// Destination registers of selected operation classes.
    pub op_class: f64,
}

impl InjectionRates {
    /// Whether any category is enabled.
    pub fn any_enabled(&self) -> bool {
        self.load_store > 0.0 || self.arch_state > 0.0 || self.tc_state > 0.0 || self.op_class > 0.0
    }

    fn validate(&self) -> Result<()> {
        for (field, rate) in [
            ("injection.load_store", self.load_store),
            ("injection.arch_state", self.arch_state),
            ("injection.tc_state", self.tc_state),
            ("injection.op_class", self.op_class),
        ] {
            if !rate.is_finite() || rate < 0.0 {
                return Err(LockstepError::config(
                    field,
                    format!("rate must be finite and >= 0, got {rate}"),
                ));
            }
            if rate > 0.0 && rate < 1.0 {
                return Err(LockstepError::config(
                    field,
                    format!("rate is a mean interval and must be 0 or >= 1, got {rate}"),
                ));
            }
        }
        Ok(())
    }
}

/// Configuration surface of the lockstep protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Number of main units (independent replication groups).
    pub main_units: u32,
    /// Checker units per main unit.
    pub checkers_per_main: u32,
    /// Cached slots queued behind each checker.
    pub extra_slots_per_checker: u32,
    /// Log capacity in cost units (loads cost 2, stores cost `store_cost()`).
    pub log_capacity: usize,
    /// Committed instructions per segment before a timeout closure.
    pub checkpoint_timeout: u64,
    /// Additive-increase / multiplicative-decrease interval policy.
    pub adaptive_timeout: bool,
    /// Keep prior bytes for undo; stores cost one extra unit when enabled.
    pub rollback_enabled: bool,
    /// Feed and compare recorded/replayed digests.
    pub hashing: bool,
    pub digest: DigestKind,
    /// Cycles commit stays blocked after a checkpoint.
    pub commit_block_cycles: u64,
    /// Registers skipped by final-state comparison.
    pub exemptions: Vec<RegisterRef>,
    pub injection: InjectionRates,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            main_units: 1,
            checkers_per_main: 4,
            extra_slots_per_checker: 0,
            log_capacity: 384,
            checkpoint_timeout: 5000,
            adaptive_timeout: false,
            rollback_enabled: true,
            hashing: false,
            digest: DigestKind::default(),
            commit_block_cycles: 8,
            exemptions: vec![
                RegisterRef {
                    class: RegClass::Int,
                    index: 34,
                },
                RegisterRef {
                    class: RegClass::Misc,
                    index: 19,
                },
            ],
            injection: InjectionRates::default(),
        }
    }
}

impl ProtocolConfig {
    /// Decode a configuration document and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|err| LockstepError::ConfigDecode {
            detail: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and decode a configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.main_units == 0 {
            return Err(LockstepError::config("main_units", "must be at least 1"));
        }
        if self.checkers_per_main == 0 {
            return Err(LockstepError::config(
                "checkers_per_main",
                "must be at least 1",
            ));
        }
        if self.log_capacity < 8 {
            return Err(LockstepError::config(
                "log_capacity",
                format!("must be at least 8, got {}", self.log_capacity),
            ));
        }
        if self.checkpoint_timeout < MIN_TIMEOUT {
            return Err(LockstepError::config(
                "checkpoint_timeout",
                format!(
                    "must be at least {MIN_TIMEOUT}, got {}",
                    self.checkpoint_timeout
                ),
            ));
        }
        self.injection.validate()
    }

    /// Cost of a store or swap record in log units.
    pub const fn store_cost(&self) -> usize {
        if self.rollback_enabled { 3 } else { 2 }
    }

    /// Slots per checker, primary included.
    pub const fn levels(&self) -> u32 {
        self.extra_slots_per_checker + 1
    }

    /// Capacity of one slot's system-call log.
    pub fn syscall_log_capacity(&self) -> usize {
        usize::try_from(self.checkpoint_timeout / 10 + 20).unwrap_or(usize::MAX)
    }
}
