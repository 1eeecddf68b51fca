//! Permanent (stuck-at) fault specifications.
//!
//! A stuck-at fault forces one bit of one structure to a fixed value every
//! time the structure is written. Specs are immutable once built:
//!
//! ```ignore
//! let spec = StuckAtSpec::fu_dest(OpClass::IntAlu.id())
//!     .bit(3)
//!     .stuck_at(true)
//!     .mains(0b1)
//!     .build();
//! ```

use std::fmt;

use lockstep_core::{ArchSnapshot, RegisterRef};
use lockstep_error::{LockstepError, Result};
use lockstep_types::{MainId, RegClass, Timestamp};

/// Segments a functional-unit fault stays dormant for by default.
pub const FU_DEST_DORMANT_SEGMENTS: u64 = 10;

// ---------------------------------------------------------------------------
// StuckStructure
// ---------------------------------------------------------------------------

/// Hardware structure carrying the stuck bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StuckStructure {
    /// Destination register written by a functional unit of one operation
    /// class, on the checkers of the affected main units.
    FuDest { op_class: u32 },
    /// Payload of every log entry the affected main units append.
    LogEntry,
    /// One register of the affected checkers' register files.
    RegisterFile { class: RegClass, index: usize },
}

impl StuckStructure {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FuDest { .. } => "fu_dest",
            Self::LogEntry => "log_entry",
            Self::RegisterFile { .. } => "register_file",
        }
    }
}

// ---------------------------------------------------------------------------
// StuckAtSpec
// ---------------------------------------------------------------------------

/// A configured stuck-at fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckAtSpec {
    pub structure: StuckStructure,
    pub bit: u32,
    /// Stuck at one (`true`) or zero.
    pub stuck_high: bool,
    /// Bit `m` set: main unit `m` (and its checkers) is affected.
    pub main_mask: u64,
    /// Segments with a timestamp up to this value are left alone.
    pub after_segments: u64,
}

impl StuckAtSpec {
    /// Fault in the destination of operation class `op_class`.
    pub fn fu_dest(op_class: u32) -> StuckAtSpecBuilder {
        StuckAtSpecBuilder::new(StuckStructure::FuDest { op_class })
            .after_segments(FU_DEST_DORMANT_SEGMENTS)
    }

    /// Fault in every appended log entry.
    pub fn log_entry() -> StuckAtSpecBuilder {
        StuckAtSpecBuilder::new(StuckStructure::LogEntry)
    }

    /// Fault in one checker register.
    pub fn register_file(class: RegClass, index: usize) -> StuckAtSpecBuilder {
        StuckAtSpecBuilder::new(StuckStructure::RegisterFile { class, index })
    }

    /// Parse `structure,<arg>,<bit>,<0|1>,<main mask>`.
    ///
    /// `<arg>` is the operation-class id for `fu_dest`, `class:index` for
    /// `register_file`, and ignored (conventionally `-`) for `log_entry`.
    /// The mask accepts decimal or `0x` hex.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |detail: String| LockstepError::config("stuck_at", detail);
        let fields: Vec<&str> = text.split(',').map(str::trim).collect();
        let [structure, arg, bit, level, mask] = fields.as_slice() else {
            return Err(invalid(format!(
                "expected 5 comma-separated fields, got {} in '{text}'",
                fields.len()
            )));
        };
        let builder = match *structure {
            "fu_dest" => Self::fu_dest(
                arg.parse()
                    .map_err(|_| invalid(format!("bad operation class '{arg}'")))?,
            ),
            "log_entry" => Self::log_entry(),
            "register_file" => {
                let (class, index) = arg
                    .split_once(':')
                    .ok_or_else(|| invalid(format!("register must be class:index, got '{arg}'")))?;
                let class = parse_reg_class(class)
                    .ok_or_else(|| invalid(format!("unknown register class '{class}'")))?;
                let index = index
                    .parse()
                    .map_err(|_| invalid(format!("bad register index '{index}'")))?;
                Self::register_file(class, index)
            }
            other => return Err(invalid(format!("unknown structure '{other}'"))),
        };
        let bit: u32 = bit
            .parse()
            .map_err(|_| invalid(format!("bad bit index '{bit}'")))?;
        if bit >= u64::BITS {
            return Err(invalid(format!("bit index {bit} out of range")));
        }
        let stuck_high = match *level {
            "0" => false,
            "1" => true,
            other => return Err(invalid(format!("stuck level must be 0 or 1, got '{other}'"))),
        };
        let mask = parse_mask(mask).ok_or_else(|| invalid(format!("bad main mask '{mask}'")))?;
        Ok(builder.bit(bit).stuck_at(stuck_high).mains(mask).build())
    }

    /// Whether the fault is active for segment `timestamp` of `main`.
    pub fn applies_to(&self, main: MainId, timestamp: Timestamp) -> bool {
        let selected = main.get() < u64::BITS && self.main_mask & (1 << main.get()) != 0;
        selected && timestamp.get() > self.after_segments
    }

    /// Force the stuck bit in `value`; returns the new value and whether it
    /// changed.
    pub fn force(&self, value: u64) -> (u64, bool) {
        let forced = if self.stuck_high {
            value | (1 << self.bit)
        } else {
            value & !(1 << self.bit)
        };
        (forced, forced != value)
    }

    /// Force the stuck bit in `reg`; `None` when the register does not exist.
    pub fn force_register(&self, state: &mut ArchSnapshot, reg: RegisterRef) -> Option<bool> {
        state.reg(reg.class, reg.index)?;
        Some(state.force_bit(reg.class, reg.index, self.bit, self.stuck_high))
    }

    /// Force the stuck bit of a payload, indexing bits across the bytes.
    pub fn force_payload(&self, payload: &mut [u8]) -> bool {
        if payload.is_empty() {
            return false;
        }
        let bit = self.bit as usize % (payload.len() * 8);
        let (byte, mask) = (bit / 8, 1_u8 << (bit % 8));
        let before = payload[byte];
        if self.stuck_high {
            payload[byte] |= mask;
        } else {
            payload[byte] &= !mask;
        }
        payload[byte] != before
    }

    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StuckAtSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arg = match self.structure {
            StuckStructure::FuDest { op_class } => op_class.to_string(),
            StuckStructure::LogEntry => "-".to_owned(),
            StuckStructure::RegisterFile { class, index } => format!("{class}:{index}"),
        };
        write!(
            f,
            "{},{arg},{},{},{:#x}",
            self.structure.as_str(),
            self.bit,
            u8::from(self.stuck_high),
            self.main_mask
        )
    }
}

fn parse_reg_class(name: &str) -> Option<RegClass> {
    RegClass::ALL.into_iter().find(|class| class.as_str() == name)
}

fn parse_mask(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

// ---------------------------------------------------------------------------
// StuckAtSpecBuilder
// ---------------------------------------------------------------------------

/// Builder for [`StuckAtSpec`].
#[derive(Debug, Clone)]
pub struct StuckAtSpecBuilder {
    spec: StuckAtSpec,
}

impl StuckAtSpecBuilder {
    fn new(structure: StuckStructure) -> Self {
        Self {
            spec: StuckAtSpec {
                structure,
                bit: 0,
                stuck_high: true,
                main_mask: 1,
                after_segments: 0,
            },
        }
    }

    #[must_use]
    pub fn bit(mut self, bit: u32) -> Self {
        self.spec.bit = bit.min(u64::BITS - 1);
        self
    }

    #[must_use]
    pub fn stuck_at(mut self, high: bool) -> Self {
        self.spec.stuck_high = high;
        self
    }

    #[must_use]
    pub fn mains(mut self, mask: u64) -> Self {
        self.spec.main_mask = mask;
        self
    }

    #[must_use]
    pub fn after_segments(mut self, segments: u64) -> Self {
        self.spec.after_segments = segments;
        self
    }

    pub fn build(self) -> StuckAtSpec {
        self.spec
    }
}
