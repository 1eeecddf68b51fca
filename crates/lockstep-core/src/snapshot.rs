//! Architectural snapshots and final-state comparison.
//!
//! A snapshot is a plain value: the main unit's "previous" snapshot, a
//! segment's expected-final snapshot, and a checker's starting snapshot are
//! independent copies, never shared.

use std::collections::BTreeSet;
use std::fmt;

use lockstep_types::RegClass;
use serde::{Deserialize, Serialize};

/// Number of registers per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterLayout {
    pub int: usize,
    pub float: usize,
    pub vector: usize,
    pub cc: usize,
    pub misc: usize,
}

impl RegisterLayout {
    pub const fn count(&self, class: RegClass) -> usize {
        match class {
            RegClass::Int => self.int,
            RegClass::Float => self.float,
            RegClass::Vector => self.vector,
            RegClass::Cc => self.cc,
            RegClass::Misc => self.misc,
        }
    }
}

impl Default for RegisterLayout {
    fn default() -> Self {
        Self {
            int: 40,
            float: 32,
            vector: 32,
            cc: 5,
            misc: 32,
        }
    }
}

/// Program-counter state: current pc, next pc, and micro-op step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PcState {
    pub pc: u64,
    pub npc: u64,
    pub micro_pc: u16,
}

/// Lifecycle tags carried by a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFlags {
    /// The snapshot holds captured state.
    pub initialized: bool,
    /// Installed as a segment's expected-final state.
    pub set: bool,
    /// A verdict has been computed against it.
    pub checked: bool,
}

/// Value-type capture of every register class plus pc state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchSnapshot {
    regs: [Vec<u64>; 5],
    pub pc: PcState,
    pub flags: SnapshotFlags,
}

impl ArchSnapshot {
    /// Zeroed, initialized snapshot with the given layout.
    pub fn zeroed(layout: RegisterLayout) -> Self {
        Self {
            regs: RegClass::ALL.map(|class| vec![0; layout.count(class)]),
            pc: PcState::default(),
            flags: SnapshotFlags {
                initialized: true,
                ..SnapshotFlags::default()
            },
        }
    }

    /// Uninitialized placeholder.
    pub fn empty() -> Self {
        Self {
            regs: Default::default(),
            pc: PcState::default(),
            flags: SnapshotFlags::default(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.flags.initialized
    }

    pub fn regs(&self, class: RegClass) -> &[u64] {
        &self.regs[class.index()]
    }

    pub fn reg(&self, class: RegClass, index: usize) -> Option<u64> {
        self.regs[class.index()].get(index).copied()
    }

    /// Write a register, returning the previous value.
    pub fn set_reg(&mut self, class: RegClass, index: usize, value: u64) -> Option<u64> {
        self.regs[class.index()]
            .get_mut(index)
            .map(|slot| std::mem::replace(slot, value))
    }

    /// Flip one bit; returns whether the register value changed.
    pub fn flip_bit(&mut self, class: RegClass, index: usize, bit: u32) -> bool {
        match self.regs[class.index()].get_mut(index) {
            Some(slot) if bit < u64::BITS => {
                *slot ^= 1 << bit;
                true
            }
            _ => false,
        }
    }

    /// Force one bit to `value`; returns whether the register changed.
    pub fn force_bit(&mut self, class: RegClass, index: usize, bit: u32, value: bool) -> bool {
        match self.regs[class.index()].get_mut(index) {
            Some(slot) if bit < u64::BITS => {
                let before = *slot;
                if value {
                    *slot |= 1 << bit;
                } else {
                    *slot &= !(1 << bit);
                }
                before != *slot
            }
            _ => false,
        }
    }

    /// Copy of `self` with tags reset for a new owner.
    #[must_use]
    pub fn detached(&self) -> Self {
        let mut copy = self.clone();
        copy.flags = SnapshotFlags {
            initialized: self.flags.initialized,
            set: false,
            checked: false,
        };
        copy
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// One register skipped by final-state comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegisterRef {
    pub class: RegClass,
    pub index: usize,
}

/// Registers known to diverge benignly between main and checker.
///
/// The default set is the status registers that track micro-architectural
/// state (`int[34]`, `misc[19]`); callers override it through
/// `ProtocolConfig::exemptions`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComparisonExemptions {
    skipped: BTreeSet<RegisterRef>,
}

impl ComparisonExemptions {
    pub fn new(skipped: impl IntoIterator<Item = RegisterRef>) -> Self {
        Self {
            skipped: skipped.into_iter().collect(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn skips(&self, class: RegClass, index: usize) -> bool {
        self.skipped.contains(&RegisterRef { class, index })
    }

    pub fn len(&self) -> usize {
        self.skipped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// First difference found between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// Expected-final snapshot was never installed.
    NotSet,
    /// A register class has a different number of registers.
    Shape { class: RegClass },
    Register {
        class: RegClass,
        index: usize,
        expected: u64,
        actual: u64,
    },
    Pc { expected: PcState, actual: PcState },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSet => f.write_str("expected-final snapshot not set"),
            Self::Shape { class } => write!(f, "{class} register count differs"),
            Self::Register {
                class,
                index,
                expected,
                actual,
            } => write!(
                f,
                "{class}[{index}] expected {expected:#x} got {actual:#x}"
            ),
            Self::Pc { expected, actual } => write!(
                f,
                "pc expected {:#x}/{} got {:#x}/{}",
                expected.pc, expected.micro_pc, actual.pc, actual.micro_pc
            ),
        }
    }
}

/// Compare a checker's final state against a segment's expected-final state.
///
/// Tags are ignored; exempted registers are skipped.
pub fn compare(
    expected: &ArchSnapshot,
    actual: &ArchSnapshot,
    exemptions: &ComparisonExemptions,
) -> Result<(), Divergence> {
    if !expected.flags.set {
        return Err(Divergence::NotSet);
    }
    if expected.pc != actual.pc {
        return Err(Divergence::Pc {
            expected: expected.pc,
            actual: actual.pc,
        });
    }
    for class in RegClass::ALL {
        let (want, got) = (expected.regs(class), actual.regs(class));
        if want.len() != got.len() {
            return Err(Divergence::Shape { class });
        }
        if let Some((index, (&e, &a))) = want
            .iter()
            .zip(got)
            .enumerate()
            .find(|(index, (e, a))| e != a && !exemptions.skips(class, *index))
        {
            return Err(Divergence::Register {
                class,
                index,
                expected: e,
                actual: a,
            });
        }
    }
    Ok(())
}

/// Register-state collaborator of one execution unit.
pub trait ThreadState {
    fn snapshot(&self) -> ArchSnapshot;
    fn restore(&mut self, snapshot: &ArchSnapshot);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected_from(actual: &ArchSnapshot) -> ArchSnapshot {
        let mut expected = actual.clone();
        expected.flags.set = true;
        expected
    }

    #[test]
    fn test_equal_snapshots_compare_clean() {
        let mut s = ArchSnapshot::zeroed(RegisterLayout::default());
        s.set_reg(RegClass::Int, 3, 0xdead);
        s.pc.pc = 0x400;
        compare(&expected_from(&s), &s, &ComparisonExemptions::none()).unwrap();
    }

    #[test]
    fn test_unset_expected_is_divergent() {
        let s = ArchSnapshot::zeroed(RegisterLayout::default());
        assert_eq!(
            compare(&s, &s, &ComparisonExemptions::none()),
            Err(Divergence::NotSet)
        );
    }

    #[test]
    fn test_register_difference_reported() {
        let s = ArchSnapshot::zeroed(RegisterLayout::default());
        let expected = expected_from(&s);
        let mut actual = s.clone();
        assert!(actual.flip_bit(RegClass::Float, 7, 12));
        let err = compare(&expected, &actual, &ComparisonExemptions::none()).unwrap_err();
        assert_eq!(
            err,
            Divergence::Register {
                class: RegClass::Float,
                index: 7,
                expected: 0,
                actual: 1 << 12,
            }
        );
        assert_eq!(err.to_string(), "float[7] expected 0x0 got 0x1000");
    }

    #[test]
    fn test_exempted_register_skipped() {
        let s = ArchSnapshot::zeroed(RegisterLayout::default());
        let expected = expected_from(&s);
        let mut actual = s.clone();
        actual.set_reg(RegClass::Misc, 19, 5);
        let exemptions = ComparisonExemptions::new([RegisterRef {
            class: RegClass::Misc,
            index: 19,
        }]);
        compare(&expected, &actual, &exemptions).unwrap();
        assert!(compare(&expected, &actual, &ComparisonExemptions::none()).is_err());
    }

    #[test]
    fn test_pc_difference_reported() {
        let s = ArchSnapshot::zeroed(RegisterLayout::default());
        let expected = expected_from(&s);
        let mut actual = s.clone();
        actual.pc.micro_pc = 2;
        assert!(matches!(
            compare(&expected, &actual, &ComparisonExemptions::none()),
            Err(Divergence::Pc { .. })
        ));
    }

    #[test]
    fn test_force_bit_reports_change() {
        let mut s = ArchSnapshot::zeroed(RegisterLayout::default());
        assert!(!s.force_bit(RegClass::Cc, 0, 3, false));
        assert!(s.force_bit(RegClass::Cc, 0, 3, true));
        assert!(!s.force_bit(RegClass::Cc, 0, 3, true));
        assert_eq!(s.reg(RegClass::Cc, 0), Some(8));
        assert!(!s.flip_bit(RegClass::Cc, 99, 0));
        assert!(!s.flip_bit(RegClass::Cc, 0, 64));
    }

    #[test]
    fn test_detached_clears_tags() {
        let mut s = ArchSnapshot::zeroed(RegisterLayout::default());
        s.flags.set = true;
        s.flags.checked = true;
        let copy = s.detached();
        assert!(copy.flags.initialized);
        assert!(!copy.flags.set);
        assert!(!copy.flags.checked);
        assert!(!ArchSnapshot::empty().is_initialized());
    }
}
