//! Per-slot log of system-call results.
//!
//! The main unit records each system call's result together with its
//! register state before and after; the checker consumes entries in order
//! instead of re-executing the call.

use crate::snapshot::{ArchSnapshot, ComparisonExemptions, compare};

/// One recorded system call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallEntry {
    pub result: u64,
    pub inst_addr: u64,
    pub before: ArchSnapshot,
    pub after: ArchSnapshot,
}

/// Outcome of a checker reading the next system-call entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallReplay {
    /// Result to hand to the checker; 0 when the entry was missing.
    pub result: u64,
    /// State to install into the checker, when its state before the call
    /// matched the main unit's.
    pub install: Option<ArchSnapshot>,
    /// The checker's call did not line up with the log.
    pub diverged: bool,
}

#[derive(Debug, Clone)]
pub struct SyscallLog {
    entries: Vec<SyscallEntry>,
    capacity: usize,
    read: usize,
}

impl SyscallLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            read: 0,
        }
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.read = 0;
    }

    /// Restart reading from the first entry, keeping the recorded ones.
    pub fn rewind(&mut self) {
        self.read = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Whether an entry is waiting for the checker.
    pub fn has_unread(&self) -> bool {
        self.read < self.entries.len()
    }

    /// Record a main-side system call; returns whether the log is now full.
    ///
    /// A write to a full log is dropped; the caller closes the segment as
    /// soon as the log reports full.
    pub fn record(&mut self, entry: SyscallEntry) -> bool {
        if !self.is_full() {
            self.entries.push(entry);
        }
        self.is_full()
    }

    /// Read the next entry for a checker issuing a call at `inst_addr`.
    pub fn read(
        &mut self,
        inst_addr: u64,
        state: &ArchSnapshot,
        exemptions: &ComparisonExemptions,
    ) -> SyscallReplay {
        let entry = self.entries.get(self.read);
        self.read += 1;
        match entry {
            Some(entry) if entry.inst_addr == inst_addr => {
                let mut before = entry.before.clone();
                before.flags.set = true;
                let install = compare(&before, state, exemptions)
                    .is_ok()
                    .then(|| entry.after.detached());
                SyscallReplay {
                    result: entry.result,
                    install,
                    diverged: false,
                }
            }
            _ => SyscallReplay {
                result: 0,
                install: None,
                diverged: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use lockstep_types::RegClass;

    use super::*;
    use crate::snapshot::RegisterLayout;

    fn entry(inst_addr: u64, result: u64) -> SyscallEntry {
        let before = ArchSnapshot::zeroed(RegisterLayout::default());
        let mut after = before.clone();
        after.set_reg(RegClass::Int, 0, result);
        SyscallEntry {
            result,
            inst_addr,
            before,
            after,
        }
    }

    #[test]
    fn test_read_in_order_installs_after_state() {
        let mut log = SyscallLog::new(4);
        assert!(!log.record(entry(0x40, 7)));
        let state = ArchSnapshot::zeroed(RegisterLayout::default());
        let replay = log.read(0x40, &state, &ComparisonExemptions::none());
        assert_eq!(replay.result, 7);
        assert!(!replay.diverged);
        let installed = replay.install.expect("state matched before snapshot");
        assert_eq!(installed.reg(RegClass::Int, 0), Some(7));
    }

    #[test]
    fn test_divergent_state_keeps_checker_state() {
        let mut log = SyscallLog::new(4);
        log.record(entry(0x40, 7));
        let mut state = ArchSnapshot::zeroed(RegisterLayout::default());
        state.set_reg(RegClass::Int, 5, 1);
        let replay = log.read(0x40, &state, &ComparisonExemptions::none());
        assert_eq!(replay.result, 7);
        assert!(replay.install.is_none());
        assert!(!replay.diverged);
    }

    #[test]
    fn test_missing_or_wrong_address_diverges() {
        let mut log = SyscallLog::new(4);
        log.record(entry(0x40, 7));
        let state = ArchSnapshot::zeroed(RegisterLayout::default());
        let wrong = log.read(0x44, &state, &ComparisonExemptions::none());
        assert!(wrong.diverged);
        assert_eq!(wrong.result, 0);
        let missing = log.read(0x40, &state, &ComparisonExemptions::none());
        assert!(missing.diverged, "second read runs past the single entry");
        log.rewind();
        assert!(!log.read(0x40, &state, &ComparisonExemptions::none()).diverged);
    }

    #[test]
    fn test_full_log() {
        let mut log = SyscallLog::new(2);
        assert!(!log.record(entry(0x40, 1)));
        assert!(log.record(entry(0x44, 2)));
        assert!(log.record(entry(0x48, 3)));
        assert_eq!(log.len(), 2);
        log.reset();
        assert!(log.is_empty());
    }
}
