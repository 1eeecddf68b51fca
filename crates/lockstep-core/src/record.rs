//! Operation records: one logged memory access of a segment.

use lockstep_types::{AccessKind, SeqNum, Tick};

/// A memory access committed by a main or checker unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemAccess {
    pub kind: AccessKind,
    pub addr: u64,
    /// Bytes read (load) or written (store, swap).
    pub payload: Vec<u8>,
    /// Bytes present before a store or swap; empty for loads.
    pub prior: Vec<u8>,
    pub pc: u64,
    /// Micro-step within the macro-instruction; 0 for the first beat.
    pub micro_pc: u16,
    pub seq: SeqNum,
    pub store_conditional: bool,
    /// Store-conditional result word.
    pub extra: u64,
}

impl MemAccess {
    pub fn load(addr: u64, payload: Vec<u8>, pc: u64, seq: SeqNum) -> Self {
        Self {
            kind: AccessKind::Load,
            addr,
            payload,
            prior: Vec::new(),
            pc,
            micro_pc: 0,
            seq,
            store_conditional: false,
            extra: 0,
        }
    }

    pub fn store(addr: u64, payload: Vec<u8>, prior: Vec<u8>, pc: u64, seq: SeqNum) -> Self {
        Self {
            kind: AccessKind::Store,
            prior,
            ..Self::load(addr, payload, pc, seq)
        }
    }

    /// Atomic swap writing `payload` and reading back `prior`.
    pub fn swap(addr: u64, payload: Vec<u8>, prior: Vec<u8>, pc: u64, seq: SeqNum) -> Self {
        Self {
            kind: AccessKind::Swap,
            prior,
            ..Self::load(addr, payload, pc, seq)
        }
    }

    #[must_use]
    pub fn with_micro_pc(mut self, micro_pc: u16) -> Self {
        self.micro_pc = micro_pc;
        self
    }

    /// Mark a store as store-conditional with the given result word.
    #[must_use]
    pub fn conditional(mut self, result: u64) -> Self {
        self.store_conditional = true;
        self.extra = result;
        self
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A logged memory access with its owned undo bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub kind: AccessKind,
    pub addr: u64,
    pub payload: Vec<u8>,
    pub prior: Vec<u8>,
    pub pc: u64,
    /// Highest micro-step merged into this record.
    pub micro_pc: u16,
    pub seq: SeqNum,
    pub store_conditional: bool,
    pub extra: u64,
    pub appended_at: Tick,
    /// Cleared once the record has been undone.
    pub valid: bool,
}

impl OperationRecord {
    pub fn from_access(access: MemAccess, appended_at: Tick) -> Self {
        Self {
            kind: access.kind,
            addr: access.addr,
            payload: access.payload,
            prior: access.prior,
            pc: access.pc,
            micro_pc: access.micro_pc,
            seq: access.seq,
            store_conditional: access.store_conditional,
            extra: access.extra,
            appended_at,
            valid: true,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// One past the last byte covered by the record.
    pub fn end(&self) -> u64 {
        self.addr.wrapping_add(self.payload.len() as u64)
    }

    /// Whether `next` is a later beat of the same macro-instruction that
    /// continues this record's address range.
    pub fn can_absorb(&self, next: &MemAccess) -> bool {
        self.pc == next.pc
            && self.micro_pc < next.micro_pc
            && self.kind == next.kind
            && self.store_conditional == next.store_conditional
            && next.addr == self.end()
    }

    /// Merge a later micro-access into this record.
    pub fn absorb(&mut self, next: MemAccess) {
        debug_assert!(self.can_absorb(&next));
        self.payload.extend_from_slice(&next.payload);
        self.prior.extend_from_slice(&next.prior);
        self.micro_pc = next.micro_pc;
        if next.store_conditional {
            self.extra = next.extra;
        }
    }

    /// Address and bytes to write back when undoing this record.
    pub fn undo(&self) -> Option<(u64, &[u8])> {
        (self.valid && self.kind.writes_memory() && !self.prior.is_empty())
            .then_some((self.addr, self.prior.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: u64) -> SeqNum {
        SeqNum::new(n).unwrap()
    }

    #[test]
    fn test_micro_beats_merge_when_contiguous() {
        let first = MemAccess::store(0x100, vec![1, 2], vec![0, 0], 0x40, seq(1));
        let mut record = OperationRecord::from_access(first, 3);
        let second =
            MemAccess::store(0x102, vec![3, 4], vec![9, 9], 0x40, seq(1)).with_micro_pc(1);
        assert!(record.can_absorb(&second));
        record.absorb(second);
        assert_eq!(record.payload, vec![1, 2, 3, 4]);
        assert_eq!(record.prior, vec![0, 0, 9, 9]);
        assert_eq!(record.micro_pc, 1);
        assert_eq!(record.end(), 0x104);
    }

    #[test]
    fn test_gap_or_other_pc_does_not_merge() {
        let record =
            OperationRecord::from_access(MemAccess::load(0x100, vec![0; 4], 0x40, seq(1)), 0);
        let gap = MemAccess::load(0x108, vec![0; 4], 0x40, seq(1)).with_micro_pc(1);
        assert!(!record.can_absorb(&gap));
        let other_pc = MemAccess::load(0x104, vec![0; 4], 0x44, seq(2)).with_micro_pc(1);
        assert!(!record.can_absorb(&other_pc));
        let same_step = MemAccess::load(0x104, vec![0; 4], 0x40, seq(1));
        assert!(!record.can_absorb(&same_step));
        let kind_change =
            MemAccess::store(0x104, vec![0; 4], vec![0; 4], 0x40, seq(1)).with_micro_pc(1);
        assert!(!record.can_absorb(&kind_change));
    }

    #[test]
    fn test_undo_only_for_valid_writes() {
        let load = OperationRecord::from_access(MemAccess::load(0x10, vec![1], 0, seq(1)), 0);
        assert!(load.undo().is_none());
        let mut store =
            OperationRecord::from_access(MemAccess::store(0x10, vec![1], vec![7], 0, seq(2)), 0);
        assert_eq!(store.undo(), Some((0x10, &[7_u8][..])));
        store.valid = false;
        assert!(store.undo().is_none());
    }

    #[test]
    fn test_conditional_keeps_result() {
        let access = MemAccess::store(0x20, vec![1; 8], vec![0; 8], 0x80, seq(5)).conditional(1);
        let record = OperationRecord::from_access(access, 0);
        assert!(record.store_conditional);
        assert_eq!(record.extra, 1);
    }
}
