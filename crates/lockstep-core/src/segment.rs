//! Segment log: the bounded, ordered record sequence of one checkpoint.
//!
//! The main unit appends; a checker replays by sequence number. A slot is
//! touched by exactly one of the two sides at a time, except while the
//! checker runs sleep-guarded behind a still-filling log, where
//! [`SegmentLog::is_ready`] keeps it from reading the record that may still
//! grow.

use std::fmt;

use lockstep_types::{AccessKind, MismatchReason, SeqNum, Tick};

use crate::config::{LOAD_COST, LOG_HEADROOM};
use crate::record::{MemAccess, OperationRecord};

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// The access extended the previous record.
    pub merged: bool,
    /// The log reached `capacity - LOG_HEADROOM` and must be closed.
    pub full: bool,
    /// Index of the record that holds the access.
    pub index: usize,
}

/// Why an append was refused. Each variant is a broken caller contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendRejected {
    Closed,
    Full { used: usize, capacity: usize },
    Sequence { expected: SeqNum, got: SeqNum },
}

impl fmt::Display for AppendRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("append to a closed segment"),
            Self::Full { used, capacity } => {
                write!(f, "append to a full segment ({used}/{capacity} units)")
            }
            Self::Sequence { expected, got } => {
                write!(f, "sequence number {got} where {expected} was expected")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Replay requests
// ---------------------------------------------------------------------------

/// Operation a checker is trying to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOp {
    Read,
    /// Load-linked; permitted against store records.
    LoadLinked,
    Write(Vec<u8>),
    /// Cache-line zeroing store. Verified iff every written byte is zero.
    ZeroFill(Vec<u8>),
    /// Atomic swap writing the given bytes.
    Swap(Vec<u8>),
    StoreConditional(Vec<u8>),
}

impl ReplayOp {
    fn written(&self) -> Option<&[u8]> {
        match self {
            Self::Read | Self::LoadLinked => None,
            Self::Write(data)
            | Self::ZeroFill(data)
            | Self::Swap(data)
            | Self::StoreConditional(data) => Some(data),
        }
    }

    fn accepts(&self, kind: AccessKind) -> bool {
        match self {
            Self::Read => kind.is_load(),
            Self::LoadLinked => true,
            Self::Write(_) | Self::ZeroFill(_) | Self::StoreConditional(_) | Self::Swap(_) => {
                kind.writes_memory()
            }
        }
    }
}

/// A checker's memory request, matched against the record at
/// `seq - starting_seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRequest {
    pub seq: SeqNum,
    pub addr: u64,
    pub size: usize,
    /// Micro-step of the request; only micro-steps may start mid-record.
    pub micro_pc: u16,
    pub op: ReplayOp,
    /// Per-byte enable for writes; disabled bytes are not compared.
    pub byte_enable: Option<Vec<bool>>,
}

impl ReplayRequest {
    pub fn read(seq: SeqNum, addr: u64, size: usize) -> Self {
        Self {
            seq,
            addr,
            size,
            micro_pc: 0,
            op: ReplayOp::Read,
            byte_enable: None,
        }
    }

    pub fn write(seq: SeqNum, addr: u64, data: Vec<u8>) -> Self {
        Self {
            size: data.len(),
            op: ReplayOp::Write(data),
            ..Self::read(seq, addr, 0)
        }
    }

    pub fn swap(seq: SeqNum, addr: u64, data: Vec<u8>) -> Self {
        Self {
            size: data.len(),
            op: ReplayOp::Swap(data),
            ..Self::read(seq, addr, 0)
        }
    }

    #[must_use]
    pub fn with_micro_pc(mut self, micro_pc: u16) -> Self {
        self.micro_pc = micro_pc;
        self
    }

    #[must_use]
    pub fn with_byte_enable(mut self, mask: Vec<bool>) -> Self {
        self.byte_enable = Some(mask);
        self
    }
}

/// Successful replay result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayData {
    /// Logged bytes for a read, or prior bytes for a swap.
    Bytes(Vec<u8>),
    /// Write matched the log.
    Verified,
    /// Logged store-conditional result word.
    Conditional(u64),
}

/// A replay request that does not match the log.
///
/// Not an error: the checker is fed [`Mismatch::filler`] and keeps running
/// until its verdict reports the divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub reason: MismatchReason,
    pub record_index: usize,
    pub addr: u64,
    pub size: usize,
}

impl Mismatch {
    /// Deterministic data handed to the checker in place of logged bytes.
    pub fn filler(&self) -> Vec<u8> {
        vec![0; self.size]
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at record {} (addr {:#x}, size {})",
            self.reason, self.record_index, self.addr, self.size
        )
    }
}

// ---------------------------------------------------------------------------
// SegmentLog
// ---------------------------------------------------------------------------

/// Fixed-capacity replay log of one segment.
#[derive(Debug, Clone)]
pub struct SegmentLog {
    records: Vec<OperationRecord>,
    capacity: usize,
    store_cost: usize,
    used: usize,
    starting_seq: SeqNum,
    closed: bool,
    instructions: u64,
}

impl SegmentLog {
    pub fn new(capacity: usize, store_cost: usize, starting_seq: SeqNum) -> Self {
        Self {
            records: Vec::new(),
            capacity,
            store_cost,
            used: 0,
            starting_seq,
            closed: false,
            instructions: 0,
        }
    }

    /// Clear the log for a new segment starting at `starting_seq`.
    pub fn reset(&mut self, starting_seq: SeqNum) {
        self.records.clear();
        self.used = 0;
        self.starting_seq = starting_seq;
        self.closed = false;
        self.instructions = 0;
    }

    pub fn records(&self) -> &[OperationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn starting_seq(&self) -> SeqNum {
        self.starting_seq
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Committed instructions recorded at closure.
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    pub fn is_full(&self) -> bool {
        self.used >= self.capacity.saturating_sub(LOG_HEADROOM)
    }

    fn cost(&self, kind: AccessKind) -> usize {
        if kind.is_load() {
            LOAD_COST
        } else {
            self.store_cost
        }
    }

    /// Append a committed access, merging micro-steps of one instruction.
    pub fn append(&mut self, access: MemAccess, tick: Tick) -> Result<Appended, AppendRejected> {
        if self.closed {
            return Err(AppendRejected::Closed);
        }
        if let Some(last) = self.records.last_mut() {
            if last.seq == access.seq && last.can_absorb(&access) {
                let cost = if access.kind.is_load() {
                    LOAD_COST
                } else {
                    self.store_cost
                };
                last.absorb(access);
                self.used += cost;
                return Ok(Appended {
                    merged: true,
                    full: self.is_full(),
                    index: self.records.len() - 1,
                });
            }
        }
        if self.is_full() {
            return Err(AppendRejected::Full {
                used: self.used,
                capacity: self.capacity,
            });
        }
        let expected = self.expected_seq();
        if access.seq != expected {
            return Err(AppendRejected::Sequence {
                expected,
                got: access.seq,
            });
        }
        self.used += self.cost(access.kind);
        self.records
            .push(OperationRecord::from_access(access, tick));
        Ok(Appended {
            merged: false,
            full: self.is_full(),
            index: self.records.len() - 1,
        })
    }

    /// Sequence number the next new record must carry.
    pub fn expected_seq(&self) -> SeqNum {
        SeqNum::new(self.starting_seq.get() + self.records.len() as u64)
            .unwrap_or(self.starting_seq)
    }

    /// Mutable access to the most recent record, for payload injection.
    pub fn last_record_mut(&mut self) -> Option<&mut OperationRecord> {
        self.records.last_mut()
    }

    /// Close the segment after `instructions` committed instructions.
    pub fn close(&mut self, instructions: u64) {
        self.closed = true;
        self.instructions = instructions;
    }

    /// Whether the record for `seq` is complete and safe to replay.
    ///
    /// The newest record of an open segment may still absorb micro-steps,
    /// so it is not ready until another record follows it or the segment
    /// closes.
    pub fn is_ready(&self, seq: SeqNum) -> bool {
        match seq.offset_from(self.starting_seq) {
            Some(index) => self.closed || index + 1 < self.records.len(),
            None => true,
        }
    }

    /// Serve the checker request `req` from the log.
    pub fn replay(&self, req: &ReplayRequest) -> Result<ReplayData, Mismatch> {
        let mismatch = |reason, record_index| Mismatch {
            reason,
            record_index,
            addr: req.addr,
            size: req.size,
        };
        let Some(index) = req.seq.offset_from(self.starting_seq) else {
            return Err(mismatch(MismatchReason::InvalidRecord, 0));
        };
        if index >= self.capacity {
            return Err(mismatch(MismatchReason::Exhausted, index));
        }
        let Some(record) = self.records.get(index).filter(|r| r.valid) else {
            return Err(mismatch(MismatchReason::InvalidRecord, index));
        };
        serve(record, req).map_err(|reason| mismatch(reason, index))
    }

    /// Undo pairs in the order they must be applied: newest record first.
    pub fn undo_entries(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.records.iter().rev().filter_map(OperationRecord::undo)
    }

    /// Mark every record undone.
    pub fn invalidate(&mut self) {
        for record in &mut self.records {
            record.valid = false;
        }
    }
}

fn serve(record: &OperationRecord, req: &ReplayRequest) -> Result<ReplayData, MismatchReason> {
    if req.addr < record.addr {
        return Err(MismatchReason::AddressRange);
    }
    let offset = usize::try_from(req.addr - record.addr).map_err(|_| MismatchReason::AddressRange)?;
    if offset >= record.len().max(1) || (offset != 0 && req.micro_pc == 0) {
        return Err(MismatchReason::AddressRange);
    }
    let end = offset + req.size;
    if end > record.len() {
        return Err(MismatchReason::Size);
    }
    if !req.op.accepts(record.kind) {
        return Err(MismatchReason::Kind);
    }
    if let Some(written) = req.op.written() {
        if written.len() != req.size {
            return Err(MismatchReason::Size);
        }
        let logged = &record.payload[offset..end];
        let matches = match &req.op {
            ReplayOp::ZeroFill(_) => written.iter().all(|&b| b == 0),
            _ => bytes_match(logged, written, req.byte_enable.as_deref()),
        };
        if !matches {
            return Err(MismatchReason::WriteData);
        }
    }
    match &req.op {
        ReplayOp::Read | ReplayOp::LoadLinked => {
            Ok(ReplayData::Bytes(record.payload[offset..end].to_vec()))
        }
        ReplayOp::Swap(_) => record
            .prior
            .get(offset..end)
            .map(|prior| ReplayData::Bytes(prior.to_vec()))
            .ok_or(MismatchReason::Size),
        ReplayOp::StoreConditional(_) => Ok(ReplayData::Conditional(record.extra)),
        ReplayOp::Write(_) | ReplayOp::ZeroFill(_) => Ok(ReplayData::Verified),
    }
}

fn bytes_match(logged: &[u8], written: &[u8], mask: Option<&[bool]>) -> bool {
    logged
        .iter()
        .zip(written)
        .enumerate()
        .all(|(i, (a, b))| a == b || mask.is_some_and(|m| !m.get(i).copied().unwrap_or(true)))
}
