//! Rollback of unverified segments.
//!
//! Undo data is owned by each segment (prior bytes of every logged store
//! and swap). Rolling back writes those bytes to memory through a
//! [`MemoryPort`], newest segment first and newest record first within a
//! segment, so overlapping stores unwind to the oldest prior value.

use std::collections::BTreeMap;

use lockstep_types::{MainId, Timestamp};
use tracing::debug;

use crate::segment::SegmentLog;

// ---------------------------------------------------------------------------
// MemoryPort trait
// ---------------------------------------------------------------------------

/// Write-back interface used to undo logged stores.
///
/// The embedding simulator implements this over its functional memory.
pub trait MemoryPort {
    fn write(&mut self, addr: u64, bytes: &[u8]);

    fn read(&self, addr: u64, len: usize) -> Vec<u8>;
}

/// Byte-addressed sparse memory; unwritten bytes read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseMemory {
    bytes: BTreeMap<u64, u8>,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes ever written.
    pub fn footprint(&self) -> usize {
        self.bytes.len()
    }
}

impl MemoryPort for SparseMemory {
    fn write(&mut self, addr: u64, bytes: &[u8]) {
        for (offset, &byte) in (0_u64..).zip(bytes) {
            self.bytes.insert(addr.wrapping_add(offset), byte);
        }
    }

    fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        (0_u64..len as u64)
            .map(|offset| {
                self.bytes
                    .get(&addr.wrapping_add(offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Undo batches
// ---------------------------------------------------------------------------

/// One prior-value write-back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoWrite {
    pub addr: u64,
    pub bytes: Vec<u8>,
}

/// Undo data of one segment, detached from its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoBatch {
    pub timestamp: Timestamp,
    /// Write-backs in application order (newest record first).
    pub writes: Vec<UndoWrite>,
    /// Valid records the segment held, loads included.
    pub records: u64,
    /// Committed instructions the main unit will execute again.
    pub instructions: u64,
}

impl UndoBatch {
    /// Copy the undo data out of a log.
    pub fn from_log(timestamp: Timestamp, log: &SegmentLog, instructions: u64) -> Self {
        Self {
            timestamp,
            writes: log
                .undo_entries()
                .map(|(addr, bytes)| UndoWrite {
                    addr,
                    bytes: bytes.to_vec(),
                })
                .collect(),
            records: log.records().iter().filter(|r| r.valid).count() as u64,
            instructions,
        }
    }
}

/// Cost of one completed rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub main: MainId,
    /// Timestamp of the last retired segment the main unit resumes from.
    pub restored_to: Timestamp,
    /// Undone segments, newest first.
    pub undone_segments: Vec<Timestamp>,
    /// Records discarded across every undone segment.
    pub undone_ops: u64,
    /// Prior-value writes applied to memory.
    pub writebacks: u64,
    /// Instructions that will be executed again.
    pub rerun_instructions: u64,
    /// Ticks from detection to the rollback, when a fault triggered it.
    pub detection_latency: Option<u64>,
}

/// Apply `batches` (newest first) to memory and tally the cost.
pub fn apply_undo(
    main: MainId,
    restored_to: Timestamp,
    batches: &[UndoBatch],
    memory: &mut dyn MemoryPort,
) -> RecoveryReport {
    debug_assert!(
        batches
            .windows(2)
            .all(|w| w[0].timestamp > w[1].timestamp)
    );
    let mut report = RecoveryReport {
        main,
        restored_to,
        undone_segments: Vec::with_capacity(batches.len()),
        undone_ops: 0,
        writebacks: 0,
        rerun_instructions: 0,
        detection_latency: None,
    };
    for batch in batches {
        for write in &batch.writes {
            memory.write(write.addr, &write.bytes);
        }
        debug!(
            main = main.get(),
            timestamp = batch.timestamp.get(),
            writebacks = batch.writes.len(),
            "segment undone"
        );
        report.undone_segments.push(batch.timestamp);
        report.undone_ops += batch.records;
        report.writebacks += batch.writes.len() as u64;
        report.rerun_instructions += batch.instructions;
    }
    report
}

#[cfg(test)]
mod tests {
    use lockstep_types::SeqNum;

    use super::*;
    use crate::record::MemAccess;

    fn seq(n: u64) -> SeqNum {
        SeqNum::new(n).unwrap()
    }

    #[test]
    fn test_sparse_memory_reads_zero_by_default() {
        let mut mem = SparseMemory::new();
        assert_eq!(mem.read(0x10, 3), vec![0, 0, 0]);
        mem.write(0x11, &[7]);
        assert_eq!(mem.read(0x10, 3), vec![0, 7, 0]);
        assert_eq!(mem.footprint(), 1);
    }

    #[test]
    fn test_overlapping_stores_unwind_to_oldest_prior() {
        let mut mem = SparseMemory::new();
        let mut log = SegmentLog::new(64, 3, seq(1));

        // Two stores to the same word: 0 -> 5 -> 9.
        mem.write(0x100, &[5]);
        log.append(MemAccess::store(0x100, vec![5], vec![0], 0x40, seq(1)), 1)
            .unwrap();
        mem.write(0x100, &[9]);
        log.append(MemAccess::store(0x100, vec![9], vec![5], 0x44, seq(2)), 2)
            .unwrap();
        log.append(MemAccess::load(0x200, vec![1], 0x48, seq(3)), 3)
            .unwrap();

        let batch = UndoBatch::from_log(Timestamp::new(1), &log, 12);
        assert_eq!(batch.records, 3);
        assert_eq!(batch.writes.len(), 2);
        let report = apply_undo(MainId::new(0), Timestamp::ZERO, &[batch], &mut mem);
        assert_eq!(mem.read(0x100, 1), vec![0]);
        assert_eq!(report.writebacks, 2);
        assert_eq!(report.undone_ops, 3);
        assert_eq!(report.rerun_instructions, 12);
        assert_eq!(report.undone_segments, vec![Timestamp::new(1)]);
    }

    #[test]
    fn test_newer_segment_undone_first() {
        let mut mem = SparseMemory::new();
        mem.write(0x10, &[2]);
        let older = UndoBatch {
            timestamp: Timestamp::new(1),
            writes: vec![UndoWrite {
                addr: 0x10,
                bytes: vec![0],
            }],
            records: 1,
            instructions: 3,
        };
        let newer = UndoBatch {
            timestamp: Timestamp::new(2),
            writes: vec![UndoWrite {
                addr: 0x10,
                bytes: vec![1],
            }],
            records: 1,
            instructions: 4,
        };
        let report = apply_undo(MainId::new(0), Timestamp::ZERO, &[newer, older], &mut mem);
        assert_eq!(mem.read(0x10, 1), vec![0]);
        assert_eq!(
            report.undone_segments,
            vec![Timestamp::new(2), Timestamp::new(1)]
        );
    }
}
