//! Checker slots of one replication group.
//!
//! Each checker owns a column of slots: level 0 is the segment the checker
//! itself replays, levels `1..=N` queue segments that the main unit filled
//! while the checker was busy. Occupied levels of a column are always a
//! prefix; freeing level 0 shifts the column down by one.

use lockstep_error::{LockstepError, Result};
use lockstep_types::{CheckerId, MainId, SeqNum, SlotId, Tick, Timestamp};

use crate::config::ProtocolConfig;
use crate::digest::{DigestValue, RunningDigest};
use crate::rollback::UndoBatch;
use crate::segment::{Mismatch, SegmentLog};
use crate::snapshot::ArchSnapshot;
use crate::syscall_log::SyscallLog;

/// Lifecycle of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Free,
    /// The main unit is appending. At level 0 the checker may already be
    /// replaying behind it.
    Filling,
    /// Closed in a cached slot, parked until the checker frees level 0.
    CopyPending,
    /// Closed at level 0, checker woken but not yet replaying.
    AwaitingChecker,
    /// Closed at level 0 with the checker replaying.
    Verifying,
    /// Verdict computed; leaving the slot for the retirement queue.
    Retiring,
}

impl SlotState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Filling => "filling",
            Self::CopyPending => "copy_pending",
            Self::AwaitingChecker => "awaiting_checker",
            Self::Verifying => "verifying",
            Self::Retiring => "retiring",
        }
    }
}

/// One in-flight segment and its per-slot buffers.
#[derive(Debug)]
pub struct Segment {
    pub(crate) state: SlotState,
    pub(crate) timestamp: Timestamp,
    pub(crate) log: SegmentLog,
    pub(crate) syscalls: SyscallLog,
    pub(crate) recorded: Option<RunningDigest>,
    pub(crate) replayed: Option<RunningDigest>,
    pub(crate) recorded_value: Option<DigestValue>,
    /// State the checker starts from.
    pub(crate) starting: ArchSnapshot,
    /// Main-unit state at closure, tagged `set`.
    pub(crate) expected: Option<ArchSnapshot>,
    pub(crate) has_syscall: bool,
    /// First replay mismatch seen by the checker.
    pub(crate) access_error: Option<Mismatch>,
    /// The checker's system calls diverged from the log.
    pub(crate) interrupted: bool,
    /// Pc of every committed instruction, for coverage at retirement.
    pub(crate) pcs: Vec<u64>,
    pub(crate) instructions: u64,
    /// Instruction count when the first record was appended.
    pub(crate) first_record_at: Option<u64>,
    pub(crate) last_record_at: u64,
    pub(crate) opened_at: Tick,
    pub(crate) closed_at: Option<Tick>,
    pub(crate) checker_started: Option<Tick>,
}

impl Segment {
    fn new(config: &ProtocolConfig) -> Self {
        Self {
            state: SlotState::Free,
            timestamp: Timestamp::ZERO,
            log: SegmentLog::new(config.log_capacity, config.store_cost(), SeqNum::FIRST),
            syscalls: SyscallLog::new(config.syscall_log_capacity()),
            recorded: config.hashing.then(|| RunningDigest::new(config.digest)),
            replayed: config.hashing.then(|| RunningDigest::new(config.digest)),
            recorded_value: None,
            starting: ArchSnapshot::empty(),
            expected: None,
            has_syscall: false,
            access_error: None,
            interrupted: false,
            pcs: Vec::new(),
            instructions: 0,
            first_record_at: None,
            last_record_at: 0,
            opened_at: 0,
            closed_at: None,
            checker_started: None,
        }
    }

    /// Start a new segment in this (free) slot.
    pub(crate) fn open(
        &mut self,
        timestamp: Timestamp,
        starting_seq: SeqNum,
        starting: ArchSnapshot,
        tick: Tick,
    ) {
        self.state = SlotState::Filling;
        self.timestamp = timestamp;
        self.log.reset(starting_seq);
        self.syscalls.reset();
        for digest in [self.recorded.as_mut(), self.replayed.as_mut()]
            .into_iter()
            .flatten()
        {
            digest.reset();
        }
        self.recorded_value = None;
        self.starting = starting;
        self.expected = None;
        self.has_syscall = false;
        self.access_error = None;
        self.interrupted = false;
        self.pcs.clear();
        self.instructions = 0;
        self.first_record_at = None;
        self.last_record_at = 0;
        self.opened_at = tick;
        self.closed_at = None;
        self.checker_started = None;
    }

    fn release(&mut self) {
        self.state = SlotState::Free;
        self.expected = None;
        self.access_error = None;
        self.interrupted = false;
        self.pcs.clear();
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn log(&self) -> &SegmentLog {
        &self.log
    }

    pub fn starting_snapshot(&self) -> &ArchSnapshot {
        &self.starting
    }

    pub fn expected_snapshot(&self) -> Option<&ArchSnapshot> {
        self.expected.as_ref()
    }

    pub fn has_syscall(&self) -> bool {
        self.has_syscall
    }

    /// Instructions committed into the segment so far.
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    pub fn access_error(&self) -> Option<&Mismatch> {
        self.access_error.as_ref()
    }

    pub fn is_free(&self) -> bool {
        self.state == SlotState::Free
    }

    /// Detach the undo data before the slot is reused.
    pub(crate) fn undo_batch(&self) -> UndoBatch {
        UndoBatch::from_log(self.timestamp, &self.log, self.instructions)
    }
}

// ---------------------------------------------------------------------------
// SlotPool
// ---------------------------------------------------------------------------

/// Slot columns of one main unit, indexed `[checker][level]`.
#[derive(Debug)]
pub struct SlotPool {
    main: MainId,
    columns: Vec<Vec<Segment>>,
}

impl SlotPool {
    pub fn new(main: MainId, config: &ProtocolConfig) -> Self {
        let columns = (0..config.checkers_per_main)
            .map(|_| (0..config.levels()).map(|_| Segment::new(config)).collect())
            .collect();
        Self { main, columns }
    }

    pub fn checkers(&self) -> usize {
        self.columns.len()
    }

    pub fn levels(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn get(&self, slot: SlotId) -> Option<&Segment> {
        self.columns
            .get(slot.checker.index())?
            .get(usize::try_from(slot.level).ok()?)
    }

    pub(crate) fn get_mut(&mut self, slot: SlotId) -> Result<&mut Segment> {
        let main = self.main.get();
        self.columns
            .get_mut(slot.checker.index())
            .and_then(|column| column.get_mut(usize::try_from(slot.level).ok()?))
            .ok_or_else(|| LockstepError::protocol(main, format!("slot {slot} out of range")))
    }

    /// First free slot: checkers in order, levels in order within each.
    pub fn find_free(&self) -> Option<SlotId> {
        self.columns.iter().enumerate().find_map(|(c, column)| {
            let level = column.iter().position(Segment::is_free)?;
            Some(SlotId::new(
                CheckerId::new(u32::try_from(c).ok()?),
                u32::try_from(level).ok()?,
            ))
        })
    }

    /// Occupied slots with their segments.
    pub fn occupied(&self) -> impl Iterator<Item = (SlotId, &Segment)> {
        self.columns.iter().enumerate().flat_map(|(c, column)| {
            column
                .iter()
                .enumerate()
                .filter(|(_, seg)| !seg.is_free())
                .map(move |(level, seg)| {
                    (
                        SlotId::new(CheckerId::new(c as u32), level as u32),
                        seg,
                    )
                })
        })
    }

    /// Free the checker's primary slot and shift its cached slots down.
    ///
    /// Returns whether a segment moved into level 0.
    pub(crate) fn release_primary(&mut self, checker: CheckerId) -> Result<bool> {
        let main = self.main.get();
        let column = self.columns.get_mut(checker.index()).ok_or_else(|| {
            LockstepError::protocol(main, format!("{checker} has no slot column"))
        })?;
        column[0].release();
        column.rotate_left(1);
        Ok(!column[0].is_free())
    }

    /// Free every occupied slot, returning the undo data of each segment.
    pub(crate) fn drain_all(&mut self) -> Vec<UndoBatch> {
        let mut batches = Vec::new();
        for seg in self.columns.iter_mut().flatten() {
            if !seg.is_free() {
                batches.push(seg.undo_batch());
                seg.log.invalidate();
                seg.release();
            }
        }
        batches
    }

    /// Verify that occupied levels of every column form a prefix.
    pub fn check_contiguity(&self) -> Result<()> {
        for (c, column) in self.columns.iter().enumerate() {
            for (level, pair) in column.windows(2).enumerate() {
                if pair[0].is_free() && !pair[1].is_free() {
                    return Err(LockstepError::SlotContiguity {
                        main: self.main.get(),
                        checker: c as u32,
                        level: level as u32,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RegisterLayout;

    fn pool(checkers: u32, extra: u32) -> SlotPool {
        let config = ProtocolConfig {
            checkers_per_main: checkers,
            extra_slots_per_checker: extra,
            ..ProtocolConfig::default()
        };
        SlotPool::new(MainId::new(0), &config)
    }

    fn occupy(pool: &mut SlotPool, ts: u64) -> SlotId {
        let slot = pool.find_free().expect("free slot");
        pool.get_mut(slot).unwrap().open(
            Timestamp::new(ts),
            SeqNum::FIRST,
            ArchSnapshot::zeroed(RegisterLayout::default()),
            0,
        );
        slot
    }

    #[test]
    fn test_allocation_order_primary_then_cached() {
        let mut pool = pool(2, 1);
        let order: Vec<_> = (1..=4).map(|ts| occupy(&mut pool, ts)).collect();
        assert_eq!(
            order,
            vec![
                SlotId::new(CheckerId::new(0), 0),
                SlotId::new(CheckerId::new(0), 1),
                SlotId::new(CheckerId::new(1), 0),
                SlotId::new(CheckerId::new(1), 1),
            ]
        );
        assert!(pool.find_free().is_none());
    }

    #[test]
    fn test_release_shifts_cached_down() {
        let mut pool = pool(1, 2);
        for ts in 1..=3 {
            occupy(&mut pool, ts);
        }
        assert!(pool.release_primary(CheckerId::new(0)).unwrap());
        let primary = pool.get(SlotId::primary(CheckerId::new(0))).unwrap();
        assert_eq!(primary.timestamp(), Timestamp::new(2));
        assert!(pool.get(SlotId::new(CheckerId::new(0), 2)).unwrap().is_free());
        pool.check_contiguity().unwrap();
        assert_eq!(pool.find_free(), Some(SlotId::new(CheckerId::new(0), 2)));
    }

    #[test]
    fn test_release_last_segment_leaves_column_empty() {
        let mut pool = pool(1, 1);
        occupy(&mut pool, 1);
        assert!(!pool.release_primary(CheckerId::new(0)).unwrap());
        assert_eq!(pool.occupied().count(), 0);
    }

    #[test]
    fn test_contiguity_violation_detected() {
        let mut pool = pool(1, 1);
        occupy(&mut pool, 1);
        occupy(&mut pool, 2);
        pool.columns[0][0].release();
        let err = pool.check_contiguity().unwrap_err();
        assert!(matches!(
            err,
            LockstepError::SlotContiguity { level: 0, .. }
        ));
    }

    #[test]
    fn test_drain_all_frees_everything() {
        let mut pool = pool(2, 0);
        occupy(&mut pool, 1);
        occupy(&mut pool, 2);
        let batches = pool.drain_all();
        assert_eq!(batches.len(), 2);
        assert!(pool.find_free().is_some());
        assert_eq!(pool.occupied().count(), 0);
    }
}
