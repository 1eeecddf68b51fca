//! Slot allocation and scheduling state machine of one replication group.
//!
//! A [`ReplicationGroup`] is the sole authority over its main unit and
//! checkers: it decides when a segment closes, which slot the next segment
//! fills, when a checker runs, and in which order verified segments
//! retire. Activation changes leave the group only as [`Command`]s.
//!
//! Retirement is strictly in timestamp order. A checker that finishes a
//! segment out of order hands it to the pending-retirement map, frees its
//! slot, and moves on; the retire pass drains the map greedily from
//! `committed + 1`.

use std::collections::BTreeMap;

use lockstep_error::{LockstepError, Result};
use lockstep_observability::{ProtocolEvent, ProtocolObserver};
use lockstep_types::{
    AccessKind, CheckerId, CloseTrigger, FaultCause, MainId, SeqNum, SlotId, Tick, Timestamp,
    UnitId,
};
use tracing::{debug, info, warn};

use crate::aimd::TimeoutPolicy;
use crate::command::{Command, CommandQueue};
use crate::config::ProtocolConfig;
use crate::coverage::CoverageMap;
use crate::histogram::{
    CHECKER_CYCLES_RANGE, CHECKPOINT_TICKS_RANGE, IntervalHistogram, LatencyHistogram,
    REPLAY_DELAY_RANGE,
};
use crate::metrics::{DetectionStage, LockstepMetrics, StallReason};
use crate::record::{MemAccess, OperationRecord};
use crate::rollback::{MemoryPort, RecoveryReport, UndoBatch, apply_undo};
use crate::segment::{Mismatch, ReplayData, ReplayRequest};
use crate::slot::{SlotPool, SlotState};
use crate::snapshot::{ArchSnapshot, ComparisonExemptions, Divergence, ThreadState, compare};
use crate::syscall_log::{SyscallEntry, SyscallReplay};

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// One instruction (or micro-op beat) committed by the main unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub pc: u64,
    /// Static instruction name, for coverage reports.
    pub inst: &'static str,
    /// The last micro-op of the instruction; segments only close here.
    pub completes_instruction: bool,
    pub access: Option<MemAccess>,
    pub syscall: Option<SyscallEntry>,
}

impl CommitEvent {
    /// A committed instruction without memory or system-call effects.
    pub fn plain(pc: u64, inst: &'static str) -> Self {
        Self {
            pc,
            inst,
            completes_instruction: true,
            access: None,
            syscall: None,
        }
    }

    pub fn memory(access: MemAccess, inst: &'static str) -> Self {
        Self {
            pc: access.pc,
            access: Some(access),
            ..Self::plain(0, inst)
        }
    }

    pub fn syscall(entry: SyscallEntry, inst: &'static str) -> Self {
        Self {
            pc: entry.inst_addr,
            syscall: Some(entry),
            ..Self::plain(0, inst)
        }
    }

    /// Mark the event as a non-final beat of a split instruction.
    #[must_use]
    pub fn partial(mut self) -> Self {
        self.completes_instruction = false;
        self
    }
}

/// What happened to a main-unit commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Recorded in the open segment; `full` once the log hit its headroom.
    Recorded { full: bool },
    /// The commit closed the open segment.
    Closed(CloseTrigger),
    /// The main unit is erroneous and must drain and roll back.
    RollbackRequired,
}

/// Pipeline state passed to [`ReplicationGroup::should_block_commit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineHint {
    pub should_wait: bool,
    pub can_commit: bool,
}

/// Answer to a checker's memory request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Data(ReplayData),
    /// The request did not match; `filler` stands in for the logged bytes.
    Mismatched { mismatch: Mismatch, filler: Vec<u8> },
    /// The record is not complete yet; the checker is suspended until the
    /// main unit appends again or closes the segment.
    SleepGuarded,
}

/// Verdict of one verified segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub main: MainId,
    pub checker: CheckerId,
    pub timestamp: Timestamp,
    pub cause: Option<FaultCause>,
    /// First register difference, when the final states differ.
    pub divergence: Option<Divergence>,
}

impl Verdict {
    pub fn is_clean(&self) -> bool {
        self.cause.is_none()
    }
}

/// Execution phase of a checker unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckerPhase {
    Idle,
    Active,
    /// Suspended behind a record the main unit may still extend.
    SleepGuarded,
}

/// Read-only view of a checker and its primary slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerView {
    pub phase: CheckerPhase,
    pub slot_state: SlotState,
    pub timestamp: Option<Timestamp>,
    pub starting_seq: Option<SeqNum>,
    /// Instructions the checker must execute; known once the segment closes.
    pub instructions: Option<u64>,
    /// Instructions the main unit has committed into the segment so far.
    pub committed: u64,
}

/// Read-only view of the main unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainView {
    pub started: bool,
    /// Timestamp of the newest allocated segment.
    pub timestamp: Timestamp,
    /// Timestamp of the newest retired segment.
    pub committed: Timestamp,
    pub open_slot: Option<SlotId>,
    pub asleep: bool,
    pub erroneous: bool,
    pub blocked_until: Tick,
    pub timeout: u64,
    pub pending_retirements: usize,
}

/// Histograms collected by one replication group.
#[derive(Debug, Clone)]
pub struct GroupHistograms {
    /// Ticks from append to replay of a record.
    pub replay_delay: LatencyHistogram,
    /// Ticks from allocation to closure of a segment.
    pub checkpoint_ticks: LatencyHistogram,
    /// Ticks a checker spent on one segment.
    pub checker_cycles: LatencyHistogram,
    /// Adaptive timeout in force at each closure.
    pub aimd: IntervalHistogram,
    /// Instructions per closed segment.
    pub cpt_length: IntervalHistogram,
    pub first_record: IntervalHistogram,
    pub last_record: IntervalHistogram,
}

impl GroupHistograms {
    fn new(timeout: u64) -> Self {
        Self {
            replay_delay: LatencyHistogram::new(REPLAY_DELAY_RANGE),
            checkpoint_ticks: LatencyHistogram::new(CHECKPOINT_TICKS_RANGE),
            checker_cycles: LatencyHistogram::new(CHECKER_CYCLES_RANGE),
            aimd: IntervalHistogram::new(timeout),
            cpt_length: IntervalHistogram::new(timeout),
            first_record: IntervalHistogram::new(timeout),
            last_record: IntervalHistogram::new(timeout),
        }
    }
}

/// Process-wide collaborators borrowed for one scheduler call.
pub struct Shared<'a> {
    pub config: &'a ProtocolConfig,
    pub exemptions: &'a ComparisonExemptions,
    pub metrics: &'a LockstepMetrics,
    pub observer: &'a dyn ProtocolObserver,
    pub commands: &'a mut CommandQueue,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MainState {
    started: bool,
    timestamp: Timestamp,
    committed: Timestamp,
    current: Option<SlotId>,
    asleep: bool,
    /// Tick at which the main unit was marked erroneous.
    erroneous: Option<Tick>,
    squash_sent: bool,
    blocked_until: Tick,
    /// State at the most recent closure; the next segment starts here.
    previous: ArchSnapshot,
    /// State at the newest retired segment; rollback restores it.
    committed_snapshot: ArchSnapshot,
    last_seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct CheckerUnit {
    phase: CheckerPhase,
}

/// A verified segment waiting for its turn to retire.
#[derive(Debug)]
struct CompletedSegment {
    cause: Option<FaultCause>,
    has_syscall: bool,
    undo: UndoBatch,
    pcs: Vec<u64>,
    expected: ArchSnapshot,
    closed_at: Tick,
    buffered: bool,
}

// ---------------------------------------------------------------------------
// ReplicationGroup
// ---------------------------------------------------------------------------

/// One main unit, its checkers, and their slot pool.
#[derive(Debug)]
pub struct ReplicationGroup {
    id: MainId,
    pool: SlotPool,
    checkers: Vec<CheckerUnit>,
    main: MainState,
    pending: BTreeMap<Timestamp, CompletedSegment>,
    policy: TimeoutPolicy,
    coverage: CoverageMap,
    histograms: GroupHistograms,
}

impl ReplicationGroup {
    pub fn new(id: MainId, config: &ProtocolConfig) -> Self {
        Self {
            id,
            pool: SlotPool::new(id, config),
            checkers: vec![
                CheckerUnit {
                    phase: CheckerPhase::Idle
                };
                config.checkers_per_main as usize
            ],
            main: MainState {
                started: false,
                timestamp: Timestamp::ZERO,
                committed: Timestamp::ZERO,
                current: None,
                asleep: false,
                erroneous: None,
                squash_sent: false,
                blocked_until: 0,
                previous: ArchSnapshot::empty(),
                committed_snapshot: ArchSnapshot::empty(),
                last_seq: 0,
            },
            pending: BTreeMap::new(),
            policy: TimeoutPolicy::new(config.checkpoint_timeout, config.adaptive_timeout),
            coverage: CoverageMap::new(),
            histograms: GroupHistograms::new(config.checkpoint_timeout),
        }
    }

    pub fn id(&self) -> MainId {
        self.id
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    pub fn coverage(&self) -> &CoverageMap {
        &self.coverage
    }

    pub fn histograms(&self) -> &GroupHistograms {
        &self.histograms
    }

    pub fn timeout(&self) -> u64 {
        self.policy.current()
    }

    /// Snapshot of the newest retired segment.
    pub fn committed_snapshot(&self) -> &ArchSnapshot {
        &self.main.committed_snapshot
    }

    pub fn main_view(&self) -> MainView {
        MainView {
            started: self.main.started,
            timestamp: self.main.timestamp,
            committed: self.main.committed,
            open_slot: self.main.current,
            asleep: self.main.asleep,
            erroneous: self.main.erroneous.is_some(),
            blocked_until: self.main.blocked_until,
            timeout: self.policy.current(),
            pending_retirements: self.pending.len(),
        }
    }

    pub fn checker_view(&self, checker: CheckerId) -> Option<CheckerView> {
        let unit = self.checkers.get(checker.index())?;
        let seg = self.pool.get(SlotId::primary(checker))?;
        let occupied = !seg.is_free();
        Some(CheckerView {
            phase: unit.phase,
            slot_state: seg.state(),
            timestamp: occupied.then(|| seg.timestamp()),
            starting_seq: occupied.then(|| seg.log().starting_seq()),
            instructions: (occupied && seg.log().is_closed()).then(|| seg.log().instructions()),
            committed: if occupied { seg.instructions() } else { 0 },
        })
    }

    fn violation(&self, detail: impl Into<String>) -> LockstepError {
        LockstepError::protocol(self.id.get(), detail)
    }

    fn checker_unit(&self, checker: CheckerId) -> UnitId {
        UnitId::Checker {
            main: self.id,
            checker,
        }
    }

    // -----------------------------------------------------------------------
    // Main-unit side
    // -----------------------------------------------------------------------

    /// First checkpoint: capture the baseline and open the first segment.
    pub fn start(
        &mut self,
        sh: &mut Shared<'_>,
        state: &dyn ThreadState,
        tick: Tick,
    ) -> Result<()> {
        if self.main.started {
            return Err(self.violation("main unit started twice"));
        }
        let baseline = state.snapshot().detached();
        self.main.started = true;
        self.main.committed_snapshot = baseline.clone();
        self.main.previous = baseline;
        info!(main = self.id.get(), tick, "baseline checkpoint established");
        self.allocate(sh, tick)?;
        Ok(())
    }

    /// Record a committed main-unit instruction and close the segment when
    /// a trigger fires. `state` must already reflect the commit.
    pub fn on_commit(
        &mut self,
        sh: &mut Shared<'_>,
        mut event: CommitEvent,
        state: &dyn ThreadState,
        tick: Tick,
    ) -> Result<AppendResult> {
        if !self.main.started {
            return Err(self.violation("commit before the baseline checkpoint"));
        }
        if self.main.erroneous.is_some() {
            if !self.main.squash_sent {
                self.main.squash_sent = true;
                self.abandon_open_segment(sh, tick);
                sh.commands.push(tick, Command::SquashAndRestart(self.id));
            }
            return Ok(AppendResult::RollbackRequired);
        }
        let Some(slot) = self.main.current else {
            return Err(self.violation("commit while asleep without a slot"));
        };
        let rollback_enabled = sh.config.rollback_enabled;
        let seg = self.pool.get_mut(slot)?;

        let mut full = false;
        let mut appended = false;
        if let Some(mut access) = event.access.take() {
            // Swap priors are the value the checker reads back.
            if !rollback_enabled && access.kind != AccessKind::Swap {
                access.prior.clear();
            }
            if let Some(digest) = seg.recorded.as_mut() {
                digest.feed(&access);
            }
            let seq = access.seq.get();
            let result = seg
                .log
                .append(access, tick)
                .map_err(|rejected| LockstepError::protocol(self.id.get(), rejected.to_string()))?;
            self.main.last_seq = self.main.last_seq.max(seq);
            if !result.merged {
                seg.first_record_at.get_or_insert(seg.instructions);
                seg.last_record_at = seg.instructions;
            }
            full = result.full;
            appended = true;
        }

        let mut trigger = None;
        if let Some(entry) = event.syscall.take() {
            seg.has_syscall = true;
            appended = true;
            let log_full = seg.syscalls.record(entry);
            if !self.policy.is_adaptive() {
                trigger = Some(CloseTrigger::Syscall);
            } else if log_full {
                trigger = Some(CloseTrigger::SyscallLogFull);
            }
        }

        if event.completes_instruction {
            seg.instructions += 1;
            seg.pcs.push(event.pc);
            self.coverage.encounter(event.pc, event.inst);
            if trigger.is_none() {
                if full {
                    trigger = Some(CloseTrigger::Capacity);
                } else if seg.instructions >= self.policy.current() {
                    trigger = Some(CloseTrigger::Timeout);
                }
            }
        } else {
            trigger = None;
        }

        if appended && slot.is_primary() {
            self.release_sleep_guard(sh, slot.checker, tick);
        }
        match trigger {
            Some(trigger) => {
                self.checkpoint(sh, trigger, state, tick)?;
                Ok(AppendResult::Closed(trigger))
            }
            None => Ok(AppendResult::Recorded { full }),
        }
    }

    /// Close the open segment at the embedding simulator's request.
    pub fn request_checkpoint(
        &mut self,
        sh: &mut Shared<'_>,
        state: &dyn ThreadState,
        tick: Tick,
    ) -> Result<bool> {
        if self.main.current.is_none() || self.main.erroneous.is_some() {
            return Ok(false);
        }
        self.checkpoint(sh, CloseTrigger::Explicit, state, tick)?;
        Ok(true)
    }

    fn checkpoint(
        &mut self,
        sh: &mut Shared<'_>,
        trigger: CloseTrigger,
        state: &dyn ThreadState,
        tick: Tick,
    ) -> Result<()> {
        let Some(slot) = self.main.current else {
            return Err(self.violation("checkpoint without an open segment"));
        };
        let snapshot = state.snapshot();
        let timeout = self.policy.current();
        let seg = self.pool.get_mut(slot)?;

        let instructions = seg.instructions;
        seg.log.close(instructions);
        let mut expected = snapshot.detached();
        expected.flags.set = true;
        seg.expected = Some(expected);
        seg.recorded_value = seg.recorded.as_mut().map(|digest| digest.finish());
        seg.closed_at = Some(tick);
        seg.state = if !slot.is_primary() {
            SlotState::CopyPending
        } else if seg.checker_started.is_some() {
            SlotState::Verifying
        } else {
            SlotState::AwaitingChecker
        };

        self.histograms.aimd.record(timeout);
        self.histograms.cpt_length.record(instructions);
        self.histograms
            .first_record
            .record(seg.first_record_at.unwrap_or(instructions));
        self.histograms
            .last_record
            .record(instructions - seg.last_record_at);
        self.histograms
            .checkpoint_ticks
            .record(tick.saturating_sub(seg.opened_at));

        let (timestamp, records) = (seg.timestamp, seg.log.len());
        self.main.previous = snapshot.detached();
        self.main.current = None;
        sh.metrics.record_closure(trigger);
        debug!(
            main = self.id.get(),
            slot = %slot,
            timestamp = timestamp.get(),
            trigger = trigger.as_str(),
            records,
            instructions,
            "segment closed"
        );
        sh.observer.on_event(&ProtocolEvent::SegmentClosed {
            main: self.id,
            slot,
            timestamp,
            trigger,
            records,
            instructions,
            tick,
        });

        if sh.config.commit_block_cycles > 0 {
            self.main.blocked_until = tick + sh.config.commit_block_cycles;
            sh.commands.push(
                tick,
                Command::BlockCommit {
                    main: self.id,
                    until: self.main.blocked_until,
                },
            );
        }
        if slot.is_primary() {
            self.release_sleep_guard(sh, slot.checker, tick);
        }
        self.allocate(sh, tick)?;
        Ok(())
    }

    /// Count the open segment as closed by the erroneous state; rollback
    /// discards it.
    fn abandon_open_segment(&mut self, sh: &mut Shared<'_>, tick: Tick) {
        let Some(slot) = self.main.current else {
            return;
        };
        let Some(seg) = self.pool.get(slot) else {
            return;
        };
        sh.metrics.record_closure(CloseTrigger::Erroneous);
        sh.observer.on_event(&ProtocolEvent::SegmentClosed {
            main: self.id,
            slot,
            timestamp: seg.timestamp(),
            trigger: CloseTrigger::Erroneous,
            records: seg.log().len(),
            instructions: seg.instructions,
            tick,
        });
    }

    /// Give the next segment a free slot, or put the main unit to sleep.
    fn allocate(&mut self, sh: &mut Shared<'_>, tick: Tick) -> Result<bool> {
        let Some(slot) = self.pool.find_free() else {
            if !self.main.asleep {
                self.main.asleep = true;
                sh.commands.push(tick, Command::Suspend(UnitId::Main(self.id)));
                debug!(main = self.id.get(), tick, "no free checker slot, main unit asleep");
            }
            return Ok(false);
        };
        let timestamp = self.main.timestamp.next();
        let starting_seq = SeqNum::new(self.main.last_seq.saturating_add(1)).unwrap_or(SeqNum::FIRST);
        self.pool
            .get_mut(slot)?
            .open(timestamp, starting_seq, self.main.previous.detached(), tick);
        self.main.timestamp = timestamp;
        self.main.current = Some(slot);
        if self.main.asleep {
            self.main.asleep = false;
            sh.commands.wake(UnitId::Main(self.id), tick);
        }
        debug!(
            main = self.id.get(),
            slot = %slot,
            timestamp = timestamp.get(),
            starting_seq = starting_seq.get(),
            "slot assigned"
        );
        sh.observer.on_event(&ProtocolEvent::SlotAssigned {
            main: self.id,
            slot,
            timestamp,
            tick,
        });
        if slot.is_primary() {
            self.start_checker(sh, slot.checker, tick)?;
        }
        self.pool.check_contiguity()?;
        Ok(true)
    }

    /// Restore the checker to its primary segment's starting state and wake
    /// it on the next tick.
    fn start_checker(&mut self, sh: &mut Shared<'_>, checker: CheckerId, tick: Tick) -> Result<()> {
        let unit = self.checker_unit(checker);
        let seg = self.pool.get_mut(SlotId::primary(checker))?;
        if seg.state == SlotState::CopyPending {
            seg.state = SlotState::AwaitingChecker;
        }
        let timestamp = seg.timestamp;
        sh.commands.push(
            tick,
            Command::Restore {
                unit,
                snapshot: Box::new(seg.starting.clone()),
                starting_seq: seg.log.starting_seq(),
            },
        );
        sh.commands.wake(unit, tick);
        if let Some(slot) = self.checkers.get_mut(checker.index()) {
            slot.phase = CheckerPhase::Active;
        }
        sh.observer.on_event(&ProtocolEvent::CheckerWoken {
            main: self.id,
            checker,
            timestamp,
            tick,
        });
        Ok(())
    }

    fn release_sleep_guard(&mut self, sh: &mut Shared<'_>, checker: CheckerId, tick: Tick) {
        let unit = self.checker_unit(checker);
        let Some(state) = self.checkers.get_mut(checker.index()) else {
            return;
        };
        if state.phase != CheckerPhase::SleepGuarded {
            return;
        }
        state.phase = CheckerPhase::Active;
        sh.commands.wake(unit, tick);
        let timestamp = self
            .pool
            .get(SlotId::primary(checker))
            .map_or(Timestamp::ZERO, |seg| seg.timestamp());
        sh.observer.on_event(&ProtocolEvent::CheckerWoken {
            main: self.id,
            checker,
            timestamp,
            tick,
        });
    }

    /// Mark the main unit erroneous from outside the verification path.
    pub fn mark_erroneous(&mut self, tick: Tick) {
        if self.main.erroneous.is_none() {
            warn!(main = self.id.get(), tick, "main unit marked erroneous");
            self.main.erroneous = Some(tick);
        }
    }

    /// Backpressure: whether the main unit must not commit this cycle.
    pub fn should_block_commit(&self, sh: &Shared<'_>, hint: PipelineHint, tick: Tick) -> bool {
        if self.main.erroneous.is_some() {
            return false;
        }
        let reason = if tick < self.main.blocked_until {
            StallReason::CommitBlocked
        } else if self.main.asleep {
            StallReason::NoFreeChecker
        } else if hint.should_wait && !hint.can_commit {
            StallReason::Waiting
        } else {
            return false;
        };
        sh.metrics.record_stall(reason);
        true
    }

    // -----------------------------------------------------------------------
    // Checker side
    // -----------------------------------------------------------------------

    /// Serve a checker's memory request from its primary segment.
    pub fn replay(
        &mut self,
        sh: &mut Shared<'_>,
        checker: CheckerId,
        req: &ReplayRequest,
        tick: Tick,
    ) -> Result<ReplayOutcome> {
        let unit = self.checker_unit(checker);
        let slot = SlotId::primary(checker);
        let seg = self.pool.get_mut(slot)?;
        if seg.is_free() {
            return Err(LockstepError::protocol(
                self.id.get(),
                format!("{checker} replayed without a segment"),
            ));
        }
        if !seg.log.is_ready(req.seq) {
            if let Some(state) = self.checkers.get_mut(checker.index()) {
                state.phase = CheckerPhase::SleepGuarded;
            }
            sh.commands.push(tick, Command::Suspend(unit));
            sh.metrics.record_sleep_guard();
            sh.observer.on_event(&ProtocolEvent::CheckerSuspended {
                main: self.id,
                checker,
                sleep_guard: true,
                tick,
            });
            return Ok(ReplayOutcome::SleepGuarded);
        }
        seg.checker_started.get_or_insert(tick);
        if seg.state == SlotState::AwaitingChecker {
            seg.state = SlotState::Verifying;
        }

        match seg.log.replay(req) {
            Ok(data) => {
                let start = seg.log.starting_seq();
                if let Some(record) = req
                    .seq
                    .offset_from(start)
                    .and_then(|index| seg.log.records().get(index))
                {
                    self.histograms
                        .replay_delay
                        .record(tick.saturating_sub(record.appended_at));
                    if let Some(digest) = seg.replayed.as_mut() {
                        digest.feed(&replayed_access(record, req));
                    }
                }
                Ok(ReplayOutcome::Data(data))
            }
            Err(mismatch) => {
                let timestamp = seg.timestamp;
                seg.access_error.get_or_insert(mismatch);
                warn!(
                    main = self.id.get(),
                    checker = checker.get(),
                    timestamp = timestamp.get(),
                    reason = mismatch.reason.as_str(),
                    record = mismatch.record_index,
                    addr = mismatch.addr,
                    size = mismatch.size,
                    "replay mismatch"
                );
                sh.observer.on_event(&ProtocolEvent::ReplayMismatch {
                    main: self.id,
                    checker,
                    timestamp,
                    reason: mismatch.reason,
                    record_index: mismatch.record_index,
                    tick,
                });
                Ok(ReplayOutcome::Mismatched {
                    filler: mismatch.filler(),
                    mismatch,
                })
            }
        }
    }

    /// Consume the next logged system call for a checker.
    ///
    /// Returns `None` when the main unit has not recorded the call yet; the
    /// checker is then sleep-guarded like a replay request.
    pub fn checker_syscall(
        &mut self,
        sh: &mut Shared<'_>,
        checker: CheckerId,
        inst_addr: u64,
        state: &ArchSnapshot,
        tick: Tick,
    ) -> Result<Option<SyscallReplay>> {
        let unit = self.checker_unit(checker);
        let seg = self.pool.get_mut(SlotId::primary(checker))?;
        if seg.is_free() {
            return Err(LockstepError::protocol(
                self.id.get(),
                format!("{checker} issued a system call without a segment"),
            ));
        }
        if !seg.log.is_closed() && !seg.syscalls.has_unread() {
            if let Some(unit_state) = self.checkers.get_mut(checker.index()) {
                unit_state.phase = CheckerPhase::SleepGuarded;
            }
            sh.commands.push(tick, Command::Suspend(unit));
            sh.metrics.record_sleep_guard();
            sh.observer.on_event(&ProtocolEvent::CheckerSuspended {
                main: self.id,
                checker,
                sleep_guard: true,
                tick,
            });
            return Ok(None);
        }
        let replay = seg.syscalls.read(inst_addr, state, sh.exemptions);
        if replay.diverged {
            seg.interrupted = true;
            warn!(
                main = self.id.get(),
                checker = checker.get(),
                inst_addr,
                "checker system call diverged from the log"
            );
        }
        Ok(Some(replay))
    }

    /// Compute the verdict of a checker's primary segment and run the
    /// retire pass.
    pub fn checker_finished(
        &mut self,
        sh: &mut Shared<'_>,
        checker: CheckerId,
        final_state: &ArchSnapshot,
        tick: Tick,
    ) -> Result<Verdict> {
        let seg = self.pool.get_mut(SlotId::primary(checker))?;
        if seg.is_free() || !seg.log.is_closed() {
            return Err(LockstepError::protocol(
                self.id.get(),
                format!("{checker} finished a segment that is not closed"),
            ));
        }
        let Some(expected) = seg.expected.take() else {
            return Err(LockstepError::internal("closed segment without expected state"));
        };
        let divergence = compare(&expected, final_state, sh.exemptions).err();
        let digest_mismatch = match (seg.recorded_value, seg.replayed.as_mut()) {
            (Some(recorded), Some(replayed)) => replayed.finish() != recorded,
            _ => false,
        };
        let detected = if let Some(mismatch) = seg.access_error {
            let stage = if mismatch.reason.is_write_side() {
                DetectionStage::Write
            } else {
                DetectionStage::Read
            };
            Some((FaultCause::Replay(mismatch.reason), stage))
        } else if seg.interrupted {
            Some((FaultCause::SyscallDivergence, DetectionStage::Syscall))
        } else if divergence.is_some() {
            Some((FaultCause::ArchDivergence, DetectionStage::Arch))
        } else if digest_mismatch {
            Some((FaultCause::Digest, DetectionStage::Digest))
        } else {
            None
        };
        let cause = detected.map(|(cause, _)| cause);
        match detected {
            Some((cause, stage)) => {
                sh.metrics.record_faulted_verdict(stage);
                warn!(
                    main = self.id.get(),
                    checker = checker.get(),
                    timestamp = seg.timestamp.get(),
                    %cause,
                    divergence = ?divergence,
                    "segment verification failed"
                );
            }
            None => {
                sh.metrics.record_clean_verdict();
                debug!(
                    main = self.id.get(),
                    checker = checker.get(),
                    timestamp = seg.timestamp.get(),
                    "segment verified"
                );
            }
        }
        self.histograms
            .checker_cycles
            .record(tick.saturating_sub(seg.checker_started.unwrap_or(tick)));
        seg.state = SlotState::Retiring;

        let timestamp = seg.timestamp;
        let mut expected = expected;
        expected.flags.checked = true;
        let completed = CompletedSegment {
            cause,
            has_syscall: seg.has_syscall,
            undo: seg.undo_batch(),
            pcs: std::mem::take(&mut seg.pcs),
            expected,
            closed_at: seg.closed_at.unwrap_or(tick),
            buffered: !timestamp.follows(self.main.committed),
        };
        sh.observer.on_event(&ProtocolEvent::Verdict {
            main: self.id,
            checker,
            timestamp,
            cause,
            tick,
        });
        if self.pending.insert(timestamp, completed).is_some() {
            return Err(self.violation(format!("timestamp {timestamp} verified twice")));
        }

        self.free_primary(sh, checker, tick)?;
        self.retire_pass(sh, tick)?;
        if self.main.asleep && self.main.erroneous.is_none() {
            self.allocate(sh, tick)?;
        }
        self.pool.check_contiguity()?;

        Ok(Verdict {
            main: self.id,
            checker,
            timestamp,
            cause,
            divergence,
        })
    }

    /// Free a checker's primary slot, hand it the next cached segment if
    /// there is one, and keep the main unit's open slot id current.
    fn free_primary(&mut self, sh: &mut Shared<'_>, checker: CheckerId, tick: Tick) -> Result<()> {
        let moved = self.pool.release_primary(checker)?;
        if let Some(current) = self.main.current {
            if current.checker == checker && current.level > 0 {
                self.main.current = Some(SlotId::new(checker, current.level - 1));
            }
        }
        if moved {
            return self.start_checker(sh, checker, tick);
        }
        if let Some(state) = self.checkers.get_mut(checker.index()) {
            state.phase = CheckerPhase::Idle;
        }
        sh.commands.push(tick, Command::Suspend(self.checker_unit(checker)));
        sh.observer.on_event(&ProtocolEvent::CheckerSuspended {
            main: self.id,
            checker,
            sleep_guard: false,
            tick,
        });
        Ok(())
    }

    /// Retire pending segments in timestamp order until a gap, a fault, or
    /// an empty map stops the pass.
    fn retire_pass(&mut self, sh: &mut Shared<'_>, tick: Tick) -> Result<()> {
        while self.main.erroneous.is_none() {
            let next = self.main.committed.next();
            let Some((&timestamp, entry)) = self.pending.first_key_value() else {
                break;
            };
            if timestamp < next {
                return Err(LockstepError::OutOfOrderRetire {
                    main: self.id.get(),
                    timestamp: timestamp.get(),
                    committed: self.main.committed.get(),
                });
            }
            if timestamp != next {
                break;
            }
            if let Some(cause) = entry.cause {
                if sh.config.rollback_enabled && !entry.has_syscall {
                    let latency = tick.saturating_sub(entry.closed_at);
                    self.main.erroneous = Some(tick);
                    self.policy.on_fault();
                    sh.metrics.record_fault_detected(latency);
                    warn!(
                        main = self.id.get(),
                        timestamp = timestamp.get(),
                        %cause,
                        latency,
                        timeout = self.policy.current(),
                        "fault detected, main unit erroneous"
                    );
                    sh.observer.on_event(&ProtocolEvent::FaultDetected {
                        main: self.id,
                        timestamp,
                        latency_ticks: latency,
                        tick,
                    });
                    break;
                }
                sh.metrics.record_fault_accepted();
                warn!(
                    main = self.id.get(),
                    timestamp = timestamp.get(),
                    %cause,
                    has_syscall = entry.has_syscall,
                    "faulted segment accepted without rollback"
                );
            }
            let Some(entry) = self.pending.remove(&timestamp) else {
                break;
            };
            if entry.cause.is_none() {
                for pc in &entry.pcs {
                    self.coverage.check(*pc);
                }
                self.policy.on_clean_retire();
            }
            self.main.committed = timestamp;
            self.main.committed_snapshot = entry.expected;
            debug!(
                main = self.id.get(),
                timestamp = timestamp.get(),
                buffered = entry.buffered,
                "segment retired"
            );
            sh.observer.on_event(&ProtocolEvent::Retired {
                main: self.id,
                timestamp,
                buffered: entry.buffered,
                tick,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------------

    /// Undo every segment newer than the last retired one, restore the
    /// main unit to the committed snapshot, and open a fresh segment.
    ///
    /// Called after [`AppendResult::RollbackRequired`], or directly to force
    /// a rollback. Checkers mid-replay are abandoned.
    pub fn rollback(
        &mut self,
        sh: &mut Shared<'_>,
        memory: &mut dyn MemoryPort,
        tick: Tick,
    ) -> Result<RecoveryReport> {
        if !self.main.started {
            return Err(self.violation("rollback before the baseline checkpoint"));
        }
        let mut batches: Vec<UndoBatch> = std::mem::take(&mut self.pending)
            .into_values()
            .map(|entry| entry.undo)
            .collect();
        batches.extend(self.pool.drain_all());
        batches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(stale) = batches.iter().find(|b| b.timestamp <= self.main.committed) {
            return Err(LockstepError::OutOfOrderRetire {
                main: self.id.get(),
                timestamp: stale.timestamp.get(),
                committed: self.main.committed.get(),
            });
        }

        let mut report = apply_undo(self.id, self.main.committed, &batches, memory);
        report.detection_latency = self.main.erroneous.map(|at| tick.saturating_sub(at));

        for (index, state) in self.checkers.iter_mut().enumerate() {
            if state.phase != CheckerPhase::Idle {
                state.phase = CheckerPhase::Idle;
                sh.commands.push(
                    tick,
                    Command::Suspend(UnitId::Checker {
                        main: self.id,
                        checker: CheckerId::new(index as u32),
                    }),
                );
            }
        }
        if !self.main.squash_sent {
            sh.commands.push(tick, Command::SquashAndRestart(self.id));
        }
        let starting_seq = SeqNum::new(self.main.last_seq.saturating_add(1)).unwrap_or(SeqNum::FIRST);
        sh.commands.push(
            tick,
            Command::Restore {
                unit: UnitId::Main(self.id),
                snapshot: Box::new(self.main.committed_snapshot.clone()),
                starting_seq,
            },
        );
        self.main.timestamp = self.main.committed;
        self.main.current = None;
        self.main.erroneous = None;
        self.main.squash_sent = false;
        self.main.blocked_until = 0;
        self.main.previous = self.main.committed_snapshot.detached();

        sh.metrics.record_rollback(report.writebacks);
        info!(
            main = self.id.get(),
            restored_to = report.restored_to.get(),
            segments = report.undone_segments.len(),
            undone_ops = report.undone_ops,
            writebacks = report.writebacks,
            "rollback completed"
        );
        sh.observer.on_event(&ProtocolEvent::RollbackCompleted {
            main: self.id,
            restored_to: report.restored_to,
            undone_segments: report.undone_segments.clone(),
            undone_ops: report.undone_ops,
            tick,
        });
        self.allocate(sh, tick)?;
        Ok(report)
    }
}

/// The access a successful replay stands for, in the shape the recorded
/// digest saw it.
fn replayed_access(record: &OperationRecord, req: &ReplayRequest) -> MemAccess {
    let offset = usize::try_from(req.addr.wrapping_sub(record.addr)).unwrap_or(0);
    let end = (offset + req.size).min(record.payload.len());
    let payload = record.payload.get(offset..end).unwrap_or_default().to_vec();
    let base = MemAccess::load(req.addr, payload, record.pc, record.seq).with_micro_pc(req.micro_pc);
    match record.kind {
        AccessKind::Load => base,
        kind => MemAccess { kind, ..base },
    }
}

#[cfg(test)]
mod tests {
    use lockstep_observability::{MetricsObserver, NoOpObserver};
    use lockstep_types::RegClass;

    use super::*;
    use crate::rollback::SparseMemory;
    use crate::snapshot::RegisterLayout;

    struct Regs(ArchSnapshot);

    impl ThreadState for Regs {
        fn snapshot(&self) -> ArchSnapshot {
            self.0.clone()
        }

        fn restore(&mut self, snapshot: &ArchSnapshot) {
            self.0 = snapshot.clone();
        }
    }

    struct Fixture {
        config: ProtocolConfig,
        exemptions: ComparisonExemptions,
        metrics: LockstepMetrics,
        commands: CommandQueue,
        group: ReplicationGroup,
    }

    impl Fixture {
        fn new(config: ProtocolConfig) -> Self {
            let group = ReplicationGroup::new(MainId::new(0), &config);
            Self {
                exemptions: ComparisonExemptions::new(config.exemptions.iter().copied()),
                config,
                metrics: LockstepMetrics::new(),
                commands: CommandQueue::new(),
                group,
            }
        }

        fn with<R>(&mut self, f: impl FnOnce(&mut ReplicationGroup, &mut Shared<'_>) -> R) -> R {
            let mut sh = Shared {
                config: &self.config,
                exemptions: &self.exemptions,
                metrics: &self.metrics,
                observer: &NoOpObserver,
                commands: &mut self.commands,
            };
            f(&mut self.group, &mut sh)
        }

        fn observed<R>(
            &mut self,
            observer: &dyn ProtocolObserver,
            f: impl FnOnce(&mut ReplicationGroup, &mut Shared<'_>) -> R,
        ) -> R {
            let mut sh = Shared {
                config: &self.config,
                exemptions: &self.exemptions,
                metrics: &self.metrics,
                observer,
                commands: &mut self.commands,
            };
            f(&mut self.group, &mut sh)
        }
    }

    fn config(checkers: u32, extra: u32, timeout: u64) -> ProtocolConfig {
        ProtocolConfig {
            checkers_per_main: checkers,
            extra_slots_per_checker: extra,
            checkpoint_timeout: timeout,
            commit_block_cycles: 0,
            ..ProtocolConfig::default()
        }
    }

    fn regs() -> Regs {
        Regs(ArchSnapshot::zeroed(RegisterLayout::default()))
    }

    fn seq(n: u64) -> SeqNum {
        SeqNum::new(n).unwrap()
    }

    const C0: CheckerId = CheckerId::new(0);
    const C1: CheckerId = CheckerId::new(1);

    #[test]
    fn test_timeout_closes_and_reallocates() {
        let mut fx = Fixture::new(config(2, 0, 5));
        let state = regs();
        fx.with(|g, sh| g.start(sh, &state, 0)).unwrap();
        for tick in 1..5 {
            let r = fx
                .with(|g, sh| g.on_commit(sh, CommitEvent::plain(tick * 4, "nop"), &state, tick))
                .unwrap();
            assert_eq!(r, AppendResult::Recorded { full: false });
        }
        let r = fx
            .with(|g, sh| g.on_commit(sh, CommitEvent::plain(20, "nop"), &state, 5))
            .unwrap();
        assert_eq!(r, AppendResult::Closed(CloseTrigger::Timeout));
        let view = fx.group.main_view();
        assert_eq!(view.timestamp, Timestamp::new(2));
        assert_eq!(view.open_slot, Some(SlotId::primary(C1)));
        let c0 = fx.group.checker_view(C0).unwrap();
        assert_eq!(c0.slot_state, SlotState::AwaitingChecker);
        assert_eq!(c0.instructions, Some(5));
        assert_eq!(fx.metrics.snapshot().closures_for(CloseTrigger::Timeout), 1);
    }

    #[test]
    fn test_sleep_guard_then_wake_on_append() {
        let mut fx = Fixture::new(config(1, 0, 100));
        let state = regs();
        fx.with(|g, sh| g.start(sh, &state, 0)).unwrap();
        fx.commands.clear();
        let req = ReplayRequest::write(seq(1), 0x100, vec![1, 2, 3, 4]);
        let out = fx.with(|g, sh| g.replay(sh, C0, &req, 1)).unwrap();
        assert_eq!(out, ReplayOutcome::SleepGuarded);
        assert_eq!(fx.group.checker_view(C0).unwrap().phase, CheckerPhase::SleepGuarded);

        let access = MemAccess::store(0x100, vec![1, 2, 3, 4], vec![0; 4], 0x40, seq(1));
        fx.with(|g, sh| g.on_commit(sh, CommitEvent::memory(access, "str"), &state, 2))
            .unwrap();
        assert_eq!(fx.group.checker_view(C0).unwrap().phase, CheckerPhase::Active);
        let due = fx.commands.commands_due(3);
        assert!(due.contains(&Command::Wake(UnitId::Checker {
            main: MainId::new(0),
            checker: C0
        })));
        // The only record may still absorb micro-steps until the segment closes.
        let out = fx.with(|g, sh| g.replay(sh, C0, &req, 3)).unwrap();
        assert_eq!(out, ReplayOutcome::SleepGuarded);
        fx.with(|g, sh| g.request_checkpoint(sh, &state, 4)).unwrap();
        let out = fx.with(|g, sh| g.replay(sh, C0, &req, 5)).unwrap();
        assert_eq!(out, ReplayOutcome::Data(ReplayData::Verified));
    }

    #[test]
    fn test_out_of_order_finish_is_buffered() {
        let mut fx = Fixture::new(config(2, 0, 2));
        let state = regs();
        fx.with(|g, sh| g.start(sh, &state, 0)).unwrap();
        for tick in 1..=4 {
            fx.with(|g, sh| g.on_commit(sh, CommitEvent::plain(tick, "nop"), &state, tick))
                .unwrap();
        }
        // Both checkers hold closed segments; the main unit sleeps.
        assert!(fx.group.main_view().asleep);
        let expected = fx.group.pool().get(SlotId::primary(C1)).unwrap();
        let final_state = expected.expected_snapshot().unwrap().clone();
        let verdict = fx
            .with(|g, sh| g.checker_finished(sh, C1, &final_state, 5))
            .unwrap();
        assert!(verdict.is_clean());
        assert_eq!(fx.group.main_view().committed, Timestamp::ZERO);
        assert_eq!(fx.group.main_view().pending_retirements, 1);

        let final_state = fx
            .group
            .pool()
            .get(SlotId::primary(C0))
            .unwrap()
            .expected_snapshot()
            .unwrap()
            .clone();
        fx.with(|g, sh| g.checker_finished(sh, C0, &final_state, 6))
            .unwrap();
        let view = fx.group.main_view();
        assert_eq!(view.committed, Timestamp::new(2));
        assert_eq!(view.pending_retirements, 0);
        assert!(!view.asleep, "freed slots wake the main unit");
    }

    #[test]
    fn test_arch_divergence_marks_erroneous_then_rollback() {
        let mut fx = Fixture::new(config(1, 1, 1));
        let mut state = regs();
        let mut memory = SparseMemory::new();
        fx.with(|g, sh| g.start(sh, &state, 0)).unwrap();

        memory.write(0x100, &[7]);
        let access = MemAccess::store(0x100, vec![7], vec![0], 0x40, seq(1));
        state.0.set_reg(RegClass::Int, 1, 7);
        let r = fx
            .with(|g, sh| g.on_commit(sh, CommitEvent::memory(access, "str"), &state, 1))
            .unwrap();
        assert_eq!(r, AppendResult::Closed(CloseTrigger::Timeout));

        let mut wrong = state.0.clone();
        wrong.flip_bit(RegClass::Int, 1, 3);
        let verdict = fx.with(|g, sh| g.checker_finished(sh, C0, &wrong, 2)).unwrap();
        assert_eq!(verdict.cause, Some(FaultCause::ArchDivergence));
        assert!(fx.group.main_view().erroneous);
        assert!(!fx.with(|g, sh| g.should_block_commit(sh, PipelineHint::default(), 2)));

        let r = fx
            .with(|g, sh| g.on_commit(sh, CommitEvent::plain(0x44, "nop"), &state, 3))
            .unwrap();
        assert_eq!(r, AppendResult::RollbackRequired);
        let report = fx.with(|g, sh| g.rollback(sh, &mut memory, 4)).unwrap();
        assert_eq!(memory.read(0x100, 1), vec![0]);
        assert_eq!(report.restored_to, Timestamp::ZERO);
        assert_eq!(report.undone_segments, vec![Timestamp::new(2), Timestamp::new(1)]);
        assert_eq!(report.detection_latency, Some(2));
        let view = fx.group.main_view();
        assert!(!view.erroneous);
        assert_eq!(view.timestamp, Timestamp::new(1));
        assert_eq!(view.open_slot, Some(SlotId::primary(C0)));
        assert_eq!(fx.metrics.snapshot().rollbacks, 1);
        assert_eq!(fx.metrics.snapshot().detected_arch, 1);
    }

    #[test]
    fn test_rollback_disabled_accepts_fault() {
        let mut cfg = config(1, 0, 1);
        cfg.rollback_enabled = false;
        let mut fx = Fixture::new(cfg);
        let state = regs();
        fx.with(|g, sh| g.start(sh, &state, 0)).unwrap();
        fx.with(|g, sh| g.on_commit(sh, CommitEvent::plain(4, "nop"), &state, 1))
            .unwrap();
        let mut wrong = state.0.clone();
        wrong.flip_bit(RegClass::Float, 0, 0);
        let verdict = fx.with(|g, sh| g.checker_finished(sh, C0, &wrong, 2)).unwrap();
        assert!(!verdict.is_clean());
        let view = fx.group.main_view();
        assert!(!view.erroneous);
        assert_eq!(view.committed, Timestamp::new(1));
        assert_eq!(fx.metrics.snapshot().faults_accepted, 1);
    }

    #[test]
    fn test_commit_without_start_is_violation() {
        let mut fx = Fixture::new(config(1, 0, 10));
        let state = regs();
        let err = fx
            .with(|g, sh| g.on_commit(sh, CommitEvent::plain(0, "nop"), &state, 0))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_syscall_closes_segment_unless_adaptive() {
        let mut fx = Fixture::new(config(2, 0, 100));
        let state = regs();
        fx.with(|g, sh| g.start(sh, &state, 0)).unwrap();
        let entry = SyscallEntry {
            result: 3,
            inst_addr: 0x80,
            before: state.0.clone(),
            after: state.0.clone(),
        };
        let r = fx
            .with(|g, sh| g.on_commit(sh, CommitEvent::syscall(entry.clone(), "svc"), &state, 1))
            .unwrap();
        assert_eq!(r, AppendResult::Closed(CloseTrigger::Syscall));
        assert!(fx.group.pool().get(SlotId::primary(C0)).unwrap().has_syscall());

        let mut adaptive = config(2, 0, 100);
        adaptive.adaptive_timeout = true;
        let mut fx = Fixture::new(adaptive);
        fx.with(|g, sh| g.start(sh, &state, 0)).unwrap();
        let r = fx
            .with(|g, sh| g.on_commit(sh, CommitEvent::syscall(entry, "svc"), &state, 1))
            .unwrap();
        assert_eq!(r, AppendResult::Recorded { full: false });
    }

    #[test]
    fn test_recorded_syscall_wakes_guarded_checker() {
        let mut cfg = config(1, 0, 100);
        cfg.adaptive_timeout = true;
        let mut fx = Fixture::new(cfg);
        let observer = MetricsObserver::new(16);
        let state = regs();
        fx.with(|g, sh| g.start(sh, &state, 0)).unwrap();
        fx.commands.clear();

        let out = fx
            .observed(&observer, |g, sh| g.checker_syscall(sh, C0, 0x80, &state.0, 1))
            .unwrap();
        assert!(out.is_none());
        assert_eq!(fx.group.checker_view(C0).unwrap().phase, CheckerPhase::SleepGuarded);
        assert!(observer.log().snapshot().iter().any(|event| matches!(
            event,
            ProtocolEvent::CheckerSuspended {
                sleep_guard: true,
                tick: 1,
                ..
            }
        )));

        let entry = SyscallEntry {
            result: 3,
            inst_addr: 0x80,
            before: state.0.clone(),
            after: state.0.clone(),
        };
        let r = fx
            .observed(&observer, |g, sh| {
                g.on_commit(sh, CommitEvent::syscall(entry, "svc"), &state, 2)
            })
            .unwrap();
        assert_eq!(r, AppendResult::Recorded { full: false });
        assert_eq!(fx.group.checker_view(C0).unwrap().phase, CheckerPhase::Active);
        let due = fx.commands.commands_due(3);
        assert!(due.contains(&Command::Wake(UnitId::Checker {
            main: MainId::new(0),
            checker: C0
        })));
        assert!(observer
            .log()
            .snapshot()
            .iter()
            .any(|event| matches!(event, ProtocolEvent::CheckerWoken { tick: 2, .. })));

        let replay = fx
            .with(|g, sh| g.checker_syscall(sh, C0, 0x80, &state.0, 3))
            .unwrap()
            .expect("entry is recorded");
        assert_eq!(replay.result, 3);
        assert!(!replay.diverged);
    }

    #[test]
    fn test_commit_block_window() {
        let mut cfg = config(2, 0, 1);
        cfg.commit_block_cycles = 3;
        let mut fx = Fixture::new(cfg);
        let state = regs();
        fx.with(|g, sh| g.start(sh, &state, 0)).unwrap();
        fx.with(|g, sh| g.on_commit(sh, CommitEvent::plain(0, "nop"), &state, 10))
            .unwrap();
        assert!(fx.with(|g, sh| g.should_block_commit(sh, PipelineHint::default(), 12)));
        assert!(!fx.with(|g, sh| g.should_block_commit(sh, PipelineHint::default(), 13)));
        let waiting = PipelineHint {
            should_wait: true,
            can_commit: false,
        };
        assert!(fx.with(|g, sh| g.should_block_commit(sh, waiting, 13)));
        let snap = fx.metrics.snapshot();
        assert_eq!(snap.stall_commit_blocked, 1);
        assert_eq!(snap.stall_waiting, 1);
    }
}
