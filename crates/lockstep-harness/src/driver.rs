//! Deterministic tick driver.
//!
//! Plays a [`Program`] on every main unit of a [`LockstepContext`], replays
//! the logged segments on the checkers, and injects faults along the way.
//! Everything is single threaded and seeded, so a run is a pure function of
//! its [`SimOptions`] and program.
//!
//! # Tick order
//!
//! ```text
//!  tick t:
//!    1. deliver commands due at t (restore / suspend / wake)
//!    2. each main unit commits at most one instruction
//!    3. each running checker replays at most one instruction
//! ```
//!
//! Injections only ever corrupt the log or a checker; the main units'
//! registers and memory always follow the fault-free execution.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use lockstep_core::{
    AppendResult, ArchSnapshot, CheckerPhase, Command, CommitEvent, LockstepContext,
    LockstepMetricsSnapshot, MemAccess, MemoryPort, PipelineHint, ProtocolConfig, RegisterRef,
    ReplayData, ReplayOutcome, ReplayRequest, Segment, SparseMemory, SyscallEntry, ThreadState,
};
use lockstep_error::{LockstepError, Result};
use lockstep_observability::{
    FanoutObserver, MetricsObserver, ProtocolEvent, ProtocolMetricsSnapshot,
};
use lockstep_types::{CheckerId, MainId, RegClass, SeqNum, Tick, Timestamp, UnitId};
use tracing::{debug, info, trace};

use crate::fault_spec::{StuckAtSpec, StuckStructure};
use crate::injection::{DEFAULT_INJECTION_SEED, InjectionCategory, Injector};
use crate::ledger::{InjectionLedger, LedgerSnapshot};
use crate::machine::{
    Cpu, DataPort, OpClass, Program, SyscallOutcome, TOY_REGS, execute, syscall_result,
};
use crate::report;

// ---------------------------------------------------------------------------
// Options and summary
// ---------------------------------------------------------------------------

/// Everything a run depends on besides the program.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub protocol: ProtocolConfig,
    pub injection_seed: u64,
    /// Instructions each main unit commits before shutting down.
    pub instructions: u64,
    /// Abort with an internal error past this many ticks.
    pub max_ticks: u64,
    /// Corrupt store and swap payloads as well as loads.
    pub target_stores: bool,
    /// Operation classes whose destinations the op-class category targets.
    pub op_class_targets: Vec<OpClass>,
    pub stuck_at: Option<StuckAtSpec>,
    /// Stop scheduled injections after this many.
    pub injection_limit: Option<u64>,
    /// Events kept in the in-memory ring.
    pub event_log_capacity: usize,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            injection_seed: DEFAULT_INJECTION_SEED,
            instructions: 2000,
            max_ticks: 1_000_000,
            target_stores: false,
            op_class_targets: vec![OpClass::IntAlu],
            stuck_at: None,
            injection_limit: None,
            event_log_capacity: 4096,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub ticks: Tick,
    /// Instructions committed across every main unit, reruns included.
    pub committed: u64,
    pub recoveries: u64,
    pub metrics: LockstepMetricsSnapshot,
    pub events: ProtocolMetricsSnapshot,
    pub ledger: LedgerSnapshot,
    pub lapses: Vec<u64>,
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CheckerUnit {
    id: CheckerId,
    cpu: Cpu,
    running: bool,
    /// Holds the starting state of its current primary segment.
    restored: bool,
    /// No instruction replayed since the last restore.
    fresh: bool,
    cursor: SeqNum,
    executed: u64,
}

#[derive(Debug)]
struct MainUnit {
    id: MainId,
    cpu: Cpu,
    memory: SparseMemory,
    next_seq: SeqNum,
    /// Instructions of the current execution path (reruns rewind it).
    executed: u64,
    /// `executed` at the closure of each segment.
    progress: BTreeMap<Timestamp, u64>,
    checkers: Vec<CheckerUnit>,
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Main-unit port: reads functional memory, stages the access for the log,
/// and defers the write until the commit is accepted.
struct MainPort<'a> {
    memory: &'a SparseMemory,
    seq: SeqNum,
    pc: u64,
    access: Option<MemAccess>,
    write: Option<(u64, Vec<u8>)>,
    syscall: Option<u64>,
}

impl DataPort for MainPort<'_> {
    fn load(&mut self, addr: u64, size: usize) -> Result<Option<Vec<u8>>> {
        let payload = self.memory.read(addr, size);
        self.access = Some(MemAccess::load(addr, payload.clone(), self.pc, self.seq));
        Ok(Some(payload))
    }

    fn store(&mut self, addr: u64, data: &[u8]) -> Result<bool> {
        let prior = self.memory.read(addr, data.len());
        self.access = Some(MemAccess::store(addr, data.to_vec(), prior, self.pc, self.seq));
        self.write = Some((addr, data.to_vec()));
        Ok(true)
    }

    fn swap(&mut self, addr: u64, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let prior = self.memory.read(addr, data.len());
        self.access = Some(MemAccess::swap(
            addr,
            data.to_vec(),
            prior.clone(),
            self.pc,
            self.seq,
        ));
        self.write = Some((addr, data.to_vec()));
        Ok(Some(prior))
    }

    fn syscall(
        &mut self,
        _pc: u64,
        num: u64,
        state: &ArchSnapshot,
    ) -> Result<Option<SyscallOutcome>> {
        let result = syscall_result(num, state);
        self.syscall = Some(result);
        Ok(Some(SyscallOutcome {
            result,
            install: None,
        }))
    }
}

/// Checker port: every access is served from the segment log.
struct CheckerPort<'a> {
    ctx: &'a mut LockstepContext,
    main: MainId,
    checker: CheckerId,
    seq: SeqNum,
    tick: Tick,
    consumed: bool,
}

impl CheckerPort<'_> {
    fn serve(&mut self, req: &ReplayRequest) -> Result<Option<ReplayOutcome>> {
        match self.ctx.replay(self.main, self.checker, req, self.tick)? {
            ReplayOutcome::SleepGuarded => Ok(None),
            outcome => {
                self.consumed = true;
                Ok(Some(outcome))
            }
        }
    }
}

fn replayed_bytes(outcome: ReplayOutcome, size: usize) -> Vec<u8> {
    match outcome {
        ReplayOutcome::Data(ReplayData::Bytes(bytes)) => bytes,
        ReplayOutcome::Mismatched { filler, .. } => filler,
        _ => vec![0; size],
    }
}

impl DataPort for CheckerPort<'_> {
    fn load(&mut self, addr: u64, size: usize) -> Result<Option<Vec<u8>>> {
        let req = ReplayRequest::read(self.seq, addr, size);
        Ok(self.serve(&req)?.map(|outcome| replayed_bytes(outcome, size)))
    }

    fn store(&mut self, addr: u64, data: &[u8]) -> Result<bool> {
        let req = ReplayRequest::write(self.seq, addr, data.to_vec());
        Ok(self.serve(&req)?.is_some())
    }

    fn swap(&mut self, addr: u64, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let req = ReplayRequest::swap(self.seq, addr, data.to_vec());
        Ok(self
            .serve(&req)?
            .map(|outcome| replayed_bytes(outcome, data.len())))
    }

    fn syscall(
        &mut self,
        pc: u64,
        _num: u64,
        state: &ArchSnapshot,
    ) -> Result<Option<SyscallOutcome>> {
        let replay = self
            .ctx
            .checker_syscall(self.main, self.checker, pc, state, self.tick)?;
        Ok(replay.map(|replay| SyscallOutcome {
            result: replay.result,
            install: replay.install,
        }))
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// A running lockstep system with injection.
pub struct Simulation {
    ctx: LockstepContext,
    program: Program,
    options: SimOptions,
    mains: Vec<MainUnit>,
    injector: Injector,
    ledger: Arc<InjectionLedger>,
    events: Arc<MetricsObserver>,
    tick: Tick,
    committed: u64,
    recoveries: u64,
}

impl Simulation {
    /// Build the context, establish every baseline, and arm the injector.
    pub fn new(options: SimOptions, program: Program) -> Result<Self> {
        let ledger = Arc::new(InjectionLedger::new());
        let events = Arc::new(MetricsObserver::new(options.event_log_capacity));
        let fanout = FanoutObserver::new()
            .with(ledger.clone())
            .with(events.clone());
        let mut ctx = LockstepContext::new(options.protocol.clone())?.with_observer(Arc::new(fanout));

        let checkers = options.protocol.checkers_per_main;
        let mut mains = Vec::new();
        for m in 0..options.protocol.main_units {
            let id = MainId::new(m);
            let cpu = Cpu::reset();
            ctx.start(id, &cpu, 0)?;
            mains.push(MainUnit {
                id,
                cpu,
                memory: SparseMemory::new(),
                next_seq: SeqNum::FIRST,
                executed: 0,
                progress: BTreeMap::new(),
                checkers: (0..checkers)
                    .map(|c| CheckerUnit {
                        id: CheckerId::new(c),
                        cpu: Cpu::reset(),
                        running: false,
                        restored: false,
                        fresh: false,
                        cursor: SeqNum::FIRST,
                        executed: 0,
                    })
                    .collect(),
            });
        }
        let injector = Injector::new(options.protocol.injection, options.injection_seed)
            .with_limit(options.injection_limit);
        info!(
            mains = mains.len(),
            checkers,
            instructions = options.instructions,
            seed = options.injection_seed,
            program = program.len(),
            "simulation armed"
        );
        Ok(Self {
            ctx,
            program,
            options,
            mains,
            injector,
            ledger,
            events,
            tick: 0,
            committed: 0,
            recoveries: 0,
        })
    }

    pub fn context(&self) -> &LockstepContext {
        &self.ctx
    }

    pub fn ledger(&self) -> &InjectionLedger {
        &self.ledger
    }

    pub fn events(&self) -> &MetricsObserver {
        &self.events
    }

    pub fn injector(&self) -> &Injector {
        &self.injector
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Functional memory of a main unit.
    pub fn memory(&self, main: MainId) -> Option<&SparseMemory> {
        self.mains.get(main.index()).map(|unit| &unit.memory)
    }

    /// Architectural state of a main unit.
    pub fn main_state(&self, main: MainId) -> Option<&ArchSnapshot> {
        self.mains.get(main.index()).map(|unit| &unit.cpu.state)
    }

    /// Step until every main unit has run its budget and retired it.
    pub fn run(&mut self) -> Result<RunSummary> {
        while !self.is_done()? {
            if self.tick >= self.options.max_ticks {
                return Err(LockstepError::internal(format!(
                    "simulation did not settle within {} ticks",
                    self.options.max_ticks
                )));
            }
            self.step()?;
        }
        self.ctx.publish_metrics();
        let summary = self.summary();
        info!(
            ticks = summary.ticks,
            committed = summary.committed,
            recoveries = summary.recoveries,
            injections = summary.ledger.total_injections(),
            detected = summary.ledger.detected,
            "simulation settled"
        );
        Ok(summary)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            ticks: self.tick,
            committed: self.committed,
            recoveries: self.recoveries,
            metrics: self.ctx.metrics_snapshot(),
            events: self.events.metrics().snapshot(),
            ledger: self.ledger.snapshot(),
            lapses: self.injector.lapses().to_vec(),
        }
    }

    /// Run the accounting self-check against the injector's lapses.
    pub fn self_check(&self) -> Result<LedgerSnapshot> {
        self.ledger.self_check(self.injector.lapses().len())
    }

    /// Write the core reports and `error_log.txt` into `dir`.
    pub fn write_reports(&self, dir: &Path) -> Result<()> {
        self.ctx.write_reports(dir)?;
        report::write_error_log(
            dir,
            &self.ledger.snapshot(),
            &self.ctx.metrics_snapshot(),
            self.injector.lapses(),
        )
    }

    /// Every main unit ran its budget, has nothing in flight, and waits on
    /// an empty open segment.
    pub fn is_done(&self) -> Result<bool> {
        for unit in &self.mains {
            if unit.executed < self.options.instructions {
                return Ok(false);
            }
            let group = self.ctx.group(unit.id)?;
            let view = group.main_view();
            let open = view
                .open_slot
                .and_then(|slot| group.pool().get(slot))
                .map(Segment::instructions);
            if view.erroneous || view.committed.next() != view.timestamp || open != Some(0) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Advance one tick.
    pub fn step(&mut self) -> Result<()> {
        self.tick += 1;
        let tick = self.tick;
        for command in self.ctx.commands_due(tick) {
            self.deliver(command);
        }
        for m in 0..self.mains.len() {
            self.step_main(m, tick)?;
        }
        for m in 0..self.mains.len() {
            for c in 0..self.mains[m].checkers.len() {
                self.step_checker(m, c, tick)?;
            }
        }
        Ok(())
    }

    fn deliver(&mut self, command: Command) {
        trace!(command = command.label(), unit = %command.unit(), tick = self.tick, "command");
        match command {
            Command::Restore {
                unit: UnitId::Checker { main, checker },
                snapshot,
                starting_seq,
            } => {
                if let Some(unit) = self.checker_mut(main, checker) {
                    unit.cpu.restore(&snapshot);
                    unit.cursor = starting_seq;
                    unit.executed = 0;
                    unit.restored = true;
                    unit.fresh = true;
                }
            }
            Command::Restore {
                unit: UnitId::Main(main),
                snapshot,
                starting_seq,
            } => {
                if let Some(unit) = self.mains.get_mut(main.index()) {
                    unit.cpu.restore(&snapshot);
                    unit.next_seq = starting_seq;
                }
            }
            Command::Suspend(UnitId::Checker { main, checker }) => {
                if let Some(unit) = self.checker_mut(main, checker) {
                    unit.running = false;
                }
            }
            Command::Wake(UnitId::Checker { main, checker }) => {
                if let Some(unit) = self.checker_mut(main, checker) {
                    unit.running = true;
                }
            }
            // Main units are gated by `should_block_commit`, and nothing is
            // in flight to squash.
            Command::Suspend(UnitId::Main(_))
            | Command::Wake(UnitId::Main(_))
            | Command::BlockCommit { .. }
            | Command::SquashAndRestart(_) => {}
        }
    }

    fn checker_mut(&mut self, main: MainId, checker: CheckerId) -> Option<&mut CheckerUnit> {
        self.mains
            .get_mut(main.index())?
            .checkers
            .get_mut(checker.index())
    }

    fn emit_injection(
        &self,
        unit: UnitId,
        category: InjectionCategory,
        timestamp: Timestamp,
        changed: bool,
        tick: Tick,
    ) {
        debug!(
            %unit,
            category = category.label(),
            timestamp = timestamp.get(),
            changed,
            tick,
            "injection fired"
        );
        self.ctx.observer().on_event(&ProtocolEvent::InjectionFired {
            unit,
            category: category.label(),
            timestamp,
            changed,
            tick,
        });
    }

    // -----------------------------------------------------------------------
    // Main units
    // -----------------------------------------------------------------------

    fn step_main(&mut self, m: usize, tick: Tick) -> Result<()> {
        let id = self.mains[m].id;
        let group = self.ctx.group(id)?;
        let view = group.main_view();

        if self.mains[m].executed >= self.options.instructions {
            if view.erroneous {
                return self.recover(m, tick);
            }
            let open = view
                .open_slot
                .and_then(|slot| group.pool().get(slot))
                .map_or(0, Segment::instructions);
            if open > 0 && self.ctx.request_checkpoint(id, &self.mains[m].cpu, tick)? {
                let unit = &mut self.mains[m];
                unit.progress.insert(view.timestamp, unit.executed);
            }
            return Ok(());
        }
        if self
            .ctx
            .should_block_commit(id, PipelineHint::default(), tick)?
        {
            return Ok(());
        }

        let unit = &self.mains[m];
        let pc = unit.cpu.pc();
        let instr = self.program.fetch(pc);
        let mut port = MainPort {
            memory: &unit.memory,
            seq: unit.next_seq,
            pc,
            access: None,
            write: None,
            syscall: None,
        };
        let Some(next) = execute(&self.program, &unit.cpu.state, &mut port)? else {
            return Ok(());
        };
        let MainPort {
            access,
            write,
            syscall,
            ..
        } = port;

        let mut event = CommitEvent::plain(pc, instr.mnemonic());
        let appends = access.is_some();
        if let Some(mut access) = access {
            if !view.erroneous {
                self.corrupt_log_entry(id, &mut access, view.timestamp, tick);
            }
            event = CommitEvent::memory(access, instr.mnemonic());
        }
        if let Some(result) = syscall {
            event = CommitEvent::syscall(
                SyscallEntry {
                    result,
                    inst_addr: pc,
                    before: self.mains[m].cpu.state.clone(),
                    after: next.clone(),
                },
                instr.mnemonic(),
            );
        }

        let staged = Cpu { state: next };
        let outcome = self.ctx.on_commit(id, event, &staged, tick)?;
        if matches!(outcome, AppendResult::RollbackRequired) {
            return self.recover(m, tick);
        }
        let unit = &mut self.mains[m];
        unit.cpu = staged;
        unit.executed += 1;
        self.committed += 1;
        if appends {
            unit.next_seq = unit.next_seq.next();
        }
        if let Some((addr, bytes)) = write {
            unit.memory.write(addr, &bytes);
        }
        if let AppendResult::Closed(trigger) = outcome {
            unit.progress.insert(view.timestamp, unit.executed);
            trace!(
                main = id.get(),
                timestamp = view.timestamp.get(),
                trigger = trigger.as_str(),
                executed = unit.executed,
                "segment closed by commit"
            );
        }
        Ok(())
    }

    /// Corrupt the copy of a main-unit access headed for the log.
    fn corrupt_log_entry(
        &mut self,
        main: MainId,
        access: &mut MemAccess,
        timestamp: Timestamp,
        tick: Tick,
    ) {
        let unit = UnitId::Main(main);
        let targeted = access.kind.is_load() || self.options.target_stores;
        if targeted
            && self
                .injector
                .opportunity(InjectionCategory::LoadStore, main.index())
        {
            self.injector.flip_payload(&mut access.payload);
            self.emit_injection(unit, InjectionCategory::LoadStore, timestamp, true, tick);
        }
        if let Some(spec) = &self.options.stuck_at {
            if spec.structure == StuckStructure::LogEntry && spec.applies_to(main, timestamp) {
                let changed = spec.force_payload(&mut access.payload);
                self.emit_injection(unit, InjectionCategory::StuckAt, timestamp, changed, tick);
            }
        }
    }

    /// Roll the main unit back to its last retired segment.
    fn recover(&mut self, m: usize, tick: Tick) -> Result<()> {
        let unit = &mut self.mains[m];
        let report = self.ctx.rollback(unit.id, &mut unit.memory, tick)?;
        unit.executed = if report.restored_to == Timestamp::ZERO {
            0
        } else {
            unit.progress
                .get(&report.restored_to)
                .copied()
                .ok_or_else(|| {
                    LockstepError::internal(format!(
                        "no closure recorded for {}",
                        report.restored_to
                    ))
                })?
        };
        unit.progress.retain(|ts, _| *ts <= report.restored_to);
        unit.cpu
            .restore(self.ctx.group(unit.id)?.committed_snapshot());
        for checker in &mut unit.checkers {
            checker.restored = false;
            checker.executed = 0;
        }
        self.ledger.record_recovery(&report);
        self.recoveries += 1;
        info!(
            main = unit.id.get(),
            restored_to = report.restored_to.get(),
            rerun = report.rerun_instructions,
            resume_at = unit.executed,
            tick,
            "main unit recovered"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkers
    // -----------------------------------------------------------------------

    fn step_checker(&mut self, m: usize, c: usize, tick: Tick) -> Result<()> {
        let main = self.mains[m].id;
        let checker = &self.mains[m].checkers[c];
        if !checker.running || !checker.restored {
            return Ok(());
        }
        let cid = checker.id;
        let Some(view) = self.ctx.group(main)?.checker_view(cid) else {
            return Ok(());
        };
        let Some(timestamp) = view.timestamp else {
            return Ok(());
        };
        if view.phase == CheckerPhase::Idle {
            return Ok(());
        }
        let unit = UnitId::Checker { main, checker: cid };
        let target = m * self.mains[m].checkers.len() + c;

        if self.mains[m].checkers[c].fresh {
            self.mains[m].checkers[c].fresh = false;
            if self
                .injector
                .opportunity(InjectionCategory::ArchState, m)
            {
                let state = &mut self.mains[m].checkers[c].cpu.state;
                let flipped = self.injector.flip_register(state, RegClass::Int, TOY_REGS);
                self.emit_injection(
                    unit,
                    InjectionCategory::ArchState,
                    timestamp,
                    flipped.is_some(),
                    tick,
                );
            }
        }

        let checker = &self.mains[m].checkers[c];
        if view.instructions.is_some_and(|total| checker.executed >= total) {
            let verdict = self
                .ctx
                .checker_finished(main, cid, &checker.cpu.state, tick)?;
            trace!(
                main = main.get(),
                checker = cid.get(),
                timestamp = verdict.timestamp.get(),
                clean = verdict.is_clean(),
                "checker finished"
            );
            let checker = &mut self.mains[m].checkers[c];
            checker.restored = false;
            checker.executed = 0;
            return Ok(());
        }
        if checker.executed >= view.committed {
            return Ok(());
        }

        let pc = checker.cpu.pc();
        let instr = self.program.fetch(pc);
        let state = checker.cpu.state.clone();
        let mut port = CheckerPort {
            ctx: &mut self.ctx,
            main,
            checker: cid,
            seq: checker.cursor,
            tick,
            consumed: false,
        };
        let Some(mut next) = execute(&self.program, &state, &mut port)? else {
            return Ok(());
        };
        let consumed = port.consumed;

        if self
            .injector
            .opportunity(InjectionCategory::TcState, target)
        {
            let flipped = self.injector.flip_register(&mut next, RegClass::Int, TOY_REGS);
            self.emit_injection(unit, InjectionCategory::TcState, timestamp, flipped.is_some(), tick);
        }
        if let Some(rd) = instr.dest() {
            if self.options.op_class_targets.contains(&instr.op_class())
                && self
                    .injector
                    .opportunity(InjectionCategory::OpClass, target)
            {
                let reg = RegisterRef {
                    class: RegClass::Int,
                    index: usize::from(rd),
                };
                let flipped = self.injector.flip_bit_of(&mut next, reg);
                self.emit_injection(unit, InjectionCategory::OpClass, timestamp, flipped.is_some(), tick);
            }
        }
        if let Some(spec) = &self.options.stuck_at {
            if spec.applies_to(main, timestamp) {
                let reg = match spec.structure {
                    StuckStructure::FuDest { op_class } if instr.op_class().id() == op_class => {
                        instr.dest().map(|rd| RegisterRef {
                            class: RegClass::Int,
                            index: usize::from(rd),
                        })
                    }
                    StuckStructure::RegisterFile { class, index } => Some(RegisterRef { class, index }),
                    _ => None,
                };
                if let Some(changed) = reg.and_then(|reg| spec.force_register(&mut next, reg)) {
                    self.emit_injection(unit, InjectionCategory::StuckAt, timestamp, changed, tick);
                }
            }
        }

        let checker = &mut self.mains[m].checkers[c];
        checker.cpu.state = next;
        checker.executed += 1;
        if consumed {
            checker.cursor = checker.cursor.next();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lockstep_core::InjectionRates;

    use super::*;

    fn options(instructions: u64) -> SimOptions {
        SimOptions {
            protocol: ProtocolConfig {
                checkers_per_main: 2,
                extra_slots_per_checker: 1,
                checkpoint_timeout: 16,
                commit_block_cycles: 2,
                ..ProtocolConfig::default()
            },
            instructions,
            max_ticks: 200_000,
            ..SimOptions::default()
        }
    }

    fn golden(instructions: u64, program: &Program) -> (ArchSnapshot, SparseMemory) {
        let mut sim = Simulation::new(options(instructions), program.clone()).unwrap();
        sim.run().unwrap();
        let main = MainId::new(0);
        (
            sim.main_state(main).unwrap().clone(),
            sim.memory(main).unwrap().clone(),
        )
    }

    #[test]
    fn test_clean_run_retires_everything() {
        let mut sim = Simulation::new(options(300), Program::demo()).unwrap();
        let summary = sim.run().unwrap();
        assert_eq!(summary.committed, 300);
        assert_eq!(summary.recoveries, 0);
        assert_eq!(summary.events.verdicts_faulted, 0);
        assert!(summary.events.retired >= 300 / 16);
        assert_eq!(summary.ledger.total_injections(), 0);
        sim.self_check().unwrap();
    }

    #[test]
    fn test_corrupted_store_rolls_back_once() {
        let mut opts = options(200);
        opts.protocol.injection = InjectionRates {
            load_store: 1.0,
            ..InjectionRates::default()
        };
        opts.protocol.checkpoint_timeout = 8;
        opts.target_stores = true;
        opts.injection_limit = Some(1);
        let program = Program::demo();
        let mut sim = Simulation::new(opts, program.clone()).unwrap();
        let summary = sim.run().unwrap();
        assert_eq!(summary.recoveries, 1);
        assert_eq!(summary.ledger.detected, 1);
        assert_eq!(summary.ledger.resolved_detected, 1);
        assert_eq!(summary.metrics.faults_detected, 1);
        sim.self_check().unwrap();

        let (state, memory) = golden(200, &program);
        let main = MainId::new(0);
        assert_eq!(sim.main_state(main).unwrap().regs(RegClass::Int), state.regs(RegClass::Int));
        assert_eq!(sim.memory(main).unwrap(), &memory);
    }

    #[test]
    fn test_budget_exhaustion_is_an_error() {
        let mut opts = options(500);
        opts.max_ticks = 10;
        let mut sim = Simulation::new(opts, Program::demo()).unwrap();
        let err = sim.run().unwrap_err();
        assert!(matches!(err, LockstepError::Internal(_)));
    }
}
