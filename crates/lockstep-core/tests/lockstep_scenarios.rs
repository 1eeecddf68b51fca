use std::sync::Arc;

use lockstep_core::{
    AppendResult, ArchSnapshot, Command, CommitEvent, LockstepContext, MemAccess, MemoryPort,
    ProtocolConfig, RegisterLayout, ReplayData, ReplayOutcome, ReplayRequest, SlotState,
    SparseMemory, ThreadState,
};
use lockstep_observability::{MetricsObserver, ProtocolEvent};
use lockstep_types::{
    CheckerId, FaultCause, MainId, MismatchReason, RegClass, SeqNum, SlotId, Timestamp, UnitId,
};

const MAIN: MainId = MainId::new(0);
const CHECKER_A: CheckerId = CheckerId::new(0);
const CHECKER_B: CheckerId = CheckerId::new(1);
const STORE_ADDR: u64 = 0x100;
const STORE_PAYLOAD: [u8; 4] = [1, 2, 3, 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    /// The checker verifies the segment and it retires.
    Retire,
    /// Rollback is forced before the checker finishes.
    ForcedRollback,
    /// The logged payload carries a flipped bit.
    CorruptPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScenarioSpec {
    scenario_id: &'static str,
    ending: Ending,
    hashing: bool,
    expected_committed: u64,
    expected_memory: [u8; 4],
    expected_rollbacks: u64,
}

const SCENARIOS: [ScenarioSpec; 4] = [
    ScenarioSpec {
        scenario_id: "LOCKSTEP-STORE-RETIRES",
        ending: Ending::Retire,
        hashing: true,
        expected_committed: 1,
        expected_memory: STORE_PAYLOAD,
        expected_rollbacks: 0,
    },
    ScenarioSpec {
        scenario_id: "LOCKSTEP-STORE-RETIRES-NO-HASH",
        ending: Ending::Retire,
        hashing: false,
        expected_committed: 1,
        expected_memory: STORE_PAYLOAD,
        expected_rollbacks: 0,
    },
    ScenarioSpec {
        scenario_id: "LOCKSTEP-STORE-FORCED-ROLLBACK",
        ending: Ending::ForcedRollback,
        hashing: true,
        expected_committed: 0,
        expected_memory: [0; 4],
        expected_rollbacks: 1,
    },
    ScenarioSpec {
        scenario_id: "LOCKSTEP-STORE-BIT-FLIP",
        ending: Ending::CorruptPayload,
        hashing: false,
        expected_committed: 0,
        expected_memory: [0; 4],
        expected_rollbacks: 1,
    },
];

struct Regs(ArchSnapshot);

impl Regs {
    fn new() -> Self {
        Self(ArchSnapshot::zeroed(RegisterLayout::default()))
    }
}

impl ThreadState for Regs {
    fn snapshot(&self) -> ArchSnapshot {
        self.0.clone()
    }

    fn restore(&mut self, snapshot: &ArchSnapshot) {
        self.0 = snapshot.clone();
    }
}

fn config(log_capacity: usize, checkers: u32, extra: u32, hashing: bool) -> ProtocolConfig {
    ProtocolConfig {
        checkers_per_main: checkers,
        extra_slots_per_checker: extra,
        log_capacity,
        checkpoint_timeout: 1000,
        hashing,
        commit_block_cycles: 0,
        ..ProtocolConfig::default()
    }
}

fn run_store_scenario(spec: ScenarioSpec) {
    let observer = Arc::new(MetricsObserver::new(256));
    let mut ctx = LockstepContext::new(config(8, 1, 0, spec.hashing))
        .unwrap()
        .with_observer(observer.clone());
    let mut memory = SparseMemory::new();
    let mut regs = Regs::new();
    ctx.start(MAIN, &regs, 0).unwrap();

    // Main unit: one 4-byte store, then an explicit checkpoint.
    let prior = memory.read(STORE_ADDR, 4);
    memory.write(STORE_ADDR, &STORE_PAYLOAD);
    regs.0.set_reg(RegClass::Int, 2, 4);
    let mut logged = STORE_PAYLOAD.to_vec();
    if spec.ending == Ending::CorruptPayload {
        logged[3] ^= 1 << 5;
    }
    let access = MemAccess::store(STORE_ADDR, logged, prior, 0x40, SeqNum::FIRST);
    let appended = ctx
        .on_commit(MAIN, CommitEvent::memory(access, "str"), &regs, 1)
        .unwrap();
    assert_eq!(
        appended,
        AppendResult::Recorded { full: false },
        "scenario {} store must fit the 8-unit log",
        spec.scenario_id
    );
    assert!(ctx.request_checkpoint(MAIN, &regs, 2).unwrap());

    let checker_unit = UnitId::Checker {
        main: MAIN,
        checker: CHECKER_A,
    };
    let restored = ctx.commands_due(2).into_iter().any(|cmd| {
        matches!(cmd, Command::Restore { unit, starting_seq, .. }
            if unit == checker_unit && starting_seq == SeqNum::FIRST)
    });
    assert!(restored, "scenario {} checker restore missing", spec.scenario_id);

    if spec.ending == Ending::ForcedRollback {
        let report = ctx.rollback(MAIN, &mut memory, 3).unwrap();
        assert_eq!(report.restored_to, Timestamp::ZERO);
        assert_eq!(report.undone_segments, vec![Timestamp::new(1)]);
        assert_eq!(report.writebacks, 1);
        assert_eq!(report.detection_latency, None, "forced rollback has no fault");
    } else {
        // Checker: replay the store against the log, then finish.
        let req = ReplayRequest::write(SeqNum::FIRST, STORE_ADDR, STORE_PAYLOAD.to_vec());
        let outcome = ctx.replay(MAIN, CHECKER_A, &req, 4).unwrap();
        let verdict = ctx
            .checker_finished(MAIN, CHECKER_A, &regs.snapshot(), 5)
            .unwrap();
        if spec.ending == Ending::Retire {
            assert_eq!(
                outcome,
                ReplayOutcome::Data(ReplayData::Verified),
                "scenario {} replay comparison",
                spec.scenario_id
            );
            assert!(verdict.is_clean(), "scenario {} verdict", spec.scenario_id);
        } else {
            assert!(
                matches!(outcome, ReplayOutcome::Mismatched { ref filler, .. } if filler == &vec![0; 4]),
                "scenario {} expected a mismatch, got {outcome:?}",
                spec.scenario_id
            );
            assert_eq!(
                verdict.cause,
                Some(FaultCause::Replay(MismatchReason::WriteData)),
                "scenario {} cause",
                spec.scenario_id
            );
            assert!(ctx.group(MAIN).unwrap().main_view().erroneous);
            let next = ctx
                .on_commit(MAIN, CommitEvent::plain(0x44, "nop"), &regs, 6)
                .unwrap();
            assert_eq!(next, AppendResult::RollbackRequired);
            let report = ctx.rollback(MAIN, &mut memory, 7).unwrap();
            assert_eq!(report.detection_latency, Some(2));
            assert!(
                ctx.commands_due(7)
                    .iter()
                    .any(|cmd| matches!(cmd, Command::SquashAndRestart(m) if *m == MAIN)),
                "scenario {} squash missing",
                spec.scenario_id
            );
        }
    }

    let view = ctx.group(MAIN).unwrap().main_view();
    assert_eq!(
        view.committed.get(),
        spec.expected_committed,
        "scenario {} committed timestamp",
        spec.scenario_id
    );
    assert_eq!(
        memory.read(STORE_ADDR, 4),
        spec.expected_memory.to_vec(),
        "scenario {} memory after run",
        spec.scenario_id
    );
    let snap = ctx.metrics_snapshot();
    assert_eq!(
        snap.rollbacks, spec.expected_rollbacks,
        "scenario {} rollbacks",
        spec.scenario_id
    );
    assert_eq!(
        observer.metrics().snapshot().rollbacks,
        spec.expected_rollbacks,
        "scenario {} observed rollbacks",
        spec.scenario_id
    );
    assert!(!view.erroneous, "scenario {} main unit recovered", spec.scenario_id);
}

#[test]
fn test_store_scenarios() {
    for spec in SCENARIOS {
        run_store_scenario(spec);
    }
}

#[test]
fn test_cached_segment_waits_for_its_own_checker() {
    let scenario_id = "LOCKSTEP-COPY-PENDING-HANDOFF";
    let mut ctx = LockstepContext::new(config(64, 2, 1, false)).unwrap();
    let mut regs = Regs::new();
    ctx.start(MAIN, &regs, 0).unwrap();

    for (tick, ts) in [(1, 1_u64), (2, 2)] {
        regs.0.set_reg(RegClass::Int, 0, ts);
        ctx.on_commit(MAIN, CommitEvent::plain(ts * 4, "add"), &regs, tick)
            .unwrap();
        assert!(ctx.request_checkpoint(MAIN, &regs, tick).unwrap());
    }

    let group = ctx.group(MAIN).unwrap();
    let cached = group.pool().get(SlotId::new(CHECKER_A, 1)).unwrap();
    assert_eq!(
        (cached.state(), cached.timestamp()),
        (SlotState::CopyPending, Timestamp::new(2)),
        "scenario {scenario_id}: T2 parked behind checker A"
    );
    let b = group.checker_view(CHECKER_B).unwrap();
    assert_eq!(b.timestamp, Some(Timestamp::new(3)));
    assert_eq!(b.slot_state, SlotState::Filling);
    let expected_t1 = group
        .pool()
        .get(SlotId::primary(CHECKER_A))
        .and_then(|seg| seg.expected_snapshot().cloned())
        .unwrap();
    let t2_start = cached.starting_snapshot().clone();
    ctx.commands_due(2);

    let verdict = ctx
        .checker_finished(MAIN, CHECKER_A, &expected_t1, 3)
        .unwrap();
    assert!(verdict.is_clean());
    let group = ctx.group(MAIN).unwrap();
    assert_eq!(group.main_view().committed, Timestamp::new(1));
    let a = group.checker_view(CHECKER_A).unwrap();
    assert_eq!(
        (a.slot_state, a.timestamp),
        (SlotState::AwaitingChecker, Some(Timestamp::new(2))),
        "scenario {scenario_id}: T2 handed to checker A"
    );
    assert_eq!(
        group.checker_view(CHECKER_B).unwrap().timestamp,
        Some(Timestamp::new(3)),
        "scenario {scenario_id}: checker B keeps T3"
    );
    let unit_a = UnitId::Checker {
        main: MAIN,
        checker: CHECKER_A,
    };
    let due = ctx.commands_due(3);
    assert!(
        due.iter().any(|cmd| matches!(cmd, Command::Restore { unit, snapshot, .. }
            if *unit == unit_a && **snapshot == t2_start)),
        "scenario {scenario_id}: restore of T2 start state"
    );
    assert!(ctx.commands_due(4).contains(&Command::Wake(unit_a)));

    let expected_t2 = ctx
        .group(MAIN)
        .unwrap()
        .pool()
        .get(SlotId::primary(CHECKER_A))
        .and_then(|seg| seg.expected_snapshot().cloned())
        .unwrap();
    ctx.checker_finished(MAIN, CHECKER_A, &expected_t2, 5)
        .unwrap();
    assert_eq!(
        ctx.group(MAIN).unwrap().main_view().committed,
        Timestamp::new(2),
        "scenario {scenario_id}: T2 retired after T1"
    );
}

#[test]
fn test_syscall_segment_faults_without_rollback() {
    let mut ctx = LockstepContext::new(config(64, 1, 0, false)).unwrap();
    let regs = Regs::new();
    ctx.start(MAIN, &regs, 0).unwrap();
    let entry = lockstep_core::SyscallEntry {
        result: 11,
        inst_addr: 0x80,
        before: regs.snapshot(),
        after: regs.snapshot(),
    };
    let closed = ctx
        .on_commit(MAIN, CommitEvent::syscall(entry, "svc"), &regs, 1)
        .unwrap();
    assert_eq!(closed, AppendResult::Closed(lockstep_types::CloseTrigger::Syscall));

    let replay = ctx
        .checker_syscall(MAIN, CHECKER_A, 0x84, &regs.snapshot(), 2)
        .unwrap()
        .expect("closed segment answers");
    assert!(replay.diverged);
    let verdict = ctx
        .checker_finished(MAIN, CHECKER_A, &regs.snapshot(), 3)
        .unwrap();
    assert_eq!(verdict.cause, Some(FaultCause::SyscallDivergence));
    let view = ctx.group(MAIN).unwrap().main_view();
    assert!(!view.erroneous, "system-call segments never roll back");
    assert_eq!(view.committed, Timestamp::new(1));
    assert_eq!(ctx.metrics_snapshot().faults_accepted, 1);
}

#[test]
fn test_events_follow_segment_lifecycle() {
    let observer = Arc::new(MetricsObserver::new(64));
    let mut ctx = LockstepContext::new(config(64, 1, 0, false))
        .unwrap()
        .with_observer(observer.clone());
    let regs = Regs::new();
    ctx.start(MAIN, &regs, 0).unwrap();
    ctx.on_commit(MAIN, CommitEvent::plain(0, "nop"), &regs, 1)
        .unwrap();
    ctx.request_checkpoint(MAIN, &regs, 2).unwrap();
    ctx.checker_finished(MAIN, CHECKER_A, &regs.snapshot(), 3)
        .unwrap();

    let kinds: Vec<_> = observer
        .log()
        .snapshot()
        .iter()
        .map(ProtocolEvent::kind_label)
        .collect();
    let position = |label: &str| kinds.iter().position(|k| *k == label);
    let closed = position("segment_closed").expect("closure event");
    let verdict = position("verdict").expect("verdict event");
    let retired = position("retired").expect("retire event");
    assert!(closed < verdict && verdict < retired, "order {kinds:?}");
    assert_eq!(
        kinds.iter().filter(|k| **k == "slot_assigned").count(),
        2,
        "first slot at start, second after retirement"
    );
}
