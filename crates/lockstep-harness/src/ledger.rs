//! Injection accounting.
//!
//! The [`InjectionLedger`] watches the protocol event stream and attributes
//! every verdict to the injections that landed in its segment. Each
//! value-changing injection ends in exactly one bucket:
//!
//! - **detected**: its segment came out `Faulted`;
//! - **undetected**: its segment verified clean anyway;
//! - **squashed**: a rollback discarded its segment before a verdict;
//! - **live**: no verdict yet at shutdown.
//!
//! [`InjectionLedger::self_check`] verifies that partition at shutdown.

use std::collections::BTreeMap;

use lockstep_core::RecoveryReport;
use lockstep_error::{LockstepError, Result};
use lockstep_observability::{ProtocolEvent, ProtocolObserver};
use lockstep_types::{MainId, Timestamp};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::injection::InjectionCategory;

#[derive(Debug, Clone, Copy, Default)]
struct LiveSegment {
    changed: u64,
    unchanged: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    live: BTreeMap<(MainId, Timestamp), LiveSegment>,
    injected: BTreeMap<&'static str, u64>,
    changed: u64,
    unchanged: u64,
    detected: u64,
    false_positives: u64,
    undetected: u64,
    checkpoint_only_unchanged: u64,
    resolved_detected: u64,
    resolved_undetected: u64,
    squashed: u64,
    recoveries: u64,
    rerun_total: u64,
    rerun_min: Option<u64>,
    rerun_max: u64,
}

/// Point-in-time copy of the ledger counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    /// Injections per category label.
    pub injected: BTreeMap<&'static str, u64>,
    pub changed: u64,
    pub unchanged: u64,
    /// Faulted verdicts on segments carrying a changed injection.
    pub detected: u64,
    /// Faulted verdicts on segments without one.
    pub false_positives: u64,
    /// Clean verdicts on segments carrying a changed injection.
    pub undetected: u64,
    /// Verdicts on segments whose only injections left the value unchanged.
    pub checkpoint_only_unchanged: u64,
    /// Changed injections resolved by a faulted verdict.
    pub resolved_detected: u64,
    /// Changed injections resolved by a clean verdict.
    pub resolved_undetected: u64,
    /// Changed injections discarded by rollback.
    pub squashed: u64,
    /// Changed injections in segments still awaiting a verdict.
    pub live_changed: u64,
    pub live_segments: usize,
    pub recoveries: u64,
    pub rerun_total: u64,
    pub rerun_min: u64,
    pub rerun_max: u64,
}

impl LedgerSnapshot {
    pub fn injected(&self, category: InjectionCategory) -> u64 {
        self.injected.get(category.label()).copied().unwrap_or(0)
    }

    pub fn total_injections(&self) -> u64 {
        self.changed + self.unchanged
    }

    /// Injections that come from a rate schedule and record a lapse.
    pub fn scheduled_injections(&self) -> u64 {
        self.injected
            .iter()
            .filter(|(label, _)| {
                InjectionCategory::from_label(label).is_some_and(InjectionCategory::is_scheduled)
            })
            .map(|(_, count)| count)
            .sum()
    }
}

/// Observer that attributes verdicts to injections.
#[derive(Debug, Default)]
pub struct InjectionLedger {
    state: Mutex<LedgerState>,
}

impl InjectionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one rollback and the instructions it makes the main unit rerun.
    pub fn record_recovery(&self, report: &RecoveryReport) {
        let mut st = self.state.lock();
        st.recoveries += 1;
        st.rerun_total += report.rerun_instructions;
        st.rerun_max = st.rerun_max.max(report.rerun_instructions);
        st.rerun_min = Some(
            st.rerun_min
                .map_or(report.rerun_instructions, |min| min.min(report.rerun_instructions)),
        );
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let st = self.state.lock();
        LedgerSnapshot {
            injected: st.injected.clone(),
            changed: st.changed,
            unchanged: st.unchanged,
            detected: st.detected,
            false_positives: st.false_positives,
            undetected: st.undetected,
            checkpoint_only_unchanged: st.checkpoint_only_unchanged,
            resolved_detected: st.resolved_detected,
            resolved_undetected: st.resolved_undetected,
            squashed: st.squashed,
            live_changed: st.live.values().map(|seg| seg.changed).sum(),
            live_segments: st.live.len(),
            recoveries: st.recoveries,
            rerun_total: st.rerun_total,
            rerun_min: st.rerun_min.unwrap_or(0),
            rerun_max: st.rerun_max,
        }
    }

    /// Shutdown self-check.
    ///
    /// `lapses` is the number of lapses the injector recorded; it must match
    /// the scheduled injections seen here, and every changed injection must
    /// be detected, undetected, squashed, or live.
    pub fn self_check(&self, lapses: usize) -> Result<LedgerSnapshot> {
        let snap = self.snapshot();
        let resolved =
            snap.resolved_detected + snap.resolved_undetected + snap.squashed + snap.live_changed;
        let lapses = lapses as u64;
        if resolved != snap.changed || lapses != snap.scheduled_injections() {
            return Err(LockstepError::InjectionAccounting {
                fired: snap.changed,
                detected: snap.resolved_detected,
                undetected: snap.resolved_undetected,
                squashed: snap.squashed,
                live: snap.live_changed,
                lapses,
            });
        }
        Ok(snap)
    }
}

impl ProtocolObserver for InjectionLedger {
    fn on_event(&self, event: &ProtocolEvent) {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        match event {
            ProtocolEvent::InjectionFired {
                unit,
                category,
                timestamp,
                changed,
                ..
            } => {
                *st.injected.entry(*category).or_default() += 1;
                let seg = st.live.entry((unit.main(), *timestamp)).or_default();
                if *changed {
                    seg.changed += 1;
                    st.changed += 1;
                } else {
                    seg.unchanged += 1;
                    st.unchanged += 1;
                }
            }
            ProtocolEvent::Verdict {
                main,
                timestamp,
                cause,
                ..
            } => {
                let seg = st.live.remove(&(*main, *timestamp)).unwrap_or_default();
                match (cause.is_some(), seg.changed > 0) {
                    (true, true) => {
                        st.detected += 1;
                        st.resolved_detected += seg.changed;
                    }
                    (true, false) => {
                        st.false_positives += 1;
                        if seg.unchanged > 0 {
                            st.checkpoint_only_unchanged += 1;
                        }
                        debug!(
                            main = main.get(),
                            timestamp = timestamp.get(),
                            "faulted verdict without a changed injection"
                        );
                    }
                    (false, true) => {
                        st.undetected += 1;
                        st.resolved_undetected += seg.changed;
                        debug!(
                            main = main.get(),
                            timestamp = timestamp.get(),
                            injections = seg.changed,
                            "injection escaped verification"
                        );
                    }
                    (false, false) => {
                        if seg.unchanged > 0 {
                            st.checkpoint_only_unchanged += 1;
                        }
                    }
                }
            }
            ProtocolEvent::RollbackCompleted {
                main, restored_to, ..
            } => {
                let doomed: Vec<_> = st
                    .live
                    .range((*main, restored_to.next())..=(*main, Timestamp::new(u64::MAX)))
                    .map(|(key, _)| *key)
                    .collect();
                for key in doomed {
                    if let Some(seg) = st.live.remove(&key) {
                        st.squashed += seg.changed;
                    }
                }
            }
            _ => {}
        }
    }
}
