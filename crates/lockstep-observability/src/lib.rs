//! Protocol event tracing for lockstep checkpoint verification.
//!
//! Every state transition of the slot scheduler, replay engine, and
//! rollback manager is emitted as a [`ProtocolEvent`] to a
//! [`ProtocolObserver`]. The fault-injection harness consumes the same
//! stream to attribute verdicts to injections.
//!
//! - **Zero-cost when unused:** the default [`NoOpObserver`] is inlined.
//! - **Non-blocking:** observers run inline with the scheduler and must not
//!   call back into it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lockstep_types::{
    CheckerId, CloseTrigger, FaultCause, MainId, MismatchReason, SlotId, Tick, Timestamp, UnitId,
};
use parking_lot::Mutex;
use serde::Serialize;

// ---------------------------------------------------------------------------
// ProtocolEvent
// ---------------------------------------------------------------------------

/// A single state transition emitted by the lockstep core or harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProtocolEvent {
    /// A free slot was given to a new segment.
    SlotAssigned {
        main: MainId,
        slot: SlotId,
        timestamp: Timestamp,
        tick: Tick,
    },

    /// The main unit closed the segment it was filling.
    SegmentClosed {
        main: MainId,
        slot: SlotId,
        timestamp: Timestamp,
        trigger: CloseTrigger,
        records: usize,
        instructions: u64,
        tick: Tick,
    },

    /// A checker became active on its primary slot.
    CheckerWoken {
        main: MainId,
        checker: CheckerId,
        timestamp: Timestamp,
        tick: Tick,
    },

    /// A checker was suspended, either between segments or by the sleep
    /// guard while waiting for the log to fill.
    CheckerSuspended {
        main: MainId,
        checker: CheckerId,
        sleep_guard: bool,
        tick: Tick,
    },

    /// A replay request did not match the log.
    ReplayMismatch {
        main: MainId,
        checker: CheckerId,
        timestamp: Timestamp,
        reason: MismatchReason,
        record_index: usize,
        tick: Tick,
    },

    /// A checker finished its segment and the verdict was computed.
    Verdict {
        main: MainId,
        checker: CheckerId,
        timestamp: Timestamp,
        cause: Option<FaultCause>,
        tick: Tick,
    },

    /// A verified segment became the new baseline.
    Retired {
        main: MainId,
        timestamp: Timestamp,
        /// Whether the segment waited in the pending-retirement map.
        buffered: bool,
        tick: Tick,
    },

    /// A faulted segment reached the retire pass and marked the main unit
    /// erroneous.
    FaultDetected {
        main: MainId,
        timestamp: Timestamp,
        latency_ticks: u64,
        tick: Tick,
    },

    /// Rollback undid every segment newer than the last retired one.
    RollbackCompleted {
        main: MainId,
        restored_to: Timestamp,
        undone_segments: Vec<Timestamp>,
        undone_ops: u64,
        tick: Tick,
    },

    /// The harness corrupted state belonging to a segment.
    InjectionFired {
        unit: UnitId,
        category: &'static str,
        timestamp: Timestamp,
        changed: bool,
        tick: Tick,
    },
}

impl ProtocolEvent {
    /// Extract the tick from any event variant.
    #[must_use]
    pub fn tick(&self) -> Tick {
        match self {
            Self::SlotAssigned { tick, .. }
            | Self::SegmentClosed { tick, .. }
            | Self::CheckerWoken { tick, .. }
            | Self::CheckerSuspended { tick, .. }
            | Self::ReplayMismatch { tick, .. }
            | Self::Verdict { tick, .. }
            | Self::Retired { tick, .. }
            | Self::FaultDetected { tick, .. }
            | Self::RollbackCompleted { tick, .. }
            | Self::InjectionFired { tick, .. } => *tick,
        }
    }

    /// The replication group the event belongs to.
    #[must_use]
    pub fn main(&self) -> MainId {
        match self {
            Self::SlotAssigned { main, .. }
            | Self::SegmentClosed { main, .. }
            | Self::CheckerWoken { main, .. }
            | Self::CheckerSuspended { main, .. }
            | Self::ReplayMismatch { main, .. }
            | Self::Verdict { main, .. }
            | Self::Retired { main, .. }
            | Self::FaultDetected { main, .. }
            | Self::RollbackCompleted { main, .. } => *main,
            Self::InjectionFired { unit, .. } => unit.main(),
        }
    }

    /// Whether this event reports a detected problem.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        match self {
            Self::ReplayMismatch { .. } | Self::FaultDetected { .. } => true,
            Self::Verdict { cause, .. } => cause.is_some(),
            _ => false,
        }
    }

    /// Stable label used for per-kind counters.
    #[must_use]
    pub const fn kind_label(&self) -> &'static str {
        match self {
            Self::SlotAssigned { .. } => "slot_assigned",
            Self::SegmentClosed { .. } => "segment_closed",
            Self::CheckerWoken { .. } => "checker_woken",
            Self::CheckerSuspended { .. } => "checker_suspended",
            Self::ReplayMismatch { .. } => "replay_mismatch",
            Self::Verdict { .. } => "verdict",
            Self::Retired { .. } => "retired",
            Self::FaultDetected { .. } => "fault_detected",
            Self::RollbackCompleted { .. } => "rollback_completed",
            Self::InjectionFired { .. } => "injection_fired",
        }
    }
}

// ---------------------------------------------------------------------------
// ProtocolObserver
// ---------------------------------------------------------------------------

/// Observer trait for protocol events.
///
/// Implementations MUST NOT call back into the scheduler; they run inline
/// with state transitions.
pub trait ProtocolObserver: Send + Sync {
    /// Called when a protocol event occurs.
    fn on_event(&self, event: &ProtocolEvent);
}

/// No-op observer. Default when observability is not configured.
#[derive(Debug, Clone, Copy)]
pub struct NoOpObserver;

impl ProtocolObserver for NoOpObserver {
    #[inline(always)]
    fn on_event(&self, _event: &ProtocolEvent) {}
}

/// Forwards every event to each registered observer in order.
#[derive(Default, Clone)]
pub struct FanoutObserver {
    targets: Vec<Arc<dyn ProtocolObserver>>,
}

impl FanoutObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observer to the fan-out list.
    #[must_use]
    pub fn with(mut self, observer: Arc<dyn ProtocolObserver>) -> Self {
        self.targets.push(observer);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl ProtocolObserver for FanoutObserver {
    fn on_event(&self, event: &ProtocolEvent) {
        for target in &self.targets {
            target.on_event(event);
        }
    }
}

// ---------------------------------------------------------------------------
// EventRing: bounded event storage
// ---------------------------------------------------------------------------

/// Fixed-capacity ring buffer for recent protocol events.
///
/// When full, the oldest event is overwritten.
pub struct EventRing {
    events: Mutex<RingBuf>,
}

struct RingBuf {
    buf: Vec<ProtocolEvent>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl RingBuf {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, event: ProtocolEvent) {
        if self.capacity == 0 {
            return;
        }
        let idx = (self.head + self.len) % self.capacity;
        if self.buf.len() < self.capacity {
            self.buf.push(event);
        } else {
            self.buf[idx] = event;
        }
        if self.len == self.capacity {
            self.head = (self.head + 1) % self.capacity;
        } else {
            self.len += 1;
        }
    }

    fn ordered(&self) -> Vec<ProtocolEvent> {
        (0..self.len)
            .map(|i| self.buf[(self.head + i) % self.capacity].clone())
            .collect()
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.head = 0;
        self.len = 0;
    }
}

impl EventRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(RingBuf::new(capacity)),
        }
    }

    pub fn push(&self, event: ProtocolEvent) {
        self.events.lock().push(event);
    }

    /// Return all stored events in chronological order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProtocolEvent> {
        self.events.lock().ordered()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.events.lock().capacity
    }
}

// ---------------------------------------------------------------------------
// ProtocolMetrics: aggregated counts
// ---------------------------------------------------------------------------

/// Aggregated per-observer event statistics.
pub struct ProtocolMetrics {
    pub events_total: AtomicU64,
    pub segments_closed: AtomicU64,
    pub verdicts_clean: AtomicU64,
    pub verdicts_faulted: AtomicU64,
    pub replay_mismatches: AtomicU64,
    pub retired: AtomicU64,
    pub retired_buffered: AtomicU64,
    pub rollbacks: AtomicU64,
    pub undone_ops: AtomicU64,
    pub injections: AtomicU64,
    /// Closures keyed by trigger label.
    closures_by_trigger: Mutex<BTreeMap<&'static str, u64>>,
}

impl ProtocolMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            segments_closed: AtomicU64::new(0),
            verdicts_clean: AtomicU64::new(0),
            verdicts_faulted: AtomicU64::new(0),
            replay_mismatches: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            retired_buffered: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            undone_ops: AtomicU64::new(0),
            injections: AtomicU64::new(0),
            closures_by_trigger: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record an event, updating all relevant counters.
    pub fn record(&self, event: &ProtocolEvent) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        match event {
            ProtocolEvent::SegmentClosed { trigger, .. } => {
                self.segments_closed.fetch_add(1, Ordering::Relaxed);
                *self
                    .closures_by_trigger
                    .lock()
                    .entry(trigger.as_str())
                    .or_insert(0) += 1;
            }
            ProtocolEvent::Verdict { cause, .. } => {
                if cause.is_some() {
                    self.verdicts_faulted.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.verdicts_clean.fetch_add(1, Ordering::Relaxed);
                }
            }
            ProtocolEvent::ReplayMismatch { .. } => {
                self.replay_mismatches.fetch_add(1, Ordering::Relaxed);
            }
            ProtocolEvent::Retired { buffered, .. } => {
                self.retired.fetch_add(1, Ordering::Relaxed);
                if *buffered {
                    self.retired_buffered.fetch_add(1, Ordering::Relaxed);
                }
            }
            ProtocolEvent::RollbackCompleted { undone_ops, .. } => {
                self.rollbacks.fetch_add(1, Ordering::Relaxed);
                self.undone_ops.fetch_add(*undone_ops, Ordering::Relaxed);
            }
            ProtocolEvent::InjectionFired { .. } => {
                self.injections.fetch_add(1, Ordering::Relaxed);
            }
            ProtocolEvent::SlotAssigned { .. }
            | ProtocolEvent::CheckerWoken { .. }
            | ProtocolEvent::CheckerSuspended { .. }
            | ProtocolEvent::FaultDetected { .. } => {}
        }
    }

    pub fn reset(&self) {
        self.events_total.store(0, Ordering::Relaxed);
        self.segments_closed.store(0, Ordering::Relaxed);
        self.verdicts_clean.store(0, Ordering::Relaxed);
        self.verdicts_faulted.store(0, Ordering::Relaxed);
        self.replay_mismatches.store(0, Ordering::Relaxed);
        self.retired.store(0, Ordering::Relaxed);
        self.retired_buffered.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
        self.undone_ops.store(0, Ordering::Relaxed);
        self.injections.store(0, Ordering::Relaxed);
        self.closures_by_trigger.lock().clear();
    }

    /// Snapshot all metrics as a serializable summary.
    #[must_use]
    pub fn snapshot(&self) -> ProtocolMetricsSnapshot {
        ProtocolMetricsSnapshot {
            events_total: self.events_total.load(Ordering::Relaxed),
            segments_closed: self.segments_closed.load(Ordering::Relaxed),
            verdicts_clean: self.verdicts_clean.load(Ordering::Relaxed),
            verdicts_faulted: self.verdicts_faulted.load(Ordering::Relaxed),
            replay_mismatches: self.replay_mismatches.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            retired_buffered: self.retired_buffered.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            undone_ops: self.undone_ops.load(Ordering::Relaxed),
            injections: self.injections.load(Ordering::Relaxed),
            closures_by_trigger: self.closures_by_trigger.lock().clone(),
        }
    }
}

impl Default for ProtocolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of [`ProtocolMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolMetricsSnapshot {
    pub events_total: u64,
    pub segments_closed: u64,
    pub verdicts_clean: u64,
    pub verdicts_faulted: u64,
    pub replay_mismatches: u64,
    pub retired: u64,
    pub retired_buffered: u64,
    pub rollbacks: u64,
    pub undone_ops: u64,
    pub injections: u64,
    pub closures_by_trigger: BTreeMap<&'static str, u64>,
}

// ---------------------------------------------------------------------------
// MetricsObserver: observer that records to both metrics and ring buffer
// ---------------------------------------------------------------------------

/// Combined observer that aggregates counts and keeps the recent events.
pub struct MetricsObserver {
    metrics: ProtocolMetrics,
    log: EventRing,
}

impl MetricsObserver {
    #[must_use]
    pub fn new(log_capacity: usize) -> Self {
        Self {
            metrics: ProtocolMetrics::new(),
            log: EventRing::new(log_capacity),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &ProtocolMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn log(&self) -> &EventRing {
        &self.log
    }

    pub fn reset(&self) {
        self.metrics.reset();
        self.log.clear();
    }
}

impl ProtocolObserver for MetricsObserver {
    fn on_event(&self, event: &ProtocolEvent) {
        self.metrics.record(event);
        self.log.push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn retired(ts: u64, buffered: bool) -> ProtocolEvent {
        ProtocolEvent::Retired {
            main: MainId::new(0),
            timestamp: Timestamp::new(ts),
            buffered,
            tick: ts * 10,
        }
    }

    fn closed(trigger: CloseTrigger) -> ProtocolEvent {
        ProtocolEvent::SegmentClosed {
            main: MainId::new(1),
            slot: SlotId::primary(CheckerId::new(0)),
            timestamp: Timestamp::new(1),
            trigger,
            records: 3,
            instructions: 40,
            tick: 99,
        }
    }

    #[test]
    fn noop_observer_accepts_events() {
        NoOpObserver.on_event(&retired(1, false));
    }

    #[test]
    fn ring_keeps_order_and_wraps() {
        let ring = EventRing::new(2);
        ring.push(retired(1, false));
        ring.push(retired(2, false));
        ring.push(retired(3, false));
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(matches!(&snap[0], ProtocolEvent::Retired { timestamp, .. } if timestamp.get() == 2));
        assert!(matches!(&snap[1], ProtocolEvent::Retired { timestamp, .. } if timestamp.get() == 3));
    }

    #[test]
    fn ring_zero_capacity_drops_everything() {
        let ring = EventRing::new(0);
        ring.push(retired(1, false));
        assert!(ring.is_empty());
    }

    #[test]
    fn ring_clear_after_wrap() {
        let ring = EventRing::new(3);
        for ts in 1..=7 {
            ring.push(retired(ts, false));
        }
        ring.clear();
        assert!(ring.is_empty());
        ring.push(retired(9, false));
        assert_eq!(ring.snapshot().len(), 1);
    }

    #[test]
    fn metrics_count_by_kind() {
        let m = ProtocolMetrics::new();
        m.record(&closed(CloseTrigger::Timeout));
        m.record(&closed(CloseTrigger::Timeout));
        m.record(&closed(CloseTrigger::Capacity));
        m.record(&retired(1, false));
        m.record(&retired(2, true));
        m.record(&ProtocolEvent::Verdict {
            main: MainId::new(0),
            checker: CheckerId::new(0),
            timestamp: Timestamp::new(3),
            cause: Some(FaultCause::ArchDivergence),
            tick: 5,
        });
        let snap = m.snapshot();
        assert_eq!(snap.events_total, 6);
        assert_eq!(snap.segments_closed, 3);
        assert_eq!(snap.closures_by_trigger.get("timeout"), Some(&2));
        assert_eq!(snap.closures_by_trigger.get("capacity"), Some(&1));
        assert_eq!(snap.retired, 2);
        assert_eq!(snap.retired_buffered, 1);
        assert_eq!(snap.verdicts_faulted, 1);
        assert_eq!(snap.verdicts_clean, 0);
    }

    #[test]
    fn metrics_reset() {
        let m = ProtocolMetrics::new();
        m.record(&closed(CloseTrigger::Syscall));
        m.reset();
        let snap = m.snapshot();
        assert_eq!(snap.events_total, 0);
        assert!(snap.closures_by_trigger.is_empty());
    }

    #[test]
    fn fanout_reaches_every_target() {
        let a = Arc::new(MetricsObserver::new(4));
        let b = Arc::new(MetricsObserver::new(4));
        let fan = FanoutObserver::new().with(a.clone()).with(b.clone());
        assert_eq!(fan.len(), 2);
        fan.on_event(&retired(1, false));
        assert_eq!(a.log().len(), 1);
        assert_eq!(b.metrics().snapshot().retired, 1);
    }

    #[test]
    fn event_accessors() {
        let event = ProtocolEvent::InjectionFired {
            unit: UnitId::Checker {
                main: MainId::new(2),
                checker: CheckerId::new(1),
            },
            category: "tc_state",
            timestamp: Timestamp::new(4),
            changed: true,
            tick: 77,
        };
        assert_eq!(event.tick(), 77);
        assert_eq!(event.main(), MainId::new(2));
        assert!(!event.is_fault());
        assert_eq!(event.kind_label(), "injection_fired");
    }

    #[test]
    fn snapshot_serializes() {
        let m = ProtocolMetrics::new();
        m.record(&closed(CloseTrigger::Explicit));
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"segments_closed\":1"));
        assert!(json.contains("\"explicit\":1"));
    }
}
