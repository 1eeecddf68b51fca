//! Lockstep protocol metrics.
//!
//! Atomic counters for segment closures, verdicts, rollbacks, and stalls.
//! Each [`crate::LockstepContext`] owns one instance; [`GLOBAL_LOCKSTEP_METRICS`]
//! aggregates finished runs through [`LockstepMetrics::absorb`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use lockstep_types::CloseTrigger;

// ---------------------------------------------------------------------------
// Metric counters
// ---------------------------------------------------------------------------

/// Process-wide aggregate of every run folded in with `absorb`.
pub static GLOBAL_LOCKSTEP_METRICS: LockstepMetrics = LockstepMetrics::new();

const TRIGGERS: usize = CloseTrigger::ALL.len();

/// Atomic counters tracking checkpoint and recovery activity.
pub struct LockstepMetrics {
    /// Segment closures, indexed by [`CloseTrigger::index`].
    closures: [AtomicU64; TRIGGERS],
    /// Segments whose verdict came out clean.
    pub correct_checkpoints: AtomicU64,
    /// Verdicts that found any divergence.
    pub erroneous_checkpoints: AtomicU64,
    /// Divergences first seen on a checker write.
    pub detected_write: AtomicU64,
    /// Divergences first seen on a checker read (address, size, kind, exhaustion).
    pub detected_read: AtomicU64,
    /// Divergences only visible in the final register state.
    pub detected_arch: AtomicU64,
    /// Divergences only visible in the digests.
    pub detected_digest: AtomicU64,
    pub detected_syscall: AtomicU64,
    /// Faulted segments that marked their main unit erroneous.
    pub faults_detected: AtomicU64,
    /// Faulted segments accepted because rollback is disabled.
    pub faults_accepted: AtomicU64,
    pub rollbacks: AtomicU64,
    pub writebacks_total: AtomicU64,
    writebacks_min: AtomicU64,
    pub writebacks_max: AtomicU64,
    pub latency_total: AtomicU64,
    latency_min: AtomicU64,
    pub latency_max: AtomicU64,
    /// Cycles the main unit spent with commit blocked after a checkpoint.
    pub stall_commit_blocked: AtomicU64,
    /// Cycles the main unit slept waiting for a free slot.
    pub stall_no_free_checker: AtomicU64,
    /// Cycles the pipeline reported it had to wait.
    pub stall_waiting: AtomicU64,
    /// Times a checker was suspended behind a still-filling log.
    pub sleep_guard_stalls: AtomicU64,
}

impl LockstepMetrics {
    /// Create a zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            closures: [const { AtomicU64::new(0) }; TRIGGERS],
            correct_checkpoints: AtomicU64::new(0),
            erroneous_checkpoints: AtomicU64::new(0),
            detected_write: AtomicU64::new(0),
            detected_read: AtomicU64::new(0),
            detected_arch: AtomicU64::new(0),
            detected_digest: AtomicU64::new(0),
            detected_syscall: AtomicU64::new(0),
            faults_detected: AtomicU64::new(0),
            faults_accepted: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            writebacks_total: AtomicU64::new(0),
            writebacks_min: AtomicU64::new(u64::MAX),
            writebacks_max: AtomicU64::new(0),
            latency_total: AtomicU64::new(0),
            latency_min: AtomicU64::new(u64::MAX),
            latency_max: AtomicU64::new(0),
            stall_commit_blocked: AtomicU64::new(0),
            stall_no_free_checker: AtomicU64::new(0),
            stall_waiting: AtomicU64::new(0),
            sleep_guard_stalls: AtomicU64::new(0),
        }
    }

    pub fn record_closure(&self, trigger: CloseTrigger) {
        self.closures[trigger.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clean_verdict(&self) {
        self.correct_checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a faulted verdict under the stage that first saw it.
    pub fn record_faulted_verdict(&self, stage: DetectionStage) {
        self.erroneous_checkpoints.fetch_add(1, Ordering::Relaxed);
        let counter = match stage {
            DetectionStage::Write => &self.detected_write,
            DetectionStage::Read => &self.detected_read,
            DetectionStage::Arch => &self.detected_arch,
            DetectionStage::Digest => &self.detected_digest,
            DetectionStage::Syscall => &self.detected_syscall,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fault reaching the retire pass after `latency` ticks.
    pub fn record_fault_detected(&self, latency: u64) {
        self.faults_detected.fetch_add(1, Ordering::Relaxed);
        self.latency_total.fetch_add(latency, Ordering::Relaxed);
        self.latency_min.fetch_min(latency, Ordering::Relaxed);
        self.latency_max.fetch_max(latency, Ordering::Relaxed);
    }

    pub fn record_fault_accepted(&self) {
        self.faults_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed rollback with its memory writeback count.
    pub fn record_rollback(&self, writebacks: u64) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        self.writebacks_total.fetch_add(writebacks, Ordering::Relaxed);
        self.writebacks_min.fetch_min(writebacks, Ordering::Relaxed);
        self.writebacks_max.fetch_max(writebacks, Ordering::Relaxed);
    }

    pub fn record_stall(&self, reason: StallReason) {
        let counter = match reason {
            StallReason::CommitBlocked => &self.stall_commit_blocked,
            StallReason::NoFreeChecker => &self.stall_no_free_checker,
            StallReason::Waiting => &self.stall_waiting,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sleep_guard(&self) {
        self.sleep_guard_stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> LockstepMetricsSnapshot {
        let min = |v: &AtomicU64| match v.load(Ordering::Relaxed) {
            u64::MAX => 0,
            v => v,
        };
        LockstepMetricsSnapshot {
            closures: std::array::from_fn(|i| self.closures[i].load(Ordering::Relaxed)),
            correct_checkpoints: self.correct_checkpoints.load(Ordering::Relaxed),
            erroneous_checkpoints: self.erroneous_checkpoints.load(Ordering::Relaxed),
            detected_write: self.detected_write.load(Ordering::Relaxed),
            detected_read: self.detected_read.load(Ordering::Relaxed),
            detected_arch: self.detected_arch.load(Ordering::Relaxed),
            detected_digest: self.detected_digest.load(Ordering::Relaxed),
            detected_syscall: self.detected_syscall.load(Ordering::Relaxed),
            faults_detected: self.faults_detected.load(Ordering::Relaxed),
            faults_accepted: self.faults_accepted.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            writebacks_total: self.writebacks_total.load(Ordering::Relaxed),
            writebacks_min: min(&self.writebacks_min),
            writebacks_max: self.writebacks_max.load(Ordering::Relaxed),
            latency_total: self.latency_total.load(Ordering::Relaxed),
            latency_min: min(&self.latency_min),
            latency_max: self.latency_max.load(Ordering::Relaxed),
            stall_commit_blocked: self.stall_commit_blocked.load(Ordering::Relaxed),
            stall_no_free_checker: self.stall_no_free_checker.load(Ordering::Relaxed),
            stall_waiting: self.stall_waiting.load(Ordering::Relaxed),
            sleep_guard_stalls: self.sleep_guard_stalls.load(Ordering::Relaxed),
        }
    }

    /// Fold a finished run's counters into this instance.
    pub fn absorb(&self, snap: &LockstepMetricsSnapshot) {
        for (counter, value) in self.closures.iter().zip(snap.closures) {
            counter.fetch_add(value, Ordering::Relaxed);
        }
        for (counter, value) in [
            (&self.correct_checkpoints, snap.correct_checkpoints),
            (&self.erroneous_checkpoints, snap.erroneous_checkpoints),
            (&self.detected_write, snap.detected_write),
            (&self.detected_read, snap.detected_read),
            (&self.detected_arch, snap.detected_arch),
            (&self.detected_digest, snap.detected_digest),
            (&self.detected_syscall, snap.detected_syscall),
            (&self.faults_detected, snap.faults_detected),
            (&self.faults_accepted, snap.faults_accepted),
            (&self.rollbacks, snap.rollbacks),
            (&self.writebacks_total, snap.writebacks_total),
            (&self.latency_total, snap.latency_total),
            (&self.stall_commit_blocked, snap.stall_commit_blocked),
            (&self.stall_no_free_checker, snap.stall_no_free_checker),
            (&self.stall_waiting, snap.stall_waiting),
            (&self.sleep_guard_stalls, snap.sleep_guard_stalls),
        ] {
            counter.fetch_add(value, Ordering::Relaxed);
        }
        if snap.rollbacks > 0 {
            self.writebacks_min
                .fetch_min(snap.writebacks_min, Ordering::Relaxed);
            self.writebacks_max
                .fetch_max(snap.writebacks_max, Ordering::Relaxed);
        }
        if snap.faults_detected > 0 {
            self.latency_min.fetch_min(snap.latency_min, Ordering::Relaxed);
            self.latency_max.fetch_max(snap.latency_max, Ordering::Relaxed);
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in &self.closures {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in [
            &self.correct_checkpoints,
            &self.erroneous_checkpoints,
            &self.detected_write,
            &self.detected_read,
            &self.detected_arch,
            &self.detected_digest,
            &self.detected_syscall,
            &self.faults_detected,
            &self.faults_accepted,
            &self.rollbacks,
            &self.writebacks_total,
            &self.writebacks_max,
            &self.latency_total,
            &self.latency_max,
            &self.stall_commit_blocked,
            &self.stall_no_free_checker,
            &self.stall_waiting,
            &self.sleep_guard_stalls,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.writebacks_min.store(u64::MAX, Ordering::Relaxed);
        self.latency_min.store(u64::MAX, Ordering::Relaxed);
    }
}

impl Default for LockstepMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Which check first exposed a faulted segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStage {
    Write,
    Read,
    Arch,
    Digest,
    Syscall,
}

/// Why the main unit could not commit in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallReason {
    CommitBlocked,
    NoFreeChecker,
    Waiting,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of lockstep metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockstepMetricsSnapshot {
    pub closures: [u64; TRIGGERS],
    pub correct_checkpoints: u64,
    pub erroneous_checkpoints: u64,
    pub detected_write: u64,
    pub detected_read: u64,
    pub detected_arch: u64,
    pub detected_digest: u64,
    pub detected_syscall: u64,
    pub faults_detected: u64,
    pub faults_accepted: u64,
    pub rollbacks: u64,
    pub writebacks_total: u64,
    pub writebacks_min: u64,
    pub writebacks_max: u64,
    pub latency_total: u64,
    pub latency_min: u64,
    pub latency_max: u64,
    pub stall_commit_blocked: u64,
    pub stall_no_free_checker: u64,
    pub stall_waiting: u64,
    pub sleep_guard_stalls: u64,
}

impl LockstepMetricsSnapshot {
    pub fn closures_for(&self, trigger: CloseTrigger) -> u64 {
        self.closures[trigger.index()]
    }

    pub fn segments_closed(&self) -> u64 {
        self.closures.iter().sum()
    }

    /// Mean detection latency in ticks, or 0 if nothing was detected.
    #[must_use]
    pub fn avg_latency(&self) -> u64 {
        self.latency_total
            .checked_div(self.faults_detected)
            .unwrap_or(0)
    }
}

impl fmt::Display for LockstepMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segments_closed={}", self.segments_closed())?;
        for trigger in CloseTrigger::ALL {
            write!(f, " closed_{}={}", trigger.as_str(), self.closures_for(trigger))?;
        }
        write!(
            f,
            " correct={} erroneous={} detected_write={} detected_read={} \
             detected_arch={} detected_digest={} detected_syscall={} \
             faults_detected={} faults_accepted={} rollbacks={} writebacks={} \
             latency_avg={} stall_blocked={} stall_no_checker={} stall_waiting={} \
             sleep_guard={}",
            self.correct_checkpoints,
            self.erroneous_checkpoints,
            self.detected_write,
            self.detected_read,
            self.detected_arch,
            self.detected_digest,
            self.detected_syscall,
            self.faults_detected,
            self.faults_accepted,
            self.rollbacks,
            self.writebacks_total,
            self.avg_latency(),
            self.stall_commit_blocked,
            self.stall_no_free_checker,
            self.stall_waiting,
            self.sleep_guard_stalls,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closures_by_trigger() {
        let m = LockstepMetrics::new();
        m.record_closure(CloseTrigger::Timeout);
        m.record_closure(CloseTrigger::Timeout);
        m.record_closure(CloseTrigger::Capacity);
        let snap = m.snapshot();
        assert_eq!(snap.closures_for(CloseTrigger::Timeout), 2);
        assert_eq!(snap.closures_for(CloseTrigger::Capacity), 1);
        assert_eq!(snap.segments_closed(), 3);
    }

    #[test]
    fn test_min_max_tracking() {
        let m = LockstepMetrics::new();
        assert_eq!(m.snapshot().writebacks_min, 0, "empty min reads as zero");
        m.record_rollback(4);
        m.record_rollback(1);
        m.record_rollback(9);
        m.record_fault_detected(100);
        m.record_fault_detected(300);
        let snap = m.snapshot();
        assert_eq!(snap.rollbacks, 3);
        assert_eq!(snap.writebacks_total, 14);
        assert_eq!(snap.writebacks_min, 1);
        assert_eq!(snap.writebacks_max, 9);
        assert_eq!(snap.latency_min, 100);
        assert_eq!(snap.avg_latency(), 200);
    }

    #[test]
    fn test_detection_stages() {
        let m = LockstepMetrics::new();
        m.record_faulted_verdict(DetectionStage::Write);
        m.record_faulted_verdict(DetectionStage::Arch);
        m.record_clean_verdict();
        let snap = m.snapshot();
        assert_eq!(snap.erroneous_checkpoints, 2);
        assert_eq!(snap.detected_write, 1);
        assert_eq!(snap.detected_arch, 1);
        assert_eq!(snap.correct_checkpoints, 1);
    }

    #[test]
    fn test_absorb_and_reset() {
        let run = LockstepMetrics::new();
        run.record_closure(CloseTrigger::Syscall);
        run.record_rollback(3);
        run.record_stall(StallReason::NoFreeChecker);
        let total = LockstepMetrics::new();
        total.absorb(&run.snapshot());
        total.absorb(&run.snapshot());
        let snap = total.snapshot();
        assert_eq!(snap.closures_for(CloseTrigger::Syscall), 2);
        assert_eq!(snap.rollbacks, 2);
        assert_eq!(snap.writebacks_min, 3);
        assert_eq!(snap.stall_no_free_checker, 2);
        total.reset();
        assert_eq!(total.snapshot(), LockstepMetrics::new().snapshot());
    }

    #[test]
    fn test_display_names_triggers() {
        let m = LockstepMetrics::new();
        m.record_closure(CloseTrigger::Erroneous);
        let text = m.snapshot().to_string();
        assert!(text.starts_with("segments_closed=1 closed_timeout=0"));
        assert!(text.contains("closed_erroneous=1"));
    }
}
