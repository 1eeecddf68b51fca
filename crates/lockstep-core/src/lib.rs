//! Segment log, verification, slot scheduling, and rollback for lockstep
//! checkers.

pub mod aimd;
pub mod command;
pub mod config;
pub mod context;
pub mod coverage;
pub mod digest;
pub mod histogram;
pub mod metrics;
pub mod record;
pub mod report;
pub mod rollback;
pub mod scheduler;
pub mod segment;
pub mod slot;
pub mod snapshot;
pub mod syscall_log;

pub use aimd::TimeoutPolicy;
pub use command::{Command, CommandQueue};
pub use config::{
    DigestKind, InjectionRates, LOAD_COST, LOG_HEADROOM, MIN_TIMEOUT, ProtocolConfig,
};
pub use context::LockstepContext;
pub use coverage::{CoverageMap, PcCoverage};
pub use digest::{
    ChunkCompressor, DigestValue, RunningDigest, Sha256Chunks, Sha256Compat, Xxh3Chunks,
};
pub use histogram::{HistogramBucket, IntervalHistogram, LatencyHistogram};
pub use metrics::{
    DetectionStage, GLOBAL_LOCKSTEP_METRICS, LockstepMetrics, LockstepMetricsSnapshot,
    StallReason,
};
pub use record::{MemAccess, OperationRecord};
pub use report::{HISTOGRAMS_FILE, create_report, pcs_file_name, write_core_reports};
pub use rollback::{MemoryPort, RecoveryReport, SparseMemory, UndoBatch, UndoWrite, apply_undo};
pub use scheduler::{
    AppendResult, CheckerPhase, CheckerView, CommitEvent, GroupHistograms, MainView,
    PipelineHint, ReplayOutcome, ReplicationGroup, Shared, Verdict,
};
pub use segment::{
    AppendRejected, Appended, Mismatch, ReplayData, ReplayOp, ReplayRequest, SegmentLog,
};
pub use slot::{Segment, SlotPool, SlotState};
pub use snapshot::{
    ArchSnapshot, ComparisonExemptions, Divergence, PcState, RegisterLayout, RegisterRef,
    SnapshotFlags, ThreadState, compare,
};
pub use syscall_log::{SyscallEntry, SyscallLog, SyscallReplay};
