//! Identifiers and small value types shared by every lockstep crate.
//!
//! Unit ids are validated against the configured pool sizes by the core
//! context; the newtypes here only guarantee local invariants (non-zero
//! sequence numbers, monotonic timestamps).

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

/// Logical clock edge. Wakes are scheduled one edge after their trigger.
pub type Tick = u64;

/// Index of a main execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MainId(u32);

impl MainId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "main{}", self.0)
    }
}

/// Index of a checker unit within one main unit's replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CheckerId(u32);

impl CheckerId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CheckerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "checker{}", self.0)
    }
}

/// A log buffer position in a main unit's slot pool.
///
/// Level 0 is the primary slot the checker itself replays; levels above
/// it are cached slots queued behind the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId {
    pub checker: CheckerId,
    pub level: u32,
}

impl SlotId {
    #[inline]
    pub const fn new(checker: CheckerId, level: u32) -> Self {
        Self { checker, level }
    }

    #[inline]
    pub const fn primary(checker: CheckerId) -> Self {
        Self { checker, level: 0 }
    }

    #[inline]
    pub const fn is_primary(self) -> bool {
        self.level == 0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/L{}", self.checker, self.level)
    }
}

/// Per-main-unit logical segment timestamp.
///
/// Timestamp 0 is the baseline that exists before the first segment; each
/// allocated segment takes `previous + 1`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether `self` is the direct successor of `other`.
    #[inline]
    pub const fn follows(self, other: Self) -> bool {
        self.0 == other.0 + 1
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Per-unit memory-instruction sequence number.
///
/// Sequence numbers start at 1; each committed memory macro-instruction
/// takes the next one, and micro-operations of one macro-instruction share
/// it. Replay locates a record by `seq - segment_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SeqNum(NonZeroU64);

impl SeqNum {
    pub const FIRST: Self = Self(NonZeroU64::MIN);

    /// Returns `None` for 0, which marks an invalid sequence number.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        match NonZeroU64::new(self.0.get().saturating_add(1)) {
            Some(v) => Self(v),
            None => self,
        }
    }

    /// Distance from `start`, or `None` when `self` precedes it.
    #[inline]
    pub fn offset_from(self, start: Self) -> Option<usize> {
        self.get()
            .checked_sub(start.get())
            .and_then(|d| usize::try_from(d).ok())
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl TryFrom<u64> for SeqNum {
    type Error = InvalidSeqNum;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidSeqNum)
    }
}

/// Error returned when attempting to create a `SeqNum` from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidSeqNum;

impl fmt::Display for InvalidSeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sequence number cannot be zero")
    }
}

impl std::error::Error for InvalidSeqNum {}

/// Addressable execution unit, as seen by suspend/wake/restore commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UnitId {
    Main(MainId),
    Checker { main: MainId, checker: CheckerId },
}

impl UnitId {
    /// The replication group this unit belongs to.
    pub const fn main(self) -> MainId {
        match self {
            Self::Main(main) | Self::Checker { main, .. } => main,
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main(main) => write!(f, "{main}"),
            Self::Checker { main, checker } => write!(f, "{main}.{checker}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Memory access kinds
// ---------------------------------------------------------------------------

/// Kind of a logged memory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    Load,
    Store,
    /// Atomic read-modify-write: payload is the written value, prior bytes
    /// are the value read.
    Swap,
}

impl AccessKind {
    #[inline]
    pub const fn is_load(self) -> bool {
        matches!(self, Self::Load)
    }

    /// Whether the operation modifies memory and therefore needs undo data.
    #[inline]
    pub const fn writes_memory(self) -> bool {
        matches!(self, Self::Store | Self::Swap)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Store => "store",
            Self::Swap => "swap",
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Register classes captured by an architectural snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegClass {
    Int,
    Float,
    Vector,
    /// Condition-code registers.
    Cc,
    Misc,
}

impl RegClass {
    pub const ALL: [Self; 5] = [Self::Int, Self::Float, Self::Vector, Self::Cc, Self::Misc];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Vector => "vector",
            Self::Cc => "cc",
            Self::Misc => "misc",
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Segment outcomes
// ---------------------------------------------------------------------------

/// Why a segment was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseTrigger {
    /// The main unit committed `timeout` instructions.
    Timeout,
    /// The log reached capacity minus headroom.
    Capacity,
    /// A system call ended the segment.
    Syscall,
    /// The system-call log filled up.
    SyscallLogFull,
    /// The main unit was marked erroneous.
    Erroneous,
    /// The embedding simulator requested a checkpoint.
    Explicit,
}

impl CloseTrigger {
    pub const ALL: [Self; 6] = [
        Self::Timeout,
        Self::Capacity,
        Self::Syscall,
        Self::SyscallLogFull,
        Self::Erroneous,
        Self::Explicit,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Capacity => "capacity",
            Self::Syscall => "syscall",
            Self::SyscallLogFull => "syscall_log_full",
            Self::Erroneous => "erroneous",
            Self::Explicit => "explicit",
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Why a checker's replay request did not match the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MismatchReason {
    /// Requested bytes fall outside the record's address range.
    AddressRange,
    /// Requested size runs past the end of the record.
    Size,
    /// Read against a store record or write against a load record.
    Kind,
    /// Written bytes differ from the logged payload.
    WriteData,
    /// The request indexes past the segment's capacity.
    Exhausted,
    /// The request indexes a record past the fill point of a closed segment.
    InvalidRecord,
}

impl MismatchReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AddressRange => "address_range",
            Self::Size => "size",
            Self::Kind => "kind",
            Self::WriteData => "write_data",
            Self::Exhausted => "exhausted",
            Self::InvalidRecord => "invalid_record",
        }
    }

    /// Whether the mismatch stems from a checker write.
    pub const fn is_write_side(self) -> bool {
        matches!(self, Self::WriteData)
    }
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What made a verdict come out `Faulted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCause {
    /// A replay request mismatched the log.
    Replay(MismatchReason),
    /// Final register state differs from the expected-final snapshot.
    ArchDivergence,
    /// Recorded and replayed digests differ.
    Digest,
    /// The checker's system-call sequence diverged from the logged one.
    SyscallDivergence,
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replay(reason) => write!(f, "replay:{reason}"),
            Self::ArchDivergence => f.write_str("arch_divergence"),
            Self::Digest => f.write_str("digest"),
            Self::SyscallDivergence => f.write_str("syscall_divergence"),
        }
    }
}
