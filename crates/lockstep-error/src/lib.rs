use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for the lockstep verification crates.
///
/// Replay mismatches and architectural divergence are *not* represented
/// here: they are ordinary outcomes that drive rollback. Variants in this
/// enum are either configuration problems or broken protocol contracts.
#[derive(Error, Debug)]
pub enum LockstepError {
    // === Protocol Errors ===
    /// A state-machine contract was broken (out-of-order retire, double
    /// allocation, replay on an unassigned slot, ...).
    #[error("protocol violation on main unit {main}: {detail}")]
    ProtocolViolation { main: u32, detail: String },

    /// Cached slots of one checker are no longer contiguous.
    #[error("slot contiguity broken for main {main} checker {checker}: level {level} free below an occupied level")]
    SlotContiguity { main: u32, checker: u32, level: u32 },

    /// A segment tried to retire out of timestamp order.
    #[error("out-of-order retire on main {main}: timestamp {timestamp} after committed {committed}")]
    OutOfOrderRetire {
        main: u32,
        timestamp: u64,
        committed: u64,
    },

    // === Addressing Errors ===
    /// A main unit id outside the configured range.
    #[error("unknown main unit {main} (configured {configured})")]
    UnknownMain { main: u32, configured: u32 },

    /// A checker id outside the configured range.
    #[error("unknown checker {checker} for main {main} (configured {configured})")]
    UnknownChecker {
        main: u32,
        checker: u32,
        configured: u32,
    },

    // === Configuration Errors ===
    /// A configuration field failed validation.
    #[error("invalid configuration `{field}`: {detail}")]
    InvalidConfig { field: &'static str, detail: String },

    /// A configuration document could not be decoded.
    #[error("cannot decode configuration: {detail}")]
    ConfigDecode { detail: String },

    // === Harness Errors ===
    /// Shutdown self-check found fired injections that were never accounted.
    #[error(
        "injection accounting mismatch: fired {fired}, detected {detected}, \
         undetected {undetected}, squashed {squashed}, live {live}, lapses {lapses}"
    )]
    InjectionAccounting {
        fired: u64,
        detected: u64,
        undetected: u64,
        squashed: u64,
        live: u64,
        lapses: u64,
    },

    // === I/O Errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Report directory could not be prepared.
    #[error("cannot write report into '{path}'")]
    ReportPath { path: PathBuf },

    // === Internal Errors ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`LockstepError`].
///
/// Mirrors the taxonomy of the verification protocol: protocol and
/// accounting classes indicate a broken implementation, the rest are
/// environmental.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorClass {
    /// Broken state-machine contract.
    Protocol = 70,
    /// Unknown unit or checker id.
    Addressing = 64,
    /// Bad configuration value or document.
    Config = 78,
    /// Injection bookkeeping did not balance at shutdown.
    Accounting = 65,
    /// File system problem.
    Io = 74,
    /// Bug.
    Internal = 1,
}

impl LockstepError {
    /// Map this error to its class.
    pub const fn error_class(&self) -> ErrorClass {
        match self {
            Self::ProtocolViolation { .. }
            | Self::SlotContiguity { .. }
            | Self::OutOfOrderRetire { .. } => ErrorClass::Protocol,
            Self::UnknownMain { .. } | Self::UnknownChecker { .. } => ErrorClass::Addressing,
            Self::InvalidConfig { .. } | Self::ConfigDecode { .. } => ErrorClass::Config,
            Self::InjectionAccounting { .. } => ErrorClass::Accounting,
            Self::Io(_) | Self::ReportPath { .. } => ErrorClass::Io,
            Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether the embedding simulator must abort.
    ///
    /// Protocol violations and accounting mismatches mean the verification
    /// machinery itself is broken, so its results cannot be trusted.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self.error_class(),
            ErrorClass::Protocol | ErrorClass::Accounting | ErrorClass::Internal
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::InvalidConfig { .. } => Some("Fix the named field; see ProtocolConfig defaults"),
            Self::ConfigDecode { .. } => Some("Check the configuration JSON against ProtocolConfig"),
            Self::UnknownMain { .. } | Self::UnknownChecker { .. } => {
                Some("Unit ids must be below the configured unit counts")
            }
            Self::ReportPath { .. } => Some("Create the report directory or pick a writable one"),
            Self::InjectionAccounting { .. } => {
                Some("Rerun with RUST_LOG=debug and compare injection and verdict events")
            }
            _ => None,
        }
    }

    /// Get the process exit code for this error (for CLI use).
    pub const fn exit_code(&self) -> i32 {
        self.error_class() as i32
    }

    /// Create a protocol violation error.
    pub fn protocol(main: u32, detail: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            main,
            detail: detail.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(field: &'static str, detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `LockstepError`.
pub type Result<T> = std::result::Result<T, LockstepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_protocol() {
        let err = LockstepError::protocol(2, "retire on free slot");
        assert_eq!(
            err.to_string(),
            "protocol violation on main unit 2: retire on free slot"
        );
    }

    #[test]
    fn error_display_out_of_order() {
        let err = LockstepError::OutOfOrderRetire {
            main: 0,
            timestamp: 5,
            committed: 7,
        };
        assert_eq!(
            err.to_string(),
            "out-of-order retire on main 0: timestamp 5 after committed 7"
        );
    }

    #[test]
    fn error_display_config() {
        let err = LockstepError::config("log_capacity", "must be at least 8");
        assert_eq!(
            err.to_string(),
            "invalid configuration `log_capacity`: must be at least 8"
        );
    }

    #[test]
    fn class_mapping() {
        assert_eq!(
            LockstepError::protocol(0, "x").error_class(),
            ErrorClass::Protocol
        );
        assert_eq!(
            LockstepError::UnknownMain {
                main: 3,
                configured: 1
            }
            .error_class(),
            ErrorClass::Addressing
        );
        assert_eq!(
            LockstepError::config("x", "y").error_class(),
            ErrorClass::Config
        );
        assert_eq!(
            LockstepError::internal("bug").error_class(),
            ErrorClass::Internal
        );
    }

    #[test]
    fn fatal_classes() {
        assert!(LockstepError::protocol(0, "x").is_fatal());
        assert!(
            LockstepError::InjectionAccounting {
                fired: 3,
                detected: 1,
                undetected: 1,
                squashed: 0,
                live: 0,
                lapses: 3,
            }
            .is_fatal()
        );
        assert!(!LockstepError::config("x", "y").is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!LockstepError::from(io).is_fatal());
    }

    #[test]
    fn suggestions() {
        assert!(LockstepError::config("x", "y").suggestion().is_some());
        assert!(LockstepError::internal("bug").suggestion().is_none());
        assert!(LockstepError::protocol(0, "x").suggestion().is_none());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: LockstepError = io_err.into();
        assert!(matches!(err, LockstepError::Io(_)));
        assert_eq!(err.error_class(), ErrorClass::Io);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(LockstepError::protocol(0, "x").exit_code(), 70);
        assert_eq!(LockstepError::config("x", "y").exit_code(), 78);
        assert_eq!(LockstepError::internal("x").exit_code(), 1);
    }
}
