//! Fault injection and a deterministic driver for the lockstep core.
//!
//! [`Simulation`] runs a small register machine on every main unit,
//! replays the logged segments on the checkers, and accounts for every
//! injected fault in an [`InjectionLedger`].

pub mod driver;
pub mod fault_spec;
pub mod injection;
pub mod ledger;
pub mod machine;
pub mod report;

pub use driver::{RunSummary, SimOptions, Simulation};
pub use fault_spec::{FU_DEST_DORMANT_SEGMENTS, StuckAtSpec, StuckAtSpecBuilder, StuckStructure};
pub use injection::{DEFAULT_INJECTION_SEED, InjectionCategory, Injector, geometric_gap};
pub use ledger::{InjectionLedger, LedgerSnapshot};
pub use machine::{Cpu, DataPort, Instr, OpClass, Program, SyscallOutcome, execute};
pub use report::{ERROR_LOG_FILE, MEMORY_WRITEBACK_CYCLES, render_error_log, write_error_log};
