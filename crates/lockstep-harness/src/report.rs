//! `error_log.txt`: injection and recovery summary of a run.

use std::io::Write;
use std::path::Path;

use lockstep_core::{LockstepMetricsSnapshot, create_report};
use lockstep_error::Result;
use tracing::info;

use crate::injection::InjectionCategory;
use crate::ledger::LedgerSnapshot;

pub const ERROR_LOG_FILE: &str = "error_log.txt";

/// Cycles charged per memory write-back during recovery.
pub const MEMORY_WRITEBACK_CYCLES: u64 = 313;

/// Render the error log body.
pub fn render_error_log(
    out: &mut impl Write,
    ledger: &LedgerSnapshot,
    metrics: &LockstepMetricsSnapshot,
    lapses: &[u64],
) -> Result<()> {
    writeln!(out, "number_detected_errors: {}", ledger.detected)?;
    writeln!(out, "number_injected_errors: {}", ledger.total_injections())?;
    for category in InjectionCategory::ALL {
        writeln!(out, "  {}: {}", category.label(), ledger.injected(category))?;
    }
    write!(out, "injection_lapses:")?;
    for lapse in lapses {
        write!(out, " {lapse}")?;
    }
    writeln!(out)?;

    writeln!(out, "rerun_penalty: {}", ledger.rerun_total)?;
    writeln!(out, "min_rerun_penalty: {}", ledger.rerun_min)?;
    writeln!(out, "max_rerun_penalty: {}", ledger.rerun_max)?;
    writeln!(
        out,
        "memory_recovery_penalty: {}",
        metrics.writebacks_total * MEMORY_WRITEBACK_CYCLES
    )?;
    writeln!(
        out,
        "min_memory_recovery_penalty: {}",
        metrics.writebacks_min * MEMORY_WRITEBACK_CYCLES
    )?;
    writeln!(
        out,
        "max_memory_recovery_penalty: {}",
        metrics.writebacks_max * MEMORY_WRITEBACK_CYCLES
    )?;

    writeln!(out, "missed_errors: {}", ledger.undetected)?;
    writeln!(out, "false_positives: {}", ledger.false_positives)?;
    writeln!(
        out,
        "cpt_only_unchanged_injection: {}",
        ledger.checkpoint_only_unchanged
    )?;
    writeln!(out, "changed_injections: {}", ledger.changed)?;
    writeln!(out, "unchanged_injections: {}", ledger.unchanged)?;
    writeln!(out, "total_injections: {}", ledger.changed + ledger.unchanged)?;
    Ok(())
}

/// Write [`ERROR_LOG_FILE`] into `dir`.
pub fn write_error_log(
    dir: &Path,
    ledger: &LedgerSnapshot,
    metrics: &LockstepMetricsSnapshot,
    lapses: &[u64],
) -> Result<()> {
    let mut out = create_report(dir, ERROR_LOG_FILE)?;
    render_error_log(&mut out, ledger, metrics, lapses)?;
    out.flush()?;
    info!(dir = %dir.display(), detected = ledger.detected, "error log written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> LedgerSnapshot {
        let mut snap = LedgerSnapshot::default();
        snap.injected.insert("load_store", 3);
        snap.injected.insert("stuck_at", 2);
        snap.changed = 4;
        snap.unchanged = 1;
        snap.detected = 2;
        snap.undetected = 1;
        snap.rerun_total = 40;
        snap.rerun_min = 10;
        snap.rerun_max = 30;
        snap
    }

    #[test]
    fn test_error_log_lines() {
        let metrics = LockstepMetricsSnapshot {
            writebacks_total: 5,
            writebacks_min: 1,
            writebacks_max: 4,
            ..LockstepMetricsSnapshot::default()
        };
        let mut out = Vec::new();
        render_error_log(&mut out, &ledger(), &metrics, &[7, 12]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("number_detected_errors: 2\n"));
        assert!(text.contains("number_injected_errors: 5\n"));
        assert!(text.contains("  load_store: 3\n"));
        assert!(text.contains("  arch_state: 0\n"));
        assert!(text.contains("injection_lapses: 7 12\n"));
        assert!(text.contains("rerun_penalty: 40\n"));
        assert!(text.contains("memory_recovery_penalty: 1565\n"));
        assert!(text.contains("max_memory_recovery_penalty: 1252\n"));
        assert!(text.contains("missed_errors: 1\n"));
        assert!(text.ends_with("total_injections: 5\n"));
    }

    #[test]
    fn test_error_log_written_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_error_log(
            dir.path(),
            &ledger(),
            &LockstepMetricsSnapshot::default(),
            &[],
        )
        .unwrap();
        let text = std::fs::read_to_string(dir.path().join(ERROR_LOG_FILE)).unwrap();
        assert!(text.contains("injection_lapses:\n"));
    }
}
