//! Plain-text shutdown reports of the core.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use lockstep_error::{LockstepError, Result};
use tracing::info;

use crate::scheduler::ReplicationGroup;

pub const HISTOGRAMS_FILE: &str = "histograms.txt";

/// Coverage report file of one main unit.
pub fn pcs_file_name(main: u32) -> String {
    format!("pcs_{main}.txt")
}

/// Create `dir` if needed and open `name` inside it for writing.
pub fn create_report(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    fs::create_dir_all(dir).map_err(|_| LockstepError::ReportPath {
        path: dir.to_path_buf(),
    })?;
    let path: PathBuf = dir.join(name);
    let file = File::create(&path).map_err(|_| LockstepError::ReportPath { path })?;
    Ok(BufWriter::new(file))
}

/// Write every histogram of every group to `out`.
pub fn render_histograms(out: &mut impl Write, groups: &[ReplicationGroup]) -> Result<()> {
    for group in groups {
        let h = group.histograms();
        writeln!(out, "==== {} ====", group.id())?;
        writeln!(out, "replay delay Histogram")?;
        h.replay_delay.render(out)?;
        writeln!(out, "cpt ticks Histogram")?;
        h.checkpoint_ticks.render(out)?;
        writeln!(out, "checker cycles Histogram")?;
        h.checker_cycles.render(out)?;
        h.aimd.render(out, "AIMD Histogram")?;
        h.cpt_length.render(out, "cpt length Histogram")?;
        h.first_record
            .render(out, "length to first LSL entry Histogram")?;
        h.last_record
            .render(out, "length from last LSL entry Histogram")?;
        writeln!(out)?;
    }
    Ok(())
}

/// Write `histograms.txt` and `pcs_<main>.txt` into `dir`.
pub fn write_core_reports(dir: &Path, groups: &[ReplicationGroup]) -> Result<()> {
    let mut out = create_report(dir, HISTOGRAMS_FILE)?;
    render_histograms(&mut out, groups)?;
    out.flush()?;

    for group in groups {
        let mut out = create_report(dir, &pcs_file_name(group.id().get()))?;
        group.coverage().render_pcs(&mut out)?;
        writeln!(out)?;
        group.coverage().render_insts(&mut out)?;
        out.flush()?;
    }
    info!(dir = %dir.display(), groups = groups.len(), "core reports written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use lockstep_types::MainId;

    use super::*;
    use crate::config::ProtocolConfig;

    #[test]
    fn test_reports_land_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProtocolConfig {
            main_units: 2,
            ..ProtocolConfig::default()
        };
        let groups = vec![
            ReplicationGroup::new(MainId::new(0), &config),
            ReplicationGroup::new(MainId::new(1), &config),
        ];
        let nested = dir.path().join("out");
        write_core_reports(&nested, &groups).unwrap();

        let histograms = fs::read_to_string(nested.join(HISTOGRAMS_FILE)).unwrap();
        assert!(histograms.contains("==== main0 ===="));
        assert!(histograms.contains("==== main1 ===="));
        assert!(histograms.contains("AIMD Histogram"));
        assert!(histograms.contains("bigbucket"));
        let pcs = fs::read_to_string(nested.join(pcs_file_name(1))).unwrap();
        assert!(pcs.starts_with("pc, static inst,# encountered,# checked"));
    }

    #[test]
    fn test_unwritable_directory_is_report_path_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let err = create_report(&blocker.join("sub"), "a.txt").unwrap_err();
        assert!(matches!(err, LockstepError::ReportPath { .. }));
    }
}
