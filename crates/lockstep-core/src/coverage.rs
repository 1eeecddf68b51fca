//! Per-PC check coverage of one main unit.

use std::collections::BTreeMap;
use std::io::{self, Write};

/// Encounter and check counts for one program counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcCoverage {
    pub inst: &'static str,
    pub encountered: u64,
    pub checked: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CoverageMap {
    pcs: BTreeMap<u64, PcCoverage>,
    insts: BTreeMap<&'static str, [u64; 2]>,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a committed instruction; returns whether the pc is new.
    pub fn encounter(&mut self, pc: u64, inst: &'static str) -> bool {
        let mut fresh = false;
        let entry = self.pcs.entry(pc).or_insert_with(|| {
            fresh = true;
            PcCoverage {
                inst,
                encountered: 0,
                checked: 0,
            }
        });
        entry.encountered += 1;
        self.insts.entry(inst).or_default()[0] += 1;
        fresh
    }

    /// Count a verified execution of `pc`; returns whether it is the first.
    pub fn check(&mut self, pc: u64) -> bool {
        let Some(entry) = self.pcs.get_mut(&pc) else {
            return false;
        };
        entry.checked += 1;
        self.insts.entry(entry.inst).or_default()[1] += 1;
        entry.checked == 1
    }

    pub fn get(&self, pc: u64) -> Option<&PcCoverage> {
        self.pcs.get(&pc)
    }

    pub fn len(&self) -> usize {
        self.pcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcs.is_empty()
    }

    /// PCs that have been verified at least once.
    pub fn checked_pcs(&self) -> usize {
        self.pcs.values().filter(|c| c.checked > 0).count()
    }

    pub fn render_pcs(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "pc, static inst,# encountered,# checked")?;
        for (pc, c) in &self.pcs {
            writeln!(out, "{pc},{},{},{}", c.inst, c.encountered, c.checked)?;
        }
        Ok(())
    }

    pub fn render_insts(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "static inst,# encountered,# checked")?;
        for (inst, [encountered, checked]) in &self.insts {
            writeln!(out, "{inst},{encountered},{checked}")?;
        }
        Ok(())
    }
}
