//! Process-wide lockstep context.
//!
//! Owns the configuration, one [`ReplicationGroup`] per main unit, the
//! command queue, and the metrics. Unit ids coming from the embedding
//! simulator are validated here before they reach a group.

use std::path::Path;
use std::sync::Arc;

use lockstep_error::{LockstepError, Result};
use lockstep_observability::{NoOpObserver, ProtocolObserver};
use lockstep_types::{CheckerId, MainId, Tick};
use tracing::info;

use crate::command::{Command, CommandQueue};
use crate::config::ProtocolConfig;
use crate::metrics::{GLOBAL_LOCKSTEP_METRICS, LockstepMetrics, LockstepMetricsSnapshot};
use crate::report;
use crate::rollback::{MemoryPort, RecoveryReport};
use crate::scheduler::{
    AppendResult, CommitEvent, PipelineHint, ReplayOutcome, ReplicationGroup, Shared, Verdict,
};
use crate::segment::ReplayRequest;
use crate::snapshot::{ArchSnapshot, ComparisonExemptions, ThreadState};
use crate::syscall_log::SyscallReplay;

pub struct LockstepContext {
    config: ProtocolConfig,
    exemptions: ComparisonExemptions,
    groups: Vec<ReplicationGroup>,
    commands: CommandQueue,
    metrics: LockstepMetrics,
    observer: Arc<dyn ProtocolObserver>,
}

impl std::fmt::Debug for LockstepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockstepContext")
            .field("config", &self.config)
            .field("groups", &self.groups.len())
            .field("pending_commands", &self.commands.len())
            .finish_non_exhaustive()
    }
}

impl LockstepContext {
    /// Validate `config` and build one replication group per main unit.
    pub fn new(config: ProtocolConfig) -> Result<Self> {
        config.validate()?;
        let groups = (0..config.main_units)
            .map(|m| ReplicationGroup::new(MainId::new(m), &config))
            .collect();
        info!(
            main_units = config.main_units,
            checkers_per_main = config.checkers_per_main,
            levels = config.levels(),
            log_capacity = config.log_capacity,
            timeout = config.checkpoint_timeout,
            adaptive = config.adaptive_timeout,
            rollback = config.rollback_enabled,
            hashing = config.hashing,
            "lockstep context created"
        );
        Ok(Self {
            exemptions: ComparisonExemptions::new(config.exemptions.iter().copied()),
            config,
            groups,
            commands: CommandQueue::new(),
            metrics: LockstepMetrics::new(),
            observer: Arc::new(NoOpObserver),
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProtocolObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn exemptions(&self) -> &ComparisonExemptions {
        &self.exemptions
    }

    pub fn observer(&self) -> &Arc<dyn ProtocolObserver> {
        &self.observer
    }

    pub fn metrics(&self) -> &LockstepMetrics {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> LockstepMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Add this context's counters to [`GLOBAL_LOCKSTEP_METRICS`].
    pub fn publish_metrics(&self) {
        GLOBAL_LOCKSTEP_METRICS.absorb(&self.metrics.snapshot());
    }

    pub fn groups(&self) -> &[ReplicationGroup] {
        &self.groups
    }

    pub fn group(&self, main: MainId) -> Result<&ReplicationGroup> {
        self.groups.get(main.index()).ok_or(LockstepError::UnknownMain {
            main: main.get(),
            configured: self.config.main_units,
        })
    }

    /// Commands not yet delivered, in delivery order.
    pub fn pending_commands(&self) -> &CommandQueue {
        &self.commands
    }

    /// Remove and return every command due at or before `tick`.
    pub fn commands_due(&mut self, tick: Tick) -> Vec<Command> {
        self.commands.commands_due(tick)
    }

    fn split(&mut self, main: MainId) -> Result<(&mut ReplicationGroup, Shared<'_>)> {
        let group = self
            .groups
            .get_mut(main.index())
            .ok_or(LockstepError::UnknownMain {
                main: main.get(),
                configured: self.config.main_units,
            })?;
        let shared = Shared {
            config: &self.config,
            exemptions: &self.exemptions,
            metrics: &self.metrics,
            observer: self.observer.as_ref(),
            commands: &mut self.commands,
        };
        Ok((group, shared))
    }

    fn check_checker(&self, main: MainId, checker: CheckerId) -> Result<()> {
        if checker.get() < self.config.checkers_per_main {
            Ok(())
        } else {
            Err(LockstepError::UnknownChecker {
                main: main.get(),
                checker: checker.get(),
                configured: self.config.checkers_per_main,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Main-unit interface
    // -----------------------------------------------------------------------

    pub fn start(&mut self, main: MainId, state: &dyn ThreadState, tick: Tick) -> Result<()> {
        let (group, mut sh) = self.split(main)?;
        group.start(&mut sh, state, tick)
    }

    pub fn on_commit(
        &mut self,
        main: MainId,
        event: CommitEvent,
        state: &dyn ThreadState,
        tick: Tick,
    ) -> Result<AppendResult> {
        let (group, mut sh) = self.split(main)?;
        group.on_commit(&mut sh, event, state, tick)
    }

    pub fn request_checkpoint(
        &mut self,
        main: MainId,
        state: &dyn ThreadState,
        tick: Tick,
    ) -> Result<bool> {
        let (group, mut sh) = self.split(main)?;
        group.request_checkpoint(&mut sh, state, tick)
    }

    pub fn should_block_commit(
        &mut self,
        main: MainId,
        hint: PipelineHint,
        tick: Tick,
    ) -> Result<bool> {
        let (group, sh) = self.split(main)?;
        Ok(group.should_block_commit(&sh, hint, tick))
    }

    pub fn mark_erroneous(&mut self, main: MainId, tick: Tick) -> Result<()> {
        let (group, _) = self.split(main)?;
        group.mark_erroneous(tick);
        Ok(())
    }

    pub fn rollback(
        &mut self,
        main: MainId,
        memory: &mut dyn MemoryPort,
        tick: Tick,
    ) -> Result<RecoveryReport> {
        let (group, mut sh) = self.split(main)?;
        group.rollback(&mut sh, memory, tick)
    }

    // -----------------------------------------------------------------------
    // Checker interface
    // -----------------------------------------------------------------------

    pub fn replay(
        &mut self,
        main: MainId,
        checker: CheckerId,
        req: &ReplayRequest,
        tick: Tick,
    ) -> Result<ReplayOutcome> {
        self.check_checker(main, checker)?;
        let (group, mut sh) = self.split(main)?;
        group.replay(&mut sh, checker, req, tick)
    }

    pub fn checker_syscall(
        &mut self,
        main: MainId,
        checker: CheckerId,
        inst_addr: u64,
        state: &ArchSnapshot,
        tick: Tick,
    ) -> Result<Option<SyscallReplay>> {
        self.check_checker(main, checker)?;
        let (group, mut sh) = self.split(main)?;
        group.checker_syscall(&mut sh, checker, inst_addr, state, tick)
    }

    pub fn checker_finished(
        &mut self,
        main: MainId,
        checker: CheckerId,
        final_state: &ArchSnapshot,
        tick: Tick,
    ) -> Result<Verdict> {
        self.check_checker(main, checker)?;
        let (group, mut sh) = self.split(main)?;
        group.checker_finished(&mut sh, checker, final_state, tick)
    }

    // -----------------------------------------------------------------------
    // Reports
    // -----------------------------------------------------------------------

    /// Write `histograms.txt` and one `pcs_<main>.txt` per main unit.
    pub fn write_reports(&self, dir: &Path) -> Result<()> {
        report::write_core_reports(dir, &self.groups)
    }
}
