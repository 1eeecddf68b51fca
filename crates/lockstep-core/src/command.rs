//! Control signals from the scheduler to the pipeline collaborator.
//!
//! The scheduler never calls into execution units directly. Every
//! activation change goes through a [`CommandQueue`] that the embedding
//! simulator drains once per tick with [`CommandQueue::commands_due`].

use std::collections::BTreeMap;

use lockstep_types::{MainId, SeqNum, Tick, UnitId};

use crate::snapshot::ArchSnapshot;

/// One signal for the pipeline collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stop fetching and committing on `unit`.
    Suspend(UnitId),
    /// Resume `unit`. Always scheduled one tick after its trigger.
    Wake(UnitId),
    /// Block commit on the main unit until `until`.
    BlockCommit { main: MainId, until: Tick },
    /// Drain the main unit's pipeline and restart from its restored state.
    SquashAndRestart(MainId),
    /// Install `snapshot` into `unit`. For a checker, `starting_seq` is the
    /// sequence number of the segment's first record.
    Restore {
        unit: UnitId,
        snapshot: Box<ArchSnapshot>,
        starting_seq: SeqNum,
    },
}

impl Command {
    /// The unit the command is addressed to.
    pub fn unit(&self) -> UnitId {
        match self {
            Self::Suspend(unit) | Self::Wake(unit) | Self::Restore { unit, .. } => *unit,
            Self::BlockCommit { main, .. } | Self::SquashAndRestart(main) => UnitId::Main(*main),
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Suspend(_) => "suspend",
            Self::Wake(_) => "wake",
            Self::BlockCommit { .. } => "block_commit",
            Self::SquashAndRestart(_) => "squash_and_restart",
            Self::Restore { .. } => "restore",
        }
    }
}

/// Commands ordered by due tick, FIFO within a tick.
#[derive(Debug, Default)]
pub struct CommandQueue {
    due: BTreeMap<Tick, Vec<Command>>,
    len: usize,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, at: Tick, command: Command) {
        self.due.entry(at).or_default().push(command);
        self.len += 1;
    }

    /// Queue a wake for the clock edge after `tick`.
    pub fn wake(&mut self, unit: UnitId, tick: Tick) {
        self.push(tick + 1, Command::Wake(unit));
    }

    /// Remove and return every command due at or before `tick`.
    pub fn commands_due(&mut self, tick: Tick) -> Vec<Command> {
        let later = self.due.split_off(&(tick + 1));
        let ready = std::mem::replace(&mut self.due, later);
        let out: Vec<Command> = ready.into_values().flatten().collect();
        self.len -= out.len();
        out
    }

    /// Pending commands without removing them, in delivery order.
    pub fn pending(&self) -> impl Iterator<Item = (Tick, &Command)> {
        self.due
            .iter()
            .flat_map(|(tick, cmds)| cmds.iter().map(move |cmd| (*tick, cmd)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.due.clear();
        self.len = 0;
    }
}
