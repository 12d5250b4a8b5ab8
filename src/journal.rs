//! Persistence contract for scheduled commands
//!
//! Only `period` and `event` commands are journaled; they are stored as their
//! canonical text line so any backend can keep them as plain strings.

use crate::command::{self, DebugCommand};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Opaque handle of a journaled command
pub type JournalKey = u64;

/// Storage for armed persistent schedules
pub trait CommandJournal: Send + Sync + 'static {
    /// Store an armed command; returns its key
    fn persist(&self, cmd: &DebugCommand) -> anyhow::Result<JournalKey>;

    /// Forget a command whose schedule retired
    fn retire(&self, key: JournalKey) -> anyhow::Result<()>;

    /// Every command still armed, with its key
    fn reload(&self) -> anyhow::Result<Vec<(JournalKey, DebugCommand)>>;
}

/// In-process journal
#[derive(Debug, Default)]
pub struct MemoryJournal {
    inner: Mutex<JournalState>,
}

#[derive(Debug, Default)]
struct JournalState {
    next_key: JournalKey,
    lines: BTreeMap<JournalKey, (String, String)>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of journaled commands
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Canonical lines currently journaled, in insertion order
    pub fn lines(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .values()
            .map(|(line, _)| line.clone())
            .collect()
    }
}

impl CommandJournal for MemoryJournal {
    fn persist(&self, cmd: &DebugCommand) -> anyhow::Result<JournalKey> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_key += 1;
        let key = state.next_key;
        state
            .lines
            .insert(key, (cmd.to_string(), cmd.sender().to_string()));
        Ok(key)
    }

    fn retire(&self, key: JournalKey) -> anyhow::Result<()> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .lines
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("journal key {} not found", key))
    }

    fn reload(&self) -> anyhow::Result<Vec<(JournalKey, DebugCommand)>> {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut commands = Vec::with_capacity(state.lines.len());
        for (key, (line, sender)) in &state.lines {
            match command::parse(line.as_bytes(), sender) {
                Ok(cmd) => commands.push((*key, cmd)),
                Err(e) => warn!("Skipping unparseable journal entry {}: {}", key, e),
            }
        }
        Ok(commands)
    }
}
