//! Two-stage conflict resolution.
//!
//! Stage 1 picks one of three non-destructive strategies; Stage 2 walks the
//! conflict set file by file when a smart merge leaves conflicts. History is
//! never rewritten: every strategy starts with a safety backup, and remote
//! refs are untouched until the orchestrator pushes.

pub mod merge;
pub mod stage1;
pub mod stage2;

use std::fmt;
use std::path::Path;

use anyhow::Result;

use crate::git::ops;
use crate::inspect::RepositoryState;

pub const CANCELLED_BY_USER: &str = "cancelled by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    KeepLocal,
    KeepRemote,
    SmartMerge,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::KeepLocal => write!(f, "keep local only"),
            Strategy::KeepRemote => write!(f, "keep remote only"),
            Strategy::SmartMerge => write!(f, "smart merge"),
        }
    }
}

impl From<ogresync_cli_types::CliStrategy> for Strategy {
    fn from(value: ogresync_cli_types::CliStrategy) -> Self {
        match value {
            ogresync_cli_types::CliStrategy::KeepLocal => Strategy::KeepLocal,
            ogresync_cli_types::CliStrategy::KeepRemote => Strategy::KeepRemote,
            ogresync_cli_types::CliStrategy::SmartMerge => Strategy::SmartMerge,
        }
    }
}

/// Structured resolver result. Cancellation is a value, not an error, and
/// callers must treat it as a full abort of the running phase.
#[derive(Debug)]
pub enum Outcome {
    Success {
        strategy: Strategy,
        backup_id: Option<String>,
        message: String,
    },
    Cancelled,
    Failed {
        reason: String,
        backup_id: Option<String>,
    },
}

impl Outcome {
    pub fn message(&self) -> String {
        match self {
            Outcome::Success { message, .. } => message.clone(),
            Outcome::Cancelled => CANCELLED_BY_USER.to_string(),
            Outcome::Failed { reason, .. } => reason.clone(),
        }
    }
}

/// One conflicted file with all three sides. `None` means the file does not
/// exist on that side (add/add or modify/delete conflicts).
#[derive(Debug, Clone)]
pub struct ConflictEntry {
    pub path: String,
    pub base: Option<String>,
    pub ours: Option<String>,
    pub theirs: Option<String>,
}

impl ConflictEntry {
    pub fn is_binary(&self) -> bool {
        [&self.base, &self.ours, &self.theirs]
            .into_iter()
            .flatten()
            .any(|content| merge::is_binary(content.as_bytes()))
    }
}

/// Reads the conflict set from the index, alphabetically ordered.
pub fn collect_conflicts(vault: &Path) -> Result<Vec<ConflictEntry>> {
    let files = ops::conflicted_files(vault)?;
    files
        .into_iter()
        .map(|path| {
            Ok(ConflictEntry {
                base: ops::show_stage(vault, 1, &path)?,
                ours: ops::show_stage(vault, 2, &path)?,
                theirs: ops::show_stage(vault, 3, &path)?,
                path,
            })
        })
        .collect()
}

/// Per-file action in Stage 2. `Abort` stops resolution with a failure;
/// `CancelAll` stops it with the cancellation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChoice {
    KeepLocal,
    KeepRemote,
    AutoMerge,
    ManualMerge,
    Abort,
    CancelAll,
}

/// Host interface for the Stage-1 strategy dialog. `None` means the user
/// cancelled.
pub trait StrategyPrompt {
    fn choose_strategy(&self, state: &RepositoryState) -> Option<Strategy>;
}

/// Host interface for the Stage-2 per-file dialog and the three-pane manual
/// merge editor.
pub trait FilePrompt {
    fn choose(&mut self, entry: &ConflictEntry, index: usize, total: usize) -> FileChoice;

    /// Presents the manual merge editor, seeded with `premerged` (the auto
    /// merge output, conflict markers included). Returns the merged content
    /// to stage, or `None` when the user cancels this file.
    fn manual_merge(&mut self, entry: &ConflictEntry, premerged: &str) -> Option<String>;
}
