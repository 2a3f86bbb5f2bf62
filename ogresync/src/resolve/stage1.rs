//! Stage-1 strategy resolver.
//!
//! Every strategy takes a safety backup before touching the repository, and
//! every mechanism keeps remote history reachable: keep-local records the
//! remote commits as merged ancestors, keep-remote parks the prior local
//! state on the backup branch, smart merge is a plain merge.

use std::path::Path;

use anyhow::Result;
use log::warn;

use crate::backup::{BackupManager, BackupReason};
use crate::git::ops::{self, MergeOutcome};
use crate::inspect::RepositoryState;
use crate::progress::UiSink;

use super::{
    collect_conflicts, stage2, FilePrompt, Outcome, Strategy, StrategyPrompt,
};

/// Presents the strategy choice and applies the selected strategy, driving
/// Stage 2 when a smart merge leaves conflicts.
pub fn resolve_divergence(
    vault: &Path,
    backups: &BackupManager,
    state: &RepositoryState,
    strategy_prompt: &dyn StrategyPrompt,
    file_prompt: &mut dyn FilePrompt,
    ui: &dyn UiSink,
) -> Result<Outcome> {
    let Some(strategy) = strategy_prompt.choose_strategy(state) else {
        ui.log("Conflict resolution cancelled by user", None);
        return Ok(Outcome::Cancelled);
    };

    ui.log(&format!("Applying strategy: {strategy}"), None);
    apply_strategy(vault, backups, strategy, file_prompt, ui)
}

/// Applies a strategy that has already been chosen.
pub fn apply_strategy(
    vault: &Path,
    backups: &BackupManager,
    strategy: Strategy,
    file_prompt: &mut dyn FilePrompt,
    ui: &dyn UiSink,
) -> Result<Outcome> {
    let backup_id = backups.create(
        BackupReason::ConflictResolution,
        &format!("Before conflict resolution: {strategy} strategy"),
        None,
    );
    if backup_id.is_none() {
        warn!("proceeding without a safety backup");
    }

    if let Err(err) = ops::fetch_origin(vault) {
        return Ok(Outcome::Failed {
            reason: format!("could not fetch remote: {err}"),
            backup_id,
        });
    }

    match strategy {
        Strategy::KeepLocal => match ops::merge_ours_origin_main(vault) {
            Ok(()) => Ok(Outcome::Success {
                strategy,
                backup_id,
                message: "Local files kept; remote history recorded as merged".to_string(),
            }),
            Err(err) => {
                restore_clean_state(vault);
                Ok(Outcome::Failed {
                    reason: format!("keep-local merge failed: {err}"),
                    backup_id,
                })
            }
        },
        Strategy::KeepRemote => match ops::reset_hard(vault, ops::ORIGIN_MAIN) {
            Ok(()) => Ok(Outcome::Success {
                strategy,
                backup_id: backup_id.clone(),
                message: format!(
                    "Remote files adopted; previous local state preserved in backup {}",
                    backup_id.as_deref().unwrap_or("<none>")
                ),
            }),
            Err(err) => Ok(Outcome::Failed {
                reason: format!("keep-remote reset failed: {err}"),
                backup_id,
            }),
        },
        Strategy::SmartMerge => match ops::merge_origin_main(vault) {
            Ok(MergeOutcome::Clean) => Ok(Outcome::Success {
                strategy,
                backup_id,
                message: "Smart merge completed without conflicts".to_string(),
            }),
            Ok(MergeOutcome::Conflicts(files)) => {
                ui.log(
                    &format!("Smart merge found {} conflicting file(s)", files.len()),
                    None,
                );
                let conflicts = collect_conflicts(vault)?;
                if conflicts.is_empty() {
                    // Conflict state without unmerged index entries; nothing
                    // to resolve file by file.
                    restore_clean_state(vault);
                    return Ok(Outcome::Failed {
                        reason: "merge stopped without a resolvable conflict set".to_string(),
                        backup_id,
                    });
                }
                stage2::resolve_files(vault, &conflicts, backup_id, file_prompt, ui)
            }
            Err(err) => {
                restore_clean_state(vault);
                Ok(Outcome::Failed {
                    reason: format!("smart merge failed: {err}"),
                    backup_id,
                })
            }
        },
    }
}

// Best-effort return to a clean working tree after a failed strategy step.
fn restore_clean_state(vault: &Path) {
    let _ = ops::merge_abort(vault);
    if ops::is_mid_merge(vault) {
        let _ = ops::reset_hard(vault, "ORIG_HEAD");
    }
}
