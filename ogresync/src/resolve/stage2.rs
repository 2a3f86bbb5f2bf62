//! Stage-2 file-by-file resolver.
//!
//! Invoked with a non-empty conflict set mid-merge. Every file must end up
//! staged before the single merge commit is created; leaving the loop early
//! aborts the merge and restores the pre-merge state.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::debug;

use crate::git::ops;
use crate::progress::UiSink;

use super::{merge, ConflictEntry, FileChoice, FilePrompt, Outcome, Strategy};

pub fn resolve_files(
    vault: &Path,
    conflicts: &[ConflictEntry],
    backup_id: Option<String>,
    prompt: &mut dyn FilePrompt,
    ui: &dyn UiSink,
) -> Result<Outcome> {
    let total = conflicts.len();

    for (index, entry) in conflicts.iter().enumerate() {
        let percent = ((index * 100) / total) as u8;
        ui.log(
            &format!("Resolving {} ({} of {})", entry.path, index + 1, total),
            Some(percent),
        );

        loop {
            let choice = prompt.choose(entry, index, total);

            if entry.is_binary()
                && matches!(choice, FileChoice::AutoMerge | FileChoice::ManualMerge)
            {
                ui.log(
                    &format!(
                        "{} is binary; only keep-local or keep-remote apply",
                        entry.path
                    ),
                    None,
                );
                continue;
            }

            match choice {
                FileChoice::KeepLocal => {
                    stage_content(vault, &entry.path, entry.ours.as_deref())?;
                    break;
                }
                FileChoice::KeepRemote => {
                    stage_content(vault, &entry.path, entry.theirs.as_deref())?;
                    break;
                }
                FileChoice::AutoMerge => {
                    let result = auto_merge(entry);
                    if result.clean {
                        stage_content(vault, &entry.path, Some(&result.content))?;
                        break;
                    }
                    ui.log(
                        &format!(
                            "Automatic merge of {} left overlapping changes; opening manual merge",
                            entry.path
                        ),
                        None,
                    );
                    if let Some(content) = prompt.manual_merge(entry, &result.content) {
                        stage_content(vault, &entry.path, Some(&content))?;
                        break;
                    }
                    // Manual merge cancelled for this file; back to the choice prompt.
                }
                FileChoice::ManualMerge => {
                    let premerged = auto_merge(entry);
                    if let Some(content) = prompt.manual_merge(entry, &premerged.content) {
                        stage_content(vault, &entry.path, Some(&content))?;
                        break;
                    }
                }
                FileChoice::Abort => {
                    abort_merge(vault);
                    return Ok(Outcome::Failed {
                        reason: "file resolution stopped before all conflicts were staged"
                            .to_string(),
                        backup_id,
                    });
                }
                FileChoice::CancelAll => {
                    abort_merge(vault);
                    return Ok(Outcome::Cancelled);
                }
            }
        }
    }

    let message = format!("Resolved {total} conflicted file(s) via smart merge");
    ops::commit(vault, &message).context("Failed to create the merge commit")?;
    ui.log(&message, Some(100));

    Ok(Outcome::Success {
        strategy: Strategy::SmartMerge,
        backup_id,
        message,
    })
}

fn auto_merge(entry: &ConflictEntry) -> merge::MergeResult {
    merge::three_way_merge(
        entry.base.as_deref().unwrap_or(""),
        entry.ours.as_deref().unwrap_or(""),
        entry.theirs.as_deref().unwrap_or(""),
    )
}

// `None` content means the chosen side deleted the file.
fn stage_content(vault: &Path, rel_path: &str, content: Option<&str>) -> Result<()> {
    let file_path = vault.join(rel_path);
    match content {
        Some(content) => {
            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&file_path, content)
                .with_context(|| format!("Failed to write resolved content for {rel_path}"))?;
        }
        None => {
            let _ = fs::remove_file(&file_path);
        }
    }
    ops::add_path(vault, rel_path)?;
    debug!("staged resolution for {rel_path}");
    Ok(())
}

fn abort_merge(vault: &Path) {
    let _ = ops::merge_abort(vault);
    if ops::is_mid_merge(vault) {
        let _ = ops::reset_hard(vault, "ORIG_HEAD");
    }
}
