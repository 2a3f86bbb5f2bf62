//! The sync session state machine.
//!
//! One session brackets an editor run with a pre-editor and a post-editor
//! sync phase. All transient session state lives here and is passed
//! explicitly; the only global is the config file path. Remote refs are only
//! ever advanced by fast-forward pushes or by pushes of merge commits the
//! Stage-1 resolver created.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use log::{debug, warn};

use crate::backup::{BackupManager, BackupReason};
use crate::config::{self, ConfigStore};
use crate::editor::{self, EditorSession};
use crate::git::ops::{self, MergeOutcome};
use crate::git::types::GitError;
use crate::inspect;
use crate::offline::{self, OfflineLedger, SessionMode};
use crate::progress::UiSink;
use crate::resolve::{stage1, FilePrompt, Outcome, Strategy, StrategyPrompt, CANCELLED_BY_USER};

pub const PLACEHOLDER_FILE: &str = "README.md";
const PLACEHOLDER_CONTENT: &str =
    "# Welcome to your vault\n\nThis file was created so the vault has an initial commit.\n";

const PUSH_BACKOFF_MAX_ELAPSED: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChoice {
    Recreate,
    SelectDifferent,
    RerunSetup,
    Abandon,
}

/// Host interface for the vault-recovery dialog.
pub trait RecoveryPrompt {
    fn choose(&self, missing_vault: &Path) -> RecoveryChoice;
    fn select_directory(&self) -> Option<PathBuf>;
}

/// The narrow interfaces a session needs from its host.
pub struct SyncHooks<'a> {
    pub ui: &'a dyn UiSink,
    pub strategy: &'a dyn StrategyPrompt,
    pub files: &'a mut dyn FilePrompt,
    pub recovery: &'a dyn RecoveryPrompt,
    pub editor: &'a mut dyn EditorSession,
    pub editor_poll: Duration,
}

/// Transient per-session values owned by the orchestrator.
#[derive(Debug, Default)]
pub struct SessionMarkers {
    pub remote_head_before_session: Option<String>,
    pub offline: bool,
    pub local_changes_committed: bool,
    pub strategy_used: Option<Strategy>,
    pub backup_id: Option<String>,
    pub pushed: bool,
}

#[derive(Debug)]
pub enum SessionOutcome {
    Completed(SessionMarkers),
    Aborted { reason: String },
    SetupRequested,
}

enum VaultValidation {
    Usable(PathBuf),
    Abort(String),
    Setup,
}

enum PresyncResult {
    Ready,
    WentOffline,
    Aborted(String),
}

/// Runs one full session: VALIDATE_VAULT through POSTSYNC.
pub fn run_session(
    config: &mut ConfigStore,
    hooks: &mut SyncHooks,
    launch_editor: bool,
) -> Result<SessionOutcome> {
    let vault = match validate_vault(config, hooks)? {
        VaultValidation::Usable(vault) => vault,
        VaultValidation::Abort(reason) => return Ok(SessionOutcome::Aborted { reason }),
        VaultValidation::Setup => return Ok(SessionOutcome::SetupRequested),
    };

    let backups = BackupManager::new(&vault)?;
    let mut markers = SessionMarkers::default();

    ensure_baseline(&vault, hooks.ui)?;

    let remote_url = config.get(config::REMOTE_URL);
    let mut mode = offline::detect(&remote_url, hooks.ui);
    markers.offline = mode == SessionMode::Offline;

    let ledger = match mode {
        SessionMode::Online => {
            match online_presync(&vault, &remote_url, &backups, &mut markers, hooks)? {
                PresyncResult::Ready => None,
                PresyncResult::WentOffline => {
                    mode = SessionMode::Offline;
                    markers.offline = true;
                    Some(OfflineLedger::begin(&vault, hooks.ui))
                }
                PresyncResult::Aborted(reason) => {
                    return Ok(SessionOutcome::Aborted { reason })
                }
            }
        }
        SessionMode::Offline => Some(OfflineLedger::begin(&vault, hooks.ui)),
    };

    if launch_editor {
        hooks.ui.log("Launching editor...", Some(40));
        hooks.editor.launch()?;
        hooks.ui.log("Waiting for the editor to close...", Some(50));
        editor::wait_until_closed(hooks.editor, hooks.ui, hooks.editor_poll);
        hooks.ui.log("Editor closed", Some(60));
    }

    markers.local_changes_committed = commit_local(&vault, hooks.ui)?;

    if mode == SessionMode::Offline {
        if let Some(ledger) = &ledger {
            ledger.finish(&vault, hooks.ui);
        }
        return Ok(SessionOutcome::Completed(markers));
    }

    match postsync(&vault, &remote_url, &backups, &mut markers, hooks)? {
        PostsyncResult::Pushed => {
            markers.pushed = true;
            hooks.ui.log("Sync complete", Some(100));
            Ok(SessionOutcome::Completed(markers))
        }
        PostsyncResult::KeptLocal(reason) => {
            hooks.ui.log(&reason, Some(100));
            Ok(SessionOutcome::Completed(markers))
        }
        PostsyncResult::Aborted(reason) => Ok(SessionOutcome::Aborted { reason }),
    }
}

// --- VALIDATE_VAULT / RECOVER_VAULT ---------------------------------------

fn vault_usable(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    // Readability and writability are what matter, not permission bits.
    let probe = path.join(".ogresync-write-probe");
    match fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

fn validate_vault(config: &mut ConfigStore, hooks: &mut SyncHooks) -> Result<VaultValidation> {
    let configured = config.get(config::VAULT_PATH);
    if configured.is_empty() {
        return Ok(VaultValidation::Setup);
    }

    let path = PathBuf::from(&configured);
    if vault_usable(&path) {
        return Ok(VaultValidation::Usable(path));
    }

    hooks
        .ui
        .log(&format!("Vault not found at {configured}"), None);

    loop {
        match hooks.recovery.choose(&path) {
            RecoveryChoice::Recreate => {
                match recreate_vault(&path, &config.get(config::REMOTE_URL), hooks) {
                    Ok(true) => return Ok(VaultValidation::Usable(path)),
                    Ok(false) => {
                        return Ok(VaultValidation::Abort(CANCELLED_BY_USER.to_string()))
                    }
                    Err(err) => {
                        hooks
                            .ui
                            .log(&format!("Vault recreation failed: {err:#}"), None);
                    }
                }
            }
            RecoveryChoice::SelectDifferent => {
                let Some(selected) = hooks.recovery.select_directory() else {
                    continue;
                };
                if !vault_usable(&selected) {
                    hooks.ui.log(
                        &format!("{} is not a usable directory", selected.display()),
                        None,
                    );
                    continue;
                }
                config.set(config::VAULT_PATH, &selected.to_string_lossy());
                config.save()?;
                return Ok(VaultValidation::Usable(selected));
            }
            RecoveryChoice::RerunSetup => return Ok(VaultValidation::Setup),
            RecoveryChoice::Abandon => {
                return Ok(VaultValidation::Abort("vault recovery abandoned".to_string()))
            }
        }
    }
}

/// Recreates a missing vault: init, re-link the saved remote, pull. Returns
/// false when a pull conflict was cancelled by the user.
fn recreate_vault(path: &Path, remote_url: &str, hooks: &mut SyncHooks) -> Result<bool> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to recreate vault directory {}", path.display()))?;
    if !ops::is_repository(path) {
        ops::init(path)?;
    }
    ensure_baseline(path, hooks.ui)?;

    if remote_url.is_empty() {
        warn!("no saved remote URL; recreated vault stays unlinked");
        return Ok(true);
    }
    if ops::remote_get_url(path).is_none() {
        ops::remote_add(path, remote_url)?;
    }

    match ops::pull_unrelated(path) {
        Ok(MergeOutcome::Clean) => Ok(true),
        Ok(MergeOutcome::Conflicts(_)) => {
            let _ = ops::merge_abort(path);
            let backups = BackupManager::new(path)?;
            let state = inspect::classify(path)?;
            let outcome = stage1::resolve_divergence(
                path,
                &backups,
                &state,
                hooks.strategy,
                hooks.files,
                hooks.ui,
            )?;
            match outcome {
                Outcome::Success { .. } => Ok(true),
                Outcome::Cancelled => Ok(false),
                Outcome::Failed { reason, .. } => Err(anyhow!(reason)),
            }
        }
        Err(GitError::RemoteUnreachable { .. }) => {
            hooks
                .ui
                .log("Remote unreachable; recreated vault will sync later", None);
            Ok(true)
        }
        Err(err) => Err(err.into()),
    }
}

// --- ENSURE_BASELINE ------------------------------------------------------

/// Guarantees an initialized repository with at least one commit on `main`.
/// A placeholder is created only for an entirely empty working tree.
pub fn ensure_baseline(vault: &Path, ui: &dyn UiSink) -> Result<()> {
    if !ops::is_repository(vault) {
        ui.log("Initializing vault repository", None);
        ops::init(vault)?;
    }
    ensure_git_identity(vault);

    if !ops::has_commits(vault) {
        if working_tree_is_empty(vault)? {
            debug!("empty working tree; writing placeholder {PLACEHOLDER_FILE}");
            fs::write(vault.join(PLACEHOLDER_FILE), PLACEHOLDER_CONTENT)?;
        }
        ops::add_all(vault)?;
        if !ops::commit(vault, "Initial commit")? {
            // Everything present is gitignored; an empty commit still gives
            // the branch a root.
            ops::commit_allow_empty(vault, "Initial commit")?;
        }
    }

    ops::set_branch_main(vault)?;
    Ok(())
}

/// Repo-local identity defaults so commits never fail on a missing identity.
pub fn ensure_git_identity(vault: &Path) {
    if ops::config_get(vault, "user.name").is_none() {
        if let Err(err) = ops::config_set(vault, "user.name", "Ogresync User") {
            warn!("could not set a default git user name: {err}");
        }
    }
    if ops::config_get(vault, "user.email").is_none() {
        if let Err(err) = ops::config_set(vault, "user.email", "ogresync@example.com") {
            warn!("could not set a default git user email: {err}");
        }
    }
}

// Ogresync's own bookkeeping does not make a vault non-empty.
fn working_tree_is_empty(vault: &Path) -> Result<bool> {
    for entry in fs::read_dir(vault)? {
        let entry = entry?;
        let name = entry.file_name();
        if name != ".git" && name != ".gitignore" && name != crate::backup::BACKUP_DIR_NAME {
            return Ok(false);
        }
    }
    Ok(true)
}

// --- ONLINE_PRESYNC -------------------------------------------------------

fn online_presync(
    vault: &Path,
    remote_url: &str,
    backups: &BackupManager,
    markers: &mut SessionMarkers,
    hooks: &mut SyncHooks,
) -> Result<PresyncResult> {
    hooks.ui.log("Checking remote repository state...", Some(10));

    // Self-heal a missing origin (e.g. after a manual re-clone).
    if ops::remote_get_url(vault).is_none() {
        ops::remote_add(vault, remote_url)?;
    }

    match ops::remote_main_exists(vault) {
        Ok(true) => {}
        Ok(false) => {
            hooks
                .ui
                .log("Remote is empty; publishing the initial commit", Some(20));
            match ops::push_main(vault, true) {
                Ok(()) => {}
                Err(GitError::RemoteUnreachable { .. }) => return Ok(PresyncResult::WentOffline),
                Err(err) => return Err(err.into()),
            }
            markers.remote_head_before_session = ops::rev_parse(vault, ops::ORIGIN_MAIN).ok();
            return Ok(PresyncResult::Ready);
        }
        Err(GitError::RemoteUnreachable { .. }) => return Ok(PresyncResult::WentOffline),
        Err(err) => return Err(err.into()),
    }

    let state = inspect::classify(vault)?;

    // Initial sync replacement: a fresh vault holding only the placeholder
    // adopts the remote unconditionally. No dialog; the placeholder state is
    // kept on a backup branch.
    if !state.local_has_content && state.remote_has_content {
        hooks
            .ui
            .log("Fresh vault detected; adopting remote content", Some(20));
        markers.backup_id = backups.create(
            BackupReason::SyncOperation,
            "Initial sync replacement: adopting remote content",
            None,
        );
        ops::reset_hard(vault, ops::ORIGIN_MAIN)?;
        markers.remote_head_before_session = ops::rev_parse(vault, ops::ORIGIN_MAIN).ok();
        hooks.ui.log("Vault now mirrors the remote", Some(30));
        return Ok(PresyncResult::Ready);
    }

    // Uncommitted changes are parked in a stash for the pull. The stash is
    // dropped before the editor launches; its content is captured in a
    // snapshot backup first so nothing is ever lost silently.
    let dirty_paths = ops::changed_paths(vault)?;
    let stashed = if dirty_paths.is_empty() {
        false
    } else {
        markers.backup_id = backups
            .create(
                BackupReason::SyncOperation,
                "Pre-sync snapshot of uncommitted changes",
                Some(dirty_paths.as_slice()),
            )
            .or(markers.backup_id.take());
        ops::stash_push(vault, "ogresync: pre-sync stash")?
    };

    hooks.ui.log("Pulling latest changes...", Some(20));
    match ops::pull_rebase(vault) {
        Ok(MergeOutcome::Clean) => {}
        Ok(MergeOutcome::Conflicts(_)) => {
            let _ = ops::rebase_abort(vault);
            let _ = ops::merge_abort(vault);
            hooks
                .ui
                .log("Local and remote histories diverged", Some(25));
            let outcome = stage1::resolve_divergence(
                vault,
                backups,
                &state,
                hooks.strategy,
                hooks.files,
                hooks.ui,
            )?;
            hooks.ui.log(&outcome.message(), None);
            match outcome {
                Outcome::Success {
                    strategy,
                    backup_id,
                    ..
                } => {
                    markers.strategy_used = Some(strategy);
                    if backup_id.is_some() {
                        markers.backup_id = backup_id;
                    }
                }
                Outcome::Cancelled => {
                    restore_stash(vault, stashed);
                    return Ok(PresyncResult::Aborted(CANCELLED_BY_USER.to_string()));
                }
                Outcome::Failed { reason, .. } => {
                    restore_stash(vault, stashed);
                    return Ok(PresyncResult::Aborted(reason));
                }
            }
        }
        Err(GitError::RemoteUnreachable { .. }) => {
            restore_stash(vault, stashed);
            return Ok(PresyncResult::WentOffline);
        }
        Err(err) => {
            restore_stash(vault, stashed);
            return Err(err.into());
        }
    }

    if stashed {
        // Remote content takes precedence for a clean session start; the
        // stashed edits survive in the snapshot backup taken above.
        ops::stash_drop(vault)?;
    }

    markers.remote_head_before_session = ops::rev_parse(vault, ops::ORIGIN_MAIN).ok();
    hooks.ui.log("Pre-sync complete", Some(35));
    Ok(PresyncResult::Ready)
}

fn restore_stash(vault: &Path, stashed: bool) {
    if stashed {
        if let Err(err) = ops::stash_pop(vault) {
            warn!("failed to restore pre-sync stash: {err}");
        }
    }
}

// --- COMMIT_LOCAL ---------------------------------------------------------

fn commit_local(vault: &Path, ui: &dyn UiSink) -> Result<bool> {
    // The ignore entries protecting the backups directory may have been lost
    // to a remote-wins reset whose tree carried no .gitignore.
    crate::backup::ensure_gitignore_entries(vault)?;
    ops::add_all(vault)?;
    let message = format!("Ogresync auto-commit {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
    let committed = ops::commit(vault, &message)?;
    if committed {
        let touched = ops::name_status_head(vault).map(|files| files.len()).unwrap_or(0);
        ui.log(&format!("Committed local changes ({touched} file(s))"), Some(70));
    } else {
        ui.log("No local changes to commit", Some(70));
    }
    Ok(committed)
}

// --- POSTSYNC -------------------------------------------------------------

enum PostsyncResult {
    Pushed,
    KeptLocal(String),
    Aborted(String),
}

fn postsync(
    vault: &Path,
    remote_url: &str,
    backups: &BackupManager,
    markers: &mut SessionMarkers,
    hooks: &mut SyncHooks,
) -> Result<PostsyncResult> {
    hooks.ui.log("Syncing with remote...", Some(80));

    if !crate::network::online(remote_url) {
        return Ok(PostsyncResult::KeptLocal(
            "Network unavailable; commits remain local until the next online sync".to_string(),
        ));
    }

    let prior = markers.remote_head_before_session.clone().unwrap_or_default();
    let mut resolved_rejection = false;

    loop {
        let advance = match inspect::changed_since(vault, &prior) {
            Ok(advance) => advance,
            Err(err) => {
                warn!("could not check the remote for advancement: {err:#}");
                return Ok(PostsyncResult::KeptLocal(
                    "Remote unreachable; commits remain local".to_string(),
                ));
            }
        };

        // An advanced remote always goes through the resolver, even when no
        // local change was made this session; there is no implicit
        // remote-wins reset here.
        if advance.changed && advance.new_head != ops::rev_parse(vault, "HEAD").unwrap_or_default()
        {
            let already_merged = !prior.is_empty()
                && ops::rev_list_count(vault, &format!("HEAD..{}", ops::ORIGIN_MAIN))
                    .map(|count| count == 0)
                    .unwrap_or(false);
            if !already_merged {
                hooks.ui.log(
                    &format!(
                        "Remote advanced by {} commit(s) during the session",
                        advance.commit_count
                    ),
                    Some(85),
                );
                let state = inspect::classify(vault)?;
                let outcome = stage1::resolve_divergence(
                    vault,
                    backups,
                    &state,
                    hooks.strategy,
                    hooks.files,
                    hooks.ui,
                )?;
                match outcome {
                    Outcome::Success {
                        strategy,
                        backup_id,
                        ..
                    } => {
                        markers.strategy_used = Some(strategy);
                        if backup_id.is_some() {
                            markers.backup_id = backup_id;
                        }
                    }
                    Outcome::Cancelled => {
                        return Ok(PostsyncResult::Aborted(CANCELLED_BY_USER.to_string()))
                    }
                    Outcome::Failed { reason, .. } => return Ok(PostsyncResult::Aborted(reason)),
                }
            }
        }

        hooks.ui.log("Pushing local commits...", Some(90));
        match push_with_retry(vault) {
            Ok(()) => return Ok(PostsyncResult::Pushed),
            Err(GitError::PushRejected { .. }) if !resolved_rejection => {
                // Someone pushed between our advancement check and the push;
                // one more round through the same resolver path.
                resolved_rejection = true;
                continue;
            }
            Err(GitError::RemoteUnreachable { .. }) => {
                return Ok(PostsyncResult::KeptLocal(
                    "Network lost during push; commits remain local".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn push_with_retry(vault: &Path) -> Result<(), GitError> {
    let op = || {
        ops::push_main(vault, false).map_err(|err| match err {
            GitError::RemoteUnreachable { .. } => backoff::Error::transient(err),
            _ => backoff::Error::permanent(err),
        })
    };

    let backoff = ExponentialBackoffBuilder::default()
        .with_max_elapsed_time(Some(PUSH_BACKOFF_MAX_ELAPSED))
        .build();

    backoff::retry(backoff, op).map_err(|err| match err {
        backoff::Error::Permanent(err) => err,
        backoff::Error::Transient { err, .. } => err,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::progress::NullSink;
    use crate::test_helpers::{dir_with_repo, hermetic_git_env};
    use tempfile::tempdir;

    #[test]
    fn test_ensure_baseline_creates_placeholder_on_empty_tree() {
        hermetic_git_env();
        let dir = tempdir().unwrap();
        ensure_baseline(dir.path(), &NullSink).unwrap();

        assert!(dir.path().join(PLACEHOLDER_FILE).is_file());
        assert!(ops::has_commits(dir.path()));
        assert_eq!(
            ops::rev_parse(dir.path(), "refs/heads/main").is_ok(),
            true,
            "branch should be main"
        );
    }

    #[test]
    fn test_ensure_baseline_does_not_augment_nonempty_tree() {
        hermetic_git_env();
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.md"), "existing").unwrap();

        ensure_baseline(dir.path(), &NullSink).unwrap();

        assert!(!dir.path().join(PLACEHOLDER_FILE).exists());
        assert!(ops::has_commits(dir.path()));
    }

    #[test]
    fn test_ensure_baseline_is_idempotent() {
        hermetic_git_env();
        let repo = dir_with_repo();
        let head_before = ops::head_commit(repo.path()).unwrap();
        ensure_baseline(repo.path(), &NullSink).unwrap();
        assert_eq!(ops::head_commit(repo.path()).unwrap(), head_before);
    }

    #[test]
    fn test_ensure_git_identity_sets_defaults() {
        hermetic_git_env();
        let repo = dir_with_repo();
        // The hermetic env supplies identity via environment variables, not
        // git config, so the repo-local keys start out unset.
        ensure_git_identity(repo.path());
        assert_eq!(
            ops::config_get(repo.path(), "user.name"),
            Some("Ogresync User".to_string())
        );
        assert_eq!(
            ops::config_get(repo.path(), "user.email"),
            Some("ogresync@example.com".to_string())
        );

        // Existing identity is left alone.
        ops::config_set(repo.path(), "user.name", "Someone Else").unwrap();
        ensure_git_identity(repo.path());
        assert_eq!(
            ops::config_get(repo.path(), "user.name"),
            Some("Someone Else".to_string())
        );
    }

    #[test]
    fn test_vault_usable() {
        let dir = tempdir().unwrap();
        assert!(vault_usable(dir.path()));
        assert!(!vault_usable(&dir.path().join("does-not-exist")));
    }

    #[test]
    fn test_commit_local_skips_clean_tree() {
        hermetic_git_env();
        let repo = dir_with_repo();
        // The first call commits the ignore entries it asserts.
        commit_local(repo.path(), &NullSink).unwrap();
        assert!(!commit_local(repo.path(), &NullSink).unwrap());

        fs::write(repo.path().join("notes.md"), "edited").unwrap();
        assert!(commit_local(repo.path(), &NullSink).unwrap());
    }
}
