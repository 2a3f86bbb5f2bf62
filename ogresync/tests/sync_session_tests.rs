//! End-to-end session tests against local bare remotes.
//!
//! A bare repository in a temp directory stands in for the hosted remote; a
//! second clone simulates edits from another machine. Host dialogs are
//! scripted fakes, and the "editor session" is a hook that mutates the vault
//! and/or the remote while the orchestrator is waiting.

use std::collections::VecDeque;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use ogresync::backup::{BackupKind, BackupManager};
use ogresync::config::{self, ConfigStore};
use ogresync::editor::EditorSession;
use ogresync::git::ops;
use ogresync::inspect::{self, RepositoryState};
use ogresync::progress::UiSink;
use ogresync::resolve::{ConflictEntry, FileChoice, FilePrompt, Strategy, StrategyPrompt};
use ogresync::sync::{self, RecoveryChoice, RecoveryPrompt, SessionOutcome, SyncHooks};

// --- local fixtures (kept test-local on purpose) ---------------------------

fn hermetic_git_env() {
    env::set_var("GIT_CONFIG_NOSYSTEM", "true");
    env::set_var("GIT_CONFIG_GLOBAL", "/dev/null");
    env::set_var("GIT_AUTHOR_NAME", "testuser");
    env::set_var("GIT_AUTHOR_EMAIL", "testuser@example.com");
    env::set_var("GIT_COMMITTER_NAME", "testuser");
    env::set_var("GIT_COMMITTER_EMAIL", "testuser@example.com");
}

fn run_git(args: &[&str], dir: &Path) {
    assert!(
        Command::new("git")
            .args(args)
            .envs([
                ("GIT_CONFIG_NOSYSTEM", "true"),
                ("GIT_CONFIG_GLOBAL", "/dev/null"),
                ("GIT_AUTHOR_NAME", "testuser"),
                ("GIT_AUTHOR_EMAIL", "testuser@example.com"),
                ("GIT_COMMITTER_NAME", "testuser"),
                ("GIT_COMMITTER_EMAIL", "testuser@example.com"),
            ])
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("Failed to spawn git command")
            .success(),
        "git {args:?} failed in {dir:?}"
    );
}

fn commit_file(dir: &Path, rel_path: &str, content: &str, message: &str) {
    let path = dir.join(rel_path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
    run_git(&["add", "-A"], dir);
    run_git(&["commit", "-m", message], dir);
}

struct Fixture {
    vault: TempDir,
    remote: TempDir,
    config_dir: TempDir,
}

impl Fixture {
    /// Bare remote plus an empty, unconfigured vault directory.
    fn new() -> Self {
        hermetic_git_env();
        let remote = tempdir().unwrap();
        run_git(&["init", "--bare", "--initial-branch", "main"], remote.path());
        Fixture {
            vault: tempdir().unwrap(),
            remote,
            config_dir: tempdir().unwrap(),
        }
    }

    /// A vault already linked and synced with the remote, seeded with files.
    fn linked(seed: &[(&str, &str)]) -> Self {
        let fixture = Fixture::new();
        let vault = fixture.vault.path();
        run_git(&["init", "--initial-branch", "main"], vault);
        for (rel_path, content) in seed {
            commit_file(vault, rel_path, content, &format!("seed {rel_path}"));
        }
        run_git(
            &["remote", "add", "origin", fixture.remote_url().as_str()],
            vault,
        );
        run_git(&["push", "-u", "origin", "main"], vault);
        fixture
    }

    fn remote_url(&self) -> String {
        self.remote.path().to_string_lossy().into_owned()
    }

    fn config(&self) -> ConfigStore {
        self.config_with_remote(&self.remote_url())
    }

    fn config_with_remote(&self, remote_url: &str) -> ConfigStore {
        let mut store =
            ConfigStore::open(self.config_dir.path().join("config.txt")).unwrap();
        store.set(config::VAULT_PATH, &self.vault.path().to_string_lossy());
        store.set(config::REMOTE_URL, remote_url);
        store.set(config::SETUP_DONE, "1");
        store.save().unwrap();
        store
    }

    /// Clone the remote to simulate another machine.
    fn second_machine(&self) -> TempDir {
        let clone = tempdir().unwrap();
        run_git(
            &[
                "clone",
                self.remote_url().as_str(),
                clone.path().to_str().unwrap(),
            ],
            self.remote.path(),
        );
        clone
    }

    /// Current remote tip, read via a throwaway clone.
    fn remote_file(&self, rel_path: &str) -> Option<String> {
        let checkout = self.second_machine();
        fs::read_to_string(checkout.path().join(rel_path)).ok()
    }
}

// --- scripted hosts --------------------------------------------------------

struct NullUi;

impl UiSink for NullUi {
    fn log(&self, _message: &str, _percent: Option<u8>) {}
}

struct PanicStrategy;

impl StrategyPrompt for PanicStrategy {
    fn choose_strategy(&self, _state: &RepositoryState) -> Option<Strategy> {
        panic!("no conflict dialog was expected in this scenario");
    }
}

struct ScriptedStrategy {
    choices: Mutex<VecDeque<Option<Strategy>>>,
}

impl ScriptedStrategy {
    fn new(choices: Vec<Option<Strategy>>) -> Self {
        ScriptedStrategy {
            choices: Mutex::new(choices.into()),
        }
    }
}

impl StrategyPrompt for ScriptedStrategy {
    fn choose_strategy(&self, _state: &RepositoryState) -> Option<Strategy> {
        self.choices
            .lock()
            .unwrap()
            .pop_front()
            .expect("strategy prompt consulted more often than scripted")
    }
}

struct PanicFiles;

impl FilePrompt for PanicFiles {
    fn choose(&mut self, entry: &ConflictEntry, _index: usize, _total: usize) -> FileChoice {
        panic!("no per-file resolution was expected, got conflict in {}", entry.path);
    }
    fn manual_merge(&mut self, _entry: &ConflictEntry, _premerged: &str) -> Option<String> {
        panic!("no manual merge was expected");
    }
}

struct ScriptedFiles {
    choices: VecDeque<FileChoice>,
    manual: VecDeque<Option<String>>,
}

impl FilePrompt for ScriptedFiles {
    fn choose(&mut self, _entry: &ConflictEntry, _index: usize, _total: usize) -> FileChoice {
        self.choices.pop_front().expect("unexpected file prompt")
    }
    fn manual_merge(&mut self, _entry: &ConflictEntry, _premerged: &str) -> Option<String> {
        self.manual.pop_front().expect("unexpected manual merge")
    }
}

struct PanicRecovery;

impl RecoveryPrompt for PanicRecovery {
    fn choose(&self, missing_vault: &Path) -> RecoveryChoice {
        panic!("vault recovery was not expected for {missing_vault:?}");
    }
    fn select_directory(&self) -> Option<PathBuf> {
        None
    }
}

/// Editor stand-in: `launch` runs the scripted session body, `is_running`
/// is immediately false, so the orchestrator proceeds straight to the
/// post-editor phase.
struct HookEditor {
    on_launch: Option<Box<dyn FnOnce() + Send>>,
}

impl HookEditor {
    fn noop() -> Self {
        HookEditor { on_launch: None }
    }

    fn with(hook: impl FnOnce() + Send + 'static) -> Self {
        HookEditor {
            on_launch: Some(Box::new(hook)),
        }
    }
}

impl EditorSession for HookEditor {
    fn launch(&mut self) -> anyhow::Result<()> {
        if let Some(hook) = self.on_launch.take() {
            hook();
        }
        Ok(())
    }
    fn is_running(&mut self) -> bool {
        false
    }
}

fn run_session_with(
    config: &mut ConfigStore,
    strategy: &dyn StrategyPrompt,
    files: &mut dyn FilePrompt,
    editor: &mut dyn EditorSession,
    launch_editor: bool,
) -> SessionOutcome {
    let mut hooks = SyncHooks {
        ui: &NullUi,
        strategy,
        files,
        recovery: &PanicRecovery,
        editor,
        editor_poll: Duration::from_millis(1),
    };
    sync::run_session(config, &mut hooks, launch_editor).expect("session errored")
}

// --- scenarios -------------------------------------------------------------

/// Scenario 1: fresh vault, remote has files. The local tree is replaced by
/// remote content, the placeholder-only state survives on a backup branch,
/// and no conflict dialog appears.
#[test]
fn fresh_vault_adopts_remote_content() {
    let fixture = Fixture::new();

    // Seed the remote from a separate clone.
    let seeder = fixture.second_machine();
    commit_file(seeder.path(), "notes.md", "remote note\n", "add notes");
    commit_file(seeder.path(), "daily/today.md", "entry\n", "add daily");
    run_git(&["push", "origin", "main"], seeder.path());

    let mut config = fixture.config();
    let outcome = run_session_with(
        &mut config,
        &PanicStrategy,
        &mut PanicFiles,
        &mut HookEditor::noop(),
        false,
    );

    let SessionOutcome::Completed(markers) = outcome else {
        panic!("expected a completed session, got {outcome:?}");
    };
    assert!(!markers.offline);
    assert!(markers.pushed);
    let backup_id = markers.backup_id.expect("adoption must leave a backup id");

    let vault = fixture.vault.path();
    assert_eq!(
        fs::read_to_string(vault.join("notes.md")).unwrap(),
        "remote note\n"
    );
    assert_eq!(
        fs::read_to_string(vault.join("daily/today.md")).unwrap(),
        "entry\n"
    );

    // The placeholder-only state is retrievable from the backup branch.
    let manager = BackupManager::new(vault).unwrap();
    let record = manager
        .list()
        .into_iter()
        .find(|record| record.backup_id == backup_id)
        .expect("backup id must be registered");
    assert_eq!(record.backup_type, BackupKind::GitBranch);
    let branch = record.git_branch_name.unwrap();
    assert!(ops::branch_exists(vault, &branch));
    let backed_up = ops::ls_tree(vault, &branch).unwrap();
    assert!(backed_up.contains(&"README.md".to_string()));

    // The adoption reset dropped the local .gitignore; the backup exclusions
    // must still hold for everything committed afterwards.
    assert!(fixture
        .remote_file(".ogresync-backups/backup_registry.json")
        .is_none());
}

/// Scenario 2: local-only edit. One commit is added and pushed, no dialog.
#[test]
fn local_edit_is_committed_and_pushed() {
    let fixture = Fixture::linked(&[("notes.md", "original\n")]);
    let vault_path = fixture.vault.path().to_path_buf();

    let mut editor = HookEditor::with(move || {
        fs::write(vault_path.join("notes.md"), "edited locally\n").unwrap();
    });

    let mut config = fixture.config();
    let outcome = run_session_with(
        &mut config,
        &PanicStrategy,
        &mut PanicFiles,
        &mut editor,
        true,
    );

    let SessionOutcome::Completed(markers) = outcome else {
        panic!("expected a completed session, got {outcome:?}");
    };
    assert!(markers.local_changes_committed);
    assert!(markers.pushed);
    assert!(markers.strategy_used.is_none());

    assert_eq!(
        fixture.remote_file("notes.md").unwrap(),
        "edited locally\n"
    );
}

/// Scenario 3: the remote advances by an unrelated commit during the editor
/// session. Post-sync detects the advancement, smart merge completes without
/// per-file resolution, and the merge is pushed.
#[test]
fn remote_advance_during_session_smart_merges() {
    let fixture = Fixture::linked(&[("notes.md", "shared\n")]);
    let vault_path = fixture.vault.path().to_path_buf();
    let machine2 = fixture.second_machine();
    let machine2_path = machine2.path().to_path_buf();

    let mut editor = HookEditor::with(move || {
        fs::write(vault_path.join("local.md"), "written this session\n").unwrap();
        commit_file(&machine2_path, "other.md", "from machine 2\n", "unrelated");
        run_git(&["push", "origin", "main"], &machine2_path);
    });

    let strategy = ScriptedStrategy::new(vec![Some(Strategy::SmartMerge)]);
    let mut config = fixture.config();
    let outcome = run_session_with(&mut config, &strategy, &mut PanicFiles, &mut editor, true);

    let SessionOutcome::Completed(markers) = outcome else {
        panic!("expected a completed session, got {outcome:?}");
    };
    assert_eq!(markers.strategy_used, Some(Strategy::SmartMerge));
    assert!(markers.pushed);
    assert!(markers.backup_id.is_some());

    assert_eq!(
        fixture.remote_file("local.md").unwrap(),
        "written this session\n"
    );
    assert_eq!(
        fixture.remote_file("other.md").unwrap(),
        "from machine 2\n"
    );
}

/// Scenario 4: both sides edit the same line. Smart merge escalates to the
/// file resolver; the manual merge result is committed and unrelated files
/// are untouched.
#[test]
fn same_line_conflict_resolved_manually() {
    let fixture = Fixture::linked(&[("notes.md", "line one\n"), ("keep.md", "untouched\n")]);
    let vault_path = fixture.vault.path().to_path_buf();
    let machine2 = fixture.second_machine();
    let machine2_path = machine2.path().to_path_buf();

    let mut editor = HookEditor::with(move || {
        fs::write(vault_path.join("notes.md"), "line one local\n").unwrap();
        commit_file(&machine2_path, "notes.md", "line one remote\n", "remote edit");
        run_git(&["push", "origin", "main"], &machine2_path);
    });

    let strategy = ScriptedStrategy::new(vec![Some(Strategy::SmartMerge)]);
    let mut files = ScriptedFiles {
        choices: VecDeque::from(vec![FileChoice::ManualMerge]),
        manual: VecDeque::from(vec![Some("line one merged\n".to_string())]),
    };

    let mut config = fixture.config();
    let outcome = run_session_with(&mut config, &strategy, &mut files, &mut editor, true);

    let SessionOutcome::Completed(markers) = outcome else {
        panic!("expected a completed session, got {outcome:?}");
    };
    assert!(markers.pushed);

    assert_eq!(fixture.remote_file("notes.md").unwrap(), "line one merged\n");
    assert_eq!(fixture.remote_file("keep.md").unwrap(), "untouched\n");
    assert_eq!(
        fs::read_to_string(fixture.vault.path().join("notes.md")).unwrap(),
        "line one merged\n"
    );
}

/// Scenario 5: the user cancels at Stage 1. Working tree and refs stay as
/// they were before the dialog; local commits remain unpushed.
#[test]
fn stage1_cancel_leaves_everything_unchanged() {
    let fixture = Fixture::linked(&[("notes.md", "line one\n")]);
    let vault_path = fixture.vault.path().to_path_buf();
    let machine2 = fixture.second_machine();
    let machine2_path = machine2.path().to_path_buf();

    let mut editor = HookEditor::with(move || {
        fs::write(vault_path.join("notes.md"), "line one local\n").unwrap();
        commit_file(&machine2_path, "notes.md", "line one remote\n", "remote edit");
        run_git(&["push", "origin", "main"], &machine2_path);
    });

    let strategy = ScriptedStrategy::new(vec![None]);
    let mut config = fixture.config();
    let outcome = run_session_with(&mut config, &strategy, &mut PanicFiles, &mut editor, true);

    let SessionOutcome::Aborted { reason } = outcome else {
        panic!("expected an aborted session, got {outcome:?}");
    };
    assert!(reason.contains("cancelled by user"));

    let vault = fixture.vault.path();
    // Local commit exists but was not pushed; the tree still shows the local edit.
    assert_eq!(
        fs::read_to_string(vault.join("notes.md")).unwrap(),
        "line one local\n"
    );
    assert!(!inspect::unpushed_commits(vault).unwrap().is_empty());
    // The remote tip is exactly what machine 2 pushed.
    assert_eq!(fixture.remote_file("notes.md").unwrap(), "line one remote\n");
    // No merge is in progress.
    assert!(ops::conflicted_files(vault).unwrap().is_empty());
}

/// Scenario 6: an offline session commits locally without remote operations;
/// the next online session pushes the pending commits.
#[test]
fn offline_session_then_online_push() {
    let fixture = Fixture::linked(&[("notes.md", "start\n")]);
    let vault_path = fixture.vault.path().to_path_buf();

    // First session: unreachable probe endpoint forces offline mode.
    let mut editor = HookEditor::with(move || {
        fs::write(vault_path.join("notes.md"), "offline edit\n").unwrap();
    });
    let mut config = fixture.config_with_remote("ssh://127.0.0.1:1/vault.git");
    let outcome = run_session_with(
        &mut config,
        &PanicStrategy,
        &mut PanicFiles,
        &mut editor,
        true,
    );

    let SessionOutcome::Completed(markers) = outcome else {
        panic!("expected a completed session, got {outcome:?}");
    };
    assert!(markers.offline);
    assert!(markers.local_changes_committed);
    assert!(!markers.pushed);
    assert_eq!(fixture.remote_file("notes.md").unwrap(), "start\n");
    assert_eq!(
        inspect::unpushed_commits(fixture.vault.path()).unwrap().len(),
        1
    );

    // Second session: back online, no edits; the pending commit is pushed.
    let mut config = fixture.config();
    let outcome = run_session_with(
        &mut config,
        &PanicStrategy,
        &mut PanicFiles,
        &mut HookEditor::noop(),
        false,
    );

    let SessionOutcome::Completed(markers) = outcome else {
        panic!("expected a completed session, got {outcome:?}");
    };
    assert!(!markers.offline);
    assert!(markers.pushed);
    assert_eq!(fixture.remote_file("notes.md").unwrap(), "offline edit\n");
    assert!(inspect::unpushed_commits(fixture.vault.path())
        .unwrap()
        .is_empty());
}

/// Running a full sync twice with no external change yields no new commits.
#[test]
fn sync_is_idempotent_without_changes() {
    let fixture = Fixture::linked(&[("notes.md", "stable\n")]);

    let mut config = fixture.config();
    let outcome = run_session_with(
        &mut config,
        &PanicStrategy,
        &mut PanicFiles,
        &mut HookEditor::noop(),
        false,
    );
    assert!(matches!(outcome, SessionOutcome::Completed(_)));

    let head_after_first = ops::head_commit(fixture.vault.path()).unwrap();

    let outcome = run_session_with(
        &mut config,
        &PanicStrategy,
        &mut PanicFiles,
        &mut HookEditor::noop(),
        false,
    );
    let SessionOutcome::Completed(markers) = outcome else {
        panic!("expected a completed session");
    };
    assert!(!markers.local_changes_committed);
    assert_eq!(ops::head_commit(fixture.vault.path()).unwrap(), head_after_first);
}

/// `.ogresync-backups/` never appears in any commit made by the orchestrator.
#[test]
fn backups_are_never_committed() {
    let fixture = Fixture::linked(&[("notes.md", "x\n")]);
    let vault_path = fixture.vault.path().to_path_buf();

    let mut editor = HookEditor::with(move || {
        fs::write(vault_path.join("notes.md"), "y\n").unwrap();
    });
    let mut config = fixture.config();
    let outcome = run_session_with(
        &mut config,
        &PanicStrategy,
        &mut PanicFiles,
        &mut editor,
        true,
    );
    assert!(matches!(outcome, SessionOutcome::Completed(_)));

    // The session registered at least one backup on disk by now.
    let vault = fixture.vault.path();
    assert!(vault.join(".ogresync-backups").is_dir());

    let tracked = ops::ls_tree(vault, "HEAD").unwrap();
    assert!(
        tracked
            .iter()
            .all(|path| !path.starts_with(".ogresync-backups")),
        "backup artifacts leaked into a commit: {tracked:?}"
    );
    assert!(fixture
        .remote_file(".ogresync-backups/backup_registry.json")
        .is_none());
}

/// Keep-Remote preserves the pre-resolution state on its backup branch.
#[test]
fn keep_remote_backup_restores_prior_tree() {
    let fixture = Fixture::linked(&[("notes.md", "line one\n")]);
    let vault_path = fixture.vault.path().to_path_buf();
    let machine2 = fixture.second_machine();
    let machine2_path = machine2.path().to_path_buf();

    let mut editor = HookEditor::with(move || {
        fs::write(vault_path.join("notes.md"), "line one local\n").unwrap();
        commit_file(&machine2_path, "notes.md", "line one remote\n", "remote edit");
        run_git(&["push", "origin", "main"], &machine2_path);
    });

    let strategy = ScriptedStrategy::new(vec![Some(Strategy::KeepRemote)]);
    let mut config = fixture.config();
    let outcome = run_session_with(&mut config, &strategy, &mut PanicFiles, &mut editor, true);

    let SessionOutcome::Completed(markers) = outcome else {
        panic!("expected a completed session, got {outcome:?}");
    };
    assert_eq!(markers.strategy_used, Some(Strategy::KeepRemote));

    let vault = fixture.vault.path();
    assert_eq!(
        fs::read_to_string(vault.join("notes.md")).unwrap(),
        "line one remote\n"
    );

    // The local edit that was committed this session survives on the backup branch.
    let backup_id = markers.backup_id.expect("keep-remote must leave a backup");
    let manager = BackupManager::new(vault).unwrap();
    let record = manager
        .list()
        .into_iter()
        .find(|record| record.backup_id == backup_id)
        .unwrap();
    let branch = record.git_branch_name.expect("backup should be a branch");
    let show = Command::new("git")
        .args(["show", &format!("{branch}:notes.md")])
        .current_dir(vault)
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&show.stdout), "line one local\n");
}
