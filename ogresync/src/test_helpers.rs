//! Centralized test helpers for ogresync
//!
//! This module provides common test utilities used across unit tests and
//! integration tests, including hermetic git environment setup and
//! repository/remote fixtures.

use std::env;
use std::path::Path;
use std::process::{Command, Stdio};

use tempfile::{tempdir, TempDir};

/// Sets up a hermetic git environment by configuring environment variables
/// to isolate git operations from the user's global git configuration.
pub fn hermetic_git_env() {
    env::set_var("GIT_CONFIG_NOSYSTEM", "true");
    env::set_var("GIT_CONFIG_GLOBAL", "/dev/null");
    env::set_var("GIT_AUTHOR_NAME", "testuser");
    env::set_var("GIT_AUTHOR_EMAIL", "testuser@example.com");
    env::set_var("GIT_COMMITTER_NAME", "testuser");
    env::set_var("GIT_COMMITTER_EMAIL", "testuser@example.com");
}

/// Runs a git command in a hermetic environment with the specified directory.
///
/// # Panics
/// Panics if the git command fails or returns a non-zero exit status.
pub fn run_git_command(args: &[&str], dir: &Path) {
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

/// Initializes a repository on `main` with an initial empty commit.
pub fn init_repo(dir: &Path) {
    run_git_command(&["init", "--initial-branch", "main"], dir);
    run_git_command(&["commit", "--allow-empty", "-m", "Initial commit"], dir);
}

/// Creates a temporary directory with an initialized git repository.
pub fn dir_with_repo() -> TempDir {
    let tempdir = tempdir().unwrap();
    init_repo(tempdir.path());
    tempdir
}

/// Initializes a bare repository suitable as a local `origin`.
pub fn init_bare_remote(dir: &Path) {
    run_git_command(&["init", "--bare", "--initial-branch", "main"], dir);
}

/// Creates a temporary bare remote.
pub fn dir_with_bare_remote() -> TempDir {
    let tempdir = tempdir().unwrap();
    init_bare_remote(tempdir.path());
    tempdir
}

/// Clones `remote` into `dir` (used to simulate a second machine).
pub fn clone_repo(remote: &Path, dir: &Path) {
    run_git_command(
        &[
            "clone",
            remote.to_str().expect("remote path must be UTF-8"),
            dir.to_str().expect("clone path must be UTF-8"),
        ],
        remote.parent().unwrap_or(Path::new(".")),
    );
}

/// Writes a file and commits it, creating parent directories as needed.
pub fn commit_file(dir: &Path, rel_path: &str, content: &str, message: &str) {
    let path = dir.join(rel_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
    run_git_command(&["add", "-A"], dir);
    run_git_command(&["commit", "-m", message], dir);
}

/// RAII guard that restores the current directory when dropped.
pub struct DirGuard {
    original_dir: std::path::PathBuf,
}

impl DirGuard {
    /// Creates a new DirGuard and changes to the specified directory.
    pub fn new(new_dir: &Path) -> Self {
        let original_dir = env::current_dir().expect("Failed to get current directory");
        env::set_current_dir(new_dir).expect("Failed to change directory");
        DirGuard { original_dir }
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        let _ = env::set_current_dir(&self.original_dir);
    }
}
