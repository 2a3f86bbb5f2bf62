//! Typed wrappers around the git commands the sync engine consumes.
//!
//! Everything here goes through the subprocess runner; no command mutates
//! remote refs except [`push_main`], and no command force-pushes.

use std::path::Path;

use anyhow::{anyhow, Result};
use itertools::Itertools;

use super::runner::{capture_git_output, map_git_error};
use super::types::{GitError, GitOutput};

pub const ORIGIN: &str = "origin";
pub const MAIN_BRANCH: &str = "main";
pub const ORIGIN_MAIN: &str = "origin/main";

/// Result of a merge-like operation (merge, pull) that may leave conflicts.
#[derive(Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Clean,
    Conflicts(Vec<String>),
}

fn git(args: &[&str], vault: &Path) -> Result<GitOutput, GitError> {
    capture_git_output(args, &Some(vault))
}

pub fn init(vault: &Path) -> Result<(), GitError> {
    git(&["init"], vault).map(|_| ())
}

pub fn is_repository(vault: &Path) -> bool {
    git(&["rev-parse", "--git-dir"], vault).is_ok()
}

pub fn set_branch_main(vault: &Path) -> Result<(), GitError> {
    git(&["branch", "-M", MAIN_BRANCH], vault).map(|_| ())
}

pub fn remote_add(vault: &Path, url: &str) -> Result<(), GitError> {
    git(&["remote", "add", ORIGIN, url], vault).map(|_| ())
}

pub fn remote_remove(vault: &Path) -> Result<(), GitError> {
    git(&["remote", "remove", ORIGIN], vault).map(|_| ())
}

pub fn remote_get_url(vault: &Path) -> Option<String> {
    git(&["remote", "get-url", ORIGIN], vault)
        .ok()
        .map(|out| out.stdout.trim().to_owned())
}

pub fn fetch_origin(vault: &Path) -> Result<(), GitError> {
    git(&["fetch", ORIGIN], vault)
        .map(|_| ())
        .map_err(map_git_error)
}

/// Whether `origin/main` exists on the remote itself (not just as a tracking ref).
pub fn remote_main_exists(vault: &Path) -> Result<bool, GitError> {
    git(&["ls-remote", "--heads", ORIGIN, MAIN_BRANCH], vault)
        .map(|out| !out.stdout.trim().is_empty())
        .map_err(map_git_error)
}

pub fn ls_tree(vault: &Path, reference: &str) -> Result<Vec<String>, GitError> {
    let output = git(&["ls-tree", "-r", "--name-only", reference], vault)?;
    Ok(output
        .stdout
        .lines()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .collect())
}

pub fn rev_parse(vault: &Path, reference: &str) -> Result<String, GitError> {
    git(&["rev-parse", "--verify", "-q", reference], vault)
        .map_err(|_err| GitError::MissingRef {
            reference: reference.into(),
        })
        .map(|out| out.stdout.trim().to_owned())
}

pub fn head_commit(vault: &Path) -> Result<String, GitError> {
    rev_parse(vault, "HEAD")
}

pub fn has_commits(vault: &Path) -> bool {
    rev_parse(vault, "HEAD").is_ok()
}

pub fn is_mid_merge(vault: &Path) -> bool {
    rev_parse(vault, "MERGE_HEAD").is_ok()
}

pub fn status_porcelain(vault: &Path) -> Result<Vec<String>, GitError> {
    let output = git(&["status", "--porcelain"], vault)?;
    Ok(output
        .stdout
        .lines()
        .map(|line| line.to_owned())
        .filter(|line| !line.is_empty())
        .collect())
}

pub fn is_working_tree_dirty(vault: &Path) -> Result<bool, GitError> {
    Ok(!status_porcelain(vault)?.is_empty())
}

/// Paths named in `status --porcelain` output, unquoted best effort.
pub fn changed_paths(vault: &Path) -> Result<Vec<String>, GitError> {
    Ok(status_porcelain(vault)?
        .iter()
        .filter_map(|line| line.get(3..))
        .map(|path| {
            // Rename entries read "old -> new"; the new path is what exists on disk.
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            path.trim_matches('"').to_owned()
        })
        .collect())
}

/// Returns true when a stash entry was actually created.
pub fn stash_push(vault: &Path, message: &str) -> Result<bool, GitError> {
    let output = git(&["stash", "push", "-m", message], vault)?;
    Ok(!output.stdout.contains("No local changes to save"))
}

pub fn stash_pop(vault: &Path) -> Result<(), GitError> {
    git(&["stash", "pop"], vault).map(|_| ())
}

pub fn stash_drop(vault: &Path) -> Result<(), GitError> {
    git(&["stash", "drop"], vault).map(|_| ())
}

pub fn stash_list(vault: &Path) -> Result<Vec<String>, GitError> {
    let output = git(&["stash", "list"], vault)?;
    Ok(output.stdout.lines().map(|line| line.to_owned()).collect())
}

pub fn add_all(vault: &Path) -> Result<(), GitError> {
    git(&["add", "-A"], vault).map(|_| ())
}

pub fn add_path(vault: &Path, path: &str) -> Result<(), GitError> {
    git(&["add", "--", path], vault).map(|_| ())
}

/// Commits staged changes. Returns false when there was nothing to commit.
pub fn commit(vault: &Path, message: &str) -> Result<bool, GitError> {
    match git(&["commit", "-m", message], vault) {
        Ok(_) => Ok(true),
        Err(GitError::ExecError { command: _, output })
            if output.stdout.contains("nothing to commit")
                || output.stdout.contains("nothing added to commit")
                || output.stdout.contains("working tree clean") =>
        {
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

pub fn commit_allow_empty(vault: &Path, message: &str) -> Result<(), GitError> {
    git(&["commit", "--allow-empty", "-m", message], vault).map(|_| ())
}

fn merge_outcome_from_failure(vault: &Path, err: GitError) -> Result<MergeOutcome, GitError> {
    let conflicts = conflicted_files(vault).unwrap_or_default();
    if !conflicts.is_empty() {
        return Ok(MergeOutcome::Conflicts(conflicts));
    }
    match &err {
        GitError::ExecError { command: _, output }
            if output.stdout.contains("CONFLICT") || output.stderr.contains("CONFLICT") =>
        {
            // A conflict that left no unmerged index entries (e.g. rebase stop).
            Ok(MergeOutcome::Conflicts(vec![]))
        }
        _ => Err(map_git_error(err)),
    }
}

pub fn pull_rebase(vault: &Path) -> Result<MergeOutcome, GitError> {
    match git(&["pull", "--rebase", ORIGIN, MAIN_BRANCH], vault) {
        Ok(_) => Ok(MergeOutcome::Clean),
        Err(err) => merge_outcome_from_failure(vault, err),
    }
}

pub fn pull_unrelated(vault: &Path) -> Result<MergeOutcome, GitError> {
    // Recent git refuses a plain pull on divergent branches without a
    // reconcile mode; pin merge mode explicitly.
    match git(
        &[
            "pull",
            "--no-rebase",
            "--no-edit",
            "--allow-unrelated-histories",
            ORIGIN,
            MAIN_BRANCH,
        ],
        vault,
    ) {
        Ok(_) => Ok(MergeOutcome::Clean),
        Err(err) => merge_outcome_from_failure(vault, err),
    }
}

/// Records remote history as merged without adopting any remote content.
pub fn merge_ours_origin_main(vault: &Path) -> Result<(), GitError> {
    git(
        &[
            "merge",
            "--strategy=ours",
            "--allow-unrelated-histories",
            "--no-edit",
            ORIGIN_MAIN,
        ],
        vault,
    )
    .map(|_| ())
}

pub fn merge_origin_main(vault: &Path) -> Result<MergeOutcome, GitError> {
    match git(
        &[
            "merge",
            "--allow-unrelated-histories",
            "--no-edit",
            ORIGIN_MAIN,
        ],
        vault,
    ) {
        Ok(_) => Ok(MergeOutcome::Clean),
        Err(err) => merge_outcome_from_failure(vault, err),
    }
}

pub fn merge_abort(vault: &Path) -> Result<(), GitError> {
    git(&["merge", "--abort"], vault).map(|_| ())
}

pub fn rebase_abort(vault: &Path) -> Result<(), GitError> {
    git(&["rebase", "--abort"], vault).map(|_| ())
}

pub fn reset_hard(vault: &Path, reference: &str) -> Result<(), GitError> {
    git(&["reset", "--hard", reference], vault).map(|_| ())
}

pub fn branch(vault: &Path, name: &str) -> Result<(), GitError> {
    git(&["branch", name], vault).map(|_| ())
}

pub fn branch_delete(vault: &Path, name: &str) -> Result<(), GitError> {
    git(&["branch", "-D", name], vault).map(|_| ())
}

pub fn branch_exists(vault: &Path, name: &str) -> bool {
    rev_parse(vault, &format!("refs/heads/{name}")).is_ok()
}

pub fn rev_list_count(vault: &Path, range: &str) -> Result<u64, GitError> {
    let output = git(&["rev-list", "--count", range], vault)?;
    output
        .stdout
        .trim()
        .parse()
        .map_err(|_| GitError::MissingRef {
            reference: range.into(),
        })
}

pub fn push_main(vault: &Path, set_upstream: bool) -> Result<(), GitError> {
    let result = if set_upstream {
        git(&["push", "-u", ORIGIN, MAIN_BRANCH], vault)
    } else {
        git(&["push", ORIGIN, MAIN_BRANCH], vault)
    };
    result.map(|_| ()).map_err(map_git_error)
}

/// Unmerged paths, sorted for deterministic presentation.
pub fn conflicted_files(vault: &Path) -> Result<Vec<String>, GitError> {
    let output = git(&["diff", "--name-only", "--diff-filter=U"], vault)?;
    Ok(output
        .stdout
        .lines()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .sorted()
        .dedup()
        .collect())
}

/// Content of an index stage during a conflicted merge.
/// Stage 1 is the merge base, 2 is ours, 3 is theirs. `None` means the file
/// does not exist on that side (added/deleted conflicts).
pub fn show_stage(vault: &Path, stage: u8, path: &str) -> Result<Option<String>, GitError> {
    match git(&["show", &format!(":{stage}:{path}")], vault) {
        Ok(output) => Ok(Some(output.stdout)),
        Err(GitError::ExecError { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

pub fn config_get(vault: &Path, key: &str) -> Option<String> {
    git(&["config", key], vault)
        .ok()
        .map(|out| out.stdout.trim().to_owned())
        .filter(|value| !value.is_empty())
}

pub fn config_set(vault: &Path, key: &str, value: &str) -> Result<(), GitError> {
    git(&["config", key, value], vault).map(|_| ())
}

pub fn log_oneline(vault: &Path, range: &str) -> Result<Vec<String>, GitError> {
    let output = git(&["log", "--oneline", range], vault)?;
    Ok(output
        .stdout
        .lines()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .collect())
}

/// `(status, path)` pairs for the files touched by the HEAD commit.
pub fn name_status_head(vault: &Path) -> Result<Vec<(char, String)>, GitError> {
    let output = git(
        &["diff-tree", "--no-commit-id", "--name-status", "-r", "HEAD"],
        vault,
    )?;
    Ok(output
        .stdout
        .lines()
        .filter_map(|line| {
            let (status, path) = line.split_once('\t')?;
            Some((status.chars().next()?, path.to_owned()))
        })
        .collect())
}

pub fn parse_git_version(version: &str) -> Result<(i32, i32, i32)> {
    let version = version
        .split_whitespace()
        .nth(2)
        .ok_or(anyhow!("Could not find git version in string {version}"))?;
    match version.split('.').collect_vec()[..] {
        [major, minor, patch] => Ok((major.parse()?, minor.parse()?, patch.parse()?)),
        _ => Err(anyhow!("Failed determine semantic version from {version}")),
    }
}

pub fn git_version() -> Result<(i32, i32, i32)> {
    let output = capture_git_output(&["--version"], &None)
        .map_err(|err| anyhow!("git does not appear to be installed: {err}"))?;
    parse_git_version(&output.stdout)
}
