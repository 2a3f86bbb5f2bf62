//! Repository state classification.
//!
//! "Content" deliberately excludes placeholder and housekeeping files so that
//! a freshly initialized vault with only a `README.md` does not count as
//! divergent against a populated remote.

use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use walkdir::WalkDir;

use crate::git::ops;

#[derive(Debug, Clone, Default)]
pub struct RepositoryState {
    pub local_has_content: bool,
    pub remote_has_content: bool,
    pub local_files: Vec<String>,
    pub remote_files: Vec<String>,
}

impl RepositoryState {
    pub fn diverged(&self) -> bool {
        self.local_has_content && self.remote_has_content
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemoteAdvance {
    pub changed: bool,
    pub new_head: String,
    pub commit_count: u64,
}

const IGNORED_FILES: &[&str] = &[
    "README.md",
    ".gitignore",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "config.txt",
];

const IGNORED_EXTENSIONS: &[&str] = &[
    "tmp", "temp", "log", "cache", "ico", "exe", "dll", "so", "dylib", "pyc",
];

const IGNORED_DIRS: &[&str] = &["node_modules", "__pycache__"];

/// The single content predicate shared by the inspector and the backup
/// manager: dotfiles, placeholder and housekeeping files, backup artifacts,
/// editor state, and build caches are not user content.
pub fn is_meaningful_file(rel_path: &str) -> bool {
    let normalized = rel_path.replace('\\', "/");
    let Some(file_name) = normalized.rsplit('/').next() else {
        return false;
    };

    if file_name.is_empty() || IGNORED_FILES.contains(&file_name) {
        return false;
    }
    if file_name.starts_with("OGRESYNC_RECOVERY_INSTRUCTIONS") {
        return false;
    }
    if let Some((_, extension)) = file_name.rsplit_once('.') {
        if IGNORED_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()) {
            return false;
        }
    }
    // Any hidden segment excludes the whole path (.git, .obsidian,
    // .ogresync-backups, plain dotfiles).
    for segment in normalized.split('/') {
        if segment.starts_with('.') || IGNORED_DIRS.contains(&segment) {
            return false;
        }
    }
    true
}

/// Relative paths of all meaningful files in the working tree.
pub fn local_content_files(vault: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(vault).into_iter().filter_entry(|entry| {
        // The walk root itself is exempt; a vault may well live in a
        // dot-directory.
        if entry.depth() == 0 {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        !(entry.file_type().is_dir()
            && (name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref())))
    });
    for entry in walker {
        let entry = entry.context("Failed to walk vault directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(vault)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if is_meaningful_file(&rel) {
            files.push(rel);
        }
    }
    files.sort();
    Ok(files)
}

/// Fetches the remote and classifies both sides. A failed fetch degrades to
/// "remote unknown" rather than failing classification outright.
pub fn classify(vault: &Path) -> Result<RepositoryState> {
    let local_files = local_content_files(vault)?;

    let mut remote_files = Vec::new();
    match ops::fetch_origin(vault) {
        Ok(()) => {
            if ops::rev_parse(vault, ops::ORIGIN_MAIN).is_ok() {
                remote_files = ops::ls_tree(vault, ops::ORIGIN_MAIN)?
                    .into_iter()
                    .filter(|path| is_meaningful_file(path))
                    .collect();
            }
        }
        Err(err) => {
            warn!("could not fetch remote for classification: {err}");
        }
    }

    debug!(
        "classified vault: {} local file(s), {} remote file(s)",
        local_files.len(),
        remote_files.len()
    );

    Ok(RepositoryState {
        local_has_content: !local_files.is_empty(),
        remote_has_content: !remote_files.is_empty(),
        local_files,
        remote_files,
    })
}

/// Fetches and returns the commit id of `origin/main`, if the ref exists.
pub fn remote_head(vault: &Path) -> Result<Option<String>> {
    ops::fetch_origin(vault)?;
    Ok(ops::rev_parse(vault, ops::ORIGIN_MAIN).ok())
}

/// Fetches and reports whether `origin/main` moved past `prior_head`.
pub fn changed_since(vault: &Path, prior_head: &str) -> Result<RemoteAdvance> {
    ops::fetch_origin(vault)?;
    let new_head = ops::rev_parse(vault, ops::ORIGIN_MAIN).unwrap_or_default();
    let changed = !new_head.is_empty() && new_head != prior_head;
    let commit_count = if changed && !prior_head.is_empty() {
        ops::rev_list_count(vault, &format!("{prior_head}..{}", ops::ORIGIN_MAIN)).unwrap_or(0)
    } else {
        0
    };
    Ok(RemoteAdvance {
        changed,
        new_head,
        commit_count,
    })
}

/// One-line summaries of commits on HEAD that `origin/main` does not have.
/// Works against the last-known tracking ref; the caller fetches first when
/// it is online.
pub fn unpushed_commits(vault: &Path) -> Result<Vec<String>> {
    if !ops::has_commits(vault) {
        return Ok(Vec::new());
    }
    let range = if ops::rev_parse(vault, ops::ORIGIN_MAIN).is_ok() {
        format!("{}..HEAD", ops::ORIGIN_MAIN)
    } else {
        "HEAD".to_string()
    };
    Ok(ops::log_oneline(vault, &range)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::{dir_with_repo, hermetic_git_env};
    use std::fs;

    #[test]
    fn test_meaningful_file_predicate() {
        assert!(is_meaningful_file("notes.md"));
        assert!(is_meaningful_file("folder/daily/2025-06-01.md"));
        assert!(is_meaningful_file("attachments/diagram.png"));

        assert!(!is_meaningful_file("README.md"));
        assert!(!is_meaningful_file(".gitignore"));
        assert!(!is_meaningful_file(".hidden-note"));
        assert!(!is_meaningful_file(".obsidian/workspace.json"));
        assert!(!is_meaningful_file(".ogresync-backups/snapshot_x/notes.md"));
        assert!(!is_meaningful_file("OGRESYNC_RECOVERY_INSTRUCTIONS_20250601.txt"));
        assert!(!is_meaningful_file("subdir/.git/config"));
        assert!(!is_meaningful_file("debug.log"));
        assert!(!is_meaningful_file("tool.exe"));
        assert!(!is_meaningful_file("node_modules/pkg/index.js"));
        assert!(!is_meaningful_file(r"windows\.obsidian\app.json"));
    }

    #[test]
    fn test_local_content_files_skips_artifacts() {
        hermetic_git_env();
        let repo = dir_with_repo();
        let vault = repo.path();

        fs::write(vault.join("notes.md"), "real content").unwrap();
        fs::write(vault.join("README.md"), "placeholder").unwrap();
        fs::create_dir_all(vault.join(".obsidian")).unwrap();
        fs::write(vault.join(".obsidian").join("workspace.json"), "{}").unwrap();
        fs::create_dir_all(vault.join("daily")).unwrap();
        fs::write(vault.join("daily").join("today.md"), "entry").unwrap();

        let files = local_content_files(vault).unwrap();
        assert_eq!(files, vec!["daily/today.md".to_string(), "notes.md".to_string()]);
    }

    #[test]
    fn test_classify_without_remote() {
        hermetic_git_env();
        let repo = dir_with_repo();
        fs::write(repo.path().join("notes.md"), "content").unwrap();

        let state = classify(repo.path()).unwrap();
        assert!(state.local_has_content);
        assert!(!state.remote_has_content);
        assert!(!state.diverged());
    }

    #[test]
    fn test_unpushed_commits_without_remote_lists_all() {
        hermetic_git_env();
        let repo = dir_with_repo();
        let commits = unpushed_commits(repo.path()).unwrap();
        assert_eq!(commits.len(), 1);
    }
}
