//! Local safety backups.
//!
//! Two flavors: a git branch pinned at the current commit (preferred when a
//! repository exists and is not mid-merge) or a file snapshot copied into the
//! hidden backups directory. Backups never leave the machine; the backups
//! directory and recovery-instruction files are entered into `.gitignore`
//! when the manager is constructed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, warn};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use unindent::unindent;

use crate::git::ops;
use crate::inspect;

pub const BACKUP_DIR_NAME: &str = ".ogresync-backups";
pub const REGISTRY_FILE_NAME: &str = "backup_registry.json";
const MANIFEST_FILE_NAME: &str = "backup_manifest.json";

const MAX_BACKUP_AGE_DAYS: i64 = 30;
const MAX_BACKUPS_PER_REASON: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    GitBranch,
    FileSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    ConflictResolution,
    SetupSafety,
    SyncOperation,
    UserRequested,
}

impl BackupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupReason::ConflictResolution => "conflict_resolution",
            BackupReason::SetupSafety => "setup_safety",
            BackupReason::SyncOperation => "sync_operation",
            BackupReason::UserRequested => "user_requested",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub backup_type: BackupKind,
    pub reason: BackupReason,
    pub created_at: DateTime<Utc>,
    pub description: String,
    #[serde(default)]
    pub git_branch_name: Option<String>,
    #[serde(default)]
    pub file_snapshot_path: Option<PathBuf>,
    #[serde(default)]
    pub files_backed_up: Vec<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default = "default_can_restore")]
    pub can_restore: bool,
}

fn default_can_restore() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotManifest {
    backup_id: String,
    created_at: DateTime<Utc>,
    description: String,
    files: Vec<String>,
}

pub struct BackupManager {
    vault: PathBuf,
    base_dir: PathBuf,
    registry_path: PathBuf,
}

impl BackupManager {
    pub fn new(vault: &Path) -> Result<Self> {
        let base_dir = vault.join(BACKUP_DIR_NAME);
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create backup directory {}", base_dir.display()))?;

        ensure_gitignore_entries(vault)?;

        Ok(BackupManager {
            vault: vault.to_path_buf(),
            registry_path: base_dir.join(REGISTRY_FILE_NAME),
            base_dir,
        })
    }

    /// Creates a backup using the most appropriate mechanism. Failures are
    /// logged and reported as `None`; callers decide whether to proceed.
    pub fn create(
        &self,
        reason: BackupReason,
        description: &str,
        files: Option<&[String]>,
    ) -> Option<String> {
        let backup_id = format!(
            "backup_{}_{}_{}",
            Utc::now().timestamp(),
            reason.as_str(),
            random_suffix()
        );

        if ops::is_repository(&self.vault)
            && ops::has_commits(&self.vault)
            && !ops::is_mid_merge(&self.vault)
        {
            match self.create_branch_backup(&backup_id, reason, description, files) {
                Ok(record) => {
                    self.finish(record);
                    return Some(backup_id);
                }
                Err(err) => {
                    warn!("git branch backup failed, falling back to snapshot: {err:#}");
                }
            }
        }

        match self.create_snapshot_backup(&backup_id, reason, description, files) {
            Ok(record) => {
                self.finish(record);
                Some(backup_id)
            }
            Err(err) => {
                error!("failed to create backup: {err:#}");
                None
            }
        }
    }

    fn finish(&self, record: BackupRecord) {
        if let Err(err) = self.register(&record) {
            warn!("failed to register backup {}: {err:#}", record.backup_id);
        }
        if let Err(err) = self.write_recovery_instructions(&record) {
            warn!("failed to write recovery instructions: {err:#}");
        }
    }

    fn create_branch_backup(
        &self,
        backup_id: &str,
        reason: BackupReason,
        description: &str,
        files: Option<&[String]>,
    ) -> Result<BackupRecord> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let branch_name = format!("ogresync-backup-{backup_id}-{timestamp}");

        // The branch pins the current commit; uncommitted changes are parked
        // in a stash around the branch creation and restored afterwards so
        // the working tree is left exactly as found.
        let stashed = ops::stash_push(&self.vault, &format!("Backup stash: {description}"))?;
        let created = ops::branch(&self.vault, &branch_name);
        if stashed {
            ops::stash_pop(&self.vault)?;
        }
        created?;

        debug!("git branch backup created: {branch_name}");
        Ok(BackupRecord {
            backup_id: backup_id.to_owned(),
            backup_type: BackupKind::GitBranch,
            reason,
            created_at: Utc::now(),
            description: description.to_owned(),
            git_branch_name: Some(branch_name),
            file_snapshot_path: None,
            files_backed_up: files.map(<[String]>::to_vec).unwrap_or_default(),
            size_bytes: 0,
            can_restore: true,
        })
    }

    fn create_snapshot_backup(
        &self,
        backup_id: &str,
        reason: BackupReason,
        description: &str,
        files: Option<&[String]>,
    ) -> Result<BackupRecord> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let snapshot_dir = self.base_dir.join(format!("snapshot_{backup_id}_{timestamp}"));
        fs::create_dir_all(&snapshot_dir)?;

        let candidates = match files {
            Some(files) => files.to_vec(),
            None => inspect::local_content_files(&self.vault)?,
        };

        let mut copied = Vec::new();
        for rel_path in &candidates {
            let source = self.vault.join(rel_path);
            if !source.is_file() {
                continue;
            }
            let destination = snapshot_dir.join(rel_path);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &destination)
                .with_context(|| format!("Failed to copy {rel_path} into snapshot"))?;
            copied.push(rel_path.clone());
        }

        let manifest = SnapshotManifest {
            backup_id: backup_id.to_owned(),
            created_at: Utc::now(),
            description: description.to_owned(),
            files: copied.clone(),
        };
        fs::write(
            snapshot_dir.join(MANIFEST_FILE_NAME),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        debug!("file snapshot backup created: {}", snapshot_dir.display());
        Ok(BackupRecord {
            backup_id: backup_id.to_owned(),
            backup_type: BackupKind::FileSnapshot,
            reason,
            created_at: Utc::now(),
            description: description.to_owned(),
            git_branch_name: None,
            size_bytes: directory_size(&snapshot_dir),
            file_snapshot_path: Some(snapshot_dir),
            files_backed_up: copied,
            can_restore: true,
        })
    }

    /// All registered backups, newest first. Unparseable entries are skipped.
    pub fn list(&self) -> Vec<BackupRecord> {
        let mut backups: Vec<BackupRecord> = self
            .load_registry()
            .into_iter()
            .filter_map(|(backup_id, value)| {
                match serde_json::from_value::<BackupRecord>(value) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        warn!("skipping unreadable backup entry {backup_id}: {err}");
                        None
                    }
                }
            })
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        backups
    }

    /// Removes expired backups: older than 30 days, or beyond the 10 newest
    /// for their reason tag. `force` removes everything.
    pub fn cleanup(&self, force: bool) -> Result<(usize, u64)> {
        let cutoff = Utc::now() - Duration::days(MAX_BACKUP_AGE_DAYS);

        let mut by_reason: HashMap<BackupReason, Vec<BackupRecord>> = HashMap::new();
        for record in self.list() {
            by_reason.entry(record.reason).or_default().push(record);
        }

        let mut registry = self.load_registry();
        let mut deleted = 0usize;
        let mut bytes_freed = 0u64;

        for records in by_reason.values() {
            // list() already sorts newest first per reason.
            for (index, record) in records.iter().enumerate() {
                let expired = record.created_at < cutoff;
                let over_limit = index >= MAX_BACKUPS_PER_REASON;
                if !(force || expired || over_limit) {
                    continue;
                }
                if self.delete(record) {
                    deleted += 1;
                    bytes_freed += record.size_bytes;
                    registry.remove(&record.backup_id);
                }
            }
        }

        self.save_registry(&registry)?;
        Ok((deleted, bytes_freed / (1024 * 1024)))
    }

    fn delete(&self, record: &BackupRecord) -> bool {
        if let Some(branch_name) = &record.git_branch_name {
            if let Err(err) = ops::branch_delete(&self.vault, branch_name) {
                warn!("failed to delete backup branch {branch_name}: {err}");
                return false;
            }
        }
        if let Some(snapshot_path) = &record.file_snapshot_path {
            if snapshot_path.exists() {
                if let Err(err) = fs::remove_dir_all(snapshot_path) {
                    warn!("failed to delete snapshot {}: {err}", snapshot_path.display());
                    return false;
                }
            }
        }
        debug!("deleted backup {}", record.backup_id);
        true
    }

    fn register(&self, record: &BackupRecord) -> Result<()> {
        let mut registry = self.load_registry();
        registry.insert(record.backup_id.clone(), serde_json::to_value(record)?);
        self.save_registry(&registry)
    }

    fn load_registry(&self) -> serde_json::Map<String, serde_json::Value> {
        let Ok(content) = fs::read_to_string(&self.registry_path) else {
            return serde_json::Map::new();
        };
        serde_json::from_str(&content).unwrap_or_else(|err| {
            warn!("backup registry is unreadable, starting fresh: {err}");
            serde_json::Map::new()
        })
    }

    // Rewritten through a temp file so a crash cannot truncate the registry.
    fn save_registry(&self, registry: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let tmp_path = self.registry_path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(registry)?)?;
        fs::rename(&tmp_path, &self.registry_path)
            .with_context(|| format!("Failed to replace {}", self.registry_path.display()))?;
        Ok(())
    }

    fn write_recovery_instructions(&self, record: &BackupRecord) -> Result<()> {
        let timestamp = record.created_at.format("%Y%m%d_%H%M%S");
        let path = self
            .base_dir
            .join(format!("OGRESYNC_RECOVERY_INSTRUCTIONS_{timestamp}.txt"));

        let header = unindent(&format!(
            r#"
            OGRESYNC RECOVERY INSTRUCTIONS
            ==============================

            Backup created: {created}
            Backup id:      {id}
            Reason:         {reason}
            Description:    {description}

            RECOVERY OPTIONS:
            "#,
            created = record.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            id = record.backup_id,
            reason = record.reason.as_str(),
            description = record.description,
        ));

        let body = match (&record.git_branch_name, &record.file_snapshot_path) {
            (Some(branch), _) => unindent(&format!(
                r#"
                Git branch recovery:
                1. View the backup content:      git checkout {branch}
                2. Branch off from the backup:   git checkout -b my-recovery-{id}
                3. Merge back into main:         git checkout main && git merge my-recovery-{id}

                Delete when no longer needed:    git branch -D {branch}
                "#,
                branch = branch,
                id = record.backup_id,
            )),
            (None, Some(snapshot)) => unindent(&format!(
                r#"
                File snapshot recovery:
                1. Browse the backup files:      {snapshot}
                2. Copy what you need back into the vault.
                3. The manifest lists every file: {snapshot}/{manifest}

                Delete when no longer needed:    remove the folder {snapshot}
                "#,
                snapshot = snapshot.display(),
                manifest = MANIFEST_FILE_NAME,
            )),
            (None, None) => String::new(),
        };

        let footer = unindent(&format!(
            r#"
            Notes:
            - This backup is local only and will never be synced to the remote.
            - Backups are cleaned up automatically after {MAX_BACKUP_AGE_DAYS} days.
            - This file can be deleted safely after reading.
            "#
        ));

        fs::write(path, format!("{header}{body}{footer}"))?;
        Ok(())
    }
}

fn random_suffix() -> String {
    let suffix: u32 = thread_rng().gen();
    format!("{suffix:08x}")
}

fn directory_size(directory: &Path) -> u64 {
    walkdir::WalkDir::new(directory)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

const GITIGNORE_ENTRIES: &[(&str, &str)] = &[
    (".ogresync-backups/", "# Ogresync backups (local only)"),
    ("OGRESYNC_RECOVERY_INSTRUCTIONS_*.txt", ""),
    (".obsidian/", "# Obsidian app settings (personal/local only)"),
];

/// Re-assertable at any point: a remote-wins reset may have dropped the
/// ignore entries that keep backups out of version control.
pub(crate) fn ensure_gitignore_entries(vault: &Path) -> Result<()> {
    let gitignore_path = vault.join(".gitignore");
    let mut content = fs::read_to_string(&gitignore_path).unwrap_or_default();
    let mut changed = false;

    for (entry, comment) in GITIGNORE_ENTRIES {
        if content.lines().any(|line| line.trim() == *entry) {
            continue;
        }
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        if !comment.is_empty() {
            content.push_str(comment);
            content.push('\n');
        }
        content.push_str(entry);
        content.push('\n');
        changed = true;
    }

    if changed {
        fs::write(&gitignore_path, content)
            .with_context(|| format!("Failed to update {}", gitignore_path.display()))?;
    }
    Ok(())
}
