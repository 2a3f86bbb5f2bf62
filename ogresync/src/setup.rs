//! One-time setup wizard.
//!
//! Ordered steps, each retryable; the wizard never advances past a failure.
//! The graphical shell is out of scope — user interaction happens through the
//! prompt traits, environment access (clipboard, browser) through
//! [`Environment`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};

use crate::backup::{BackupManager, BackupReason};
use crate::config::{self, ConfigStore};
use crate::git::ops::{self, MergeOutcome};
use crate::git::runner;
use crate::inspect;
use crate::network;
use crate::progress::UiSink;
use crate::resolve::{stage1, FilePrompt, Outcome, StrategyPrompt};
use crate::sync;

const SSH_KEYGEN_TIMEOUT: Duration = Duration::from_secs(30);
const SSH_SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const SSH_AUTH_TIMEOUT: Duration = Duration::from_secs(20);

const SSH_KEYS_SETTINGS_URL: &str = "https://github.com/settings/keys";
const DEFAULT_SSH_HOST: &str = "github.com";

/// Host interface for wizard input.
pub trait SetupPrompt {
    /// Picks the editor executable; `candidates` are existing paths found by
    /// the per-platform search table. `None` cancels the wizard.
    fn choose_editor(&self, candidates: &[PathBuf]) -> Option<PathBuf>;
    fn choose_vault(&self) -> Option<PathBuf>;
    fn remote_url(&self) -> Option<String>;
    /// The public key has been copied for the user; returns once they have
    /// registered it with the host (or declines).
    fn confirm_key_registered(&self, public_key: &str) -> bool;
    /// Whether to retry a failed step.
    fn retry_step(&self, step: &str, error: &str) -> bool;
}

/// Clipboard and browser access.
pub trait Environment {
    fn copy_to_clipboard(&self, text: &str) -> Result<()>;
    fn open_browser(&self, url: &str) -> Result<()>;
}

pub struct SetupHooks<'a> {
    pub ui: &'a dyn UiSink,
    pub prompt: &'a dyn SetupPrompt,
    pub env: &'a dyn Environment,
    pub strategy: &'a dyn StrategyPrompt,
    pub files: &'a mut dyn FilePrompt,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SetupOutcome {
    Completed,
    Cancelled,
}

/// Runs a fallible step, asking the user whether to retry on failure.
fn attempt<T>(
    prompt: &dyn SetupPrompt,
    step: &str,
    mut operation: impl FnMut() -> Result<T>,
) -> Result<Option<T>> {
    loop {
        match operation() {
            Ok(value) => return Ok(Some(value)),
            Err(err) => {
                warn!("setup step '{step}' failed: {err:#}");
                if !prompt.retry_step(step, &format!("{err:#}")) {
                    return Ok(None);
                }
            }
        }
    }
}

pub fn run_wizard(config: &mut ConfigStore, hooks: &mut SetupHooks) -> Result<SetupOutcome> {
    // 1. Editor.
    hooks.ui.log("Step 1/11: locating the editor", Some(5));
    let candidates = editor_search_paths();
    let Some(editor_path) = hooks.prompt.choose_editor(&candidates) else {
        return Ok(SetupOutcome::Cancelled);
    };
    config.set(config::EDITOR_PATH, &editor_path.to_string_lossy());

    // 2. Git availability.
    hooks.ui.log("Step 2/11: checking git", Some(10));
    let Some(version) = attempt(hooks.prompt, "verify git", || ops::git_version())? else {
        return Ok(SetupOutcome::Cancelled);
    };
    info!("git version {}.{}.{}", version.0, version.1, version.2);

    // 3. Vault directory.
    hooks.ui.log("Step 3/11: choosing the vault", Some(15));
    let Some(vault) = select_vault(hooks.prompt)? else {
        return Ok(SetupOutcome::Cancelled);
    };
    config.set(config::VAULT_PATH, &vault.to_string_lossy());

    // 4. Repository init.
    hooks.ui.log("Step 4/11: initializing the vault repository", Some(25));
    if !ops::is_repository(&vault) {
        ops::init(&vault)?;
    }
    sync::ensure_git_identity(&vault);

    // 5. SSH key provisioning.
    hooks.ui.log("Step 5/11: provisioning an SSH key", Some(35));
    let Some(public_key) = attempt(hooks.prompt, "provision SSH key", || ensure_ssh_key())? else {
        return Ok(SetupOutcome::Cancelled);
    };
    if let Err(err) = hooks.env.copy_to_clipboard(&public_key) {
        warn!("could not copy the public key to the clipboard: {err:#}");
        hooks
            .ui
            .log(&format!("Public key (copy manually):\n{public_key}"), None);
    }
    if let Err(err) = hooks.env.open_browser(SSH_KEYS_SETTINGS_URL) {
        warn!("could not open the browser: {err:#}");
        hooks
            .ui
            .log(&format!("Register the key at {SSH_KEYS_SETTINGS_URL}"), None);
    }
    if !hooks.prompt.confirm_key_registered(&public_key) {
        return Ok(SetupOutcome::Cancelled);
    }

    // 6. known_hosts.
    hooks.ui.log("Step 6/11: trusting the host key", Some(45));
    if attempt(hooks.prompt, "add host key", || {
        ensure_known_host(DEFAULT_SSH_HOST)
    })?
    .is_none()
    {
        return Ok(SetupOutcome::Cancelled);
    }

    // 7. SSH authentication test.
    hooks.ui.log("Step 7/11: testing SSH authentication", Some(55));
    if attempt(hooks.prompt, "test SSH authentication", || {
        test_ssh_auth(DEFAULT_SSH_HOST)
    })?
    .is_none()
    {
        return Ok(SetupOutcome::Cancelled);
    }
    hooks.ui.log("SSH authentication succeeded", None);

    // 8. Remote URL (mandatory).
    hooks.ui.log("Step 8/11: linking the remote repository", Some(65));
    let Some(remote_url) = require_remote_url(hooks.prompt) else {
        return Ok(SetupOutcome::Cancelled);
    };
    config.set(config::REMOTE_URL, &remote_url);

    // 9. Attach the remote and reconcile divergence.
    hooks.ui.log("Step 9/11: inspecting both repositories", Some(75));
    let backups = BackupManager::new(&vault)?;
    if ops::remote_get_url(&vault).is_some() {
        ops::remote_remove(&vault)?;
    }
    ops::remote_add(&vault, &remote_url)?;
    if let Some((host, _port)) = network::probe_endpoint(&remote_url) {
        if host != DEFAULT_SSH_HOST {
            let _ = ensure_known_host(&host);
        }
    }

    // The merge-based strategies need a commit to stand on.
    sync::ensure_baseline(&vault, hooks.ui)?;

    let state = inspect::classify(&vault)?;
    if state.diverged() {
        backups.create(
            BackupReason::SetupSafety,
            "Before initial repository linking",
            None,
        );
        hooks
            .ui
            .log("Both the vault and the remote contain notes", None);
        let outcome = stage1::resolve_divergence(
            &vault,
            &backups,
            &state,
            hooks.strategy,
            hooks.files,
            hooks.ui,
        )?;
        match outcome {
            Outcome::Success { .. } => {}
            Outcome::Cancelled => return Ok(SetupOutcome::Cancelled),
            Outcome::Failed { reason, .. } => bail!("repository linking failed: {reason}"),
        }
    }

    // 10. Initial commit and push.
    hooks.ui.log("Step 10/11: first synchronization", Some(85));
    if attempt(hooks.prompt, "initial synchronization", || {
        initial_sync(&vault, hooks)
    })?
    .is_none()
    {
        return Ok(SetupOutcome::Cancelled);
    }

    // 11. Persist.
    hooks.ui.log("Step 11/11: saving configuration", Some(95));
    config.set(config::SETUP_DONE, "1");
    config.save()?;
    hooks.ui.log("Setup complete", Some(100));
    Ok(SetupOutcome::Completed)
}

fn select_vault(prompt: &dyn SetupPrompt) -> Result<Option<PathBuf>> {
    loop {
        let Some(vault) = prompt.choose_vault() else {
            return Ok(None);
        };
        fs::create_dir_all(&vault)
            .with_context(|| format!("Failed to create vault directory {}", vault.display()))?;
        if vault.is_dir() {
            return Ok(Some(vault));
        }
    }
}

fn require_remote_url(prompt: &dyn SetupPrompt) -> Option<String> {
    loop {
        let url = prompt.remote_url()?;
        let url = url.trim().to_string();
        if !url.is_empty() {
            return Some(url);
        }
    }
}

fn initial_sync(vault: &Path, hooks: &mut SetupHooks) -> Result<()> {
    sync::ensure_baseline(vault, hooks.ui)?;

    if ops::remote_main_exists(vault)? {
        match ops::pull_unrelated(vault)? {
            MergeOutcome::Clean => {}
            MergeOutcome::Conflicts(_) => {
                let _ = ops::merge_abort(vault);
                let backups = BackupManager::new(vault)?;
                let state = inspect::classify(vault)?;
                let outcome = stage1::resolve_divergence(
                    vault,
                    &backups,
                    &state,
                    hooks.strategy,
                    hooks.files,
                    hooks.ui,
                )?;
                match outcome {
                    Outcome::Success { .. } => {}
                    Outcome::Cancelled => bail!("initial synchronization cancelled"),
                    Outcome::Failed { reason, .. } => bail!(reason),
                }
            }
        }
    }
    ops::push_main(vault, true)?;
    Ok(())
}

/// Per-platform editor locations, checked for existence. A declarative table,
/// not inline conditionals.
pub fn editor_search_paths() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if cfg!(target_os = "windows") {
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            candidates.push(PathBuf::from(local).join("Obsidian").join("Obsidian.exe"));
        }
        if let Ok(programs) = std::env::var("ProgramFiles") {
            candidates.push(PathBuf::from(programs).join("Obsidian").join("Obsidian.exe"));
        }
    } else if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from("/Applications/Obsidian.app"));
    } else {
        candidates.push(PathBuf::from("/usr/bin/obsidian"));
        candidates.push(PathBuf::from("/usr/local/bin/obsidian"));
        candidates.push(PathBuf::from("/snap/bin/obsidian"));
        candidates.push(PathBuf::from(
            "/var/lib/flatpak/exports/bin/md.obsidian.Obsidian",
        ));
        if let Some(home) = dirs_next::home_dir() {
            candidates.push(home.join(".local").join("bin").join("obsidian"));
        }
    }

    candidates.into_iter().filter(|path| path.exists()).collect()
}

fn ssh_dir() -> Result<PathBuf> {
    Ok(dirs_next::home_dir()
        .context("Could not determine the home directory")?
        .join(".ssh"))
}

/// Returns the public key, generating an ed25519 pair if none exists at the
/// standard locations.
pub fn ensure_ssh_key() -> Result<String> {
    let ssh_dir = ssh_dir()?;
    for name in ["id_ed25519.pub", "id_rsa.pub"] {
        let existing = ssh_dir.join(name);
        if existing.is_file() {
            return fs::read_to_string(&existing)
                .with_context(|| format!("Failed to read {}", existing.display()));
        }
    }

    fs::create_dir_all(&ssh_dir)?;
    let key_path = ssh_dir.join("id_ed25519");
    let output = runner::run(
        "ssh-keygen",
        &[
            "-t",
            "ed25519",
            "-N",
            "",
            "-C",
            "ogresync",
            "-f",
            &key_path.to_string_lossy(),
        ],
        None,
        Some(SSH_KEYGEN_TIMEOUT),
    );
    if !output.success() {
        bail!("ssh-keygen failed: {}", output.stderr);
    }

    let public = key_path.with_extension("pub");
    fs::read_to_string(&public).with_context(|| format!("Failed to read {}", public.display()))
}

/// Adds the host key to `known_hosts` non-interactively, once.
pub fn ensure_known_host(host: &str) -> Result<()> {
    let ssh_dir = ssh_dir()?;
    let known_hosts = ssh_dir.join("known_hosts");

    if let Ok(content) = fs::read_to_string(&known_hosts) {
        if content.lines().any(|line| line.contains(host)) {
            return Ok(());
        }
    }

    let output = runner::run(
        "ssh-keyscan",
        &["-t", "rsa,ed25519", host],
        None,
        Some(SSH_SCAN_TIMEOUT),
    );
    if !output.success() || output.stdout.trim().is_empty() {
        bail!("could not fetch the host key for {host}: {}", output.stderr);
    }

    fs::create_dir_all(&ssh_dir)?;
    let mut content = fs::read_to_string(&known_hosts).unwrap_or_default();
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(output.stdout.trim_end());
    content.push('\n');
    fs::write(&known_hosts, content)?;
    Ok(())
}

/// `ssh -T git@host`. Hosts like GitHub close the session with a non-zero
/// exit even on success, so the banner text decides.
pub fn test_ssh_auth(host: &str) -> Result<()> {
    let target = format!("git@{host}");
    let output = runner::run(
        "ssh",
        &[
            "-T",
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            &target,
        ],
        None,
        Some(SSH_AUTH_TIMEOUT),
    );

    let combined = format!("{}\n{}", output.stdout, output.stderr);
    if output.success() || combined.contains("successfully authenticated") {
        Ok(())
    } else {
        Err(anyhow!("SSH authentication to {host} failed: {}", output.stderr.trim()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_editor_search_paths_only_existing() {
        for path in editor_search_paths() {
            assert!(path.exists());
        }
    }
}
