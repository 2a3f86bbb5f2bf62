//! CLI dispatch and the console implementations of the host interfaces.
//!
//! The session worker runs on its own thread and posts progress through the
//! channel sink; the main thread is the renderer. Modal prompts read stdin
//! from the worker, which is fine on a console host.

use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use env_logger::Env;
use log::Level;

use ogresync_cli_types::{BackupCommands, Cli, CliStrategy, Commands};

use crate::backup::BackupManager;
use crate::config::{self, ConfigStore};
use crate::editor::ProcessEditor;
use crate::git::runner;
use crate::inspect;
use crate::resolve::{ConflictEntry, FileChoice, FilePrompt, Strategy, StrategyPrompt};
use crate::setup::{self, Environment, SetupHooks, SetupOutcome, SetupPrompt};
use crate::sync::{self, RecoveryChoice, RecoveryPrompt, SessionOutcome, SyncHooks};
use crate::progress::{render_console, ChannelSink, UiSink};
use clap::Parser;

pub fn handle_calls() -> Result<()> {
    let cli = Cli::parse();
    let logger_level = match cli.verbose {
        0 => Level::Warn,
        1 => Level::Info,
        2 => Level::Debug,
        _ => Level::Trace,
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(logger_level.as_str())).init();

    let config_path = match cli.config_file {
        Some(path) => path,
        None => ConfigStore::default_path()?,
    };
    let mut config = ConfigStore::open(config_path)?;

    match cli.command {
        Commands::Sync { no_editor, strategy } => run_sync(&mut config, no_editor, strategy),
        Commands::Setup {} => {
            run_setup(&mut config)?;
            Ok(())
        }
        Commands::Backup { command } => handle_backup(&config, command),
        Commands::Status {} => show_status(&config),
    }
}

fn run_sync(
    config: &mut ConfigStore,
    no_editor: bool,
    preset: Option<CliStrategy>,
) -> Result<()> {
    if !config.is_setup_done() {
        println!("Ogresync is not set up yet; running the setup wizard first.");
        if run_setup(config)? == SetupOutcome::Cancelled {
            println!("Setup cancelled.");
            return Ok(());
        }
    }

    let (sink, receiver) = ChannelSink::new();
    let renderer = thread::spawn(move || render_console(receiver));

    let config_path = config.path().to_path_buf();
    let worker = thread::spawn(move || -> Result<SessionOutcome> {
        let mut config = ConfigStore::open(config_path)?;
        let editor_path = config.get(config::EDITOR_PATH);
        let mut editor = ProcessEditor::new(&editor_path);
        let strategy: Box<dyn StrategyPrompt> = match preset {
            Some(preset) => Box::new(PresetStrategy(preset.into())),
            None => Box::new(ConsoleStrategyPrompt),
        };
        let mut files = ConsoleFilePrompt;
        let recovery = ConsoleRecoveryPrompt;
        let mut hooks = SyncHooks {
            ui: &sink,
            strategy: strategy.as_ref(),
            files: &mut files,
            recovery: &recovery,
            editor: &mut editor,
            editor_poll: Duration::from_millis(500),
        };
        sync::run_session(&mut config, &mut hooks, !no_editor)
    });

    let outcome = worker
        .join()
        .map_err(|_| anyhow!("sync worker panicked"))??;
    let _ = renderer.join();

    match outcome {
        SessionOutcome::Completed(markers) => {
            if markers.offline {
                println!("Session finished offline; changes will sync next time.");
            } else if markers.pushed {
                println!("Session finished; everything is in sync.");
            } else {
                println!("Session finished; local commits are waiting to be pushed.");
            }
            if let Some(backup_id) = markers.backup_id {
                println!("Safety backup: {backup_id}");
            }
        }
        SessionOutcome::Aborted { reason } => {
            println!("Sync aborted: {reason}");
        }
        SessionOutcome::SetupRequested => {
            println!("The vault is not configured; run `ogresync setup`.");
        }
    }
    Ok(())
}

fn run_setup(config: &mut ConfigStore) -> Result<SetupOutcome> {
    let ui = ConsoleDirectUi;
    let prompt = ConsoleSetupPrompt;
    let env = ConsoleEnvironment;
    let strategy = ConsoleStrategyPrompt;
    let mut files = ConsoleFilePrompt;
    let mut hooks = SetupHooks {
        ui: &ui,
        prompt: &prompt,
        env: &env,
        strategy: &strategy,
        files: &mut files,
    };
    let outcome = setup::run_wizard(config, &mut hooks)?;
    if outcome == SetupOutcome::Completed {
        println!("Setup finished. Run `ogresync sync` to start a session.");
    }
    Ok(outcome)
}

fn vault_from_config(config: &ConfigStore) -> Result<PathBuf> {
    let vault = config.get(config::VAULT_PATH);
    if vault.is_empty() {
        bail!("no vault configured; run `ogresync setup` first");
    }
    Ok(PathBuf::from(vault))
}

fn handle_backup(config: &ConfigStore, command: BackupCommands) -> Result<()> {
    let vault = vault_from_config(config)?;
    let manager = BackupManager::new(&vault)?;

    match command {
        BackupCommands::List {} => {
            let backups = manager.list();
            if backups.is_empty() {
                println!("No backups registered.");
                return Ok(());
            }
            for record in backups {
                let locator = record
                    .git_branch_name
                    .clone()
                    .or_else(|| {
                        record
                            .file_snapshot_path
                            .as_ref()
                            .map(|path| path.display().to_string())
                    })
                    .unwrap_or_default();
                println!(
                    "{}  {}  {}  {}",
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.backup_id,
                    record.description,
                    locator,
                );
            }
        }
        BackupCommands::Cleanup { retention } => {
            let (deleted, mb_freed) = manager.cleanup(retention.force)?;
            println!("Deleted {deleted} backup(s), freed {mb_freed} MB.");
        }
    }
    Ok(())
}

fn show_status(config: &ConfigStore) -> Result<()> {
    let vault = vault_from_config(config)?;
    let state = inspect::classify(&vault)?;
    println!("Vault: {}", vault.display());
    println!(
        "Local content:  {} file(s)",
        state.local_files.len()
    );
    println!(
        "Remote content: {} file(s)",
        state.remote_files.len()
    );
    let unpushed = inspect::unpushed_commits(&vault)?;
    if unpushed.is_empty() {
        println!("No unpushed commits.");
    } else {
        println!("Unpushed commits:");
        for line in unpushed {
            println!("  {line}");
        }
    }
    Ok(())
}

// --- console hosts --------------------------------------------------------

fn prompt_line(message: &str) -> Option<String> {
    print!("{message}");
    let _ = io::stdout().flush();
    let mut line = String::new();
    match io::stdin().read_line(&mut line) {
        Ok(0) => None,
        Ok(_) => Some(line.trim().to_string()),
        Err(_) => None,
    }
}

/// Sink for the wizard, which runs on the main thread without a renderer.
struct ConsoleDirectUi;

impl UiSink for ConsoleDirectUi {
    fn log(&self, message: &str, percent: Option<u8>) {
        match percent {
            Some(percent) => println!("[{percent:>3}%] {message}"),
            None => println!("       {message}"),
        }
    }
}

/// Applies a strategy chosen up front via `--strategy`.
struct PresetStrategy(Strategy);

impl StrategyPrompt for PresetStrategy {
    fn choose_strategy(&self, _state: &inspect::RepositoryState) -> Option<Strategy> {
        Some(self.0)
    }
}

struct ConsoleStrategyPrompt;

impl StrategyPrompt for ConsoleStrategyPrompt {
    fn choose_strategy(&self, state: &inspect::RepositoryState) -> Option<Strategy> {
        println!();
        println!("Local and remote repositories have diverged.");
        println!(
            "  local:  {} content file(s)",
            state.local_files.len()
        );
        println!(
            "  remote: {} content file(s)",
            state.remote_files.len()
        );
        println!("  [1] Keep local only   (remote history recorded, no remote files adopted)");
        println!("  [2] Keep remote only  (local state preserved on a backup branch)");
        println!("  [3] Smart merge       (combine both; conflicts resolved per file)");
        println!("  [c] Cancel");
        loop {
            let answer = prompt_line("Choose a strategy [1/2/3/c]: ")?;
            match answer.as_str() {
                "1" => return Some(Strategy::KeepLocal),
                "2" => return Some(Strategy::KeepRemote),
                "3" => return Some(Strategy::SmartMerge),
                "c" | "C" => return None,
                _ => continue,
            }
        }
    }
}

struct ConsoleFilePrompt;

impl FilePrompt for ConsoleFilePrompt {
    fn choose(&mut self, entry: &ConflictEntry, index: usize, total: usize) -> FileChoice {
        println!();
        println!("Conflict {}/{}: {}", index + 1, total, entry.path);
        if entry.is_binary() {
            println!("  (binary file)");
            println!("  [l] Keep local   [r] Keep remote   [x] Abort   [q] Cancel all");
        } else {
            println!("  [l] Keep local   [r] Keep remote   [a] Auto merge   [m] Manual merge");
            println!("  [x] Abort        [q] Cancel all");
        }
        loop {
            let Some(answer) = prompt_line("Choice: ") else {
                return FileChoice::Abort;
            };
            match answer.as_str() {
                "l" | "L" => return FileChoice::KeepLocal,
                "r" | "R" => return FileChoice::KeepRemote,
                "a" | "A" => return FileChoice::AutoMerge,
                "m" | "M" => return FileChoice::ManualMerge,
                "x" | "X" => return FileChoice::Abort,
                "q" | "Q" => return FileChoice::CancelAll,
                _ => continue,
            }
        }
    }

    fn manual_merge(&mut self, entry: &ConflictEntry, premerged: &str) -> Option<String> {
        println!();
        println!("--- local ({}) ---", entry.path);
        println!("{}", entry.ours.as_deref().unwrap_or("<absent>"));
        println!("--- remote ({}) ---", entry.path);
        println!("{}", entry.theirs.as_deref().unwrap_or("<absent>"));
        println!("--- merged (conflict markers where unresolved) ---");
        println!("{premerged}");
        println!("Enter the merged content, finish with a single '.' line.");
        println!("An empty first line keeps the shown merge; '!' cancels this file.");

        let mut lines: Vec<String> = Vec::new();
        loop {
            let line = prompt_line("")?;
            if lines.is_empty() && line.is_empty() {
                return Some(premerged.to_string());
            }
            if lines.is_empty() && line == "!" {
                return None;
            }
            if line == "." {
                let mut content = lines.join("\n");
                content.push('\n');
                return Some(content);
            }
            lines.push(line);
        }
    }
}

struct ConsoleRecoveryPrompt;

impl RecoveryPrompt for ConsoleRecoveryPrompt {
    fn choose(&self, missing_vault: &std::path::Path) -> RecoveryChoice {
        println!();
        println!("The vault at {} is missing or unusable.", missing_vault.display());
        println!("  [1] Recreate it and re-link the saved remote");
        println!("  [2] Select a different directory");
        println!("  [3] Re-run setup");
        println!("  [4] Abandon");
        loop {
            let Some(answer) = prompt_line("Choice [1/2/3/4]: ") else {
                return RecoveryChoice::Abandon;
            };
            match answer.as_str() {
                "1" => return RecoveryChoice::Recreate,
                "2" => return RecoveryChoice::SelectDifferent,
                "3" => return RecoveryChoice::RerunSetup,
                "4" => return RecoveryChoice::Abandon,
                _ => continue,
            }
        }
    }

    fn select_directory(&self) -> Option<PathBuf> {
        let answer = prompt_line("Vault directory: ")?;
        if answer.is_empty() {
            None
        } else {
            Some(PathBuf::from(answer))
        }
    }
}

struct ConsoleSetupPrompt;

impl SetupPrompt for ConsoleSetupPrompt {
    fn choose_editor(&self, candidates: &[PathBuf]) -> Option<PathBuf> {
        if !candidates.is_empty() {
            println!("Found editor installations:");
            for (index, candidate) in candidates.iter().enumerate() {
                println!("  [{}] {}", index + 1, candidate.display());
            }
            println!("Enter a number, or a path to a different executable.");
        } else {
            println!("No editor found automatically; enter the path to its executable.");
        }
        loop {
            let answer = prompt_line("Editor: ")?;
            if answer.is_empty() {
                continue;
            }
            if let Ok(index) = answer.parse::<usize>() {
                if index >= 1 && index <= candidates.len() {
                    return Some(candidates[index - 1].clone());
                }
                continue;
            }
            return Some(PathBuf::from(answer));
        }
    }

    fn choose_vault(&self) -> Option<PathBuf> {
        loop {
            let answer = prompt_line("Vault directory: ")?;
            if !answer.is_empty() {
                return Some(PathBuf::from(answer));
            }
        }
    }

    fn remote_url(&self) -> Option<String> {
        prompt_line("Remote repository URL (SSH, e.g. git@github.com:user/vault.git): ")
    }

    fn confirm_key_registered(&self, public_key: &str) -> bool {
        println!("Your public key (also copied to the clipboard):");
        println!("{}", public_key.trim());
        matches!(
            prompt_line("Press Enter once the key is registered with the host (or 'c' to cancel): "),
            Some(answer) if answer != "c" && answer != "C"
        )
    }

    fn retry_step(&self, step: &str, error: &str) -> bool {
        println!("Step '{step}' failed:");
        println!("{error}");
        matches!(
            prompt_line("Retry? [Y/n]: "),
            Some(answer) if answer.is_empty() || answer == "y" || answer == "Y"
        )
    }
}

struct ConsoleEnvironment;

impl Environment for ConsoleEnvironment {
    fn copy_to_clipboard(&self, text: &str) -> Result<()> {
        use std::process::{Command, Stdio};

        let attempts: &[(&str, &[&str])] = if cfg!(target_os = "windows") {
            &[("clip", &[])]
        } else if cfg!(target_os = "macos") {
            &[("pbcopy", &[])]
        } else {
            &[("wl-copy", &[]), ("xclip", &["-selection", "clipboard"])]
        };

        for (program, args) in attempts {
            let spawned = Command::new(program)
                .args(*args)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
            let Ok(mut child) = spawned else { continue };
            if let Some(stdin) = child.stdin.as_mut() {
                if stdin.write_all(text.as_bytes()).is_err() {
                    let _ = child.kill();
                    continue;
                }
            }
            drop(child.stdin.take());
            if matches!(child.wait(), Ok(status) if status.success()) {
                return Ok(());
            }
        }
        bail!("no clipboard tool available")
    }

    fn open_browser(&self, url: &str) -> Result<()> {
        let (program, args): (&str, Vec<&str>) = if cfg!(target_os = "windows") {
            ("cmd", vec!["/c", "start", url])
        } else if cfg!(target_os = "macos") {
            ("open", vec![url])
        } else {
            ("xdg-open", vec![url])
        };
        let output = runner::run(program, &args, None, Some(Duration::from_secs(10)));
        if output.success() {
            Ok(())
        } else {
            bail!("could not open a browser: {}", output.stderr)
        }
    }
}
