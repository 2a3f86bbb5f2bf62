//! Editor process lifecycle.
//!
//! Launching goes through the configured path (which on Linux may be a
//! launcher command such as `flatpak run md.obsidian.Obsidian`); shutdown is
//! detected by scanning the OS process table against a declarative set of
//! markers instead of inline platform conditionals.

use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::debug;
use sysinfo::System;

use crate::progress::UiSink;

// Known process markers per platform, extended with markers derived from the
// configured editor path. Flatpak and Snap wrap the real binary, so the
// application id shows up in the command line rather than the process name.
const PLATFORM_MARKERS: &[&str] = if cfg!(target_os = "windows") {
    &["obsidian.exe"]
} else if cfg!(target_os = "macos") {
    &["obsidian"]
} else {
    &["obsidian", "md.obsidian.obsidian", "obsidian.sh"]
};

/// What to look for in the process table to decide "the editor is running".
#[derive(Debug, Clone)]
pub struct EditorProfile {
    launch_command: String,
    markers: Vec<String>,
}

impl EditorProfile {
    pub fn new(editor_path: &str) -> Self {
        let mut markers: Vec<String> = PLATFORM_MARKERS
            .iter()
            .map(|marker| marker.to_string())
            .collect();

        let normalized = editor_path.trim().replace('\\', "/").to_lowercase();
        if !normalized.is_empty() {
            markers.push(normalized.clone());
            // For launcher commands ("flatpak run md.obsidian.obsidian") the
            // last token carries the application id; for plain paths it is
            // the executable name.
            if let Some(stem) = normalized
                .split_whitespace()
                .next_back()
                .and_then(|token| token.rsplit('/').next())
            {
                markers.push(stem.to_string());
            }
        }
        markers.sort();
        markers.dedup();

        EditorProfile {
            launch_command: editor_path.trim().to_string(),
            markers,
        }
    }

    fn matches(&self, name: &str, exe: Option<&Path>, cmdline: &[String]) -> bool {
        let name = name.to_lowercase();
        let exe = exe
            .map(|path| path.to_string_lossy().replace('\\', "/").to_lowercase())
            .unwrap_or_default();
        let cmdline = cmdline.join(" ").to_lowercase();

        self.markers.iter().any(|marker| {
            name == *marker || exe.ends_with(marker) || cmdline.contains(marker)
        })
    }
}

/// Host interface for the editor session; the process-table implementation
/// lives below, tests substitute scripted fakes.
pub trait EditorSession {
    fn launch(&mut self) -> Result<()>;
    fn is_running(&mut self) -> bool;
}

pub struct ProcessEditor {
    profile: EditorProfile,
    system: System,
}

impl ProcessEditor {
    pub fn new(editor_path: &str) -> Self {
        ProcessEditor {
            profile: EditorProfile::new(editor_path),
            system: System::new(),
        }
    }
}

impl EditorSession for ProcessEditor {
    fn launch(&mut self) -> Result<()> {
        let command_line = &self.profile.launch_command;
        if command_line.is_empty() {
            bail!("no editor configured");
        }

        let mut child = if cfg!(target_os = "linux") {
            // Launcher commands ("flatpak run md.obsidian.Obsidian") need
            // word splitting; plain paths pass through unchanged.
            let mut words = command_line.split_whitespace();
            let program = words.next().unwrap_or(command_line);
            let mut command = Command::new(program);
            command.args(words);
            command
        } else if cfg!(target_os = "macos") && command_line.ends_with(".app") {
            let mut command = Command::new("open");
            command.arg(command_line);
            command
        } else {
            Command::new(command_line)
        };

        child
            .spawn()
            .with_context(|| format!("Failed to launch editor: {command_line}"))?;
        debug!("editor launched: {command_line}");
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.system.refresh_processes();
        self.system.processes().values().any(|process| {
            self.profile
                .matches(process.name(), process.exe(), process.cmd())
        })
    }
}

/// Polls until the editor process disappears. There is no timeout; editing
/// sessions may legitimately last hours. The initial grace window covers the
/// gap between spawn and the process showing up in the table.
pub fn wait_until_closed(session: &mut dyn EditorSession, ui: &dyn UiSink, poll: Duration) {
    let mut appeared = false;
    for _ in 0..10 {
        if session.is_running() {
            appeared = true;
            break;
        }
        thread::sleep(poll);
    }
    if !appeared {
        debug!("editor process never appeared in the process table");
        return;
    }

    let mut ticks: u64 = 0;
    while session.is_running() {
        thread::sleep(poll);
        ticks += 1;
        if ticks % 120 == 0 {
            ui.log("Still waiting for the editor to close...", None);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::progress::NullSink;

    #[test]
    fn test_profile_matches_process_name() {
        let profile = EditorProfile::new("/usr/bin/obsidian");
        assert!(profile.matches("obsidian", None, &[]));
        assert!(profile.matches("Obsidian", None, &[]));
        assert!(!profile.matches("firefox", None, &[]));
    }

    #[test]
    fn test_profile_matches_exe_path() {
        let profile = EditorProfile::new(r"C:\Users\me\AppData\Local\Obsidian\Obsidian.exe");
        assert!(profile.matches(
            "electron",
            Some(Path::new(r"C:\Users\me\AppData\Local\Obsidian\Obsidian.exe")),
            &[],
        ));
    }

    #[test]
    fn test_profile_matches_flatpak_cmdline() {
        let profile = EditorProfile::new("flatpak run md.obsidian.Obsidian");
        assert!(profile.matches(
            "bwrap",
            None,
            &["bwrap".into(), "md.obsidian.obsidian".into()],
        ));
        assert!(profile.matches("flatpak", None, &["flatpak".into(), "run".into(), "md.obsidian.obsidian".into()]));
    }

    struct CountdownEditor {
        remaining: u32,
    }

    impl EditorSession for CountdownEditor {
        fn launch(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_running(&mut self) -> bool {
            if self.remaining == 0 {
                return false;
            }
            self.remaining -= 1;
            true
        }
    }

    #[test]
    fn test_wait_until_closed_polls_to_completion() {
        let mut editor = CountdownEditor { remaining: 5 };
        wait_until_closed(&mut editor, &NullSink, Duration::from_millis(1));
        assert!(!editor.is_running());
    }

    #[test]
    fn test_wait_until_closed_handles_never_started() {
        let mut editor = CountdownEditor { remaining: 0 };
        wait_until_closed(&mut editor, &NullSink, Duration::from_millis(1));
    }
}
