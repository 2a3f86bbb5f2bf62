use std::env::current_dir;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::{debug, trace};

use super::types::{GitError, GitOutput};

/// Captured result of an external command. Non-zero exits are data, not errors.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn base_command(program: &str) -> Command {
    let mut command = Command::new(program);
    // Error message sniffing requires a stable locale.
    command
        .env("LANG", "C.UTF-8")
        .env("LC_ALL", "C.UTF-8")
        .env("LANGUAGE", "C.UTF-8");
    suppress_console(&mut command);
    command
}

// A console window would otherwise flash up for every git invocation.
#[cfg(windows)]
fn suppress_console(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn suppress_console(_command: &mut Command) {}

/// Runs an external command, capturing stdout, stderr, and the exit code.
///
/// Spawn failures and timeouts are converted into an exit code of 1 with an
/// explanatory stderr so that callers never need a second error channel.
pub fn run(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Option<Duration>,
) -> CommandOutput {
    debug!("execute: {} {}", program, args.iter().join(" "));

    let mut command = base_command(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return CommandOutput {
                stdout: String::new(),
                stderr: format!("failed to spawn {program}: {err}"),
                exit_code: 1,
            }
        }
    };

    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());

    match wait_with_deadline(&mut child, timeout) {
        Ok(status) => {
            let stdout = stdout_reader.join().unwrap_or_default();
            let stderr = stderr_reader.join().unwrap_or_default();
            trace!("stdout: {stdout}");
            trace!("stderr: {stderr}");
            CommandOutput {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(1),
            }
        }
        Err(message) => {
            let _ = child.kill();
            let _ = child.wait();
            let stdout = stdout_reader.join().unwrap_or_default();
            let partial_stderr = stderr_reader.join().unwrap_or_default();
            let stderr = if partial_stderr.is_empty() {
                message
            } else {
                format!("{message}\n{partial_stderr}")
            };
            CommandOutput {
                stdout,
                stderr,
                exit_code: 1,
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> Result<ExitStatus, String> {
    let Some(timeout) = timeout else {
        return child.wait().map_err(|err| err.to_string());
    };

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    return Err(format!("command timed out after {}s", timeout.as_secs()));
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => return Err(err.to_string()),
        }
    }
}

pub(super) fn capture_git_output(
    args: &[&str],
    working_dir: &Option<&Path>,
) -> Result<GitOutput, GitError> {
    let working_dir = match working_dir {
        Some(dir) => PathBuf::from(dir),
        None => current_dir()?,
    };

    let output = run("git", args, Some(&working_dir), None);

    let git_output = GitOutput {
        stdout: output.stdout,
        stderr: output.stderr,
    };

    if output.exit_code == 0 {
        trace!("exec succeeded");
        Ok(git_output)
    } else {
        trace!("exec failed");
        Err(GitError::ExecError {
            command: args.join(" "),
            output: git_output,
        })
    }
}

// Parsing error messages is not a very good idea, but(!) there are no consistent
// + documented error codes for these cases. The explicit LANG on the invocation
// keeps the messages stable.
pub(super) fn map_git_error(err: GitError) -> GitError {
    match err {
        GitError::ExecError { command: _, output }
            if output.stderr.contains("Could not resolve host")
                || output.stderr.contains("Could not read from remote")
                || output.stderr.contains("unable to access")
                || output.stderr.contains("Connection refused")
                || output.stderr.contains("Connection timed out") =>
        {
            GitError::RemoteUnreachable { output }
        }
        GitError::ExecError { command: _, output }
            if output.stderr.contains("[rejected]")
                || output.stderr.contains("non-fast-forward")
                || output.stderr.contains("fetch first") =>
        {
            GitError::PushRejected { output }
        }
        _ => err,
    }
}
