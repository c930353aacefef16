use anyhow::{Result, anyhow};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Captured output of a finished command. A non-zero exit is an ordinary
/// outcome, not an error; `exit_code` is -1 when the process died without
/// one (killed by a signal).
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait CommandRunner {
    fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands through the platform shell in the given directory.
/// Exceeding the timeout kills the child and is reported as an error.
#[derive(Debug, Default)]
pub struct SystemShell;

impl CommandRunner for SystemShell {
    fn run(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<CommandOutput> {
        let mut child = shell_command(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| anyhow!("failed to spawn '{command}': {err}"))?;

        if child.wait_timeout(timeout)?.is_none() {
            child.kill()?;
            let _ = child.wait();
            return Err(anyhow!(
                "command timed out after {}ms: {command}",
                timeout.as_millis()
            ));
        }

        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(not(target_os = "windows"))]
fn shell_command(command: &str) -> Command {
    let mut shell = Command::new("sh");
    shell.arg("-c").arg(command);
    shell
}

#[cfg(target_os = "windows")]
fn shell_command(command: &str) -> Command {
    let mut shell = Command::new("cmd");
    shell.arg("/C").arg(command);
    shell
}
