//! External process execution: run a job's shell command with a timeout.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

/// Exit code reported for a command killed by the timeout.
const TIMEOUT_EXIT_CODE: i32 = 124;

/// Everything the outcome policy needs to know about a finished run.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Wall-clock seconds the command ran for.
    pub execution_time: f64,
    pub timed_out: bool,
}

impl ExecutionOutput {
    /// The message recorded as the job's error on failure: stderr when the
    /// command produced any, otherwise a synthesized summary.
    pub fn error_message(&self) -> String {
        if !self.stderr.is_empty() {
            self.stderr.clone()
        } else {
            format!("Command exited with code {}", self.exit_code)
        }
    }
}

/// Runs `command` through `sh -c`, capturing output, bounded by
/// `timeout_secs`.
///
/// Never returns an error: a command that cannot be spawned, exits non-zero,
/// or overruns its timeout all come back as a non-success output for the
/// retry policy to act on. On timeout the child is killed and the run is
/// reported with exit code 124 and `timed_out` set.
pub async fn run_command(command: &str, timeout_secs: u64) -> ExecutionOutput {
    let start = Instant::now();

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(err) => {
            return ExecutionOutput {
                success: false,
                stdout: String::new(),
                stderr: format!("Failed to spawn command: {err}"),
                exit_code: 1,
                execution_time: start.elapsed().as_secs_f64(),
                timed_out: false,
            }
        }
    };

    // kill_on_drop reaps the child when the timeout drops the future.
    match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(1);
            ExecutionOutput {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                exit_code,
                execution_time: start.elapsed().as_secs_f64(),
                timed_out: false,
            }
        }
        Ok(Err(err)) => ExecutionOutput {
            success: false,
            stdout: String::new(),
            stderr: format!("Failed to collect command output: {err}"),
            exit_code: 1,
            execution_time: start.elapsed().as_secs_f64(),
            timed_out: false,
        },
        Err(_elapsed) => ExecutionOutput {
            success: false,
            stdout: String::new(),
            stderr: format!("Job timed out after {timeout_secs}s"),
            exit_code: TIMEOUT_EXIT_CODE,
            execution_time: start.elapsed().as_secs_f64(),
            timed_out: true,
        },
    }
}
