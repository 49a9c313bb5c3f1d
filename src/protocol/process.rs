//! External Program Invocation
//!
//! Builds the shell command line for a program run (plain, or wrapped in
//! the process-group launcher) and runs it with `bash -c`.

use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, error, info};

use crate::config::DEFAULT_LAUNCHER;
use crate::error::ExecutionError;

/// How many processes/threads a program run may use.
#[derive(Debug, Clone, PartialEq)]
pub struct Parallelism {
    pub processes: usize,
    pub threads: usize,
    /// Template with `{nodes}` and `{command}` placeholders.
    pub launcher: String,
}

impl Parallelism {
    pub fn sequential() -> Self {
        Self {
            processes: 1,
            threads: 1,
            launcher: DEFAULT_LAUNCHER.to_string(),
        }
    }

    pub fn new(processes: usize, threads: usize, launcher: impl Into<String>) -> Self {
        Self {
            processes: processes.max(1),
            threads: threads.max(1),
            launcher: launcher.into(),
        }
    }
}

impl Default for Parallelism {
    fn default() -> Self {
        Self::sequential()
    }
}

/// Builds the shell command line for a program run.
///
/// With more than one process the program is resolved through `which`
/// and wrapped in the launcher template.
pub fn build_command(program: &str, args: &str, parallelism: &Parallelism, background: bool) -> String {
    let mut command = if parallelism.processes <= 1 {
        format!("{} {}", program, args)
    } else {
        let inner = format!("`which {}` {}", program, args);
        parallelism
            .launcher
            .replace("{nodes}", &parallelism.processes.to_string())
            .replace("{command}", &inner)
    };

    let trimmed_len = command.trim_end().len();
    command.truncate(trimmed_len);

    if background {
        command.push_str(" &");
    }
    command
}

/// Runs an external program, failing on a non-zero exit code.
///
/// A background launch returns as soon as the shell has detached the job.
pub fn run_external_program(
    program: &str,
    args: &str,
    parallelism: &Parallelism,
    background: bool,
    working_dir: Option<&Path>,
) -> Result<(), ExecutionError> {
    let command = build_command(program, args, parallelism, background);
    info!("Running command: {}", command);

    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(&command);

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
        debug!("Executing in directory: {}", dir.display());
    }

    if parallelism.threads > 1 {
        cmd.env("OMP_NUM_THREADS", parallelism.threads.to_string());
    }

    if background {
        let status = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ExecutionError::Spawn {
                command: command.clone(),
                source: e,
            })?;
        return check_status(&command, status.code());
    }

    let output = cmd.output().map_err(|e| ExecutionError::Spawn {
        command: command.clone(),
        source: e,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        debug!("stdout:\n{}", stdout);
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("Command failed with exit code: {:?}", output.status.code());
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }
    }

    check_status(&command, output.status.code())
}

fn check_status(command: &str, code: Option<i32>) -> Result<(), ExecutionError> {
    match code {
        Some(0) => Ok(()),
        // Killed by a signal
        None => Err(ExecutionError::ProgramFailed {
            command: command.to_string(),
            code: -1,
        }),
        Some(code) => Err(ExecutionError::ProgramFailed {
            command: command.to_string(),
            code,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_build_plain_command() {
        let command = build_command("echo", "hello", &Parallelism::sequential(), false);
        assert_eq!(command, "echo hello");
    }

    #[test]
    fn test_build_command_without_args() {
        let command = build_command("true", "", &Parallelism::sequential(), false);
        assert_eq!(command, "true");
    }

    #[test]
    fn test_build_process_group_command() {
        let parallelism = Parallelism::new(4, 1, DEFAULT_LAUNCHER);
        let command = build_command("xmipp_ml2d", "-i images.xmd", &parallelism, false);
        assert_eq!(command, "mpirun -np 4 `which xmipp_ml2d` -i images.xmd");
    }

    #[test]
    fn test_build_background_command() {
        let command = build_command("sleep", "10", &Parallelism::sequential(), true);
        assert_eq!(command, "sleep 10 &");
    }

    #[test]
    fn test_run_success_in_working_dir() {
        let temp_dir = tempdir().unwrap();
        run_external_program(
            "echo",
            "hello > out.txt",
            &Parallelism::sequential(),
            false,
            Some(temp_dir.path()),
        )
        .unwrap();

        let content = std::fs::read_to_string(temp_dir.path().join("out.txt")).unwrap();
        assert_eq!(content.trim(), "hello");
    }

    #[test]
    fn test_run_failure_reports_code() {
        let result = run_external_program("exit", "3", &Parallelism::sequential(), false, None);
        match result {
            Err(ExecutionError::ProgramFailed { code, command }) => {
                assert_eq!(code, 3);
                assert_eq!(command, "exit 3");
            }
            other => panic!("expected ProgramFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_run_background_returns() {
        let result = run_external_program("sleep", "0", &Parallelism::sequential(), true, None);
        assert!(result.is_ok());
    }
}
