//! One-shot execution of backend commands

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::{debug, error, warn};

use super::error::{Error, Result};

const ELEVATION_WRAPPERS: &[&str] = &["sudo", "run0", "pkexec"];

/// Name of the backend program a command runs, looking through elevation wrappers.
pub fn program_label(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let basename = |p: &std::ffi::OsStr| {
        Path::new(p)
            .file_name()
            .unwrap_or(p)
            .to_string_lossy()
            .into_owned()
    };
    let program = basename(std_cmd.get_program());
    if ELEVATION_WRAPPERS.contains(&program.as_str())
        && let Some(first) = std_cmd.get_args().next()
    {
        return basename(first);
    }
    program
}

pub fn describe_status(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with status {code}"),
        (None, Some(signal)) => format!("terminated by signal {signal}"),
        (None, None) => "terminated abnormally".to_string(),
    }
}

/// Runs a command to completion and returns its stdout.
///
/// Non-empty stderr on success is logged as a warning; a non-zero exit
/// becomes [`Error::Command`] carrying the literal stderr and exit code.
pub async fn run(mut cmd: Command) -> Result<String> {
    let program = program_label(&cmd);
    debug!(cmd = ?cmd.as_std(), "Running backend command");

    let output = cmd
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Command {
            program: program.clone(),
            message: format!("failed to spawn: {e}"),
            stderr: Some(e.to_string()),
            exit_code: None,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if output.status.success() {
        if !stderr.is_empty() {
            warn!(target: "fwsync::stderr", %program, %stderr, "Non empty stderr on successful command");
        }
        return Ok(stdout);
    }

    error!(%program, status_code = ?output.status.code(), %stderr, "Backend command failed");
    Err(Error::Command {
        program,
        message: describe_status(output.status),
        stderr: (!stderr.is_empty()).then_some(stderr),
        exit_code: output.status.code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello; echo noise >&2"]);
        assert_eq!(run(cmd).await.unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_run_failure_carries_stderr_and_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'iptables: Bad rule.' >&2; exit 1"]);
        let err = run(cmd).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        assert_eq!(err.stderr(), Some("iptables: Bad rule."));
        assert!(err.to_string().contains("exited with status 1"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let cmd = Command::new("/nonexistent/fwsync-test-binary");
        let err = run(cmd).await.unwrap_err();
        assert!(matches!(err, Error::Command { exit_code: None, .. }));
    }

    #[test]
    fn test_program_label_sees_through_wrappers() {
        let mut cmd = Command::new("/usr/bin/sudo");
        cmd.args(["/usr/sbin/iptables", "-L"]);
        assert_eq!(program_label(&cmd), "iptables");

        let cmd = Command::new("/usr/sbin/nft");
        assert_eq!(program_label(&cmd), "nft");
    }
}
