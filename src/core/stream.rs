//! Paginated, cancellable reading of command output
//!
//! Packet-filter CLIs have no pagination of their own and their output can
//! run to thousands of lines. [`recv_cmd_outputs`] pushes the page window down
//! to the process: stdout is scanned line by line on a background task, only
//! rows inside the window are kept, and as soon as the row after the window
//! is seen the child is killed. Memory use and process lifetime are both
//! bounded by the window, not by the size of the output.
//!
//! # Row counting
//!
//! Every line is handed to the parser together with the index it would get if
//! accepted. Lines the parser skips (headers, blanks) do not consume an index,
//! so page boundaries fall on rows, never on header lines.
//!
//! # Outcomes
//!
//! A read ends in exactly one [`StreamOutcome`]:
//!
//! - `Completed`: the process reached EOF and exited successfully
//! - `PausedAtLimit`: the window filled and at least one more row exists;
//!   the child was killed on purpose and its exit status is ignored
//! - `Failed`: spawn failure, non-zero exit, parse error or caller cancellation

use serde::Serialize;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{Error, Result};
use super::exec;

/// Bytes of stderr kept for error reports.
const STDERR_TAIL_BYTES: usize = 4096;

/// One entry of backend output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowInfo {
    /// 0-based position among parsed rows
    pub row_no: u64,
    /// Numeric rule handle, if the backend format exposes one
    pub handle: Option<u64>,
    pub row: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T = RowInfo> {
    pub rows: Vec<T>,
    pub has_more: bool,
}

/// Row window `[offset, offset + limit)`; an absent limit reads to EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    offset: u64,
    limit: Option<u64>,
}

impl PageWindow {
    pub fn page(page: u64, limit: u64) -> Result<Self> {
        if limit == 0 {
            return Err(Error::validation("limit", "Page limit must be at least 1"));
        }
        let offset = page
            .checked_mul(limit)
            .ok_or_else(|| Error::validation("page", "Page offset overflows"))?;
        Ok(Self {
            offset,
            limit: Some(limit),
        })
    }

    pub const fn all() -> Self {
        Self {
            offset: 0,
            limit: None,
        }
    }

    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Index of the first row past the window.
    pub fn end(&self) -> Option<u64> {
        self.limit.map(|limit| self.offset.saturating_add(limit))
    }
}

#[derive(Debug)]
pub enum StreamOutcome<T> {
    Completed(Vec<T>),
    PausedAtLimit(Vec<T>),
    Failed(Error),
}

impl<T> StreamOutcome<T> {
    pub fn into_page(self) -> Result<Page<T>> {
        match self {
            StreamOutcome::Completed(rows) => Ok(Page {
                rows,
                has_more: false,
            }),
            StreamOutcome::PausedAtLimit(rows) => Ok(Page {
                rows,
                has_more: true,
            }),
            StreamOutcome::Failed(e) => Err(e),
        }
    }
}

/// Runs `bin args...` and returns page `page` of `limit` parsed rows.
///
/// `parser` receives the candidate row index and the raw line; returning
/// `Ok(None)` skips the line without consuming an index.
///
/// # Errors
///
/// Returns `Err` if `limit` is 0, the process cannot be spawned, exits
/// unsuccessfully before the window fills, or the parser fails.
pub async fn recv_cmd_outputs<P>(
    page: u64,
    limit: u64,
    bin: &str,
    args: &[&str],
    parser: P,
) -> Result<Page>
where
    P: FnMut(u64, &str) -> Result<Option<RowInfo>> + Send + 'static,
{
    let window = PageWindow::page(page, limit)?;
    let mut cmd = Command::new(bin);
    cmd.args(args);
    stream_command(cmd, window, parser, CancellationToken::new())
        .await
        .into_page()
}

/// How the background scan ended.
enum ScanEnd<T> {
    Eof(Vec<T>),
    Limit(Vec<T>),
    Stopped,
    Failed(Error),
}

/// Streams a prepared command through `parser` within `window`.
///
/// Cancelling `cancel` kills the child and yields [`Error::Cancelled`].
pub async fn stream_command<T, P>(
    mut cmd: Command,
    window: PageWindow,
    parser: P,
    cancel: CancellationToken,
) -> StreamOutcome<T>
where
    T: Send + 'static,
    P: FnMut(u64, &str) -> Result<Option<T>> + Send + 'static,
{
    let program = exec::program_label(&cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(cmd = ?cmd.as_std(), offset = window.offset, limit = ?window.limit, "Streaming command output");

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return StreamOutcome::Failed(Error::Command {
                program,
                message: format!("failed to spawn: {e}"),
                stderr: Some(e.to_string()),
                exit_code: None,
            });
        }
    };
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        terminate(&mut child, &program).await;
        return StreamOutcome::Failed(Error::Internal(format!("{program}: child pipes missing")));
    };

    // Fires when the window fills, the parser fails, or the caller cancels
    let stop = cancel.child_token();
    let stderr_task = tokio::spawn(forward_stderr(stderr, program.clone()));
    let reader = tokio::spawn(scan_rows(stdout, window, parser, stop.clone()));

    let exit = tokio::select! {
        status = child.wait() => Some(status),
        () = stop.cancelled() => None,
    };
    if exit.is_none() {
        terminate(&mut child, &program).await;
    }

    let scan = match reader.await {
        Ok(scan) => scan,
        Err(e) => {
            stderr_task.abort();
            return StreamOutcome::Failed(Error::Internal(format!("{program}: reader task failed: {e}")));
        }
    };

    match scan {
        ScanEnd::Limit(rows) => {
            stderr_task.abort();
            debug!(%program, rows = rows.len(), "Stopped at page limit");
            StreamOutcome::PausedAtLimit(rows)
        }
        ScanEnd::Failed(e) => {
            stderr_task.abort();
            StreamOutcome::Failed(e)
        }
        ScanEnd::Stopped => {
            stderr_task.abort();
            StreamOutcome::Failed(Error::Cancelled)
        }
        ScanEnd::Eof(rows) => {
            let status = match exit {
                Some(Ok(status)) => status,
                Some(Err(e)) => {
                    stderr_task.abort();
                    return StreamOutcome::Failed(e.into());
                }
                None => {
                    stderr_task.abort();
                    return StreamOutcome::Failed(Error::Cancelled);
                }
            };
            let tail = stderr_task.await.unwrap_or_default();
            if status.success() {
                StreamOutcome::Completed(rows)
            } else {
                StreamOutcome::Failed(Error::Command {
                    program,
                    message: exec::describe_status(status),
                    stderr: (!tail.is_empty()).then_some(tail),
                    exit_code: status.code(),
                })
            }
        }
    }
}

async fn scan_rows<T, P>(
    stdout: ChildStdout,
    window: PageWindow,
    mut parser: P,
    stop: CancellationToken,
) -> ScanEnd<T>
where
    P: FnMut(u64, &str) -> Result<Option<T>>,
{
    let mut lines = BufReader::new(stdout).split(b'\n');
    let mut rows = Vec::new();
    let mut index: u64 = 0;
    let end = window.end();

    loop {
        let segment = tokio::select! {
            biased;
            () = stop.cancelled() => return ScanEnd::Stopped,
            segment = lines.next_segment() => segment,
        };
        let segment = match segment {
            Ok(Some(segment)) => segment,
            Ok(None) => return ScanEnd::Eof(rows),
            Err(e) => {
                stop.cancel();
                return ScanEnd::Failed(e.into());
            }
        };
        let line = String::from_utf8_lossy(&segment);
        let line = line.trim_end_matches(['\r', '\n']);

        // Lines before the offset are parsed too: only the parser knows which
        // lines are headers, and those must not count toward the offset.
        let row = match parser(index, line) {
            Ok(Some(row)) => row,
            Ok(None) => continue,
            Err(e) => {
                stop.cancel();
                return ScanEnd::Failed(e);
            }
        };

        if end.is_some_and(|end| index >= end) {
            // The row after the window exists, so there is more output
            stop.cancel();
            return ScanEnd::Limit(rows);
        }
        if index >= window.offset {
            rows.push(row);
        }
        index += 1;
    }
}

async fn forward_stderr(stderr: ChildStderr, program: String) -> String {
    let mut lines = BufReader::new(stderr).split(b'\n');
    let mut tail = String::new();

    while let Ok(Some(segment)) = lines.next_segment().await {
        let line = String::from_utf8_lossy(&segment);
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        warn!(target: "fwsync::stderr", %program, "{line}");

        tail.push_str(line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_BYTES {
            let mut cut = tail.len() - STDERR_TAIL_BYTES;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }

    tail.trim_end().to_string()
}

/// Kills and reaps the child. A child that already exited counts as killed.
async fn terminate(child: &mut Child, program: &str) {
    match child.start_kill() {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
            debug!(%program, "Child already exited before kill");
        }
        Err(e) => warn!(%program, "Failed to kill child process: {e}"),
    }
    if let Err(e) = child.wait().await {
        warn!(%program, "Failed to reap child process: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(row_no: u64, line: &str) -> Result<Option<RowInfo>> {
        Ok(Some(RowInfo {
            row_no,
            handle: line.trim().parse().ok(),
            row: line.to_string(),
        }))
    }

    #[test]
    fn test_window_math() {
        let window = PageWindow::page(2, 10).unwrap();
        assert_eq!(window.offset(), 20);
        assert_eq!(window.end(), Some(30));
        assert_eq!(PageWindow::all().end(), None);
        assert!(PageWindow::page(0, 0).is_err());
        assert!(PageWindow::page(u64::MAX, 2).is_err());
    }

    #[tokio::test]
    async fn test_first_page_has_more() {
        let page = recv_cmd_outputs(0, 10, "seq", &["1", "25"], numbered).await.unwrap();
        assert_eq!(page.rows.len(), 10);
        assert!(page.has_more);
        assert_eq!(page.rows[0].row, "1");
        assert_eq!(page.rows[0].row_no, 0);
        assert_eq!(page.rows[9].handle, Some(10));
    }

    #[tokio::test]
    async fn test_last_page_is_partial() {
        let page = recv_cmd_outputs(2, 10, "seq", &["1", "25"], numbered).await.unwrap();
        assert_eq!(page.rows.len(), 5);
        assert!(!page.has_more);
        assert_eq!(page.rows[0].row, "21");
        assert_eq!(page.rows[4].row_no, 24);
    }

    #[tokio::test]
    async fn test_exact_fit_has_no_more() {
        let page = recv_cmd_outputs(1, 10, "seq", &["1", "20"], numbered).await.unwrap();
        assert_eq!(page.rows.len(), 10);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_page_past_end_is_empty() {
        let page = recv_cmd_outputs(5, 10, "seq", &["1", "25"], numbered).await.unwrap();
        assert!(page.rows.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_skipped_lines_do_not_consume_rows() {
        let script = "echo 'Chain INPUT'; echo 'num target'; seq 1 5";
        let page = recv_cmd_outputs(0, 3, "sh", &["-c", script], |row_no, line| {
            if line.parse::<u64>().is_err() {
                return Ok(None);
            }
            numbered(row_no, line)
        })
        .await
        .unwrap();
        let rows: Vec<&str> = page.rows.iter().map(|r| r.row.as_str()).collect();
        assert_eq!(rows, ["1", "2", "3"]);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_unbounded_producer_is_stopped() {
        let page = recv_cmd_outputs(3, 4, "yes", &["rule"], numbered).await.unwrap();
        assert_eq!(page.rows.len(), 4);
        assert!(page.has_more);
        assert_eq!(page.rows[0].row_no, 12);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let err = recv_cmd_outputs(0, 10, "sh", &["-c", "echo 1; echo 'chain missing' >&2; exit 3"], numbered)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(err.stderr(), Some("chain missing"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_after_limit_is_ignored() {
        let page = recv_cmd_outputs(0, 2, "sh", &["-c", "seq 1 3; exit 1"], numbered)
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 2);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_parser_error_aborts() {
        let err = recv_cmd_outputs(0, 10, "yes", &["x"], |row_no, _| {
            if row_no == 3 {
                Err(Error::Parse {
                    row: row_no,
                    message: "bad row".to_string(),
                })
            } else {
                Ok(Some(RowInfo {
                    row_no,
                    handle: None,
                    row: String::new(),
                }))
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Parse { row: 3, .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = recv_cmd_outputs(0, 10, "/nonexistent/fwsync-bin", &[], numbered)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command { exit_code: None, .. }));
    }

    #[tokio::test]
    async fn test_caller_cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            canceller.cancel();
        });
        let outcome = stream_command(cmd, PageWindow::all(), numbered, cancel).await;
        assert!(matches!(outcome, StreamOutcome::Failed(Error::Cancelled)));
    }
}
