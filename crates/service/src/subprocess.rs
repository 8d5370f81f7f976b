//! Subprocess protocol: the browser
//! automation binary is an opaque child process driven by a
//! stdin-JSON / stderr-LOG / stdout-RESULT line contract. The child is
//! spawned and supervised with `std::process::Command` from the task
//! queue's dedicated worker thread, not `tokio::process`, keeping the same
//! "blocking call on its own thread" shape as this crate's other
//! long-lived blocking operations.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::TaskError;

/// Environment variable the child (and its descendants, if it forks further)
/// must carry so the orphan sweeper can recognize
/// its own process tree after a timeout or supervisor restart.
pub const CHILD_ENV_MARKER: &str = "ACCTRELAY_CHILD_MARKER";

#[derive(Debug, Clone, Serialize)]
pub struct SubprocessRequest {
    pub action: &'static str,
    pub email: Option<String>,
    pub browser_engine: String,
    pub headless: bool,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub mail_provider: String,
    pub mail_config: serde_json::Value,
    pub domain: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SubprocessOutcome {
    Success { config: serde_json::Value },
    Failure { error: String, traceback: Option<String> },
}

enum LogLine {
    Log(String, String),
    Other(String),
}

fn parse_log_line(line: &str) -> LogLine {
    if let Some(rest) = line.strip_prefix("LOG:") {
        if let Some((level, message)) = rest.split_once(':') {
            return LogLine::Log(level.to_string(), message.to_string());
        }
    }
    LogLine::Other(line.to_string())
}

/// Runs one child process to completion (or until cancelled/timed out),
/// forwarding `LOG:<level>:<message>` lines via `on_log` and returning the
/// parsed `RESULT:<json>` line.
///
/// `cancel` is polled on a short interval; the caller sets it from the
/// task's `cancel_requested` flag for cooperative cancellation.
pub fn run_subprocess(
    command: &str,
    request: &SubprocessRequest,
    marker: &str,
    timeout: Duration,
    cancel: &AtomicBool,
    mut on_log: impl FnMut(&str, &str),
) -> Result<SubprocessOutcome, TaskError> {
    let mut cmd = Command::new(command);
    cmd.env(CHILD_ENV_MARKER, marker)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child: Child = cmd
        .spawn()
        .map_err(|e| TaskError::SubprocessSpawn(e.to_string()))?;

    let payload = serde_json::to_vec(request).map_err(|e| TaskError::Protocol(e.to_string()))?;
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&payload);
        let _ = stdin.write_all(b"\n");
        // Dropping `stdin` here closes the pipe so the child sees EOF.
    }

    let (log_tx, log_rx) = mpsc::channel::<(String, String)>();
    let stderr = child.stderr.take();
    let stderr_thread = stderr.map(|pipe| {
        std::thread::spawn(move || {
            for line in BufReader::new(pipe).lines().map_while(Result::ok) {
                if let LogLine::Log(level, message) = parse_log_line(&line) {
                    let _ = log_tx.send((level, message));
                }
            }
        })
    });

    let (result_tx, result_rx) = mpsc::channel::<String>();
    let stdout = child.stdout.take();
    let stdout_thread = stdout.map(|pipe| {
        std::thread::spawn(move || {
            for line in BufReader::new(pipe).lines().map_while(Result::ok) {
                if let Some(json) = line.strip_prefix("RESULT:") {
                    let _ = result_tx.send(json.to_string());
                }
            }
        })
    });

    let started_at = Instant::now();
    let outcome = loop {
        while let Ok((level, message)) = log_rx.try_recv() {
            on_log(&level, &message);
        }

        if let Ok(Some(_status)) = child.try_wait() {
            break Ok(());
        }

        if cancel.load(Ordering::SeqCst) {
            let _ = child.kill();
            let _ = child.wait();
            break Err(TaskError::Cancelled(None));
        }

        if started_at.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            break Err(TaskError::SubprocessTimeout);
        }

        std::thread::sleep(Duration::from_millis(150));
    };

    while let Ok((level, message)) = log_rx.try_recv() {
        on_log(&level, &message);
    }
    if let Some(t) = stderr_thread {
        let _ = t.join();
    }
    if let Some(t) = stdout_thread {
        let _ = t.join();
    }

    outcome?;

    let result_json = result_rx
        .try_recv()
        .map_err(|_| TaskError::Protocol("child exited without a RESULT: line".to_string()))?;
    let value: serde_json::Value = serde_json::from_str(&result_json)
        .map_err(|e| TaskError::Protocol(format!("malformed RESULT json: {e}")))?;

    if value.get("success").and_then(|v| v.as_bool()) == Some(true) {
        Ok(SubprocessOutcome::Success {
            config: value.get("config").cloned().unwrap_or(serde_json::Value::Null),
        })
    } else {
        Ok(SubprocessOutcome::Failure {
            error: value
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown subprocess error")
                .to_string(),
            traceback: value.get("traceback").and_then(|v| v.as_str()).map(str::to_string),
        })
    }
}

/// Process names the sweeper recognizes as descendants of a browser
/// automation child, via a process-name whitelist.
const ORPHAN_NAME_WHITELIST: &[&str] = &["chromium", "chrome", "firefox", "webkit", "playwright"];

/// Best-effort Linux-only orphan sweep: scans `/proc/<pid>/environ` for the
/// marker this supervisor stamped on its own children, and `/proc/<pid>/
/// comm` against a process-name whitelist, killing matches. There is no
/// portable ecosystem crate for this in the corpus (no `sysinfo`/`procfs`
/// dependency appears anywhere in the example pack), so this reads `/proc`
/// directly rather than reaching for an unrelated dependency; see
/// DESIGN.md for the grounding note.
#[cfg(target_os = "linux")]
pub fn sweep_orphans(marker: &str) -> usize {
    use std::fs;

    let mut killed = 0;
    let Ok(entries) = fs::read_dir("/proc") else {
        return 0;
    };
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let comm = fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
        let comm = comm.trim();
        let name_matches = ORPHAN_NAME_WHITELIST
            .iter()
            .any(|name| comm.eq_ignore_ascii_case(name));
        if !name_matches {
            continue;
        }
        let environ = fs::read(entry.path().join("environ")).unwrap_or_default();
        let marker_entry = format!("{CHILD_ENV_MARKER}={marker}\0");
        let marker_bytes = marker_entry.as_bytes();
        let environ_has_marker = environ
            .windows(marker_bytes.len().max(1))
            .any(|window| window == marker_bytes);
        if environ_has_marker {
            // SIGKILL; these are stray browser processes left after a
            // killed/timed-out child, not anything we want to wait on.
            unsafe {
                libc_kill(pid);
            }
            killed += 1;
        }
    }
    killed
}

#[cfg(target_os = "linux")]
unsafe fn libc_kill(pid: i32) {
    // Avoid a dependency on the `libc` crate for a single syscall: shell out
    // to `kill` which is present on every Linux target we run on.
    let _ = Command::new("kill").arg("-9").arg(pid.to_string()).status();
}

#[cfg(not(target_os = "linux"))]
pub fn sweep_orphans(_marker: &str) -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_line_splits_level_and_message() {
        match parse_log_line("LOG:info:hello world") {
            LogLine::Log(level, message) => {
                assert_eq!(level, "info");
                assert_eq!(message, "hello world");
            }
            LogLine::Other(_) => panic!("expected a log line"),
        }
    }

    #[test]
    fn parse_log_line_passes_through_non_log_lines() {
        match parse_log_line("RESULT:{}") {
            LogLine::Other(line) => assert_eq!(line, "RESULT:{}"),
            LogLine::Log(..) => panic!("should not parse as a log line"),
        }
    }

    #[test]
    fn run_subprocess_reports_spawn_failure_for_missing_binary() {
        let request = SubprocessRequest {
            action: "register",
            email: None,
            browser_engine: "chromium".to_string(),
            headless: true,
            proxy: None,
            user_agent: None,
            mail_provider: "gptmail".to_string(),
            mail_config: serde_json::json!({}),
            domain: None,
        };
        let cancel = AtomicBool::new(false);
        let result = run_subprocess(
            "/nonexistent/acctrelay-browser-worker",
            &request,
            "test-marker",
            Duration::from_secs(5),
            &cancel,
            |_, _| {},
        );
        assert!(matches!(result, Err(TaskError::SubprocessSpawn(_))));
    }

    #[test]
    fn sweep_orphans_without_marker_present_kills_nothing() {
        assert_eq!(sweep_orphans("no-such-marker-in-any-process"), 0);
    }
}
