//! Wraps a `PtySession` with block-boundary awareness: turns the marker
//! stream into command/output blocks and exposes the serialized tool-call
//! surface (submit a command, send raw keys, take a snapshot) used by the
//! registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{KmuxError, Result};
use crate::marker::{extract_markers, status_from_markers, MarkerKind, SessionStatus};
use crate::pty_session::{OnClosed, OnOutput, PtySession, PtySessionStatus, PtySize2};
use crate::renderer::{render, ScreenSize};

const BRACKETED_PASTE_START: &[u8] = b"\x1b[200~";
const BRACKETED_PASTE_END: &[u8] = b"\x1b[201~";

/// Sent before every submitted command to clear out whatever the line editor
/// thinks is currently on the line (a stray completion, an aborted edit)
/// before the bracketed paste lands.
const BACKSPACE_BURST: &[u8] = &[0x08; 32];

/// One complete (command, output) pair recovered from the marker stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBlock {
    /// One rendered line per `EditStart..EditEnd` span; more than one means
    /// the command was entered across several continuation lines.
    pub parts: Vec<String>,
    pub output: String,
}

/// Whatever is left dangling once every complete block has been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenTail {
    /// Buffer ends between blocks, at an idle prompt.
    None,
    /// Buffer ends mid-edit: a command is being typed (possibly continued).
    Editing { parts: Vec<String> },
    /// Buffer ends mid-execution: the command is known, output is partial.
    Executing { parts: Vec<String>, partial_output: String },
}

enum ParseState {
    WaitEditStart,
    WaitEditEnd { parts: Vec<(usize, usize)> },
    WaitExecOrNextEdit { parts: Vec<(usize, usize)> },
    WaitExecEnd { parts: Vec<(usize, usize)>, out_start: usize },
}

/// Walks the marker stream over `buffer`, emitting every complete block in
/// order plus whatever's left open at the end.
///
/// From `WaitEditStart` we look for the next `EditStart`. From `WaitEditEnd`
/// we collect bytes up to the next `EditEnd` as one command part. From
/// `WaitExecOrNextEdit` the next marker decides: another `EditStart` means
/// the command continues onto another line, an `ExecStart` means it runs.
/// From `WaitExecEnd` we collect bytes up to the next `ExecEnd` as the
/// block's output, then return to `WaitEditStart`.
pub fn parse_blocks(buffer: &[u8], size: ScreenSize) -> (Vec<CommandBlock>, OpenTail) {
    let occurrences = extract_markers(buffer);
    let mut blocks = Vec::new();
    let mut state = ParseState::WaitEditStart;

    for occ in &occurrences {
        state = match (state, occ.kind) {
            (ParseState::WaitEditStart, MarkerKind::EditStart) => {
                ParseState::WaitEditEnd { parts: vec![(occ.end, occ.end)] }
            }
            (ParseState::WaitEditStart, _) => ParseState::WaitEditStart,

            (ParseState::WaitEditEnd { mut parts }, MarkerKind::EditEnd) => {
                if let Some(last) = parts.last_mut() {
                    last.1 = occ.offset;
                }
                ParseState::WaitExecOrNextEdit { parts }
            }
            (ParseState::WaitEditEnd { parts }, _) => ParseState::WaitEditEnd { parts },

            (ParseState::WaitExecOrNextEdit { mut parts }, MarkerKind::EditStart) => {
                parts.push((occ.end, occ.end));
                ParseState::WaitEditEnd { parts }
            }
            (ParseState::WaitExecOrNextEdit { parts }, MarkerKind::ExecStart) => {
                ParseState::WaitExecEnd { parts, out_start: occ.end }
            }
            (ParseState::WaitExecOrNextEdit { parts }, _) => ParseState::WaitExecOrNextEdit { parts },

            (ParseState::WaitExecEnd { parts, out_start }, MarkerKind::ExecEnd) => {
                let command_parts = render_parts(buffer, &parts, size);
                let output = render(&buffer[out_start..occ.offset], size);
                blocks.push(CommandBlock { parts: command_parts, output });
                ParseState::WaitEditStart
            }
            (ParseState::WaitExecEnd { parts, out_start }, _) => {
                ParseState::WaitExecEnd { parts, out_start }
            }
        };
    }

    let tail = match state {
        ParseState::WaitEditStart => OpenTail::None,
        ParseState::WaitEditEnd { parts } | ParseState::WaitExecOrNextEdit { parts } => {
            OpenTail::Editing { parts: render_parts(buffer, &parts, size) }
        }
        ParseState::WaitExecEnd { parts, out_start } => OpenTail::Executing {
            parts: render_parts(buffer, &parts, size),
            partial_output: render(&buffer[out_start..], size),
        },
    };

    (blocks, tail)
}

fn render_parts(buffer: &[u8], parts: &[(usize, usize)], size: ScreenSize) -> Vec<String> {
    parts.iter().map(|(start, end)| render(&buffer[*start..*end], size)).collect()
}

/// Outcome of `submit_command`.
#[derive(Debug, Clone)]
pub enum CommandResult {
    /// The shell returned to an idle prompt before the deadline.
    Finished { output: String, duration: Duration, combined_command: String },
    /// The line was accepted but zsh wants a continuation (e.g. an open quote
    /// or unclosed `if`); nothing executed yet.
    Incomplete { combined_command: String },
    /// The deadline passed before the shell went idle again. The command may
    /// still be running; a crashed shell looks identical to this from here.
    Timeout { partial_output: String, combined_command: String, timeout: Duration },
}

/// A zsh session plus the marker-aware state needed to turn its byte stream
/// into blocks: the cumulative buffer, the idle-transition notifier, and the
/// lines submitted so far toward the command currently being built up.
pub struct BlockPtySession {
    pty: Arc<PtySession>,
    buffer: Arc<SyncMutex<Vec<u8>>>,
    size: ScreenSize,
    tool_mutex: AsyncMutex<()>,
    idle_notify: Arc<Notify>,
    finished_notify: Arc<Notify>,
    pending_parts: SyncMutex<Vec<String>>,
    root_password: Option<String>,
}

impl BlockPtySession {
    pub fn new(size: ScreenSize, zsh_override: Option<String>, root_password: Option<String>) -> Arc<Self> {
        let buffer: Arc<SyncMutex<Vec<u8>>> = Arc::new(SyncMutex::new(Vec::new()));
        let idle_notify = Arc::new(Notify::new());
        let finished_notify = Arc::new(Notify::new());

        let buf_for_output = Arc::clone(&buffer);
        let idle_for_output = Arc::clone(&idle_notify);
        let on_output: OnOutput = Arc::new(move |chunk: &[u8]| {
            let mut buf = buf_for_output.lock();
            buf.extend_from_slice(chunk);
            if let Ok(status) = status_from_markers(&buf) {
                if status.is_idle() {
                    idle_for_output.notify_waiters();
                }
            }
        });

        let finished_for_closed = Arc::clone(&finished_notify);
        let idle_for_closed = Arc::clone(&idle_notify);
        let on_closed: OnClosed = Arc::new(move || {
            finished_for_closed.notify_waiters();
            idle_for_closed.notify_waiters();
        });

        let pty = Arc::new(PtySession::new(
            PtySize2 { rows: size.rows, cols: size.cols },
            zsh_override,
            on_output,
            on_closed,
        ));

        Arc::new(Self {
            pty,
            buffer,
            size,
            tool_mutex: AsyncMutex::new(()),
            idle_notify,
            finished_notify,
            pending_parts: SyncMutex::new(Vec::new()),
            root_password,
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        PtySession::start(&self.pty).await
    }

    pub fn stop(&self) {
        self.pty.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.pty.status() == PtySessionStatus::Finished
    }

    pub async fn wait_finished(&self) {
        if self.is_finished() {
            return;
        }
        self.finished_notify.notified().await;
    }

    /// Derives status purely from the markers seen so far.
    pub fn status(&self) -> SessionStatus {
        let buf = self.buffer.lock();
        status_from_markers(&buf).unwrap_or(SessionStatus::NoMarkers)
    }

    pub fn get_current_running_command(&self) -> Option<Vec<String>> {
        let buf = self.buffer.lock();
        let (_, tail) = parse_blocks(&buf, self.size);
        match tail {
            OpenTail::Executing { parts, .. } => Some(parts),
            _ => None,
        }
    }

    /// Renders a window of the cumulative buffer. With `include_all` false,
    /// the window depends on the current status: while `Executing` or
    /// `InputCommand`, it starts right after the last `ExecEnd` (the command
    /// now in flight and nothing from before it); while `AwaitingCommand`, it
    /// starts at the *second-to-last* `ExecEnd`, i.e. the previous completed
    /// command and its output. Either way, falling short of the needed
    /// `ExecEnd` count falls back to the buffer start.
    pub fn snapshot(&self, include_all: bool) -> String {
        let buf = self.buffer.lock();
        if include_all {
            return render(&buf, self.size);
        }

        let status = status_from_markers(&buf).unwrap_or(SessionStatus::NoMarkers);
        let exec_ends: Vec<_> = extract_markers(&buf)
            .into_iter()
            .filter(|occ| occ.kind == MarkerKind::ExecEnd)
            .collect();

        let start = match status {
            SessionStatus::Executing | SessionStatus::InputCommand => {
                exec_ends.last().map(|occ| occ.end).unwrap_or(0)
            }
            _ => {
                if exec_ends.len() >= 2 {
                    exec_ends[exec_ends.len() - 2].end
                } else {
                    0
                }
            }
        };
        render(&buf[start..], self.size)
    }

    /// Submits a line of input framed as a bracketed paste, then waits for
    /// the shell to report idle again (or times out). Held behind the tool
    /// mutex for the whole wait so overlapping calls serialize rather than
    /// race on `pending_parts`.
    pub async fn submit_command(&self, text: &str, timeout: Duration) -> Result<CommandResult> {
        let _guard = self.tool_mutex.lock().await;

        if self.pty.status() != PtySessionStatus::Running {
            return Err(KmuxError::InvalidOperation {
                status: format!("{:?}", self.pty.status()),
                detail: "pty session is not running".into(),
            });
        }

        let status = self.status();
        if !status.is_idle() {
            return Err(KmuxError::InvalidOperation {
                status: status.to_string(),
                detail: "submit_command requires the session to be awaiting a command".into(),
            });
        }
        if status == SessionStatus::AwaitingCommand {
            self.pending_parts.lock().clear();
        }

        self.pending_parts.lock().push(text.to_string());

        let marker_count_before = extract_markers(&self.buffer.lock()).len();

        let mut framed = Vec::with_capacity(text.len() + BACKSPACE_BURST.len() + 16);
        framed.extend_from_slice(BACKSPACE_BURST);
        framed.extend_from_slice(BRACKETED_PASTE_START);
        framed.extend_from_slice(text.as_bytes());
        framed.extend_from_slice(BRACKETED_PASTE_END);
        framed.push(b'\r');
        self.pty.write_bytes(framed)?;

        let started = Instant::now();
        debug!(len = text.len(), "submitted command line");

        match tokio::time::timeout(timeout, self.wait_for_new_idle(marker_count_before)).await {
            Ok(Ok(())) => self.finish_submit(started),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                let combined_command = self.pending_parts.lock().join("\n");
                let buf = self.buffer.lock();
                let (_, tail) = parse_blocks(&buf, self.size);
                let partial_output = match tail {
                    OpenTail::Executing { partial_output, .. } => partial_output,
                    _ => String::new(),
                };
                warn!(timeout_seconds = timeout.as_secs_f64(), "command did not return to idle before deadline");
                Ok(CommandResult::Timeout { partial_output, combined_command, timeout })
            }
        }
    }

    fn finish_submit(&self, started: Instant) -> Result<CommandResult> {
        let status = status_from_markers(&self.buffer.lock())?;
        if status == SessionStatus::InputCommand {
            let combined_command = self.pending_parts.lock().join("\n");
            return Ok(CommandResult::Incomplete { combined_command });
        }

        let combined_command = {
            let mut pending = self.pending_parts.lock();
            let joined = pending.join("\n");
            pending.clear();
            joined
        };
        let (blocks, _) = parse_blocks(&self.buffer.lock(), self.size);
        let output = blocks.last().map(|b| b.output.clone()).unwrap_or_default();
        info!(duration_ms = started.elapsed().as_millis(), "command finished");
        Ok(CommandResult::Finished { output, duration: started.elapsed(), combined_command })
    }

    async fn wait_for_new_idle(&self, marker_count_before: usize) -> Result<()> {
        loop {
            let notified = self.idle_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let buf = self.buffer.lock();
                if extract_markers(&buf).len() > marker_count_before {
                    let status = status_from_markers(&buf)?;
                    if status.is_idle() {
                        return Ok(());
                    }
                }
            }

            notified.await;
        }
    }

    /// Writes raw bytes straight through, unframed: used for control
    /// sequences like Ctrl-C or Ctrl-D rather than a line of input.
    pub async fn send_keys(&self, keys: &[u8]) -> Result<()> {
        let _guard = self.tool_mutex.lock().await;
        if self.pty.status() != PtySessionStatus::Running {
            return Err(KmuxError::InvalidOperation {
                status: format!("{:?}", self.pty.status()),
                detail: "pty session is not running".into(),
            });
        }
        let status = self.status();
        if status != SessionStatus::Executing {
            return Err(KmuxError::InvalidOperation {
                status: status.to_string(),
                detail: "send_keys requires a command to be executing".into(),
            });
        }
        self.pty.write_bytes(keys.to_vec())
    }

    pub async fn enter_root_password(&self) -> Result<()> {
        let _guard = self.tool_mutex.lock().await;
        let status = self.status();
        if status != SessionStatus::Executing {
            return Err(KmuxError::InvalidOperation {
                status: status.to_string(),
                detail: "enter_root_password requires a command to be executing".into(),
            });
        }
        let password = self.root_password.clone().ok_or(KmuxError::MissingPrivilege)?;
        let mut framed = password.into_bytes();
        framed.push(b'\r');
        self.pty.write_bytes(framed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::MarkerKind;

    fn marker(kind: MarkerKind) -> Vec<u8> {
        kind.wire_bytes()
    }

    #[test]
    fn parses_a_single_finished_block() {
        let mut buf = marker(MarkerKind::EditStart);
        buf.extend(b"echo hi");
        buf.extend(marker(MarkerKind::EditEnd));
        buf.extend(marker(MarkerKind::ExecStart));
        buf.extend(b"hi\r\n");
        buf.extend(marker(MarkerKind::ExecEnd));

        let (blocks, tail) = parse_blocks(&buf, ScreenSize::default());
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].parts, vec!["echo hi".to_string()]);
        assert!(blocks[0].output.contains("hi"));
        assert_eq!(tail, OpenTail::None);
    }

    #[test]
    fn multi_line_continuation_produces_multiple_parts() {
        let mut buf = marker(MarkerKind::EditStart);
        buf.extend(b"if true; then");
        buf.extend(marker(MarkerKind::EditEnd));
        buf.extend(marker(MarkerKind::EditStart));
        buf.extend(b"echo hi; fi");
        buf.extend(marker(MarkerKind::EditEnd));
        buf.extend(marker(MarkerKind::ExecStart));
        buf.extend(b"hi\r\n");
        buf.extend(marker(MarkerKind::ExecEnd));

        let (blocks, _) = parse_blocks(&buf, ScreenSize::default());
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].parts.len(), 2);
    }

    #[test]
    fn open_edit_with_no_edit_end_yields_editing_tail() {
        let mut buf = marker(MarkerKind::EditStart);
        buf.extend(b"echo partial");
        let (blocks, tail) = parse_blocks(&buf, ScreenSize::default());
        assert!(blocks.is_empty());
        match tail {
            OpenTail::Editing { parts } => assert_eq!(parts, vec!["echo partial".to_string()]),
            other => panic!("expected Editing tail, got {other:?}"),
        }
    }

    #[test]
    fn open_exec_with_no_exec_end_yields_executing_tail() {
        let mut buf = marker(MarkerKind::EditStart);
        buf.extend(b"sleep 5");
        buf.extend(marker(MarkerKind::EditEnd));
        buf.extend(marker(MarkerKind::ExecStart));
        buf.extend(b"still going\r\n");
        let (blocks, tail) = parse_blocks(&buf, ScreenSize::default());
        assert!(blocks.is_empty());
        match tail {
            OpenTail::Executing { parts, partial_output } => {
                assert_eq!(parts, vec!["sleep 5".to_string()]);
                assert!(partial_output.contains("still going"));
            }
            other => panic!("expected Executing tail, got {other:?}"),
        }
    }

    fn sample_two_command_buffer() -> Vec<u8> {
        let mut buf = marker(MarkerKind::EditStart);
        buf.extend(b"echo one");
        buf.extend(marker(MarkerKind::EditEnd));
        buf.extend(marker(MarkerKind::ExecStart));
        buf.extend(b"one\r\n");
        buf.extend(marker(MarkerKind::ExecEnd));
        buf.extend(marker(MarkerKind::EditStart));
        buf.extend(b"echo two");
        buf.extend(marker(MarkerKind::EditEnd));
        buf.extend(marker(MarkerKind::ExecStart));
        buf.extend(b"two\r\n");
        buf.extend(marker(MarkerKind::ExecEnd));
        buf
    }

    #[test]
    fn snapshot_window_starts_at_second_to_last_exec_end() {
        let session = BlockPtySession::new(ScreenSize::default(), None, None);
        *session.buffer.lock() = sample_two_command_buffer();

        let windowed = session.snapshot(false);
        assert!(windowed.contains("two"));
        assert!(!windowed.contains("one"));
    }

    #[test]
    fn snapshot_falls_back_to_buffer_start_with_fewer_than_two_exec_ends() {
        let session = BlockPtySession::new(ScreenSize::default(), None, None);
        let mut buf = marker(MarkerKind::EditStart);
        buf.extend(b"echo one");
        buf.extend(marker(MarkerKind::EditEnd));
        buf.extend(marker(MarkerKind::ExecStart));
        buf.extend(b"one\r\n");
        buf.extend(marker(MarkerKind::ExecEnd));
        *session.buffer.lock() = buf;

        assert!(session.snapshot(false).contains("one"));
    }

    #[test]
    fn snapshot_include_all_renders_everything() {
        let session = BlockPtySession::new(ScreenSize::default(), None, None);
        *session.buffer.lock() = sample_two_command_buffer();

        let full = session.snapshot(true);
        assert!(full.contains("one"));
        assert!(full.contains("two"));
    }

    #[test]
    fn snapshot_window_while_executing_starts_after_the_last_exec_end() {
        let session = BlockPtySession::new(ScreenSize::default(), None, None);
        let mut buf = sample_two_command_buffer();
        buf.extend(marker(MarkerKind::EditStart));
        buf.extend(b"sleep 5");
        buf.extend(marker(MarkerKind::EditEnd));
        buf.extend(marker(MarkerKind::ExecStart));
        buf.extend(b"still going\r\n");
        *session.buffer.lock() = buf;

        assert_eq!(session.status(), SessionStatus::Executing);
        let windowed = session.snapshot(false);
        assert!(windowed.contains("still going"));
        assert!(!windowed.contains("one"));
        assert!(!windowed.contains("two"));
    }

    #[tokio::test]
    async fn enter_root_password_without_one_configured_is_missing_privilege() {
        let session = BlockPtySession::new(ScreenSize::default(), None, None);
        let err = session.enter_root_password().await.unwrap_err();
        assert!(matches!(err, KmuxError::MissingPrivilege));
    }
}
