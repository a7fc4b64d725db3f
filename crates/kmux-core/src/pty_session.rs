//! Owns a single zsh child process under a PTY and pumps bytes to/from it
//! without blocking the event loop.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{KmuxError, Result};
use crate::shell::{build_zshrc_patch, detect_zsh};

/// Lifecycle status of the underlying PTY child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtySessionStatus {
    NotStarted,
    Running,
    Finished,
}

/// Called with every chunk read from the master fd, in order.
pub type OnOutput = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Called exactly once, after the session has transitioned to `Finished`.
pub type OnClosed = Arc<dyn Fn() + Send + Sync>;

/// Screen dimensions the PTY is opened with.
#[derive(Debug, Clone, Copy)]
pub struct PtySize2 {
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtySize2 {
    fn default() -> Self {
        PtySize2 { rows: 24, cols: 80 }
    }
}

/// Marker type so `tokio::io::unix::AsyncFd` has something to wrap; the
/// actual reads/writes go through the `Read`/`Write` handles portable-pty
/// hands back, not through this fd directly. We only use it for readiness.
struct RawMasterFd(RawFd);

impl AsRawFd for RawMasterFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct Running {
    child: Box<dyn Child + Send + Sync>,
    master: Box<dyn MasterPty + Send>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    closer_task: JoinHandle<()>,
    cleanup_task: JoinHandle<()>,
}

/// A single zsh session under a PTY. See module docs.
pub struct PtySession {
    status: Mutex<PtySessionStatus>,
    running: Mutex<Option<Running>>,
    child_exited: Arc<Notify>,
    size: PtySize2,
    zsh_override: Option<String>,
    on_output: OnOutput,
    on_closed: OnClosed,
    closed_fired: Mutex<bool>,
}

impl PtySession {
    pub fn new(size: PtySize2, zsh_override: Option<String>, on_output: OnOutput, on_closed: OnClosed) -> Self {
        Self {
            status: Mutex::new(PtySessionStatus::NotStarted),
            running: Mutex::new(None),
            child_exited: Arc::new(Notify::new()),
            size,
            zsh_override,
            on_output,
            on_closed,
            closed_fired: Mutex::new(false),
        }
    }

    pub fn status(&self) -> PtySessionStatus {
        *self.status.lock()
    }

    /// Forks zsh under a PTY with the marker-registration patch installed,
    /// and starts the non-blocking reader/writer pumps.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut status = self.status.lock();
            if *status != PtySessionStatus::NotStarted {
                return Err(KmuxError::InvalidOperation {
                    status: format!("{:?}", *status),
                    detail: "PTY session already started".into(),
                });
            }
            *status = PtySessionStatus::Running;
        }

        let zsh = detect_zsh(self.zsh_override.as_deref(), std::env::var("SHELL").ok().as_deref());
        let tmp_dir = std::env::temp_dir().join(format!("kmux_{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&tmp_dir)?;
        write_patched_zshrc(&tmp_dir, original_zshrc_path().as_deref())?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: self.size.rows,
                cols: self.size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| io_err(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(&zsh.path);
        for arg in zsh.login_args() {
            cmd.arg(arg);
        }
        cmd.env("ZDOTDIR", &tmp_dir);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| io_err(format!("failed to spawn zsh: {e}")))?;
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| io_err(format!("failed to take pty writer: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| io_err(format!("failed to clone pty reader: {e}")))?;
        let raw_fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| io_err("master pty has no raw fd on this platform".into()))?;

        set_nonblocking(raw_fd)?;

        let async_read_fd = Arc::new(AsyncFd::new(RawMasterFd(raw_fd))?);
        let async_write_fd = Arc::clone(&async_read_fd);

        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let child_exited = Arc::clone(&self.child_exited);
        let on_output = Arc::clone(&self.on_output);
        let reader_task = reader_pump::spawn(async_read_fd, reader, on_output, child_exited);

        let child_exited_w = Arc::clone(&self.child_exited);
        let writer_task = spawn_writer_pump(async_write_fd, writer, rx, child_exited_w);

        let child_exited_c = Arc::clone(&self.child_exited);
        let self_for_closer = Arc::clone(self);
        let closer_task = tokio::spawn(async move {
            child_exited_c.notified().await;
            self_for_closer.stop();
        });

        let cleanup_dir = tmp_dir.clone();
        let cleanup_task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            let _ = std::fs::remove_dir_all(&cleanup_dir);
        });

        *self.running.lock() = Some(Running {
            child,
            master: pair.master,
            tx,
            reader_task,
            writer_task,
            closer_task,
            cleanup_task,
        });

        info!(rows = self.size.rows, cols = self.size.cols, "pty session started");
        Ok(())
    }

    /// Enqueues `data` for the writer pump.
    pub fn write_bytes(&self, data: Vec<u8>) -> Result<()> {
        let running = self.running.lock();
        let running = running
            .as_ref()
            .ok_or_else(|| KmuxError::InvalidOperation {
                status: format!("{:?}", self.status()),
                detail: "PTY session not running".into(),
            })?;
        running
            .tx
            .send(data)
            .map_err(|_| io_err("pty writer pump has shut down".into()))
    }

    /// Idempotent. Cancels pumps, closes the master fd, kills the child if
    /// still alive, and fires the on-closed callback exactly once.
    pub fn stop(&self) {
        let mut status = self.status.lock();
        if *status == PtySessionStatus::Finished {
            return;
        }
        let was_not_started = *status == PtySessionStatus::NotStarted;
        *status = PtySessionStatus::Finished;
        drop(status);

        if let Some(mut running) = self.running.lock().take() {
            running.reader_task.abort();
            running.writer_task.abort();
            running.closer_task.abort();
            running.cleanup_task.abort();
            if let Err(e) = running.child.kill() {
                warn!(error = %e, "failed to kill pty child (may have already exited)");
            }
            // Dropping `running` here closes the master fd and the writer's
            // file handle, releasing the PTY.
        } else if !was_not_started {
            debug!("stop() called with no running handle; already torn down");
        }

        let mut fired = self.closed_fired.lock();
        if !*fired {
            *fired = true;
            (self.on_closed)();
        }
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let running = self.running.lock();
        if let Some(running) = running.as_ref() {
            running
                .master
                .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
                .map_err(|e| io_err(format!("resize failed: {e}")))?;
        }
        Ok(())
    }
}

/// The user's real `.zshrc`, if there is one: `$ZDOTDIR/.zshrc` if set, else
/// `$HOME/.zshrc`. The private init directory concatenates this with the
/// marker patch so the session keeps the user's aliases and prompt.
fn original_zshrc_path() -> Option<PathBuf> {
    let home = std::env::var("ZDOTDIR")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(PathBuf::from))
        .ok()?;
    let candidate = home.join(".zshrc");
    candidate.is_file().then_some(candidate)
}

fn write_patched_zshrc(dir: &std::path::Path, original: Option<&std::path::Path>) -> Result<()> {
    let mut content = match original {
        Some(path) => std::fs::read_to_string(path).unwrap_or_default(),
        None => String::new(),
    };
    content.push('\n');
    content.push_str(&build_zshrc_patch());
    content.push('\n');
    std::fs::write(dir.join(".zshrc"), content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patched_zshrc_keeps_original_content_and_appends_the_patch() {
        let original_dir = tempfile::tempdir().unwrap();
        let original_path = original_dir.path().join(".zshrc");
        std::fs::write(&original_path, "alias ll='ls -la'\n").unwrap();

        let target_dir = tempfile::tempdir().unwrap();
        write_patched_zshrc(target_dir.path(), Some(&original_path)).unwrap();

        let written = std::fs::read_to_string(target_dir.path().join(".zshrc")).unwrap();
        assert!(written.contains("alias ll='ls -la'"));
        assert!(written.contains("kmux_preexec"));
    }

    #[test]
    fn patched_zshrc_with_no_original_is_just_the_patch() {
        let target_dir = tempfile::tempdir().unwrap();
        write_patched_zshrc(target_dir.path(), None).unwrap();

        let written = std::fs::read_to_string(target_dir.path().join(".zshrc")).unwrap();
        assert!(written.contains("kmux_preexec"));
        assert!(!written.contains("alias ll"));
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| io_err(format!("fcntl(F_GETFL) failed: {e}")))?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| io_err(format!("fcntl(F_SETFL) failed: {e}")))?;
    Ok(())
}

fn io_err(msg: String) -> KmuxError {
    KmuxError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
}

fn is_eio(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EIO)
}

fn spawn_writer_pump(
    async_fd: Arc<AsyncFd<RawMasterFd>>,
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    child_exited: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: Option<Vec<u8>> = None;
        loop {
            let chunk = match pending.take() {
                Some(c) => c,
                None => match rx.recv().await {
                    Some(c) => c,
                    None => break,
                },
            };

            let mut offset = 0usize;
            let mut chunk = chunk;
            loop {
                let mut guard = match async_fd.writable().await {
                    Ok(g) => g,
                    Err(e) => {
                        error!(error = %e, "pty writable() failed");
                        return;
                    }
                };
                let result = guard.try_io(|_| writer.write(&chunk[offset..]));
                match result {
                    Ok(Ok(written)) => {
                        offset += written;
                        if offset >= chunk.len() {
                            break;
                        }
                    }
                    Ok(Err(e)) if is_eio(&e) => {
                        child_exited.notify_waiters();
                        return;
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "pty write failed");
                        return;
                    }
                    Err(_would_block) => continue,
                }
            }
            let _ = &mut chunk;
        }
    })
}

/// Small shim namespace so the reader-pump spawn call above reads cleanly;
/// not a real standard-library addition, just a local helper.
mod reader_pump {
    use super::*;

    pub fn spawn(
        async_fd: Arc<AsyncFd<RawMasterFd>>,
        mut reader: Box<dyn Read + Send>,
        on_output: OnOutput,
        child_exited: Arc<Notify>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let mut guard = match async_fd.readable().await {
                    Ok(g) => g,
                    Err(e) => {
                        error!(error = %e, "pty readable() failed");
                        return;
                    }
                };
                let result = guard.try_io(|_| reader.read(&mut buf));
                match result {
                    Ok(Ok(0)) => {
                        child_exited.notify_waiters();
                        return;
                    }
                    Ok(Ok(n)) => {
                        on_output(&buf[..n]);
                    }
                    Ok(Err(e)) if is_eio(&e) => {
                        child_exited.notify_waiters();
                        return;
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "pty read failed");
                        return;
                    }
                    Err(_would_block) => continue,
                }
            }
        })
    }
}

