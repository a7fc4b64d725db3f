//! Owns every `BlockPtySession` behind a numeric id, serialises mutation of
//! the id→session map, and runs the background reaper that retires sessions
//! once their PTY has finished.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::block_session::{BlockPtySession, CommandResult};
use crate::error::{KmuxError, Result};
use crate::renderer::ScreenSize;

/// Registry-wide configuration, independent of any one session.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub session_startup_timeout: Duration,
    pub general_tool_call_timeout: Duration,
    pub screen_size: ScreenSize,
    pub root_password: Option<String>,
    pub zsh_override: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session_startup_timeout: Duration::from_secs(10),
            general_tool_call_timeout: Duration::from_secs(5),
            screen_size: ScreenSize::default(),
            root_password: None,
            zsh_override: None,
        }
    }
}

struct SessionItem {
    session: Arc<BlockPtySession>,
    label: SyncMutex<String>,
    description: SyncMutex<String>,
    pending_deletion: SyncMutex<bool>,
    initialized: SyncMutex<bool>,
}

pub struct Registry {
    config: RegistryConfig,
    sessions: RwLock<HashMap<u64, SessionItem>>,
    next_id: SyncMutex<u64>,
    reaper_tx: mpsc::UnboundedSender<u64>,
    reaper_rx: SyncMutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            next_id: SyncMutex::new(0),
            reaper_tx,
            reaper_rx: SyncMutex::new(Some(reaper_rx)),
        })
    }

    /// Starts the background reaper. Call once, after construction; the
    /// returned handle is cancelled cooperatively by dropping it or on
    /// process shutdown.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut rx = registry
            .reaper_rx
            .lock()
            .take()
            .expect("spawn_reaper called more than once");
        tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                let mut sessions = registry.sessions.write().await;
                if let Some(item) = sessions.get(&id) {
                    if !item.session.is_finished() {
                        warn!(id, "reaper saw a non-finished session on the stopped queue; force-stopping");
                        item.session.stop();
                    }
                }
                sessions.remove(&id);
                debug!(id, "session reaped");
            }
        })
    }

    fn alloc_id(&self) -> u64 {
        let mut next = self.next_id.lock();
        let id = *next;
        *next += 1;
        id
    }

    /// Allocates an id, constructs the session, and starts it in the
    /// background. Returns once startup finishes or the startup timeout
    /// elapses, whichever comes first; on timeout the session stays in the
    /// registry with `initialized = false` and keeps starting up.
    pub async fn create_session(self: &Arc<Self>) -> Result<u64> {
        let id = self.alloc_id();
        let session = BlockPtySession::new(
            self.config.screen_size,
            self.config.zsh_override.clone(),
            self.config.root_password.clone(),
        );

        self.sessions.write().await.insert(
            id,
            SessionItem {
                session: Arc::clone(&session),
                label: SyncMutex::new(format!("session-{id}")),
                description: SyncMutex::new(String::new()),
                pending_deletion: SyncMutex::new(false),
                initialized: SyncMutex::new(false),
            },
        );

        let reaper_tx = self.reaper_tx.clone();
        let watch_session = Arc::clone(&session);
        tokio::spawn(async move {
            watch_session.wait_finished().await;
            let _ = reaper_tx.send(id);
        });

        let registry = Arc::clone(self);
        let start_session = Arc::clone(&session);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let result = start_session.start().await;
            if result.is_ok() {
                let sessions = registry.sessions.read().await;
                if let Some(item) = sessions.get(&id) {
                    *item.initialized.lock() = true;
                }
            }
            let _ = done_tx.send(result);
        });

        match tokio::time::timeout(self.config.session_startup_timeout, done_rx).await {
            Ok(Ok(Ok(()))) => info!(id, "session started"),
            Ok(Ok(Err(e))) => {
                warn!(id, error = %e, "session failed to start");
                return Err(e);
            }
            Ok(Err(_recv_dropped)) => {}
            Err(_elapsed) => {
                warn!(id, "session startup timed out; initialisation continues in the background");
            }
        }

        Ok(id)
    }

    async fn get_session(&self, id: u64) -> Result<Arc<BlockPtySession>> {
        let sessions = self.sessions.read().await;
        let item = sessions.get(&id).ok_or_else(|| KmuxError::SessionNotFound(id.to_string()))?;
        if *item.pending_deletion.lock() {
            return Err(KmuxError::SessionNotFound(id.to_string()));
        }
        Ok(Arc::clone(&item.session))
    }

    async fn with_timeout<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.general_tool_call_timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!("tool call timed out; underlying state unknown");
                Err(KmuxError::ToolCallTimeout {
                    timeout_seconds: self.config.general_tool_call_timeout.as_secs_f64(),
                })
            }
        }
    }

    pub async fn list_sessions(&self) -> String {
        let sessions = self.sessions.read().await;
        let mut lines = Vec::new();
        for (id, item) in sessions.iter() {
            if *item.pending_deletion.lock() {
                continue;
            }
            if !*item.initialized.lock() {
                lines.push(format!("Session {id} ({}): initialising.", item.label.lock()));
                continue;
            }
            let running = match item.session.get_current_running_command() {
                Some(parts) => format!("running: {}", parts.join(" ")),
                None => "idle".to_string(),
            };
            let description = item.description.lock();
            lines.push(format!("Session {id} ({}): {description} - {running}", item.label.lock()));
        }
        if lines.is_empty() {
            "No sessions.".to_string()
        } else {
            lines.join("\n")
        }
    }

    pub async fn update_session_label(&self, id: u64, label: String) -> Result<()> {
        let sessions = self.sessions.read().await;
        let item = sessions.get(&id).ok_or_else(|| KmuxError::SessionNotFound(id.to_string()))?;
        *item.label.lock() = label;
        Ok(())
    }

    pub async fn update_session_description(&self, id: u64, description: String) -> Result<()> {
        let sessions = self.sessions.read().await;
        let item = sessions.get(&id).ok_or_else(|| KmuxError::SessionNotFound(id.to_string()))?;
        *item.description.lock() = description;
        Ok(())
    }

    /// Forwards to the session under an outer deadline one second past the
    /// command's own timeout, per the original `TerminalServerConfig`.
    pub async fn execute_command(&self, id: u64, text: &str, timeout: Duration) -> Result<String> {
        let session = self.get_session(id).await?;
        let outer_timeout = timeout + Duration::from_secs(1);

        match tokio::time::timeout(outer_timeout, session.submit_command(text, timeout)).await {
            Ok(Ok(CommandResult::Finished { output, duration, .. })) => Ok(format!(
                "Command finished in {:.2} seconds with the following output:\n<command-output>\n{output}\n</command-output>",
                duration.as_secs_f64()
            )),
            Ok(Ok(CommandResult::Incomplete { combined_command })) => Ok(format!(
                "Command \"{combined_command}\" was accepted but the shell is waiting for more input (e.g. an unclosed quote or block); it has not executed yet."
            )),
            Ok(Ok(CommandResult::Timeout { partial_output, combined_command, timeout })) => Ok(format!(
                "Command \"{combined_command}\" did not finish within {:.2} seconds and may still be running or awaiting input.\n\
                 <command-output>\n{partial_output}\n</command-output>\n\
                 Use snapshot to check its current state, send_keys to interact with it, or enter_root_password if it is waiting on a sudo prompt.",
                timeout.as_secs_f64()
            )),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                warn!(id, "execute_command tool call timed out; underlying state unknown");
                Err(KmuxError::ToolCallTimeout { timeout_seconds: outer_timeout.as_secs_f64() })
            }
        }
    }

    pub async fn snapshot(&self, id: u64, include_all: bool) -> Result<String> {
        let session = self.get_session(id).await?;
        let body = self.with_timeout(async { Ok(session.snapshot(include_all)) }).await?;
        let scope = if include_all { "the entire session buffer" } else { "the last command's window" };
        Ok(format!("Snapshot covering {scope}:\n<snapshot>\n{body}\n</snapshot>"))
    }

    pub async fn send_keys(&self, id: u64, keys: &[u8]) -> Result<()> {
        let session = self.get_session(id).await?;
        self.with_timeout(session.send_keys(keys)).await
    }

    pub async fn enter_root_password(&self, id: u64) -> Result<()> {
        let session = self.get_session(id).await?;
        self.with_timeout(session.enter_root_password()).await
    }

    /// Flags the item pending-deletion and stops its session; the reaper
    /// removes it from the map once it observes the finished transition.
    pub async fn delete_session(&self, id: u64) -> Result<String> {
        let sessions = self.sessions.write().await;
        let item = sessions.get(&id).ok_or_else(|| KmuxError::SessionNotFound(id.to_string()))?;
        *item.pending_deletion.lock() = true;
        item.session.stop();
        Ok(format!("Session {id} deleted."))
    }

    /// Stops every session. Does not wait for the reaper to drain them.
    pub async fn stop(&self) {
        let sessions = self.sessions.read().await;
        for item in sessions.values() {
            item.session.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_item(id: u64, initialized: bool) -> SessionItem {
        SessionItem {
            session: BlockPtySession::new(ScreenSize::default(), None, None),
            label: SyncMutex::new(format!("session-{id}")),
            description: SyncMutex::new(String::new()),
            pending_deletion: SyncMutex::new(false),
            initialized: SyncMutex::new(initialized),
        }
    }

    #[tokio::test]
    async fn unknown_id_is_session_not_found() {
        let registry = Registry::new(RegistryConfig::default());
        let err = registry.update_session_label(42, "x".into()).await.unwrap_err();
        assert!(matches!(err, KmuxError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn list_sessions_reports_initialising_placeholder() {
        let registry = Registry::new(RegistryConfig::default());
        registry.sessions.write().await.insert(0, bare_item(0, false));

        let listing = registry.list_sessions().await;
        assert!(listing.contains("initialising"));
    }

    #[tokio::test]
    async fn list_sessions_reflects_label_and_description_updates() {
        let registry = Registry::new(RegistryConfig::default());
        registry.sessions.write().await.insert(0, bare_item(0, true));

        registry.update_session_label(0, "build-shell".into()).await.unwrap();
        registry.update_session_description(0, "runs the build".into()).await.unwrap();

        let listing = registry.list_sessions().await;
        assert!(listing.contains("build-shell"));
        assert!(listing.contains("runs the build"));
        assert!(listing.contains("idle"));
    }

    #[tokio::test]
    async fn deleted_session_is_excluded_from_listing_and_lookups() {
        let registry = Registry::new(RegistryConfig::default());
        registry.sessions.write().await.insert(0, bare_item(0, true));

        let message = registry.delete_session(0).await.unwrap();
        assert!(message.contains('0'));

        assert!(!registry.list_sessions().await.contains("session-0"));
        let err = registry.update_session_label(0, "x".into()).await;
        assert!(err.is_ok(), "label updates bypass the pending-deletion check by id presence, not by session usability");

        let snap_err = registry.snapshot(0, false).await.unwrap_err();
        assert!(matches!(snap_err, KmuxError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn empty_registry_lists_as_no_sessions() {
        let registry = Registry::new(RegistryConfig::default());
        assert_eq!(registry.list_sessions().await, "No sessions.");
    }
}
