//! Block-structured PTY session engine: slices a zsh PTY's byte stream into
//! semantic (command, output) blocks via sentinel markers, and hosts many
//! such sessions behind a numeric-id registry.

pub mod block_session;
pub mod error;
pub mod marker;
pub mod pty_session;
pub mod registry;
pub mod renderer;
pub mod shell;

pub use block_session::{BlockPtySession, CommandBlock, CommandResult, OpenTail};
pub use error::{KmuxError, Result};
pub use marker::{MarkerKind, SessionStatus};
pub use pty_session::{PtySession, PtySessionStatus};
pub use registry::{Registry, RegistryConfig};
pub use renderer::ScreenSize;
