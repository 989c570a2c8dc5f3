//! Terminus Core - the interactive terminal and code-execution subsystem
//!
//! Components, leaves first: the workspace manager mirrors the file
//! repository onto disk, the PTY supervisor owns one shell per live
//! session, the execution engine runs snippets to completion, and the
//! session registry indexes live sessions with single-writer lifecycle
//! discipline. The stream broker in the server crate multiplexes all of
//! them onto client connections.

pub mod config;
pub mod error;
pub mod exec;
pub mod pty;
pub mod registry;
pub mod store;
pub mod workspace;

pub use config::Config;
pub use error::{Error, Result};
pub use exec::{ExecutionEngine, ExecutionJob};
pub use pty::{PtyRead, PtyReader, PtySession, PtyState, PtySupervisor};
pub use registry::{LiveSession, SessionRegistry};
pub use store::{FileStore, MemoryStore, SessionStore};
pub use workspace::WorkspaceManager;
