//! Terminus Types - pure data types shared across the backend
//!
//! This crate contains only serde data types with no async runtime
//! dependencies: the WebSocket frame protocol, the session and file
//! models, and the stream close codes.

pub mod frame;
pub mod session;
pub mod user;

pub use frame::*;
pub use session::*;
pub use user::*;

/// WebSocket close codes used by the terminal stream.
pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Token invalid/expired or not authorized for the session.
    pub const AUTH_FAILED: u16 = 4001;
    /// Session id unknown in the repository.
    pub const SESSION_NOT_FOUND: u16 = 4002;
    /// Client too slow draining its outbound queue.
    pub const BACKPRESSURE: u16 = 4003;
    /// Heartbeat lost.
    pub const IDLE_TIMEOUT: u16 = 4004;
    /// Unclassified terminal failure.
    pub const INTERNAL_ERROR: u16 = 4009;
}

/// Wire error codes carried by `error` frames.
pub mod error_code {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
    pub const PATH_ERROR: &str = "PATH_ERROR";
    pub const WORKSPACE_ERROR: &str = "WORKSPACE_ERROR";
    pub const PTY_ERROR: &str = "PTY_ERROR";
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
    pub const EXECUTION_TIMEOUT: &str = "EXECUTION_TIMEOUT";
    pub const BACKPRESSURE: &str = "BACKPRESSURE";
    pub const IDLE_TIMEOUT: &str = "IDLE_TIMEOUT";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const BAD_FRAME: &str = "BAD_FRAME";
}
