//! # Boardlink Core Library
//!
//! Core functionality for running scripts on MicroPython-compatible boards.

#![warn(missing_docs)]

//!
//! This library provides:
//! - A byte-transport abstraction over local serial ports and telnet bridges
//! - Advisory device locking across driver processes
//! - The raw-REPL protocol state machine (banner handshakes, chunked command
//!   submission, stdout/stderr capture)
//! - An execution driver that runs payload queues and streams device output
//!
//! ## Example
//!
//! ```rust,ignore
//! use boardlink_core::protocol::{Session, SessionConfig};
//!
//! let mut session = Session::open(SessionConfig {
//!     device: "/dev/ttyACM0".into(),
//!     ..Default::default()
//! })?;
//! session.enter_raw_repl()?;
//! let output = session.exec(b"print(1 + 1)")?;
//! session.exit_raw_repl()?;
//! session.close();
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        run, list_ports, ProtocolError, Session, SessionConfig, SessionState,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
