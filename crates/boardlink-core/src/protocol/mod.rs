//! Raw-REPL protocol communication
//!
//! Implements the raw-REPL execution protocol spoken by MicroPython-compatible
//! boards over a serial or telnet byte stream.
//!
//! The interactive ("friendly") console is driven into a scriptable raw mode,
//! command buffers are submitted in bounded chunks, and the two
//! EOT-delimited output segments (stdout, then stderr) are read back.

mod driver;
mod error;
pub mod framed;
pub mod lock;
pub mod serial;
mod session;
pub mod transport;

pub use driver::run;
pub use error::ProtocolError;
pub use lock::DeviceLock;
pub use serial::{list_ports, open_port, open_with_wait, PortInfo};
pub use session::{Session, SessionConfig, SessionState};
pub use transport::{ByteTransport, SerialTransport, TelnetTransport};

use std::time::Duration;

/// Default baud rate for serial boards
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default deadline for a single framed read, in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;

/// Granularity of the blocking poll loops
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Interrupt any running program (CR + two Ctrl-C)
pub const INTERRUPT: &[u8] = b"\r\x03\x03";

/// Switch the console into raw mode (CR + Ctrl-A)
pub const ENTER_RAW: &[u8] = b"\r\x01";

/// Switch the console back to the friendly prompt (CR + Ctrl-B)
pub const EXIT_RAW: &[u8] = b"\r\x02";

/// Soft-reset the board; the same control byte terminates a submitted
/// command and delimits the returned output segments (Ctrl-D / EOT)
pub const EOT: &[u8] = b"\x04";

/// Banner confirming raw mode, followed by its `>` ready prompt
pub const RAW_BANNER_PROMPT: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";

/// Banner confirming raw mode (printed again after a soft reset)
pub const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n";

/// Banner confirming a soft reset was accepted
pub const SOFT_REBOOT_BANNER: &[u8] = b"soft reboot\r\n";

/// Two-byte acknowledgement of an accepted command buffer
pub const EXEC_ACK: &[u8] = b"OK";

/// Largest burst written to the device in one go; the board-side input
/// buffer is small and an unbounded write would overflow it
pub const WRITE_CHUNK: usize = 256;

/// Pause between command chunks so the board can drain its input buffer
pub const WRITE_CHUNK_DELAY: Duration = Duration::from_millis(10);
