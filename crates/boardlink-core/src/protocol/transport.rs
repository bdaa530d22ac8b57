//! Byte transports
//!
//! A session talks to the board through a [`ByteTransport`]: a half-duplex
//! byte stream with a non-blocking "how much is waiting" probe. Two variants
//! exist, a local serial port and a telnet-bridged remote serial port.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::debug;

use super::{serial, ProtocolError, POLL_INTERVAL};

/// Port the telnet bridge listens on
const TELNET_PORT: u16 = 23;

/// Deadline for establishing the TCP connection itself
const TELNET_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Settle delay between the password prompt and the reply; the bridge
/// switches echo off in between and drops input sent too early
const PASSWORD_SETTLE: Duration = Duration::from_millis(200);

/// Abstraction over the byte stream a session drives
///
/// `read` returns 0..n bytes without blocking past one poll cycle;
/// `bytes_to_read` reports what is immediately readable. Blocking-with-
/// deadline behavior is layered on top by [`super::framed`].
pub trait ByteTransport: Read + Write + Send {
    /// Number of bytes readable without blocking
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Discard anything currently buffered on the receive side
    fn clear_input_buffer(&mut self) -> io::Result<()>;
}

/// Local serial port transport
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Wrap an already-opened serial port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }

    /// Open and configure the serial device at `path`
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, ProtocolError> {
        Ok(Self::new(serial::open_port(path, baud_rate)?))
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            // The port carries a short timeout so polling reads return
            // promptly; an empty interval is not an error here.
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl ByteTransport for SerialTransport {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port
            .bytes_to_read()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Telnet option-negotiation filter
///
/// The bridge is treated as a plain byte stream, so option chatter must
/// never reach the protocol layer: every request is refused, subnegotiation
/// blocks are dropped, and a doubled IAC unescapes to a literal 0xFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelnetState {
    Data,
    Command,
    Negotiate(u8),
    Subnegotiation,
    SubnegotiationCommand,
}

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

struct TelnetFilter {
    state: TelnetState,
}

impl TelnetFilter {
    fn new() -> Self {
        Self {
            state: TelnetState::Data,
        }
    }

    /// Feed one raw byte; payload bytes land in `out`, protocol replies
    /// (refusals) in `replies`.
    fn push(&mut self, byte: u8, out: &mut VecDeque<u8>, replies: &mut Vec<u8>) {
        match self.state {
            TelnetState::Data => {
                if byte == IAC {
                    self.state = TelnetState::Command;
                } else {
                    out.push_back(byte);
                }
            }
            TelnetState::Command => match byte {
                IAC => {
                    out.push_back(IAC);
                    self.state = TelnetState::Data;
                }
                DO | DONT | WILL | WONT => {
                    self.state = TelnetState::Negotiate(byte);
                }
                SB => {
                    self.state = TelnetState::Subnegotiation;
                }
                _ => {
                    self.state = TelnetState::Data;
                }
            },
            TelnetState::Negotiate(verb) => {
                match verb {
                    DO => replies.extend_from_slice(&[IAC, WONT, byte]),
                    WILL => replies.extend_from_slice(&[IAC, DONT, byte]),
                    _ => {}
                }
                self.state = TelnetState::Data;
            }
            TelnetState::Subnegotiation => {
                if byte == IAC {
                    self.state = TelnetState::SubnegotiationCommand;
                }
            }
            TelnetState::SubnegotiationCommand => {
                self.state = if byte == SE {
                    TelnetState::Data
                } else {
                    TelnetState::Subnegotiation
                };
            }
        }
    }
}

/// Telnet-bridged remote serial transport
///
/// Bytes are pulled opportunistically from the network into a FIFO so that
/// `read`/`bytes_to_read` never block on the network longer than one poll
/// cycle.
pub struct TelnetTransport {
    stream: TcpStream,
    fifo: VecDeque<u8>,
    filter: TelnetFilter,
}

impl TelnetTransport {
    /// Connect to the bridge at `host` (optionally `host:port`) and
    /// complete the login handshake.
    ///
    /// Fails with [`ProtocolError::ConnectionFailed`] if the connection
    /// cannot be established or any login prompt does not arrive within
    /// `read_timeout`.
    pub fn connect(
        host: &str,
        user: &str,
        password: &str,
        read_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let (name, port) = match host.rsplit_once(':') {
            Some((name, port)) => (
                name,
                port.parse::<u16>().map_err(|_| {
                    ProtocolError::ConnectionFailed(format!("{host}: bad port"))
                })?,
            ),
            None => (host, TELNET_PORT),
        };
        let addr = (name, port)
            .to_socket_addrs()
            .map_err(|e| ProtocolError::ConnectionFailed(format!("{host}: {e}")))?
            .next()
            .ok_or_else(|| {
                ProtocolError::ConnectionFailed(format!("{host}: no address found"))
            })?;
        let stream = TcpStream::connect_timeout(&addr, TELNET_CONNECT_TIMEOUT)
            .map_err(|e| ProtocolError::ConnectionFailed(format!("{host}: {e}")))?;
        stream
            .set_nonblocking(true)
            .map_err(ProtocolError::Io)?;

        let mut transport = Self {
            stream,
            fifo: VecDeque::new(),
            filter: TelnetFilter::new(),
        };

        transport.expect(b"Login as:", read_timeout)?;
        transport.send_line(user)?;
        transport.expect(b"Password:", read_timeout)?;
        thread::sleep(PASSWORD_SETTLE);
        transport.send_line(password)?;
        transport.expect(b"Type \"help()\" for more information.", read_timeout)?;
        debug!("telnet login to {host} complete");

        Ok(transport)
    }

    fn send_line(&mut self, text: &str) -> Result<(), ProtocolError> {
        self.write_all(text.as_bytes())?;
        self.write_all(b"\r\n")?;
        Ok(())
    }

    /// Pull whatever the network has ready through the option filter into
    /// the FIFO. Returns the number of payload bytes added.
    fn fill(&mut self) -> io::Result<usize> {
        let mut added = 0;
        let mut replies = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let before = self.fifo.len();
                    for &byte in &buf[..n] {
                        self.filter.push(byte, &mut self.fifo, &mut replies);
                    }
                    added += self.fifo.len() - before;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if !replies.is_empty() {
            // Option refusals are best-effort; a full socket buffer just
            // means the server re-asks later.
            match self.stream.write(&replies) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    /// Wait until `pattern` has been received, consuming the FIFO through
    /// the end of the match. Bytes after the match stay queued.
    fn expect(&mut self, pattern: &[u8], timeout: Duration) -> Result<(), ProtocolError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.fill()?;
            let seen = self.fifo.make_contiguous();
            if let Some(pos) = find_subsequence(seen, pattern) {
                self.fifo.drain(..pos + pattern.len());
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProtocolError::ConnectionFailed(format!(
                    "login prompt {:?} never arrived",
                    String::from_utf8_lossy(pattern)
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Read for TelnetTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fifo.is_empty() {
            self.fill()?;
        }
        let mut n = 0;
        while n < buf.len() {
            match self.fifo.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for TelnetTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Telnet reserves 0xFF; literal occurrences go out doubled.
        let mut escaped = Vec::with_capacity(buf.len());
        for &byte in buf {
            escaped.push(byte);
            if byte == IAC {
                escaped.push(IAC);
            }
        }
        let mut off = 0;
        while off < escaped.len() {
            match self.stream.write(&escaped[off..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl ByteTransport for TelnetTransport {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        if self.fifo.is_empty() {
            self.fill()?;
        }
        Ok(self.fifo.len() as u32)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.fill()?;
        self.fifo.clear();
        Ok(())
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
