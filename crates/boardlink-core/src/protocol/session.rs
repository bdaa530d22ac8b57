//! Session management
//!
//! Owns the transport and the device lock, and drives the board's console
//! through the raw-REPL protocol: interrupt, raw-mode entry with a forced
//! soft reset, chunked command submission, and capture of the two
//! EOT-delimited output segments.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    framed, serial, ByteTransport, DeviceLock, ProtocolError, SerialTransport,
    TelnetTransport, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS, ENTER_RAW, EOT, EXEC_ACK,
    EXIT_RAW, INTERRUPT, RAW_BANNER, RAW_BANNER_PROMPT, SOFT_REBOOT_BANNER,
    WRITE_CHUNK, WRITE_CHUNK_DELAY,
};

/// Protocol state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No transport attached
    Closed,
    /// Connected; the board is at its interactive prompt
    FriendlyMode,
    /// Raw-mode entry handshake in progress
    EnteringRaw,
    /// Raw mode confirmed; ready to accept a command buffer
    RawMode,
    /// A submitted command is running on the board
    Executing,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Serial device path, or the IP address of a telnet-bridged board
    pub device: String,
    /// Baud rate for serial devices
    pub baud_rate: u32,
    /// Telnet login username
    pub user: String,
    /// Telnet login password
    pub password: String,
    /// Seconds to wait for a serial device to enumerate
    pub wait_seconds: u32,
    /// Deadline for a single framed read, in milliseconds
    pub read_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyACM0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            user: "micro".to_string(),
            password: "python".to_string(),
            wait_seconds: 0,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

/// A dotted-quad device string selects the telnet bridge
fn looks_like_ip(device: &str) -> bool {
    let bytes = device.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            first.is_ascii_digit()
                && last.is_ascii_digit()
                && device.chars().filter(|&c| c == '.').count() == 3
        }
        _ => false,
    }
}

/// One open connection to a board
pub struct Session {
    transport: Option<Box<dyn ByteTransport>>,
    lock: Option<DeviceLock>,
    state: SessionState,
    config: SessionConfig,
}

impl Session {
    /// Open a session to the device named in `config`.
    ///
    /// Serial devices are locked before the port is opened (pid file first,
    /// then the kernel layer once the node exists); the lock is released on
    /// every failure path. Telnet-bridged boards are remote and take no
    /// local lock.
    pub fn open(config: SessionConfig) -> Result<Self, ProtocolError> {
        if looks_like_ip(&config.device) {
            let transport = TelnetTransport::connect(
                &config.device,
                &config.user,
                &config.password,
                Duration::from_millis(config.read_timeout_ms),
            )?;
            debug!("opened telnet session to {}", config.device);
            return Ok(Self {
                transport: Some(Box::new(transport)),
                lock: None,
                state: SessionState::FriendlyMode,
                config,
            });
        }

        let mut lock = DeviceLock::new(&config.device);
        lock.lock()?;
        // On failure below, dropping `lock` removes the pid file.
        let port = serial::open_with_wait(
            &config.device,
            config.baud_rate,
            config.wait_seconds,
        )?;
        lock.lock_native(Path::new(&config.device))?;
        debug!("opened serial session to {}", config.device);

        // Discard whatever the console printed before we attached
        let mut transport = SerialTransport::new(port);
        transport.clear_input_buffer()?;

        Ok(Self {
            transport: Some(Box::new(transport)),
            lock: Some(lock),
            state: SessionState::FriendlyMode,
            config,
        })
    }

    /// Build a session over an already-open transport (no device lock).
    /// Useful for custom transports and test harnesses.
    pub fn with_transport(transport: Box<dyn ByteTransport>, config: SessionConfig) -> Self {
        Self {
            transport: Some(transport),
            lock: None,
            state: SessionState::FriendlyMode,
            config,
        }
    }

    /// Current protocol state
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.config.read_timeout_ms)
    }

    fn transport(&mut self) -> Result<&mut dyn ByteTransport, ProtocolError> {
        match self.transport.as_deref_mut() {
            Some(t) => Ok(t),
            None => Err(ProtocolError::NotConnected),
        }
    }

    /// Drive the console from the interactive prompt into raw mode.
    ///
    /// Interrupts any running program, drains buffered input, enters raw
    /// mode, then forces a soft reset so execution starts from a known
    /// state. The raw-mode banner is expected twice, around the reset;
    /// splitting the reads lets board boot output surface in between
    /// instead of being swallowed.
    pub fn enter_raw_repl(&mut self) -> Result<(), ProtocolError> {
        let timeout = self.read_timeout();
        if self.transport.is_none() {
            return Err(ProtocolError::NotConnected);
        }
        self.state = SessionState::EnteringRaw;
        debug!("entering raw REPL");

        let transport = self.transport()?;
        transport.write_all(INTERRUPT)?;

        // Drop anything the interrupted program had queued
        loop {
            let waiting = transport.bytes_to_read()?;
            if waiting == 0 {
                break;
            }
            let mut scratch = vec![0u8; waiting as usize];
            transport.read(&mut scratch)?;
        }

        transport.write_all(ENTER_RAW)?;
        let data = framed::read_until(transport, 1, RAW_BANNER_PROMPT, Some(timeout), None)?;
        if !data.ends_with(RAW_BANNER_PROMPT) {
            self.state = SessionState::FriendlyMode;
            return Err(ProtocolError::UnexpectedResponse {
                expected: "raw REPL banner",
                received: data,
            });
        }

        let transport = self.transport()?;
        transport.write_all(EOT)?;
        let data = framed::read_until(transport, 1, SOFT_REBOOT_BANNER, Some(timeout), None)?;
        if !data.ends_with(SOFT_REBOOT_BANNER) {
            self.state = SessionState::FriendlyMode;
            return Err(ProtocolError::UnexpectedResponse {
                expected: "soft reboot banner",
                received: data,
            });
        }

        let transport = self.transport()?;
        let data = framed::read_until(transport, 1, RAW_BANNER, Some(timeout), None)?;
        if !data.ends_with(RAW_BANNER) {
            self.state = SessionState::FriendlyMode;
            return Err(ProtocolError::UnexpectedResponse {
                expected: "raw REPL banner after reset",
                received: data,
            });
        }

        self.state = SessionState::RawMode;
        Ok(())
    }

    /// Drop the console back to the interactive prompt. The transition is
    /// not acknowledged by the board, so nothing is read back.
    pub fn exit_raw_repl(&mut self) -> Result<(), ProtocolError> {
        let transport = self.transport()?;
        transport.write_all(EXIT_RAW)?;
        self.state = SessionState::FriendlyMode;
        Ok(())
    }

    /// Submit a command buffer without waiting for its output.
    ///
    /// Requires raw mode. The buffer goes out in bounded chunks with a
    /// short pause in between; the board's input buffer is small and an
    /// unbounded burst would overflow it. A 2-byte acknowledgement confirms
    /// the board accepted the buffer; anything else (for instance a
    /// syntactically incomplete program) is a protocol error.
    pub fn exec_raw_no_follow(&mut self, command: &[u8]) -> Result<(), ProtocolError> {
        if self.state != SessionState::RawMode {
            return Err(ProtocolError::NotInRawRepl);
        }
        let timeout = self.read_timeout();
        let transport = self.transport()?;

        let data = framed::read_until(transport, 1, b">", Some(timeout), None)?;
        if !data.ends_with(b">") {
            return Err(ProtocolError::UnexpectedResponse {
                expected: "raw REPL ready prompt",
                received: data,
            });
        }

        debug!("submitting {} byte command", command.len());
        let transport = self.transport()?;
        for chunk in command.chunks(WRITE_CHUNK) {
            transport.write_all(chunk)?;
            thread::sleep(WRITE_CHUNK_DELAY);
        }
        transport.write_all(EOT)?;

        let ack = framed::read_exact_timeout(transport, EXEC_ACK.len(), Some(timeout))?;
        if ack != EXEC_ACK {
            return Err(ProtocolError::UnexpectedResponse {
                expected: "command acknowledgement",
                received: ack,
            });
        }

        self.state = SessionState::Executing;
        Ok(())
    }

    /// Collect the output of the running command.
    ///
    /// Standard output is everything up to the first EOT delimiter, routed
    /// byte-for-byte through `on_chunk` as it arrives; standard error is
    /// the second segment. `timeout` bounds the idle wait for each
    /// delimiter; `None` waits indefinitely (interactive follow).
    pub fn follow(
        &mut self,
        timeout: Option<Duration>,
        on_chunk: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<(Vec<u8>, Vec<u8>), ProtocolError> {
        let transport = self.transport()?;

        let mut data = framed::read_until(transport, 1, EOT, timeout, on_chunk)?;
        if !data.ends_with(EOT) {
            return Err(ProtocolError::Timeout {
                waiting_for: "first end-of-transmission delimiter",
            });
        }
        data.truncate(data.len() - EOT.len());

        let transport = self.transport()?;
        let mut data_err = framed::read_until(transport, 1, EOT, timeout, None)?;
        if !data_err.ends_with(EOT) {
            return Err(ProtocolError::Timeout {
                waiting_for: "second end-of-transmission delimiter",
            });
        }
        data_err.truncate(data_err.len() - EOT.len());

        if self.state == SessionState::Executing {
            self.state = SessionState::RawMode;
        }
        Ok((data, data_err))
    }

    /// Submit a command and collect its output
    pub fn exec_raw(
        &mut self,
        command: &[u8],
        timeout: Option<Duration>,
        on_chunk: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<(Vec<u8>, Vec<u8>), ProtocolError> {
        self.exec_raw_no_follow(command)?;
        self.follow(timeout, on_chunk)
    }

    /// Execute a command, treating any device-side error output as a fault
    pub fn exec(&mut self, command: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let timeout = self.read_timeout();
        let (output, error_output) = self.exec_raw(command, Some(timeout), None)?;
        if !error_output.is_empty() {
            return Err(ProtocolError::ExecutionFault {
                stdout: output,
                stderr: error_output,
            });
        }
        Ok(output)
    }

    /// Evaluate an expression on the board and return its printed value
    pub fn eval(&mut self, expression: &str) -> Result<Vec<u8>, ProtocolError> {
        let output = self.exec(format!("print({expression})").as_bytes())?;
        Ok(output.trim_ascii().to_vec())
    }

    /// Execute the contents of a local file on the board
    pub fn exec_file(&mut self, path: &Path) -> Result<Vec<u8>, ProtocolError> {
        let program = fs::read(path)?;
        self.exec(&program)
    }

    /// Release the device lock and the transport, regardless of state.
    /// Always succeeds and may be called repeatedly.
    pub fn close(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            lock.unlock();
        }
        self.transport = None;
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::{self, Read, Write};

    struct NullTransport;

    impl Read for NullTransport {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for NullTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ByteTransport for NullTransport {
        fn bytes_to_read(&mut self) -> io::Result<u32> {
            Ok(0)
        }

        fn clear_input_buffer(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.user, "micro");
        assert_eq!(config.password, "python");
        assert_eq!(config.wait_seconds, 0);
    }

    #[test]
    fn test_looks_like_ip() {
        assert!(looks_like_ip("192.168.1.1"));
        assert!(looks_like_ip("10.0.0.2"));
        assert!(!looks_like_ip("/dev/ttyACM0"));
        assert!(!looks_like_ip("COM3"));
        assert!(!looks_like_ip("1.2.3.4.5.")); // trailing dot, wrong count
        assert!(!looks_like_ip(""));
    }

    #[test]
    fn test_exec_requires_raw_mode() {
        let mut session =
            Session::with_transport(Box::new(NullTransport), SessionConfig::default());
        assert_eq!(session.state(), SessionState::FriendlyMode);
        match session.exec_raw_no_follow(b"print(1)") {
            Err(ProtocolError::NotInRawRepl) => {}
            other => panic!("expected NotInRawRepl, got {other:?}"),
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut session =
            Session::with_transport(Box::new(NullTransport), SessionConfig::default());
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        session.close();
        assert!(matches!(
            session.enter_raw_repl(),
            Err(ProtocolError::NotConnected)
        ));
    }
}
