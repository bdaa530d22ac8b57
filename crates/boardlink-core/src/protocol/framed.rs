//! Framed reads
//!
//! Deadline-bounded "read until delimiter" primitives layered on a
//! [`ByteTransport`]. Suspension happens only here (and in the chunked-write
//! delay): the poll loop sleeps in ~10 ms steps instead of relying on an
//! event-driven wakeup.

use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

use super::{ByteTransport, ProtocolError, POLL_INTERVAL};

/// Accumulate bytes until the buffer ends with `delimiter` or the transport
/// stays idle for `timeout`.
///
/// `min_bytes` bounds the first blocking read so a very short delimiter is
/// not matched before anything has arrived. Each received fragment is passed
/// to `on_chunk` as it arrives, enabling incremental consumption. The idle
/// clock restarts whenever a byte is received; `timeout = None` waits
/// indefinitely.
///
/// The accumulated buffer is returned in both outcomes; the caller
/// distinguishes success from timeout by checking the suffix. Once past the
/// minimum, bytes are pulled one at a time so a delimiter is recognized the
/// instant it arrives and framing never overshoots.
pub fn read_until(
    transport: &mut dyn ByteTransport,
    min_bytes: usize,
    delimiter: &[u8],
    timeout: Option<Duration>,
    mut on_chunk: Option<&mut dyn FnMut(&[u8])>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut data = Vec::new();
    let mut idle_since = Instant::now();

    // Initial bounded read
    while data.len() < min_bytes {
        let waiting = transport.bytes_to_read()?;
        if waiting > 0 {
            let want = (min_bytes - data.len()).min(waiting as usize);
            let mut buf = vec![0u8; want];
            let n = transport.read(&mut buf)?;
            if n > 0 {
                if let Some(consumer) = on_chunk.as_deref_mut() {
                    consumer(&buf[..n]);
                }
                data.extend_from_slice(&buf[..n]);
                idle_since = Instant::now();
                continue;
            }
        }
        if timed_out(idle_since, timeout) {
            return Ok(data);
        }
        thread::sleep(POLL_INTERVAL);
    }

    loop {
        if data.ends_with(delimiter) {
            return Ok(data);
        }
        if transport.bytes_to_read()? > 0 {
            let mut byte = [0u8; 1];
            let n = transport.read(&mut byte)?;
            if n > 0 {
                if let Some(consumer) = on_chunk.as_deref_mut() {
                    consumer(&byte);
                }
                data.push(byte[0]);
                idle_since = Instant::now();
                continue;
            }
        }
        if timed_out(idle_since, timeout) {
            return Ok(data);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Read exactly `count` bytes, or fewer if the transport stays idle for
/// `timeout`. Used for the fixed-size command acknowledgement.
pub fn read_exact_timeout(
    transport: &mut dyn ByteTransport,
    count: usize,
    timeout: Option<Duration>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut data = Vec::with_capacity(count);
    let mut idle_since = Instant::now();

    while data.len() < count {
        if transport.bytes_to_read()? > 0 {
            let mut buf = vec![0u8; count - data.len()];
            let n = transport.read(&mut buf)?;
            if n > 0 {
                data.extend_from_slice(&buf[..n]);
                idle_since = Instant::now();
                continue;
            }
        }
        if timed_out(idle_since, timeout) {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    Ok(data)
}

fn timed_out(idle_since: Instant, timeout: Option<Duration>) -> bool {
    match timeout {
        Some(limit) => idle_since.elapsed() >= limit,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ByteTransport;
    use pretty_assertions::assert_eq;
    use std::io::{self, Read, Write};

    /// Transport yielding a fixed byte sequence, then nothing
    struct CannedTransport {
        incoming: Vec<u8>,
        pos: usize,
    }

    impl CannedTransport {
        fn new(incoming: &[u8]) -> Self {
            Self {
                incoming: incoming.to_vec(),
                pos: 0,
            }
        }
    }

    impl Read for CannedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let available = self.incoming.len() - self.pos;
            let n = buf.len().min(available);
            buf[..n].copy_from_slice(&self.incoming[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for CannedTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ByteTransport for CannedTransport {
        fn bytes_to_read(&mut self) -> io::Result<u32> {
            Ok((self.incoming.len() - self.pos) as u32)
        }

        fn clear_input_buffer(&mut self) -> io::Result<()> {
            self.pos = self.incoming.len();
            Ok(())
        }
    }

    #[test]
    fn test_read_until_stops_at_delimiter() {
        let mut transport = CannedTransport::new(b"hello\x04world\x04");
        let data = read_until(&mut transport, 1, b"\x04", None, None).unwrap();
        assert_eq!(data, b"hello\x04".to_vec());

        // The second segment is still queued
        let rest = read_until(&mut transport, 1, b"\x04", None, None).unwrap();
        assert_eq!(rest, b"world\x04".to_vec());
    }

    #[test]
    fn test_read_until_streams_fragments() {
        let mut transport = CannedTransport::new(b"abc\x04");
        let mut seen = Vec::new();
        let mut consumer = |chunk: &[u8]| seen.extend_from_slice(chunk);
        let data =
            read_until(&mut transport, 1, b"\x04", None, Some(&mut consumer)).unwrap();
        assert_eq!(data, seen);
    }

    #[test]
    fn test_read_until_times_out_without_delimiter() {
        let mut transport = CannedTransport::new(b"partial");
        let start = std::time::Instant::now();
        let data = read_until(
            &mut transport,
            1,
            b"\x04",
            Some(Duration::from_millis(50)),
            None,
        )
        .unwrap();
        assert_eq!(data, b"partial".to_vec());
        assert!(!data.ends_with(b"\x04"));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_read_until_empty_transport_times_out_empty() {
        let mut transport = CannedTransport::new(b"");
        let data = read_until(
            &mut transport,
            1,
            b">",
            Some(Duration::from_millis(30)),
            None,
        )
        .unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_read_until_delimiter_longer_than_min() {
        let mut transport = CannedTransport::new(b"raw REPL; CTRL-B to exit\r\n>");
        let data = read_until(
            &mut transport,
            1,
            b"raw REPL; CTRL-B to exit\r\n>",
            Some(Duration::from_millis(100)),
            None,
        )
        .unwrap();
        assert_eq!(data, b"raw REPL; CTRL-B to exit\r\n>".to_vec());
    }

    #[test]
    fn test_read_exact_timeout_full() {
        let mut transport = CannedTransport::new(b"OKextra");
        let data = read_exact_timeout(&mut transport, 2, None).unwrap();
        assert_eq!(data, b"OK".to_vec());
    }

    #[test]
    fn test_read_exact_timeout_partial() {
        let mut transport = CannedTransport::new(b"O");
        let data =
            read_exact_timeout(&mut transport, 2, Some(Duration::from_millis(30))).unwrap();
        assert_eq!(data, b"O".to_vec());
    }
}
