//! Serial port handling
//!
//! Low-level serial access: device enumeration, opening, and the bounded
//! wait for a USB device that is still enumerating after plug-in or reset.

use std::thread;
use std::time::Duration;

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use tracing::{debug, info};

use super::ProtocolError;

/// Timeout on the port itself; kept short so polling reads return promptly
const PORT_TIMEOUT: Duration = Duration::from_millis(100);

/// Information about a candidate serial device
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb) => {
                (Some(usb.vid), Some(usb.pid), usb.product, usb.serial_number)
            }
            _ => (None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
            serial_number,
        }
    }
}

/// Sort key placing ttyACM* first (boards enumerate as CDC-ACM), then
/// ttyUSB*, then everything else, numerically within each group
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        return (0, rest.parse().unwrap_or(usize::MAX), basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        return (1, rest.parse().unwrap_or(usize::MAX), basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List candidate serial devices in deterministic order
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// Open the serial device at `path` and configure it for board traffic.
///
/// DTR and RTS are asserted after open: USB-CDC boards gate their transmit
/// side on DTR and stay silent until it is raised.
pub fn open_port(path: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let mut port = serialport::new(path, baud_rate)
        .timeout(PORT_TIMEOUT)
        .open()
        .map_err(|e| ProtocolError::ConnectionFailed(format!("{path}: {e}")))?;

    if let Err(e) = port.write_data_terminal_ready(true) {
        debug!("{path}: failed to assert DTR: {e}");
    }
    if let Err(e) = port.write_request_to_send(true) {
        debug!("{path}: failed to assert RTS: {e}");
    }

    Ok(port)
}

/// Open `path`, waiting up to `wait_seconds` for the device to enumerate.
///
/// One attempt when `wait_seconds` is zero; otherwise up to
/// `wait_seconds + 1` attempts spaced a second apart, with a single waiting
/// notice rather than one per attempt. Fails with
/// [`ProtocolError::DeviceNotFound`] only once all attempts are exhausted.
pub fn open_with_wait(
    path: &str,
    baud_rate: u32,
    wait_seconds: u32,
) -> Result<Box<dyn SerialPort>, ProtocolError> {
    retry_open(wait_seconds, path, || open_port(path, baud_rate))
}

fn retry_open<T>(
    wait_seconds: u32,
    path: &str,
    mut attempt: impl FnMut() -> Result<T, ProtocolError>,
) -> Result<T, ProtocolError> {
    let attempts = wait_seconds + 1;
    for n in 0..attempts {
        match attempt() {
            Ok(port) => return Ok(port),
            Err(e) => {
                if wait_seconds == 0 {
                    debug!("{path}: open failed: {e}");
                    break;
                }
                if n == 0 {
                    info!("waiting {wait_seconds}s for {path} to become available");
                }
                if n + 1 < attempts {
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }
    Err(ProtocolError::DeviceNotFound {
        device: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    #[test]
    fn test_port_sorting() {
        let names = [
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let mut keys: Vec<_> = names.iter().map(|n| (port_sort_key(n), *n)).collect();
        keys.sort();
        let ordered: Vec<&str> = keys.into_iter().map(|(_, n)| n).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_retry_open_single_attempt_without_wait() {
        let mut calls = 0;
        let result: Result<(), _> = retry_open(0, "/dev/nonexistent", || {
            calls += 1;
            Err(ProtocolError::ConnectionFailed("no device".into()))
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(ProtocolError::DeviceNotFound { .. })));
    }

    #[test]
    fn test_retry_open_exhausts_wait_budget() {
        let mut calls = 0;
        let start = Instant::now();
        let result: Result<(), _> = retry_open(3, "/dev/nonexistent", || {
            calls += 1;
            Err(ProtocolError::ConnectionFailed("no device".into()))
        });
        // wait=3 means 4 attempts with three 1s gaps between them
        assert_eq!(calls, 4);
        assert!(start.elapsed() >= Duration::from_secs(3));
        match result {
            Err(ProtocolError::DeviceNotFound { device }) => {
                assert_eq!(device, "/dev/nonexistent")
            }
            other => panic!("expected DeviceNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_open_succeeds_mid_wait() {
        let mut calls = 0;
        let result = retry_open(5, "/dev/late", || {
            calls += 1;
            if calls < 3 {
                Err(ProtocolError::ConnectionFailed("not yet".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(calls, 3);
        assert!(matches!(result, Ok(42)));
    }
}
