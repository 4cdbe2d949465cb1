//! Serial channel management
//!
//! The [`Channel`] owns the serial port for the duration of one flashing
//! session. Opening it captures the line settings the port had beforehand and
//! applies the fixed configuration the download-mode ROM expects; the
//! captured settings are restored exactly once when the session ends, on
//! every exit path.

use std::{
    io::{self, Read, Write},
    time::Duration,
};

use log::{debug, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

use crate::error::Error;

/// Line rate the download-mode ROM comes up at.
pub const DEFAULT_BAUD: u32 = 115_200;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(unix)]
pub type NativePort = serialport::TTYPort;
#[cfg(not(unix))]
pub type NativePort = serialport::COMPort;

/// Snapshot of a port's line settings, for restoration at teardown.
#[derive(Debug, Clone)]
struct LineSettings {
    baud_rate: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    flow_control: FlowControl,
    timeout: Duration,
}

impl LineSettings {
    fn capture<P: SerialPort>(port: &P) -> serialport::Result<Self> {
        Ok(LineSettings {
            baud_rate: port.baud_rate()?,
            data_bits: port.data_bits()?,
            parity: port.parity()?,
            stop_bits: port.stop_bits()?,
            flow_control: port.flow_control()?,
            timeout: port.timeout(),
        })
    }

    fn apply<P: SerialPort>(&self, port: &mut P) -> serialport::Result<()> {
        port.set_baud_rate(self.baud_rate)?;
        port.set_data_bits(self.data_bits)?;
        port.set_parity(self.parity)?;
        port.set_stop_bits(self.stop_bits)?;
        port.set_flow_control(self.flow_control)?;
        port.set_timeout(self.timeout)?;

        Ok(())
    }
}

/// What was on the line before the session, and how to put it back.
enum Saved {
    /// Raw termios state of the device node, taken before the port was
    /// opened and configured. The fd is the session port's, valid until the
    /// channel drops.
    #[cfg(unix)]
    Termios { fd: RawFd, termios: libc::termios },
    /// Settings reported by the port itself, reapplied through the serial
    /// API.
    Settings(LineSettings),
}

/// The exclusively-owned, configured serial connection to the device.
pub struct Channel<P: SerialPort> {
    port: P,
    port_name: String,
    saved: Saved,
    restored: bool,
}

impl Channel<NativePort> {
    /// Open the port, capture its line settings and apply the download-mode
    /// configuration: the given baud rate, 8N1, hardware flow control.
    ///
    /// On Unix the prior termios state is read off the device node before
    /// serialport touches it, so restoration hands back exactly what the
    /// node had. The port itself is opened exclusively (serialport sets
    /// `TIOCEXCL`), so a port already held by another process fails here
    /// rather than mid-session.
    pub fn open(port_name: &str, baud: u32) -> Result<Self, Error> {
        #[cfg(unix)]
        let termios = capture_termios(port_name).map_err(|e| Error::SerialConfigure {
            port: port_name.to_string(),
            source: e.into(),
        })?;

        let port = serialport::new(port_name, baud)
            .open_native()
            .map_err(|source| Error::SerialOpen {
                port: port_name.to_string(),
                source,
            })?;

        #[cfg(unix)]
        let saved = Saved::Termios {
            fd: port.as_raw_fd(),
            termios,
        };
        #[cfg(not(unix))]
        let saved = Saved::Settings(LineSettings::capture(&port).map_err(|source| {
            Error::SerialConfigure {
                port: port_name.to_string(),
                source,
            }
        })?);

        Channel::configure(port, port_name, baud, saved)
    }
}

impl<P: SerialPort> Channel<P> {
    /// Take over an already-open port. Its current settings are captured
    /// through the serial API and reapplied at restore.
    pub fn from_port(port: P, port_name: &str, baud: u32) -> Result<Self, Error> {
        let saved = LineSettings::capture(&port).map_err(|source| Error::SerialConfigure {
            port: port_name.to_string(),
            source,
        })?;

        Channel::configure(port, port_name, baud, Saved::Settings(saved))
    }

    fn configure(mut port: P, port_name: &str, baud: u32, saved: Saved) -> Result<Self, Error> {
        let configure = |source| Error::SerialConfigure {
            port: port_name.to_string(),
            source,
        };

        // Anything buffered before we got here belongs to nobody.
        port.clear(ClearBuffer::Input).map_err(configure)?;

        let active = LineSettings {
            baud_rate: baud,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::Hardware,
            timeout: READ_TIMEOUT,
        };
        active.apply(&mut port).map_err(configure)?;

        debug!("Opened {port_name} at {baud} baud");

        Ok(Channel {
            port,
            port_name: port_name.to_string(),
            saved,
            restored: false,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Reapply the captured line settings and release the port.
    ///
    /// A restoration failure is a warning, not an error: the device node
    /// disappears with the device once it leaves download mode, whatever
    /// settings it was left with.
    pub fn restore(mut self) {
        self.restore_settings();
    }

    fn restore_settings(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;

        let result = match &self.saved {
            #[cfg(unix)]
            Saved::Termios { fd, termios } => restore_termios(*fd, termios),
            Saved::Settings(settings) => settings.apply(&mut self.port).map_err(io::Error::other),
        };

        if let Err(err) = result {
            warn!(
                "Failed to restore line settings of {}: {err}",
                self.port_name
            );
        } else {
            debug!("Restored line settings of {}", self.port_name);
        }
    }
}

impl<P: SerialPort> Drop for Channel<P> {
    // Backstop for exit paths that never reach the explicit restore.
    fn drop(&mut self) {
        self.restore_settings();
    }
}

impl<P: SerialPort> Read for Channel<P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl<P: SerialPort> Write for Channel<P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

/// Read the termios state of `port_name` without disturbing it. A short-lived
/// non-blocking descriptor avoids waiting on carrier detect.
#[cfg(unix)]
fn capture_termios(port_name: &str) -> io::Result<libc::termios> {
    use std::os::unix::fs::OpenOptionsExt;

    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(port_name)?;

    let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
    if unsafe { libc::tcgetattr(file.as_raw_fd(), &mut termios) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(termios)
}

#[cfg(unix)]
fn restore_termios(fd: RawFd, termios: &libc::termios) -> io::Result<()> {
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, termios) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records every baud rate applied to it; other settings are accepted
    /// and forgotten.
    struct MockPort {
        baud: u32,
        applied: Arc<Mutex<Vec<u32>>>,
    }

    impl MockPort {
        fn new(baud: u32, applied: Arc<Mutex<Vec<u32>>>) -> Self {
            MockPort { baud, applied }
        }
    }

    impl Read for MockPort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialPort for MockPort {
        fn name(&self) -> Option<String> {
            Some("mock".to_string())
        }

        fn baud_rate(&self) -> serialport::Result<u32> {
            Ok(self.baud)
        }

        fn data_bits(&self) -> serialport::Result<DataBits> {
            Ok(DataBits::Eight)
        }

        fn flow_control(&self) -> serialport::Result<FlowControl> {
            Ok(FlowControl::None)
        }

        fn parity(&self) -> serialport::Result<Parity> {
            Ok(Parity::None)
        }

        fn stop_bits(&self) -> serialport::Result<StopBits> {
            Ok(StopBits::One)
        }

        fn timeout(&self) -> Duration {
            Duration::ZERO
        }

        fn set_baud_rate(&mut self, baud: u32) -> serialport::Result<()> {
            self.applied.lock().unwrap().push(baud);
            self.baud = baud;
            Ok(())
        }

        fn set_data_bits(&mut self, _data_bits: DataBits) -> serialport::Result<()> {
            Ok(())
        }

        fn set_flow_control(&mut self, _flow_control: FlowControl) -> serialport::Result<()> {
            Ok(())
        }

        fn set_parity(&mut self, _parity: Parity) -> serialport::Result<()> {
            Ok(())
        }

        fn set_stop_bits(&mut self, _stop_bits: StopBits) -> serialport::Result<()> {
            Ok(())
        }

        fn set_timeout(&mut self, _timeout: Duration) -> serialport::Result<()> {
            Ok(())
        }

        fn write_request_to_send(&mut self, _level: bool) -> serialport::Result<()> {
            Ok(())
        }

        fn write_data_terminal_ready(&mut self, _level: bool) -> serialport::Result<()> {
            Ok(())
        }

        fn read_clear_to_send(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }

        fn read_data_set_ready(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }

        fn read_ring_indicator(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }

        fn read_carrier_detect(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }

        fn bytes_to_read(&self) -> serialport::Result<u32> {
            Ok(0)
        }

        fn bytes_to_write(&self) -> serialport::Result<u32> {
            Ok(0)
        }

        fn clear(&self, _buffer_to_clear: ClearBuffer) -> serialport::Result<()> {
            Ok(())
        }

        fn try_clone(&self) -> serialport::Result<Box<dyn SerialPort>> {
            Err(serialport::Error::new(
                serialport::ErrorKind::Unknown,
                "mock ports cannot be cloned",
            ))
        }

        fn set_break(&self) -> serialport::Result<()> {
            Ok(())
        }

        fn clear_break(&self) -> serialport::Result<()> {
            Ok(())
        }
    }

    fn channel(baud: u32, applied: &Arc<Mutex<Vec<u32>>>) -> Channel<MockPort> {
        Channel::from_port(MockPort::new(9600, applied.clone()), "mock", baud).unwrap()
    }

    #[test]
    fn open_applies_requested_baud() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let _channel = channel(921_600, &applied);

        assert_eq!(applied.lock().unwrap().as_slice(), &[921_600]);
    }

    #[test]
    fn explicit_restore_reapplies_captured_settings() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        channel(DEFAULT_BAUD, &applied).restore();

        assert_eq!(applied.lock().unwrap().as_slice(), &[DEFAULT_BAUD, 9600]);
    }

    #[test]
    fn drop_alone_restores() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        drop(channel(DEFAULT_BAUD, &applied));

        assert_eq!(applied.lock().unwrap().as_slice(), &[DEFAULT_BAUD, 9600]);
    }

    #[test]
    fn restore_then_drop_restores_only_once() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let channel = channel(DEFAULT_BAUD, &applied);

        // `restore` consumes the channel, so the drop glue runs right after
        // the explicit restoration. The captured rate must come back once.
        channel.restore();

        let applied = applied.lock().unwrap();
        assert_eq!(applied.iter().filter(|&&b| b == 9600).count(), 1);
    }
}
