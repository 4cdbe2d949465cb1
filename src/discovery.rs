//! Locate a device in emergency download mode
//!
//! A Qualcomm device that has entered emergency download mode enumerates as
//! a USB serial port with a well-known vendor/product identity. The
//! [`DeviceLocator`] polls the host's serial ports until exactly one such
//! port appears, leaving the operator time to power the device into
//! download mode.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, info};
use serialport::{available_ports, SerialPortInfo, SerialPortType};

use crate::error::Error;

/// USB vendor id of Qualcomm's emergency download mode
pub const EDL_VID: u16 = 0x05c6;
/// USB product id of Qualcomm's emergency download mode
pub const EDL_PID: u16 = 0x9008;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polls the serial-port namespace for a device matching a fixed USB
/// vendor/product identity.
pub struct DeviceLocator {
    vid: u16,
    pid: u16,
    poll_interval: Duration,
    deadline: Option<Duration>,
    cancel: Arc<AtomicBool>,
}

impl DeviceLocator {
    pub fn new(vid: u16, pid: u16) -> Self {
        DeviceLocator {
            vid,
            pid,
            poll_interval: POLL_INTERVAL,
            deadline: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bound the wait instead of polling indefinitely.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Abort the wait with [`Error::Cancelled`] once the flag is set.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Block until exactly one matching port is present and return it.
    ///
    /// Waits indefinitely by default; the operator is expected to power the
    /// device into download mode while this polls. More than one matching
    /// port is an error rather than a guess.
    pub fn locate(&self) -> Result<SerialPortInfo, Error> {
        let start = Instant::now();
        let mut waiting = false;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }

            let ports = available_ports().unwrap_or_default();
            if let Some(port) = match_ports(&ports, self.vid, self.pid)? {
                debug!(
                    "Found {:04x}:{:04x} at {}",
                    self.vid, self.pid, port.port_name
                );
                return Ok(port);
            }

            if let Some(deadline) = self.deadline {
                if start.elapsed() >= deadline {
                    return Err(Error::DiscoveryTimeout);
                }
            }

            if !waiting {
                info!(
                    "Waiting for a device in emergency download mode ({:04x}:{:04x})...",
                    self.vid, self.pid
                );
                waiting = true;
            }

            sleep(self.poll_interval);
        }
    }
}

/// Filter the enumerated ports down to the one matching the target USB
/// identity. Ports without readable USB metadata never match.
fn match_ports(
    ports: &[SerialPortInfo],
    vid: u16,
    pid: u16,
) -> Result<Option<SerialPortInfo>, Error> {
    let matches = ports
        .iter()
        .filter(|port| {
            matches!(
                &port.port_type,
                SerialPortType::UsbPort(usb) if usb.vid == vid && usb.pid == pid
            )
        })
        .collect::<Vec<_>>();

    match matches.as_slice() {
        [] => Ok(None),
        [port] => Ok(Some((*port).clone())),
        many => Err(Error::MultipleDevices(
            many.iter().map(|port| port.port_name.clone()).collect(),
        )),
    }
}
