//! Library and application errors

use std::{io, path::PathBuf};

use miette::Diagnostic;
use thiserror::Error;

/// All possible errors returned by qdl
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(qdl::cancelled))]
    Cancelled,

    #[error("Timed out waiting for a device in emergency download mode")]
    #[diagnostic(
        code(qdl::discovery_timeout),
        help("Power-cycle the device into emergency download mode and try again")
    )]
    DiscoveryTimeout,

    #[error("Multiple devices in emergency download mode: {}", .0.join(", "))]
    #[diagnostic(
        code(qdl::multiple_devices),
        help("Disconnect all but one device, or select one explicitly with the `--port` option")
    )]
    MultipleDevices(Vec<String>),

    #[error("Failed to open serial port '{port}'")]
    #[diagnostic(
        code(qdl::serial_open),
        help("The port may be held open by another process, or you may lack permission to open it")
    )]
    SerialOpen {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Failed to configure serial port '{port}'")]
    #[diagnostic(code(qdl::serial_configure))]
    SerialConfigure {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(qdl::file_open))]
    FileOpen(String, #[source] io::Error),

    #[error("Unrecognized artifact file '{}'", .0.display())]
    #[diagnostic(
        code(qdl::unknown_artifact),
        help("Recognized root elements are `patches`, `data` and `contents`")
    )]
    UnknownArtifact(PathBuf),

    #[error("Contents artifact '{}' is not yet supported", .0.display())]
    #[diagnostic(code(qdl::contents_not_supported))]
    ContentsNotSupported(PathBuf),

    #[error("Failed to parse artifact '{}': {reason}", .path.display())]
    #[diagnostic(code(qdl::invalid_artifact))]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error("Sahara protocol error: {0}")]
    #[diagnostic(code(qdl::sahara::protocol))]
    SaharaProtocol(String),

    #[error("Unexpected Sahara command {0:#04x}")]
    #[diagnostic(
        code(qdl::sahara::unexpected_command),
        help("The device may not be in emergency download mode; power-cycle it and try again")
    )]
    SaharaUnexpectedCommand(u32),

    #[error("Device rejected the boot image (Sahara status {0:#x})")]
    #[diagnostic(
        code(qdl::sahara::image_rejected),
        help("Ensure that the boot image is a flash programmer built for this device")
    )]
    SaharaImageRejected(u32),

    #[error("Sparse program entry `{0}` is not supported")]
    #[diagnostic(
        code(qdl::firehose::sparse),
        help("Unpack the sparse image with `simg2img` and flash the raw image instead")
    )]
    SparseNotSupported(String),

    #[error("Device NAKed the Firehose `{0}` command")]
    #[diagnostic(code(qdl::firehose::nak))]
    FirehoseNak(String),

    #[error("Invalid Firehose response from device: {0}")]
    #[diagnostic(code(qdl::firehose::response))]
    FirehoseResponse(String),

    #[error(transparent)]
    #[diagnostic(code(qdl::io))]
    Io(#[from] io::Error),
}
