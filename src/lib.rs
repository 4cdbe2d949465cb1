//! A library and command-line tool for flashing firmware onto Qualcomm
//! devices that have entered emergency download (EDL) mode.
//!
//! The flow mirrors the device's two protocol phases: a Sahara exchange
//! uploads a flash-programmer boot image, then Firehose commands program,
//! patch and reset the target storage. See [`Flasher`] for the top-level
//! session orchestration.

pub mod artifact;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod firehose;
pub mod flasher;
pub mod logging;
pub mod sahara;

pub use crate::{
    connection::Channel,
    error::Error,
    flasher::{BootstrapEngine, ExecutionEngine, Flasher},
};
