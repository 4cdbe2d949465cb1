//! Sahara bootstrap protocol
//!
//! Sahara is the download-mode ROM's handshake protocol: the device drives
//! the exchange, requesting byte ranges of the boot image (the Firehose
//! flash programmer) until it has enough to jump into it. Packets are
//! little-endian structs prefixed with a command id and total length.

use std::{
    fs,
    io::{Read, Write},
    mem::size_of,
    path::Path,
};

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use log::{debug, info};

use crate::{error::Error, flasher::BootstrapEngine};

const CMD_HELLO: u32 = 0x01;
const CMD_HELLO_RESPONSE: u32 = 0x02;
const CMD_READ_DATA: u32 = 0x03;
const CMD_END_OF_IMAGE_TRANSFER: u32 = 0x04;
const CMD_DONE: u32 = 0x05;
const CMD_DONE_RESPONSE: u32 = 0x06;
const CMD_READ_DATA64: u32 = 0x12;

const SAHARA_VERSION: u32 = 2;
const SAHARA_VERSION_COMPATIBLE: u32 = 1;
const MODE_IMAGE_TX_PENDING: u32 = 0x0;
const STATUS_SUCCESS: u32 = 0x0;

// Sanity bound for device-claimed packet lengths.
const MAX_PACKET_LEN: usize = 0x1000;

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct PacketHeader {
    cmd: u32,
    length: u32,
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct Hello {
    version: u32,
    compatible: u32,
    max_len: u32,
    mode: u32,
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct HelloResponse {
    version: u32,
    compatible: u32,
    status: u32,
    mode: u32,
    reserved: [u32; 6],
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct ReadData {
    image: u32,
    offset: u32,
    length: u32,
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct ReadData64 {
    image: u64,
    offset: u64,
    length: u64,
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct EndOfImageTransfer {
    image: u32,
    status: u32,
}

#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
struct DoneResponse {
    status: u32,
}

/// The bootstrap protocol engine.
#[derive(Debug, Default)]
pub struct Sahara;

impl<C: Read + Write> BootstrapEngine<C> for Sahara {
    fn run(&mut self, channel: &mut C, boot_image: &Path) -> Result<(), Error> {
        let image = fs::read(boot_image)
            .map_err(|e| Error::FileOpen(boot_image.display().to_string(), e))?;

        info!(
            "Uploading {} ({} bytes) over Sahara",
            boot_image.display(),
            image.len()
        );

        loop {
            let (cmd, payload) = read_packet(channel)?;
            match cmd {
                CMD_HELLO => {
                    let hello: Hello = payload_as(&payload)?;
                    debug!(
                        "Sahara hello: version {} (compatible {}), mode {:#x}",
                        hello.version, hello.compatible, hello.mode
                    );

                    let response = HelloResponse {
                        version: SAHARA_VERSION,
                        compatible: SAHARA_VERSION_COMPATIBLE,
                        status: STATUS_SUCCESS,
                        mode: MODE_IMAGE_TX_PENDING,
                        reserved: [0; 6],
                    };
                    send_packet(channel, CMD_HELLO_RESPONSE, bytes_of(&response))?;
                }
                CMD_READ_DATA => {
                    let req: ReadData = payload_as(&payload)?;
                    send_chunk(channel, &image, req.offset as u64, req.length as u64)?;
                }
                CMD_READ_DATA64 => {
                    let req: ReadData64 = payload_as(&payload)?;
                    send_chunk(channel, &image, req.offset, req.length)?;
                }
                CMD_END_OF_IMAGE_TRANSFER => {
                    let end: EndOfImageTransfer = payload_as(&payload)?;
                    if end.status != STATUS_SUCCESS {
                        return Err(Error::SaharaImageRejected(end.status));
                    }
                    debug!("Sahara image transfer complete");
                    send_packet(channel, CMD_DONE, &[])?;
                }
                CMD_DONE_RESPONSE => {
                    let done: DoneResponse = payload_as(&payload)?;
                    if done.status != STATUS_SUCCESS {
                        return Err(Error::SaharaImageRejected(done.status));
                    }
                    info!("Boot image accepted, device entering flash programmer");
                    return Ok(());
                }
                other => return Err(Error::SaharaUnexpectedCommand(other)),
            }
        }
    }
}

fn read_packet<C: Read>(channel: &mut C) -> Result<(u32, Vec<u8>), Error> {
    let mut header = [0u8; size_of::<PacketHeader>()];
    channel.read_exact(&mut header)?;
    let header: PacketHeader = pod_read_unaligned(&header);

    let length = header.length as usize;
    if length < size_of::<PacketHeader>() || length > MAX_PACKET_LEN {
        return Err(Error::SaharaProtocol(format!(
            "invalid packet length {length} for command {:#04x}",
            header.cmd
        )));
    }

    let mut payload = vec![0u8; length - size_of::<PacketHeader>()];
    channel.read_exact(&mut payload)?;

    Ok((header.cmd, payload))
}

fn payload_as<T: Pod>(payload: &[u8]) -> Result<T, Error> {
    if payload.len() < size_of::<T>() {
        return Err(Error::SaharaProtocol(format!(
            "short packet: {} bytes, expected at least {}",
            payload.len(),
            size_of::<T>()
        )));
    }

    Ok(pod_read_unaligned(&payload[..size_of::<T>()]))
}

fn send_packet<C: Write>(channel: &mut C, cmd: u32, payload: &[u8]) -> Result<(), Error> {
    let header = PacketHeader {
        cmd,
        length: (size_of::<PacketHeader>() + payload.len()) as u32,
    };

    channel.write_all(bytes_of(&header))?;
    channel.write_all(payload)?;
    channel.flush()?;

    Ok(())
}

fn send_chunk<C: Write>(channel: &mut C, image: &[u8], offset: u64, length: u64) -> Result<(), Error> {
    let end = offset
        .checked_add(length)
        .filter(|end| *end <= image.len() as u64)
        .ok_or_else(|| {
            Error::SaharaProtocol(format!(
                "device requested {length} bytes at offset {offset}, image is {} bytes",
                image.len()
            ))
        })?;

    debug!("Sending {length} bytes at offset {offset}");
    channel.write_all(&image[offset as usize..end as usize])?;
    channel.flush()?;

    Ok(())
}
