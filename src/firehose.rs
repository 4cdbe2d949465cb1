//! Firehose execution protocol
//!
//! Once the Sahara phase has started the flash programmer on the device,
//! Firehose takes over: XML command documents go down the channel, XML
//! response documents come back. Programming switches the link into raw mode
//! for the file payload, then drops back to XML for the acknowledgement.

use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use indicatif::ProgressBar;
use log::{debug, info, warn};
use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, Event},
    Reader, Writer,
};

use crate::{
    artifact::{Patch, Payload, Program, Session},
    error::Error,
    flasher::ExecutionEngine,
};

const MEMORY_NAME: &str = "nand";
const DEFAULT_PAYLOAD_SIZE: usize = 1024 * 1024;
const RESPONSE_CHUNK: usize = 4096;

/// The execution protocol engine.
pub struct Firehose {
    include: Option<PathBuf>,
    payload_size: usize,
    // Bytes read off the channel but not yet consumed as a document. A
    // single read may straddle document boundaries, so leftovers must
    // survive until the next response is wanted.
    pending: Vec<u8>,
}

/// The `<response>` terminator of a device reply.
#[derive(Debug, PartialEq, Eq)]
struct DeviceResponse {
    ack: bool,
    rawmode: Option<bool>,
    max_payload: Option<usize>,
}

impl Firehose {
    /// `include` overrides the directory program data files resolve against.
    pub fn new(include: Option<PathBuf>) -> Self {
        Firehose {
            include,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            pending: Vec::new(),
        }
    }

    /// Read device documents off the channel until one carries a
    /// `<response>`, forwarding any `<log>` lines to the logger on the way.
    /// Bytes past the terminating document stay buffered for the next call.
    fn read_response<C: Read>(&mut self, channel: &mut C) -> Result<DeviceResponse, Error> {
        let mut chunk = [0u8; RESPONSE_CHUNK];

        loop {
            while let Some(end) = find_subslice(&self.pending, b"</data>") {
                let doc = self
                    .pending
                    .drain(..end + b"</data>".len())
                    .collect::<Vec<u8>>();
                if let Some(response) = parse_response(&doc)? {
                    return Ok(response);
                }
            }

            let n = channel.read(&mut chunk)?;
            if n == 0 {
                return Err(Error::FirehoseResponse(
                    "connection closed while waiting for a response".to_string(),
                ));
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    fn configure<C: Read + Write>(&mut self, channel: &mut C) -> Result<(), Error> {
        let payload_size = DEFAULT_PAYLOAD_SIZE.to_string();

        let mut element = BytesStart::new("configure");
        element.push_attribute(("MemoryName", MEMORY_NAME));
        element.push_attribute(("MaxPayloadSizeToTargetInBytes", payload_size.as_str()));
        element.push_attribute(("verbose", "0"));
        element.push_attribute(("ZlpAwareHost", "1"));
        element.push_attribute(("SkipStorageInit", "0"));
        send_command(channel, element)?;

        let response = self.read_response(channel)?;
        if !response.ack {
            return Err(Error::FirehoseNak("configure".to_string()));
        }

        if let Some(max) = response.max_payload {
            if max < self.payload_size {
                debug!("Device limits raw payloads to {max} bytes");
                self.payload_size = max;
            }
        }

        Ok(())
    }

    fn program<C: Read + Write>(
        &mut self,
        channel: &mut C,
        program: &Program,
        artifact: &Path,
    ) -> Result<(), Error> {
        if program.sparse {
            return Err(Error::SparseNotSupported(program.filename.clone()));
        }

        let path = program.resolve(artifact, self.include.as_deref());
        let file =
            File::open(&path).map_err(|e| Error::FileOpen(path.display().to_string(), e))?;
        let file_size = file
            .metadata()
            .map_err(|e| Error::FileOpen(path.display().to_string(), e))?
            .len();

        // Transfers may start partway into the data file.
        let sector_size = program.sector_size as u64;
        let skip = u64::from(program.file_offset) * sector_size;
        if skip > file_size {
            return Err(Error::InvalidArtifact {
                path: artifact.to_path_buf(),
                reason: format!(
                    "file_sector_offset {} is beyond the end of {}",
                    program.file_offset, program.filename
                ),
            });
        }

        let num_sectors = (file_size - skip).div_ceil(sector_size);

        let sector_size_attr = program.sector_size.to_string();
        let num_sectors_attr = num_sectors.to_string();
        let partition_attr = program.partition.to_string();

        let mut element = BytesStart::new("program");
        element.push_attribute(("SECTOR_SIZE_IN_BYTES", sector_size_attr.as_str()));
        element.push_attribute(("num_partition_sectors", num_sectors_attr.as_str()));
        element.push_attribute(("physical_partition_number", partition_attr.as_str()));
        element.push_attribute(("start_sector", program.start_sector.as_str()));
        send_command(channel, element)?;

        let response = self.read_response(channel)?;
        if !response.ack {
            return Err(Error::FirehoseNak("program".to_string()));
        }
        if response.rawmode != Some(true) {
            return Err(Error::FirehoseResponse(
                "device did not enter raw mode for program data".to_string(),
            ));
        }

        info!(
            "Programming {} ({num_sectors} sectors at {} of partition {})",
            program.label, program.start_sector, program.partition
        );

        // Stream the file in payload-sized chunks, zero-padded to a whole
        // number of sectors.
        let progress = ProgressBar::new(num_sectors * sector_size);
        let chunk_sectors = (self.payload_size as u64 / sector_size).max(1);
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(skip))?;
        let mut buf = vec![0u8; (chunk_sectors * sector_size) as usize];

        let mut remaining = num_sectors;
        while remaining > 0 {
            let sectors = remaining.min(chunk_sectors);
            let len = (sectors * sector_size) as usize;
            let chunk = &mut buf[..len];
            chunk.fill(0);

            let mut filled = 0;
            loop {
                let n = reader.read(&mut chunk[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
                if filled == len {
                    break;
                }
            }

            channel.write_all(chunk)?;
            progress.inc(len as u64);
            remaining -= sectors;
        }
        channel.flush()?;
        progress.finish_and_clear();

        let response = self.read_response(channel)?;
        if !response.ack {
            return Err(Error::FirehoseNak("program".to_string()));
        }

        Ok(())
    }

    fn patch<C: Read + Write>(&mut self, channel: &mut C, patch: &Patch) -> Result<(), Error> {
        debug!("Applying patch: {}", patch.what);

        let sector_size = patch.sector_size.to_string();
        let byte_offset = patch.byte_offset.to_string();
        let partition = patch.partition.to_string();
        let size_in_bytes = patch.size_in_bytes.to_string();

        let mut element = BytesStart::new("patch");
        element.push_attribute(("SECTOR_SIZE_IN_BYTES", sector_size.as_str()));
        element.push_attribute(("byte_offset", byte_offset.as_str()));
        element.push_attribute(("filename", patch.filename.as_str()));
        element.push_attribute(("physical_partition_number", partition.as_str()));
        element.push_attribute(("size_in_bytes", size_in_bytes.as_str()));
        element.push_attribute(("start_sector", patch.start_sector.as_str()));
        element.push_attribute(("value", patch.value.as_str()));
        send_command(channel, element)?;

        let response = self.read_response(channel)?;
        if !response.ack {
            return Err(Error::FirehoseNak("patch".to_string()));
        }

        Ok(())
    }

    fn power_reset<C: Read + Write>(&mut self, channel: &mut C) -> Result<(), Error> {
        let mut element = BytesStart::new("power");
        element.push_attribute(("value", "reset"));
        send_command(channel, element)?;

        let response = self.read_response(channel)?;
        if !response.ack {
            return Err(Error::FirehoseNak("power".to_string()));
        }

        Ok(())
    }
}

impl<C: Read + Write> ExecutionEngine<C> for Firehose {
    fn run(&mut self, channel: &mut C, session: &Session) -> Result<(), Error> {
        self.configure(channel)?;

        for artifact in session.artifacts() {
            match &artifact.payload {
                Payload::Programs(programs) => {
                    for program in programs {
                        if !program.has_data() {
                            debug!("Skipping erase-only entry `{}`", program.label);
                            continue;
                        }
                        self.program(channel, program, &artifact.path)?;
                    }
                }
                Payload::Patches(patches) => {
                    for patch in patches {
                        self.patch(channel, patch)?;
                    }
                }
            }
        }

        // The device usually resets out from under the reply, so a failure
        // here is only worth a warning.
        if let Err(err) = self.power_reset(channel) {
            warn!("Reset request failed: {err}");
        }

        Ok(())
    }
}

/// Wrap `element` in a `<data>` document and send it down the channel.
fn send_command<C: Write>(channel: &mut C, element: BytesStart<'_>) -> Result<(), Error> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(io::Error::other)?;
    writer
        .write_event(Event::Start(BytesStart::new("data")))
        .map_err(io::Error::other)?;
    writer
        .write_event(Event::Empty(element))
        .map_err(io::Error::other)?;
    writer
        .write_event(Event::End(BytesEnd::new("data")))
        .map_err(io::Error::other)?;

    let doc = writer.into_inner();
    debug!("firehose send: {}", String::from_utf8_lossy(&doc));

    channel.write_all(&doc)?;
    channel.flush()?;

    Ok(())
}

/// Parse one device document. Returns the response terminator if the
/// document carried one; log-only documents return `None`.
fn parse_response(doc: &[u8]) -> Result<Option<DeviceResponse>, Error> {
    let malformed = |e: String| Error::FirehoseResponse(e);

    let mut reader = Reader::from_reader(doc);
    let mut buf = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| malformed(e.to_string()))?
        {
            Event::Start(e) | Event::Empty(e) => {
                let name = e.name().as_ref().to_vec();
                let mut attrs = Vec::new();
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| malformed(e.to_string()))?;
                    attrs.push((
                        String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                        attr.unescape_value()
                            .map_err(|e| malformed(e.to_string()))?
                            .into_owned(),
                    ));
                }

                match name.as_slice() {
                    b"log" => {
                        if let Some((_, value)) = attrs.iter().find(|(k, _)| k == "value") {
                            info!("firehose: {value}");
                        }
                    }
                    b"response" => {
                        let mut response = DeviceResponse {
                            ack: false,
                            rawmode: None,
                            max_payload: None,
                        };
                        for (key, value) in &attrs {
                            match key.as_str() {
                                "value" => response.ack = value == "ACK",
                                "rawmode" => response.rawmode = Some(value == "true"),
                                "MaxPayloadSizeToTargetInBytesSupported" => {
                                    response.max_payload = value.trim().parse().ok()
                                }
                                _ => (),
                            }
                        }
                        return Ok(Some(response));
                    }
                    _ => (),
                }
            }
            Event::Eof => return Ok(None),
            _ => (),
        }
        buf.clear();
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
