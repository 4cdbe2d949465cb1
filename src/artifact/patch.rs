//! Patch (rawpatch XML) artifacts
//!
//! Patch documents carry small in-place edits that fix up partition tables
//! after programming. Only rows targeting the device (`filename="DISK"`)
//! are kept; host-side patch rows are meaningless to the execution phase.

use std::path::Path;

use log::debug;

use crate::error::Error;

use super::parse_rows;

/// One device-targeted `<patch>` row of a rawpatch document.
#[derive(Debug, Clone)]
pub struct Patch {
    pub sector_size: u32,
    pub byte_offset: u32,
    pub filename: String,
    pub partition: u32,
    pub size_in_bytes: u32,
    pub start_sector: String,
    pub value: String,
    pub what: String,
}

/// Parse the `<patch>` elements of the document at `path`, retaining the
/// rows addressed to the device.
pub fn load(path: &Path) -> Result<Vec<Patch>, Error> {
    let patches = parse_rows(path, "patch", |attrs| {
        Ok(Patch {
            sector_size: attrs.parse("SECTOR_SIZE_IN_BYTES")?,
            byte_offset: attrs.parse("byte_offset")?,
            filename: attrs.get("filename")?.to_string(),
            partition: attrs.parse("physical_partition_number")?,
            size_in_bytes: attrs.parse("size_in_bytes")?,
            start_sector: attrs.get("start_sector")?.to_string(),
            value: attrs.get("value")?.to_string(),
            what: attrs.get_or("what", "").to_string(),
        })
    })?;

    let total = patches.len();
    let patches = patches
        .into_iter()
        .filter(|patch| patch.filename == "DISK")
        .collect::<Vec<_>>();
    debug!(
        "{}: {} of {total} patches target the device",
        path.display(),
        patches.len()
    );

    Ok(patches)
}
