//! Program (rawprogram XML) artifacts
//!
//! A program artifact describes which files land in which sectors of which
//! physical partition. Entries without a `filename` are erase-only
//! placeholders that the execution phase skips.

use std::path::{Path, PathBuf};

use crate::error::Error;

use super::parse_rows;

/// One `<program>` row of a rawprogram document.
#[derive(Debug, Clone)]
pub struct Program {
    pub sector_size: u32,
    pub file_offset: u32,
    pub filename: String,
    pub label: String,
    pub num_sectors: u32,
    pub partition: u32,
    pub start_sector: String,
    pub sparse: bool,
}

impl Program {
    /// Whether this row carries file data to transfer.
    pub fn has_data(&self) -> bool {
        !self.filename.is_empty()
    }

    /// Resolve the data file against `include` if given, otherwise against
    /// the directory of the artifact that named it.
    pub fn resolve(&self, artifact: &Path, include: Option<&Path>) -> PathBuf {
        let base = include
            .map(Path::to_path_buf)
            .or_else(|| artifact.parent().map(Path::to_path_buf))
            .unwrap_or_default();

        base.join(&self.filename)
    }
}

/// Parse every `<program>` element of the document at `path`.
pub fn load(path: &Path) -> Result<Vec<Program>, Error> {
    parse_rows(path, "program", |attrs| {
        let sector_size: u32 = attrs.parse("SECTOR_SIZE_IN_BYTES")?;
        if sector_size == 0 {
            return Err("`SECTOR_SIZE_IN_BYTES` must be non-zero".to_string());
        }

        Ok(Program {
            sector_size,
            file_offset: attrs.parse_or("file_sector_offset", 0)?,
            filename: attrs.get_or("filename", "").to_string(),
            label: attrs.get_or("label", "").to_string(),
            num_sectors: attrs.parse_or("num_partition_sectors", 0)?,
            partition: attrs.parse("physical_partition_number")?,
            start_sector: attrs.get("start_sector")?.to_string(),
            sparse: attrs.get_or("sparse", "false") == "true",
        })
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn load_rawprogram_rows() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"<?xml version="1.0" ?>
            <data>
              <program SECTOR_SIZE_IN_BYTES="4096" file_sector_offset="0"
                       filename="sbl1.mbn" label="sbl1" num_partition_sectors="75"
                       physical_partition_number="0" start_sector="131072"/>
              <program SECTOR_SIZE_IN_BYTES="4096" filename=""
                       label="empty" num_partition_sectors="16"
                       physical_partition_number="0" start_sector="131147"/>
            </data>"#,
        )
        .unwrap();

        let programs = load(file.path()).unwrap();
        assert_eq!(programs.len(), 2);

        assert_eq!(programs[0].filename, "sbl1.mbn");
        assert_eq!(programs[0].label, "sbl1");
        assert_eq!(programs[0].sector_size, 4096);
        assert_eq!(programs[0].num_sectors, 75);
        assert_eq!(programs[0].partition, 0);
        assert_eq!(programs[0].start_sector, "131072");
        assert!(programs[0].has_data());
        assert!(!programs[0].sparse);

        assert!(!programs[1].has_data());
    }

    #[test]
    fn missing_required_attribute_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"<data><program filename="x.bin"/></data>"#)
            .unwrap();

        assert!(matches!(
            load(file.path()),
            Err(Error::InvalidArtifact { .. })
        ));
    }

    #[test]
    fn resolve_prefers_include_dir() {
        let program = Program {
            sector_size: 512,
            file_offset: 0,
            filename: "boot.img".to_string(),
            label: String::new(),
            num_sectors: 0,
            partition: 0,
            start_sector: "0".to_string(),
            sparse: false,
        };

        let artifact = Path::new("/fw/rawprogram0.xml");
        assert_eq!(
            program.resolve(artifact, None),
            Path::new("/fw/boot.img")
        );
        assert_eq!(
            program.resolve(artifact, Some(Path::new("/images"))),
            Path::new("/images/boot.img")
        );
    }
}
