//! Artifact classification and loading
//!
//! Every input file is classified by the name of its XML root element and
//! loaded into the [`Session`] before any device I/O happens, so a malformed
//! artifact is caught before the operator has put the device into download
//! mode.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::debug;
use quick_xml::{events::Event, Reader};
use strum::Display;

use crate::error::Error;

pub mod patch;
pub mod program;

pub use patch::Patch;
pub use program::Program;

/// The role of an input file, determined by its root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    Patch,
    Program,
    Contents,
    Unknown,
}

impl Kind {
    /// Classify a file by the name of its root element. Parse failures
    /// classify as [`Kind::Unknown`]; nothing here is fatal on its own.
    pub fn classify(path: &Path) -> Self {
        match root_element(path) {
            Some(name) => match name.as_str() {
                "patches" => Kind::Patch,
                "data" => Kind::Program,
                "contents" => Kind::Contents,
                _ => Kind::Unknown,
            },
            None => Kind::Unknown,
        }
    }
}

fn root_element(path: &Path) -> Option<String> {
    let mut reader = Reader::from_file(path).ok()?;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).ok()? {
            Event::Start(e) | Event::Empty(e) => {
                return Some(String::from_utf8_lossy(e.name().as_ref()).into_owned())
            }
            Event::Eof => return None,
            _ => (),
        }
        buf.clear();
    }
}

/// The loaded content of one recognized artifact.
#[derive(Debug, Clone)]
pub enum Payload {
    Patches(Vec<Patch>),
    Programs(Vec<Program>),
}

/// One classified and loaded input file.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: Kind,
    pub payload: Payload,
}

/// The ordered artifact set for one flashing session.
///
/// Insertion order is command-line order, and the execution phase consumes
/// artifacts in exactly that order.
#[derive(Debug, Default)]
pub struct Session {
    artifacts: Vec<Artifact>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `path` and register its parsed content.
    ///
    /// Unrecognized and not-yet-supported kinds are hard failures; a partial
    /// artifact set must never reach the device-facing phases.
    pub fn load(&mut self, path: &Path) -> Result<(), Error> {
        let kind = Kind::classify(path);
        debug!("{} classified as {kind}", path.display());

        let payload = match kind {
            Kind::Patch => Payload::Patches(patch::load(path)?),
            Kind::Program => Payload::Programs(program::load(path)?),
            Kind::Contents => return Err(Error::ContentsNotSupported(path.to_path_buf())),
            Kind::Unknown => return Err(Error::UnknownArtifact(path.to_path_buf())),
        };

        self.artifacts.push(Artifact {
            path: path.to_path_buf(),
            kind,
            payload,
        });

        Ok(())
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// Attribute bag collected off an XML element, with typed accessors shared
/// by the program and patch loaders.
pub(crate) struct Attrs(HashMap<String, String>);

impl Attrs {
    pub(crate) fn get(&self, name: &str) -> Result<&str, String> {
        self.0
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| format!("missing `{name}` attribute"))
    }

    pub(crate) fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.0.get(name).map(String::as_str).unwrap_or(default)
    }

    pub(crate) fn parse<T: FromStr>(&self, name: &str) -> Result<T, String> {
        self.get(name)?
            .trim()
            .parse()
            .map_err(|_| format!("invalid `{name}` attribute"))
    }

    pub(crate) fn parse_or<T: FromStr>(&self, name: &str, default: T) -> Result<T, String> {
        match self.0.get(name) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| format!("invalid `{name}` attribute")),
            None => Ok(default),
        }
    }
}

/// Parse every element named `element` in `path`, building one row per
/// occurrence from its attributes.
pub(crate) fn parse_rows<T>(
    path: &Path,
    element: &str,
    build: impl Fn(&Attrs) -> Result<T, String>,
) -> Result<Vec<T>, Error> {
    let invalid = |reason: String| Error::InvalidArtifact {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = Reader::from_file(path)
        .map_err(|e| Error::FileOpen(path.display().to_string(), std::io::Error::other(e)))?;
    let mut buf = Vec::new();
    let mut rows = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| invalid(e.to_string()))?
        {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == element.as_bytes() => {
                let mut attrs = HashMap::new();
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| invalid(e.to_string()))?;
                    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                    let value = attr
                        .unescape_value()
                        .map_err(|e| invalid(e.to_string()))?
                        .into_owned();
                    attrs.insert(key, value);
                }

                rows.push(build(&Attrs(attrs)).map_err(invalid)?);
            }
            Event::Eof => break,
            _ => (),
        }
        buf.clear();
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write};

    use tempfile::NamedTempFile;

    use super::*;

    fn artifact_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn classify_by_root_element() {
        let patch = artifact_file(r#"<?xml version="1.0"?><patches></patches>"#);
        let program = artifact_file(r#"<?xml version="1.0"?><data></data>"#);
        let contents = artifact_file(r#"<?xml version="1.0"?><contents></contents>"#);
        let junk = artifact_file(r#"<?xml version="1.0"?><garbage></garbage>"#);

        assert_eq!(Kind::classify(patch.path()), Kind::Patch);
        assert_eq!(Kind::classify(program.path()), Kind::Program);
        assert_eq!(Kind::classify(contents.path()), Kind::Contents);
        assert_eq!(Kind::classify(junk.path()), Kind::Unknown);
    }

    #[test]
    fn classify_unparseable_as_unknown() {
        let file = artifact_file("not xml at all");
        assert_eq!(Kind::classify(file.path()), Kind::Unknown);

        let missing = Path::new("/nonexistent/file.xml");
        assert_eq!(Kind::classify(missing), Kind::Unknown);
    }

    #[test]
    fn session_rejects_unknown_artifacts() {
        let junk = artifact_file(r#"<garbage/>"#);

        let mut session = Session::new();
        assert!(matches!(
            session.load(junk.path()),
            Err(Error::UnknownArtifact(_))
        ));
        assert!(session.is_empty());
    }

    #[test]
    fn session_rejects_contents_artifacts() {
        let contents = artifact_file(r#"<contents/>"#);

        let mut session = Session::new();
        assert!(matches!(
            session.load(contents.path()),
            Err(Error::ContentsNotSupported(_))
        ));
    }

    #[test]
    fn session_preserves_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.xml");
        let second = dir.path().join("b.xml");
        let third = dir.path().join("c.xml");
        fs::write(
            &first,
            r#"<data><program SECTOR_SIZE_IN_BYTES="512" filename="x.bin"
                 num_partition_sectors="1" physical_partition_number="0"
                 start_sector="0"/></data>"#,
        )
        .unwrap();
        fs::write(
            &second,
            r#"<patches><patch SECTOR_SIZE_IN_BYTES="512" byte_offset="0"
                 filename="DISK" physical_partition_number="0" size_in_bytes="4"
                 start_sector="1" value="0" what="test"/></patches>"#,
        )
        .unwrap();
        fs::write(&third, r#"<data></data>"#).unwrap();

        let mut session = Session::new();
        session.load(&first).unwrap();
        session.load(&second).unwrap();
        session.load(&third).unwrap();

        let kinds = session
            .artifacts()
            .iter()
            .map(|a| a.kind)
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec![Kind::Program, Kind::Patch, Kind::Program]);
        assert_eq!(session.artifacts()[0].path, first);
        assert_eq!(session.artifacts()[1].path, second);
    }
}
