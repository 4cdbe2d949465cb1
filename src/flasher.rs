//! Flash session orchestration
//!
//! The [`Flasher`] drives one flashing session end to end: load every
//! artifact before any device contact, acquire the channel, run the
//! bootstrap phase, run the execution phase only if bootstrap succeeded,
//! and restore the channel no matter which phase failed.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::{
    artifact::Session,
    connection::{Channel, DEFAULT_BAUD},
    discovery::DeviceLocator,
    error::Error,
    firehose::Firehose,
    sahara::Sahara,
};

/// The bootstrap protocol phase: loads the boot image into the device,
/// leaving it ready for the execution phase.
pub trait BootstrapEngine<C: Read + Write> {
    fn run(&mut self, channel: &mut C, boot_image: &Path) -> Result<(), Error>;
}

/// The execution protocol phase: consumes the channel and the loaded
/// artifact set.
pub trait ExecutionEngine<C: Read + Write> {
    fn run(&mut self, channel: &mut C, session: &Session) -> Result<(), Error>;
}

/// One flashing session: the artifact set, the designated boot image and
/// the failure policy.
pub struct Flasher {
    session: Session,
    boot_image: PathBuf,
    strict: bool,
    baud: u32,
}

impl Flasher {
    /// `strict` makes an execution-phase failure fail the whole run instead
    /// of being downgraded to a warning.
    pub fn new(boot_image: PathBuf, strict: bool) -> Self {
        Flasher {
            session: Session::new(),
            boot_image,
            strict,
            baud: DEFAULT_BAUD,
        }
    }

    /// Override the line rate the channel is opened at.
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Classify and load all artifacts, in order. Runs before any device
    /// I/O; the first failure aborts with the device untouched.
    pub fn load_artifacts<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<(), Error> {
        for path in paths {
            self.session.load(path.as_ref())?;
        }

        Ok(())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run the full session: acquire the device, bootstrap, execute, and
    /// restore the channel on every path out.
    pub fn run(
        &mut self,
        locator: &DeviceLocator,
        port_override: Option<&str>,
        include: Option<PathBuf>,
    ) -> Result<(), Error> {
        let port_name = match port_override {
            Some(name) => name.to_string(),
            None => locator.locate()?.port_name,
        };

        let mut channel = Channel::open(&port_name, self.baud)?;
        info!("Using serial port {}", channel.port_name());

        let result = run_phases(
            &mut channel,
            &mut Sahara,
            &mut Firehose::new(include),
            &self.boot_image,
            &self.session,
            self.strict,
        );

        channel.restore();

        result
    }
}

/// Sequence the two protocol phases against an open channel.
///
/// Bootstrap failure skips the execution phase; the caller restores the
/// channel in either case. A lenient execution failure is logged and
/// swallowed, a strict one propagates.
fn run_phases<C, B, E>(
    channel: &mut C,
    bootstrap: &mut B,
    execute: &mut E,
    boot_image: &Path,
    session: &Session,
    strict: bool,
) -> Result<(), Error>
where
    C: Read + Write,
    B: BootstrapEngine<C>,
    E: ExecutionEngine<C>,
{
    bootstrap.run(channel, boot_image)?;

    match execute.run(channel, session) {
        Ok(()) => Ok(()),
        Err(err) if strict => Err(err),
        Err(err) => {
            warn!("Execution phase failed: {err}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io, rc::Rc};

    use super::*;

    /// In-memory stand-in for the serial channel.
    struct NullChannel;

    impl Read for NullChannel {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for NullChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct MockBootstrap {
        calls: Rc<RefCell<Vec<&'static str>>>,
        fail: bool,
    }

    impl<C: Read + Write> BootstrapEngine<C> for MockBootstrap {
        fn run(&mut self, _channel: &mut C, _boot_image: &Path) -> Result<(), Error> {
            self.calls.borrow_mut().push("bootstrap");
            if self.fail {
                Err(Error::SaharaImageRejected(0x22))
            } else {
                Ok(())
            }
        }
    }

    struct MockExecute {
        calls: Rc<RefCell<Vec<&'static str>>>,
        fail: bool,
    }

    impl<C: Read + Write> ExecutionEngine<C> for MockExecute {
        fn run(&mut self, _channel: &mut C, _session: &Session) -> Result<(), Error> {
            self.calls.borrow_mut().push("execute");
            if self.fail {
                Err(Error::FirehoseNak("program".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn engines(
        bootstrap_fails: bool,
        execute_fails: bool,
    ) -> (Rc<RefCell<Vec<&'static str>>>, MockBootstrap, MockExecute) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let bootstrap = MockBootstrap {
            calls: calls.clone(),
            fail: bootstrap_fails,
        };
        let execute = MockExecute {
            calls: calls.clone(),
            fail: execute_fails,
        };
        (calls, bootstrap, execute)
    }

    #[test]
    fn baud_defaults_and_overrides() {
        let flasher = Flasher::new(PathBuf::from("prog.mbn"), false);
        assert_eq!(flasher.baud, DEFAULT_BAUD);

        let flasher = flasher.with_baud(921_600);
        assert_eq!(flasher.baud, 921_600);
    }

    #[test]
    fn phases_run_in_order() {
        let (calls, mut bootstrap, mut execute) = engines(false, false);
        let session = Session::new();

        run_phases(
            &mut NullChannel,
            &mut bootstrap,
            &mut execute,
            Path::new("prog.mbn"),
            &session,
            false,
        )
        .unwrap();

        assert_eq!(*calls.borrow(), vec!["bootstrap", "execute"]);
    }

    #[test]
    fn bootstrap_failure_skips_execution() {
        let (calls, mut bootstrap, mut execute) = engines(true, false);
        let session = Session::new();

        let result = run_phases(
            &mut NullChannel,
            &mut bootstrap,
            &mut execute,
            Path::new("prog.mbn"),
            &session,
            false,
        );

        assert!(matches!(result, Err(Error::SaharaImageRejected(_))));
        assert_eq!(*calls.borrow(), vec!["bootstrap"]);
    }

    #[test]
    fn lenient_execution_failure_is_swallowed() {
        let (calls, mut bootstrap, mut execute) = engines(false, true);
        let session = Session::new();

        run_phases(
            &mut NullChannel,
            &mut bootstrap,
            &mut execute,
            Path::new("prog.mbn"),
            &session,
            false,
        )
        .unwrap();

        assert_eq!(*calls.borrow(), vec!["bootstrap", "execute"]);
    }

    #[test]
    fn strict_execution_failure_propagates() {
        let (_, mut bootstrap, mut execute) = engines(false, true);
        let session = Session::new();

        let result = run_phases(
            &mut NullChannel,
            &mut bootstrap,
            &mut execute,
            Path::new("prog.mbn"),
            &session,
            true,
        );

        assert!(matches!(result, Err(Error::FirehoseNak(_))));
    }

    #[test]
    fn load_failure_leaves_session_untouched() {
        let mut flasher = Flasher::new(PathBuf::from("prog.mbn"), false);
        let result = flasher.load_artifacts(&[Path::new("/nonexistent/junk.xml")]);

        assert!(matches!(result, Err(Error::UnknownArtifact(_))));
        assert!(flasher.session().is_empty());
    }
}
