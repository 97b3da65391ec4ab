use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error codes returned by the session, its filters and the pid/packet API.
///
/// `EndOfStream` is not a failure: it is the terminal, expected state of a pid
/// or a filter and is what `FilterImpl::process` returns once a filter is done.
#[derive(Error, Debug)]
pub enum Error {
    #[error("End of stream")]
    EndOfStream,

    #[error("Out of memory")]
    OutOfMemory,

    /// Contract violation by the caller.
    #[error("Bad parameter: {0}")]
    BadParam(String),

    /// Format or capability mismatch, typically returned by `configure_pid`.
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Non-compliant bitstream: {0}")]
    NonCompliantBitstream(String),

    #[error("Filter not found: {0}")]
    FilterNotFound(String),

    #[error("Session thread exited")]
    SessionThreadExited,

    /// Opaque failure reported by a concrete filter.
    #[error("Filter error: {0}")]
    Filter(String),
}

impl Error {
    pub fn is_eos(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eos_is_not_reported_as_failure_kind() {
        assert!(Error::EndOfStream.is_eos());
        assert!(!Error::OutOfMemory.is_eos());
        assert!(!Error::NotSupported("pcm".into()).is_eos());
    }

    #[test]
    fn io_errors_convert() {
        fn open() -> Result<()> {
            Err(std::io::Error::from(std::io::ErrorKind::NotFound))?;
            Ok(())
        }
        assert!(matches!(open(), Err(Error::Io(_))));
    }

    #[test]
    fn messages_carry_context() {
        let e = Error::BadParam("range 4..12 exceeds packet size 8".into());
        assert_eq!(e.to_string(), "Bad parameter: range 4..12 exceeds packet size 8");
    }
}
