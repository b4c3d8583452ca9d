use std::io;

/// Engine error surface.
///
/// Background threads return these from their main loops; the supervisor
/// records the first failure and exposes it through `Wal::pipeline_error`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(&'static str),
    #[error("unsupported on-media version: {0}")]
    UnsupportedVersion(u32),
    #[error("metadata store buffer full")]
    NoBuffers,
    #[error("engine is not running")]
    NotRunning,
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Platform error code for the C-style surface. Never returns zero.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::Config(_) => libc::EINVAL,
            Error::Corrupt(_) => libc::EIO,
            Error::CorruptMetadata(_) => libc::EIO,
            Error::UnsupportedVersion(_) => libc::EINVAL,
            Error::NoBuffers => libc::ENOBUFS,
            Error::NotRunning => libc::EIO,
            Error::Cancelled => libc::ETIMEDOUT,
        }
    }

    /// Best-effort copy for reporting while the original stays recorded.
    /// I/O errors keep their OS code, or their kind and message when no
    /// code is attached.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::Io(err) => match err.raw_os_error() {
                Some(code) => Error::Io(io::Error::from_raw_os_error(code)),
                None => Error::Io(io::Error::new(err.kind(), err.to_string())),
            },
            Error::Config(msg) => Error::Config(*msg),
            Error::Corrupt(msg) => Error::Corrupt(*msg),
            Error::CorruptMetadata(msg) => Error::CorruptMetadata(*msg),
            Error::UnsupportedVersion(version) => Error::UnsupportedVersion(*version),
            Error::NoBuffers => Error::NoBuffers,
            Error::NotRunning => Error::NotRunning,
            Error::Cancelled => Error::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
