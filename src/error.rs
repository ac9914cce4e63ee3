use thiserror::Error;

pub use color_eyre::eyre::eyre;

use crate::protocol::response::{ErrPayload, ErrPayloadBytes};

pub type Result<T> = core::result::Result<T, Error>;

/// The five error categories from the failure taxonomy.
///
/// `Protocol`/`ShortFrame`/`SequenceMismatch` and `Auth` are fatal to the
/// owning backend connection. `Sql` is per-request and does not
/// invalidate the connection. `Execution` originates inside the fan-out
/// engine, unrelated to any database. `Crypto` is a bootstrap failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("short frame: expected {expected} bytes, got {got}")]
    ShortFrame { expected: usize, got: usize },

    #[error("sequence id mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u8, got: u8 },

    #[error("authentication failed: {0}")]
    Auth(ErrPayload),

    #[error("server returned an error during command phase: {0}")]
    Sql(#[from] ErrPayload),

    #[error("execution engine error: {0}")]
    Execution(String),

    #[error("auth hash algorithm unavailable: {0}")]
    Crypto(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("a bug in sharding-core: {0}")]
    LibraryBug(color_eyre::Report),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn from_debug(err: impl std::fmt::Debug) -> Self {
        Self::LibraryBug(color_eyre::eyre::eyre!(format!("{:#?}", err)))
    }
}

impl<'buf> From<ErrPayloadBytes<'buf>> for Error {
    fn from(value: ErrPayloadBytes) -> Self {
        match ErrPayload::try_from(value) {
            Ok(err_payload) => Error::Sql(err_payload),
            Err(err) => err,
        }
    }
}

impl<Src, Dst: ?Sized> From<zerocopy::CastError<Src, Dst>> for Error {
    fn from(err: zerocopy::CastError<Src, Dst>) -> Self {
        Self::LibraryBug(color_eyre::eyre::eyre!("{:#?}", err))
    }
}
