use thiserror::Error;

use crate::config::ConfigError;
use crate::document::DocumentError;
use crate::server::ProtoError;
use crate::store::StoreError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-module errors; handlers deal with the
/// concrete types, `main` deals with this one for exit-code mapping.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for fatal errors surfaced out of `run()`.
    ///
    /// 1 = config or I/O path error, 2 = bad config file shape,
    /// 4 = internal dispatch error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(e) => e.exit_code(),
            Error::Store(_) => 1,
            Error::Io(_) => 1,
            Error::Document(_) => 2,
            Error::Proto(_) => 4,
        }
    }
}
