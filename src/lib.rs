#![forbid(unsafe_code)]

pub mod auth;
pub mod blacklist;
pub mod config;
pub mod digest;
pub mod document;
pub mod error;
pub mod fs;
pub mod pack;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod version;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers touch at crate root for convenience
pub use crate::document::{Document, DocumentError};
pub use crate::server::{Reply, Request, Server};
pub use crate::version::{Version, VersionMap};
