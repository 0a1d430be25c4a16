//! Server configuration (`server.cfg`).
//!
//! The raw document is retained alongside the typed view so that unknown
//! keys and the legacy `[campaigns]` block survive a rewrite. A few values
//! are saved back into the document on load so a given server instance's
//! parameters stay constant even if the code defaults change later; the
//! listening port is deliberately not one of them.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::document::{Document, DocumentError};
use crate::fs::AtomicFile;

pub const DEFAULT_PORT: u16 = 15003;
pub const DEFAULT_COMPRESS_LEVEL: u32 = 6;
/// One month.
pub const DEFAULT_UPDATE_PACK_LIFESPAN: u64 = 30 * 24 * 60 * 60;
/// An add-on arrives as a single document, so this bounds upload size too.
pub const DEFAULT_DOCUMENT_SIZE_LIMIT: usize = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: DocumentError,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::Read { .. } | ConfigError::Write { .. } => 1,
            ConfigError::Parse { .. } => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    path: PathBuf,
    doc: Document,
    pub port: u16,
    pub read_only: bool,
    pub compress_level: u32,
    pub update_pack_lifespan: u64,
    pub blacklist_file: String,
    pub stats_exempt_ips: Vec<String>,
    pub hook_post_upload: String,
    pub hook_post_erase: String,
    pub control_socket: String,
    pub document_size_limit: usize,
    pub feedback_url_format: String,
}

impl ServerConfig {
    pub fn load(path: impl Into<PathBuf>) -> Result<ServerConfig, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let doc = Document::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok(Self::from_document(path, doc))
    }

    fn from_document(path: PathBuf, mut doc: Document) -> ServerConfig {
        let port = doc
            .attr("port")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let read_only = doc.attr_bool("read_only", false);
        // Compression levels above 6 are a waste of CPU cycles.
        let compress_level = doc
            .attr("compress_level")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_COMPRESS_LEVEL)
            .min(9);
        let update_pack_lifespan =
            doc.attr_u64("update_pack_lifespan", DEFAULT_UPDATE_PACK_LIFESPAN);
        let document_size_limit = doc
            .attr("document_size_limit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DOCUMENT_SIZE_LIMIT);
        let stats_exempt_ips = doc
            .attr_or_empty("stats_exempt_ips")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        doc.set_attr("compress_level", compress_level.to_string());

        ServerConfig {
            port,
            read_only,
            compress_level,
            update_pack_lifespan,
            blacklist_file: doc.attr_or_empty("blacklist_file").to_string(),
            stats_exempt_ips,
            hook_post_upload: doc.attr_or_empty("hook_post_upload").to_string(),
            hook_post_erase: doc.attr_or_empty("hook_post_erase").to_string(),
            control_socket: doc.attr_or_empty("control_socket").to_string(),
            document_size_limit,
            feedback_url_format: doc.attr_or_empty("feedback_url_format").to_string(),
            path,
            doc,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_read_only(&mut self, value: bool) {
        self.read_only = value;
        self.doc.set_attr("read_only", if value { "true" } else { "false" });
    }

    /// Moves the legacy `[campaigns]` block out of the document, if present.
    /// The block is gone from subsequent rewrites.
    pub fn take_legacy_campaigns(&mut self) -> Option<Document> {
        self.doc.take_child("campaigns")
    }

    /// Atomically rewrites the config file.
    pub fn write(&self) -> Result<(), ConfigError> {
        let map_err = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };
        let mut out = AtomicFile::open(&self.path).map_err(map_err)?;
        out.write_all(self.doc.render().as_bytes()).map_err(map_err)?;
        out.commit().map_err(map_err)
    }
}
