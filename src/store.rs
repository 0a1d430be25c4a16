//! Add-on store: in-memory metadata index plus disk reconciliation.
//!
//! The store owns one metadata document per add-on, keyed by canonical id,
//! and a dirty set of ids whose `addon.cfg` has not been flushed yet. All
//! disk mutation goes through atomic commits; the in-memory entry is only
//! updated after the on-disk state is durable.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::auth;
use crate::document::{Document, DocumentError};
use crate::fs::{self, AtomicFile};
use crate::pack;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to load add-on metadata from {path}: {source}")]
    Metadata {
        path: PathBuf,
        source: DocumentError,
    },

    #[error("legacy migration failed for '{id}': {reason}")]
    Migration { id: String, reason: String },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Attributes a metadata document must never expose to clients.
pub const SENSITIVE_ATTRS: &[&str] = &["passphrase", "passhash", "passsalt", "upload_ip", "email"];

pub struct AddonStore {
    root: PathBuf,
    addons: BTreeMap<String, Document>,
    dirty: BTreeSet<String>,
}

impl AddonStore {
    /// An empty store rooted at the server directory. `load` scans disk.
    pub fn open(root: impl Into<PathBuf>) -> AddonStore {
        AddonStore {
            root: root.into(),
            addons: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Absolute directory of an add-on, from its `filename` path stem.
    pub fn addon_dir(&self, meta: &Document) -> PathBuf {
        self.root.join(meta.attr_or_empty("filename"))
    }

    /// Scans `data/` and replaces the in-memory index. A subdirectory
    /// without a readable `addon.cfg` is a fatal load error.
    pub fn load(&mut self) -> Result<(), StoreError> {
        self.addons.clear();
        let data_dir = self.data_dir();
        std::fs::create_dir_all(&data_dir).map_err(io_err(&data_dir))?;

        let entries = std::fs::read_dir(&data_dir).map_err(io_err(&data_dir))?;
        for entry in entries {
            let entry = entry.map_err(io_err(&data_dir))?;
            if !entry.path().is_dir() {
                continue;
            }
            let cfg_path = entry.path().join("addon.cfg");
            let meta = Document::read_file(&cfg_path).map_err(|source| StoreError::Metadata {
                path: cfg_path.clone(),
                source,
            })?;
            let id = meta.attr_or_empty("name").to_string();
            if id.is_empty() {
                return Err(StoreError::Metadata {
                    path: cfg_path,
                    source: DocumentError::Parse {
                        line: 0,
                        reason: "metadata has no name".to_string(),
                    },
                });
            }
            self.addons.insert(id, meta);
        }
        tracing::info!(count = self.addons.len(), "loaded add-on metadata");
        Ok(())
    }

    /// Converts legacy single-file add-ons from a `[campaigns]` block into
    /// the per-directory layout. Migration is atomic per add-on: the new
    /// directory is written in full before the legacy file is removed, so
    /// a crash leaves either the old file intact or the migration complete.
    pub fn migrate_legacy(
        &mut self,
        campaigns: &Document,
        compress_level: u32,
        size_limit: usize,
    ) -> Result<(), StoreError> {
        let count = campaigns.children("campaign").count();
        tracing::warn!(count, "legacy add-ons detected, converting to the directory layout");

        for campaign in campaigns.children("campaign") {
            let id = campaign.attr_or_empty("name").to_string();
            let legacy_file = self.root.join(campaign.attr_or_empty("filename"));
            let migration_err = |reason: String| StoreError::Migration {
                id: id.clone(),
                reason,
            };

            if self.addons.contains_key(&id) {
                return Err(migration_err(
                    "already exists in the directory layout".to_string(),
                ));
            }
            if !legacy_file.is_file() {
                return Err(migration_err(format!(
                    "legacy content file {} not found",
                    legacy_file.display()
                )));
            }

            let mut content = Document::read_gz_file(&legacy_file, size_limit)
                .map_err(|e| migration_err(format!("unreadable content file: {e}")))?;
            if content.is_empty() {
                return Err(migration_err("empty content file".to_string()));
            }

            let version = campaign.attr_or_empty("version").to_string();
            let mut meta = campaign.clone();
            meta.set_attr("filename", format!("data/{id}"));
            let record = meta.add_child("version");
            record.set_attr("version", &version);
            record.set_attr("filename", pack::full_pack_filename(&version));

            content.remove_attrs(&[
                "title",
                "campaign_name",
                "author",
                "description",
                "version",
                "timestamp",
                "original_timestamp",
                "icon",
                "type",
                "tags",
            ]);

            // The legacy path and the new directory may be the same name;
            // the content is already safely in memory, so step the file
            // aside before the directory is created.
            let addon_dir = self.addon_dir(&meta);
            if legacy_file == addon_dir {
                fs::delete_file(&legacy_file).map_err(io_err(&legacy_file))?;
            }

            let pack_path = addon_dir.join(pack::full_pack_filename(&version));
            let index_path = addon_dir.join(pack::index_filename(&version));
            pack::write_full_pack(&mut content, &pack_path, compress_level)
                .map_err(|e| migration_err(format!("failed to write full pack: {e}")))?;
            pack::write_index(&content, &index_path, compress_level)
                .map_err(|e| migration_err(format!("failed to write index: {e}")))?;
            write_metadata(&addon_dir, &meta).map_err(io_err(&addon_dir))?;

            fs::delete_file(&legacy_file).map_err(io_err(&legacy_file))?;

            self.addons.insert(id.clone(), meta);
            self.dirty.insert(id);
        }
        tracing::info!("legacy add-on processing finished");
        Ok(())
    }

    /// Hashes any remaining cleartext passphrases and clears them.
    pub fn migrate_passphrases(&mut self) {
        for (id, meta) in &mut self.addons {
            let passphrase = meta.attr_or_empty("passphrase").to_string();
            if passphrase.is_empty() {
                continue;
            }
            tracing::info!(
                title = meta.attr_or_empty("title"),
                "add-on uses an unhashed passphrase, fixing"
            );
            set_passphrase(meta, &passphrase);
            meta.set_attr("passphrase", "");
            self.dirty.insert(id.clone());
        }
    }

    // ---- lookup ----

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.addons.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Document> {
        self.addons.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Document)> {
        self.addons.iter().map(|(id, meta)| (id.as_str(), meta))
    }

    /// The stored id colliding with `name` under lowercase folding, if any.
    pub fn find_case_insensitive(&self, name: &str) -> Option<&str> {
        let folded = name.to_lowercase();
        self.addons
            .keys()
            .find(|id| id.to_lowercase() == folded)
            .map(String::as_str)
    }

    pub fn insert(&mut self, id: impl Into<String>, meta: Document) -> &mut Document {
        let id = id.into();
        self.addons.insert(id.clone(), meta);
        self.addons.get_mut(&id).expect("just inserted")
    }

    // ---- persistence ----

    pub fn mark_dirty(&mut self, id: &str) {
        self.dirty.insert(id.to_string());
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Flushes every dirty add-on's `addon.cfg`, then clears the dirty set.
    pub fn write_dirty(&mut self) -> Result<(), StoreError> {
        for id in &self.dirty {
            let Some(meta) = self.addons.get(id) else {
                continue;
            };
            if meta.attr_or_empty("filename").is_empty() {
                continue;
            }
            let dir = self.addon_dir(meta);
            write_metadata(&dir, meta).map_err(io_err(&dir))?;
        }
        self.dirty.clear();
        Ok(())
    }

    /// Removes the add-on's directory tree and drops the entry. Returns the
    /// metadata that was removed, or `None` for an unknown id.
    pub fn delete(&mut self, id: &str) -> Result<Option<Document>, StoreError> {
        let Some(meta) = self.addons.get(id) else {
            return Ok(None);
        };
        let dir = self.addon_dir(meta);
        if meta.attr_or_empty("filename").is_empty() {
            tracing::error!(id, "add-on has no associated filename, cannot delete its files");
        } else {
            fs::delete_directory(&dir).map_err(io_err(&dir))?;
        }
        self.dirty.remove(id);
        Ok(self.addons.remove(id))
    }
}

fn write_metadata(addon_dir: &Path, meta: &Document) -> std::io::Result<()> {
    let mut out = AtomicFile::open(addon_dir.join("addon.cfg"))?;
    out.write_all(meta.render().as_bytes())?;
    out.commit()
}

// ---- authorship authentication ----

/// Verifies a passphrase against the `passsalt`/`passhash` attributes.
pub fn authenticate(meta: &Document, passphrase: &str) -> bool {
    auth::verify_passphrase(
        passphrase,
        meta.attr_or_empty("passsalt"),
        meta.attr_or_empty("passhash"),
    )
}

/// Writes a fresh salt and hash into the metadata.
pub fn set_passphrase(meta: &mut Document, passphrase: &str) {
    let (salt, hash) = auth::generate_hash(passphrase);
    meta.set_attr("passsalt", salt);
    meta.set_attr("passhash", hash);
}

pub fn is_hidden(meta: &Document) -> bool {
    meta.attr_bool("hidden", false)
}
