//! Upload pipeline.
//!
//! After validation, an upload either carries a complete content tree
//! (`data`) or a delta (`removelist`/`addlist`) against a previous
//! version. Both paths converge on a new full pack: metadata is updated,
//! the pack and its hash index are committed, stale update packs are
//! expired, and any missing update pack between consecutive versions is
//! back-filled from the stored full packs.

use crate::document::Document;
use crate::fs;
use crate::pack;
use crate::store;
use crate::version::{Version, VersionMap, VersionRecord};

use super::validate::{self, AddonCheckStatus};
use super::{Reply, Server, error_doc_status, message_doc, unix_now};

pub(super) fn handle_upload(server: &mut Server, mut upload: Document, addr: &str) -> Reply {
    let upload_ts = unix_now();
    let name = upload.attr_or_empty("name").to_string();
    tracing::info!("validating add-on '{name}'");

    let validated = match validate::validate_upload(server, &upload, addr) {
        Ok(validated) => validated,
        Err((status, extra_data)) => {
            tracing::info!("upload of '{name}' aborted due to a failed validation check");
            let message = format!("Add-on rejected: {}.", status.describe());
            return Reply::Doc(error_doc_status(&message, &extra_data, status));
        }
    };

    tracing::info!("processing add-on '{name}'");

    // Move the pack trees out of the upload instead of deep-copying them;
    // they dominate the document's size.
    let data = upload.take_child("data");
    let removelist = upload.take_child("removelist");
    let addlist = upload.take_child("addlist");

    let is_delta = validated.is_delta;
    let is_existing = validated.existing_id.is_some();
    // Case changes in the id of an existing add-on do not rename it.
    let id = validated.existing_id.unwrap_or_else(|| name.clone());

    tracing::info!(
        "upload type: {}, {}",
        if is_delta { "delta" } else { "full" },
        if is_existing { "update" } else { "new" }
    );

    let compress_level = server.config.compress_level;
    let size_limit = server.config.document_size_limit;
    let lifespan = server.config.update_pack_lifespan;
    let pathstem = format!("data/{id}");
    let addon_dir = server.store.root().join(&pathstem);

    let server_error = |message: &str| {
        Reply::Doc(error_doc_status(
            message,
            "",
            AddonCheckStatus::ServerUnspecified,
        ))
    };

    if !is_existing {
        let mut fresh = Document::new();
        fresh.set_attr("original_timestamp", upload_ts.to_string());
        server.store.insert(id.clone(), fresh);
    }
    let Some(meta) = server.store.get_mut(&id) else {
        return server_error("Server error: add-on entry disappeared.");
    };

    // General metadata attributes.

    meta.copy_attrs(
        &upload,
        &[
            "title",
            "name",
            "author",
            "description",
            "version",
            "icon",
            "translate",
            "dependencies",
            "type",
            "tags",
            "email",
        ],
    );
    meta.set_attr("name", &id);
    meta.set_attr("filename", &pathstem);
    meta.set_attr("upload_ip", addr);
    if !is_existing {
        store::set_passphrase(meta, upload.attr_or_empty("passphrase"));
    }
    if !meta.has_attr("downloads") {
        meta.set_attr("downloads", "0");
    }
    meta.set_attr("timestamp", upload_ts.to_string());
    meta.set_attr("uploads", (1 + meta.attr_i64("uploads", 0)).to_string());

    meta.clear_children("feedback");
    if let Some(feedback) = upload.child("feedback") {
        if !feedback.is_empty() {
            meta.append_child("feedback", feedback.clone());
        }
    }

    // Declared locales start unsupported; catalogue detection below flips
    // the ones the pack actually ships.
    meta.clear_children("translation");
    for locale in upload.children("translation") {
        let language = locale.attr_or_empty("language");
        if language.is_empty() {
            continue;
        }
        let entry = meta.add_child("translation");
        entry.set_attr("language", language);
        entry.set_attr("supported", "false");
        for key in ["title", "description"] {
            if let Some(value) = locale.attr(key).filter(|v| !v.is_empty()) {
                entry.set_attr(key, value);
            }
        }
    }

    // Versioning.

    let new_version = meta.attr_or_empty("version").to_string();
    let mut version_map = VersionMap::from_metadata(meta);

    let mut full = if !is_delta {
        data.unwrap_or_default()
    } else {
        // Rebuild the full tree by applying the delta to the version the
        // client diffed against, or the nearest thing we have to it.
        if version_map.is_empty() {
            tracing::error!("add-on '{id}' has an empty version table, this should not happen");
            return Reply::Doc(error_doc_status(
                "Server error: Cannot process update pack with an empty version table.",
                "",
                AddonCheckStatus::ServerDeltaNoVersions,
            ));
        }

        let from = upload.attr_or_empty("from");
        let prev_record = if from.is_empty() {
            version_map.latest()
        } else {
            let parsed = Version::parse(from);
            version_map
                .get(&parsed)
                .or_else(|| version_map.nearest_older(&parsed))
                .or_else(|| version_map.latest())
        };
        let Some(prev_record) = prev_record.cloned() else {
            return server_error("Server error: Previous version disappeared.");
        };
        let prev_version = prev_record.version.clone();

        // Drop any update pack already targeting the new version; this
        // matters when the same version number is uploaded repeatedly.
        let stale: Vec<String> = meta
            .children("update_pack")
            .filter(|p| p.attr_or_empty("to") == new_version)
            .map(|p| p.attr_or_empty("filename").to_string())
            .collect();
        for filename in &stale {
            if let Err(e) = fs::delete_file(&addon_dir.join(filename)) {
                tracing::error!("failed to delete stale update pack {filename}: {e}");
            }
        }
        meta.remove_children("update_pack", |p| {
            stale.iter().any(|f| f.as_str() == p.attr_or_empty("filename"))
        });

        // Persist the client's delta as an update pack.
        let pack_filename = pack::update_pack_filename(&prev_version, &new_version);
        tracing::info!("saving provided update pack for {prev_version} -> {new_version}");

        let mut delta_doc = Document::new();
        delta_doc.append_child("removelist", removelist.unwrap_or_default());
        delta_doc.append_child("addlist", addlist.unwrap_or_default());
        if let Err(e) = pack::write_pack(&delta_doc, &addon_dir.join(&pack_filename), compress_level)
        {
            tracing::error!("failed to write update pack for '{id}': {e}");
            return server_error("Server error: could not store the update pack.");
        }
        let info = meta.add_child("update_pack");
        info.set_attr("from", &prev_version);
        info.set_attr("to", &new_version);
        info.set_attr("expire", (upload_ts + lifespan).to_string());
        info.set_attr("filename", &pack_filename);

        let prev_path = addon_dir.join(&prev_record.filename);
        let mut full = match pack::read_pack(&prev_path, size_limit) {
            Ok(full) => full,
            Err(e) => {
                tracing::error!("previous full pack for '{id}' is unreadable: {e}");
                return server_error("Server error: Previous version disappeared.");
            }
        };
        if let Some(rl) = delta_doc.child("removelist") {
            pack::apply_removelist(&mut full, rl);
        }
        if let Some(al) = delta_doc.child("addlist") {
            pack::apply_addlist(&mut full, al);
        }
        full
    };

    // Catalogue detection and default license.

    pack::find_translations(&full, meta);
    pack::add_license(&mut full);

    // Update the version map, replacing any identical existing version.

    let record = VersionRecord {
        version: new_version.clone(),
        filename: pack::full_pack_filename(&new_version),
    };
    meta.remove_children("version", |old| old.attr_or_empty("version") == new_version);
    version_map.insert(record.clone());
    let entry = meta.add_child("version");
    entry.set_attr("version", &new_version);
    entry.set_attr("filename", &record.filename);

    // Commit the full pack and its index, then record the payload size.

    let full_pack_path = addon_dir.join(&record.filename);
    let index_path = addon_dir.join(pack::index_filename(&new_version));
    if let Err(e) = pack::write_full_pack(&mut full, &full_pack_path, compress_level) {
        tracing::error!("failed to write full pack for '{id}': {e}");
        return server_error("Server error: could not store the add-on.");
    }
    if let Err(e) = pack::write_index(&full, &index_path, compress_level) {
        tracing::error!("failed to write hash index for '{id}': {e}");
        return server_error("Server error: could not store the add-on.");
    }
    meta.set_attr("size", fs::file_size(&full_pack_path).unwrap_or(0).to_string());

    // Expire old update packs.

    let expired: Vec<String> = meta
        .children("update_pack")
        .filter(|p| {
            upload_ts > p.attr_u64("expire", 0)
                || p.attr_or_empty("from") == new_version
                || (!is_delta && p.attr_or_empty("to") == new_version)
        })
        .map(|p| {
            tracing::info!(
                "expiring update pack for {} -> {}",
                p.attr_or_empty("from"),
                p.attr_or_empty("to")
            );
            p.attr_or_empty("filename").to_string()
        })
        .collect();
    for filename in &expired {
        if let Err(e) = fs::delete_file(&addon_dir.join(filename)) {
            tracing::error!("failed to delete expired update pack {filename}: {e}");
        }
    }
    meta.remove_children("update_pack", |p| {
        expired.iter().any(|f| f.as_str() == p.attr_or_empty("filename"))
    });

    // Back-fill missing update packs between consecutive versions; this
    // covers versions whose uploaders never sent deltas themselves.

    let pairs: Vec<(VersionRecord, VersionRecord)> = version_map
        .pairs()
        .map(|(a, b)| (a.clone(), b.clone()))
        .collect();
    for (prev, next) in pairs {
        let covered = meta.children("update_pack").any(|p| {
            p.attr_or_empty("from") == prev.version && p.attr_or_empty("to") == next.version
        });
        if covered {
            continue;
        }

        tracing::info!(
            "automatically generating update pack for {} -> {}",
            prev.version,
            next.version
        );

        let prev_path = addon_dir.join(&prev.filename);
        let next_path = addon_dir.join(&next.filename);
        if fs::file_size(&prev_path).unwrap_or(0) == 0 || fs::file_size(&next_path).unwrap_or(0) == 0
        {
            tracing::error!(
                "unable to generate an update pack for '{id}' from {} to {}",
                prev.version,
                next.version
            );
            continue;
        }

        let (from_full, to_full) = match (
            pack::read_pack(&prev_path, size_limit),
            pack::read_pack(&next_path, size_limit),
        ) {
            (Ok(a), Ok(b)) => (a, b),
            (a, b) => {
                let e = a.err().or(b.err()).map(|e| e.to_string()).unwrap_or_default();
                tracing::error!(
                    "unable to read full packs for '{id}' {} -> {}: {e}",
                    prev.version,
                    next.version
                );
                continue;
            }
        };

        let (rl, al) = pack::make_updatepack(&from_full, &to_full);
        let mut pack_doc = Document::new();
        pack_doc.append_child("removelist", rl);
        pack_doc.append_child("addlist", al);

        let filename = pack::update_pack_filename(&prev.version, &next.version);
        if let Err(e) = pack::write_pack(&pack_doc, &addon_dir.join(&filename), compress_level) {
            tracing::error!("failed to write generated update pack {filename}: {e}");
            continue;
        }
        let info = meta.add_child("update_pack");
        info.set_attr("from", &prev.version);
        info.set_attr("to", &next.version);
        info.set_attr("expire", (upload_ts + lifespan).to_string());
        info.set_attr("filename", &filename);
    }

    server.store.mark_dirty(&id);
    if let Err(e) = server.write_config() {
        tracing::error!("flush after upload of '{id}' failed: {e}");
    }

    tracing::info!("finished uploading add-on '{id}'");
    server.fire_hook_post_upload(&id);
    Reply::Doc(message_doc("Add-on accepted."))
}
