//! Download planner and listing.
//!
//! A download is served either as the full pack at the target version or
//! as the concatenation of stored update packs walking the version map
//! from the client's version to the target. Any anomaly mid-walk (missing
//! pack, empty decode, cumulative size past the full pack) abandons the
//! delta and falls back to the full pack; the client still gets a valid
//! payload.

use std::path::PathBuf;

use crate::document::Document;
use crate::fs;
use crate::pack;
use crate::store;
use crate::version::{Version, VersionMap};

use super::{Reply, Server, error_doc, unix_now};

pub(super) fn handle_request_campaign_list(server: &Server, req: &Document) -> Reply {
    tracing::info!("sending add-ons list");

    let now = unix_now() as i64;
    let mut list = Document::new();
    list.set_attr("timestamp", now.to_string());
    let epoch = if req.attr_or_empty("times_relative_to") == "now" {
        now
    } else {
        0
    };

    let before = req
        .attr("before")
        .filter(|v| !v.is_empty())
        .map(|v| epoch + v.parse::<i64>().unwrap_or(0));
    let after = req
        .attr("after")
        .filter(|v| !v.is_empty())
        .map(|v| epoch + v.parse::<i64>().unwrap_or(0));

    let name_filter = req.attr_or_empty("name");
    let lang_filter = req.attr_or_empty("language");

    for (id, meta) in server.store.iter() {
        if !name_filter.is_empty() && name_filter != id {
            continue;
        }
        if store::is_hidden(meta) {
            continue;
        }

        let timestamp = meta.attr("timestamp").filter(|v| !v.is_empty());
        if let Some(before) = before {
            match timestamp {
                Some(t) if t.parse::<i64>().unwrap_or(0) < before => {}
                _ => continue,
            }
        }
        if let Some(after) = after {
            match timestamp {
                Some(t) if t.parse::<i64>().unwrap_or(0) > after => {}
                _ => continue,
            }
        }

        if !lang_filter.is_empty() {
            // Entries without a supported flag predate catalogue
            // detection and count as supported.
            let found = meta.children("translation").any(|t| {
                t.attr_or_empty("language") == lang_filter && t.attr_bool("supported", true)
            });
            if !found {
                continue;
            }
        }

        let mut entry = meta.clone();

        // Strip attributes that are sensitive or irrelevant to clients.
        entry.remove_attrs(store::SENSITIVE_ATTRS);

        // Deliver a computed feedback_url, or an empty value in case
        // clients assume its presence; the raw params stay private.
        let url = entry
            .child("feedback")
            .map(|params| format_feedback_url(&server.config.feedback_url_format, params))
            .unwrap_or_default();
        entry.set_attr("feedback_url", url);
        entry.clear_children("feedback");

        // Update pack bookkeeping is internal.
        entry.clear_children("update_pack");

        list.append_child("campaign", entry);
    }

    let mut response = Document::new();
    response.append_child("campaigns", list);
    Reply::Doc(response)
}

/// Substitutes `$key` tokens in the configured format with the add-on's
/// feedback parameters. Unresolved tokens yield an empty URL.
fn format_feedback_url(format: &str, params: &Document) -> String {
    if format.is_empty() || params.attrs().count() == 0 {
        return String::new();
    }
    let mut url = format.to_string();
    for (key, value) in params.attrs() {
        url = url.replace(&format!("${key}"), value);
    }
    if url.contains('$') {
        return String::new();
    }
    url
}

pub(super) fn handle_request_campaign(server: &mut Server, req: &Document, addr: &str) -> Reply {
    let name = req.attr_or_empty("name").to_string();
    let size_limit = server.config.document_size_limit;

    // Planning only borrows the store; download accounting below mutates.
    let planned = {
        let Some(addon) = server.store.get(&name).filter(|a| !store::is_hidden(a)) else {
            return Reply::Doc(error_doc(&format!("Add-on '{name}' not found.")));
        };

        let version_map = VersionMap::from_metadata(addon);
        if version_map.is_empty() {
            return Reply::Doc(error_doc(&format!(
                "No versions of the add-on '{name}' are available on the server."
            )));
        }

        let from = req.attr_or_empty("from_version").to_string();
        // Base the payload on the latest version when none is requested.
        let to = req
            .attr("version")
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| version_map.latest().map(|r| r.version.clone()))
            .unwrap_or_default();

        // The target must exist exactly; there is no fuzzy resolution here.
        let Some(to_record) = version_map.get(&Version::parse(&to)) else {
            return Reply::Doc(error_doc(&format!(
                "Could not find requested version {to} of the addon '{name}'."
            )));
        };

        let addon_dir = server.store.addon_dir(addon);
        let full_pack_path = addon_dir.join(&to_record.filename);
        let full_pack_size = fs::file_size(&full_pack_path);

        let delta = (!from.is_empty() && version_map.contains(&Version::parse(&from)))
            .then(|| {
                plan_delta(
                    addon,
                    &version_map,
                    &addon_dir,
                    &name,
                    &from,
                    &to,
                    full_pack_size,
                    size_limit,
                )
            })
            .flatten();

        match delta {
            Some(delta) => {
                tracing::info!("sending add-on '{name}' version: {from} -> {to} (delta)");
                Ok((Reply::Doc(delta), from))
            }
            None => match full_pack_size {
                Some(size) => {
                    tracing::info!(
                        "sending add-on '{name}' version: {to} size: {} KiB",
                        size / 1024
                    );
                    Ok((Reply::File(full_pack_path), from))
                }
                None => Err(format!("Add-on '{name}' could not be read by the server.")),
            },
        }
    };

    let (reply, from) = match planned {
        Ok(planned) => planned,
        Err(message) => return Reply::Doc(error_doc(&message)),
    };

    // Clients doing upgrades or mirror runs don't bump the download
    // count; neither do stats-exempt addresses.
    if from.is_empty()
        && req.attr_bool("increase_downloads", true)
        && !server.ignore_address_stats(addr)
    {
        if let Some(meta) = server.store.get_mut(&name) {
            meta.set_attr("downloads", (1 + meta.attr_i64("downloads", 0)).to_string());
            server.store.mark_dirty(&name);
        }
    }

    reply
}

/// Walks `(from, to]` pairwise, concatenating the stored update packs.
/// Returns `None` when anything forces the full-pack fallback.
#[allow(clippy::too_many_arguments)]
fn plan_delta(
    addon: &Document,
    version_map: &VersionMap,
    addon_dir: &std::path::Path,
    name: &str,
    from: &str,
    to: &str,
    full_pack_size: Option<u64>,
    size_limit: usize,
) -> Option<Document> {
    let entries: Vec<_> = version_map.iter().collect();
    let from_key = Version::parse(from);
    let to_key = Version::parse(to);
    let from_idx = entries.iter().position(|(v, _)| **v == from_key)?;
    let to_idx = entries.iter().position(|(v, _)| **v == to_key)?;

    if to_idx <= from_idx {
        tracing::error!(
            "bad update sequence bounds in version {from} -> {to} update sequence for the \
             add-on '{name}', sending a full pack instead"
        );
        return None;
    }

    let mut delta = Document::new();
    let mut delivery_size: u64 = 0;

    for step in from_idx..to_idx {
        let prev = entries[step].1;
        let next = entries[step + 1].1;

        let Some(pack_info) = addon.children("update_pack").find(|p| {
            p.attr_or_empty("from") == prev.version && p.attr_or_empty("to") == next.version
        }) else {
            tracing::warn!(
                "missing update pack from version {} to {} for the add-on '{name}', \
                 sending a full pack instead",
                prev.version,
                next.version
            );
            return None;
        };
        // Expired packs linger on disk until the next upload removes
        // them, but they are never served.
        if pack_info.attr_u64("expire", u64::MAX) < unix_now() {
            tracing::warn!(
                "update pack from version {} to {} for the add-on '{name}' has expired, \
                 sending a full pack instead",
                prev.version,
                next.version
            );
            return None;
        }
        let pack_path = addon_dir.join(pack_info.attr_or_empty("filename"));

        match pack::read_pack(&pack_path, size_limit) {
            Ok(step_delta) if !step_delta.is_empty() => {
                delivery_size += fs::file_size(&pack_path).unwrap_or(0);
                delta.append(step_delta);
            }
            _ => {
                tracing::warn!(
                    "broken update sequence from version {from} to {to} for the add-on \
                     '{name}', sending a full pack instead"
                );
                return None;
            }
        }

        // No point in sending an overlarge delta update.
        if let Some(full_size) = full_pack_size {
            if full_size > 0 && delivery_size > full_size {
                return None;
            }
        }
    }

    (!delta.is_empty()).then_some(delta)
}

pub(super) fn handle_request_campaign_hash(server: &Server, req: &Document) -> Reply {
    let name = req.attr_or_empty("name").to_string();

    let Some(addon) = server.store.get(&name).filter(|a| !store::is_hidden(a)) else {
        return Reply::Doc(error_doc(&format!("Add-on '{name}' not found.")));
    };

    let version_map = VersionMap::from_metadata(addon);
    if version_map.is_empty() {
        return Reply::Doc(error_doc(&format!(
            "No versions of the add-on '{name}' are available on the server."
        )));
    }

    // Unlike the pack download, the index request resolves fuzzily: exact
    // match, else the nearest older version, else the oldest known.
    let requested = req.attr_or_empty("version");
    let record = if requested.is_empty() {
        version_map.latest()
    } else {
        let parsed = Version::parse(requested);
        version_map
            .get(&parsed)
            .or_else(|| version_map.nearest_older(&parsed))
            .or_else(|| version_map.first())
    };
    let Some(record) = record else {
        return Reply::Doc(error_doc(&format!(
            "No versions of the add-on '{name}' are available on the server."
        )));
    };

    let path: PathBuf = server
        .store
        .addon_dir(addon)
        .join(pack::index_from_pack_filename(&record.filename));
    let Some(size) = fs::file_size(&path) else {
        return Reply::Doc(error_doc(&format!(
            "Missing index file for the add-on '{name}'."
        )));
    };

    tracing::info!("sending add-on hash index for '{name}' size: {} KiB", size / 1024);
    Reply::File(path)
}
