//! Pack codec: full packs, hash indices, delta packs.
//!
//! A content tree is a document whose directories are `[dir]` children with
//! a `name` attribute and whose files are `[file]` children with `name` and
//! `contents` attributes. A full pack is the gzipped content tree at one
//! version; an update pack is a `[removelist]` + `[addlist]` pair carrying
//! one full pack to the next.
//!
//! Child order inside a directory is preserved from the uploader; deltas
//! remove in place and append new entries at the end.

use std::io::Write;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::digest::md5_hex;
use crate::document::{Document, DocumentError};
use crate::fs::AtomicFile;

// ---- filename conventions (bit-exact, see the on-disk format) ----

pub fn full_pack_filename(version: &str) -> String {
    format!("full_pack_{}.gz", md5_hex(version))
}

pub fn index_filename(version: &str) -> String {
    format!("full_pack_{}.hash.gz", md5_hex(version))
}

/// Update pack carrying `from` to `to`; the digest input is the plain
/// concatenation of the two version strings.
pub fn update_pack_filename(from: &str, to: &str) -> String {
    format!("update_pack_{}.gz", md5_hex(format!("{from}{to}")))
}

/// The index counterpart of a full pack filename.
pub fn index_from_pack_filename(pack_filename: &str) -> String {
    match pack_filename.rfind('.') {
        Some(dot) => format!("{}.hash.gz", &pack_filename[..dot]),
        None => pack_filename.to_string(),
    }
}

// ---- gzipped pack i/o ----

/// Gzip-writes a document to `path` through an atomic commit.
pub fn write_pack(doc: &Document, path: &Path, level: u32) -> Result<(), DocumentError> {
    let out = AtomicFile::open(path)?;
    let mut encoder = GzEncoder::new(out, Compression::new(level));
    encoder.write_all(doc.render().as_bytes())?;
    let out = encoder.finish()?;
    out.commit()?;
    Ok(())
}

/// Writes a full pack. The pack root must carry an empty `name` attribute;
/// the directory syntax requires it to be present and empty.
pub fn write_full_pack(doc: &mut Document, path: &Path, level: u32) -> Result<(), DocumentError> {
    doc.set_attr("name", "");
    write_pack(doc, path, level)
}

/// Writes the content-hash index for a full pack: the same directory
/// skeleton with every file's contents replaced by its digest.
pub fn write_index(full: &Document, path: &Path, level: u32) -> Result<(), DocumentError> {
    let mut index = build_hashlist(full);
    index.set_attr("name", "");
    write_pack(&index, path, level)
}

fn build_hashlist(tree: &Document) -> Document {
    let mut out = Document::new();
    if let Some(name) = tree.attr("name") {
        out.set_attr("name", name);
    }
    for (name, child) in tree.all_children() {
        match name {
            "file" => {
                let entry = out.add_child("file");
                entry.set_attr("name", child.attr_or_empty("name"));
                entry.set_attr("contents", md5_hex(child.attr_or_empty("contents")));
            }
            "dir" => out.append_child("dir", build_hashlist(child)),
            _ => {}
        }
    }
    out
}

pub fn read_pack(path: &Path, size_limit: usize) -> Result<Document, DocumentError> {
    Document::read_gz_file(path, size_limit)
}

// ---- delta application ----

/// Deletes every file named in the removelist from the content tree.
/// Directories emptied by the removal are pruned; missing targets are
/// silent no-ops.
pub fn apply_removelist(full: &mut Document, removelist: &Document) {
    for entry in removelist.children("file") {
        let name = entry.attr_or_empty("name");
        full.remove_children("file", |f| f.attr_or_empty("name") == name);
    }
    for entry in removelist.children("dir") {
        let name = entry.attr_or_empty("name");
        if let Some(dir) = full
            .children_mut("dir")
            .find(|d| d.attr_or_empty("name") == name)
        {
            apply_removelist(dir, entry);
        }
        full.remove_children("dir", |d| {
            d.attr_or_empty("name") == name && !has_entries(d)
        });
    }
}

/// Inserts or overwrites every file and directory from the addlist.
/// Conflicts resolve addlist-wins.
pub fn apply_addlist(full: &mut Document, addlist: &Document) {
    for entry in addlist.children("file") {
        let name = entry.attr_or_empty("name");
        let exists = full.children("file").any(|f| f.attr_or_empty("name") == name);
        if exists {
            if let Some(existing) = full
                .children_mut("file")
                .find(|f| f.attr_or_empty("name") == name)
            {
                *existing = entry.clone();
            }
        } else {
            full.append_child("file", entry.clone());
        }
    }
    for entry in addlist.children("dir") {
        let name = entry.attr_or_empty("name");
        if full.children("dir").all(|d| d.attr_or_empty("name") != name) {
            full.add_child("dir").set_attr("name", name);
        }
        if let Some(dir) = full
            .children_mut("dir")
            .find(|d| d.attr_or_empty("name") == name)
        {
            apply_addlist(dir, entry);
        }
    }
}

fn has_entries(dir: &Document) -> bool {
    dir.children("file").next().is_some() || dir.children("dir").next().is_some()
}

// ---- delta synthesis ----

/// Structural diff of two content trees. Applying the returned removelist
/// and then the addlist to `from` reproduces `to`.
pub fn make_updatepack(from: &Document, to: &Document) -> (Document, Document) {
    (removed_between(from, to), added_between(from, to))
}

fn removed_between(from: &Document, to: &Document) -> Document {
    let mut out = Document::new();
    for file in from.children("file") {
        let name = file.attr_or_empty("name");
        if find_by_name(to, "file", name).is_none() {
            out.add_child("file").set_attr("name", name);
        }
    }
    for dir in from.children("dir") {
        let name = dir.attr_or_empty("name");
        match find_by_name(to, "dir", name) {
            // A vanished directory is spelled out file by file so that
            // removal application can prune it bottom-up.
            None => out.append_child("dir", name_skeleton(dir)),
            Some(to_dir) => {
                let sub = removed_between(dir, to_dir);
                if !sub.is_empty() {
                    let mut entry = sub;
                    entry.set_attr("name", name);
                    out.append_child("dir", entry);
                }
            }
        }
    }
    out
}

fn added_between(from: &Document, to: &Document) -> Document {
    let mut out = Document::new();
    for file in to.children("file") {
        let name = file.attr_or_empty("name");
        let unchanged = find_by_name(from, "file", name)
            .is_some_and(|old| old.attr_or_empty("contents") == file.attr_or_empty("contents"));
        if !unchanged {
            out.append_child("file", file.clone());
        }
    }
    for dir in to.children("dir") {
        let name = dir.attr_or_empty("name");
        match find_by_name(from, "dir", name) {
            None => out.append_child("dir", dir.clone()),
            Some(from_dir) => {
                let sub = added_between(from_dir, dir);
                if !sub.is_empty() {
                    let mut entry = sub;
                    entry.set_attr("name", name);
                    out.append_child("dir", entry);
                }
            }
        }
    }
    out
}

fn find_by_name<'a>(tree: &'a Document, kind: &'a str, name: &str) -> Option<&'a Document> {
    tree.children(kind).find(|c| c.attr_or_empty("name") == name)
}

fn name_skeleton(dir: &Document) -> Document {
    let mut out = Document::new();
    out.set_attr("name", dir.attr_or_empty("name"));
    for file in dir.children("file") {
        out.add_child("file").set_attr("name", file.attr_or_empty("name"));
    }
    for sub in dir.children("dir") {
        out.append_child("dir", name_skeleton(sub));
    }
    out
}

// ---- metadata enrichment ----

/// Detects `translations/<locale>` subtrees in a full pack and flips the
/// matching `translation` children of the metadata to `supported=true`.
/// Declared locales without a shipped subtree stay unsupported.
pub fn find_translations(full: &Document, meta: &mut Document) {
    let Some(translations) = find_by_name(full, "dir", "translations") else {
        return;
    };
    let shipped: Vec<&str> = translations
        .children("dir")
        .filter(|d| has_entries(d))
        .map(|d| d.attr_or_empty("name"))
        .collect();
    for locale in meta.children_mut("translation") {
        if shipped.contains(&locale.attr_or_empty("language")) {
            locale.set_attr("supported", "true");
        }
    }
}

const LICENSE_FILENAME: &str = "COPYING.txt";

const LICENSE_NOTICE: &str = "\
This add-on is distributed under the terms of the GNU General Public
License (GPL), version 2 or (at your option) any later version, as
published by the Free Software Foundation. It is distributed in the hope
that it will be useful, but WITHOUT ANY WARRANTY.

See https://www.gnu.org/licenses/gpl-2.0.html for the full license text.
";

/// Inserts the default license file into a pack that ships none.
pub fn add_license(full: &mut Document) {
    let has_license = full.children("file").any(|f| {
        let name = f.attr_or_empty("name");
        name.eq_ignore_ascii_case(LICENSE_FILENAME) || name.eq_ignore_ascii_case("LICENSE")
    });
    if has_license {
        return;
    }
    let file = full.add_child("file");
    file.set_attr("name", LICENSE_FILENAME);
    file.set_attr("contents", LICENSE_NOTICE);
}

// ---- name validation ----

const ILLEGAL_FILENAME_CHARS: &[char] =
    &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '~'];

const RESERVED_BASENAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Whether a single path component may appear inside a pack.
pub fn filename_legal(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    if name.starts_with('.') || name.ends_with('.') || name.ends_with(' ') {
        return false;
    }
    if name.chars().any(|c| c.is_control() || ILLEGAL_FILENAME_CHARS.contains(&c)) {
        return false;
    }
    let base = name.split('.').next().unwrap_or(name).to_ascii_lowercase();
    !RESERVED_BASENAMES.contains(&base.as_str())
}

/// Collects every illegal file or directory name in a pack-like tree.
pub fn check_names_legal(tree: &Document, bad: &mut Vec<String>) {
    for file in tree.children("file") {
        let name = file.attr_or_empty("name");
        if !filename_legal(name) {
            bad.push(name.to_string());
        }
    }
    for dir in tree.children("dir") {
        let name = dir.attr_or_empty("name");
        if !filename_legal(name) {
            bad.push(name.to_string());
        }
        check_names_legal(dir, bad);
    }
}

/// Collects names that collide under lowercase folding within one
/// directory level.
pub fn check_case_conflicts(tree: &Document, bad: &mut Vec<String>) {
    let mut seen: Vec<(String, &str)> = Vec::new();
    let names = tree
        .children("file")
        .chain(tree.children("dir"))
        .map(|c| c.attr_or_empty("name"));
    for name in names {
        let folded = name.to_lowercase();
        if let Some((_, first)) = seen.iter().find(|(f, _)| *f == folded) {
            if *first != name {
                bad.push(first.to_string());
                bad.push(name.to_string());
            }
        } else {
            seen.push((folded, name));
        }
    }
    for dir in tree.children("dir") {
        check_case_conflicts(dir, bad);
    }
}
