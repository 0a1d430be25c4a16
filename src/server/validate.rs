//! Upload validation.
//!
//! Checks run in a fixed order; the first failure decides the reply. The
//! status codes form a closed set carried verbatim in the `status_code`
//! attribute of error replies, so their numeric values are part of the
//! protocol.

use crate::blacklist::UploadIdentity;
use crate::document::Document;
use crate::pack;
use crate::store;

use super::Server;

/// Outcome of an upload validation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AddonCheckStatus {
    Success = 0x0,

    // Authorization and access
    Unauthorized = 0x1,
    Denied = 0x2,
    UnexpectedDelta = 0x3,

    // Structure and metadata
    EmptyPack = 0x100,
    BadName = 0x101,
    NameHasMarkup = 0x102,
    NoTitle = 0x103,
    TitleHasMarkup = 0x104,
    BadType = 0x105,
    NoAuthor = 0x106,
    NoVersion = 0x107,
    NoDescription = 0x108,
    NoEmail = 0x109,
    NoPassphrase = 0x10A,
    IllegalFilename = 0x10B,
    FilenameCaseConflict = 0x10C,
    InvalidUtf8Name = 0x10D,
    InvalidUtf8Attribute = 0x10E,

    // Server-side conditions
    ServerReadOnly = 0xF001,
    ServerAddonsList = 0xF002,
    ServerDeltaNoVersions = 0xF003,
    ServerUnspecified = 0xF000,
}

impl AddonCheckStatus {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Human description appended to `Add-on rejected:` in error replies.
    pub fn describe(self) -> &'static str {
        use AddonCheckStatus::*;
        match self {
            Success => "success",
            Unauthorized => "the passphrase is incorrect",
            Denied => "uploads of this add-on are not allowed",
            UnexpectedDelta => "update pack sent for a non-existent add-on",
            EmptyPack => "no add-on data was supplied",
            BadName => "the add-on name contains illegal characters",
            NameHasMarkup => "the add-on name starts with a formatting character",
            NoTitle => "no add-on title specified",
            TitleHasMarkup => "the add-on title starts with a formatting character",
            BadType => "unknown add-on type specified",
            NoAuthor => "no add-on author specified",
            NoVersion => "no add-on version specified",
            NoDescription => "no add-on description specified",
            NoEmail => "no add-on email specified",
            NoPassphrase => "no passphrase specified",
            IllegalFilename => "the add-on contains files with illegal names",
            FilenameCaseConflict => {
                "the add-on contains files whose names differ only in case"
            }
            InvalidUtf8Name => "the add-on name is not valid UTF-8",
            InvalidUtf8Attribute => "an add-on attribute is not valid UTF-8",
            ServerReadOnly => "the server is currently in read-only mode",
            ServerAddonsList => "server error: the stored add-ons list is damaged",
            ServerDeltaNoVersions => {
                "server error: cannot process an update pack with an empty version table"
            }
            ServerUnspecified => "unspecified server error",
        }
    }
}

/// The add-on kinds a client may declare.
const KNOWN_TYPES: &[&str] = &[
    "campaign",
    "scenario",
    "campaign_sp_mp",
    "campaign_mp",
    "scenario_mp",
    "map_pack",
    "era",
    "faction",
    "mod_mp",
    "media",
    "other",
];

const NAME_PUNCTUATION: &[char] = &['_', '-', '+', '.', ',', '\'', '(', ')', '!', '*', '~', '@'];

/// Leading characters the client-side text renderer treats as markup.
const MARKUP_CHARS: &[char] = &['*', '`', '~', '{', '}', '|', '@', '#', '^', '<', '>'];

pub fn addon_name_legal(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || NAME_PUNCTUATION.contains(&c))
}

fn leads_with_markup(text: &str) -> bool {
    text.chars().next().is_some_and(|c| MARKUP_CHARS.contains(&c))
}

/// Whether a string survived transport without lossy re-decoding. A
/// replacement character is the signature of invalid UTF-8 upstream.
fn utf8_intact(text: &str) -> bool {
    !text.contains(char::REPLACEMENT_CHARACTER)
}

fn have_pack(doc: Option<&Document>) -> bool {
    doc.is_some_and(|d| !d.is_empty())
}

pub(super) struct ValidatedUpload {
    /// Canonical id of the existing add-on, when the upload updates one.
    pub existing_id: Option<String>,
    pub is_delta: bool,
}

/// Runs the validation sequence. Failures carry the offending names in
/// `extra_data`, newline-joined, where applicable.
pub(super) fn validate_upload(
    server: &Server,
    upload: &Document,
    addr: &str,
) -> Result<ValidatedUpload, (AddonCheckStatus, String)> {
    let fail = |status| Err((status, String::new()));

    if server.config.read_only {
        tracing::info!("validation error: uploads not permitted in read-only mode");
        return fail(AddonCheckStatus::ServerReadOnly);
    }

    let name = upload.attr_or_empty("name");
    let data = upload.child("data");
    let removelist = upload.child("removelist");
    let addlist = upload.child("addlist");
    let is_delta = have_pack(removelist) || have_pack(addlist);

    if !utf8_intact(name) {
        tracing::info!("validation error: bad UTF-8 in add-on name");
        return fail(AddonCheckStatus::InvalidUtf8Name);
    }
    let existing_id = server.store.find_case_insensitive(name).map(str::to_string);
    if let Some(id) = &existing_id {
        if !utf8_intact(id) {
            tracing::error!(
                "validation error: the stored add-ons list holds a damaged name, \
                 this is a server-side issue"
            );
            return fail(AddonCheckStatus::ServerAddonsList);
        }
    }
    let existing = existing_id.as_deref().and_then(|id| server.store.get(id));

    // Auth and block-list checks go first.

    if upload.attr_or_empty("passphrase").is_empty() {
        tracing::info!("validation error: no passphrase specified");
        return fail(AddonCheckStatus::NoPassphrase);
    }

    if let Some(existing) = existing {
        if !store::authenticate(existing, upload.attr_or_empty("passphrase")) {
            tracing::info!("validation error: passphrase does not match");
            return fail(AddonCheckStatus::Unauthorized);
        }
        if store::is_hidden(existing) {
            tracing::info!("validation error: add-on is hidden");
            return fail(AddonCheckStatus::Denied);
        }
    }

    let identity = UploadIdentity {
        name,
        title: upload.attr_or_empty("title"),
        description: upload.attr_or_empty("description"),
        author: upload.attr_or_empty("author"),
        addr,
        email: upload.attr_or_empty("email"),
    };
    let fields = [
        identity.title,
        identity.description,
        identity.author,
        identity.email,
    ];
    if fields.into_iter().any(|f| !utf8_intact(f)) {
        tracing::info!("validation error: bad UTF-8 in publish information");
        return fail(AddonCheckStatus::InvalidUtf8Attribute);
    }
    if server.blacklist.is_blacklisted(&identity) {
        tracing::info!("validation error: blacklisted uploader or publish information");
        return fail(AddonCheckStatus::Denied);
    }

    // Structure and syntax checks follow.

    if !is_delta && !have_pack(data) {
        tracing::info!("validation error: no add-on data");
        return fail(AddonCheckStatus::EmptyPack);
    }

    if !addon_name_legal(name) {
        tracing::info!("validation error: invalid add-on name");
        return fail(AddonCheckStatus::BadName);
    }
    if leads_with_markup(name) {
        tracing::info!("validation error: add-on name starts with a formatting character");
        return fail(AddonCheckStatus::NameHasMarkup);
    }

    let title = upload.attr_or_empty("title");
    if title.is_empty() {
        tracing::info!("validation error: no add-on title specified");
        return fail(AddonCheckStatus::NoTitle);
    }
    if leads_with_markup(title) {
        tracing::info!("validation error: add-on title starts with a formatting character");
        return fail(AddonCheckStatus::TitleHasMarkup);
    }

    if !KNOWN_TYPES.contains(&upload.attr_or_empty("type")) {
        tracing::info!("validation error: unknown add-on type specified");
        return fail(AddonCheckStatus::BadType);
    }

    for (key, status) in [
        ("author", AddonCheckStatus::NoAuthor),
        ("version", AddonCheckStatus::NoVersion),
        ("description", AddonCheckStatus::NoDescription),
        ("email", AddonCheckStatus::NoEmail),
    ] {
        if upload.attr_or_empty(key).is_empty() {
            tracing::info!("validation error: no add-on {key} specified");
            return fail(status);
        }
    }

    let trees = [data, addlist, removelist];
    let mut bad_names = Vec::new();
    for tree in trees.into_iter().flatten() {
        pack::check_names_legal(tree, &mut bad_names);
    }
    if !bad_names.is_empty() {
        tracing::info!(
            count = bad_names.len(),
            "validation error: invalid filenames in add-on pack"
        );
        return Err((AddonCheckStatus::IllegalFilename, bad_names.join("\n")));
    }
    for tree in trees.into_iter().flatten() {
        pack::check_case_conflicts(tree, &mut bad_names);
    }
    if !bad_names.is_empty() {
        tracing::info!(
            count = bad_names.len(),
            "validation error: case conflicts in add-on pack"
        );
        return Err((AddonCheckStatus::FilenameCaseConflict, bad_names.join("\n")));
    }

    if is_delta && existing.is_none() {
        tracing::info!("validation error: update pack sent for a non-existent add-on");
        return fail(AddonCheckStatus::UnexpectedDelta);
    }

    Ok(ValidatedUpload {
        existing_id,
        is_delta,
    })
}
