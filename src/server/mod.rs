//! The add-on server.
//!
//! Provides:
//! - Request dispatch over a tagged operation enum
//! - Upload pipeline and download planner
//! - Admin command surface
//! - Wire framing and the thread topology around the state loop

pub mod admin;
pub mod download;
pub mod proto;
pub mod run;
pub mod upload;
pub mod validate;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::blacklist::Blacklist;
use crate::config::ServerConfig;
use crate::document::Document;
use crate::store::{self, AddonStore};

pub use admin::AdminOutcome;
pub use proto::ProtoError;
pub use run::{run_server, run_state_loop};
pub use validate::AddonCheckStatus;

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A client request: the first child of the request document names the
/// operation, the child itself carries its attributes.
#[derive(Debug)]
pub enum Request {
    CampaignList(Document),
    Campaign(Document),
    CampaignHash(Document),
    Terms,
    Upload(Document),
    Delete(Document),
    ChangePassphrase(Document),
}

impl Request {
    /// Parses a request document. `Ok(None)` for a document with no
    /// children (ignored, connection stays open); `Err` carries the
    /// unrecognized operation name.
    pub fn parse(mut doc: Document) -> Result<Option<Request>, String> {
        let Some((name, _)) = doc.first_child() else {
            return Ok(None);
        };
        let name = name.to_string();
        let body = doc.take_child(&name).unwrap_or_default();
        let request = match name.as_str() {
            "request_campaign_list" => Request::CampaignList(body),
            "request_campaign" => Request::Campaign(body),
            "request_campaign_hash" => Request::CampaignHash(body),
            "request_terms" => Request::Terms,
            "upload" => Request::Upload(body),
            "delete" => Request::Delete(body),
            "change_passphrase" => Request::ChangePassphrase(body),
            _ => return Err(name),
        };
        Ok(Some(request))
    }

    pub fn op(&self) -> &'static str {
        match self {
            Request::CampaignList(_) => "request_campaign_list",
            Request::Campaign(_) => "request_campaign",
            Request::CampaignHash(_) => "request_campaign_hash",
            Request::Terms => "request_terms",
            Request::Upload(_) => "upload",
            Request::Delete(_) => "delete",
            Request::ChangePassphrase(_) => "change_passphrase",
        }
    }
}

/// What goes back to the client: a document, or a stored pack file
/// streamed verbatim.
#[derive(Debug)]
pub enum Reply {
    Doc(Document),
    File(PathBuf),
}

pub(crate) fn message_doc(message: &str) -> Document {
    let mut doc = Document::new();
    doc.add_child("message").set_attr("message", message);
    doc
}

pub(crate) fn error_doc(message: &str) -> Document {
    let mut doc = Document::new();
    doc.add_child("error").set_attr("message", message);
    doc
}

pub(crate) fn error_doc_status(message: &str, extra_data: &str, status: AddonCheckStatus) -> Document {
    let mut doc = Document::new();
    let err = doc.add_child("error");
    err.set_attr("message", message);
    err.set_attr("extra_data", extra_data);
    err.set_attr("status_code", status.code().to_string());
    doc
}

const TERMS: &str = "\
All content within add-ons uploaded to this server must be licensed under \
the terms of the GNU General Public License (GPL), with the sole exception \
of graphics and audio explicitly denoted as released under a Creative \
Commons license either in a combined toplevel file or in per-asset \
.license files.

By uploading content to this server, you certify that you have the right \
to release it under those terms and that you choose to do so.";

pub struct Server {
    pub(crate) config: ServerConfig,
    pub(crate) store: AddonStore,
    pub(crate) blacklist: Blacklist,
}

impl Server {
    /// Loads the configuration, reconciles the store with disk, performs
    /// one-time migrations, and flushes the result.
    pub fn new(
        root: impl Into<PathBuf>,
        config_file: impl AsRef<Path>,
        port_override: Option<u16>,
    ) -> crate::Result<Server> {
        let root = root.into();
        tracing::info!("reading configuration from {}", config_file.as_ref().display());
        let mut config = ServerConfig::load(config_file.as_ref())?;

        // Command line override; intentionally never saved back to disk.
        if let Some(port) = port_override {
            config.port = port;
        }
        if config.read_only {
            tracing::info!("READ-ONLY MODE ACTIVE");
        }

        let mut store = AddonStore::open(&root);
        store.load()?;

        if let Some(campaigns) = config.take_legacy_campaigns() {
            store.migrate_legacy(
                &campaigns,
                config.compress_level,
                config.document_size_limit,
            )?;
        }

        let mut server = Server {
            config,
            store,
            blacklist: Blacklist::new(),
        };

        if !server.config.read_only {
            server.store.migrate_passphrases();
        }
        server.write_config()?;
        server.load_blacklist();

        tracing::info!(
            port = server.config.port,
            addons = server.store.len(),
            root = %root.display(),
            "server ready"
        );
        Ok(server)
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Writes the server config atomically, then every dirty `addon.cfg`,
    /// then clears the dirty set.
    pub fn write_config(&mut self) -> crate::Result<()> {
        tracing::debug!("writing configuration and add-ons list to disk");
        self.config.write()?;
        self.store.write_dirty()?;
        Ok(())
    }

    /// Reloads configuration, store, and blacklist. The listening port is
    /// left as-is; changing it requires a restart.
    pub fn reload(&mut self) -> crate::Result<()> {
        let port = self.config.port;
        let mut config = ServerConfig::load(self.config.path())?;
        config.port = port;

        let mut store = AddonStore::open(self.store.root());
        store.load()?;
        if let Some(campaigns) = config.take_legacy_campaigns() {
            store.migrate_legacy(&campaigns, config.compress_level, config.document_size_limit)?;
        }

        self.config = config;
        self.store = store;
        if !self.config.read_only {
            self.store.migrate_passphrases();
        }
        self.write_config()?;
        self.load_blacklist();
        Ok(())
    }

    /// Replaces the blacklist from `blacklist_file`. A missing or
    /// malformed file leaves blacklisting disabled.
    pub fn load_blacklist(&mut self) {
        self.blacklist.clear();
        if self.config.blacklist_file.is_empty() {
            return;
        }
        let path = self.store.root().join(&self.config.blacklist_file);
        match Document::read_file(&path) {
            Ok(doc) => {
                self.blacklist = Blacklist::read(&doc);
                tracing::info!("using blacklist from {}", path.display());
            }
            Err(e) => {
                tracing::error!("failed to read blacklist from {}: {e}, blacklist disabled", path.display());
            }
        }
    }

    /// Dispatches one request. `None` means no reply is sent and the
    /// connection stays open.
    pub fn handle_request(&mut self, doc: Document, addr: &str) -> Option<Reply> {
        let request = match Request::parse(doc) {
            Ok(Some(request)) => request,
            Ok(None) => return None,
            Err(name) => {
                return Some(Reply::Doc(error_doc(&format!(
                    "Unrecognized [{name}] request."
                ))));
            }
        };

        tracing::info!("[{addr} {}]", request.op());
        let reply = match request {
            Request::CampaignList(body) => download::handle_request_campaign_list(self, &body),
            Request::Campaign(body) => download::handle_request_campaign(self, &body, addr),
            Request::CampaignHash(body) => download::handle_request_campaign_hash(self, &body),
            Request::Terms => self.handle_request_terms(),
            Request::Upload(body) => upload::handle_upload(self, body, addr),
            Request::Delete(body) => self.handle_delete(&body),
            Request::ChangePassphrase(body) => self.handle_change_passphrase(&body),
        };
        Some(reply)
    }

    fn handle_request_terms(&self) -> Reply {
        // This usually means the client wants to upload content, so tell
        // it to give up early when in read-only mode.
        if self.config.read_only {
            tracing::info!("in read-only mode, request for upload terms denied");
            return Reply::Doc(error_doc(
                "The server is currently in read-only mode, add-on uploads are disabled.",
            ));
        }
        tracing::info!("sending license terms");
        Reply::Doc(message_doc(TERMS))
    }

    fn handle_delete(&mut self, body: &Document) -> Reply {
        let id = body.attr_or_empty("name").to_string();

        if self.config.read_only {
            tracing::info!("in read-only mode, request to delete '{id}' denied");
            return Reply::Doc(error_doc(
                "Cannot delete add-on: The server is currently in read-only mode.",
            ));
        }

        tracing::info!("deleting add-on '{id}'");
        let Some(addon) = self.store.get(&id) else {
            return Reply::Doc(error_doc("The add-on does not exist."));
        };

        let passphrase = body.attr_or_empty("passphrase");
        if passphrase.is_empty() {
            return Reply::Doc(error_doc("No passphrase was specified."));
        }
        if !store::authenticate(addon, passphrase) {
            return Reply::Doc(error_doc("The passphrase is incorrect."));
        }
        if store::is_hidden(addon) {
            tracing::info!("add-on removal denied, hidden add-on");
            return Reply::Doc(error_doc(
                "Add-on deletion denied. Please contact the server administration for assistance.",
            ));
        }

        match self.delete_addon(&id) {
            Ok(true) => Reply::Doc(message_doc("Add-on deleted.")),
            Ok(false) => Reply::Doc(error_doc("The add-on does not exist.")),
            Err(e) => {
                tracing::error!("failed to delete add-on '{id}': {e}");
                Reply::Doc(error_doc("Server error: could not delete the add-on."))
            }
        }
    }

    fn handle_change_passphrase(&mut self, body: &Document) -> Reply {
        if self.config.read_only {
            tracing::info!("in read-only mode, request to change passphrase denied");
            return Reply::Doc(error_doc(
                "Cannot change passphrase: The server is currently in read-only mode.",
            ));
        }

        let id = body.attr_or_empty("name").to_string();
        let Some(addon) = self.store.get_mut(&id) else {
            return Reply::Doc(error_doc("No add-on with that name exists."));
        };
        if !store::authenticate(addon, body.attr_or_empty("passphrase")) {
            return Reply::Doc(error_doc("Your old passphrase was incorrect."));
        }
        if store::is_hidden(addon) {
            tracing::info!("passphrase change denied, hidden add-on");
            return Reply::Doc(error_doc(
                "Add-on passphrase change denied. Please contact the server administration \
                 for assistance.",
            ));
        }
        let new_passphrase = body.attr_or_empty("new_passphrase");
        if new_passphrase.is_empty() {
            return Reply::Doc(error_doc("No new passphrase was supplied."));
        }

        store::set_passphrase(addon, new_passphrase);
        self.store.mark_dirty(&id);
        if let Err(e) = self.write_config() {
            tracing::error!("flush after passphrase change failed: {e}");
        }
        Reply::Doc(message_doc("Passphrase changed."))
    }

    /// Removes an add-on's directory and entry, persists, and fires the
    /// post-erase hook. Returns whether the add-on existed.
    pub fn delete_addon(&mut self, id: &str) -> crate::Result<bool> {
        let removed = self.store.delete(id)?;
        if removed.is_none() {
            tracing::error!("cannot delete unrecognized add-on '{id}'");
            return Ok(false);
        }
        self.write_config()?;
        self.fire_hook_post_erase(id);
        tracing::info!("deleted add-on '{id}'");
        Ok(true)
    }

    pub(crate) fn fire_hook_post_upload(&self, id: &str) {
        fire(&self.config.hook_post_upload, id);
    }

    pub(crate) fn fire_hook_post_erase(&self, id: &str) {
        fire(&self.config.hook_post_erase, id);
    }

    /// Whether downloads from this address are exempt from stats.
    pub(crate) fn ignore_address_stats(&self, addr: &str) -> bool {
        self.config
            .stats_exempt_ips
            .iter()
            .any(|mask| crate::blacklist::wildcard_match(mask, addr))
    }
}

/// Spawns a hook executable with the add-on id as its single argument,
/// detached. Failures never affect the request outcome.
fn fire(script: &str, addon_id: &str) {
    if script.is_empty() {
        return;
    }
    match Command::new(script).arg(addon_id).spawn() {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to spawn hook '{script}' for add-on '{addon_id}': {e}"),
    }
}
