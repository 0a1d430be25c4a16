//! Deletion, re-keying, terms, migrations, and restart persistence.

use addond::document::Document;
use addond::pack::{self, full_pack_filename, index_filename};
use addond::server::Server;

use crate::fixtures::*;

#[test]
fn delete_with_wrong_passphrase_fails() {
    // Scenario 5: the add-on survives a bad deletion attempt.
    let mut ts = TestServer::new();
    seed_addon(&mut ts, "x", "1.0", &[("a.cfg", "1")]);

    let err = error_of(ts.handle(request(
        "delete",
        &[("name", "x"), ("passphrase", "wrong")],
    )));
    assert_eq!(err.message, "The passphrase is incorrect.");
    assert!(ts.addon_dir("x").exists());
}

#[test]
fn delete_lifecycle() {
    let mut ts = TestServer::new();
    seed_addon(&mut ts, "x", "1.0", &[("a.cfg", "1")]);

    let err = error_of(ts.handle(request("delete", &[("name", "x")])));
    assert_eq!(err.message, "No passphrase was specified.");

    let err = error_of(ts.handle(request(
        "delete",
        &[("name", "ghost"), ("passphrase", PASSPHRASE)],
    )));
    assert_eq!(err.message, "The add-on does not exist.");

    let reply = ts.handle(request(
        "delete",
        &[("name", "x"), ("passphrase", PASSPHRASE)],
    ));
    assert_eq!(message_of(reply), "Add-on deleted.");
    assert!(!ts.addon_dir("x").exists());

    let err = error_of(ts.handle(request(
        "delete",
        &[("name", "x"), ("passphrase", PASSPHRASE)],
    )));
    assert_eq!(err.message, "The add-on does not exist.");
}

#[test]
fn delete_denied_in_read_only_mode() {
    let mut ts = TestServer::with_config("read_only=\"true\"\n");
    let err = error_of(ts.handle(request(
        "delete",
        &[("name", "x"), ("passphrase", PASSPHRASE)],
    )));
    assert_eq!(
        err.message,
        "Cannot delete add-on: The server is currently in read-only mode."
    );
}

#[test]
fn change_passphrase_lifecycle() {
    let mut ts = TestServer::new();
    seed_addon(&mut ts, "x", "1.0", &[("a.cfg", "1")]);

    let err = error_of(ts.handle(request(
        "change_passphrase",
        &[("name", "ghost"), ("passphrase", PASSPHRASE), ("new_passphrase", "n")],
    )));
    assert_eq!(err.message, "No add-on with that name exists.");

    let err = error_of(ts.handle(request(
        "change_passphrase",
        &[("name", "x"), ("passphrase", "wrong"), ("new_passphrase", "n")],
    )));
    assert_eq!(err.message, "Your old passphrase was incorrect.");

    let err = error_of(ts.handle(request(
        "change_passphrase",
        &[("name", "x"), ("passphrase", PASSPHRASE), ("new_passphrase", "")],
    )));
    assert_eq!(err.message, "No new passphrase was supplied.");

    let reply = ts.handle(request(
        "change_passphrase",
        &[("name", "x"), ("passphrase", PASSPHRASE), ("new_passphrase", "fresh")],
    ));
    assert_eq!(message_of(reply), "Passphrase changed.");

    // The old passphrase no longer authenticates; the new one does.
    let err = error_of(ts.handle(request(
        "delete",
        &[("name", "x"), ("passphrase", PASSPHRASE)],
    )));
    assert_eq!(err.message, "The passphrase is incorrect.");
    let reply = ts.handle(request("delete", &[("name", "x"), ("passphrase", "fresh")]));
    assert_eq!(message_of(reply), "Add-on deleted.");
}

#[test]
fn terms_request() {
    let mut ts = TestServer::new();
    let terms = message_of(ts.handle(request("request_terms", &[])));
    assert!(terms.contains("GNU General Public License"));

    let mut ts = TestServer::with_config("read_only=\"true\"\n");
    let err = error_of(ts.handle(request("request_terms", &[])));
    assert!(err.message.contains("read-only mode"));
}

#[test]
fn unrecognized_request_rejected() {
    let mut ts = TestServer::new();
    let mut doc = Document::new();
    doc.add_child("request_sandwich");
    let err = error_of(ts.handle(doc));
    assert_eq!(err.message, "Unrecognized [request_sandwich] request.");

    // A document with no children is ignored without a reply.
    assert!(ts.handle(Document::new()).is_none());
}

#[test]
fn store_survives_restart() {
    let mut ts = TestServer::new();
    seed_addon(&mut ts, "x", "1.0", &[("a.cfg", "1")]);
    let delta = with_delta(
        upload_request("x", "1.1"),
        Some("1.0"),
        &[],
        &[("b.cfg", "2")],
    );
    assert_eq!(message_of(ts.handle(delta)), "Add-on accepted.");

    let mut ts = ts.restart();

    // History and the update-pack graph are intact.
    let meta = stored_meta(&ts, "x");
    assert_eq!(meta.children("version").count(), 2);
    assert_eq!(meta.children("update_pack").count(), 1);

    let reply = ts.handle(request(
        "request_campaign",
        &[("name", "x"), ("from_version", "1.0"), ("version", "1.1")],
    ));
    let delta = reply_doc(reply);
    assert_eq!(delta.children("addlist").count(), 1);

    // Authorship still authenticates after reload.
    let reply = ts.handle(request("delete", &[("name", "x"), ("passphrase", PASSPHRASE)]));
    assert_eq!(message_of(reply), "Add-on deleted.");
}

#[test]
fn cleartext_passphrases_migrate_on_load() {
    let dir = tempfile::TempDir::new().unwrap();
    let addon_dir = dir.path().join("data/old");
    std::fs::create_dir_all(&addon_dir).unwrap();
    let mut meta = Document::new();
    meta.set_attr("name", "old");
    meta.set_attr("filename", "data/old");
    meta.set_attr("passphrase", "legacy-secret");
    std::fs::write(addon_dir.join("addon.cfg"), meta.render()).unwrap();
    let cfg = dir.path().join("server.cfg");
    std::fs::write(&cfg, "").unwrap();

    let server = Server::new(dir.path(), &cfg, None).unwrap();
    let mut ts = TestServer { dir, server };

    let stored = stored_meta(&ts, "old");
    assert_eq!(stored.attr("passphrase"), Some(""));
    assert!(!stored.attr_or_empty("passhash").is_empty());

    // The hashed credential still authenticates the original passphrase.
    let reply = ts.handle(request(
        "change_passphrase",
        &[("name", "old"), ("passphrase", "legacy-secret"), ("new_passphrase", "n")],
    ));
    assert_eq!(message_of(reply), "Passphrase changed.");
}

#[test]
fn legacy_campaigns_block_migrates_on_load() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("data")).unwrap();

    let mut content = Document::new();
    content.set_attr("version", "1.0");
    content.add_child("file").set_attr("name", "unit.cfg");
    std::fs::write(
        dir.path().join("data/Legacy"),
        content.to_gz_bytes(6).unwrap(),
    )
    .unwrap();

    let cfg = dir.path().join("server.cfg");
    std::fs::write(
        &cfg,
        "[campaigns]\n[campaign]\nname=\"Legacy\"\nfilename=\"data/Legacy\"\nversion=\"1.0\"\n[/campaign]\n[/campaigns]\n",
    )
    .unwrap();

    let server = Server::new(dir.path(), &cfg, None).unwrap();
    let mut ts = TestServer { dir, server };

    let addon_dir = ts.addon_dir("Legacy");
    assert!(addon_dir.join("addon.cfg").exists());
    assert!(addon_dir.join(full_pack_filename("1.0")).exists());
    assert!(addon_dir.join(index_filename("1.0")).exists());

    // The block is gone from the rewritten config; a second start must
    // not re-migrate.
    let rewritten = std::fs::read_to_string(ts.dir.path().join("server.cfg")).unwrap();
    assert!(!rewritten.contains("[campaigns]"));

    let reply = ts.handle(request("request_campaign", &[("name", "Legacy")]));
    assert_eq!(reply_file(reply), addon_dir.join(full_pack_filename("1.0")));

    let ts = ts.restart();
    assert!(ts.addon_dir("Legacy").join("addon.cfg").exists());
}

#[test]
fn hash_index_content_tracks_the_pack() {
    let mut ts = TestServer::new();
    seed_addon(&mut ts, "x", "1.0", &[("a.cfg", "payload")]);

    let index = pack::read_pack(
        &ts.addon_dir("x").join(index_filename("1.0")),
        1 << 24,
    )
    .unwrap();
    let entry = index
        .children("file")
        .find(|f| f.attr_or_empty("name") == "a.cfg")
        .unwrap();
    assert_eq!(
        entry.attr("contents"),
        Some(addond::digest::md5_hex("payload").as_str())
    );
}
