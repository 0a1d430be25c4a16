//! Download planner, hash index resolution, and the add-ons list.

use addond::document::Document;
use addond::pack::{self, full_pack_filename, index_filename, update_pack_filename};

use crate::fixtures::*;

const SIZE_LIMIT: usize = 1 << 24;

fn seed_two_versions(ts: &mut TestServer) {
    seed_addon(ts, "x", "1.0", &[("unit.cfg", "u")]);
    let delta = with_delta(
        upload_request("x", "1.1"),
        Some("1.0"),
        &["unit.cfg"],
        &[("unit2.cfg", "v")],
    );
    assert_eq!(message_of(ts.handle(delta)), "Add-on accepted.");
}

#[test]
fn incremental_download_returns_stored_delta() {
    // Scenario 3: the reply document is the stored update pack, not the
    // full pack stream.
    let mut ts = TestServer::new();
    seed_two_versions(&mut ts);

    let reply = ts.handle(request(
        "request_campaign",
        &[("name", "x"), ("from_version", "1.0"), ("version", "1.1")],
    ));
    let delta = reply_doc(reply);

    let stored = pack::read_pack(
        &ts.addon_dir("x").join(update_pack_filename("1.0", "1.1")),
        SIZE_LIMIT,
    )
    .unwrap();
    assert_eq!(delta, stored);
    assert_eq!(delta.children("removelist").count(), 1);
    assert_eq!(delta.children("addlist").count(), 1);
}

#[test]
fn multi_step_delta_concatenates_packs() {
    let mut ts = TestServer::new();
    seed_two_versions(&mut ts);
    let delta = with_delta(
        upload_request("x", "1.2"),
        Some("1.1"),
        &[],
        &[("unit3.cfg", "w")],
    );
    assert_eq!(message_of(ts.handle(delta)), "Add-on accepted.");

    let reply = ts.handle(request(
        "request_campaign",
        &[("name", "x"), ("from_version", "1.0"), ("version", "1.2")],
    ));
    let doc = reply_doc(reply);
    assert_eq!(doc.children("removelist").count(), 2);
    assert_eq!(doc.children("addlist").count(), 2);
}

#[test]
fn missing_update_pack_falls_back_to_full() {
    // Scenario 4: with the pack file gone the client still gets a valid
    // payload, streamed from the full pack.
    let mut ts = TestServer::new();
    seed_two_versions(&mut ts);
    std::fs::remove_file(ts.addon_dir("x").join(update_pack_filename("1.0", "1.1"))).unwrap();

    let reply = ts.handle(request(
        "request_campaign",
        &[("name", "x"), ("from_version", "1.0"), ("version", "1.1")],
    ));
    assert_eq!(
        reply_file(reply),
        ts.addon_dir("x").join(full_pack_filename("1.1"))
    );
}

#[test]
fn oversized_delta_falls_back_to_full() {
    let mut ts = TestServer::new();
    seed_two_versions(&mut ts);

    // Blow the stored update pack up past the full pack size.
    let mut bloated = Document::new();
    bloated.add_child("removelist");
    let addlist = bloated.add_child("addlist");
    let file = addlist.add_child("file");
    file.set_attr("name", "huge.bin");
    file.set_attr("contents", "x".repeat(1 << 16));
    std::fs::write(
        ts.addon_dir("x").join(update_pack_filename("1.0", "1.1")),
        bloated.to_gz_bytes(0).unwrap(),
    )
    .unwrap();

    let reply = ts.handle(request(
        "request_campaign",
        &[("name", "x"), ("from_version", "1.0"), ("version", "1.1")],
    ));
    assert_eq!(
        reply_file(reply),
        ts.addon_dir("x").join(full_pack_filename("1.1"))
    );
}

#[test]
fn expired_update_pack_is_never_served() {
    let mut ts = TestServer::new();
    seed_two_versions(&mut ts);

    // Age the stored pack record on disk, then reload.
    let cfg_path = ts.addon_dir("x").join("addon.cfg");
    let mut meta = Document::read_file(&cfg_path).unwrap();
    meta.children_mut("update_pack")
        .next()
        .unwrap()
        .set_attr("expire", "1");
    std::fs::write(&cfg_path, meta.render()).unwrap();
    let mut ts = ts.restart();

    let reply = ts.handle(request(
        "request_campaign",
        &[("name", "x"), ("from_version", "1.0"), ("version", "1.1")],
    ));
    assert_eq!(
        reply_file(reply),
        ts.addon_dir("x").join(full_pack_filename("1.1"))
    );
}

#[test]
fn plain_download_streams_latest_full_pack() {
    let mut ts = TestServer::new();
    seed_two_versions(&mut ts);

    let reply = ts.handle(request("request_campaign", &[("name", "x")]));
    assert_eq!(
        reply_file(reply),
        ts.addon_dir("x").join(full_pack_filename("1.1"))
    );
}

#[test]
fn unknown_addon_and_unknown_target_version() {
    let mut ts = TestServer::new();
    seed_addon(&mut ts, "x", "1.0", &[("a.cfg", "1")]);

    let err = error_of(ts.handle(request("request_campaign", &[("name", "ghost")])));
    assert_eq!(err.message, "Add-on 'ghost' not found.");

    // The download target must exist exactly; no fuzzy resolution.
    let err = error_of(ts.handle(request(
        "request_campaign",
        &[("name", "x"), ("version", "1.0.5")],
    )));
    assert_eq!(
        err.message,
        "Could not find requested version 1.0.5 of the addon 'x'."
    );
}

fn listed_downloads(ts: &mut TestServer, id: &str) -> i64 {
    let doc = reply_doc(ts.handle(request("request_campaign_list", &[])));
    let campaigns = doc.child("campaigns").unwrap();
    campaigns
        .children("campaign")
        .find(|c| c.attr_or_empty("name") == id)
        .map(|c| c.attr_i64("downloads", 0))
        .unwrap_or(-1)
}

#[test]
fn download_accounting() {
    let mut ts = TestServer::with_config("stats_exempt_ips=\"127.0.0.*\"\n");
    seed_two_versions(&mut ts);
    assert_eq!(listed_downloads(&mut ts, "x"), 0);

    // A plain download counts.
    let _ = ts.handle(request("request_campaign", &[("name", "x")]));
    assert_eq!(listed_downloads(&mut ts, "x"), 1);

    // Upgrades don't count.
    let _ = ts.handle(request(
        "request_campaign",
        &[("name", "x"), ("from_version", "1.0"), ("version", "1.1")],
    ));
    assert_eq!(listed_downloads(&mut ts, "x"), 1);

    // Clients may opt out explicitly.
    let _ = ts.handle(request(
        "request_campaign",
        &[("name", "x"), ("increase_downloads", "no")],
    ));
    assert_eq!(listed_downloads(&mut ts, "x"), 1);

    // Stats-exempt addresses don't count.
    let _ = ts.handle_from(request("request_campaign", &[("name", "x")]), "127.0.0.9");
    assert_eq!(listed_downloads(&mut ts, "x"), 1);

    let _ = ts.handle(request("request_campaign", &[("name", "x")]));
    assert_eq!(listed_downloads(&mut ts, "x"), 2);
}

#[test]
fn hash_index_resolution() {
    let mut ts = TestServer::new();
    seed_addon(&mut ts, "x", "1.0", &[("a.cfg", "1")]);
    seed_addon(&mut ts, "x", "1.2", &[("a.cfg", "2")]);
    let dir = ts.addon_dir("x");

    // Exact match.
    let reply = ts.handle(request(
        "request_campaign_hash",
        &[("name", "x"), ("version", "1.2")],
    ));
    assert_eq!(reply_file(reply), dir.join(index_filename("1.2")));

    // Unlike the pack download, the index request resolves fuzzily to
    // the nearest older version.
    let reply = ts.handle(request(
        "request_campaign_hash",
        &[("name", "x"), ("version", "1.1")],
    ));
    assert_eq!(reply_file(reply), dir.join(index_filename("1.0")));

    // No version means latest.
    let reply = ts.handle(request("request_campaign_hash", &[("name", "x")]));
    assert_eq!(reply_file(reply), dir.join(index_filename("1.2")));
}

#[test]
fn hash_index_missing_file_is_an_error() {
    let mut ts = TestServer::new();
    seed_addon(&mut ts, "x", "1.0", &[("a.cfg", "1")]);
    std::fs::remove_file(ts.addon_dir("x").join(index_filename("1.0"))).unwrap();

    let err = error_of(ts.handle(request("request_campaign_hash", &[("name", "x")])));
    assert_eq!(err.message, "Missing index file for the add-on 'x'.");
}

#[test]
fn list_scrubs_private_data() {
    let mut ts = TestServer::new();
    let mut doc = with_data(upload_request("x", "1.0"), &[("a.cfg", "1")]);
    doc.child_mut("upload")
        .unwrap()
        .add_child("feedback")
        .set_attr("topic_id", "42");
    assert_eq!(message_of(ts.handle(doc)), "Add-on accepted.");

    let list = reply_doc(ts.handle(request("request_campaign_list", &[])));
    let campaigns = list.child("campaigns").unwrap();
    let entry = campaigns.children("campaign").next().unwrap();

    for key in ["passphrase", "passhash", "passsalt", "upload_ip", "email"] {
        assert!(!entry.has_attr(key), "{key} leaked to clients");
    }
    assert!(entry.has_attr("feedback_url"));
    assert_eq!(entry.children("feedback").count(), 0);
    assert_eq!(entry.children("update_pack").count(), 0);
    // Version history is public.
    assert_eq!(entry.children("version").count(), 1);
}

#[test]
fn list_computes_feedback_url() {
    let mut ts = TestServer::with_config(
        "feedback_url_format=\"https://forum.example/t/$topic_id\"\n",
    );
    let mut doc = with_data(upload_request("x", "1.0"), &[("a.cfg", "1")]);
    doc.child_mut("upload")
        .unwrap()
        .add_child("feedback")
        .set_attr("topic_id", "42");
    assert_eq!(message_of(ts.handle(doc)), "Add-on accepted.");

    let list = reply_doc(ts.handle(request("request_campaign_list", &[])));
    let entry = list
        .child("campaigns")
        .unwrap()
        .children("campaign")
        .next()
        .unwrap();
    assert_eq!(entry.attr("feedback_url"), Some("https://forum.example/t/42"));
}

#[test]
fn list_filters() {
    let mut ts = TestServer::new();
    seed_addon(&mut ts, "alpha", "1.0", &[("a.cfg", "1")]);
    seed_addon(&mut ts, "beta", "1.0", &[("b.cfg", "1")]);

    // By name.
    let list = reply_doc(ts.handle(request("request_campaign_list", &[("name", "alpha")])));
    let names: Vec<_> = list
        .child("campaigns")
        .unwrap()
        .children("campaign")
        .map(|c| c.attr_or_empty("name").to_string())
        .collect();
    assert_eq!(names, ["alpha"]);

    // By language: neither ships a supported de_DE catalogue.
    let list = reply_doc(ts.handle(request(
        "request_campaign_list",
        &[("language", "de_DE")],
    )));
    assert_eq!(list.child("campaigns").unwrap().children("campaign").count(), 0);
}

#[test]
fn list_time_windows() {
    let mut ts = TestServer::new();
    seed_addon(&mut ts, "x", "1.0", &[("a.cfg", "1")]);

    let count = |ts: &mut TestServer, attrs: &[(&str, &str)]| {
        let list = reply_doc(ts.handle(request("request_campaign_list", attrs)));
        list.child("campaigns").unwrap().children("campaign").count()
    };

    // Relative to now: uploaded within the last 100 seconds.
    assert_eq!(
        count(&mut ts, &[("times_relative_to", "now"), ("after", "-100")]),
        1
    );
    // Nothing is newer than 100 seconds from now.
    assert_eq!(
        count(&mut ts, &[("times_relative_to", "now"), ("after", "100")]),
        0
    );
    // Everything predates now+100; nothing predates now-100.
    assert_eq!(
        count(&mut ts, &[("times_relative_to", "now"), ("before", "100")]),
        1
    );
    assert_eq!(
        count(&mut ts, &[("times_relative_to", "now"), ("before", "-100")]),
        0
    );
}
