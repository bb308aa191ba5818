// Sync store behavior: idempotent ingestion, ordering, messaging-window
// anchoring, history merges, and advisory status/reaction application.

mod common;
use common::{incoming, outgoing, setup_logging};

use parley::models::{Contact, ContactPatch, MessageStatus};
use parley::sync::SyncStore;

#[test]
fn repeated_ids_keep_one_message_per_id_sorted_by_timestamp() {
    setup_logging();
    let mut store = SyncStore::new();

    store.ingest_message(incoming("b", "123", 200, "second"));
    store.ingest_message(incoming("a", "123", 100, "first"));
    store.ingest_message(incoming("c", "123", 300, "third"));
    // Duplicates of every id, some with different timestamps.
    store.ingest_message(incoming("a", "123", 100, "first"));
    store.ingest_message(incoming("b", "123", 999, "second again"));

    let thread = store.thread("123");
    let ids: Vec<&str> = thread.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    let timestamps: Vec<i64> = thread.iter().map(|m| m.timestamp).collect();
    assert_eq!(timestamps, vec![100, 200, 300]);
}

#[test]
fn first_message_creates_contact_with_window_anchor() {
    setup_logging();
    let mut store = SyncStore::new();
    assert!(store.contact("123").is_none());

    let outcome = store.ingest_message(incoming("a", "123", 100, "hello"));
    assert!(outcome.inserted);
    assert!(outcome.contact_created);
    assert_eq!(outcome.contact_id, "123");

    let contact = store.contact("123").expect("contact should exist");
    assert_eq!(contact.last_message.as_ref().unwrap().id, "a");
    assert_eq!(contact.last_user_msg_timestamp, Some(100));
}

#[test]
fn outgoing_messages_never_advance_the_window_anchor() {
    setup_logging();
    let mut store = SyncStore::new();

    store.ingest_message(incoming("a", "123", 100, "hi"));
    store.ingest_message(outgoing("b", "123", 500, "reply"));

    let contact = store.contact("123").unwrap();
    assert_eq!(contact.last_user_msg_timestamp, Some(100));
    // The denormalized pointer still tracks the latest message.
    assert_eq!(contact.last_message.as_ref().unwrap().id, "b");

    // An out-of-order older incoming message does not regress the anchor.
    store.ingest_message(incoming("c", "123", 50, "late arrival"));
    assert_eq!(store.contact("123").unwrap().last_user_msg_timestamp, Some(100));
}

#[test]
fn history_merge_deduplicates_against_live_messages() {
    setup_logging();
    let mut store = SyncStore::new();

    store.ingest_message(incoming("live1", "123", 300, "live"));
    store.ingest_message(outgoing("live2", "123", 400, "ours"));

    // The archive page overlaps one live message and adds older ones.
    let page = vec![
        incoming("hist1", "123", 100, "old"),
        incoming("hist2", "123", 200, "older"),
        incoming("live1", "123", 300, "live (archived copy)"),
    ];
    store.ingest_history_page("123", page);

    let thread = store.thread("123");
    let ids: Vec<&str> = thread.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["hist1", "hist2", "live1", "live2"]);
    // Last write wins: the archived copy replaced the live one.
    assert_eq!(thread[2].content, "live (archived copy)");
    let timestamps: Vec<i64> = thread.iter().map(|m| m.timestamp).collect();
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn status_applies_across_threads_and_respects_monotonicity() {
    setup_logging();
    let mut store = SyncStore::new();
    store.ingest_message(outgoing("m1", "123", 100, "to 123"));
    store.ingest_message(outgoing("m2", "456", 100, "to 456"));

    // The confirmation references a thread other than the "active" one;
    // lookup must span every thread.
    assert_eq!(store.apply_status("m2", MessageStatus::Read), Some("456".to_string()));
    assert_eq!(store.thread("456")[0].status, MessageStatus::Read);

    // Regression attempt is dropped without a change notification.
    assert_eq!(store.apply_status("m2", MessageStatus::Delivered), None);
    assert_eq!(store.thread("456")[0].status, MessageStatus::Read);

    // Unknown ids are advisory misses, not errors.
    assert_eq!(store.apply_status("ghost", MessageStatus::Read), None);
}

#[test]
fn status_update_refreshes_denormalized_last_message() {
    setup_logging();
    let mut store = SyncStore::new();
    store.ingest_message(outgoing("m1", "123", 100, "hi"));

    store.apply_status("m1", MessageStatus::Read);
    let contact = store.contact("123").unwrap();
    assert_eq!(
        contact.last_message.as_ref().unwrap().status,
        MessageStatus::Read
    );
}

#[test]
fn reactions_located_across_threads() {
    setup_logging();
    let mut store = SyncStore::new();
    store.ingest_message(outgoing("m1", "123", 100, "hi"));

    assert_eq!(
        store.apply_reaction("m1", "123", "👍"),
        Some("123".to_string())
    );
    assert_eq!(
        store.thread("123")[0].reactions.get("123").map(String::as_str),
        Some("👍")
    );

    // Retraction.
    assert_eq!(store.apply_reaction("m1", "123", ""), Some("123".to_string()));
    assert!(store.thread("123")[0].reactions.is_empty());

    // Unknown message is dropped.
    assert_eq!(store.apply_reaction("ghost", "123", "👍"), None);
}

#[test]
fn patch_contact_creates_stub_for_unknown_id() {
    setup_logging();
    let mut store = SyncStore::new();

    let patched = store.patch_contact(
        "999",
        ContactPatch {
            custom_name: Some("New Friend".to_string()),
            ..ContactPatch::default()
        },
    );
    assert_eq!(patched.id, "999");
    assert_eq!(patched.display_name(), "New Friend");
    assert!(store.contact("999").is_some());
}

#[test]
fn upsert_preserves_locally_derived_fields() {
    setup_logging();
    let mut store = SyncStore::new();
    store.ingest_message(incoming("a", "123", 100, "hi"));
    store.patch_contact(
        "123",
        ContactPatch {
            custom_name: Some("Ada".to_string()),
            ..ContactPatch::default()
        },
    );

    // Provider pushes a fresh contact record without local state.
    let mut pushed = Contact::stub("123");
    pushed.pushed_name = Some("Ada Lovelace".to_string());
    store.upsert_contacts(vec![pushed]);

    let contact = store.contact("123").unwrap();
    assert_eq!(contact.display_name(), "Ada");
    assert_eq!(contact.last_user_msg_timestamp, Some(100));
    assert_eq!(contact.last_message.as_ref().unwrap().id, "a");
}

#[test]
fn contact_list_orders_by_recent_activity() {
    setup_logging();
    let mut store = SyncStore::new();
    store.ingest_message(incoming("a", "first", 100, "hi"));
    store.ingest_message(incoming("b", "second", 300, "hi"));
    store.upsert_contacts(vec![Contact::stub("silent")]);

    let list = store.contact_list();
    let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["second", "first", "silent"]);
}
