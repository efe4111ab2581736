//! End-to-end identify behaviour through the public API.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use contact_reconcile::{
    Contact, ContactId, ContactStore, IdentifyRequest, InMemoryContactStore, LinkPrecedence,
    ReconcileEngine, SecondaryDecision,
};

fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 4, 1, 0, 0, 0).unwrap() + Duration::days(n)
}

fn contact(id: i64, email: Option<&str>, phone: Option<&str>, linked: Option<i64>, created: i64) -> Contact {
    Contact {
        id: ContactId::new(id),
        email: email.map(str::to_string),
        phone_number: phone.map(str::to_string),
        linked_id: linked.map(ContactId::new),
        link_precedence: if linked.is_some() {
            LinkPrecedence::Secondary
        } else {
            LinkPrecedence::Primary
        },
        created_at: day(created),
        updated_at: day(created),
        deleted_at: None,
    }
}

fn setup(fixtures: Vec<Contact>) -> (ReconcileEngine, Arc<InMemoryContactStore>) {
    let store = Arc::new(InMemoryContactStore::new());
    store.import(fixtures).unwrap();
    (ReconcileEngine::new(store.clone()), store)
}

fn req(email: Option<&str>, phone: Option<&str>) -> IdentifyRequest {
    IdentifyRequest::new(email.map(str::to_string), phone.map(str::to_string)).unwrap()
}

fn ids(raw: &[i64]) -> Vec<ContactId> {
    raw.iter().copied().map(ContactId::new).collect()
}

#[test]
fn exact_match_creates_nothing_and_returns_the_group() {
    let (engine, store) = setup(vec![
        contact(1, Some("doc@fluxkart.com"), Some("999999"), None, 0),
        contact(2, Some("mcfly@fluxkart.com"), Some("999999"), Some(1), 1),
    ]);

    let out = engine
        .identify_detailed(&req(Some("doc@fluxkart.com"), Some("999999")))
        .unwrap();
    let view = out.response.contact;
    assert_eq!(view.primary_contact_id, ContactId::new(1));
    assert_eq!(view.emails, vec!["doc@fluxkart.com", "mcfly@fluxkart.com"]);
    assert_eq!(view.phone_numbers, vec!["999999"]);
    assert_eq!(view.secondary_contact_ids, ids(&[2]));
    assert_eq!(out.decision, Some(SecondaryDecision::ExactMatch));
    assert!(out.created.is_none());
    assert_eq!(store.count().unwrap(), 2);
}

#[test]
fn unknown_identifiers_create_a_lone_primary() {
    let (engine, store) = setup(vec![contact(1, Some("doc@fluxkart.com"), Some("999999"), None, 0)]);

    let view = engine
        .identify(&req(Some("biff@hillvalley.edu"), Some("717171")))
        .unwrap()
        .contact;
    assert_eq!(view.primary_contact_id, ContactId::new(2));
    assert_eq!(view.emails, vec!["biff@hillvalley.edu"]);
    assert_eq!(view.phone_numbers, vec!["717171"]);
    assert!(view.secondary_contact_ids.is_empty());
    assert_eq!(store.count().unwrap(), 2);
}

#[test]
fn new_phone_for_known_email_adds_one_secondary() {
    let (engine, store) = setup(vec![contact(1, Some("lorraine@hillvalley.edu"), Some("123456"), None, 0)]);

    let out = engine
        .identify_detailed(&req(Some("lorraine@hillvalley.edu"), Some("654321")))
        .unwrap();
    let created = out.created.unwrap();
    assert_eq!(created.linked_id, Some(ContactId::new(1)));
    assert_eq!(created.link_precedence, LinkPrecedence::Secondary);

    let view = out.response.contact;
    assert_eq!(view.emails, vec!["lorraine@hillvalley.edu"]);
    assert_eq!(view.phone_numbers, vec!["123456", "654321"]);
    assert_eq!(view.secondary_contact_ids, vec![created.id]);

    // Repeating the request is now an exact match.
    engine
        .identify(&req(Some("lorraine@hillvalley.edu"), Some("654321")))
        .unwrap();
    assert_eq!(store.count().unwrap(), 2);
}

#[test]
fn bridging_request_merges_groups_under_the_older_primary() {
    let (engine, store) = setup(vec![
        contact(1, Some("george@hillvalley.edu"), Some("919191"), None, 0),
        contact(2, Some("biffsucks@hillvalley.edu"), Some("717171"), None, 1),
        contact(3, Some("biff@hillvalley.edu"), Some("717100"), Some(2), 2),
    ]);

    let out = engine
        .identify_detailed(&req(Some("george@hillvalley.edu"), Some("717171")))
        .unwrap();

    let merge = out.merge.unwrap();
    assert_eq!(merge.canonical, ContactId::new(1));
    assert_eq!(merge.demoted, ids(&[2]));
    assert_eq!(merge.relinked, 1);
    assert!(out.created.is_none());

    let view = out.response.contact;
    assert_eq!(view.primary_contact_id, ContactId::new(1));
    assert_eq!(
        view.emails,
        vec!["george@hillvalley.edu", "biffsucks@hillvalley.edu", "biff@hillvalley.edu"]
    );
    assert_eq!(view.phone_numbers, vec!["919191", "717171", "717100"]);
    assert_eq!(view.secondary_contact_ids, ids(&[2, 3]));

    let demoted = store.get(ContactId::new(2)).unwrap().unwrap();
    assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(demoted.linked_id, Some(ContactId::new(1)));
    assert!(demoted.updated_at > day(1));

    // The old secondary points straight at the surviving primary.
    let relinked = store.get(ContactId::new(3)).unwrap().unwrap();
    assert_eq!(relinked.linked_id, Some(ContactId::new(1)));
    assert_eq!(store.count().unwrap(), 3);
}

#[test]
fn merged_group_keeps_growing_under_its_primary() {
    let (engine, store) = setup(vec![
        contact(1, Some("george@hillvalley.edu"), Some("919191"), None, 0),
        contact(2, Some("biff@hillvalley.edu"), Some("717171"), None, 1),
    ]);

    // Email from one group, phone from the other: both known after the merge.
    engine
        .identify(&req(Some("biff@hillvalley.edu"), Some("919191")))
        .unwrap();
    assert_eq!(store.count().unwrap(), 2);

    let view = engine
        .identify(&req(Some("george@hillvalley.edu"), Some("111111")))
        .unwrap()
        .contact;
    assert_eq!(view.primary_contact_id, ContactId::new(1));
    assert_eq!(view.secondary_contact_ids, ids(&[2, 3]));
    assert_eq!(store.count().unwrap(), 3);
}

#[test]
fn equal_creation_times_merge_under_the_lower_id() {
    let (engine, store) = setup(vec![
        contact(5, Some("a@x.com"), Some("100"), None, 0),
        contact(3, Some("b@x.com"), Some("200"), None, 0),
    ]);

    let view = engine.identify(&req(Some("a@x.com"), Some("200"))).unwrap().contact;
    assert_eq!(view.primary_contact_id, ContactId::new(3));
    assert_eq!(view.emails, vec!["b@x.com", "a@x.com"]);
    assert_eq!(
        store.get(ContactId::new(5)).unwrap().unwrap().linked_id,
        Some(ContactId::new(3))
    );
}

#[test]
fn single_identifier_requests_never_add_secondaries() {
    let (engine, store) = setup(vec![contact(1, Some("doc@fluxkart.com"), Some("999999"), None, 0)]);

    let by_email = engine.identify(&req(Some("doc@fluxkart.com"), None)).unwrap();
    let by_phone = engine.identify(&req(None, Some("999999"))).unwrap();
    assert_eq!(by_email, by_phone);
    assert_eq!(store.count().unwrap(), 1);

    let fresh = engine.identify(&req(Some("emmett@fluxkart.com"), None)).unwrap().contact;
    assert_eq!(fresh.primary_contact_id, ContactId::new(2));
    assert!(fresh.phone_numbers.is_empty());
    assert_eq!(store.count().unwrap(), 2);
}

#[test]
fn lookup_through_a_secondary_returns_the_whole_group() {
    let (engine, _) = setup(vec![
        contact(1, Some("george@hillvalley.edu"), Some("919191"), None, 0),
        contact(2, Some("lorraine@hillvalley.edu"), Some("123456"), Some(1), 1),
        contact(3, None, Some("555000"), Some(1), 2),
    ]);

    let view = engine.identify(&req(None, Some("123456"))).unwrap().contact;
    assert_eq!(view.primary_contact_id, ContactId::new(1));
    assert_eq!(view.emails, vec!["george@hillvalley.edu", "lorraine@hillvalley.edu"]);
    assert_eq!(view.phone_numbers, vec!["919191", "123456", "555000"]);
    assert_eq!(view.secondary_contact_ids, ids(&[2, 3]));
}

#[test]
fn soft_deleted_contacts_are_invisible() {
    let mut deleted = contact(1, Some("doc@fluxkart.com"), Some("999999"), None, 0);
    deleted.deleted_at = Some(day(2));
    let (engine, store) = setup(vec![deleted]);

    let view = engine
        .identify(&req(Some("doc@fluxkart.com"), Some("999999")))
        .unwrap()
        .contact;
    assert_eq!(view.primary_contact_id, ContactId::new(2));
    assert!(view.secondary_contact_ids.is_empty());

    let untouched = store.get(ContactId::new(1)).unwrap().unwrap();
    assert!(untouched.is_deleted());
    assert_eq!(untouched.link_precedence, LinkPrecedence::Primary);
}

#[test]
fn soft_deleted_secondary_is_left_behind_by_a_merge() {
    let mut deleted = contact(3, Some("biff@hillvalley.edu"), Some("717100"), Some(2), 2);
    deleted.deleted_at = Some(day(3));
    let (engine, store) = setup(vec![
        contact(1, Some("george@hillvalley.edu"), Some("919191"), None, 0),
        contact(2, Some("biffsucks@hillvalley.edu"), Some("717171"), None, 1),
        deleted,
    ]);

    let out = engine
        .identify_detailed(&req(Some("george@hillvalley.edu"), Some("717171")))
        .unwrap();

    let merge = out.merge.unwrap();
    assert_eq!(merge.demoted, ids(&[2]));
    assert_eq!(merge.relinked, 0);

    let view = out.response.contact;
    assert_eq!(view.secondary_contact_ids, ids(&[2]));
    assert_eq!(view.emails, vec!["george@hillvalley.edu", "biffsucks@hillvalley.edu"]);
    assert_eq!(view.phone_numbers, vec!["919191", "717171"]);

    let untouched = store.get(ContactId::new(3)).unwrap().unwrap();
    assert!(untouched.is_deleted());
    assert_eq!(untouched.linked_id, Some(ContactId::new(2)));
    assert_eq!(untouched.updated_at, day(2));
}

#[test]
fn numeric_phone_numbers_match_their_string_form() {
    let (engine, store) = setup(vec![contact(1, Some("marty@fluxkart.com"), Some("555555"), None, 0)]);

    let request = IdentifyRequest::builder().phone_number(555_555_u64).build().unwrap();
    let view = engine.identify(&request).unwrap().contact;
    assert_eq!(view.primary_contact_id, ContactId::new(1));
    assert_eq!(store.count().unwrap(), 1);
}
