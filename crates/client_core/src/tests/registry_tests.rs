use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{DriverProfileId, UserId},
    error::ErrorCode,
};

use super::*;

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

fn conversation(last_message_at: Option<i64>) -> Conversation {
    Conversation {
        id: ConversationId::random(),
        owner_id: UserId::random(),
        driver_id: DriverProfileId::random(),
        last_message_at: last_message_at.map(at),
        owner_unread_count: 0,
        driver_unread_count: 0,
        last_message: None,
        owner: None,
        driver: None,
        created_at: at(0),
    }
}

#[test]
fn refresh_sorts_newest_first_with_empty_conversations_last() {
    let mut registry = ConversationRegistry::default();
    let empty = conversation(None);
    let old = conversation(Some(10));
    let new = conversation(Some(20));

    let generation = registry.begin_refresh();
    assert!(registry.apply_refresh(generation, Ok(vec![empty.clone(), old.clone(), new.clone()])));

    let ids: Vec<_> = registry.conversations().iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![new.id, old.id, empty.id]);
}

#[test]
fn failed_refresh_keeps_cache_and_records_error() {
    let mut registry = ConversationRegistry::default();
    let cached = conversation(Some(5));
    let first = registry.begin_refresh();
    registry.apply_refresh(first, Ok(vec![cached.clone()]));

    let second = registry.begin_refresh();
    assert!(registry.apply_refresh(second, Err(ApiException::unavailable("offline"))));

    assert_eq!(registry.conversations(), &[cached]);
    let error = registry.last_error().expect("error recorded");
    assert_eq!(error.code, ErrorCode::Unavailable);

    let third = registry.begin_refresh();
    registry.apply_refresh(third, Ok(Vec::new()));
    assert!(registry.last_error().is_none());
}

#[test]
fn slow_refresh_cannot_overwrite_newer_one() {
    let mut registry = ConversationRegistry::default();
    let stale = conversation(Some(1));
    let fresh = conversation(Some(2));

    let slow = registry.begin_refresh();
    let fast = registry.begin_refresh();
    assert!(registry.apply_refresh(fast, Ok(vec![fresh.clone()])));
    assert!(!registry.apply_refresh(slow, Ok(vec![stale])));

    assert_eq!(registry.conversations(), &[fresh]);
}

#[test]
fn reset_discards_outstanding_refreshes() {
    let mut registry = ConversationRegistry::default();
    let pending = registry.begin_refresh();
    registry.reset();

    assert!(!registry.apply_refresh(pending, Ok(vec![conversation(Some(1))])));
    assert!(registry.conversations().is_empty());
}

#[test]
fn clear_unread_touches_only_the_given_role() {
    let mut registry = ConversationRegistry::default();
    let mut unread = conversation(Some(1));
    unread.owner_unread_count = 3;
    unread.driver_unread_count = 2;
    registry.upsert(unread.clone());

    assert!(registry.clear_unread(unread.id, Role::Owner));
    let stored = registry.get(unread.id).expect("cached");
    assert_eq!(stored.owner_unread_count, 0);
    assert_eq!(stored.driver_unread_count, 2);
    assert_eq!(registry.total_unread(Role::Driver), 2);
    assert!(!registry.clear_unread(ConversationId::random(), Role::Owner));
}

#[test]
fn refresh_started_before_clear_keeps_badge_cleared() {
    let mut registry = ConversationRegistry::default();
    let mut unread = conversation(Some(1));
    unread.owner_unread_count = 3;
    let first = registry.begin_refresh();
    registry.apply_refresh(first, Ok(vec![unread.clone()]));

    let in_flight = registry.begin_refresh();
    registry.clear_unread(unread.id, Role::Owner);
    assert!(registry.apply_refresh(in_flight, Ok(vec![unread.clone()])));
    assert_eq!(registry.total_unread(Role::Owner), 0);

    // A refresh started after the clear reports the server's count as is.
    let later = registry.begin_refresh();
    assert!(registry.apply_refresh(later, Ok(vec![unread.clone()])));
    assert_eq!(registry.total_unread(Role::Owner), 3);
}

#[test]
fn upsert_replaces_and_resorts() {
    let mut registry = ConversationRegistry::default();
    let mut first = conversation(Some(1));
    let second = conversation(Some(2));
    registry.upsert(first.clone());
    registry.upsert(second.clone());
    assert_eq!(registry.conversations()[0].id, second.id);

    first.last_message_at = Some(at(3));
    registry.upsert(first.clone());
    assert_eq!(registry.conversations().len(), 2);
    assert_eq!(registry.conversations()[0].id, first.id);

    assert_eq!(registry.remove(first.id).map(|c| c.id), Some(first.id));
    assert!(registry.get(first.id).is_none());
}

#[test]
fn driver_involvement_uses_profile_id() {
    let conversation = conversation(None);
    let driver = Viewer::driver(UserId::random(), Some(conversation.driver_id));
    let stranger = Viewer::driver(UserId::random(), Some(DriverProfileId::random()));
    let owner = Viewer::owner(conversation.owner_id);

    assert!(involves(&driver, &conversation));
    assert!(!involves(&stranger, &conversation));
    assert!(involves(&owner, &conversation));
}
