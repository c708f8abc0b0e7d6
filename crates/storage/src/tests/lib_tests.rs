use shared::protocol::Table;

use super::*;

struct Fixture {
    storage: Storage,
    owner: UserId,
    driver_user: UserId,
    driver: DriverProfileId,
}

async fn fixture() -> Fixture {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let owner = storage
        .create_user("Olive Owner", Some("https://img.example/olive.png"))
        .await
        .expect("owner");
    let driver_user = storage.create_user("Dan Driver", None).await.expect("driver user");
    let driver = storage
        .create_driver_profile(driver_user)
        .await
        .expect("driver profile");
    Fixture {
        storage,
        owner,
        driver_user,
        driver,
    }
}

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_767_225_600 + seconds, 0).expect("timestamp")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("messaging.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn resolves_driver_profile_for_user() {
    let fx = fixture().await;
    assert_eq!(
        fx.storage
            .driver_profile_for_user(fx.driver_user)
            .await
            .expect("lookup"),
        Some(fx.driver)
    );
    assert_eq!(
        fx.storage
            .driver_profile_for_user(fx.owner)
            .await
            .expect("lookup"),
        None
    );
}

#[tokio::test]
async fn owner_driver_pair_is_unique() {
    let fx = fixture().await;
    let first = fx
        .storage
        .insert_conversation(fx.owner, fx.driver)
        .await
        .expect("first insert");
    assert_eq!(first.owner_unread_count, 0);
    assert_eq!(first.driver_unread_count, 0);
    assert_eq!(
        first.driver.as_ref().map(|d| d.display_name.as_str()),
        Some("Dan Driver")
    );

    let err = fx
        .storage
        .insert_conversation(fx.owner, fx.driver)
        .await
        .expect_err("duplicate pair must fail");
    assert!(is_unique_violation(&err), "unexpected error: {err:#}");

    let found = fx
        .storage
        .find_conversation(fx.owner, fx.driver)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(found.id, first.id);
}

#[tokio::test]
async fn message_insert_bumps_counterpart_unread_and_preview() {
    let fx = fixture().await;
    let conversation = fx
        .storage
        .insert_conversation(fx.owner, fx.driver)
        .await
        .expect("conversation");

    for text in ["one", "two", "three"] {
        fx.storage
            .insert_message(&NewMessage::text(conversation.id, fx.driver_user, text))
            .await
            .expect("driver message");
    }
    let reply = fx
        .storage
        .insert_message(&NewMessage::text(conversation.id, fx.owner, "reply"))
        .await
        .expect("owner message");

    let refreshed = fx
        .storage
        .conversation(conversation.id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(refreshed.owner_unread_count, 3);
    assert_eq!(refreshed.driver_unread_count, 1);
    assert_eq!(refreshed.last_message_at, Some(reply.created_at));
    let preview = refreshed.last_message.expect("preview");
    assert_eq!(preview.content, "reply");
    assert_eq!(preview.sender_id, fx.owner);
}

#[tokio::test]
async fn recent_messages_returns_newest_window_oldest_first() {
    let fx = fixture().await;
    let conversation = fx
        .storage
        .insert_conversation(fx.owner, fx.driver)
        .await
        .expect("conversation");

    for i in [4, 1, 3, 0, 2] {
        fx.storage
            .insert_message_at(
                &NewMessage::text(conversation.id, fx.owner, &format!("m{i}")),
                at(i),
            )
            .await
            .expect("insert");
    }

    let window = fx
        .storage
        .recent_messages(conversation.id, 3)
        .await
        .expect("recent");
    let contents: Vec<_> = window.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m2", "m3", "m4"]);
    assert_eq!(
        window[0].sender.as_ref().map(|s| s.display_name.as_str()),
        Some("Olive Owner")
    );
}

#[tokio::test]
async fn equal_timestamps_fall_back_to_id_order() {
    let fx = fixture().await;
    let conversation = fx
        .storage
        .insert_conversation(fx.owner, fx.driver)
        .await
        .expect("conversation");

    let mut inserted = Vec::new();
    for text in ["a", "b", "c"] {
        inserted.push(
            fx.storage
                .insert_message_at(&NewMessage::text(conversation.id, fx.owner, text), at(10))
                .await
                .expect("insert"),
        );
    }
    inserted.sort_by_key(|m| m.id);

    let window = fx
        .storage
        .recent_messages(conversation.id, 10)
        .await
        .expect("recent");
    let ids: Vec<_> = window.iter().map(|m| m.id).collect();
    let expected: Vec<_> = inserted.iter().map(|m| m.id).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn owner_list_orders_by_last_message_with_empty_conversations_last() {
    let fx = fixture().await;
    let mut drivers = Vec::new();
    for name in ["A", "B", "C"] {
        let user = fx.storage.create_user(name, None).await.expect("user");
        drivers.push((
            user,
            fx.storage.create_driver_profile(user).await.expect("profile"),
        ));
    }

    let quiet = fx
        .storage
        .insert_conversation(fx.owner, drivers[0].1)
        .await
        .expect("quiet");
    let older = fx
        .storage
        .insert_conversation(fx.owner, drivers[1].1)
        .await
        .expect("older");
    let newer = fx
        .storage
        .insert_conversation(fx.owner, drivers[2].1)
        .await
        .expect("newer");

    fx.storage
        .insert_message_at(&NewMessage::text(older.id, drivers[1].0, "old"), at(1))
        .await
        .expect("old message");
    fx.storage
        .insert_message_at(&NewMessage::text(newer.id, drivers[2].0, "new"), at(2))
        .await
        .expect("new message");

    let listed = fx
        .storage
        .list_conversations_for_owner(fx.owner)
        .await
        .expect("list");
    let ids: Vec<_> = listed.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![newer.id, older.id, quiet.id]);
    assert!(listed[2].last_message.is_none());

    let for_driver = fx
        .storage
        .list_conversations_for_driver(drivers[1].1)
        .await
        .expect("driver list");
    assert_eq!(for_driver.len(), 1);
    assert_eq!(for_driver[0].id, older.id);
}

#[tokio::test]
async fn mark_read_and_reset_only_touch_the_reader_side() {
    let fx = fixture().await;
    let conversation = fx
        .storage
        .insert_conversation(fx.owner, fx.driver)
        .await
        .expect("conversation");
    fx.storage
        .insert_message(&NewMessage::text(conversation.id, fx.driver_user, "hi"))
        .await
        .expect("driver message");
    let own = fx
        .storage
        .insert_message(&NewMessage::text(conversation.id, fx.owner, "hello"))
        .await
        .expect("owner message");

    let marked = fx
        .storage
        .mark_messages_read(conversation.id, fx.owner)
        .await
        .expect("mark read");
    assert_eq!(marked, 1);
    assert!(
        !fx.storage
            .message(own.id)
            .await
            .expect("fetch")
            .expect("exists")
            .is_read
    );

    assert!(fx
        .storage
        .reset_unread(conversation.id, Role::Owner)
        .await
        .expect("reset"));
    let refreshed = fx
        .storage
        .conversation(conversation.id)
        .await
        .expect("fetch")
        .expect("exists");
    assert_eq!(refreshed.owner_unread_count, 0);
    assert_eq!(refreshed.driver_unread_count, 1);
}

#[tokio::test]
async fn writes_publish_row_changes() {
    let fx = fixture().await;
    let mut changes = fx.storage.subscribe_changes();

    let conversation = fx
        .storage
        .insert_conversation(fx.owner, fx.driver)
        .await
        .expect("conversation");
    let message = fx
        .storage
        .insert_message(&NewMessage::text(conversation.id, fx.owner, "ping"))
        .await
        .expect("message");

    let created = changes.recv().await.expect("insert event");
    assert_eq!(created.table, Table::Conversations);
    assert_eq!(created.kind, ChangeKind::Insert);

    let inserted = changes.recv().await.expect("message event");
    assert_eq!(inserted, ChangeEvent::message_inserted(message.id, conversation.id));

    let bumped = changes.recv().await.expect("update event");
    assert_eq!(
        bumped,
        ChangeEvent::conversation_changed(ChangeKind::Update, conversation.id)
    );
}

#[tokio::test]
async fn deleting_conversation_cascades_to_messages() {
    let fx = fixture().await;
    let conversation = fx
        .storage
        .insert_conversation(fx.owner, fx.driver)
        .await
        .expect("conversation");
    let message = fx
        .storage
        .insert_message(&NewMessage::text(conversation.id, fx.owner, "bye"))
        .await
        .expect("message");

    assert!(fx
        .storage
        .delete_conversation(conversation.id)
        .await
        .expect("delete"));
    assert!(fx.storage.message(message.id).await.expect("fetch").is_none());
    assert!(!fx
        .storage
        .delete_conversation(conversation.id)
        .await
        .expect("second delete"));
}

#[tokio::test]
async fn rejects_message_for_unknown_conversation() {
    let fx = fixture().await;
    let err = fx
        .storage
        .insert_message(&NewMessage::text(ConversationId::random(), fx.owner, "lost"))
        .await
        .expect_err("must fail");
    assert!(is_foreign_key_violation(&err), "unexpected error: {err:#}");
}

#[tokio::test]
async fn rejects_blank_message_before_touching_the_database() {
    let fx = fixture().await;
    let conversation = fx
        .storage
        .insert_conversation(fx.owner, fx.driver)
        .await
        .expect("conversation");
    let err = fx
        .storage
        .insert_message(&NewMessage::text(conversation.id, fx.owner, "  "))
        .await
        .expect_err("blank must fail");
    assert!(err.downcast_ref::<shared::error::ApiException>().is_some());
    assert!(fx
        .storage
        .recent_messages(conversation.id, 10)
        .await
        .expect("recent")
        .is_empty());
}
