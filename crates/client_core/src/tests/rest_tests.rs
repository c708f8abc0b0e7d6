use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap as AxumHeaders, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::Mutex};

use super::*;

#[derive(Clone, Default)]
struct MockState {
    queries: Arc<Mutex<Vec<(String, HashMap<String, String>)>>>,
    headers: Arc<Mutex<Vec<(Option<String>, Option<String>)>>>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

impl MockState {
    async fn record(&self, route: &str, query: HashMap<String, String>, headers: &AxumHeaders) {
        let value = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        self.headers
            .lock()
            .await
            .push((value("apikey"), value("authorization")));
        self.queries.lock().await.push((route.to_string(), query));
    }
}

const OWNER: &str = "6f1c2b0e-2f7a-4f65-9a7e-1f3c3f0f1a01";
const DRIVER_USER: &str = "6f1c2b0e-2f7a-4f65-9a7e-1f3c3f0f1a02";
const DRIVER_PROFILE: &str = "6f1c2b0e-2f7a-4f65-9a7e-1f3c3f0f1a03";
const CONVERSATION: &str = "6f1c2b0e-2f7a-4f65-9a7e-1f3c3f0f1a04";

fn conversation_row() -> Value {
    json!({
        "id": CONVERSATION,
        "owner_id": OWNER,
        "driver_id": DRIVER_PROFILE,
        "last_message_at": "2024-05-01T10:00:02Z",
        "owner_unread_count": 2,
        "driver_unread_count": 0,
        "created_at": "2024-05-01T09:00:00Z",
        "owner": { "user_id": OWNER, "display_name": "Olivia", "avatar_url": null },
        "driver": { "user": { "user_id": DRIVER_USER, "display_name": "Dan" } },
        "messages": [
            { "content": "On my way", "sender_id": DRIVER_USER, "created_at": "2024-05-01T10:00:02Z" }
        ]
    })
}

fn message_row(id: &str, content: &str, created_at: &str) -> Value {
    json!({
        "id": id,
        "conversation_id": CONVERSATION,
        "sender_id": DRIVER_USER,
        "content": content,
        "message_type": "text",
        "attachment_url": null,
        "created_at": created_at,
        "is_read": false,
        "sender": { "user_id": DRIVER_USER, "display_name": "Dan" }
    })
}

async fn conversations_get(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
    headers: AxumHeaders,
) -> Json<Value> {
    state.record("GET conversations", query, &headers).await;
    Json(json!([conversation_row()]))
}

async fn conversations_post(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
    headers: AxumHeaders,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.record("POST conversations", query, &headers).await;
    state.bodies.lock().await.push(body);
    (
        StatusCode::CONFLICT,
        Json(json!({ "code": "23505", "message": "duplicate key value violates unique constraint" })),
    )
}

async fn conversations_patch(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
    headers: AxumHeaders,
    Json(body): Json<Value>,
) -> Json<Value> {
    let matches = query.get("id") == Some(&format!("eq.{CONVERSATION}"));
    state.record("PATCH conversations", query, &headers).await;
    state.bodies.lock().await.push(body);
    if matches {
        Json(json!([{ "id": CONVERSATION }]))
    } else {
        Json(json!([]))
    }
}

async fn messages_get(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
    headers: AxumHeaders,
) -> Json<Value> {
    state.record("GET messages", query, &headers).await;
    // Newest first, as requested by `order=created_at.desc`.
    Json(json!([
        message_row("6f1c2b0e-2f7a-4f65-9a7e-1f3c3f0f1b02", "second", "2024-05-01T10:00:02Z"),
        message_row("6f1c2b0e-2f7a-4f65-9a7e-1f3c3f0f1b01", "first", "2024-05-01T10:00:01Z"),
    ]))
}

async fn messages_patch(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
    headers: AxumHeaders,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.record("PATCH messages", query, &headers).await;
    state.bodies.lock().await.push(body);
    (StatusCode::NO_CONTENT, [(header::CONTENT_RANGE, "*/3")])
}

async fn driver_profiles_get(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
    headers: AxumHeaders,
) -> Json<Value> {
    state.record("GET driver_profiles", query, &headers).await;
    Json(json!([{ "id": DRIVER_PROFILE }]))
}

async fn spawn_mock() -> (RestDataService, MockState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let state = MockState::default();
    let app = Router::new()
        .route(
            "/rest/v1/conversations",
            get(conversations_get)
                .post(conversations_post)
                .patch(conversations_patch),
        )
        .route("/rest/v1/messages", get(messages_get).patch(messages_patch))
        .route("/rest/v1/driver_profiles", get(driver_profiles_get))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let service = RestDataService::new(RestConfig {
        base_url: Url::parse(&format!("http://{addr}/rest/v1/")).expect("url"),
        api_key: Some("anon-key".to_string()),
        access_token: Some("session-token".to_string()),
    });
    (service, state)
}

#[tokio::test]
async fn lists_conversations_with_embedded_preview() {
    let (service, state) = spawn_mock().await;
    let owner: UserId = OWNER.parse().expect("owner id");

    let conversations = service
        .list_conversations(ConversationScope::Owner(owner))
        .await
        .expect("list");

    assert_eq!(conversations.len(), 1);
    let conversation = &conversations[0];
    assert_eq!(conversation.owner_unread_count, 2);
    assert_eq!(
        conversation.last_message.as_ref().map(|m| m.content.as_str()),
        Some("On my way")
    );
    assert_eq!(
        conversation.driver.as_ref().map(|d| d.display_name.as_str()),
        Some("Dan")
    );

    let queries = state.queries.lock().await;
    let (_, query) = &queries[0];
    assert_eq!(query.get("owner_id"), Some(&format!("eq.{OWNER}")));
    assert_eq!(
        query.get("order").map(String::as_str),
        Some("last_message_at.desc.nullslast,id.asc")
    );
    assert_eq!(query.get("messages.limit").map(String::as_str), Some("1"));
    let headers = state.headers.lock().await;
    assert_eq!(headers[0].0.as_deref(), Some("anon-key"));
    assert_eq!(headers[0].1.as_deref(), Some("Bearer session-token"));
}

#[tokio::test]
async fn messages_come_back_oldest_first() {
    let (service, state) = spawn_mock().await;
    let conversation: ConversationId = CONVERSATION.parse().expect("conversation id");

    let messages = service
        .list_messages(conversation, 50)
        .await
        .expect("messages");

    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second"]);
    assert_eq!(
        messages[0].sender.as_ref().map(|s| s.display_name.as_str()),
        Some("Dan")
    );
    let queries = state.queries.lock().await;
    assert_eq!(queries[0].1.get("limit").map(String::as_str), Some("50"));
    assert_eq!(
        queries[0].1.get("order").map(String::as_str),
        Some("created_at.desc,id.desc")
    );
}

#[tokio::test]
async fn duplicate_conversation_maps_to_conflict() {
    let (service, state) = spawn_mock().await;

    let err = service
        .insert_conversation(
            OWNER.parse().expect("owner"),
            DRIVER_PROFILE.parse().expect("driver"),
        )
        .await
        .expect_err("conflict");

    assert!(err.is_conflict());
    let bodies = state.bodies.lock().await;
    assert_eq!(bodies[0]["owner_id"], OWNER);
    assert_eq!(bodies[0]["driver_id"], DRIVER_PROFILE);
}

#[tokio::test]
async fn mark_read_filters_out_own_messages_and_reads_count() {
    let (service, state) = spawn_mock().await;
    let reader: UserId = OWNER.parse().expect("reader");

    let marked = service
        .mark_messages_read(CONVERSATION.parse().expect("conversation"), reader)
        .await
        .expect("mark read");

    assert_eq!(marked, 3);
    let queries = state.queries.lock().await;
    let (_, query) = &queries[0];
    assert_eq!(query.get("sender_id"), Some(&format!("neq.{OWNER}")));
    assert_eq!(query.get("is_read").map(String::as_str), Some("eq.false"));
    assert_eq!(state.bodies.lock().await[0], json!({ "is_read": true }));
}

#[tokio::test]
async fn reset_unread_targets_the_role_column() {
    let (service, state) = spawn_mock().await;

    service
        .reset_unread(CONVERSATION.parse().expect("conversation"), Role::Driver)
        .await
        .expect("reset");
    let missing = service
        .reset_unread(ConversationId::random(), Role::Owner)
        .await
        .expect_err("missing");

    assert_eq!(missing.code, ErrorCode::NotFound);
    let bodies = state.bodies.lock().await;
    assert_eq!(bodies[0], json!({ "driver_unread_count": 0 }));
    assert_eq!(bodies[1], json!({ "owner_unread_count": 0 }));
}

#[tokio::test]
async fn resolves_driver_profile() {
    let (service, _state) = spawn_mock().await;

    let profile = service
        .driver_profile_for_user(DRIVER_USER.parse().expect("user"))
        .await
        .expect("lookup");

    assert_eq!(profile, Some(DRIVER_PROFILE.parse().expect("profile")));
}

#[tokio::test]
async fn unreachable_server_is_unavailable() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let service = RestDataService::new(RestConfig {
        base_url: Url::parse(&format!("http://{addr}/rest/v1")).expect("url"),
        api_key: None,
        access_token: None,
    });

    let err = service
        .fetch_message(MessageId::random())
        .await
        .expect_err("offline");

    assert_eq!(err.code, ErrorCode::Unavailable);
}

#[test]
fn status_codes_map_to_error_codes() {
    assert_eq!(status_error(StatusCode::NOT_FOUND, "").code, ErrorCode::NotFound);
    assert_eq!(status_error(StatusCode::CONFLICT, "").code, ErrorCode::Conflict);
    assert_eq!(
        status_error(StatusCode::BAD_REQUEST, r#"{"code":"23505","message":"dup"}"#).code,
        ErrorCode::Conflict
    );
    assert_eq!(
        status_error(StatusCode::UNAUTHORIZED, r#"{"message":"JWT expired"}"#).message,
        "JWT expired"
    );
    assert_eq!(
        status_error(StatusCode::SERVICE_UNAVAILABLE, "").code,
        ErrorCode::Unavailable
    );
}

#[test]
fn content_range_total_parses_both_forms() {
    let mut headers = HeaderMap::new();
    headers.insert("content-range", "0-4/5".parse().expect("header"));
    assert_eq!(content_range_total(&headers), Some(5));
    headers.insert("content-range", "*/0".parse().expect("header"));
    assert_eq!(content_range_total(&headers), Some(0));
    headers.remove("content-range");
    assert_eq!(content_range_total(&headers), None);
}
