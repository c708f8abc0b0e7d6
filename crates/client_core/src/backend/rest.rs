//! PostgREST-style HTTP adapter: `eq.` filters, `order=` / `limit=`
//! query parameters, embedded selects for joined rows and
//! `Prefer: return=representation` on writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header::HeaderMap, Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    domain::{ConversationId, DriverProfileId, MessageId, Role, UserId},
    error::{ApiException, ErrorCode},
    protocol::{Conversation, LastMessagePreview, Message, NewMessage, ParticipantSummary},
};
use tracing::debug;
use url::Url;

use super::{ConversationScope, DataService};

const CONVERSATION_SELECT: &str = "*,\
owner:users!owner_id(user_id:id,display_name,avatar_url),\
driver:driver_profiles!driver_id(user:users(user_id:id,display_name,avatar_url)),\
messages(content,sender_id,created_at)";

const MESSAGE_SELECT: &str = "*,sender:users!sender_id(user_id:id,display_name,avatar_url)";

#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base of the REST surface, e.g. `https://host/rest/v1`.
    pub base_url: Url,
    pub api_key: Option<String>,
    /// Session token; falls back to the api key as bearer when absent.
    pub access_token: Option<String>,
}

pub struct RestDataService {
    http: Client,
    config: RestConfig,
}

#[derive(Debug, Deserialize)]
struct ConversationRow {
    id: ConversationId,
    owner_id: UserId,
    driver_id: DriverProfileId,
    #[serde(default)]
    last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    owner_unread_count: u32,
    #[serde(default)]
    driver_unread_count: u32,
    created_at: DateTime<Utc>,
    #[serde(default)]
    owner: Option<ParticipantSummary>,
    #[serde(default)]
    driver: Option<DriverEmbed>,
    #[serde(default)]
    messages: Vec<LastMessagePreview>,
}

#[derive(Debug, Deserialize)]
struct DriverEmbed {
    #[serde(default)]
    user: Option<ParticipantSummary>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        let last_message = row.messages.into_iter().max_by_key(|m| m.created_at);
        Conversation {
            id: row.id,
            owner_id: row.owner_id,
            driver_id: row.driver_id,
            last_message_at: row.last_message_at,
            owner_unread_count: row.owner_unread_count,
            driver_unread_count: row.driver_unread_count,
            last_message,
            owner: row.owner,
            driver: row.driver.and_then(|embed| embed.user),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DriverProfileRow {
    id: DriverProfileId,
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Serialize)]
struct NewConversationBody {
    owner_id: UserId,
    driver_id: DriverProfileId,
}

impl RestDataService {
    pub fn new(config: RestConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn table_url(&self, table: &str) -> Result<Url, ApiException> {
        let base = self.config.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{table}"))
            .map_err(|err| ApiException::internal(format!("invalid REST url for {table}: {err}")))
    }

    fn request(&self, method: Method, table: &str) -> Result<RequestBuilder, ApiException> {
        let mut request = self.http.request(method, self.table_url(table)?);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("apikey", api_key);
        }
        if let Some(token) = self
            .config
            .access_token
            .as_ref()
            .or(self.config.api_key.as_ref())
        {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    async fn rows<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Vec<T>, ApiException> {
        let response = send(request).await?;
        response
            .json::<Vec<T>>()
            .await
            .map_err(|err| ApiException::internal(format!("invalid REST response: {err}")))
    }

    async fn conversations(
        &self,
        filters: &[(&str, String)],
    ) -> Result<Vec<Conversation>, ApiException> {
        let request = self
            .request(Method::GET, "conversations")?
            .query(&[
                ("select", CONVERSATION_SELECT),
                ("messages.order", "created_at.desc"),
                ("messages.limit", "1"),
            ])
            .query(filters);
        let rows: Vec<ConversationRow> = self.rows(request).await?;
        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    async fn first_conversation(
        &self,
        filters: &[(&str, String)],
    ) -> Result<Option<Conversation>, ApiException> {
        Ok(self.conversations(filters).await?.into_iter().next())
    }
}

async fn send(request: RequestBuilder) -> Result<Response, ApiException> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

fn transport_error(err: reqwest::Error) -> ApiException {
    if err.is_decode() {
        ApiException::internal(format!("invalid REST response: {err}"))
    } else {
        ApiException::unavailable(format!("REST request failed: {err}"))
    }
}

fn status_error(status: StatusCode, body: &str) -> ApiException {
    let detail = serde_json::from_str::<PostgrestError>(body).ok();
    // Unique-constraint failures arrive as 409 from PostgREST, but some
    // proxies rewrite them; the SQLSTATE is authoritative.
    let unique_violation = detail
        .as_ref()
        .and_then(|d| d.code.as_deref())
        .is_some_and(|code| code == "23505");
    let code = match status {
        _ if unique_violation => ErrorCode::Conflict,
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::CONFLICT => ErrorCode::Conflict,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::Validation,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::RateLimited,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ErrorCode::Unavailable
        }
        _ => ErrorCode::Internal,
    };
    let message = detail
        .and_then(|d| d.message)
        .unwrap_or_else(|| format!("REST request failed with status {status}"));
    ApiException::new(code, message)
}

/// Total from a `Content-Range` header such as `0-4/5` or `*/0`.
pub(crate) fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("content-range")?
        .to_str()
        .ok()?
        .rsplit_once('/')?
        .1
        .parse()
        .ok()
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

#[async_trait]
impl DataService for RestDataService {
    async fn list_conversations(
        &self,
        scope: ConversationScope,
    ) -> Result<Vec<Conversation>, ApiException> {
        let filter = match scope {
            ConversationScope::Owner(owner_id) => ("owner_id", eq(owner_id)),
            ConversationScope::Driver(driver_id) => ("driver_id", eq(driver_id)),
        };
        self.conversations(&[
            filter,
            ("order", "last_message_at.desc.nullslast,id.asc".to_string()),
        ])
        .await
    }

    async fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, ApiException> {
        self.first_conversation(&[("id", eq(conversation_id))]).await
    }

    async fn find_conversation(
        &self,
        owner_id: UserId,
        driver_id: DriverProfileId,
    ) -> Result<Option<Conversation>, ApiException> {
        self.first_conversation(&[
            ("owner_id", eq(owner_id)),
            ("driver_id", eq(driver_id)),
            ("limit", "1".to_string()),
        ])
        .await
    }

    async fn insert_conversation(
        &self,
        owner_id: UserId,
        driver_id: DriverProfileId,
    ) -> Result<Conversation, ApiException> {
        let request = self
            .request(Method::POST, "conversations")?
            .query(&[("select", CONVERSATION_SELECT)])
            .header("Prefer", "return=representation")
            .json(&NewConversationBody {
                owner_id,
                driver_id,
            });
        let rows: Vec<ConversationRow> = self.rows(request).await?;
        rows.into_iter()
            .next()
            .map(Conversation::from)
            .ok_or_else(|| ApiException::internal("insert returned no conversation"))
    }

    async fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), ApiException> {
        let request = self
            .request(Method::DELETE, "conversations")?
            .query(&[("id", eq(conversation_id))]);
        send(request).await?;
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, ApiException> {
        let request = self.request(Method::GET, "messages")?.query(&[
            ("select", MESSAGE_SELECT.to_string()),
            ("conversation_id", eq(conversation_id)),
            ("order", "created_at.desc,id.desc".to_string()),
            ("limit", limit.to_string()),
        ]);
        let mut messages: Vec<Message> = self.rows(request).await?;
        messages.reverse();
        Ok(messages)
    }

    async fn fetch_message(&self, message_id: MessageId) -> Result<Option<Message>, ApiException> {
        let request = self.request(Method::GET, "messages")?.query(&[
            ("select", MESSAGE_SELECT.to_string()),
            ("id", eq(message_id)),
        ]);
        let messages: Vec<Message> = self.rows(request).await?;
        Ok(messages.into_iter().next())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, ApiException> {
        message.validate()?;
        let request = self
            .request(Method::POST, "messages")?
            .query(&[("select", MESSAGE_SELECT)])
            .header("Prefer", "return=representation")
            .json(&message);
        let rows: Vec<Message> = self.rows(request).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ApiException::internal("insert returned no message"))
    }

    async fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
    ) -> Result<u64, ApiException> {
        let request = self
            .request(Method::PATCH, "messages")?
            .query(&[
                ("conversation_id", eq(conversation_id)),
                ("sender_id", format!("neq.{reader}")),
                ("is_read", "eq.false".to_string()),
            ])
            .header("Prefer", "return=minimal,count=exact")
            .json(&serde_json::json!({ "is_read": true }));
        let response = send(request).await?;
        let marked = content_range_total(response.headers()).unwrap_or(0);
        debug!(conversation_id = %conversation_id, marked, "rest: marked messages read");
        Ok(marked)
    }

    async fn reset_unread(
        &self,
        conversation_id: ConversationId,
        role: Role,
    ) -> Result<(), ApiException> {
        let mut body = serde_json::Map::new();
        body.insert(role.unread_column().to_string(), serde_json::json!(0));
        let request = self
            .request(Method::PATCH, "conversations")?
            .query(&[("id", eq(conversation_id)), ("select", "id".to_string())])
            .header("Prefer", "return=representation")
            .json(&body);
        let rows: Vec<serde_json::Value> = self.rows(request).await?;
        if rows.is_empty() {
            return Err(ApiException::not_found(format!(
                "conversation {conversation_id} not found"
            )));
        }
        Ok(())
    }

    async fn driver_profile_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<DriverProfileId>, ApiException> {
        let request = self.request(Method::GET, "driver_profiles")?.query(&[
            ("select", "id".to_string()),
            ("user_id", eq(user_id)),
            ("limit", "1".to_string()),
        ]);
        let rows: Vec<DriverProfileRow> = self.rows(request).await?;
        Ok(rows.into_iter().next().map(|row| row.id))
    }
}

#[cfg(test)]
#[path = "../tests/rest_tests.rs"]
mod tests;
