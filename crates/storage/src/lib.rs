use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, DriverProfileId, MessageId, MessageType, Role, UserId},
    protocol::{
        ChangeEvent, ChangeKind, Conversation, LastMessagePreview, Message, NewMessage,
        ParticipantSummary,
    },
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const CHANGE_FEED_CAPACITY: usize = 1024;

const CONVERSATION_SELECT: &str = "
    SELECT c.id, c.owner_id, c.driver_id, c.last_message_at,
           c.owner_unread_count, c.driver_unread_count, c.created_at,
           ou.display_name AS owner_name, ou.avatar_url AS owner_avatar,
           du.id AS driver_user_id, du.display_name AS driver_name, du.avatar_url AS driver_avatar,
           lm.content AS last_content, lm.sender_id AS last_sender_id,
           lm.created_at AS last_created_at
    FROM conversations c
    LEFT JOIN users ou ON ou.id = c.owner_id
    LEFT JOIN driver_profiles dp ON dp.id = c.driver_id
    LEFT JOIN users du ON du.id = dp.user_id
    LEFT JOIN messages lm ON lm.id = (
        SELECT m.id FROM messages m
        WHERE m.conversation_id = c.id
        ORDER BY m.created_at DESC, m.id DESC
        LIMIT 1
    )";

const CONVERSATION_ORDER: &str =
    "ORDER BY c.last_message_at IS NULL, c.last_message_at DESC, c.id ASC";

const MESSAGE_SELECT: &str = "
    SELECT m.id, m.conversation_id, m.sender_id, m.content, m.message_type,
           m.attachment_url, m.created_at, m.is_read,
           u.display_name AS sender_name, u.avatar_url AS sender_avatar
    FROM messages m
    LEFT JOIN users u ON u.id = m.sender_id";

/// SQLite-backed stand-in for the remote data service.
///
/// Every write publishes the matching row-change events on an in-process
/// broadcast channel, so it can also serve as the push feed.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Each connection to an in-memory url gets its own private database.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self { pool, changes })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    fn publish(&self, event: ChangeEvent) {
        debug!(
            table = ?event.table,
            kind = ?event.kind,
            record_id = %event.record_id,
            "storage: publishing row change"
        );
        let _ = self.changes.send(event);
    }

    pub async fn create_user(&self, display_name: &str, avatar_url: Option<&str>) -> Result<UserId> {
        let user_id = UserId::random();
        sqlx::query("INSERT INTO users (id, display_name, avatar_url) VALUES (?, ?, ?)")
            .bind(user_id.to_string())
            .bind(display_name)
            .bind(avatar_url)
            .execute(&self.pool)
            .await?;
        Ok(user_id)
    }

    pub async fn create_driver_profile(&self, user_id: UserId) -> Result<DriverProfileId> {
        let profile_id = DriverProfileId::random();
        sqlx::query("INSERT INTO driver_profiles (id, user_id) VALUES (?, ?)")
            .bind(profile_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to create driver profile for user {user_id}"))?;
        Ok(profile_id)
    }

    pub async fn driver_profile_for_user(&self, user_id: UserId) -> Result<Option<DriverProfileId>> {
        let row = sqlx::query("SELECT id FROM driver_profiles WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_uuid(&r.get::<String, _>(0)).map(DriverProfileId))
            .transpose()
    }

    pub async fn list_conversations_for_owner(&self, owner_id: UserId) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "{CONVERSATION_SELECT} WHERE c.owner_id = ? {CONVERSATION_ORDER}"
        ))
        .bind(owner_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    pub async fn list_conversations_for_driver(
        &self,
        driver_id: DriverProfileId,
    ) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "{CONVERSATION_SELECT} WHERE c.driver_id = ? {CONVERSATION_ORDER}"
        ))
        .bind(driver_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    pub async fn conversation(&self, conversation_id: ConversationId) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!("{CONVERSATION_SELECT} WHERE c.id = ?"))
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    pub async fn find_conversation(
        &self,
        owner_id: UserId,
        driver_id: DriverProfileId,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "{CONVERSATION_SELECT} WHERE c.owner_id = ? AND c.driver_id = ?"
        ))
        .bind(owner_id.to_string())
        .bind(driver_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Fails with a unique violation if the owner/driver pair already exists.
    pub async fn insert_conversation(
        &self,
        owner_id: UserId,
        driver_id: DriverProfileId,
    ) -> Result<Conversation> {
        let conversation_id = ConversationId::random();
        sqlx::query(
            "INSERT INTO conversations (id, owner_id, driver_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id.to_string())
        .bind(owner_id.to_string())
        .bind(driver_id.to_string())
        .bind(now_micros().timestamp_micros())
        .execute(&self.pool)
        .await?;

        let conversation = self
            .conversation(conversation_id)
            .await?
            .ok_or_else(|| anyhow!("conversation {conversation_id} vanished after insert"))?;
        self.publish(ChangeEvent::conversation_changed(
            ChangeKind::Insert,
            conversation_id,
        ));
        Ok(conversation)
    }

    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.publish(ChangeEvent::conversation_changed(
                ChangeKind::Delete,
                conversation_id,
            ));
        }
        Ok(deleted)
    }

    /// The newest `limit` messages of a conversation, oldest first.
    pub async fn recent_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let mut rows = sqlx::query(&format!(
            "{MESSAGE_SELECT}
             WHERE m.conversation_id = ?
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT ?"
        ))
        .bind(conversation_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        rows.iter().map(message_from_row).collect()
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("{MESSAGE_SELECT} WHERE m.id = ?"))
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn insert_message(&self, new_message: &NewMessage) -> Result<Message> {
        self.insert_message_at(new_message, now_micros()).await
    }

    pub async fn insert_message_at(
        &self,
        new_message: &NewMessage,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        new_message.validate()?;

        let message_id = MessageId::random();
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, content, message_type, attachment_url, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id.to_string())
        .bind(new_message.conversation_id.to_string())
        .bind(new_message.sender_id.to_string())
        .bind(&new_message.content)
        .bind(new_message.message_type.as_str())
        .bind(new_message.attachment_url.as_deref())
        .bind(created_at.timestamp_micros())
        .execute(&self.pool)
        .await?;

        let message = self
            .message(message_id)
            .await?
            .ok_or_else(|| anyhow!("message {message_id} vanished after insert"))?;

        self.publish(ChangeEvent::message_inserted(
            message_id,
            new_message.conversation_id,
        ));
        self.publish(ChangeEvent::conversation_changed(
            ChangeKind::Update,
            new_message.conversation_id,
        ));
        Ok(message)
    }

    /// Marks every message in the conversation not sent by `reader` as read.
    pub async fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET is_read = 1
             WHERE conversation_id = ? AND sender_id <> ? AND is_read = 0",
        )
        .bind(conversation_id.to_string())
        .bind(reader.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn reset_unread(&self, conversation_id: ConversationId, role: Role) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE conversations SET {} = 0 WHERE id = ?",
            role.unread_column()
        ))
        .bind(conversation_id.to_string())
        .execute(&self.pool)
        .await?;
        let updated = result.rows_affected() > 0;
        if updated {
            self.publish(ChangeEvent::conversation_changed(
                ChangeKind::Update,
                conversation_id,
            ));
        }
        Ok(updated)
    }
}

pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<sqlx::Error>(),
        Some(sqlx::Error::Database(db)) if db.is_unique_violation()
    )
}

pub fn is_foreign_key_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<sqlx::Error>(),
        Some(sqlx::Error::Database(db)) if db.is_foreign_key_violation()
    )
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let owner_id = UserId(uuid_column(row, "owner_id")?);
    let owner = row
        .try_get::<Option<String>, _>("owner_name")?
        .map(|display_name| -> Result<ParticipantSummary> {
            Ok(ParticipantSummary {
                user_id: owner_id,
                display_name,
                avatar_url: row.try_get("owner_avatar")?,
            })
        })
        .transpose()?;

    let driver = match (
        row.try_get::<Option<String>, _>("driver_user_id")?,
        row.try_get::<Option<String>, _>("driver_name")?,
    ) {
        (Some(user_id), Some(display_name)) => Some(ParticipantSummary {
            user_id: UserId(parse_uuid(&user_id)?),
            display_name,
            avatar_url: row.try_get("driver_avatar")?,
        }),
        _ => None,
    };

    let last_message = match row.try_get::<Option<String>, _>("last_content")? {
        Some(content) => Some(LastMessagePreview {
            content,
            sender_id: UserId(uuid_column(row, "last_sender_id")?),
            created_at: timestamp(row.try_get("last_created_at")?)?,
        }),
        None => None,
    };

    Ok(Conversation {
        id: ConversationId(uuid_column(row, "id")?),
        owner_id,
        driver_id: DriverProfileId(uuid_column(row, "driver_id")?),
        last_message_at: row
            .try_get::<Option<i64>, _>("last_message_at")?
            .map(timestamp)
            .transpose()?,
        owner_unread_count: count_column(row, "owner_unread_count")?,
        driver_unread_count: count_column(row, "driver_unread_count")?,
        last_message,
        owner,
        driver,
        created_at: timestamp(row.try_get("created_at")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let sender_id = UserId(uuid_column(row, "sender_id")?);
    let sender = row
        .try_get::<Option<String>, _>("sender_name")?
        .map(|display_name| -> Result<ParticipantSummary> {
            Ok(ParticipantSummary {
                user_id: sender_id,
                display_name,
                avatar_url: row.try_get("sender_avatar")?,
            })
        })
        .transpose()?;
    let message_type = row
        .try_get::<String, _>("message_type")?
        .parse::<MessageType>()
        .map_err(|e| anyhow!(e))?;

    Ok(Message {
        id: MessageId(uuid_column(row, "id")?),
        conversation_id: ConversationId(uuid_column(row, "conversation_id")?),
        sender_id,
        content: row.try_get("content")?,
        message_type,
        attachment_url: row.try_get("attachment_url")?,
        created_at: timestamp(row.try_get("created_at")?)?,
        is_read: row.try_get::<bool, _>("is_read")?,
        sender,
    })
}

fn uuid_column(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.try_get(column)?;
    parse_uuid(&raw).with_context(|| format!("column {column}"))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid uuid '{raw}'"))
}

fn count_column(row: &SqliteRow, column: &str) -> Result<u32> {
    let raw: i64 = row.try_get(column)?;
    u32::try_from(raw).with_context(|| format!("column {column} out of range: {raw}"))
}

fn timestamp(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| anyhow!("invalid timestamp {micros}"))
}

/// Current time truncated to the microsecond precision stored on disk.
fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
