use std::path::{Path, PathBuf};

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::models::message::{Conversation, Message, Role, now_ts};
use crate::models::provider_config::{ImageRoute, ProviderCategory, ProviderConfig};

use super::chat_store::{BoxFuture, ChatStore};
use super::error::{StoreError, StoreResult};

/// Migrations applied in order. Each entry is (version, sql).
/// To add a new migration: append a tuple with the next version number and its
/// SQL. Never edit or remove existing entries; existing databases depend on
/// them.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS conversations (
        id         TEXT    PRIMARY KEY,
        user       TEXT    NOT NULL DEFAULT '',
        title      TEXT    NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_updated_at
        ON conversations (updated_at DESC);
    CREATE TABLE IF NOT EXISTS messages (
        id              TEXT    PRIMARY KEY,
        conversation_id TEXT    NOT NULL,
        role            TEXT    NOT NULL,
        content         TEXT    NOT NULL DEFAULT '',
        image           TEXT,
        attachments     TEXT    NOT NULL DEFAULT '[]',
        created_at      INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages (conversation_id, created_at ASC);
    CREATE TABLE IF NOT EXISTS provider_configs (
        id          TEXT PRIMARY KEY,
        user        TEXT NOT NULL DEFAULT '',
        name        TEXT NOT NULL DEFAULT '',
        category    TEXT NOT NULL,
        model       TEXT NOT NULL,
        api_key     TEXT,
        base_url    TEXT,
        active      INTEGER NOT NULL DEFAULT 1,
        image_route TEXT
    );",
)];

/// SQLite-backed store.
///
/// Uses WAL journal mode for concurrent reads during background saves.
/// `SqlitePool` is internally reference-counted and cheap to clone.
pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    /// Open (or create) the database at the platform-specific config path.
    pub async fn new() -> StoreResult<Self> {
        Self::with_path(Self::db_path()?).await
    }

    /// Open (or create) the database at an explicit path.
    pub async fn with_path(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        info!(path = %db_path.display(), "Opened SQLite chat database");

        Ok(Self { pool })
    }

    /// Private in-memory database, used by tests.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);

        // One connection only: each in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Create the schema_version table if absent, then apply any pending
    /// migrations.
    async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        // Seed version 0 if the table is empty (fresh database).
        sqlx::query("INSERT INTO schema_version (version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)")
            .execute(pool)
            .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version > current {
                info!(version, "Applying schema migration");
                // sqlx doesn't support multiple statements in a single query
                // call, so split on ';' and execute each statement
                // individually.
                for statement in sql.split(';') {
                    let trimmed = statement.trim();
                    if !trimmed.is_empty() {
                        sqlx::query(trimmed).execute(pool).await?;
                    }
                }
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
        }

        Ok(())
    }

    fn db_path() -> StoreResult<PathBuf> {
        dirs::config_dir()
            .ok_or_else(|| StoreError::Initialization {
                message: "Cannot find config directory".into(),
            })
            .map(|p| p.join("parley").join("parley.db"))
    }
}

impl Clone for SqliteChatStore {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Message> {
    let role: String = row.get("role");
    let role = Role::parse(&role).ok_or_else(|| StoreError::InvalidData {
        message: format!("unknown role '{role}' in messages table"),
    })?;
    let attachments: String = row.get("attachments");
    let attachments: Vec<String> = serde_json::from_str(&attachments)?;

    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role,
        content: row.get("content"),
        image: row.get("image"),
        attachments,
        created_at: row.get("created_at"),
    })
}

fn config_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<ProviderConfig> {
    let category: String = row.get("category");
    let category = ProviderCategory::parse(&category).ok_or_else(|| StoreError::InvalidData {
        message: format!("unknown provider category '{category}'"),
    })?;
    let image_route: Option<String> = row.get("image_route");
    let image_route = match image_route {
        Some(route) => Some(ImageRoute::parse(&route).ok_or_else(|| StoreError::InvalidData {
            message: format!("unknown image route '{route}'"),
        })?),
        None => None,
    };

    Ok(ProviderConfig {
        id: row.get("id"),
        name: row.get("name"),
        category,
        model: row.get("model"),
        api_key: row.get("api_key"),
        base_url: row.get("base_url"),
        active: row.get("active"),
        image_route,
    })
}

impl ChatStore for SqliteChatStore {
    fn list_conversations(&self, user: &str) -> BoxFuture<'static, StoreResult<Vec<Conversation>>> {
        let pool = self.pool.clone();
        let user = user.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, user, title, created_at, updated_at
                 FROM conversations
                 WHERE user = ?
                 ORDER BY updated_at DESC",
            )
            .bind(&user)
            .fetch_all(&pool)
            .await?;

            Ok(rows
                .iter()
                .map(|row| Conversation {
                    id: row.get("id"),
                    user: row.get("user"),
                    title: row.get("title"),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                })
                .collect())
        })
    }

    fn create_conversation(
        &self,
        user: &str,
        title: &str,
    ) -> BoxFuture<'static, StoreResult<Conversation>> {
        let pool = self.pool.clone();
        let conversation = Conversation::new(user, title);
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO conversations (id, user, title, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&conversation.id)
            .bind(&conversation.user)
            .bind(&conversation.title)
            .bind(conversation.created_at)
            .bind(conversation.updated_at)
            .execute(&pool)
            .await?;

            Ok(conversation)
        })
    }

    fn rename_conversation(&self, id: &str, title: &str) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let title = title.to_string();
        Box::pin(async move {
            let result = sqlx::query("UPDATE conversations SET title = ? WHERE id = ?")
                .bind(&title)
                .bind(&id)
                .execute(&pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound { id });
            }
            Ok(())
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn list_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<Message>>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, conversation_id, role, content, image, attachments, created_at
                 FROM messages
                 WHERE conversation_id = ?
                 ORDER BY created_at ASC, rowid ASC",
            )
            .bind(&conversation_id)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(message_from_row).collect()
        })
    }

    fn append_message(&self, message: Message) -> BoxFuture<'static, StoreResult<Message>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let attachments = serde_json::to_string(&message.attachments)?;

            sqlx::query(
                "INSERT INTO messages
                    (id, conversation_id, role, content, image, attachments, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&message.id)
            .bind(&message.conversation_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(&message.image)
            .bind(&attachments)
            .bind(message.created_at)
            .execute(&pool)
            .await?;

            // Last-activity bump, kept strictly increasing for stable ordering.
            sqlx::query(
                "UPDATE conversations
                 SET updated_at = MAX(updated_at + 1, ?)
                 WHERE id = ?",
            )
            .bind(now_ts())
            .bind(&message.conversation_id)
            .execute(&pool)
            .await?;

            Ok(message)
        })
    }

    fn update_message(
        &self,
        id: &str,
        content: &str,
        image: Option<&str>,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        let content = content.to_string();
        let image = image.map(str::to_string);
        Box::pin(async move {
            let result = sqlx::query("UPDATE messages SET content = ?, image = ? WHERE id = ?")
                .bind(&content)
                .bind(&image)
                .bind(&id)
                .execute(&pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound { id });
            }
            Ok(())
        })
    }

    fn delete_message(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn list_provider_configs(
        &self,
        user: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<ProviderConfig>>> {
        let pool = self.pool.clone();
        let user = user.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, name, category, model, api_key, base_url, active, image_route
                 FROM provider_configs
                 WHERE user = ?
                 ORDER BY name ASC",
            )
            .bind(&user)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(config_from_row).collect()
        })
    }

    fn upsert_provider_config(
        &self,
        config: ProviderConfig,
        user: &str,
    ) -> BoxFuture<'static, StoreResult<ProviderConfig>> {
        let pool = self.pool.clone();
        let user = user.to_string();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO provider_configs
                    (id, user, name, category, model, api_key, base_url, active, image_route)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    name        = excluded.name,
                    category    = excluded.category,
                    model       = excluded.model,
                    api_key     = excluded.api_key,
                    base_url    = excluded.base_url,
                    active      = excluded.active,
                    image_route = excluded.image_route",
            )
            .bind(&config.id)
            .bind(&user)
            .bind(&config.name)
            .bind(config.category.as_str())
            .bind(&config.model)
            .bind(&config.api_key)
            .bind(&config.base_url)
            .bind(config.active)
            .bind(config.image_route.map(|r| r.as_str()))
            .execute(&pool)
            .await?;

            Ok(config)
        })
    }

    fn delete_provider_config(&self, id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM provider_configs WHERE id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provider_config::ProviderCategory;

    #[tokio::test]
    async fn test_message_round_trip() {
        let store = SqliteChatStore::in_memory().await.unwrap();
        let conversation = store.create_conversation("alice", "Test").await.unwrap();

        let message = Message::user(
            &conversation.id,
            "hello",
            vec!["https://example.com/cat.png".to_string()],
        );
        store.append_message(message.clone()).await.unwrap();

        let messages = store.list_messages(&conversation.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, message.id);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].attachments, message.attachments);
    }

    #[tokio::test]
    async fn test_append_bumps_updated_at() {
        let store = SqliteChatStore::in_memory().await.unwrap();
        let conversation = store.create_conversation("alice", "Test").await.unwrap();

        store
            .append_message(Message::user(&conversation.id, "hello", Vec::new()))
            .await
            .unwrap();

        let listed = store.list_conversations("alice").await.unwrap();
        assert!(listed[0].updated_at > conversation.updated_at);
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades() {
        let store = SqliteChatStore::in_memory().await.unwrap();
        let conversation = store.create_conversation("alice", "Test").await.unwrap();
        store
            .append_message(Message::user(&conversation.id, "hello", Vec::new()))
            .await
            .unwrap();

        store.delete_conversation(&conversation.id).await.unwrap();

        assert!(store.list_conversations("alice").await.unwrap().is_empty());
        assert!(store.list_messages(&conversation.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_config_round_trip() {
        let store = SqliteChatStore::in_memory().await.unwrap();
        let config = ProviderConfig::new("Pictures", ProviderCategory::Image, "imagen-3.0-generate-002")
            .with_api_key("secret");
        store
            .upsert_provider_config(config.clone(), "alice")
            .await
            .unwrap();

        let listed = store.list_provider_configs("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].category, ProviderCategory::Image);
        assert_eq!(listed[0].image_route, config.image_route);
        assert_eq!(listed[0].api_key.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_with_path_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("parley.db");

        {
            let store = SqliteChatStore::with_path(&path).await.unwrap();
            store.create_conversation("alice", "Persisted").await.unwrap();
        }

        let store = SqliteChatStore::with_path(&path).await.unwrap();
        let listed = store.list_conversations("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "Persisted");
    }

    #[tokio::test]
    async fn test_rename_missing_conversation() {
        let store = SqliteChatStore::in_memory().await.unwrap();
        let result = store.rename_conversation("nope", "title").await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }
}
