//! Conversation persistence
//!
//! The runtime saves a conversation's turns after every cycle and loads them
//! back on resume. Postgres when a database URL is configured, in-memory
//! otherwise.

use crate::error::AgentError;
use crate::models::{derive_title, ConversationMeta, StoredConversation, Turn};
use crate::Result;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_TITLE: &str = "New conversation";

#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    /// Short backend name for logs and health output
    fn backend(&self) -> &'static str;

    async fn create(&self, user_id: &str) -> Result<ConversationMeta>;

    /// A user's conversations, most recently updated first
    async fn list(&self, user_id: &str) -> Result<Vec<ConversationMeta>>;

    async fn load(&self, id: Uuid) -> Result<Option<StoredConversation>>;

    /// Replace the stored turns of an existing conversation
    async fn save(&self, id: Uuid, turns: &[Turn]) -> Result<()>;

    /// Returns whether a conversation was deleted
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

fn title_for(turns: &[Turn]) -> String {
    let title = derive_title(turns);
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    }
}

/// In-memory store for development and tests
pub struct InMemoryConversationStore {
    conversations: Arc<RwLock<HashMap<Uuid, StoredConversation>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self {
            conversations: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    fn backend(&self) -> &'static str {
        "in-memory"
    }

    async fn create(&self, user_id: &str) -> Result<ConversationMeta> {
        let now = Utc::now();
        let meta = ConversationMeta {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
        };

        let mut conversations = self.conversations.write().await;
        conversations.insert(
            meta.id,
            StoredConversation {
                meta: meta.clone(),
                turns: Vec::new(),
            },
        );

        Ok(meta)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ConversationMeta>> {
        let conversations = self.conversations.read().await;
        let mut metas: Vec<ConversationMeta> = conversations
            .values()
            .filter(|c| c.meta.user_id == user_id)
            .map(|c| c.meta.clone())
            .collect();
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(metas)
    }

    async fn load(&self, id: Uuid) -> Result<Option<StoredConversation>> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(&id).cloned())
    }

    async fn save(&self, id: Uuid, turns: &[Turn]) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(&id)
            .ok_or_else(|| AgentError::ConversationNotFound(id.to_string()))?;

        conversation.turns = turns.to_vec();
        conversation.meta.title = title_for(turns);
        conversation.meta.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut conversations = self.conversations.write().await;
        Ok(conversations.remove(&id).is_some())
    }
}

/// Postgres-backed store; turns are kept as ordered JSONB rows
pub struct PostgresConversationStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> AgentError {
    move |e| AgentError::DatabaseError(format!("{}: {}", context, e))
}

impl PostgresConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    /// Lazily connecting pool; nothing touches the network until first use
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(db_error("Invalid database URL"))?;
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = &self.pool;

        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversations (
                      id UUID PRIMARY KEY,
                      user_id TEXT NOT NULL,
                      title TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_turns (
                      conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                      position INTEGER NOT NULL,
                      turn JSONB NOT NULL,
                      PRIMARY KEY (conversation_id, position)
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_conversations_user_updated
                    ON conversations (user_id, updated_at DESC);
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(db_error("Failed to initialize conversation schema"))?;

        Ok(())
    }

    fn meta_from_row(row: &PgRow) -> Result<ConversationMeta> {
        let read = || -> std::result::Result<ConversationMeta, sqlx::Error> {
            Ok(ConversationMeta {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                title: row.try_get("title")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        };
        read().map_err(db_error("Malformed conversation row"))
    }
}

#[async_trait::async_trait]
impl ConversationStore for PostgresConversationStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn create(&self, user_id: &str) -> Result<ConversationMeta> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, title)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, title, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(DEFAULT_TITLE)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create conversation"))?;

        Self::meta_from_row(&row)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ConversationMeta>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, title, created_at, updated_at
            FROM conversations
            WHERE user_id = $1
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list conversations"))?;

        rows.iter().map(Self::meta_from_row).collect()
    }

    async fn load(&self, id: Uuid) -> Result<Option<StoredConversation>> {
        self.ensure_schema().await?;

        let Some(meta_row) = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load conversation"))?
        else {
            return Ok(None);
        };

        let meta = Self::meta_from_row(&meta_row)?;

        let rows = sqlx::query(
            "SELECT turn FROM conversation_turns WHERE conversation_id = $1 ORDER BY position ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load conversation turns"))?;

        let turns = rows
            .iter()
            .map(|row| {
                row.try_get::<Json<Turn>, _>("turn")
                    .map(|Json(turn)| turn)
                    .map_err(db_error("Malformed conversation turn"))
            })
            .collect::<Result<Vec<Turn>>>()?;

        Ok(Some(StoredConversation { meta, turns }))
    }

    async fn save(&self, id: Uuid, turns: &[Turn]) -> Result<()> {
        self.ensure_schema().await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction for saving conversation"))?;

        let updated = sqlx::query(
            "UPDATE conversations SET title = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(title_for(turns))
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to update conversation"))?;

        if updated.rows_affected() == 0 {
            return Err(AgentError::ConversationNotFound(id.to_string()));
        }

        sqlx::query("DELETE FROM conversation_turns WHERE conversation_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to clear old conversation turns"))?;

        for (position, turn) in turns.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO conversation_turns (conversation_id, position, turn)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(id)
            .bind(position as i32)
            .bind(Json(turn))
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to insert conversation turn"))?;
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit conversation transaction"))?;

        debug!(conversation_id = %id, turns = turns.len(), "Conversation saved");
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.ensure_schema().await?;

        let deleted = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to delete conversation"))?;

        Ok(deleted.rows_affected() > 0)
    }
}

/// Postgres when `database_url` is usable, in-memory otherwise
pub fn build_store(database_url: Option<&str>) -> Arc<dyn ConversationStore> {
    if let Some(url) = database_url {
        match PostgresConversationStore::connect_lazy(url) {
            Ok(store) => {
                info!("Conversation store backend: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Conversation store backend: in-memory");
    Arc::new(InMemoryConversationStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ToolInvocation, ToolResult};
    use serde_json::json;

    #[tokio::test]
    async fn test_create_save_load() {
        let store = InMemoryConversationStore::new();
        let meta = store.create("default-user").await.unwrap();
        assert_eq!(meta.title, DEFAULT_TITLE);

        let turns = vec![
            Turn::user("What's my balance?"),
            Turn::ToolInvocation(ToolInvocation::with_id("c1", "get_balance", json!({}))),
            Turn::ToolResult(ToolResult::success("c1", json!({"usdc": "10"}))),
            Turn::assistant("You have 10 USDC."),
        ];
        store.save(meta.id, &turns).await.unwrap();

        let loaded = store.load(meta.id).await.unwrap().unwrap();
        assert_eq!(loaded.turns, turns);
        assert_eq!(loaded.meta.title, "What's my balance?");
        assert!(loaded.meta.updated_at >= meta.updated_at);
    }

    #[tokio::test]
    async fn test_save_unknown_conversation() {
        let store = InMemoryConversationStore::new();
        let result = store.save(Uuid::new_v4(), &[]).await;
        assert!(matches!(result, Err(AgentError::ConversationNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_is_scoped_and_recent_first() {
        let store = InMemoryConversationStore::new();
        let first = store.create("alice").await.unwrap();
        let second = store.create("alice").await.unwrap();
        store.create("bob").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.save(first.id, &[Turn::user("latest")]).await.unwrap();

        let listed = store.list("alice").await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryConversationStore::new();
        let meta = store.create("alice").await.unwrap();

        assert!(store.delete(meta.id).await.unwrap());
        assert!(!store.delete(meta.id).await.unwrap());
        assert!(store.load(meta.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_build_store_falls_back_to_memory() {
        assert_eq!(build_store(None).backend(), "in-memory");
        assert_eq!(build_store(Some("not a database url")).backend(), "in-memory");
    }
}
