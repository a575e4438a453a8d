//! User store: keyed lookup and update of user records.
//!
//! The notification subsystem only reads and writes the slice of the user
//! record it owns (channels, topics, history, preferences). Two backends:
//! - `InMemoryUserStore` for tests and credential-less runs
//! - `PgUserStore` storing the record as JSONB in PostgreSQL

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::sync::RwLock;
use uuid::Uuid;

use nudge_common::error::NotifyError;
use nudge_common::types::{Topic, User};

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, NotifyError>;

    async fn save(&self, user: &User) -> Result<(), NotifyError>;

    /// Ids of all users whose record lists `topic`.
    async fn find_by_topic(&self, topic: Topic) -> Result<Vec<Uuid>, NotifyError>;

    /// Load a user or fail with `NotFound`.
    async fn require(&self, user_id: Uuid) -> Result<User, NotifyError> {
        self.find_by_id(user_id)
            .await?
            .ok_or_else(|| NotifyError::user_not_found(user_id))
    }
}

/// Process-local user store.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: User) {
        self.users.write().await.insert(user.id, user);
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, NotifyError> {
        Ok(self.users.read().await.get(&user_id).cloned())
    }

    async fn save(&self, user: &User) -> Result<(), NotifyError> {
        self.users.write().await.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_by_topic(&self, topic: Topic) -> Result<Vec<Uuid>, NotifyError> {
        let users = self.users.read().await;
        let mut ids: Vec<Uuid> = users
            .values()
            .filter(|u| u.topics.contains(&topic))
            .map(|u| u.id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// PostgreSQL-backed user store.
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, NotifyError> {
        let row: Option<(Json<User>,)> = sqlx::query_as("SELECT data FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(Json(user),)| user))
    }

    async fn save(&self, user: &User) -> Result<(), NotifyError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, data, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE SET data = $2, updated_at = NOW()
            "#,
        )
        .bind(user.id)
        .bind(Json(user))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_topic(&self, topic: Topic) -> Result<Vec<Uuid>, NotifyError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM users WHERE jsonb_exists(data -> 'topics', $1) ORDER BY id",
        )
        .bind(topic.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
