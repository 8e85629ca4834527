//! Cursor + event persistence for the event tracker.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use evtrack_core::{Cursor, Event};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("event {0} is already stored")]
    Duplicate(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Append-only log of ingestion boundaries.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Most recently advanced cursor, `None` on the first run.
    async fn last_processed_event_id(&self) -> Result<Option<String>, StoreError>;

    /// Appends a new cursor row stamped with the current time.
    async fn advance(&self, event_id: &str) -> Result<(), StoreError>;
}

/// Idempotent event persistence.
///
/// `exists` is only a pre-check. Implementations must reject a second insert of
/// the same id with [`StoreError::Duplicate`] since check-then-insert is not atomic.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn exists(&self, event_id: &str) -> Result<bool, StoreError>;

    async fn insert(&self, event: &Event) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct DbConfig {
    pub database_url: Option<String>,
    pub user: String,
    pub host: String,
    pub database: String,
    pub password: String,
    pub port: u16,
    pub max_connections: u32,
    pub op_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            user: "evtrack".to_string(),
            host: "localhost".to_string(),
            database: "evtrack".to_string(),
            password: String::new(),
            port: 5432,
            max_connections: 4,
            op_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user)
            .field("host", &self.host)
            .field("database", &self.database)
            .field("password", &"<redacted>")
            .field("port", &self.port)
            .field("max_connections", &self.max_connections)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl DbConfig {
    /// A full `DATABASE_URL` wins over the discrete parameters.
    pub fn connect_options(&self) -> Result<PgConnectOptions, StoreError> {
        if let Some(url) = &self.database_url {
            return Ok(url.parse::<PgConnectOptions>()?);
        }
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database))
    }
}

/// Postgres-backed cursor and event store. One pool per run, released by [`PgStore::close`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgStore {
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        let options = config.connect_options()?;
        let host = options.get_host().to_string();
        let database = options.get_database().unwrap_or_default().to_string();
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.op_timeout)
            .connect_with(options)
            .await?;
        info!(host = %host, database = %database, "connected to event store");
        Ok(Self {
            pool,
            op_timeout: config.op_timeout,
        })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("event store pool closed");
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl CursorStore for PgStore {
    async fn last_processed_event_id(&self) -> Result<Option<String>, StoreError> {
        self.bounded(
            sqlx::query_scalar::<_, String>(
                r#"
                SELECT last_event_id
                  FROM event_tracker
                 ORDER BY updated_at DESC, id DESC
                 LIMIT 1
                "#,
            )
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn advance(&self, event_id: &str) -> Result<(), StoreError> {
        self.bounded(
            sqlx::query("INSERT INTO event_tracker (last_event_id, updated_at) VALUES ($1, NOW())")
                .bind(event_id)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn exists(&self, event_id: &str) -> Result<bool, StoreError> {
        self.bounded(
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM events WHERE event_id = $1)")
                .bind(event_id)
                .fetch_one(&self.pool),
        )
        .await
    }

    async fn insert(&self, event: &Event) -> Result<(), StoreError> {
        let result = self
            .bounded(
                sqlx::query("INSERT INTO events (event_id, data, created_at) VALUES ($1, $2, $3)")
                    .bind(&event.id)
                    .bind(&event.data)
                    .bind(event.created_at)
                    .execute(&self.pool),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(StoreError::Database(sqlx::Error::Database(db_err)))
                if db_err.is_unique_violation() =>
            {
                Err(StoreError::Duplicate(event.id.clone()))
            }
            Err(err) => Err(err),
        }
    }
}

/// In-process store with the same uniqueness and append-only cursor rules as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    events: BTreeMap<String, Event>,
    cursors: Vec<Cursor>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.values().cloned().collect()
    }

    pub async fn cursor_log(&self) -> Vec<Cursor> {
        self.state.lock().await.cursors.clone()
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn last_processed_event_id(&self) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        // max_by_key keeps the last of equal timestamps, i.e. the newest append.
        Ok(state
            .cursors
            .iter()
            .max_by_key(|c| c.updated_at)
            .map(|c| c.last_event_id.clone()))
    }

    async fn advance(&self, event_id: &str) -> Result<(), StoreError> {
        self.state.lock().await.cursors.push(Cursor {
            last_event_id: event_id.to_string(),
            updated_at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn exists(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.events.contains_key(event_id))
    }

    async fn insert(&self, event: &Event) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.events.contains_key(&event.id) {
            return Err(StoreError::Duplicate(event.id.clone()));
        }
        state.events.insert(event.id.clone(), event.clone());
        Ok(())
    }
}
