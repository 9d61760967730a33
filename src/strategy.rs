//! Kind-dispatch persistence strategies.
//!
//! Each admitted event is handed to a strategy picked by its kind class. The
//! strategy persists (or deliberately skips persisting) the event and emits
//! the final `OK` acknowledgement itself.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::db::DbPool;
use crate::event::Event;
use crate::protocol::{CommandResult, CommandSink};

/// Kinds replaced per `(pubkey, kind)`.
pub fn is_replaceable(kind: u16) -> bool {
    matches!(kind, 0 | 3) || (10000..20000).contains(&kind)
}

/// Kinds never persisted.
pub fn is_ephemeral(kind: u16) -> bool {
    (20000..30000).contains(&kind)
}

/// Kinds replaced per `(pubkey, kind, d-tag)`.
pub fn is_parameterized_replaceable(kind: u16) -> bool {
    (30000..40000).contains(&kind)
}

/// Persistence behavior for one admitted event.
#[async_trait]
pub trait EventStrategy: Send + Sync {
    /// Persist the event and emit its acknowledgement. Errors are caught by
    /// the caller; on success this is the only emitter for the submission.
    async fn execute(
        &self,
        event: &Event,
        expires_at: Option<u64>,
        sink: &CommandSink,
    ) -> Result<()>;
}

/// Picks a strategy for an event; `None` refuses the event as unsupported.
pub trait StrategyFactory: Send + Sync {
    fn resolve(&self, event: &Event) -> Option<Arc<dyn EventStrategy>>;
}

/// Event persistence over the `events` table.
#[derive(Clone)]
pub struct EventStore {
    pool: DbPool,
}

impl EventStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn bind_event<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        ev: &'q Event,
        tags: String,
        expires_at: Option<u64>,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        query
            .bind(&ev.id)
            .bind(&ev.pubkey)
            .bind(ev.kind)
            .bind(ev.created_at as i64)
            .bind(tags)
            .bind(&ev.content)
            .bind(&ev.sig)
            .bind(ev.d_tag())
            .bind(expires_at.map(|e| e as i64))
    }

    /// Insert if absent; false when the ID already exists.
    pub async fn insert(&self, ev: &Event, expires_at: Option<u64>) -> Result<bool> {
        let tags = serde_json::to_string(&ev.tags)?;
        let result = Self::bind_event(
            sqlx::query(
                r#"
                INSERT INTO events (id, pubkey, kind, created_at, tags, content, sig, d_tag, expires_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO NOTHING
                "#,
            ),
            ev,
            tags,
            expires_at,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Keep only the newest event per `(pubkey, kind)`; false when a newer
    /// version already exists.
    pub async fn replace(&self, ev: &Event, expires_at: Option<u64>) -> Result<bool> {
        self.replace_where(ev, expires_at, None).await
    }

    /// Keep only the newest event per `(pubkey, kind, d-tag)`.
    pub async fn replace_parameterized(
        &self,
        ev: &Event,
        expires_at: Option<u64>,
    ) -> Result<bool> {
        // A missing `d` tag keys the empty parameter.
        let d = ev.d_tag().unwrap_or("");
        self.replace_where(ev, expires_at, Some(d)).await
    }

    async fn replace_where(
        &self,
        ev: &Event,
        expires_at: Option<u64>,
        d_tag: Option<&str>,
    ) -> Result<bool> {
        let tags = serde_json::to_string(&ev.tags)?;
        let mut tx = self.pool.begin().await?;
        let newer: i64 = match d_tag {
            Some(d) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM events
                     WHERE pubkey = ?1 AND kind = ?2 AND COALESCE(d_tag, '') = ?3 AND created_at > ?4",
                )
                .bind(&ev.pubkey)
                .bind(ev.kind)
                .bind(d)
                .bind(ev.created_at as i64)
                .fetch_one(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM events
                     WHERE pubkey = ?1 AND kind = ?2 AND created_at > ?3",
                )
                .bind(&ev.pubkey)
                .bind(ev.kind)
                .bind(ev.created_at as i64)
                .fetch_one(&mut *tx)
                .await?
            }
        };
        if newer > 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        match d_tag {
            Some(d) => {
                sqlx::query(
                    "DELETE FROM events
                     WHERE pubkey = ?1 AND kind = ?2 AND COALESCE(d_tag, '') = ?3",
                )
                .bind(&ev.pubkey)
                .bind(ev.kind)
                .bind(d)
                .execute(&mut *tx)
                .await?
            }
            None => {
                sqlx::query("DELETE FROM events WHERE pubkey = ?1 AND kind = ?2")
                    .bind(&ev.pubkey)
                    .bind(ev.kind)
                    .execute(&mut *tx)
                    .await?
            }
        };
        Self::bind_event(
            sqlx::query(
                r#"
                INSERT INTO events (id, pubkey, kind, created_at, tags, content, sig, d_tag, expires_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO NOTHING
                "#,
            ),
            ev,
            tags,
            expires_at,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Delete events whose attached expiry has passed.
    pub async fn delete_expired(&self, now: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM events WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        )
        .bind(now as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Load one event by ID.
    #[cfg(test)]
    pub async fn find_by_id(&self, id: &str) -> Result<Option<Event>> {
        let row: Option<(String, String, u16, i64, String, String, String)> =
            sqlx::query_as(
                "SELECT id, pubkey, kind, created_at, tags, content, sig
                 FROM events WHERE id = ?1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some((id, pubkey, kind, created_at, tags, content, sig)) = row else {
            return Ok(None);
        };
        Ok(Some(Event {
            id,
            pubkey,
            kind,
            created_at: created_at as u64,
            tags: serde_json::from_str(&tags)?,
            content,
            sig,
        }))
    }
}

/// Insert-if-absent persistence for regular events.
pub struct DefaultStrategy {
    store: EventStore,
}

#[async_trait]
impl EventStrategy for DefaultStrategy {
    async fn execute(
        &self,
        event: &Event,
        expires_at: Option<u64>,
        sink: &CommandSink,
    ) -> Result<()> {
        // Re-submissions of a stored event acknowledge idempotently.
        self.store.insert(event, expires_at).await?;
        sink.send(&CommandResult::ok(&event.id));
        Ok(())
    }
}

/// Newest-wins persistence per `(pubkey, kind)`.
pub struct ReplaceableStrategy {
    store: EventStore,
}

#[async_trait]
impl EventStrategy for ReplaceableStrategy {
    async fn execute(
        &self,
        event: &Event,
        expires_at: Option<u64>,
        sink: &CommandSink,
    ) -> Result<()> {
        self.store.replace(event, expires_at).await?;
        sink.send(&CommandResult::ok(&event.id));
        Ok(())
    }
}

/// Newest-wins persistence per `(pubkey, kind, d-tag)`.
pub struct ParameterizedReplaceableStrategy {
    store: EventStore,
}

#[async_trait]
impl EventStrategy for ParameterizedReplaceableStrategy {
    async fn execute(
        &self,
        event: &Event,
        expires_at: Option<u64>,
        sink: &CommandSink,
    ) -> Result<()> {
        self.store.replace_parameterized(event, expires_at).await?;
        sink.send(&CommandResult::ok(&event.id));
        Ok(())
    }
}

/// Acknowledge without persisting.
pub struct EphemeralStrategy;

#[async_trait]
impl EventStrategy for EphemeralStrategy {
    async fn execute(
        &self,
        event: &Event,
        _expires_at: Option<u64>,
        sink: &CommandSink,
    ) -> Result<()> {
        sink.send(&CommandResult::ok(&event.id));
        Ok(())
    }
}

/// Default dispatch over the standard kind classes.
pub struct KindStrategyFactory {
    default_strategy: Arc<DefaultStrategy>,
    replaceable: Arc<ReplaceableStrategy>,
    parameterized: Arc<ParameterizedReplaceableStrategy>,
    ephemeral: Arc<EphemeralStrategy>,
}

impl KindStrategyFactory {
    pub fn new(store: EventStore) -> Self {
        Self {
            default_strategy: Arc::new(DefaultStrategy {
                store: store.clone(),
            }),
            replaceable: Arc::new(ReplaceableStrategy {
                store: store.clone(),
            }),
            parameterized: Arc::new(ParameterizedReplaceableStrategy { store }),
            ephemeral: Arc::new(EphemeralStrategy),
        }
    }
}

impl StrategyFactory for KindStrategyFactory {
    fn resolve(&self, event: &Event) -> Option<Arc<dyn EventStrategy>> {
        let kind = event.kind;
        if is_ephemeral(kind) {
            Some(self.ephemeral.clone())
        } else if is_replaceable(kind) {
            Some(self.replaceable.clone())
        } else if is_parameterized_replaceable(kind) {
            Some(self.parameterized.clone())
        } else {
            Some(self.default_strategy.clone())
        }
    }
}
