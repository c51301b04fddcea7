//! Durable append-only event log on PostgreSQL.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use super::{Backend, KindMatcher};
use crate::error::Result;
use crate::event::{Aggregate, Event};
use crate::pubsub::{Publisher, Selector, Subscription};

/// Connection parameters for the durable log.
#[derive(Debug, Clone)]
pub struct PgBackendConfig {
    /// Connection URL, e.g. `postgres://weft@localhost/weft`.
    pub url: String,
    /// Connection pool size.
    pub max_connections: u32,
}

impl PgBackendConfig {
    /// Config with the default pool size.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
        }
    }
}

const SCHEMA: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS weft",
    r#"
    CREATE TABLE IF NOT EXISTS weft.events (
        aggregate_kind TEXT NOT NULL,
        aggregate_id   TEXT NOT NULL,
        sequence       BIGINT NOT NULL,
        event_type     TEXT NOT NULL,
        payload        JSONB NOT NULL,
        metadata       JSONB NOT NULL DEFAULT '{}'::jsonb,
        parent_kind    TEXT,
        parent_id      TEXT,
        created_at     TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (aggregate_kind, aggregate_id, sequence)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS events_kind_idx ON weft.events (aggregate_kind)",
];

/// Durable event backend: one logical subject per aggregate kind, realized
/// as an append-only `weft.events` table.
///
/// Per-aggregate append order is enforced with a transaction-scoped
/// advisory lock on the aggregate key, under which the next sequence is
/// computed and the row inserted.
///
/// Subscriptions fan out in-process after a successful commit.
// TODO: bridge LISTEN/NOTIFY so subscriptions span processes.
pub struct PgBackend {
    pool: PgPool,
    publisher: Arc<Publisher<Event>>,
}

impl PgBackend {
    /// Connect and ensure the schema exists.
    pub async fn connect(config: PgBackendConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        let backend = Self {
            pool,
            publisher: Arc::new(Publisher::new()),
        };
        backend.migrate().await?;
        info!(max_connections = config.max_connections, "Durable event log ready");
        Ok(backend)
    }

    /// Wrap an existing pool; the schema must already exist.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            publisher: Arc::new(Publisher::new()),
        }
    }

    /// Apply the schema.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Event> {
        let metadata: serde_json::Value = row.try_get("metadata")?;
        let metadata: BTreeMap<String, String> =
            serde_json::from_value(metadata).unwrap_or_default();
        let parent = match (
            row.try_get::<Option<String>, _>("parent_kind")?,
            row.try_get::<Option<String>, _>("parent_id")?,
        ) {
            (Some(kind), Some(id)) => Some(Aggregate::new(kind, id)),
            _ => None,
        };
        Ok(Event {
            aggregate: Aggregate::new(
                row.try_get::<String, _>("aggregate_kind")?,
                row.try_get::<String, _>("aggregate_id")?,
            ),
            parent,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            metadata,
            created_at: row.try_get("created_at")?,
            sequence: row.try_get::<i64, _>("sequence")? as u64,
        })
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn append(&self, mut event: Event) -> Result<Event> {
        event.validate()?;

        let mut tx = self.pool.begin().await?;

        // Serialize appends per aggregate for the duration of the
        // transaction; distinct aggregates proceed in parallel.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(event.aggregate.to_string())
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence) + 1, 0) AS next
            FROM weft.events
            WHERE aggregate_kind = $1 AND aggregate_id = $2
            "#,
        )
        .bind(&event.aggregate.kind)
        .bind(&event.aggregate.id)
        .fetch_one(&mut *tx)
        .await?;
        let next: i64 = row.try_get("next")?;
        event.sequence = next as u64;

        sqlx::query(
            r#"
            INSERT INTO weft.events
                (aggregate_kind, aggregate_id, sequence, event_type, payload,
                 metadata, parent_kind, parent_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&event.aggregate.kind)
        .bind(&event.aggregate.id)
        .bind(next)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(serde_json::to_value(&event.metadata)?)
        .bind(event.parent.as_ref().map(|p| p.kind.clone()))
        .bind(event.parent.as_ref().map(|p| p.id.clone()))
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            aggregate = %event.aggregate,
            event_type = %event.event_type,
            sequence = event.sequence,
            "Appended event"
        );
        self.publisher.publish(&event.labels(), &event);
        Ok(event)
    }

    async fn get(&self, aggregate: &Aggregate) -> Result<Vec<Event>> {
        aggregate.validate()?;
        let rows = sqlx::query(
            r#"
            SELECT aggregate_kind, aggregate_id, sequence, event_type, payload,
                   metadata, parent_kind, parent_id, created_at
            FROM weft.events
            WHERE aggregate_kind = $1 AND aggregate_id = $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(&aggregate.kind)
        .bind(&aggregate.id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode_row).collect()
    }

    async fn list(&self, matcher: KindMatcher<'_>) -> Result<Vec<Aggregate>> {
        let rows = sqlx::query(
            "SELECT DISTINCT aggregate_kind, aggregate_id FROM weft.events",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut aggregates = Vec::new();
        for row in rows {
            let kind: String = row.try_get("aggregate_kind")?;
            if matcher(&kind) {
                aggregates.push(Aggregate::new(kind, row.try_get::<String, _>("aggregate_id")?));
            }
        }
        Ok(aggregates)
    }

    fn subscribe(&self, selector: Selector, buffer: usize) -> Subscription<Event> {
        self.publisher.subscribe(selector, buffer)
    }
}
