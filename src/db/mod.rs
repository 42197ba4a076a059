//! Database persistence for restart recovery and audit.
//!
//! Stores:
//! - The latest EMA snapshot (single row)
//! - An append-only journal of engine events

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::events::EngineEvent;
use crate::trading::EmaState;

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// EMA snapshot row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredEmaState {
    fast_value: f64,
    slow_value: f64,
    period_fast: i64,
    period_slow: i64,
    initialized: bool,
    last_date: Option<NaiveDate>,
}

/// Journal row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: i64,
    pub timestamp: String,
    pub kind: String,
    pub payload: String,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_pool_size(database_url, 5).await
    }

    async fn with_pool_size(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // EMA snapshot
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ema_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                fast_value REAL NOT NULL,
                slow_value REAL NOT NULL,
                period_fast INTEGER NOT NULL,
                period_slow INTEGER NOT NULL,
                initialized INTEGER NOT NULL DEFAULT 0,
                last_date TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Event journal
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== EMA State ====================

    /// Save the averages, replacing any previous snapshot.
    pub async fn save_ema_state(&self, state: &EmaState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ema_state (id, fast_value, slow_value, period_fast, period_slow, initialized, last_date)
            VALUES (1, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                fast_value = excluded.fast_value,
                slow_value = excluded.slow_value,
                period_fast = excluded.period_fast,
                period_slow = excluded.period_slow,
                initialized = excluded.initialized,
                last_date = excluded.last_date,
                updated_at = datetime('now')
            "#,
        )
        .bind(state.fast_value)
        .bind(state.slow_value)
        .bind(i64::from(state.period_fast))
        .bind(i64::from(state.period_slow))
        .bind(state.initialized)
        .bind(state.last_date)
        .execute(&self.pool)
        .await
        .context("Failed to save EMA state")?;

        Ok(())
    }

    /// Load the last saved averages, if any.
    pub async fn load_ema_state(&self) -> Result<Option<EmaState>> {
        let row = sqlx::query_as::<_, StoredEmaState>(
            "SELECT fast_value, slow_value, period_fast, period_slow, initialized, last_date FROM ema_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load EMA state")?;

        Ok(row.map(|r| EmaState {
            fast_value: r.fast_value,
            slow_value: r.slow_value,
            period_fast: u32::try_from(r.period_fast).unwrap_or(0),
            period_slow: u32::try_from(r.period_slow).unwrap_or(0),
            initialized: r.initialized,
            last_date: r.last_date,
        }))
    }

    // ==================== Events ====================

    /// Append a batch of events in one transaction.
    pub async fn record_events(&self, events: &[EngineEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for event in events {
            let payload = serde_json::to_string(event).context("Failed to serialize event")?;
            sqlx::query("INSERT INTO events (timestamp, kind, payload) VALUES (?, ?, ?)")
                .bind(event.timestamp.to_rfc3339())
                .bind(event.name())
                .bind(payload)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Most recent events, newest first.
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<StoredEvent>> {
        sqlx::query_as::<_, StoredEvent>(
            "SELECT id, timestamp, kind, payload FROM events ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch events")
    }

    /// Number of journal entries of one kind.
    pub async fn count_events(&self, kind: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events WHERE kind = ?")
            .bind(kind)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
