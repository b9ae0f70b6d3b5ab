//! Session checkpoints, read back by startup reconciliation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use super::models::{Session, SessionState};
use crate::db::Database;
use crate::limits::ResourceLimits;
use crate::runtime::InstanceHandle;

/// Where session records are checkpointed.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace the record for `session.id`.
    async fn save(&self, session: &Session) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<Session>>;
}

/// Store used when checkpointing is disabled.
#[derive(Debug, Default, Clone)]
pub struct NoopSessionStore;

#[async_trait]
impl SessionStore for NoopSessionStore {
    async fn save(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Session>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    owner: String,
    state: String,
    runtime_handle: Option<String>,
    created_at: String,
    last_activity_at: String,
    expires_at: String,
    ended_at: Option<String>,
    limits: String,
    error_message: Option<String>,
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("parsing timestamp '{}'", value))?
        .with_timezone(&Utc))
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        let state: SessionState = row
            .state
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let limits: ResourceLimits =
            serde_json::from_str(&row.limits).context("parsing stored limits")?;

        Ok(Session {
            id: row.id,
            owner: row.owner,
            state,
            runtime_handle: row.runtime_handle.map(InstanceHandle::new),
            created_at: parse_time(&row.created_at)?,
            last_activity_at: parse_time(&row.last_activity_at)?,
            expires_at: parse_time(&row.expires_at)?,
            ended_at: row.ended_at.as_deref().map(parse_time).transpose()?,
            error_message: row.error_message,
            limits,
        })
    }
}

/// SQLite-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        let limits = serde_json::to_string(&session.limits).context("serializing limits")?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, owner, state, runtime_handle, created_at, last_activity_at,
                expires_at, ended_at, limits, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                runtime_handle = excluded.runtime_handle,
                last_activity_at = excluded.last_activity_at,
                expires_at = excluded.expires_at,
                ended_at = excluded.ended_at,
                error_message = excluded.error_message
            "#,
        )
        .bind(&session.id)
        .bind(&session.owner)
        .bind(session.state.to_string())
        .bind(session.runtime_handle.as_ref().map(|h| h.to_string()))
        .bind(session.created_at.to_rfc3339())
        .bind(session.last_activity_at.to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .bind(session.ended_at.map(|t| t.to_rfc3339()))
        .bind(limits)
        .bind(&session.error_message)
        .execute(&self.pool)
        .await
        .context("saving session")?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, owner, state, runtime_handle, created_at, last_activity_at,
                   expires_at, ended_at, limits, error_message
            FROM sessions
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        rows.into_iter().map(Session::try_from).collect()
    }
}
