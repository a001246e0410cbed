//! SQLite persistence for checkpoint and preference records.
//!
//! Every write is its own committed transaction; with WAL and
//! `synchronous=FULL` a crash can only lose the write in flight.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::instrument;

pub type Pool = SqlitePool;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read persisted state: {0}")]
    Read(#[source] sqlx::Error),
    #[error("failed to persist state: {0}")]
    Write(#[source] sqlx::Error),
    #[error("failed to prepare database: {0}")]
    Setup(String),
}

pub async fn init_pool(database_url: &str) -> Result<Pool, StoreError> {
    let normalized = prepare_sqlite_url(database_url)?;
    let options = SqliteConnectOptions::from_str(&normalized)
        .map_err(|err| StoreError::Setup(err.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    SqlitePool::connect_with(options)
        .await
        .map_err(|err| StoreError::Setup(err.to_string()))
}

/// For a file-backed SQLite URL, expand a leading `~/` and create the parent
/// directory. In-memory and non-SQLite URLs pass through unchanged.
fn prepare_sqlite_url(url: &str) -> Result<String, StoreError> {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return Ok(url.to_string());
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return Ok(url.to_string());
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Setup(format!("cannot create {}: {err}", parent.display()))
            })?;
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    Ok(rebuilt)
}

pub async fn run_migrations(pool: &Pool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| StoreError::Setup(err.to_string()))
}

#[instrument(skip_all)]
pub async fn load_checkpoint(pool: &Pool, session: &str) -> Result<Vec<(i64, String)>, StoreError> {
    let rows = sqlx::query(
        "SELECT conversation_id, outcome FROM checkpoint WHERE session = ? ORDER BY processed_at, conversation_id",
    )
    .bind(session)
    .fetch_all(pool)
    .await
    .map_err(StoreError::Read)?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get::<i64, _>("conversation_id"), row.get::<String, _>("outcome")))
        .collect())
}

#[instrument(skip_all)]
pub async fn upsert_checkpoint(
    pool: &Pool,
    session: &str,
    conversation_id: i64,
    outcome: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO checkpoint (session, conversation_id, outcome) VALUES (?, ?, ?)
         ON CONFLICT (session, conversation_id)
         DO UPDATE SET outcome = excluded.outcome, processed_at = CURRENT_TIMESTAMP",
    )
    .bind(session)
    .bind(conversation_id)
    .bind(outcome)
    .execute(pool)
    .await
    .map_err(StoreError::Write)?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_checkpoint(pool: &Pool, session: &str) -> Result<u64, StoreError> {
    let res = sqlx::query("DELETE FROM checkpoint WHERE session = ?")
        .bind(session)
        .execute(pool)
        .await
        .map_err(StoreError::Write)?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn delete_checkpoint_outcomes(
    pool: &Pool,
    session: &str,
    outcomes: &[&str],
) -> Result<u64, StoreError> {
    let mut tx = pool.begin().await.map_err(StoreError::Write)?;
    let mut removed = 0;
    for outcome in outcomes {
        removed += sqlx::query("DELETE FROM checkpoint WHERE session = ? AND outcome = ?")
            .bind(session)
            .bind(*outcome)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Write)?
            .rows_affected();
    }
    tx.commit().await.map_err(StoreError::Write)?;
    Ok(removed)
}

#[instrument(skip_all)]
pub async fn load_preferences(pool: &Pool, session: &str) -> Result<Vec<String>, StoreError> {
    sqlx::query_scalar::<_, String>(
        "SELECT identifier FROM preference WHERE session = ? ORDER BY position",
    )
    .bind(session)
    .fetch_all(pool)
    .await
    .map_err(StoreError::Read)
}

/// Replace the stored whitelist for `session` with `identifiers`, in order.
#[instrument(skip_all)]
pub async fn replace_preferences(
    pool: &Pool,
    session: &str,
    identifiers: &[String],
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await.map_err(StoreError::Write)?;
    sqlx::query("DELETE FROM preference WHERE session = ?")
        .bind(session)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Write)?;
    for (position, identifier) in identifiers.iter().enumerate() {
        sqlx::query("INSERT INTO preference (session, position, identifier) VALUES (?, ?, ?)")
            .bind(session)
            .bind(position as i64)
            .bind(identifier)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Write)?;
    }
    tx.commit().await.map_err(StoreError::Write)?;
    Ok(())
}
