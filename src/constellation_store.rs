// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Persistence of user-drawn constellations. Submissions are append-only.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use canonical_error::{CanonicalError, internal_error, invalid_argument_error};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

/// How many submissions a listing returns.
pub const RECENT_LIMIT: usize = 50;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS constellations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT,
    user_name TEXT,
    image_data TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS constellations_created_at
    ON constellations (created_at);
";

/// Client-supplied fields of a submission, as posted by the viewer.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct NewConstellation {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "user_name")]
    pub submitter_name: Option<String>,
    #[serde(rename = "image_data")]
    pub image_payload: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConstellationSubmission {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "user_name")]
    pub submitter_name: Option<String>,
    #[serde(rename = "image_data")]
    pub image_payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Storage for constellation submissions. Each call is atomic on its own;
/// there is no ordering between concurrent creates beyond each being visible
/// to listings that start after it returns.
#[async_trait]
pub trait ConstellationStore {
    /// Records a submission. InvalidArgument if the name is missing or blank.
    async fn create(&self, submission: NewConstellation)
                    -> Result<ConstellationSubmission, CanonicalError>;

    /// Up to `limit` submissions, newest first.
    async fn list_recent(&self, limit: usize)
                         -> Result<Vec<ConstellationSubmission>, CanonicalError>;
}

pub struct SqliteConstellationStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteConstellationStore {
    /// Opens (creating if needed) the database file.
    pub fn open(path: &Path) -> Result<Self, CanonicalError> {
        let connection = Connection::open(path).map_err(|e| internal_error(
            format!("Could not open database {:?}: {}", path, e).as_str()))?;
        info!("Using constellation database {:?}", path);
        Self::with_schema(connection)
    }

    pub fn open_in_memory() -> Result<Self, CanonicalError> {
        let connection = Connection::open_in_memory().map_err(|e| internal_error(
            format!("Could not open in-memory database: {}", e).as_str()))?;
        Self::with_schema(connection)
    }

    fn with_schema(connection: Connection) -> Result<Self, CanonicalError> {
        connection.execute_batch(SCHEMA).map_err(|e| internal_error(
            format!("Could not create schema: {}", e).as_str()))?;
        Ok(SqliteConstellationStore {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    // Runs `op` on a blocking thread holding the connection. The lock guard
    // is the per-operation handle; it is released when `op` returns or
    // unwinds.
    async fn with_connection<T, F>(&self, op: F) -> Result<T, CanonicalError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let mut locked_connection = connection.lock().map_err(
                |_| internal_error("Database connection lock poisoned"))?;
            op(&mut *locked_connection).map_err(|e| internal_error(
                format!("Database error: {}", e).as_str()))
        })
        .await
        .map_err(|e| internal_error(
            format!("Database task failed: {}", e).as_str()))?
    }
}

fn row_to_submission(row: &rusqlite::Row<'_>)
                     -> rusqlite::Result<ConstellationSubmission> {
    Ok(ConstellationSubmission {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        submitter_name: row.get(3)?,
        image_payload: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[async_trait]
impl ConstellationStore for SqliteConstellationStore {
    async fn create(&self, submission: NewConstellation)
                    -> Result<ConstellationSubmission, CanonicalError> {
        let name = match submission.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                return Err(invalid_argument_error(
                    "Constellation name is required"));
            }
        };
        let created_at = Utc::now();
        let inserted = self.with_connection(move |connection| {
            let tx = connection.transaction()?;
            tx.execute(
                "INSERT INTO constellations
                     (name, description, user_name, image_data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, submission.description, submission.submitter_name,
                        submission.image_payload, created_at])?;
            let id = tx.last_insert_rowid();
            let inserted = tx.query_row(
                "SELECT id, name, description, user_name, image_data, created_at
                 FROM constellations WHERE id = ?1",
                params![id], row_to_submission).optional()?;
            tx.commit()?;
            Ok(inserted)
        }).await?;
        let inserted = inserted.ok_or_else(
            || internal_error("Inserted constellation could not be read back"))?;
        debug!("Stored constellation {} '{}'", inserted.id, inserted.name);
        Ok(inserted)
    }

    async fn list_recent(&self, limit: usize)
                         -> Result<Vec<ConstellationSubmission>, CanonicalError> {
        let limit = limit as i64;
        self.with_connection(move |connection| {
            let mut statement = connection.prepare(
                "SELECT id, name, description, user_name, image_data, created_at
                 FROM constellations
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?1")?;
            let rows = statement.query_map(params![limit], row_to_submission)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        }).await
    }
}

// mod tests.
