use async_trait::async_trait;
use tokio_rusqlite::Connection;

use crate::error::AppError;
use crate::session::{Session, SessionBackend};

/// Durable session backend: one JSON document per user in SQLite.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Opens (or creates) the database at `path` and makes sure the schema exists.
    pub async fn open(path: &str) -> Result<Self, AppError> {
        let conn = Connection::open(path).await?;
        let db = Self { conn };
        db.init().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init().await?;
        Ok(db)
    }

    /// Idempotent schema setup. `auto_rename_sessions` is keyed by user id,
    /// with no secondary indices.
    async fn init(&self) -> Result<(), AppError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode = WAL;
                    CREATE TABLE IF NOT EXISTS auto_rename_sessions (
                        user_id INTEGER PRIMARY KEY,
                        document TEXT NOT NULL,
                        updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
                    );
                    "#,
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionBackend for SqliteBackend {
    async fn load(&self, user_id: u64) -> Result<Option<Session>, AppError> {
        let key = user_id as i64;
        let raw: Option<String> = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT document FROM auto_rename_sessions WHERE user_id = ?1")?;
                let mut rows = stmt.query([key])?;
                if let Some(row) = rows.next()? {
                    let v: String = row.get(0)?;
                    Ok(Some(v))
                } else {
                    Ok(None)
                }
            })
            .await?;

        match raw {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &Session) -> Result<(), AppError> {
        let key = session.user_id as i64;
        let doc = serde_json::to_string(session)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO auto_rename_sessions(user_id, document) VALUES(?1, ?2) \
                     ON CONFLICT(user_id) DO UPDATE SET document = excluded.document, \
                     updated_at = strftime('%s','now')",
                    rusqlite::params![key, doc],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn remove(&self, user_id: u64) -> Result<(), AppError> {
        let key = user_id as i64;
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM auto_rename_sessions WHERE user_id = ?1", [key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
