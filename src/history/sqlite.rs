use super::{StoreError, TableBackend};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Single-file table for running the bot without DynamoDB.
#[derive(Clone)]
pub struct SqliteTable {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTable {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = Connection::open(db_path).map_err(backend_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;",
        )
        .map_err(backend_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversation_history (
                session_id   TEXT PRIMARY KEY,
                history_json TEXT NOT NULL,
                updated_at   INTEGER NOT NULL
             );",
        )
        .map_err(backend_err)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_db_path(data_dir: &Path) -> PathBuf {
        data_dir.join("history.db")
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite worker failed: {e}")))?
    }
}

fn unix_seconds_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}

fn backend_err(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn read_history(conn: &Connection, key: &str) -> Result<Option<Vec<Value>>, StoreError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT history_json FROM conversation_history WHERE session_id = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend_err)?;
    json.map(|json| {
        serde_json::from_str(&json)
            .map_err(|e| StoreError::Codec(format!("corrupt history for {key}: {e}")))
    })
    .transpose()
}

fn write_history(conn: &Connection, key: &str, history: &[Value]) -> Result<(), StoreError> {
    let json = serde_json::to_string(history).map_err(|e| StoreError::Codec(e.to_string()))?;
    conn.execute(
        "INSERT INTO conversation_history(session_id, history_json, updated_at)
         VALUES(?1, ?2, ?3)
         ON CONFLICT(session_id) DO UPDATE SET history_json=excluded.history_json, updated_at=excluded.updated_at",
        params![key, json, unix_seconds_now()],
    )
    .map_err(backend_err)?;
    Ok(())
}

#[async_trait]
impl TableBackend for SqliteTable {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<Value>>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| read_history(conn, &key)).await
    }

    async fn put(&self, key: &str, history: Vec<Value>) -> Result<(), StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| write_history(conn, &key, &history))
            .await
    }

    async fn append(&self, key: &str, entries: Vec<Value>) -> Result<(), StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend_err)?;
            let mut history = read_history(&tx, &key)?.unwrap_or_default();
            history.extend(entries);
            write_history(&tx, &key, &history)?;
            tx.commit().map_err(backend_err)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM conversation_history WHERE session_id = ?1",
                params![key],
            )
            .map_err(backend_err)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ChatMessage, HistoryStore, JsonMessageCodec};
    use serde_json::json;

    #[tokio::test]
    async fn sqlite_history_persists_across_instances() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = SqliteTable::default_db_path(dir.path());

        {
            let table = Arc::new(SqliteTable::open(&db_path)?);
            let store = HistoryStore::new(table, Arc::new(JsonMessageCodec));
            store.append("c1", &ChatMessage::human("hi")).await;
            store.append("c1", &ChatMessage::ai("ok")).await;
        }

        let table = Arc::new(SqliteTable::open(&db_path)?);
        let store = HistoryStore::new(table, Arc::new(JsonMessageCodec));
        let history = store.read_all("c1").await;
        assert_eq!(
            history,
            vec![ChatMessage::human("hi"), ChatMessage::ai("ok")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn sqlite_put_get_delete() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = SqliteTable::open(&dir.path().join("nested").join("h.db"))?;

        assert_eq!(table.get("k").await?, None);
        table.put("k", vec![json!({"a": 1})]).await?;
        table.append("k", vec![json!({"b": 2})]).await?;
        assert_eq!(
            table.get("k").await?,
            Some(vec![json!({"a": 1}), json!({"b": 2})])
        );
        table.delete("k").await?;
        assert_eq!(table.get("k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn sqlite_reset_keeps_archive_row() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = Arc::new(SqliteTable::open(&dir.path().join("h.db"))?);
        let store = HistoryStore::new(table.clone(), Arc::new(JsonMessageCodec));
        store.append("c1", &ChatMessage::human("hi")).await;
        store.reset("c1").await;

        assert!(table.get("c1").await?.is_none());
        let archived: i64 = {
            let conn = table.conn.lock();
            conn.query_row(
                "SELECT COUNT(*) FROM conversation_history WHERE session_id LIKE 'c1#%'",
                [],
                |row| row.get(0),
            )?
        };
        assert_eq!(archived, 1);
        Ok(())
    }
}
