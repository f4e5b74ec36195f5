use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gridstore_model::ChunkId;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use crate::schema;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Backing store for evicted chunks.
///
/// Blobs are opaque: `get` returns exactly the bytes last `put` for the key.
/// A `put` replaces any previous blob atomically.
pub trait CacheStore: Send + Sync {
    fn put(&self, grid_id: Uuid, chunk_id: ChunkId, bytes: &[u8]) -> Result<()>;

    fn get(&self, grid_id: Uuid, chunk_id: ChunkId) -> Result<Option<Vec<u8>>>;

    /// Chunks holding a blob for `grid_id`, ascending.
    fn chunk_ids(&self, grid_id: Uuid) -> Result<Vec<ChunkId>>;

    /// Drop every blob belonging to `grid_id`.
    fn remove_grid(&self, grid_id: Uuid) -> Result<()>;
}

/// Process-local store, mostly useful for tests and small grids.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    blobs: Mutex<HashMap<(Uuid, ChunkId), Vec<u8>>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().expect("cache store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for InMemoryCacheStore {
    fn put(&self, grid_id: Uuid, chunk_id: ChunkId, bytes: &[u8]) -> Result<()> {
        self.blobs
            .lock()
            .expect("cache store mutex poisoned")
            .insert((grid_id, chunk_id), bytes.to_vec());
        Ok(())
    }

    fn get(&self, grid_id: Uuid, chunk_id: ChunkId) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .expect("cache store mutex poisoned")
            .get(&(grid_id, chunk_id))
            .cloned())
    }

    fn chunk_ids(&self, grid_id: Uuid) -> Result<Vec<ChunkId>> {
        let mut ids: Vec<ChunkId> = self
            .blobs
            .lock()
            .expect("cache store mutex poisoned")
            .keys()
            .filter(|(id, _)| *id == grid_id)
            .map(|(_, chunk_id)| *chunk_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn remove_grid(&self, grid_id: Uuid) -> Result<()> {
        self.blobs
            .lock()
            .expect("cache store mutex poisoned")
            .retain(|(id, _), _| *id != grid_id);
        Ok(())
    }
}

/// SQLite-backed store, on disk or in memory.
#[derive(Debug, Clone)]
pub struct SqliteCacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheStore {
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of blobs stored for `grid_id`.
    pub fn chunk_count(&self, grid_id: Uuid) -> Result<u64> {
        let conn = self.conn.lock().expect("cache store mutex poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE grid_id = ?1",
            params![grid_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Total blob bytes stored for `grid_id`.
    pub fn stored_bytes(&self, grid_id: Uuid) -> Result<u64> {
        let conn = self.conn.lock().expect("cache store mutex poisoned");
        let bytes: i64 = conn.query_row(
            "SELECT COALESCE(SUM(byte_len), 0) FROM chunks WHERE grid_id = ?1",
            params![grid_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(bytes.max(0) as u64)
    }
}

impl CacheStore for SqliteCacheStore {
    fn put(&self, grid_id: Uuid, chunk_id: ChunkId, bytes: &[u8]) -> Result<()> {
        let conn = self.conn.lock().expect("cache store mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO chunks (grid_id, chunk_row, chunk_col, data, byte_len)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (grid_id, chunk_row, chunk_col) DO UPDATE SET
              data = excluded.data,
              byte_len = excluded.byte_len
            "#,
            params![
                grid_id.to_string(),
                chunk_id.row,
                chunk_id.col,
                bytes,
                bytes.len() as i64
            ],
        )?;
        Ok(())
    }

    fn get(&self, grid_id: Uuid, chunk_id: ChunkId) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("cache store mutex poisoned");
        let data = conn
            .query_row(
                "SELECT data FROM chunks \
                 WHERE grid_id = ?1 AND chunk_row = ?2 AND chunk_col = ?3",
                params![grid_id.to_string(), chunk_id.row, chunk_id.col],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(data)
    }

    fn chunk_ids(&self, grid_id: Uuid) -> Result<Vec<ChunkId>> {
        let conn = self.conn.lock().expect("cache store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT chunk_row, chunk_col FROM chunks WHERE grid_id = ?1 \
             ORDER BY chunk_row, chunk_col",
        )?;
        let rows = stmt.query_map(params![grid_id.to_string()], |row| {
            Ok(ChunkId::new(row.get(0)?, row.get(1)?))
        })?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    fn remove_grid(&self, grid_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().expect("cache store mutex poisoned");
        conn.execute(
            "DELETE FROM chunks WHERE grid_id = ?1",
            params![grid_id.to_string()],
        )?;
        Ok(())
    }
}
