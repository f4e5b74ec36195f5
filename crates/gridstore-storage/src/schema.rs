use rusqlite::Connection;

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
          grid_id TEXT NOT NULL,
          chunk_row INTEGER NOT NULL,
          chunk_col INTEGER NOT NULL,
          data BLOB NOT NULL,
          byte_len INTEGER NOT NULL,
          PRIMARY KEY (grid_id, chunk_row, chunk_col)
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_grid ON chunks(grid_id);
        "#,
    )
}
