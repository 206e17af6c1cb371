use rusqlite::Connection;
use tracing::info;

use crate::StoreError;

pub fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv (
            namespace   TEXT NOT NULL,
            key         TEXT NOT NULL,
            value       INTEGER NOT NULL,
            updated_at  TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (namespace, key)
        );
        ",
    )?;

    info!("State store migrations complete");
    Ok(())
}
