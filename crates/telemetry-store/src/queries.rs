use crate::{KvStore, StoreError};
use rusqlite::{Connection, params};

impl KvStore {
    pub fn get_u64(&self, namespace: &str, key: &str) -> Result<Option<u64>, StoreError> {
        self.with_conn(|conn| query_value(conn, namespace, key))
    }

    pub fn get_u64_or(&self, namespace: &str, key: &str, default: u64) -> Result<u64, StoreError> {
        Ok(self.get_u64(namespace, key)?.unwrap_or(default))
    }

    pub fn put_u64(&self, namespace: &str, key: &str, value: u64) -> Result<(), StoreError> {
        self.put_many(namespace, &[(key, value)])
    }

    /// Write several keys in one transaction: either all land or none do.
    pub fn put_many(&self, namespace: &str, entries: &[(&str, u64)]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(namespace, key)
                     DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                )?;
                for (key, value) in entries {
                    stmt.execute(params![namespace, key, *value as i64])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }
}

fn query_value(conn: &Connection, namespace: &str, key: &str) -> Result<Option<u64>, StoreError> {
    let value = conn
        .query_row(
            "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;

    Ok(value.map(|v| v as u64))
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, StoreError>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, StoreError> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
