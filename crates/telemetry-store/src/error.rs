/// Failures surfaced by the ring log and the state store.
///
/// Checksum failures on individual ring slots are not errors: they are
/// logged and the slot is left out of the batch.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("ring of {size} bytes holds {capacity} records, at least {min} are required")]
    CapacityTooSmall { size: u64, capacity: u64, min: u64 },

    #[error("ring of {size} bytes exceeds the addressable {max} records")]
    CapacityTooLarge { size: u64, max: u64 },

    #[error("ring file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}
