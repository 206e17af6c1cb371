use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use telemetry_types::SampleRecord;
use tracing::{debug, info, warn};

use crate::format::{self, HEADER_SIZE, RECORD_STRIDE, RingHeader};
use crate::{KvStore, StoreError};

/// Smallest ring worth running: anything below this is a sizing mistake.
pub const MIN_CAPACITY: u64 = 16;

/// Namespace of the cursor keys in the state store.
pub const CURSOR_NAMESPACE: &str = "ring";
const KEY_HEAD: &str = "head";
const KEY_TAIL: &str = "tail";
const KEY_FULL: &str = "full";

/// Logical window of live records: `[tail, head)`.
///
/// Both counters only ever grow; slot positions are `index % capacity`.
/// Differences are taken with wrapping arithmetic so ordering never
/// depends on `head > tail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    pub head: u64,
    pub tail: u64,
    pub full: bool,
}

impl Cursor {
    pub fn len(&self) -> u64 {
        self.head.wrapping_sub(self.tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records read from the ring for one send attempt.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Logical index of the first slot scanned (the tail at read time).
    pub start: u64,
    /// Slots scanned, including corrupted ones that were skipped.
    pub span: u64,
    /// Records whose checksum verified, in order.
    pub records: Vec<SampleRecord>,
}

impl Batch {
    pub fn end(&self) -> u64 {
        self.start.wrapping_add(self.span)
    }

    pub fn is_empty(&self) -> bool {
        self.span == 0
    }

    /// Slots scanned that did not yield a record.
    pub fn skipped(&self) -> u64 {
        self.span - self.records.len() as u64
    }
}

/// Fixed-capacity, power-loss tolerant circular log of sample records.
///
/// Record bytes live in a pre-sized block file; the cursor lives in the
/// state store. Appends write the slot, sync it, then commit the cursor, so
/// a crash in between leaves a fully written slot just past the persisted
/// head. `open` finds such slots by checksum and stamp and re-adopts them.
///
/// When the ring is full an append overwrites the oldest record. Writers
/// are never blocked or refused.
pub struct RingLog {
    file: File,
    path: PathBuf,
    capacity: u64,
    cursor: Cursor,
    state: Arc<KvStore>,
}

/// The ring as shared between the sample producer and the uplink engine.
/// Lock only around ring calls; never hold the guard across network I/O.
pub type SharedRing = Arc<Mutex<RingLog>>;

pub fn lock_ring(ring: &SharedRing) -> Result<MutexGuard<'_, RingLog>, StoreError> {
    ring.lock().map_err(|_| StoreError::LockPoisoned("ring"))
}

/// Records that fit in a file of `total_size` bytes after the header.
pub fn capacity_for(total_size: u64) -> u64 {
    total_size.saturating_sub(HEADER_SIZE) / RECORD_STRIDE as u64
}

impl RingLog {
    /// Open or create the ring file at `path`, sized to exactly `total_size`
    /// bytes.
    ///
    /// Sizes too small for [`MIN_CAPACITY`] records are rejected before the
    /// filesystem is touched. A file of a different size is re-created, and
    /// a missing or mismatched header formats the ring (cursor reset).
    pub fn open(path: &Path, total_size: u64, state: Arc<KvStore>) -> Result<Self, StoreError> {
        let capacity = capacity_for(total_size);
        if capacity < MIN_CAPACITY {
            return Err(StoreError::CapacityTooSmall {
                size: total_size,
                capacity,
                min: MIN_CAPACITY,
            });
        }
        if capacity > u32::MAX as u64 {
            return Err(StoreError::CapacityTooLarge {
                size: total_size,
                max: u32::MAX as u64,
            });
        }

        let file = ensure_file_sized(path, total_size)?;

        let mut ring = Self {
            file,
            path: path.to_path_buf(),
            capacity,
            cursor: Cursor::default(),
            state,
        };

        let expected = RingHeader::new(capacity as u32);
        match ring.read_header()? {
            Some(header) if header == expected => {
                ring.cursor = match ring.load_cursor()? {
                    Some(cursor) => cursor,
                    None => ring.rebuild_cursor()?,
                };
                ring.recover()?;
                info!(
                    "Ring opened at {} (capacity={} queued={})",
                    path.display(),
                    capacity,
                    ring.count_approx()
                );
            }
            found => {
                if found.is_some() {
                    warn!(
                        "Ring header at {} does not match this layout, reformatting",
                        path.display()
                    );
                }
                ring.format(expected)?;
                info!("Ring formatted at {} (capacity={})", path.display(), capacity);
            }
        }

        Ok(ring)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queued record count: `head - tail`, or `capacity` when full.
    pub fn count_approx(&self) -> u64 {
        if self.cursor.full {
            self.capacity
        } else {
            self.cursor.len()
        }
    }

    /// Persist one record at the head. Overwrites the oldest record when the
    /// ring is full.
    pub fn append(&mut self, rec: &SampleRecord) -> Result<(), StoreError> {
        let index = self.cursor.head;
        let bytes = format::encode_record(rec, index);

        self.file.seek(SeekFrom::Start(self.slot_offset(index)))?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;

        let mut next = self.cursor;
        next.head = next.head.wrapping_add(1);
        if next.len() > self.capacity {
            next.tail = next.tail.wrapping_add(1);
            debug!(tail = next.tail, "Ring full, oldest record overwritten");
        }
        next.full = next.len() >= self.capacity;

        self.commit_cursor(next)
    }

    /// Read up to `max_items` records from the tail without consuming them.
    ///
    /// Slots that fail their checksum are skipped and logged; they still
    /// count toward [`Batch::span`] so committing the batch discards them.
    pub fn read_batch(&mut self, max_items: usize) -> Result<Batch, StoreError> {
        let start = self.cursor.tail;
        if self.cursor.is_empty() {
            return Ok(Batch {
                start,
                ..Batch::default()
            });
        }

        let span = (max_items as u64).min(self.cursor.len());
        let mut records = Vec::with_capacity(span as usize);

        for i in 0..span {
            let index = start.wrapping_add(i);
            match self.read_slot(index)? {
                Some((rec, stamp)) if stamp == index as u32 => records.push(rec),
                _ => warn!(index, "Skipping corrupted ring slot"),
            }
        }

        Ok(Batch {
            start,
            span,
            records,
        })
    }

    /// Advance the tail by up to `count` records. Returns how many were
    /// dropped. Only call after the records were confirmed delivered.
    pub fn drop_records(&mut self, count: u64) -> Result<u64, StoreError> {
        let n = count.min(self.cursor.len());
        if n == 0 {
            return Ok(0);
        }

        let mut next = self.cursor;
        next.tail = next.tail.wrapping_add(n);
        next.full = next.len() >= self.capacity;

        self.commit_cursor(next)?;
        Ok(n)
    }

    /// Drop exactly the slots `batch` covered.
    ///
    /// If the producer overwrote part of the batch since it was read, the
    /// tail has already moved and only the remainder is dropped. Records
    /// appended after the read are never touched.
    pub fn commit(&mut self, batch: &Batch) -> Result<u64, StoreError> {
        let ahead = batch.end().wrapping_sub(self.cursor.tail);
        if ahead > self.cursor.len() {
            // Batch lies entirely behind the tail.
            return Ok(0);
        }
        self.drop_records(ahead)
    }

    fn slot_offset(&self, index: u64) -> u64 {
        HEADER_SIZE + (index % self.capacity) * RECORD_STRIDE as u64
    }

    fn read_slot(&mut self, index: u64) -> Result<Option<(SampleRecord, u32)>, StoreError> {
        let mut buf = [0u8; RECORD_STRIDE];
        self.file.seek(SeekFrom::Start(self.slot_offset(index)))?;
        self.file.read_exact(&mut buf)?;
        Ok(format::decode_record(&buf))
    }

    fn read_header(&mut self) -> Result<Option<RingHeader>, StoreError> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;
        Ok(RingHeader::decode(&buf))
    }

    /// Zero every slot, write the header and reset the cursor.
    fn format(&mut self, header: RingHeader) -> Result<(), StoreError> {
        let total = self.file.metadata()?.len();

        self.file.set_len(0)?;
        self.file.set_len(total)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header.encode())?;
        self.file.sync_all()?;

        self.commit_cursor(Cursor::default())
    }

    /// `None` when the state store holds no cursor for this ring.
    fn load_cursor(&self) -> Result<Option<Cursor>, StoreError> {
        let Some(head) = self.state.get_u64(CURSOR_NAMESPACE, KEY_HEAD)? else {
            return Ok(None);
        };
        let tail = self.state.get_u64_or(CURSOR_NAMESPACE, KEY_TAIL, 0)?;
        let full = self.state.get_u64_or(CURSOR_NAMESPACE, KEY_FULL, 0)? != 0;
        Ok(Some(Cursor { head, tail, full }))
    }

    /// Rebuild the cursor from slot stamps for a formatted ring whose state
    /// store lost its cursor.
    ///
    /// The newest slot whose stamp matches its position becomes `head - 1`,
    /// and the contiguous run of stamps behind it becomes the queue. Records
    /// already delivered before the loss may be queued again.
    fn rebuild_cursor(&mut self) -> Result<Cursor, StoreError> {
        let mut newest: Option<u64> = None;
        for slot in 0..self.capacity {
            if let Some((_, stamp)) = self.read_slot(slot)? {
                let stamp = stamp as u64;
                if stamp % self.capacity == slot && newest.is_none_or(|n| stamp > n) {
                    newest = Some(stamp);
                }
            }
        }

        let Some(newest) = newest else {
            warn!(
                "Ring {} has no stored cursor and no valid slots, starting empty",
                self.path.display()
            );
            self.commit_cursor(Cursor::default())?;
            return Ok(self.cursor);
        };

        let mut run = 1u64;
        while run < self.capacity && run <= newest {
            let index = newest - run;
            match self.read_slot(index)? {
                Some((_, stamp)) if stamp == index as u32 => run += 1,
                _ => break,
            }
        }

        let head = newest + 1;
        let rebuilt = Cursor {
            head,
            tail: head - run,
            full: run >= self.capacity,
        };
        warn!(
            "Ring {} has no stored cursor, rebuilt from slots: head={} tail={} ({} record(s))",
            self.path.display(),
            rebuilt.head,
            rebuilt.tail,
            run
        );
        self.commit_cursor(rebuilt)?;
        Ok(rebuilt)
    }

    /// Repair the cursor after an unclean shutdown.
    ///
    /// Re-adopts slots written past the persisted head (valid checksum and a
    /// stamp equal to their index), then restores `head - tail <= capacity`
    /// and recomputes `full`.
    fn recover(&mut self) -> Result<(), StoreError> {
        let persisted = self.cursor;
        let mut next = persisted;

        let mut adopted = 0u64;
        while adopted < self.capacity {
            match self.read_slot(next.head)? {
                Some((_, stamp)) if stamp == next.head as u32 => {
                    next.head = next.head.wrapping_add(1);
                    adopted += 1;
                }
                _ => break,
            }
        }

        if next.len() > self.capacity {
            if next.tail.wrapping_sub(next.head) <= self.capacity {
                // Tail ahead of head: nothing trustworthy is queued.
                next.tail = next.head;
            } else {
                next.tail = next.head.wrapping_sub(self.capacity);
            }
        }
        next.full = next.len() >= self.capacity;

        if next != persisted {
            warn!(
                "Ring cursor recovered: head {} -> {}, tail {} -> {} ({} slot(s) re-adopted)",
                persisted.head, next.head, persisted.tail, next.tail, adopted
            );
            self.commit_cursor(next)?;
        }
        Ok(())
    }

    fn commit_cursor(&mut self, next: Cursor) -> Result<(), StoreError> {
        self.state.put_many(
            CURSOR_NAMESPACE,
            &[
                (KEY_HEAD, next.head),
                (KEY_TAIL, next.tail),
                (KEY_FULL, next.full as u64),
            ],
        )?;
        self.cursor = next;
        Ok(())
    }
}

/// Open `path` read/write at exactly `size` bytes, re-creating it when the
/// existing file has a different size.
fn ensure_file_sized(path: &Path, size: u64) -> Result<File, StoreError> {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() != size {
            warn!(
                "Ring file {} is {} bytes, expected {}; re-creating",
                path.display(),
                meta.len(),
                size
            );
            fs::remove_file(path)?;
        }
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    if file.metadata()?.len() != size {
        file.set_len(size)?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

    fn scratch_path(name: &str) -> PathBuf {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "telemetry_ring_{}_{}_{}.bin",
            name,
            std::process::id(),
            id
        ));
        let _ = fs::remove_file(&path);
        path
    }

    fn size_for(capacity: u64) -> u64 {
        HEADER_SIZE + capacity * RECORD_STRIDE as u64
    }

    fn rec(ts: u32) -> SampleRecord {
        SampleRecord {
            ts,
            current_ma: ts as i32 * 10,
            power_dw: -(ts as i32),
            temp_cc: (ts % 3000) as i16,
            flags: (ts % 2) as u16,
        }
    }

    fn open_ring(path: &Path, capacity: u64) -> RingLog {
        let kv = Arc::new(KvStore::open_in_memory().unwrap());
        RingLog::open(path, size_for(capacity), kv).unwrap()
    }

    #[test]
    fn fresh_ring_is_empty() {
        let path = scratch_path("fresh");
        let mut ring = open_ring(&path, 16);

        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.count_approx(), 0);
        assert!(ring.cursor().is_empty());
        let batch = ring.read_batch(10).unwrap();
        assert!(batch.is_empty());
        assert!(batch.records.is_empty());

        assert_eq!(fs::metadata(&path).unwrap().len(), size_for(16));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn capacity_is_derived_from_file_size() {
        let path = scratch_path("derived");
        let kv = Arc::new(KvStore::open_in_memory().unwrap());
        // 256 KiB, as deployed: (262144 - 16) / 24
        let ring = RingLog::open(&path, 256 * 1024, kv).unwrap();
        assert_eq!(ring.capacity(), 10_922);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn too_small_is_rejected_without_creating_a_file() {
        let path = scratch_path("small");
        let kv = Arc::new(KvStore::open_in_memory().unwrap());

        let err = RingLog::open(&path, size_for(MIN_CAPACITY) - 1, kv.clone())
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::CapacityTooSmall { capacity: 15, .. }));
        assert!(!path.exists());

        assert!(RingLog::open(&path, 0, kv).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn read_is_non_destructive_and_ordered() {
        let path = scratch_path("read");
        let mut ring = open_ring(&path, 16);
        for ts in 1..=5 {
            ring.append(&rec(ts)).unwrap();
        }

        let first = ring.read_batch(3).unwrap();
        let again = ring.read_batch(3).unwrap();
        assert_eq!(first.records, vec![rec(1), rec(2), rec(3)]);
        assert_eq!(again.records, first.records);
        assert_eq!(ring.count_approx(), 5);

        // Never more than what is queued.
        assert_eq!(ring.read_batch(100).unwrap().records.len(), 5);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn drop_advances_tail_and_clamps() {
        let path = scratch_path("drop");
        let mut ring = open_ring(&path, 16);
        for ts in 1..=4 {
            ring.append(&rec(ts)).unwrap();
        }

        assert_eq!(ring.drop_records(2).unwrap(), 2);
        assert_eq!(ring.read_batch(10).unwrap().records, vec![rec(3), rec(4)]);

        assert_eq!(ring.drop_records(50).unwrap(), 2);
        assert_eq!(ring.count_approx(), 0);
        assert_eq!(ring.cursor().head, ring.cursor().tail);
        assert_eq!(ring.drop_records(1).unwrap(), 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn overwrite_keeps_most_recent_capacity_records() {
        let path = scratch_path("overwrite");
        let mut ring = open_ring(&path, 16);
        for ts in 1..=(16 + 7) {
            ring.append(&rec(ts)).unwrap();
        }

        assert_eq!(ring.count_approx(), 16);
        assert!(ring.cursor().full);
        let batch = ring.read_batch(100).unwrap();
        let expected: Vec<_> = (8..=23).map(rec).collect();
        assert_eq!(batch.records, expected);

        ring.drop_records(1).unwrap();
        assert!(!ring.cursor().full);
        assert_eq!(ring.count_approx(), 15);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupted_slot_is_skipped_alone() {
        let path = scratch_path("corrupt");
        let mut ring = open_ring(&path, 16);
        for ts in 1..=5 {
            ring.append(&rec(ts)).unwrap();
        }

        // Flip the checksum of logical index 2 (ts = 3).
        let offset = HEADER_SIZE + 2 * RECORD_STRIDE as u64 + 16;
        let mut raw = fs::read(&path).unwrap();
        raw[offset as usize] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        let batch = ring.read_batch(10).unwrap();
        assert_eq!(batch.records, vec![rec(1), rec(2), rec(4), rec(5)]);
        assert_eq!(batch.span, 5);
        assert_eq!(batch.skipped(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn commit_never_drops_records_appended_after_read() {
        let path = scratch_path("commit");
        let mut ring = open_ring(&path, 16);
        for ts in 1..=3 {
            ring.append(&rec(ts)).unwrap();
        }
        let batch = ring.read_batch(2).unwrap();
        ring.append(&rec(4)).unwrap();

        assert_eq!(ring.commit(&batch).unwrap(), 2);
        assert_eq!(ring.read_batch(10).unwrap().records, vec![rec(3), rec(4)]);

        // Committing the same batch again is a no-op.
        assert_eq!(ring.commit(&batch).unwrap(), 0);
        assert_eq!(ring.count_approx(), 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn commit_after_overwrite_drops_only_the_remainder() {
        let path = scratch_path("commit_overwrite");
        let mut ring = open_ring(&path, 16);
        for ts in 1..=16 {
            ring.append(&rec(ts)).unwrap();
        }
        let batch = ring.read_batch(4).unwrap(); // ts 1..=4
        for ts in 17..=18 {
            ring.append(&rec(ts)).unwrap(); // overwrites ts 1, 2
        }

        assert_eq!(ring.commit(&batch).unwrap(), 2);
        let remaining = ring.read_batch(100).unwrap();
        assert_eq!(remaining.records.first(), Some(&rec(5)));
        assert_eq!(remaining.records.last(), Some(&rec(18)));
        assert_eq!(ring.count_approx(), 14);
        let _ = fs::remove_file(&path);
    }
}
