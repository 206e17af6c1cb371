//! Durability tests: reopen, crash recovery and long random workloads
//! against a real file and a real SQLite state store.
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use telemetry_store::format::{self, HEADER_SIZE, RECORD_STRIDE};
use telemetry_store::ring::CURSOR_NAMESPACE;
use telemetry_store::{KvStore, RingLog};
use telemetry_types::SampleRecord;

struct Scratch {
    ring: PathBuf,
    db: PathBuf,
}

impl Scratch {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "telemetry_store_test_{}_{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        Self {
            ring: dir.join("queue.bin"),
            db: dir.join("state.db"),
        }
    }

    fn kv(&self) -> Arc<KvStore> {
        Arc::new(KvStore::open(&self.db).unwrap())
    }

    /// Delete the state database (and its WAL files), keeping the ring file.
    fn lose_state(&self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.db.clone().into_os_string();
            path.push(suffix);
            let _ = fs::remove_file(PathBuf::from(path));
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Some(dir) = self.ring.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }
}

fn size_for(capacity: u64) -> u64 {
    HEADER_SIZE + capacity * RECORD_STRIDE as u64
}

fn rec(ts: u32) -> SampleRecord {
    SampleRecord {
        ts,
        current_ma: 1000 + ts as i32,
        power_dw: 2000 + ts as i32,
        temp_cc: 2500,
        flags: 0,
    }
}

/// Write a slot directly, as `append` would, without touching the cursor:
/// the state left behind by a crash between the data write and the commit.
fn write_slot_without_cursor(path: &Path, capacity: u64, index: u64, record: &SampleRecord) {
    let mut file = fs::OpenOptions::new().write(true).open(path).unwrap();
    let offset = HEADER_SIZE + (index % capacity) * RECORD_STRIDE as u64;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&format::encode_record(record, index)).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn contents_survive_reopen() {
    let scratch = Scratch::new("reopen");
    {
        let mut ring = RingLog::open(&scratch.ring, size_for(32), scratch.kv()).unwrap();
        for ts in 1..=10 {
            ring.append(&rec(ts)).unwrap();
        }
        ring.drop_records(4).unwrap();
    }

    let mut ring = RingLog::open(&scratch.ring, size_for(32), scratch.kv()).unwrap();
    assert_eq!(ring.count_approx(), 6);
    let expected: Vec<_> = (5..=10).map(rec).collect();
    assert_eq!(ring.read_batch(100).unwrap().records, expected);
}

#[test]
fn record_written_before_crash_is_recovered() {
    let scratch = Scratch::new("crash_append");
    {
        let mut ring = RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap();
        for ts in 1..=3 {
            ring.append(&rec(ts)).unwrap();
        }
    }
    write_slot_without_cursor(&scratch.ring, 16, 3, &rec(4));

    let kv = scratch.kv();
    let mut ring = RingLog::open(&scratch.ring, size_for(16), kv.clone()).unwrap();
    assert_eq!(ring.count_approx(), 4);
    assert_eq!(ring.read_batch(10).unwrap().records.last(), Some(&rec(4)));
    // The repaired cursor was persisted.
    assert_eq!(kv.get_u64(CURSOR_NAMESPACE, "head").unwrap(), Some(4));
}

#[test]
fn crash_while_full_keeps_invariant() {
    let scratch = Scratch::new("crash_full");
    {
        let mut ring = RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap();
        for ts in 1..=16 {
            ring.append(&rec(ts)).unwrap();
        }
    }
    // Overwrites ts 1 on disk; the cursor still says head=16, tail=0.
    write_slot_without_cursor(&scratch.ring, 16, 16, &rec(17));

    let mut ring = RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap();
    let cursor = ring.cursor();
    assert_eq!(cursor.head, 17);
    assert_eq!(cursor.tail, 1);
    assert!(cursor.full);
    let batch = ring.read_batch(100).unwrap();
    assert_eq!(batch.records.first(), Some(&rec(2)));
    assert_eq!(batch.records.last(), Some(&rec(17)));
}

#[test]
fn stale_slot_from_previous_lap_is_not_adopted() {
    let scratch = Scratch::new("stale");
    {
        let mut ring = RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap();
        for ts in 1..=20 {
            ring.append(&rec(ts)).unwrap();
        }
        ring.drop_records(16).unwrap();
    }

    // Slot for index 20 still holds index 4 from the previous lap.
    let ring = RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap();
    assert_eq!(ring.cursor().head, 20);
    assert_eq!(ring.count_approx(), 0);
}

#[test]
fn inconsistent_cursor_is_repaired() {
    let scratch = Scratch::new("bad_cursor");
    {
        let mut ring = RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap();
        for ts in 1..=5 {
            ring.append(&rec(ts)).unwrap();
        }
    }
    let kv = scratch.kv();
    kv.put_many(CURSOR_NAMESPACE, &[("head", 5), ("tail", 9), ("full", 1)])
        .unwrap();

    let ring = RingLog::open(&scratch.ring, size_for(16), kv).unwrap();
    let cursor = ring.cursor();
    assert_eq!(cursor.head, 5);
    assert_eq!(cursor.tail, 5);
    assert!(!cursor.full);
    assert_eq!(ring.count_approx(), 0);
}

#[test]
fn cursor_is_rebuilt_after_state_loss_on_wrapped_ring() {
    let scratch = Scratch::new("state_loss_wrapped");
    {
        let mut ring = RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap();
        for ts in 1..=20 {
            ring.append(&rec(ts)).unwrap();
        }
        assert_eq!(ring.count_approx(), 16);
    }
    scratch.lose_state();

    let kv = scratch.kv();
    let mut ring = RingLog::open(&scratch.ring, size_for(16), kv.clone()).unwrap();
    let cursor = ring.cursor();
    assert_eq!(cursor.head, 20);
    assert_eq!(cursor.tail, 4);
    assert!(cursor.full);

    let expected: Vec<_> = (5..=20).map(rec).collect();
    assert_eq!(ring.read_batch(100).unwrap().records, expected);
    assert_eq!(kv.get_u64(CURSOR_NAMESPACE, "head").unwrap(), Some(20));

    // Appends carry on from the rebuilt head.
    ring.append(&rec(21)).unwrap();
    assert_eq!(ring.read_batch(100).unwrap().records.last(), Some(&rec(21)));
}

#[test]
fn cursor_is_rebuilt_after_state_loss_before_wrap() {
    let scratch = Scratch::new("state_loss_partial");
    {
        let mut ring = RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap();
        for ts in 1..=5 {
            ring.append(&rec(ts)).unwrap();
        }
    }
    scratch.lose_state();

    let mut ring = RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap();
    assert_eq!(ring.cursor().head, 5);
    assert_eq!(ring.count_approx(), 5);
    assert_eq!(ring.read_batch(100).unwrap().records.first(), Some(&rec(1)));
}

#[test]
fn empty_ring_stays_empty_after_state_loss() {
    let scratch = Scratch::new("state_loss_empty");
    drop(RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap());
    scratch.lose_state();

    let ring = RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap();
    assert!(ring.cursor().is_empty());
    assert_eq!(ring.cursor().head, 0);
}

#[test]
fn resized_file_is_reformatted() {
    let scratch = Scratch::new("resize");
    {
        let mut ring = RingLog::open(&scratch.ring, size_for(16), scratch.kv()).unwrap();
        for ts in 1..=8 {
            ring.append(&rec(ts)).unwrap();
        }
    }

    let ring = RingLog::open(&scratch.ring, size_for(64), scratch.kv()).unwrap();
    assert_eq!(ring.capacity(), 64);
    assert_eq!(ring.count_approx(), 0);
    assert_eq!(fs::metadata(&scratch.ring).unwrap().len(), size_for(64));
}

#[test]
fn random_workload_holds_ring_invariant() {
    let scratch = Scratch::new("random");
    let capacity = 24u64;
    let mut ring = RingLog::open(&scratch.ring, size_for(capacity), scratch.kv()).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5EED);

    // Model of what should be queued.
    let mut model: std::collections::VecDeque<SampleRecord> = Default::default();
    let mut next_ts = 1u32;

    for _ in 0..600 {
        if rng.random_bool(0.65) {
            let r = rec(next_ts);
            next_ts += 1;
            ring.append(&r).unwrap();
            model.push_back(r);
            if model.len() as u64 > capacity {
                model.pop_front();
            }
        } else {
            let n = rng.random_range(0..8u64);
            let dropped = ring.drop_records(n).unwrap();
            assert_eq!(dropped, n.min(model.len() as u64));
            for _ in 0..dropped {
                model.pop_front();
            }
        }

        let cursor = ring.cursor();
        assert!(cursor.len() <= capacity);
        assert_eq!(cursor.full, cursor.len() >= capacity);
        assert_eq!(ring.count_approx(), model.len() as u64);

        let max = rng.random_range(0..40usize);
        let batch = ring.read_batch(max).unwrap();
        assert!(batch.span <= cursor.len());
        assert_eq!(batch.start, cursor.tail);
        let expected: Vec<_> = model.iter().take(max).copied().collect();
        assert_eq!(batch.records, expected);
    }
}
