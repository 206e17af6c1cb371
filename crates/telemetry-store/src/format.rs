//! On-disk layout of the ring file. All integers are little-endian.
//!
//! ```text
//! Header (16 bytes)
//! [0..4]    magic "RING" (0x52494E47)
//! [4..6]    format version
//! [6..8]    record stride (24)
//! [8..12]   capacity in records
//! [12..16]  reserved, zero
//!
//! Record slot (24 bytes), repeated `capacity` times
//! [0..4]    ts          u32
//! [4..8]    current_mA  i32
//! [8..12]   power_dW    i32
//! [12..14]  temp_cC     i16
//! [14..16]  flags       u16
//! [16..20]  CRC-32 of bytes [0..16]
//! [20..24]  stamp: low 32 bits of the record's logical index
//! ```
//!
//! The stamp lets `open` tell a record written just before a crash (stamp
//! equals the persisted head) from a stale record of the previous lap.

use telemetry_types::SampleRecord;

pub const MAGIC: u32 = 0x5249_4E47;
pub const VERSION: u16 = 1;
pub const HEADER_SIZE: u64 = 16;
pub const RECORD_STRIDE: usize = 24;

const CHECKSUM_OFFSET: usize = 16;
const STAMP_OFFSET: usize = 20;

/// Parsed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingHeader {
    pub version: u16,
    pub stride: u16,
    pub capacity: u32,
}

impl RingHeader {
    pub fn new(capacity: u32) -> Self {
        Self {
            version: VERSION,
            stride: RECORD_STRIDE as u16,
            capacity,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.stride.to_le_bytes());
        buf[8..12].copy_from_slice(&self.capacity.to_le_bytes());
        buf
    }

    /// Returns None if the magic is absent.
    pub fn decode(buf: &[u8; HEADER_SIZE as usize]) -> Option<Self> {
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return None;
        }
        Some(Self {
            version: u16::from_le_bytes([buf[4], buf[5]]),
            stride: u16::from_le_bytes([buf[6], buf[7]]),
            capacity: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// Serialize a record into its slot bytes.
pub fn encode_record(rec: &SampleRecord, index: u64) -> [u8; RECORD_STRIDE] {
    let mut buf = [0u8; RECORD_STRIDE];
    buf[0..4].copy_from_slice(&rec.ts.to_le_bytes());
    buf[4..8].copy_from_slice(&rec.current_ma.to_le_bytes());
    buf[8..12].copy_from_slice(&rec.power_dw.to_le_bytes());
    buf[12..14].copy_from_slice(&rec.temp_cc.to_le_bytes());
    buf[14..16].copy_from_slice(&rec.flags.to_le_bytes());

    let crc = crc32fast::hash(&buf[..CHECKSUM_OFFSET]);
    buf[CHECKSUM_OFFSET..STAMP_OFFSET].copy_from_slice(&crc.to_le_bytes());
    buf[STAMP_OFFSET..].copy_from_slice(&(index as u32).to_le_bytes());
    buf
}

/// Decode slot bytes. Returns the record and its stamp, or None if the
/// checksum does not match.
pub fn decode_record(buf: &[u8; RECORD_STRIDE]) -> Option<(SampleRecord, u32)> {
    let stored = u32::from_le_bytes(buf[CHECKSUM_OFFSET..STAMP_OFFSET].try_into().ok()?);
    if crc32fast::hash(&buf[..CHECKSUM_OFFSET]) != stored {
        return None;
    }

    let rec = SampleRecord {
        ts: u32::from_le_bytes(buf[0..4].try_into().ok()?),
        current_ma: i32::from_le_bytes(buf[4..8].try_into().ok()?),
        power_dw: i32::from_le_bytes(buf[8..12].try_into().ok()?),
        temp_cc: i16::from_le_bytes(buf[12..14].try_into().ok()?),
        flags: u16::from_le_bytes(buf[14..16].try_into().ok()?),
    };
    let stamp = u32::from_le_bytes(buf[STAMP_OFFSET..].try_into().ok()?);
    Some((rec, stamp))
}
