use serde::{Deserialize, Serialize};

use crate::models::SampleRecord;

// -- Requests (plaintext before sealing into an envelope) --

/// Body of `/sync_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTimeRequest {
    pub device_id: String,
    pub seq: u32,
}

/// Body of `/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub device_id: String,
    pub nonce: String,
    pub seq: u32,
}

/// Body of `/data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRequest {
    pub device_id: String,
    pub nonce: String,
    pub seq: u32,
    pub records: Vec<SampleRecord>,
}

// -- Responses --

/// Structured reply from the collection endpoint, e.g. `{"status":"OK"}`
/// or `{"status":"notreg"}`. `/sync_time` replies carry `ts` instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerReply {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ts: Option<u64>,
    #[serde(default)]
    pub err: Option<String>,
}
