use std::fmt;

use telemetry_types::ServerReply;

use crate::transport::TransportResponse;

pub const SYNC_TIME_PATH: &str = "/sync_time";
pub const REGISTER_PATH: &str = "/register";
pub const DATA_PATH: &str = "/data";

const STATUS_OK: &str = "OK";
const STATUS_NOT_REGISTERED: &str = "notreg";

/// What the endpoint made of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Accepted,
    Unregistered,
    Rejected(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Unregistered => write!(f, "unregistered"),
            Self::Rejected(why) => write!(f, "rejected: {}", why),
        }
    }
}

/// Decode a response into a [`Reply`].
///
/// A JSON body with a `status` field is authoritative. Bodies without one
/// fall back to substring matching, for endpoints that answer in plain text.
/// Acceptance always requires a 2xx status; "not registered" is recognised
/// whatever the status code (the endpoint answers it with 403).
pub fn classify(resp: &TransportResponse) -> Reply {
    let ok = resp.is_success();

    if let Ok(ServerReply {
        status: Some(status),
        err,
        ..
    }) = serde_json::from_slice::<ServerReply>(&resp.body)
    {
        return match status.as_str() {
            STATUS_OK if ok => Reply::Accepted,
            STATUS_NOT_REGISTERED => Reply::Unregistered,
            other => Reply::Rejected(match err {
                Some(err) => format!("{} ({}) [HTTP {}]", other, err, resp.status),
                None => format!("{} [HTTP {}]", other, resp.status),
            }),
        };
    }

    let text = String::from_utf8_lossy(&resp.body);
    if text.contains(STATUS_NOT_REGISTERED) {
        Reply::Unregistered
    } else if ok && text.contains(STATUS_OK) {
        Reply::Accepted
    } else {
        Reply::Rejected(format!("HTTP {}", resp.status))
    }
}

/// Server clock from a `/sync_time` reply, if it sent one.
pub fn server_time(resp: &TransportResponse) -> Option<u64> {
    serde_json::from_slice::<ServerReply>(&resp.body).ok()?.ts
}
