use std::io::BufRead;

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use telemetry_store::{SharedRing, lock_ring};
use telemetry_types::SampleRecord;

/// One NDJSON line from the sensor subsystem. `ts` may be omitted, in which
/// case the sample is stamped on arrival.
#[derive(Debug, Deserialize)]
struct IncomingSample {
    #[serde(default)]
    ts: Option<u32>,
    #[serde(rename = "current_mA")]
    current_ma: i32,
    #[serde(rename = "power_dW")]
    power_dw: i32,
    #[serde(rename = "temp_cC")]
    temp_cc: i16,
    #[serde(default)]
    flags: u16,
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str, now: u32) -> Result<Option<SampleRecord>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let sample: IncomingSample = serde_json::from_str(line)?;
    Ok(Some(SampleRecord {
        ts: sample.ts.unwrap_or(now),
        current_ma: sample.current_ma,
        power_dw: sample.power_dw,
        temp_cc: sample.temp_cc,
        flags: sample.flags,
    }))
}

fn unix_now() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
}

/// Forward stdin lines from a dedicated thread.
///
/// Blocking stdin reads would otherwise pin a runtime worker and hold up
/// shutdown. The thread ends at EOF or once the receiver is gone.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Append every well-formed line to the ring until input ends or shutdown
/// is requested. Returns the number of records appended.
pub async fn run_ingest(
    mut lines: mpsc::Receiver<String>,
    ring: SharedRing,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut appended = 0u64;
    let mut line_no = 0u64;

    loop {
        let line = tokio::select! {
            line = lines.recv() => match line {
                Some(line) => line,
                None => {
                    info!("Sample input closed after {} record(s)", appended);
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        line_no += 1;

        let rec = match parse_line(&line, unix_now()) {
            Ok(Some(rec)) => rec,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_no, "Skipping malformed sample: {}", e);
                continue;
            }
        };

        let result = lock_ring(&ring).and_then(|mut ring| ring.append(&rec));
        match result {
            Ok(()) => {
                appended += 1;
                debug!(ts = rec.ts, heater = rec.heater_active(), "Sample queued");
            }
            Err(e) => error!(ts = rec.ts, "Failed to queue sample: {}", e),
        }
    }

    appended
}
