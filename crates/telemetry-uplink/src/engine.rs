use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use telemetry_crypto::{random_nonce, seal};
use telemetry_store::{Batch, KvStore, SharedRing, StoreError, lock_ring};
use telemetry_types::{DataRequest, RegisterRequest, SyncTimeRequest};

use crate::config::{ConfigSource, UplinkConfig};
use crate::protocol::{self, DATA_PATH, REGISTER_PATH, Reply, SYNC_TIME_PATH};
use crate::transport::Transport;

/// Namespace and key of the persisted sequence counter.
pub const SEQUENCE_NAMESPACE: &str = "uplink";
const KEY_SEQ: &str = "seq";
const INITIAL_SEQUENCE: u32 = 1;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Records per data request. Kept small for slow links.
    pub batch_size: usize,
    pub send_interval: Duration,
    pub sync_interval: Duration,
}

impl EngineSettings {
    /// Zero intervals or a zero batch size would stall or crash the loop.
    pub fn validate(&self) -> Result<(), UplinkError> {
        if self.batch_size == 0 {
            return Err(UplinkError::InvalidSettings("batch size must be at least 1"));
        }
        if self.send_interval.is_zero() {
            return Err(UplinkError::InvalidSettings("send interval must be non-zero"));
        }
        if self.sync_interval.is_zero() {
            return Err(UplinkError::InvalidSettings("sync interval must be non-zero"));
        }
        Ok(())
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            send_interval: Duration::from_secs(30),
            sync_interval: Duration::from_secs(40),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UplinkError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sealing request failed: {0}")]
    Envelope(#[from] telemetry_crypto::EnvelopeError),
    #[error("encoding request failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid engine settings: {0}")]
    InvalidSettings(&'static str),
}

/// Why a batch stayed in the ring this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetainReason {
    Transport(String),
    Rejected(String),
    /// Still unregistered after the one registration attempt.
    Unregistered,
    RegistrationFailed,
    Internal(String),
}

impl fmt::Display for RetainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {}", e),
            Self::Rejected(why) => write!(f, "rejected: {}", why),
            Self::Unregistered => write!(f, "still unregistered after registering"),
            Self::RegistrationFailed => write!(f, "registration failed"),
            Self::Internal(e) => write!(f, "internal: {}", e),
        }
    }
}

/// Result of one data cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Link down; a reconnect was attempted and nothing was sent.
    Offline,
    /// Nothing queued.
    Idle,
    /// Batch accepted and dropped from the ring.
    Delivered { records: usize, dropped: u64, seq: u32 },
    /// Batch held only corrupted slots; they were dropped without sending.
    Discarded { slots: u64 },
    /// Batch left in the ring for the next cycle.
    Retained { reason: RetainReason },
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Idle => write!(f, "idle"),
            Self::Delivered { records, dropped, seq } => {
                write!(f, "delivered records={} dropped={} seq={}", records, dropped, seq)
            }
            Self::Discarded { slots } => write!(f, "discarded corrupted slots={}", slots),
            Self::Retained { reason } => write!(f, "retained ({})", reason),
        }
    }
}

/// Result of one time-sync exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Offline,
    Sent { server_ts: Option<u64> },
    Failed(String),
}

/// Periodic uplink driver.
///
/// Owns the sequence counter. The ring is shared with the producer; its
/// lock is taken only around `read_batch` and `commit` and never held while
/// waiting on the network.
pub struct UplinkEngine<T, C> {
    transport: T,
    config: C,
    ring: SharedRing,
    state: Arc<KvStore>,
    device_id: String,
    settings: EngineSettings,
    sequence: u32,
    current: Option<UplinkConfig>,
}

impl<T: Transport, C: ConfigSource> UplinkEngine<T, C> {
    pub fn new(
        transport: T,
        config: C,
        ring: SharedRing,
        state: Arc<KvStore>,
        device_id: String,
        settings: EngineSettings,
    ) -> Result<Self, UplinkError> {
        settings.validate()?;
        let sequence = state
            .get_u64_or(SEQUENCE_NAMESPACE, KEY_SEQ, INITIAL_SEQUENCE as u64)? as u32;
        info!("Uplink engine for {} starting at seq={}", device_id, sequence);

        Ok(Self {
            transport,
            config,
            ring,
            state,
            device_id,
            settings,
            sequence,
            current: None,
        })
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Run data and time-sync cycles on their own intervals until
    /// `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut send_tick = tokio::time::interval(self.settings.send_interval);
        send_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync_tick = tokio::time::interval(self.settings.sync_interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Uplink loop running (send every {:?}, sync every {:?}, batch {})",
            self.settings.send_interval, self.settings.sync_interval, self.settings.batch_size
        );

        loop {
            tokio::select! {
                _ = send_tick.tick() => {
                    let outcome = self.cycle().await;
                    match &outcome {
                        CycleOutcome::Retained { .. } | CycleOutcome::Offline => {
                            warn!("Uplink cycle: {}", outcome)
                        }
                        CycleOutcome::Idle => debug!("Uplink cycle: {}", outcome),
                        _ => info!("Uplink cycle: {}", outcome),
                    }
                }
                _ = sync_tick.tick() => {
                    match self.sync_time().await {
                        SyncOutcome::Sent { server_ts } => info!(?server_ts, seq = self.sequence, "Time sync sent"),
                        SyncOutcome::Offline => debug!("Time sync skipped: offline"),
                        SyncOutcome::Failed(e) => warn!(seq = self.sequence, "Time sync failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender also means stop.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Uplink loop stopped at seq={}", self.sequence);
    }

    /// One data cycle: reload config, gate on connectivity, then try to
    /// deliver one batch.
    pub async fn cycle(&mut self) -> CycleOutcome {
        let cfg = self.reload_config();

        if !self.transport.is_connected(&cfg.endpoint).await {
            warn!("Link to {} down, reconnecting", cfg.endpoint);
            if let Err(e) = self.transport.reconnect(&cfg.endpoint).await {
                debug!("Reconnect failed: {}", e);
            }
            return CycleOutcome::Offline;
        }

        match self.send_data(&cfg).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Uplink cycle aborted: {}", e);
                CycleOutcome::Retained {
                    reason: RetainReason::Internal(e.to_string()),
                }
            }
        }
    }

    /// Post `{device_id, seq}` to the sync endpoint.
    ///
    /// The sequence advances whether or not the exchange succeeded. That
    /// matches the deployed endpoint's expectations; whether it should only
    /// advance on a confirmed reply is still open.
    pub async fn sync_time(&mut self) -> SyncOutcome {
        let cfg = self.reload_config();
        if !self.transport.is_connected(&cfg.endpoint).await {
            return SyncOutcome::Offline;
        }

        let request = SyncTimeRequest {
            device_id: self.device_id.clone(),
            seq: self.sequence,
        };
        let body = match serde_json::to_vec(&request)
            .map_err(UplinkError::from)
            .and_then(|plain| seal(&cfg.crypto_pass, &plain).map_err(UplinkError::from))
        {
            Ok(body) => body,
            Err(e) => return SyncOutcome::Failed(e.to_string()),
        };

        let result = self.transport.post(&cfg.endpoint, SYNC_TIME_PATH, body).await;
        self.advance_sequence();

        match result {
            Ok(resp) => SyncOutcome::Sent {
                server_ts: protocol::server_time(&resp),
            },
            Err(e) => SyncOutcome::Failed(e.to_string()),
        }
    }

    /// Send the batch at the tail. On "not registered", register and retry
    /// exactly once; a second refusal ends the cycle.
    async fn send_data(&mut self, cfg: &UplinkConfig) -> Result<CycleOutcome, UplinkError> {
        let mut may_register = true;

        loop {
            let batch = {
                let mut ring = lock_ring(&self.ring)?;
                ring.read_batch(self.settings.batch_size)?
            };

            if batch.is_empty() {
                return Ok(CycleOutcome::Idle);
            }
            if batch.records.is_empty() {
                let slots = self.commit(&batch)?;
                warn!("Dropped {} corrupted slot(s) without sending", slots);
                return Ok(CycleOutcome::Discarded { slots });
            }

            let request = DataRequest {
                device_id: self.device_id.clone(),
                nonce: random_nonce(),
                seq: self.sequence,
                records: batch.records.clone(),
            };
            let body = seal(&cfg.crypto_pass, &serde_json::to_vec(&request)?)?;
            debug!(
                seq = self.sequence,
                records = batch.records.len(),
                "Sending data ({} bytes sealed)",
                body.len()
            );

            let resp = match self.transport.post(&cfg.endpoint, DATA_PATH, body).await {
                Ok(resp) => resp,
                Err(e) => {
                    return Ok(CycleOutcome::Retained {
                        reason: RetainReason::Transport(e.to_string()),
                    });
                }
            };

            match protocol::classify(&resp) {
                Reply::Accepted => {
                    let dropped = self.commit(&batch)?;
                    if batch.skipped() > 0 {
                        warn!(
                            skipped = batch.skipped(),
                            "Dropped corrupted slot(s) along with the delivered batch"
                        );
                    }
                    let seq = self.sequence;
                    self.advance_sequence();
                    return Ok(CycleOutcome::Delivered {
                        records: batch.records.len(),
                        dropped,
                        seq,
                    });
                }
                Reply::Unregistered if may_register => {
                    may_register = false;
                    info!("Device {} not registered, registering", self.device_id);
                    if !self.register(cfg).await? {
                        return Ok(CycleOutcome::Retained {
                            reason: RetainReason::RegistrationFailed,
                        });
                    }
                    info!("Registered, retrying data send");
                }
                Reply::Unregistered => {
                    return Ok(CycleOutcome::Retained {
                        reason: RetainReason::Unregistered,
                    });
                }
                Reply::Rejected(why) => {
                    return Ok(CycleOutcome::Retained {
                        reason: RetainReason::Rejected(why),
                    });
                }
            }
        }
    }

    /// Post `{device_id, nonce, seq}` to the registration endpoint. The
    /// sequence advances only when the endpoint confirms.
    async fn register(&mut self, cfg: &UplinkConfig) -> Result<bool, UplinkError> {
        let request = RegisterRequest {
            device_id: self.device_id.clone(),
            nonce: random_nonce(),
            seq: self.sequence,
        };
        let body = seal(&cfg.crypto_pass, &serde_json::to_vec(&request)?)?;

        match self.transport.post(&cfg.endpoint, REGISTER_PATH, body).await {
            Ok(resp) => match protocol::classify(&resp) {
                Reply::Accepted => {
                    self.advance_sequence();
                    Ok(true)
                }
                other => {
                    warn!("Registration refused: {}", other);
                    Ok(false)
                }
            },
            Err(e) => {
                warn!("Registration failed: {}", e);
                Ok(false)
            }
        }
    }

    fn commit(&self, batch: &Batch) -> Result<u64, StoreError> {
        let mut ring = lock_ring(&self.ring)?;
        ring.commit(batch)
    }

    fn advance_sequence(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        if let Err(e) = self
            .state
            .put_u64(SEQUENCE_NAMESPACE, KEY_SEQ, self.sequence as u64)
        {
            error!(seq = self.sequence, "Failed to persist sequence: {}", e);
        }
    }

    /// Fetch the latest settings, keeping the previous ones if the source
    /// fails.
    fn reload_config(&mut self) -> UplinkConfig {
        match self.config.load() {
            Ok(cfg) => {
                if self.current.as_ref() != Some(&cfg) {
                    info!("Uplink config loaded: endpoint {}", cfg.endpoint);
                    if cfg.uses_placeholder_pass() {
                        warn!("Crypto passphrase is still the factory placeholder");
                    }
                    self.current = Some(cfg.clone());
                }
                cfg
            }
            Err(e) => {
                warn!("Config reload failed, keeping previous settings: {}", e);
                self.current.clone().unwrap_or_default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let s = EngineSettings::default();
        assert_eq!(s.batch_size, 1);
        assert_eq!(s.send_interval, Duration::from_secs(30));
        assert_eq!(s.sync_interval, Duration::from_secs(40));
    }

    #[test]
    fn zero_settings_are_rejected() {
        assert!(EngineSettings::default().validate().is_ok());

        let zero_batch = EngineSettings {
            batch_size: 0,
            ..EngineSettings::default()
        };
        assert!(matches!(zero_batch.validate(), Err(UplinkError::InvalidSettings(_))));

        let zero_send = EngineSettings {
            send_interval: Duration::ZERO,
            ..EngineSettings::default()
        };
        assert!(matches!(zero_send.validate(), Err(UplinkError::InvalidSettings(_))));

        let zero_sync = EngineSettings {
            sync_interval: Duration::ZERO,
            ..EngineSettings::default()
        };
        assert!(matches!(zero_sync.validate(), Err(UplinkError::InvalidSettings(_))));
    }

    #[test]
    fn outcomes_read_well_in_logs() {
        let delivered = CycleOutcome::Delivered {
            records: 3,
            dropped: 4,
            seq: 9,
        };
        assert_eq!(delivered.to_string(), "delivered records=3 dropped=4 seq=9");

        let retained = CycleOutcome::Retained {
            reason: RetainReason::Rejected("replay [HTTP 403]".into()),
        };
        assert_eq!(retained.to_string(), "retained (rejected: replay [HTTP 403])");
        assert_eq!(CycleOutcome::Discarded { slots: 2 }.to_string(), "discarded corrupted slots=2");
    }
}
