/// Uplink side of the telemetry appliance.
///
/// Drains the ring log in small batches, seals each request in an
/// envelope and drives the register / send / retry exchange with the
/// collection endpoint. Delivery is at-least-once: a batch leaves the ring
/// only after the endpoint accepted it.
pub mod config;
pub mod engine;
pub mod identity;
pub mod protocol;
pub mod transport;

pub use config::{ConfigError, ConfigSource, Endpoint, EnvFileConfig, MemoryConfig, UplinkConfig};
pub use engine::{CycleOutcome, EngineSettings, RetainReason, SyncOutcome, UplinkEngine, UplinkError};
pub use protocol::Reply;
pub use transport::{HttpTransport, Transport, TransportError, TransportResponse};
