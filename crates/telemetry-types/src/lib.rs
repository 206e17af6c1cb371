/// Shared data model for the telemetry appliance.
///
/// `models` holds the fixed-point sample produced by the sensor side;
/// `api` holds the JSON shapes exchanged with the collection endpoint.
pub mod api;
pub mod models;

pub use api::{DataRequest, RegisterRequest, ServerReply, SyncTimeRequest};
pub use models::SampleRecord;
