pub mod bus;
pub mod cache;
pub mod config;
pub mod content;
pub mod documents;
pub mod ids;
pub mod limiter;
pub mod presence;
pub mod queue;

pub use config::{DocumentBackend, HubConfig};

/// Current wall-clock time as epoch milliseconds, the timestamp unit used
/// throughout the hub.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
