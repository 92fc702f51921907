pub mod poller;

pub use poller::{backoff_seconds, PollSettings, Poller, PollerHandle, TagWrite};

use crate::tags::structures::PlcName;

/// Sink for poller lifecycle events. The health registry implements this;
/// the poller never holds a reference back into health or metrics code.
pub trait PollObserver: Send + Sync {
    fn on_connected(&self, plc: PlcName);
    fn on_failure(&self, plc: PlcName, error: &str);
    fn on_backoff(&self, plc: PlcName, seconds: f64);
    fn on_poll_latency(&self, seconds: f64);
}

/// Observer that drops everything, for tests and detached pollers.
pub struct NullObserver;

impl PollObserver for NullObserver {
    fn on_connected(&self, _plc: PlcName) {}
    fn on_failure(&self, _plc: PlcName, _error: &str) {}
    fn on_backoff(&self, _plc: PlcName, _seconds: f64) {}
    fn on_poll_latency(&self, _seconds: f64) {}
}
