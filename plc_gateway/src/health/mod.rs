use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tracing::{info, warn};

use crate::poll::PollObserver;
use crate::tags::structures::PlcName;

const LAST_ERROR_MAX: usize = 240;

/// Per-PLC connection health, as exposed on `/api/v1/hmi/health`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthEntry {
    pub connected: bool,
    pub fail_count: u32,
    pub last_backoff_s: f64,
    pub reconnect_total: u64,
    pub last_error: Option<String>,
    pub endpoint: String,
    #[serde(skip)]
    connected_once: bool,
}

/// Process-wide readiness. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    Initializing,
    Ready,
    Stopping,
}

/// Thread-safe per-PLC health map plus the process readiness state.
///
/// Implements `PollObserver`, so pollers report here without holding a
/// back-reference; every mutation also updates the `vs_opc_*` metrics.
pub struct HealthRegistry {
    entries: DashMap<PlcName, HealthEntry>,
    state: RwLock<ReadinessState>,
    prepopulated: AtomicBool,
    ready_file: Option<PathBuf>,
}

impl HealthRegistry {
    pub fn new(ready_file: Option<PathBuf>) -> Self {
        HealthRegistry {
            entries: DashMap::new(),
            state: RwLock::new(ReadinessState::Initializing),
            prepopulated: AtomicBool::new(false),
            ready_file,
        }
    }

    /// Register a controller at startup. Readiness waits for every
    /// registered controller to connect once.
    pub fn register(&self, plc: PlcName, endpoint: impl Into<String>) {
        let entry = HealthEntry {
            endpoint: endpoint.into(),
            ..HealthEntry::default()
        };
        publish_gauges(plc, &entry);
        self.entries.insert(plc, entry);
    }

    pub fn mark_connected(&self, plc: PlcName) {
        if let Some(mut entry) = self.entries.get_mut(&plc) {
            entry.connected = true;
            entry.connected_once = true;
            entry.fail_count = 0;
            entry.last_backoff_s = 0.0;
            entry.reconnect_total += 1;
            entry.last_error = None;
            publish_gauges(plc, &entry);
            let labels = [("plc", plc.to_string()), ("ip", entry.endpoint.clone())];
            counter!("vs_opc_plc_reconnect_total", &labels[..]).increment(1);
        }
        self.maybe_ready();
    }

    pub fn mark_failed(&self, plc: PlcName, error: &str) {
        if let Some(mut entry) = self.entries.get_mut(&plc) {
            entry.connected = false;
            entry.fail_count += 1;
            let mut msg = error.to_string();
            msg.truncate(LAST_ERROR_MAX);
            entry.last_error = Some(msg);
            publish_gauges(plc, &entry);
        }
    }

    pub fn record_backoff(&self, plc: PlcName, seconds: f64) {
        if let Some(mut entry) = self.entries.get_mut(&plc) {
            entry.last_backoff_s = seconds;
            publish_gauges(plc, &entry);
        }
    }

    pub fn observe_latency(&self, seconds: f64) {
        histogram!("vs_opc_poll_latency_seconds").record(seconds);
    }

    pub fn get(&self, plc: PlcName) -> Option<HealthEntry> {
        self.entries.get(&plc).map(|e| e.clone())
    }

    pub fn snapshot_all(&self) -> HashMap<String, HealthEntry> {
        self.entries
            .iter()
            .map(|e| (e.key().to_string(), e.clone()))
            .collect()
    }

    /// Called once tag prepopulation has finished.
    pub fn set_prepopulated(&self) {
        self.prepopulated.store(true, Ordering::SeqCst);
        self.maybe_ready();
    }

    fn maybe_ready(&self) {
        if !self.prepopulated.load(Ordering::SeqCst) {
            return;
        }
        let all_connected_once = self.entries.iter().all(|e| e.connected_once);
        if all_connected_once {
            self.set_ready();
        }
    }

    /// Enter `Ready` from `Initializing`; first entry writes the ready
    /// file. Later calls are no-ops, and `Stopping` is never left.
    pub fn set_ready(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state != ReadinessState::Initializing {
            return;
        }
        *state = ReadinessState::Ready;
        drop(state);
        info!("gateway ready");
        if let Some(path) = &self.ready_file {
            if let Err(e) = write_ready_file(path) {
                warn!(path = %path.display(), error = %e, "failed to write ready file");
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.state.read().unwrap_or_else(|e| e.into_inner()) == ReadinessState::Ready
    }

    pub fn set_stopping(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state != ReadinessState::Stopping {
            info!("gateway stopping");
            *state = ReadinessState::Stopping;
        }
    }

    pub fn is_stopping(&self) -> bool {
        *self.state.read().unwrap_or_else(|e| e.into_inner()) == ReadinessState::Stopping
    }

    pub fn readiness(&self) -> ReadinessState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl PollObserver for HealthRegistry {
    fn on_connected(&self, plc: PlcName) {
        self.mark_connected(plc);
    }

    fn on_failure(&self, plc: PlcName, error: &str) {
        self.mark_failed(plc, error);
    }

    fn on_backoff(&self, plc: PlcName, seconds: f64) {
        self.record_backoff(plc, seconds);
    }

    fn on_poll_latency(&self, seconds: f64) {
        self.observe_latency(seconds);
    }
}

fn publish_gauges(plc: PlcName, entry: &HealthEntry) {
    let labels = [("plc", plc.to_string()), ("ip", entry.endpoint.clone())];
    gauge!("vs_opc_plc_connected", &labels[..]).set(if entry.connected { 1.0 } else { 0.0 });
    gauge!("vs_opc_plc_fail_count", &labels[..]).set(entry.fail_count as f64);
    gauge!("vs_opc_plc_last_backoff_seconds", &labels[..]).set(entry.last_backoff_s);
}

/// Atomic ready-file write: temp file in the same directory, then rename.
/// Content is a single ISO-8601 timestamp line.
fn write_ready_file(path: &PathBuf) -> std::io::Result<()> {
    let stamp = format!("{}\n", chrono::Utc::now().to_rfc3339());
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, stamp)?;
    std::fs::rename(&tmp, path)
}
