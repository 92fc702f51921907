use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::drivers::traits::{PlcDriver, RawValue};
use crate::error::{GatewayError, Result};
use crate::poll::PollObserver;
use crate::tags::monotonic_now_ns;
use crate::tags::store::TagStore;
use crate::tags::structures::{PlcName, Quality};

/// Writes queued while a controller is faulted; overflow turns into
/// `Unavailable` at the enqueueing client.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Loop tuning for one poller, resolved from the environment.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub poll_period: Duration,
    pub reconnect_base: f64,
    pub reconnect_max: f64,
}

/// A pending write-through to the controller.
#[derive(Debug, Clone)]
pub struct TagWrite {
    pub id: String,
    pub address: String,
    pub value: RawValue,
}

/// Cheap handle for enqueueing writes into a poller's bounded queue.
#[derive(Debug, Clone)]
pub struct PollerHandle {
    plc: PlcName,
    tx: mpsc::Sender<TagWrite>,
}

impl PollerHandle {
    pub fn plc(&self) -> PlcName {
        self.plc
    }

    pub fn enqueue(&self, write: TagWrite) -> Result<()> {
        self.tx.try_send(write).map_err(|_| {
            GatewayError::Unavailable(format!("write queue for '{}' is full", self.plc))
        })
    }
}

enum PollerState {
    Disconnected,
    Connected,
    Faulted,
}

/// Per-PLC poll loop.
///
/// Owns the driver exclusively. Connects, reads the subscribed addresses
/// every poll period, pushes coerced values into the store, and walks the
/// Disconnected / Connected / Faulted state machine with exponential
/// reconnect backoff. Every suspension point honors the shutdown token.
pub struct Poller {
    driver: Box<dyn PlcDriver>,
    store: TagStore,
    observer: Arc<dyn PollObserver>,
    settings: PollSettings,
    writes: mpsc::Receiver<TagWrite>,
    cancel: CancellationToken,
    state: PollerState,
    fail_count: u32,
}

impl Poller {
    pub fn new(
        driver: Box<dyn PlcDriver>,
        store: TagStore,
        observer: Arc<dyn PollObserver>,
        settings: PollSettings,
        cancel: CancellationToken,
    ) -> (Self, PollerHandle) {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let handle = PollerHandle {
            plc: driver.config().plc,
            tx,
        };
        let poller = Poller {
            driver,
            store,
            observer,
            settings,
            writes: rx,
            cancel,
            state: PollerState::Disconnected,
            fail_count: 0,
        };
        (poller, handle)
    }

    pub async fn run(mut self) {
        let plc = self.driver.config().plc;
        info!(%plc, endpoint = %self.driver.config().endpoint, "poller started");

        let mut ticker = interval(self.settings.poll_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.cancel.is_cancelled() {
            match self.state {
                PollerState::Disconnected | PollerState::Faulted => {
                    self.try_connect(plc).await;
                }
                PollerState::Connected => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    self.drain_writes(plc).await;
                    self.poll_cycle(plc).await;
                }
            }
        }

        self.driver.disconnect().await;
        info!(%plc, "poller stopped");
    }

    async fn try_connect(&mut self, plc: PlcName) {
        match self.driver.connect().await {
            Ok(()) => {
                self.fail_count = 0;
                self.state = PollerState::Connected;
                self.observer.on_connected(plc);
                info!(%plc, "connected");
            }
            Err(e) => {
                self.state = PollerState::Faulted;
                self.register_failure(plc, &e.to_string()).await;
            }
        }
    }

    /// Shared fault accounting: bump the counter, report, back off.
    async fn register_failure(&mut self, plc: PlcName, error: &str) {
        self.fail_count += 1;
        self.observer.on_failure(plc, error);
        let backoff = backoff_seconds(
            self.settings.reconnect_base,
            self.settings.reconnect_max,
            self.fail_count,
        );
        self.observer.on_backoff(plc, backoff);
        warn!(%plc, error, fail_count = self.fail_count, backoff_s = backoff, "controller fault");

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = sleep(Duration::from_secs_f64(backoff)) => {}
        }
    }

    async fn drain_writes(&mut self, plc: PlcName) {
        while let Ok(write) = self.writes.try_recv() {
            if let Err(e) = self.driver.write(&write.address, &write.value).await {
                warn!(%plc, tag = %write.id, address = %write.address, error = %e, "write-through failed");
                let _ = self.store.set_quality(&write.id, Quality::Bad);
            }
        }
    }

    async fn poll_cycle(&mut self, plc: PlcName) {
        let subscriptions = self.store.subscriptions(plc);
        if subscriptions.is_empty() {
            return;
        }
        let addresses: Vec<String> = subscriptions.iter().map(|(_, a)| a.clone()).collect();

        let started = Instant::now();
        match self.driver.read(&addresses).await {
            Ok(batch) => {
                self.observer.on_poll_latency(started.elapsed().as_secs_f64());
                let now = monotonic_now_ns();
                for (id, address) in &subscriptions {
                    match batch.get(address) {
                        Some(Ok(raw)) => {
                            // Concurrent deletes and shape mismatches are
                            // per-tag conditions, not cycle faults.
                            if let Err(e) = self.store.apply_reading(id, raw, now) {
                                debug!(%plc, tag = %id, error = %e, "reading not applied");
                            }
                        }
                        Some(Err(e)) => {
                            debug!(%plc, tag = %id, error = %e, "address read failed");
                            let _ = self.store.set_quality(id, Quality::Bad);
                        }
                        None => {}
                    }
                }
            }
            Err(e) => {
                // The connection is broken: everything this controller owns
                // degrades to Stale and the state machine faults.
                self.store.mark_plc_stale(plc);
                self.driver.disconnect().await;
                self.state = PollerState::Faulted;
                self.register_failure(plc, &e.to_string()).await;
            }
        }
    }
}

/// Exponential reconnect backoff:
/// `min(RECONNECT_MAX, RECONNECT_BASE * 2^(fail_count - 1))`.
pub fn backoff_seconds(base: f64, max: f64, fail_count: u32) -> f64 {
    let exponent = fail_count.saturating_sub(1).min(63) as i32;
    (base * 2f64.powi(exponent)).min(max)
}
