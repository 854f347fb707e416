use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::{mpsc::error::TrySendError, mpsc::Sender, watch};
use tokio::time::MissedTickBehavior;

use crate::config::PollingConfig;
use crate::db::{DataStore, MeterEntry};
use crate::models::MeterConfig;
use crate::mqtt::MeteringData;

pub mod client;
pub mod decoder;
pub mod registers;
pub mod transport;

use client::{MeterClient, ReadTiming};
use transport::{RegisterTransport, SharedBus};

/// What a single pass over all meters achieved
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleSummary {
    pub meters_ok: usize,
    pub meters_total: usize,
    pub metrics: usize,
    pub elapsed: Duration,
    /// Shutdown was requested before every meter was read
    pub interrupted: bool,
}

/// Reads every configured meter once per period, one after the other.
pub struct PollLoop<T> {
    bus: SharedBus<T>,
    clients: Vec<MeterClient>,
    store: Arc<DataStore>,
    sender: Sender<MeteringData>,
    period: Duration,
    inter_meter_delay: Duration,
    unreachable_after: u32,
}

impl<T: RegisterTransport> PollLoop<T> {
    pub fn new(
        bus: SharedBus<T>,
        meters: Vec<MeterConfig>,
        polling: &PollingConfig,
        store: Arc<DataStore>,
        sender: Sender<MeteringData>,
    ) -> Self {
        let timing = ReadTiming::from_config(polling);
        let clients = meters.into_iter().map(|m| MeterClient::new(m, timing)).collect();

        return PollLoop {
            bus,
            clients,
            store,
            sender,
            period: Duration::from_secs(polling.interval),
            inter_meter_delay: Duration::from_millis(polling.inter_meter_delay_ms),
            unreachable_after: polling.unreachable_after,
        };
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn is_unreachable(&self, entry: &MeterEntry) -> bool {
        self.unreachable_after > 0 && entry.consecutive_failures >= self.unreachable_after
    }

    /// Poll every meter once, in configuration order.
    ///
    /// The bus is taken for one meter at a time and each result is stored
    /// before the next meter is touched.
    pub async fn poll_cycle(&self, shutdown: &watch::Receiver<bool>) -> CycleSummary {
        let start = Instant::now();
        let mut summary = CycleSummary {
            meters_ok: 0,
            meters_total: self.clients.len(),
            metrics: 0,
            elapsed: Duration::ZERO,
            interrupted: false,
        };

        for (i, client) in self.clients.iter().enumerate() {
            /* give the bus a rest between meters, never while holding it */
            if i > 0 && !self.inter_meter_delay.is_zero() {
                tokio::time::sleep(self.inter_meter_delay).await;
            }
            if *shutdown.borrow() {
                summary.interrupted = true;
                break;
            }

            let meter = client.config();
            let reading = {
                let mut bus = self.bus.lock().await;
                client.read(&mut *bus).await
            };

            if reading.ok {
                summary.meters_ok += 1;
                summary.metrics += reading.values.len();
            } else {
                debug!("Meter {} ({}) failed: {}", meter.display_name, meter.address, reading.error.as_deref().unwrap_or("unknown"));
            }

            let was_unreachable = self.store.entry(meter.address).map_or(false, |e| self.is_unreachable(&e));
            let entry = self.store.put(meter.address, reading.clone());

            if self.unreachable_after > 0 && entry.consecutive_failures == self.unreachable_after {
                warn!("Meter {} ({}) failed {} cycles in a row, reporting it as unreachable", meter.display_name, meter.address, entry.consecutive_failures);
            } else if was_unreachable && entry.consecutive_failures == 0 {
                info!("Meter {} ({}) is answering again", meter.display_name, meter.address);
            }

            /* the bus must never wait for the broker */
            match self.sender.try_send(MeteringData { meter: meter.clone(), reading }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("MQTT queue is full, dropping reading of {}", meter.display_name);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("MQTT queue closed, reading of {} stays local", meter.display_name);
                }
            }
        }

        summary.elapsed = start.elapsed();
        return summary;
    }

    /// Poll until `shutdown` turns true. A meter read already running is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Polling {} meters every {:?}", self.clients.len(), self.period);

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown channel closed, polling stops");
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let summary = self.poll_cycle(&shutdown).await;
            info!(
                "Poll cycle done: {}/{} meters ok, {} values in {:?}",
                summary.meters_ok, summary.meters_total, summary.metrics, summary.elapsed
            );
            if summary.elapsed > self.period {
                warn!("Poll cycle took {:?}, longer than the interval of {:?}", summary.elapsed, self.period);
            }
            if summary.interrupted {
                break;
            }
        }

        info!("Poll loop stopped");
    }
}
