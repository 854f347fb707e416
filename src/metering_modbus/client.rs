use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};

use super::decoder::decode_f32;
use super::registers::{get_registers, MetricDefinition};
use super::transport::{RegisterTransport, TransportError};
use crate::config::PollingConfig;
use crate::models::{MeterConfig, Reading};

/// Bus timing shared by every meter on the bus
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadTiming {
    pub request_timeout: Duration,
    pub inter_request_delay: Duration,
    /// Give up on a meter when this many leading requests get no answer at all, 0 never does
    pub silent_probe_limit: u32,
}

impl ReadTiming {
    pub fn from_config(config: &PollingConfig) -> Self {
        ReadTiming {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            inter_request_delay: Duration::from_millis(config.inter_request_delay_ms),
            silent_probe_limit: config.silent_probe_limit,
        }
    }
}

impl Default for ReadTiming {
    fn default() -> Self {
        ReadTiming {
            request_timeout: Duration::from_secs(1),
            inter_request_delay: Duration::from_millis(50),
            silent_probe_limit: 3,
        }
    }
}

/// Reads every metric of one meter
#[derive(Debug, Clone)]
pub struct MeterClient {
    config: MeterConfig,
    registers: &'static [MetricDefinition],
    timing: ReadTiming,
}

impl MeterClient {
    pub fn new(config: MeterConfig, timing: ReadTiming) -> Self {
        let registers = get_registers(config.model);
        MeterClient {
            config,
            registers,
            timing,
        }
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    pub fn registers(&self) -> &'static [MetricDefinition] {
        self.registers
    }

    /// Query all registers of the meter once.
    ///
    /// A failing register only drops that metric. The reading is marked as
    /// failed when nothing could be read or the transport says the meter is
    /// gone. Failed registers are not retried before the next call.
    /// The reading is stamped once the last request is done.
    pub async fn read<T: RegisterTransport + ?Sized>(&self, transport: &mut T) -> Reading {
        let mut reading = self.query(transport).await;
        reading.timestamp = Utc::now();
        return reading;
    }

    async fn query<T: RegisterTransport + ?Sized>(&self, transport: &mut T) -> Reading {
        let address = self.config.address;
        let mut reading = Reading::new(address);
        let mut silent: u32 = 0;
        let mut failed: usize = 0;
        let mut last_error: Option<TransportError> = None;

        for (idx, reg) in self.registers.iter().enumerate() {
            if idx > 0 && !self.timing.inter_request_delay.is_zero() {
                tokio::time::sleep(self.timing.inter_request_delay).await;
            }

            let result = transport
                .read_input_registers(address, reg.register, reg.length, self.timing.request_timeout)
                .await;

            match result {
                Ok(words) => match decode_f32(&words) {
                    Ok(value) => {
                        reading.values.insert(reg.name.to_string(), value);
                    }
                    Err(e) => {
                        warn!("Meter {} ({}) register {}: {}", self.config.display_name, address, reg.name, e);
                        failed += 1;
                    }
                },
                Err(e) => {
                    debug!("Meter {} ({}) register {} failed: {}", self.config.display_name, address, reg.name, e);
                    failed += 1;

                    if e.is_meter_unreachable() {
                        reading.ok = false;
                        reading.error = Some(e.to_string());
                        return reading;
                    }

                    if e.is_silence() && reading.values.is_empty() {
                        silent += 1;
                        if self.timing.silent_probe_limit > 0 && silent >= self.timing.silent_probe_limit {
                            reading.ok = false;
                            reading.error = Some(format!("no response to the first {} requests", silent));
                            return reading;
                        }
                    }
                    last_error = Some(e);
                }
            }
        }

        /* only a meter where every single register failed counts as failed */
        if failed == self.registers.len() {
            reading.ok = false;
            reading.error = Some(match last_error {
                Some(e) => format!("all {} registers failed, last error: {}", failed, e),
                None => format!("all {} registers failed", failed),
            });
        } else if failed > 0 {
            debug!("Meter {} ({}): {} of {} registers missing", self.config.display_name, address, failed, self.registers.len());
        }

        return reading;
    }
}
