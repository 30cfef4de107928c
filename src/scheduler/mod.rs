use std::future::Future;
use std::time::Duration;
use chrono::Local;
use log::{debug, info};

use crate::config::Config;
use crate::metering_modbus::bus::RegisterBus;
use crate::metering_modbus::MeterPoller;
use crate::mqtt::{Publisher, Telemetry};

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CycleSummary {
    pub published: usize,
    pub failed: usize,
}

/// Owns the bus and the telemetry connection and drives the poll cadence.
pub struct Scheduler<B: RegisterBus, T: Telemetry> {
    bus: B,
    poller: MeterPoller,
    publisher: Publisher<T>,
    meters: Vec<u8>,
    interval: Duration,
}

impl<B: RegisterBus, T: Telemetry> Scheduler<B, T> {
    pub fn new(bus: B, poller: MeterPoller, publisher: Publisher<T>, meters: Vec<u8>, interval: Duration) -> Self {
        return Scheduler { bus, poller, publisher, meters, interval };
    }

    pub fn from_config(config: &Config, bus: B, publisher: Publisher<T>) -> Self {
        return Scheduler::new(
            bus,
            MeterPoller::from_config(config),
            publisher,
            config.meters.clone(),
            config.timing.poll_interval(),
        );
    }

    /// Polls and publishes every meter once, in configured order.
    pub async fn run_cycle(&mut self) -> CycleSummary {
        info!("========== Reading at {} ==========", crate::iso_timestamp(&Local::now()));
        let mut summary = CycleSummary::default();

        for meter_id in self.meters.iter().copied() {
            let reading = self.poller.poll(&mut self.bus, meter_id).await;

            match self.publisher.publish(reading).await {
                Ok(()) => summary.published += 1,
                Err(_) => summary.failed += 1,
            }
        }

        return summary;
    }

    /// Runs cycles until `shutdown` resolves and returns how many ran. Only
    /// the pause between cycles is interrupted, a running cycle is always finished.
    pub async fn run<F: Future<Output = ()>>(mut self, shutdown: F) -> u64 {
        tokio::pin!(shutdown);
        let mut cycles: u64 = 0;

        loop {
            let summary = self.run_cycle().await;
            cycles += 1;
            info!("Cycle done, {} published, {} failed, next one in {}s",
                  summary.published, summary.failed, self.interval.as_secs());

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping the poll loop");
                    break;
                }
            }
        }

        debug!("Closing telemetry connection after {} cycles", cycles);
        self.publisher.shutdown().await;
        return cycles;
    }
}
