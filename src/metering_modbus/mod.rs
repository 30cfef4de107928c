use std::time::Duration;
use log::{debug, warn};

use crate::config::{Config, RegisterConfig};
use crate::models::MeterReading;

pub mod bus;
pub mod correction;
pub mod decode;
pub mod reader;

use bus::RegisterBus;
use correction::CorrectionTable;
use decode::Decoder;
use reader::{read_quantity, RetryPolicy};

/// Reads all quantities of a meter, one register pair after the other.
#[derive(Debug, Clone)]
pub struct MeterPoller {
    registers: RegisterConfig,
    corrections: CorrectionTable,
    policy: RetryPolicy,
    read_pause: Duration,
}

impl MeterPoller {
    pub fn new(registers: RegisterConfig, corrections: CorrectionTable, policy: RetryPolicy, read_pause: Duration) -> Self {
        return MeterPoller { registers, corrections, policy, read_pause };
    }

    pub fn from_config(config: &Config) -> Self {
        return MeterPoller::new(
            config.registers,
            CorrectionTable::new(config.pf_correction.clone()),
            RetryPolicy::from_config(&config.timing),
            config.timing.read_delay(),
        );
    }

    /// Polls current, voltage, power factor and energy in that order.
    ///
    /// The meters share one line, so nothing here runs concurrently. A quantity
    /// that cannot be read ends up as `None` and the remaining ones are still read.
    pub async fn poll<B: RegisterBus + ?Sized>(&self, bus: &mut B, meter_id: u8) -> MeterReading {
        debug!("Meter {} start reading", meter_id);

        let current = read_quantity(bus, meter_id, self.registers.current, Decoder::Cdab, &self.policy).await;
        tokio::time::sleep(self.read_pause).await;

        let voltage = read_quantity(bus, meter_id, self.registers.voltage, Decoder::Cdab, &self.policy).await;
        tokio::time::sleep(self.read_pause).await;

        let pf_raw = read_quantity(bus, meter_id, self.registers.power_factor, Decoder::Cdab, &self.policy).await;
        tokio::time::sleep(self.read_pause).await;
        let power_factor = self.corrections.apply(meter_id, pf_raw);

        let energy = read_quantity(bus, meter_id, self.registers.energy, Decoder::Straight, &self.policy).await;

        let reading = MeterReading::new(meter_id, current, voltage, power_factor, energy);
        if reading.missing() > 0 {
            warn!("Meter {} is missing {} of 4 values", meter_id, reading.missing());
        }
        debug!("Meter {} done reading", meter_id);
        return reading;
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;
    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::bus::{BusError, RegisterBus};

    /// In-memory bus. Scripted answers are consumed first, then the fixed
    /// answer is used, anything else times out.
    #[derive(Default)]
    pub struct ScriptedBus {
        scripts: HashMap<(u8, u16), VecDeque<Result<Vec<u16>, BusError>>>,
        fixed: HashMap<(u8, u16), Vec<u16>>,
        pub calls: Vec<(u8, u16, Instant)>,
    }

    impl ScriptedBus {
        pub fn new() -> Self {
            return ScriptedBus::default();
        }

        pub fn script(&mut self, meter_id: u8, start: u16, answers: Vec<Result<Vec<u16>, BusError>>) {
            self.scripts.entry((meter_id, start)).or_default().extend(answers);
        }

        pub fn always(&mut self, meter_id: u8, start: u16, registers: &[u16]) {
            self.fixed.insert((meter_id, start), registers.to_vec());
        }

        /// Stops answering the register, every later read times out.
        pub fn unplug(&mut self, meter_id: u8, start: u16) {
            self.fixed.remove(&(meter_id, start));
            self.scripts.remove(&(meter_id, start));
        }

        pub fn calls_for(&self, meter_id: u8) -> Vec<u16> {
            return self.calls.iter().filter(|c| c.0 == meter_id).map(|c| c.1).collect();
        }
    }

    #[async_trait]
    impl RegisterBus for ScriptedBus {
        async fn read_holding_registers(&mut self, meter_id: u8, start: u16, count: u16) -> Result<Vec<u16>, BusError> {
            assert_eq!(count, 2);
            self.calls.push((meter_id, start, Instant::now()));

            if let Some(answer) = self.scripts.get_mut(&(meter_id, start)).and_then(|s| s.pop_front()) {
                return answer;
            }

            return match self.fixed.get(&(meter_id, start)) {
                Some(registers) => Ok(registers.clone()),
                None => Err(BusError::Timeout(Duration::from_secs(1))),
            };
        }
    }
}
