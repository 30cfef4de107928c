use std::time::Duration;
use log::{debug, error, warn};
use thiserror::Error;

use crate::config::TimingConfig;
use super::bus::{BusError, RegisterBus};
use super::decode::{DecodeError, Decoder};

/// Every quantity is a 32 bit float spread over two registers
pub const REGISTER_PAIR: u16 = 2;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    /// Pause between two attempts
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(timing: &TimingConfig) -> Self {
        return RetryPolicy {
            attempts: timing.retry_count,
            delay: timing.read_delay(),
        };
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        return RetryPolicy::from_config(&TimingConfig::default());
    }
}

/// Reads and decodes one register pair, retrying bus and decode failures.
///
/// Returns `None` once all attempts failed. That is an expected outcome for a
/// meter that is switched off or noisy, callers carry on with the next quantity.
pub async fn read_quantity<B: RegisterBus + ?Sized>(
    bus: &mut B,
    meter_id: u8,
    register: u16,
    decoder: Decoder,
    policy: &RetryPolicy,
) -> Option<f64> {
    for attempt in 1..=policy.attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.delay).await;
        }

        match read_once(bus, meter_id, register, decoder).await {
            Ok(value) => return Some(value),
            Err(e) => {
                warn!("[ID {}] Error reading register {} (try {}/{}): {}",
                      meter_id, register, attempt, policy.attempts, e);
            }
        }
    }

    error!("[ID {}] Register {} gave no value after {} attempts", meter_id, register, policy.attempts);
    return None;
}

async fn read_once<B: RegisterBus + ?Sized>(
    bus: &mut B,
    meter_id: u8,
    register: u16,
    decoder: Decoder,
) -> Result<f64, ReadError> {
    let registers = bus.read_holding_registers(meter_id, register, REGISTER_PAIR).await?;
    debug!("[ID {}] Register {} raw: {:?}", meter_id, register, registers);
    return Ok(decoder.decode(&registers)?);
}
