use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info};
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialStream};

use crate::config::{ParityConfig, SerialConfig};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid frame: {0}")]
    Frame(String),
    #[error("Expected {expected} registers, got {} ({registers:?})", .registers.len())]
    UnexpectedLength { expected: u16, registers: Vec<u16> },
}

/// A field bus that can read holding registers (function code 3).
#[async_trait]
pub trait RegisterBus: Send {
    async fn read_holding_registers(&mut self, meter_id: u8, start: u16, count: u16) -> Result<Vec<u16>, BusError>;
}

/// Modbus RTU over a local serial line. All meters share the one port.
pub struct RtuBus {
    port: SerialStream,
    timeout: Duration,
}

impl RtuBus {
    pub fn open(config: &SerialConfig) -> Result<Self, BusError> {
        let parity = match config.parity {
            ParityConfig::None => tokio_serial::Parity::None,
            ParityConfig::Even => tokio_serial::Parity::Even,
            ParityConfig::Odd => tokio_serial::Parity::Odd,
        };

        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let builder = tokio_serial::new(config.port.as_str(), config.baud_rate)
            .parity(parity)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .timeout(config.timeout());

        let port = SerialStream::open(&builder)?;
        info!("Opened {} at {} baud, parity {:?}", config.port, config.baud_rate, config.parity);

        return Ok(RtuBus { port, timeout: config.timeout() });
    }

    async fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>, BusError> {
        self.port.write_all(request).await?;
        self.port.flush().await?;

        /* an exception answer is 5 bytes, every valid answer is longer */
        let mut response = vec![0u8; 5];
        self.port.read_exact(&mut response).await?;

        let len = guess_response_frame_len(&response, ModbusProto::Rtu)
            .map_err(|e| BusError::Frame(format!("unable to size response: {:?}", e)))? as usize;

        if len > response.len() {
            let mut rest = vec![0u8; len - response.len()];
            self.port.read_exact(&mut rest).await?;
            response.extend_from_slice(&rest);
        }

        return Ok(response);
    }
}

#[async_trait]
impl RegisterBus for RtuBus {
    async fn read_holding_registers(&mut self, meter_id: u8, start: u16, count: u16) -> Result<Vec<u16>, BusError> {
        /* stale bytes of an earlier timed out answer would shift the framing */
        tokio_serial::SerialPort::clear(&self.port, ClearBuffer::All)?;

        let mut mreq = ModbusRequest::new(meter_id, ModbusProto::Rtu);
        let mut request = Vec::new();
        mreq.generate_get_holdings(start, count, &mut request)
            .map_err(|e| BusError::Frame(format!("unable to build request: {:?}", e)))?;

        let response = match tokio::time::timeout(self.timeout, self.transact(&request)).await {
            Ok(r) => r?,
            Err(_) => return Err(BusError::Timeout(self.timeout)),
        };
        debug!("Meter {} register {} response {:02X?}", meter_id, start, response);

        let mut data: Vec<u16> = Vec::new();
        mreq.parse_u16(&response, &mut data)
            .map_err(|e| BusError::Frame(format!("{:?}", e)))?;

        return check_count(count, data);
    }
}

fn check_count(expected: u16, registers: Vec<u16>) -> Result<Vec<u16>, BusError> {
    if registers.len() != expected as usize {
        return Err(BusError::UnexpectedLength { expected, registers });
    }
    return Ok(registers);
}
