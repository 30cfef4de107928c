use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};

/// One poll of one meter. Missing quantities are published as `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterReading {
    #[serde(serialize_with = "serialize_iso")]
    pub timestamp: DateTime<Local>,
    pub meter_id: u8,
    #[serde(rename = "Avg Current")]
    pub current: Option<f64>,
    #[serde(rename = "Avg Voltage")]
    pub voltage: Option<f64>,
    /// Power factor after correction
    #[serde(rename = "Avg PF")]
    pub power_factor: Option<f64>,
    #[serde(rename = "kWh")]
    pub energy: Option<f64>,
}

impl MeterReading {
    pub fn new(meter_id: u8, current: Option<f64>, voltage: Option<f64>, power_factor: Option<f64>, energy: Option<f64>) -> Self {
        return MeterReading {
            timestamp: Local::now(),
            meter_id,
            current,
            voltage,
            power_factor,
            energy,
        };
    }

    /// Number of quantities that could not be read
    pub fn missing(&self) -> usize {
        return [self.current, self.voltage, self.power_factor, self.energy]
            .iter()
            .filter(|v| v.is_none())
            .count();
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        return serde_json::to_string(self);
    }
}

fn serialize_iso<S: Serializer>(timestamp: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error> {
    return serializer.serialize_str(&crate::iso_timestamp(timestamp));
}
