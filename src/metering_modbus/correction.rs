use std::collections::BTreeMap;

use super::decode::round_f64;

/// Per meter factor applied to the power factor reading.
#[derive(Debug, Clone, Default)]
pub struct CorrectionTable {
    factors: BTreeMap<u8, f64>,
}

impl CorrectionTable {
    pub fn new(factors: BTreeMap<u8, f64>) -> Self {
        return CorrectionTable { factors };
    }

    pub fn factor(&self, meter_id: u8) -> f64 {
        return self.factors.get(&meter_id).copied().unwrap_or(1.0);
    }

    /// A missing reading stays missing.
    pub fn apply(&self, meter_id: u8, raw: Option<f64>) -> Option<f64> {
        return raw.map(|value| round_f64(value * self.factor(meter_id)));
    }
}
