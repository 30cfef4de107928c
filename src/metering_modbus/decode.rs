use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("Expected 2 registers, got {0}")]
    RegisterCount(usize),
    #[error("Registers {0:#06x} {1:#06x} do not hold a finite float")]
    NonFinite(u16, u16),
}

/// How a register pair is turned into a float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoder {
    /// Instantaneous quantities (current, voltage, power factor)
    Cdab,
    /// Cumulative energy counter
    Straight,
}

impl Decoder {
    pub fn decode(&self, registers: &[u16]) -> Result<f64, DecodeError> {
        let (r0, r1) = match registers {
            [r0, r1] => (*r0, *r1),
            _ => return Err(DecodeError::RegisterCount(registers.len())),
        };

        let value = match self {
            Decoder::Cdab => decode_cdab(r0, r1),
            Decoder::Straight => decode_straight(r0, r1),
        };

        if !value.is_finite() {
            return Err(DecodeError::NonFinite(r0, r1));
        }

        return Ok(value);
    }
}

/// Rebuilds the float from the bytes `hi(r0) lo(r0) hi(r1) lo(r1)` read as big endian.
///
/// The meters deliver their instantaneous values in this byte order. Using any
/// other order still yields a plausible looking number, so do not touch it
/// without checking the meter's register map.
pub fn decode_cdab(r0: u16, r1: u16) -> f64 {
    let bytes = [
        ((r0 >> 8) & 0xFF) as u8,
        (r0 & 0xFF) as u8,
        ((r1 >> 8) & 0xFF) as u8,
        (r1 & 0xFF) as u8,
    ];
    return round3(f32::from_be_bytes(bytes));
}

/// Packs both registers into one 32 bit word, `r0` in the upper half, and
/// reinterprets the bits as a float.
pub fn decode_straight(r0: u16, r1: u16) -> f64 {
    let word = (u32::from(r0) << 16) | u32::from(r1);
    return round3(f32::from_bits(word));
}

/// Widens to f64 and rounds to 3 decimals.
pub fn round3(value: f32) -> f64 {
    return round_f64(f64::from(value));
}

/// Rounds to 3 decimals based on the exact binary value. Only a value lying
/// exactly halfway goes to the even neighbour, so 0.0625 becomes 0.062.
pub fn round_f64(value: f64) -> f64 {
    let scaled = value * 1000.0;
    /* exact remainder of the multiplication, tells on which side of a .5 the true value is */
    let error = value.mul_add(1000.0, -scaled);

    let rounded = if (scaled - scaled.trunc()).abs() == 0.5 {
        if error == 0.0 {
            scaled.round_ties_even()
        } else if error > 0.0 {
            scaled.ceil()
        } else {
            scaled.floor()
        }
    } else {
        scaled.round()
    };

    return rounded / 1000.0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_cdab_pi() {
        assert_eq!(decode_cdab(0x4048, 0xF5C3), 3.14);
    }

    #[test]
    fn test_decode_cdab_matches_byte_layout() {
        let pairs = [(0x4366, 0x8000), (0x3F80, 0x0000), (0xC2C8, 0x0000), (0x0000, 0x0000), (0x4120, 0x0000)];
        for (r0, r1) in pairs {
            let bytes = [(r0 >> 8) as u8, (r0 & 0xFF) as u8, (r1 >> 8) as u8, (r1 & 0xFF) as u8];
            let expected = (f64::from(f32::from_be_bytes(bytes)) * 1000.0).round() / 1000.0;
            assert_eq!(decode_cdab(r0, r1), expected);
        }
        assert_eq!(decode_cdab(0x4366, 0x8000), 230.5);
        assert_eq!(decode_cdab(0xC2C8, 0x0000), -100.0);
    }

    #[test]
    fn test_decode_straight() {
        /* 12345.678 kWh */
        let bits = 12345.678_f32.to_bits();
        assert_eq!(decode_straight((bits >> 16) as u16, (bits & 0xFFFF) as u16), 12345.678);
        assert_eq!(decode_straight(0x3F80, 0x0000), 1.0);
    }

    #[test]
    fn test_register_order_matters() {
        /* swapping the two words is the classic mistake, it must not go unnoticed */
        assert_ne!(decode_cdab(0x4048, 0xF5C3), decode_cdab(0xF5C3, 0x4048));
        assert_ne!(decode_straight(0x4048, 0xF5C3), decode_straight(0xF5C3, 0x4048));
    }

    #[test]
    fn test_both_paths_agree_on_wire_layout() {
        for (r0, r1) in [(0x4048, 0xF5C3), (0x4366, 0x8000), (0x461C, 0x3E77), (0xBF00, 0x0001)] {
            assert_eq!(decode_cdab(r0, r1), decode_straight(r0, r1));
        }
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round3(0.123_456), 0.123);
        assert_eq!(round3(-1.2346), -1.235);
        assert_eq!(round_f64(0.8499999), 0.85);
    }

    #[test]
    fn test_rounding_exact_ties_go_to_even() {
        /* small binary fractions sit exactly on the half */
        assert_eq!(decode_cdab(0x3D80, 0x0000), 0.062); // 0.0625
        assert_eq!(decode_cdab(0x3EA0, 0x0000), 0.312); // 0.3125
        assert_eq!(decode_cdab(0x4141, 0x0000), 12.062); // 12.0625
        assert_eq!(decode_cdab(0x3F50, 0x0000), 0.812); // 0.8125
        assert_eq!(decode_cdab(0x3E40, 0x0000), 0.188); // 0.1875
        assert_eq!(decode_cdab(0xBD80, 0x0000), -0.062); // -0.0625
        assert_eq!(decode_straight(0x3D80, 0x0000), 0.062);
    }

    #[test]
    fn test_rounding_near_ties_follows_true_value() {
        /* 1.0005 is stored slightly below the half, 1.0015 slightly above */
        assert_eq!(round_f64(1.0005), 1.0);
        assert_eq!(round_f64(1.0015), 1.002);
        assert_eq!(round_f64(2.0), 2.0);
    }

    #[test]
    fn test_decoder_preconditions() {
        assert_eq!(Decoder::Cdab.decode(&[0x4048]), Err(DecodeError::RegisterCount(1)));
        assert_eq!(Decoder::Straight.decode(&[1, 2, 3]), Err(DecodeError::RegisterCount(3)));
        assert_eq!(Decoder::Cdab.decode(&[0x7FC0, 0x0000]), Err(DecodeError::NonFinite(0x7FC0, 0x0000)));
        assert_eq!(Decoder::Straight.decode(&[0x7F80, 0x0000]), Err(DecodeError::NonFinite(0x7F80, 0x0000)));
        assert_eq!(Decoder::Cdab.decode(&[0x4048, 0xF5C3]), Ok(3.14));
    }
}
