//! Floating-point values.
//!
//! Floats only ever appear as data (`dd 3.14`) or as instruction immediates
//! for the odd architecture that takes them; they never participate in
//! constant folding. [`FloatNum`] keeps the parsed value as an IEEE binary64
//! and knows how to emit the three x87-era images: single (32-bit), double
//! (64-bit) and extended (80-bit).

use crate::Error;

/// A floating-point constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatNum(f64);

impl FloatNum {
    /// Construct from an already parsed value.
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    /// Construct from a decimal string (`3.14`, `1e-9`, `-2.5e3`…).
    pub fn from_str(text: &str) -> Result<Self, Error> {
        text.parse::<f64>()
            .map(Self)
            .map_err(|_| Error::Value(format!("malformed floating point constant `{text}`")))
    }

    /// The value as an `f64`.
    pub fn as_f64(&self) -> f64 {
        self.0
    }

    /// Append the IEEE image of the value to `buffer`. `size` must be 32,
    /// 64 or 80 bits.
    ///
    /// Returns false when the conversion lost range (overflow to infinity on
    /// narrowing); the caller owns the resulting warning.
    pub fn append_to(&self, buffer: &mut Vec<u8>, size: u32, big_endian: bool) -> Result<bool, Error> {
        let (image, nbytes, fits) = match size {
            32 => {
                let narrowed = self.0 as f32;
                let fits = narrowed.is_finite() || !self.0.is_finite();
                (u128::from(narrowed.to_bits()), 4, fits)
            }
            64 => (u128::from(self.0.to_bits()), 8, true),
            80 => (self.extended_bits(), 10, true),
            _ => {
                return Err(Error::Value(format!(
                    "invalid floating point constant size {size}"
                )));
            }
        };

        let le = image.to_le_bytes();
        if big_endian {
            buffer.extend(le[..nbytes].iter().rev());
        } else {
            buffer.extend_from_slice(&le[..nbytes]);
        }

        Ok(fits)
    }

    /// The 80-bit x87 extended-precision image, as the low 80 bits.
    ///
    /// Unlike the 32- and 64-bit formats, the integer bit of the mantissa is
    /// explicit in the extended format.
    fn extended_bits(&self) -> u128 {
        let bits = self.0.to_bits();
        let sign = (bits >> 63) & 1;
        let exponent = ((bits >> 52) & 0x7ff) as i32;
        let mantissa = bits & ((1u64 << 52) - 1);

        let (extended_exponent, extended_mantissa): (u128, u128) = match exponent {
            // Zero and subnormals; binary64 subnormals are representable as
            // normals in the wider format, but they are far below anything
            // an assembler source can write, so flush them to zero.
            0 => (0, 0),
            // Infinity and NaN.
            0x7ff => (0x7fff, (1u128 << 63) | ((mantissa as u128) << 11)),
            // Normal: re-bias 1023 -> 16383, widen the mantissa from 52 to
            // 63 bits and make the integer bit explicit.
            _ => (
                (exponent as u128) - 1023 + 16383,
                (1u128 << 63) | ((mantissa as u128) << 11),
            ),
        };

        ((sign as u128) << 79) | (extended_exponent << 64) | extended_mantissa
    }
}

impl std::fmt::Display for FloatNum {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(value: f64, size: u32) -> Vec<u8> {
        let mut buffer = Vec::new();
        FloatNum::new(value).append_to(&mut buffer, size, false).unwrap();
        buffer
    }

    #[test]
    fn test_single() {
        assert_eq!(bytes(1.0, 32), 1.0f32.to_le_bytes());
        assert_eq!(bytes(-2.5, 32), (-2.5f32).to_le_bytes());
    }

    #[test]
    fn test_double() {
        assert_eq!(bytes(3.14, 64), 3.14f64.to_le_bytes());
    }

    #[test]
    fn test_extended() {
        // 1.0 = sign 0, exponent 16383, mantissa with only the integer bit.
        let image = bytes(1.0, 80);
        assert_eq!(image.len(), 10);
        assert_eq!(&image[..8], &[0, 0, 0, 0, 0, 0, 0, 0x80]);
        assert_eq!(&image[8..], &[0xff, 0x3f]);

        // -2.0 = sign 1, exponent 16384.
        let image = bytes(-2.0, 80);
        assert_eq!(&image[..8], &[0, 0, 0, 0, 0, 0, 0, 0x80]);
        assert_eq!(&image[8..], &[0x00, 0xc0]);
    }

    #[test]
    fn test_narrowing_overflow() {
        let mut buffer = Vec::new();
        let fits = FloatNum::new(1e300).append_to(&mut buffer, 32, false).unwrap();
        assert!(!fits);
    }

    #[test]
    fn test_bad_size() {
        let mut buffer = Vec::new();
        assert!(FloatNum::new(1.0).append_to(&mut buffer, 16, false).is_err());
    }
}
