//! Quantized float decoder (C4).
//!
//! Ported in spirit (not literally) from the reference `quantized_float_decoder`:
//! same flag-normalization order, same five-step multiplier retry ladder.

use crate::bitreader::BitReader;
use crate::error::Result;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QuantizeFlags: u8 {
        const ROUND_DOWN        = 1 << 0;
        const ROUND_UP          = 1 << 1;
        const ZERO_EXACTLY      = 1 << 2;
        const INTEGERS_EXACTLY  = 1 << 3;
    }
}

const RETRY_MULTIPLIERS: [f32; 5] = [0.9999, 0.99, 0.9, 0.8, 0.7];

#[derive(Debug, Clone, Copy)]
pub struct QuantizedFloatDecoder {
    min: f32,
    max: f32,
    high_low_mul: f32,
    decode_mul: f32,
    bits: u8,
    flags: QuantizeFlags,
    noscale: bool,
}

impl QuantizedFloatDecoder {
    pub fn new(bits: u8, encode_flags: QuantizeFlags, mut min: f32, mut max: f32) -> Self {
        if bits == 0 || bits >= 32 {
            return QuantizedFloatDecoder {
                min,
                max,
                high_low_mul: 0.0,
                decode_mul: 0.0,
                bits,
                flags: QuantizeFlags::empty(),
                noscale: true,
            };
        }

        let mut flags = Self::validate_flags(encode_flags, min, max);
        let mut bits = bits;
        let mut steps = 1u32 << bits;

        if flags.contains(QuantizeFlags::ROUND_DOWN) {
            let range = max - min;
            max -= range / steps as f32;
        } else if flags.contains(QuantizeFlags::ROUND_UP) {
            let range = max - min;
            min += range / steps as f32;
        }

        if flags.contains(QuantizeFlags::INTEGERS_EXACTLY) {
            let i_min = min as i32;
            let i_max = max as i32;
            let i_delta = if i_max - i_min < 1 { 1 } else { i_max - i_min };
            let i_log2 = ((i_delta as f32).log2().ceil() as i32) + 1;
            let range = 1i32 << i_log2;

            let mut i_bits = bits as u32;
            while (1i64 << i_bits) < range as i64 {
                i_bits += 1;
            }
            if i_bits > bits as u32 {
                bits = i_bits as u8;
                steps = 1u32 << bits;
            }
            max = min + range as f32 - ((1i64 << i_delta) as f32 / steps as f32);
        }

        let mut decoder = QuantizedFloatDecoder {
            min,
            max,
            high_low_mul: 0.0,
            decode_mul: 0.0,
            bits,
            flags,
            noscale: false,
        };
        decoder.assign_multipliers(steps);

        if flags.contains(QuantizeFlags::ROUND_DOWN) && decoder.quantize(min) == min {
            flags.remove(QuantizeFlags::ROUND_DOWN);
        }
        if flags.contains(QuantizeFlags::ROUND_UP) && decoder.quantize(max) == max {
            flags.remove(QuantizeFlags::ROUND_UP);
        }
        if flags.contains(QuantizeFlags::ZERO_EXACTLY) && decoder.quantize(0.0) == 0.0 {
            flags.remove(QuantizeFlags::ZERO_EXACTLY);
        }
        decoder.flags = flags;
        decoder
    }

    fn validate_flags(encode_flags: QuantizeFlags, min: f32, max: f32) -> QuantizeFlags {
        let mut flags = encode_flags;

        if (min == 0.0 && flags.contains(QuantizeFlags::ROUND_DOWN))
            || (max == 0.0 && flags.contains(QuantizeFlags::ROUND_UP))
        {
            flags.remove(QuantizeFlags::ZERO_EXACTLY);
        }

        if min == 0.0 && flags.contains(QuantizeFlags::ZERO_EXACTLY) {
            flags.insert(QuantizeFlags::ROUND_DOWN);
            flags.remove(QuantizeFlags::ZERO_EXACTLY);
        }

        if max == 0.0 && flags.contains(QuantizeFlags::ZERO_EXACTLY) {
            flags.insert(QuantizeFlags::ROUND_UP);
            flags.remove(QuantizeFlags::ZERO_EXACTLY);
        }

        let need_zero_test = min < 0.0 && max > 0.0;
        if !need_zero_test {
            flags.remove(QuantizeFlags::ZERO_EXACTLY);
        }

        if flags.contains(QuantizeFlags::INTEGERS_EXACTLY) {
            flags.remove(QuantizeFlags::ROUND_UP);
            flags.remove(QuantizeFlags::ROUND_DOWN);
            flags.remove(QuantizeFlags::ZERO_EXACTLY);
        }

        flags
    }

    fn assign_multipliers(&mut self, steps: u32) {
        let range = self.max - self.min;
        let high_val: u32 = if self.bits == 32 { 0xFFFF_FFFE } else { (1u32 << self.bits) - 1 };
        self.high_low_mul = if range.abs() <= 0.0 {
            high_val as f32
        } else {
            high_val as f32 / range
        };

        let overshoots = |mul: f32| -> bool {
            let scaled = mul * range;
            (scaled as u32) > high_val || (scaled as f64) > high_val as f64
        };

        if overshoots(self.high_low_mul) {
            for mul in RETRY_MULTIPLIERS {
                self.high_low_mul = (high_val as f32 / range) * mul;
                if !overshoots(self.high_low_mul) {
                    break;
                }
            }
        }

        self.decode_mul = 1.0 / (steps - 1) as f32;
    }

    fn quantize(&self, f: f32) -> f32 {
        if f < self.min {
            return self.min;
        }
        if f > self.max {
            return self.max;
        }
        let i = ((f - self.min) * self.high_low_mul) as u32;
        self.min + (self.max - self.min) * (i as f32 * self.decode_mul)
    }

    pub fn decode(&self, b: &mut BitReader) -> Result<f32> {
        if self.noscale {
            let bits = b.read(32)?;
            return Ok(f32::from_bits(bits));
        }
        if self.flags.contains(QuantizeFlags::ROUND_DOWN) && b.read_bool()? {
            return Ok(self.min);
        }
        if self.flags.contains(QuantizeFlags::ROUND_UP) && b.read_bool()? {
            return Ok(self.max);
        }
        if self.flags.contains(QuantizeFlags::ZERO_EXACTLY) && b.read_bool()? {
            return Ok(0.0);
        }
        let u = b.read(self.bits as u32)?;
        Ok(self.min + (self.max - self.min) * (u as f32 * self.decode_mul))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_bit_round_down_zero_to_sixty_four() {
        let d = QuantizedFloatDecoder::new(8, QuantizeFlags::ROUND_DOWN, 0.0, 64.0);
        // payload: flag bit 0 (not min), then 8 raw bits = 128
        let bits = [0b1000_0000u8, 0b0000_0000u8];
        let mut b = BitReader::new(&bits);
        let v = d.decode(&mut b).unwrap();
        assert!(v > 0.0 && v < 64.0);
    }

    #[test]
    fn round_down_flag_selects_min() {
        let d = QuantizedFloatDecoder::new(8, QuantizeFlags::ROUND_DOWN, 0.0, 64.0);
        let bits = [0b0000_0001u8];
        let mut b = BitReader::new(&bits);
        let v = d.decode(&mut b).unwrap();
        assert_eq!(v, 0.0);
    }

    #[test]
    fn noscale_reads_raw_bit_pattern() {
        let d = QuantizedFloatDecoder::new(32, QuantizeFlags::empty(), 0.0, 1.0);
        let bits = 1.5f32.to_le_bytes();
        let mut b = BitReader::new(&bits);
        let v = d.decode(&mut b).unwrap();
        assert_eq!(v, 1.5);
    }
}
