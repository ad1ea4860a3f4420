//! Bit-level packing of fixed-width values. Bits are little-endian: value bit 0 goes to the
//! lowest free bit of the current byte, and bytes fill in increasing order.

use crate::types::{unsigned_max, BaseType};
use byteorder::{ByteOrder, LittleEndian};
use half::f16;

/// Read-only cursor over a payload.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BitReader { buf, offset: 0 }
    }

    /// Current position in bits.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining_bits(&self) -> usize {
        (self.buf.len() * 8).saturating_sub(self.offset)
    }

    /// Next `n` bits (at most 64), or `None` if the payload ends first.
    pub fn read(&mut self, n: u32) -> Option<u64> {
        let value = read_bits(self.buf, self.offset, n)?;
        self.offset += n as usize;
        Some(value)
    }

    pub fn skip(&mut self, n: u32) -> Option<()> {
        if self.remaining_bits() < n as usize {
            return None;
        }
        self.offset += n as usize;
        Some(())
    }
}

/// Growable output buffer with a bit cursor.
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    offset: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Append the low `n` bits of `value`.
    pub fn write(&mut self, n: u32, value: u64) {
        write_bits(&mut self.buf, self.offset, n, value);
        self.offset += n as usize;
    }

    /// Advance over `n` zero bits.
    pub fn skip(&mut self, n: u32) {
        self.offset += n as usize;
        self.buf.resize(self.offset.div_ceil(8), 0);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Read `n <= 64` bits starting at bit `offset`.
pub fn read_bits(buf: &[u8], offset: usize, n: u32) -> Option<u64> {
    if n > 64 || offset + n as usize > buf.len() * 8 {
        return None;
    }
    if n == 0 {
        return Some(0);
    }
    if offset % 8 == 0 && n % 8 == 0 {
        let start = offset / 8;
        let len = n as usize / 8;
        return Some(LittleEndian::read_uint(&buf[start..start + len], len));
    }
    let mut out = 0u64;
    for i in 0..n as usize {
        let pos = offset + i;
        if (buf[pos / 8] >> (pos % 8)) & 1 != 0 {
            out |= 1u64 << i;
        }
    }
    Some(out)
}

/// Write the low `n <= 64` bits of `value` at bit `offset`, growing `buf` as needed.
/// Bits outside the written range are left untouched.
pub fn write_bits(buf: &mut Vec<u8>, offset: usize, n: u32, value: u64) {
    let n = n.min(64);
    let end = offset + n as usize;
    if buf.len() * 8 < end {
        buf.resize(end.div_ceil(8), 0);
    }
    let value = value & unsigned_max(n);
    if offset % 8 == 0 && n % 8 == 0 && n > 0 {
        let start = offset / 8;
        let len = n as usize / 8;
        LittleEndian::write_uint(&mut buf[start..start + len], value, len);
        return;
    }
    for i in 0..n as usize {
        let pos = offset + i;
        let mask = 1u8 << (pos % 8);
        if (value >> i) & 1 != 0 {
            buf[pos / 8] |= mask;
        } else {
            buf[pos / 8] &= !mask;
        }
    }
}

/// Two's complement sign extension of a `bits`-wide value.
pub fn sign_extend(raw: u64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

/// Interpret raw wire bits as a value of the given kind.
pub fn decode_value(base: BaseType, bits: u32, raw: u64) -> f64 {
    match base {
        BaseType::UnsignedInt => raw as f64,
        BaseType::SignedInt => sign_extend(raw, bits) as f64,
        BaseType::Boolean => (raw & 1) as f64,
        BaseType::Float => match bits {
            16 => f16::from_bits(raw as u16).to_f64(),
            32 => f64::from(f32::from_bits(raw as u32)),
            _ => f64::from_bits(raw),
        },
        BaseType::Void => 0.0,
    }
}

/// Wire bits for `value`. Integers are cast and truncated to `bits`; booleans use a 0.5 threshold;
/// floats keep their exact IEEE-754 pattern (float16 rounds to nearest).
pub fn encode_value(base: BaseType, bits: u32, value: f64) -> u64 {
    let raw = match base {
        BaseType::UnsignedInt => value as u64,
        BaseType::SignedInt => value as i64 as u64,
        BaseType::Boolean => u64::from(value > 0.5),
        BaseType::Float => match bits {
            16 => u64::from(f16::from_f64(value).to_bits()),
            32 => u64::from((value as f32).to_bits()),
            _ => value.to_bits(),
        },
        BaseType::Void => 0,
    };
    raw & unsigned_max(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsb_first_across_byte_boundaries() {
        let mut w = BitWriter::new();
        w.write(3, 0b101);
        w.write(7, 0b1100110);
        w.write(6, 0b111111);
        let bytes = w.into_bytes();
        // 101 | 0110011 -> byte0 = 0b0011_0101, remaining bits 11 then 111111
        assert_eq!(bytes, vec![0b0011_0101, 0b1111_1111]);

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read(3), Some(0b101));
        assert_eq!(r.read(7), Some(0b1100110));
        assert_eq!(r.read(6), Some(0b111111));
        assert_eq!(r.read(1), None);
    }

    #[test]
    fn aligned_path_matches_bitwise_path() {
        let buf = [0x78, 0x56, 0x34, 0x12, 0xff];
        assert_eq!(read_bits(&buf, 0, 32), Some(0x1234_5678));
        assert_eq!(read_bits(&buf, 8, 16), Some(0x3456));
        assert_eq!(read_bits(&buf, 4, 16), Some(0x4567));

        let mut out = Vec::new();
        write_bits(&mut out, 0, 32, 0x1234_5678);
        assert_eq!(out, vec![0x78, 0x56, 0x34, 0x12]);
        write_bits(&mut out, 4, 8, 0xab);
        assert_eq!(out, vec![0xb8, 0x5a, 0x34, 0x12]);
    }

    #[test]
    fn write_masks_value_to_width() {
        let mut out = vec![0u8; 2];
        write_bits(&mut out, 0, 8, 0x1ff);
        assert_eq!(out, vec![0xff, 0x00]);
        write_bits(&mut out, 0, 4, 0);
        assert_eq!(out, vec![0xf0, 0x00]);
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0b111, 3), -1);
        assert_eq!(sign_extend(0b100, 3), -4);
        assert_eq!(sign_extend(0b011, 3), 3);
        assert_eq!(sign_extend(u64::MAX, 64), -1);
    }

    #[test]
    fn integers_round_trip_at_their_limits() {
        // limits of widths 54..=63 are not exact in an f64; 64 is, through the saturating casts
        for bits in [2u32, 3, 7, 8, 13, 16, 31, 32, 53, 64] {
            let max = unsigned_max(bits);
            for v in [0u64, 1, max / 2, max] {
                let raw = encode_value(BaseType::UnsignedInt, bits, v as f64);
                assert_eq!(decode_value(BaseType::UnsignedInt, bits, raw), v as f64, "uint{bits} {v}");
            }
            let lo = i64::MIN >> (64 - bits);
            let hi = i64::MAX >> (64 - bits);
            for v in [lo, -1, 0, hi] {
                let raw = encode_value(BaseType::SignedInt, bits, v as f64);
                assert_eq!(decode_value(BaseType::SignedInt, bits, raw), v as f64, "int{bits} {v}");
            }
        }
    }

    #[test]
    fn sixty_four_bit_limits() {
        assert_eq!(encode_value(BaseType::UnsignedInt, 64, u64::MAX as f64), u64::MAX);
        assert_eq!(decode_value(BaseType::UnsignedInt, 64, u64::MAX), u64::MAX as f64);
        assert_eq!(encode_value(BaseType::SignedInt, 64, i64::MIN as f64), i64::MIN as u64);
        assert_eq!(decode_value(BaseType::SignedInt, 64, i64::MIN as u64), i64::MIN as f64);
        assert_eq!(decode_value(BaseType::SignedInt, 64, i64::MAX as u64), i64::MAX as f64);
        assert_eq!(decode_value(BaseType::SignedInt, 64, u64::MAX), -1.0);

        // full-width words off a byte boundary
        let mut w = BitWriter::new();
        w.write(3, 0b101);
        w.write(64, u64::MAX);
        w.write(64, i64::MIN as u64);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 17);
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read(3), Some(0b101));
        assert_eq!(r.read(64), Some(u64::MAX));
        assert_eq!(r.read(64).map(|raw| sign_extend(raw, 64)), Some(i64::MIN));
    }

    #[test]
    fn floats_keep_their_bit_pattern() {
        let raw = encode_value(BaseType::Float, 32, 128.64);
        assert_eq!(raw, u64::from(128.64f32.to_bits()));
        assert_eq!(decode_value(BaseType::Float, 32, raw), f64::from(128.64f32));

        let raw = encode_value(BaseType::Float, 64, -0.1);
        assert_eq!(decode_value(BaseType::Float, 64, raw), -0.1);

        let raw = encode_value(BaseType::Float, 16, 1.5);
        assert_eq!(raw, 0x3e00);
        assert_eq!(decode_value(BaseType::Float, 16, raw), 1.5);
        // 65504 is the largest finite half; beyond that rounds to infinity
        assert_eq!(decode_value(BaseType::Float, 16, encode_value(BaseType::Float, 16, 65504.0)), 65504.0);
        assert!(decode_value(BaseType::Float, 16, encode_value(BaseType::Float, 16, 1e6)).is_infinite());
    }

    #[test]
    fn booleans_use_threshold() {
        assert_eq!(encode_value(BaseType::Boolean, 1, 0.49), 0);
        assert_eq!(encode_value(BaseType::Boolean, 1, 0.51), 1);
        assert_eq!(encode_value(BaseType::Boolean, 1, 1.0), 1);
        assert_eq!(decode_value(BaseType::Boolean, 1, 1), 1.0);
    }
}
