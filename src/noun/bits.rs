use num_bigint::BigUint;

/// Appends bit fields to a growing atom, least significant bit first.
#[derive(Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    len: u64,
}

impl BitWriter {
    pub fn new() -> BitWriter {
        Default::default()
    }

    /// number of bits written so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_bit(&mut self, bit: bool) {
        self.push_byte_bits(bit as u8, 1);
    }

    pub fn push_zeros(&mut self, num_bits: u64) {
        for _ in 0..num_bits / 8 {
            self.push_byte_bits(0, 8);
        }
        let rem = (num_bits % 8) as u32;
        if rem > 0 {
            self.push_byte_bits(0, rem);
        }
    }

    /// Appends the low `num_bits` bits of `value`
    pub fn push_u64(&mut self, value: u64, num_bits: u32) {
        debug_assert!(num_bits <= 64);
        let mut remaining = num_bits;
        let mut value = value;
        while remaining > 0 {
            let chunk = remaining.min(8);
            self.push_byte_bits(value as u8, chunk);
            value = value.checked_shr(8).unwrap_or(0);
            remaining -= chunk;
        }
    }

    /// Appends the low `num_bits` bits of `value`, zero-extending it if it is shorter
    pub fn push_atom(&mut self, value: &BigUint, num_bits: u64) {
        let bytes = value.to_bytes_le();
        let mut remaining = num_bits;
        let mut idx = 0;
        while remaining > 0 {
            let chunk = remaining.min(8) as u32;
            let byte = bytes.get(idx).copied().unwrap_or(0);
            self.push_byte_bits(byte, chunk);
            idx += 1;
            remaining -= chunk as u64;
        }
    }

    fn push_byte_bits(&mut self, byte: u8, num_bits: u32) {
        debug_assert!(num_bits >= 1 && num_bits <= 8);
        let byte = if num_bits < 8 { byte & ((1u8 << num_bits) - 1) } else { byte };

        let shift = (self.len % 8) as u32;
        if shift == 0 {
            self.bytes.push(byte);
        }
        else {
            // a partially filled last byte always exists if shift > 0
            if let Some(last) = self.bytes.last_mut() {
                *last |= byte << shift;
            }
            if num_bits > 8 - shift {
                self.bytes.push(byte >> (8 - shift));
            }
        }
        self.len += num_bits as u64;
    }

    pub fn into_atom(self) -> BigUint {
        BigUint::from_bytes_le(&self.bytes)
    }
}

/// Random access to the bits of an atom. Bits beyond the atom's length read as zero.
pub struct BitReader {
    bytes: Vec<u8>,
    len: u64,
}

impl BitReader {
    pub fn new(atom: &BigUint) -> BitReader {
        BitReader {
            bytes: atom.to_bytes_le(),
            len: atom.bits(),
        }
    }

    /// bit length of the underlying atom
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn byte(&self, idx: u64) -> u8 {
        usize::try_from(idx).ok()
            .and_then(|i| self.bytes.get(i))
            .copied()
            .unwrap_or(0)
    }

    pub fn bit(&self, pos: u64) -> bool {
        (self.byte(pos / 8) >> (pos % 8)) & 1 == 1
    }

    pub fn read_u64(&self, pos: u64, num_bits: u32) -> u64 {
        debug_assert!(num_bits <= 64);
        let mut result = 0u64;
        for i in 0..num_bits as u64 {
            if self.bit(pos + i) {
                result |= 1 << i;
            }
        }
        result
    }

    pub fn read_atom(&self, pos: u64, num_bits: u64) -> BigUint {
        let num_bytes = num_bits.div_ceil(8);
        let start = pos / 8;
        let shift = (pos % 8) as u32;

        let mut out = Vec::with_capacity(usize::try_from(num_bytes).unwrap_or(0));
        for i in 0..num_bytes {
            let lo = self.byte(start + i) >> shift;
            let hi = if shift == 0 { 0 } else { self.byte(start + i + 1) << (8 - shift) };
            out.push(lo | hi);
        }
        let rem = (num_bits % 8) as u32;
        if rem != 0 {
            if let Some(last) = out.last_mut() {
                *last &= (1u8 << rem) - 1;
            }
        }
        BigUint::from_bytes_le(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_writer_unaligned() {
        let mut w = BitWriter::new();
        w.push_bit(true);
        w.push_bit(false);
        w.push_u64(0b1011, 4);
        w.push_atom(&BigUint::from(0x1ffu32), 9);
        w.push_zeros(3);
        w.push_bit(true);

        assert_eq!(w.len(), 19);
        assert_eq!(w.into_atom(), BigUint::from(0b1_000_111111111_1011_01u32));
    }

    #[test]
    fn test_writer_truncates_and_extends() {
        let mut w = BitWriter::new();
        w.push_atom(&BigUint::from(0xffu32), 4);
        w.push_atom(&BigUint::from(1u32), 12);
        w.push_bit(true);
        assert_eq!(w.len(), 17);
        assert_eq!(w.into_atom(), BigUint::from(0x1_001fu32));
    }

    #[rstest]
    #[case::aligned(0x12345678u64, 8, 8, 0x56)]
    #[case::unaligned(0x12345678u64, 4, 12, 0x567)]
    #[case::across_bytes(0b1011_0110u64, 3, 3, 0b110)]
    #[case::past_end(0xffu64, 4, 16, 0xf)]
    #[case::single_bit(0b100u64, 2, 1, 1)]
    fn test_reader(#[case] atom: u64, #[case] pos: u64, #[case] num_bits: u64, #[case] expected: u64) {
        let r = BitReader::new(&BigUint::from(atom));
        assert_eq!(r.read_atom(pos, num_bits), BigUint::from(expected));
        assert_eq!(r.read_u64(pos, num_bits as u32), expected);
    }

    #[test]
    fn test_reader_len() {
        assert_eq!(BitReader::new(&BigUint::from(0u32)).len(), 0);
        assert_eq!(BitReader::new(&BigUint::from(0x100u32)).len(), 9);
    }
}
