//! Append-only byte buffer with integer injection at a selectable width and
//! byte order. Every frame, command payload and session MAC in this crate
//! is built up one `BinData` push at a time before it ever touches a
//! `Transport`.

mod stream;

pub use self::stream::ByteStream;

use nom::number::Endianness;

/// Length-prefixed containers refuse to trust a length field past this many
/// bytes; a corrupt or adversarial length must never drive an allocation
/// this large. Hard error, not a soft warning.
pub const MAX_LENGTH_PREFIXED_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct BinData {
    bytes: Vec<u8>,
}

macro_rules! push_int {
    ($push:ident, $type:ty, $width_bytes:expr) => {
        pub fn $push(&mut self, value: $type, order: Endianness) {
            let full = (value as i64 as u64).to_le_bytes();
            let full_be = (value as i64 as u64).to_be_bytes();
            match order {
                Endianness::Little => self.bytes.extend_from_slice(&full[..$width_bytes]),
                Endianness::Big => {
                    self.bytes.extend_from_slice(&full_be[(8 - $width_bytes)..])
                }
                Endianness::Native => {
                    self.$push(value, if cfg!(target_endian = "little") {
                        Endianness::Little
                    } else {
                        Endianness::Big
                    })
                }
            }
        }
    };
}

impl BinData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// A sub-range view into the buffer as `(offset, length)`.
    pub fn view(&self, offset: usize, length: usize) -> &[u8] {
        &self.bytes[offset..offset + length]
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    pub fn push_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push_u8(if value { 1 } else { 0 });
    }

    pub fn push_bytes(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    push_int!(push_u16, u16, 2);
    push_int!(push_i16, i16, 2);
    push_int!(push_u24, u32, 3);
    push_int!(push_i24, i32, 3);
    push_int!(push_u32, u32, 4);
    push_int!(push_i32, i32, 4);
    push_int!(push_u64, u64, 8);
    push_int!(push_i64, i64, 8);

    /// Writes a 32-bit LSB length header followed by `data`, i.e. the
    /// length-prefixed container format used by app/file ID listings.
    pub fn push_length_prefixed(&mut self, data: &[u8]) {
        self.push_u32(data.len() as u32, Endianness::Little);
        self.push_bytes(data);
    }
}

impl From<Vec<u8>> for BinData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_vec(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_u8_and_bytes() {
        let mut buf = BinData::new();
        buf.push_u8(0x01);
        buf.push_bytes(&[0x02, 0x03]);
        assert_eq!(buf.as_slice(), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn push_u16_both_orders() {
        let mut buf = BinData::new();
        buf.push_u16(0x1234, Endianness::Little);
        buf.push_u16(0x1234, Endianness::Big);
        assert_eq!(buf.as_slice(), &[0x34, 0x12, 0x12, 0x34]);
    }

    #[test]
    fn push_u24_truncates_to_three_bytes() {
        let mut buf = BinData::new();
        buf.push_u24(0x00AABBCC, Endianness::Little);
        assert_eq!(buf.as_slice(), &[0xCC, 0xBB, 0xAA]);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn push_u64_big_endian() {
        let mut buf = BinData::new();
        buf.push_u64(0x0102030405060708, Endianness::Big);
        assert_eq!(
            buf.as_slice(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn push_length_prefixed_writes_lsb_length() {
        let mut buf = BinData::new();
        buf.push_length_prefixed(&[0xAA, 0xBB, 0xCC]);
        assert_eq!(
            buf.as_slice(),
            &[0x03, 0x00, 0x00, 0x00, 0xAA, 0xBB, 0xCC]
        );
    }
}
