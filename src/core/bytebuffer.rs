//! # Byte Buffer
//!
//! Cursor-based binary writer and reader used for every packet payload.
//!
//! Counts and lengths are written as unsigned LEB128 varints, never as fixed
//! 4 or 8 byte integers. Strings and byte arrays carry a varint length prefix.
//! Optional-field presence bits are packed into [`Flags`], one bit per field.
//!
//! ## Wire Format
//! ```text
//! uleb128   : 7 bits per byte, high bit = continuation
//! bytes     : [uleb128 length] [length bytes]
//! string    : bytes holding UTF-8
//! flags(n)  : ceil(n / 8) bytes, bit i in byte i / 8 (little endian)
//! ```
//!
//! The reader never truncates silently: asking for more bytes than remain is
//! a [`ProtocolError::DecodeError`], and [`ByteReader::finish`] rejects
//! unconsumed trailing bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{constants, ProtocolError, Result};

/// Default initial capacity for writers
const DEFAULT_CAPACITY: usize = 64;

/// Maximum number of bits in a flag set
pub const MAX_FLAGS: u8 = 64;

/// Compact set of up to 64 booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    value: u64,
    length: u8,
}

impl Flags {
    /// Create an empty flag set holding `length` bits.
    pub fn new(length: u8) -> Result<Self> {
        if length > MAX_FLAGS {
            return Err(ProtocolError::SerializeError(
                constants::ERR_FLAGS_TOO_LONG.into(),
            ));
        }
        Ok(Self { value: 0, length })
    }

    /// Empty flag set for a fixed layout, clamped to [`MAX_FLAGS`] bits.
    pub const fn fixed(length: u8) -> Self {
        let length = if length > MAX_FLAGS { MAX_FLAGS } else { length };
        Self { value: 0, length }
    }

    /// Build a flag set from booleans, bit `i` taken from `bits[i]`.
    pub fn from_bits(bits: &[bool]) -> Result<Self> {
        let length = u8::try_from(bits.len())
            .map_err(|_| ProtocolError::SerializeError(constants::ERR_FLAGS_TOO_LONG.into()))?;
        let mut flags = Self::new(length)?;
        for (position, bit) in bits.iter().enumerate() {
            flags.set(position as u8, *bit);
        }
        Ok(flags)
    }

    pub fn len(&self) -> u8 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn get(&self, position: u8) -> bool {
        position < self.length && self.value & (1u64 << position) != 0
    }

    pub fn set(&mut self, position: u8, value: bool) {
        if position >= self.length {
            return;
        }
        if value {
            self.value |= 1u64 << position;
        } else {
            self.value &= !(1u64 << position);
        }
    }

    /// Run `f` only when the bit at `position` is set.
    pub fn if_set<T>(&self, position: u8, f: impl FnOnce() -> T) -> Option<T> {
        self.get(position).then(f)
    }

    /// Encoded size in bytes.
    pub fn byte_len(&self) -> usize {
        (self.length as usize).div_ceil(8)
    }
}

/// Growable binary writer. Writing never fails.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: BytesMut,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Raw bytes without a length prefix.
    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    pub fn write_uleb128(&mut self, mut value: u64) -> &mut Self {
        while value > 0x7f {
            self.buf.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
        self
    }

    /// Length-prefixed byte array.
    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.write_uleb128(data.len() as u64);
        self.buf.put_slice(data);
        self
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_bytes(value.as_bytes())
    }

    pub fn write_flags(&mut self, flags: &Flags) -> &mut Self {
        let bytes = flags.value.to_le_bytes();
        self.buf.put_slice(&bytes[..flags.byte_len()]);
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over a borrowed byte slice.
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    /// Borrow the next `size` bytes.
    pub fn read(&mut self, size: usize) -> Result<&'a [u8]> {
        if size > self.remaining() {
            return Err(ProtocolError::DecodeError {
                needed: size,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.offset..self.offset + size];
        self.offset += size;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read(N)?);
        Ok(out)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_uleb128(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7f);
            if shift >= 64 || (shift == 63 && bits > 1) {
                return Err(ProtocolError::DeserializeError(
                    constants::ERR_ULEB128_OVERFLOW.into(),
                ));
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_length(&mut self) -> Result<usize> {
        let length = self.read_uleb128()?;
        usize::try_from(length).map_err(|_| ProtocolError::DecodeError {
            needed: usize::MAX,
            remaining: self.remaining(),
        })
    }

    /// Length-prefixed byte array, borrowed from the input.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let length = self.read_length()?;
        self.read(length)
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| ProtocolError::DeserializeError(format!("invalid UTF-8: {e}")))
    }

    pub fn read_flags(&mut self, length: u8) -> Result<Flags> {
        let mut flags = Flags::new(length).map_err(|_| {
            ProtocolError::DeserializeError(constants::ERR_FLAGS_TOO_LONG.into())
        })?;
        let bytes = self.read(flags.byte_len())?;
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        let mask = if length == MAX_FLAGS {
            u64::MAX
        } else {
            (1u64 << length) - 1
        };
        flags.value = u64::from_le_bytes(raw) & mask;
        Ok(flags)
    }

    /// Finish reading; unconsumed bytes are a decoding-contract violation.
    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}
