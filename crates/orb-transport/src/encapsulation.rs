//! CDR encapsulations
//!
//! An encapsulation is a self-describing octet sequence: the first octet is
//! the byte order (0 big-endian, 1 little-endian) and primitive values are
//! aligned to their natural size relative to the start of the encapsulation.
//! Service context payloads and tagged components are encapsulations.

use crate::error::{OrbError, Result};
use crate::giop_version::GiopVersion;
use bytes::{BufMut, Bytes, BytesMut};

pub const BIG_ENDIAN: u8 = 0;
pub const LITTLE_ENDIAN: u8 = 1;

/// Writer for an encapsulation
#[derive(Debug)]
pub struct EncapsOutput {
    buf: BytesMut,
    little_endian: bool,
    version: GiopVersion,
}

impl EncapsOutput {
    /// Big-endian encapsulation
    pub fn new(version: GiopVersion) -> Self {
        Self::with_byte_order(version, false)
    }

    pub fn with_byte_order(version: GiopVersion, little_endian: bool) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(if little_endian { LITTLE_ENDIAN } else { BIG_ENDIAN });
        Self {
            buf,
            little_endian,
            version,
        }
    }

    pub fn version(&self) -> GiopVersion {
        self.version
    }

    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    fn align(&mut self, boundary: usize) {
        while self.buf.len() % boundary != 0 {
            self.buf.put_u8(0);
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.align(2);
        if self.little_endian {
            self.buf.put_u16_le(value);
        } else {
            self.buf.put_u16(value);
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        self.align(4);
        if self.little_endian {
            self.buf.put_u32_le(value);
        } else {
            self.buf.put_u32(value);
        }
    }

    pub fn write_u64(&mut self, value: u64) {
        self.align(8);
        if self.little_endian {
            self.buf.put_u64_le(value);
        } else {
            self.buf.put_u64(value);
        }
    }

    /// CDR string: length including the terminating NUL, the bytes, NUL.
    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32 + 1);
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
    }

    /// Length-prefixed octet sequence
    pub fn write_octets(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.buf.put_slice(value);
    }

    /// Nest another encapsulation as an octet sequence.
    pub fn write_encapsulation(&mut self, nested: EncapsOutput) {
        let bytes = nested.into_bytes();
        self.write_octets(&bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reader for an encapsulation
#[derive(Debug, Clone)]
pub struct EncapsInput {
    data: Bytes,
    pos: usize,
    little_endian: bool,
    version: GiopVersion,
}

impl EncapsInput {
    /// Consumes the byte order octet.
    pub fn new(data: Bytes, version: GiopVersion) -> Result<Self> {
        let little_endian = match data.first() {
            Some(&BIG_ENDIAN) => false,
            Some(&LITTLE_ENDIAN) => true,
            Some(other) => {
                return Err(OrbError::format(format!(
                    "invalid encapsulation byte order 0x{:02x}",
                    other
                )))
            }
            None => return Err(OrbError::format("empty encapsulation")),
        };
        Ok(Self {
            data,
            pos: 1,
            little_endian,
            version,
        })
    }

    pub fn version(&self) -> GiopVersion {
        self.version
    }

    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn align(&mut self, boundary: usize) -> Result<()> {
        let padding = (boundary - self.pos % boundary) % boundary;
        self.take(padding).map(|_| ())
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if self.remaining() < len {
            return Err(OrbError::format(format!(
                "encapsulation truncated: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..self.pos])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.align(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(OrbError::format(format!("invalid boolean octet {}", other))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let raw = self.take_array::<2>()?;
        Ok(if self.little_endian {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take_array::<4>()?;
        Ok(if self.little_endian {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let raw = self.take_array::<8>()?;
        Ok(if self.little_endian {
            u64::from_le_bytes(raw)
        } else {
            u64::from_be_bytes(raw)
        })
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        if len == 0 {
            return Err(OrbError::format("string length must include the NUL terminator"));
        }
        let raw = self.take(len)?;
        let (text, nul) = raw.split_at(len - 1);
        if nul != [0] {
            return Err(OrbError::format("string is not NUL terminated"));
        }
        String::from_utf8(text.to_vec())
            .map_err(|e| OrbError::format(format!("string is not valid UTF-8: {}", e)))
    }

    pub fn read_octets(&mut self) -> Result<Bytes> {
        let len = self.read_u32()? as usize;
        self.take(len)?;
        Ok(self.data.slice(self.pos - len..self.pos))
    }

    pub fn read_encapsulation(&mut self) -> Result<EncapsInput> {
        let nested = self.read_octets()?;
        EncapsInput::new(nested, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_is_relative_to_start() {
        let mut out = EncapsOutput::new(GiopVersion::V1_2);
        out.write_u8(7);
        out.write_u32(0x0102_0304);
        let bytes = out.into_bytes();
        // byte order, octet, 2 bytes padding, then the long
        assert_eq!(&bytes[..], &[0, 7, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_little_endian_encapsulation() {
        let mut out = EncapsOutput::with_byte_order(GiopVersion::V1_2, true);
        out.write_u32(0x0A0B_0C0D);
        out.write_u64(u64::MAX - 1);
        out.write_string("codebase");
        out.write_bool(true);
        let mut input = EncapsInput::new(out.into_bytes(), GiopVersion::V1_2).unwrap();
        assert!(input.is_little_endian());
        assert_eq!(input.read_u32().unwrap(), 0x0A0B_0C0D);
        assert_eq!(input.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(input.read_string().unwrap(), "codebase");
        assert!(input.read_bool().unwrap());
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn test_nested_encapsulation() {
        let mut inner = EncapsOutput::new(GiopVersion::V1_2);
        inner.write_u16(9);
        let mut outer = EncapsOutput::new(GiopVersion::V1_2);
        outer.write_string("x");
        outer.write_encapsulation(inner);

        let mut input = EncapsInput::new(outer.into_bytes(), GiopVersion::V1_2).unwrap();
        assert_eq!(input.read_string().unwrap(), "x");
        let mut nested = input.read_encapsulation().unwrap();
        assert_eq!(nested.read_u16().unwrap(), 9);
    }

    #[test]
    fn test_truncated_input_is_a_format_error() {
        let mut input = EncapsInput::new(Bytes::from_static(&[0, 0, 0, 0, 1]), GiopVersion::V1_2).unwrap();
        assert!(input.read_u32().is_err());

        assert!(EncapsInput::new(Bytes::new(), GiopVersion::V1_2).is_err());
        assert!(EncapsInput::new(Bytes::from_static(&[2]), GiopVersion::V1_2).is_err());

        let mut input = EncapsInput::new(
            Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 9, b'a']),
            GiopVersion::V1_2,
        )
        .unwrap();
        assert!(input.read_string().is_err());
    }
}
