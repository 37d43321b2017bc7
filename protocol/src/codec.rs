//! Byte-level wire codec
//!
//! Reading goes through [`BinaryReader`], a cursor over an immutable [`Bytes`]
//! buffer that can peek without consuming. Writing goes through the
//! [`BinaryWriteExt`] extension trait, available on every [`BufMut`] (in
//! practice a `BytesMut`, whose length is the write cursor).
//!
//! Header fields of the transport are big-endian, payload fields are
//! little-endian, and sequence numbers and split ids are 24-bit little-endian
//! "triads".

use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// Offline message identifier carried by every unconnected packet
pub const MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

/// Largest value a triad can hold
pub const TRIAD_MAX: u32 = 0x00ff_ffff;

const ADDRESS_FAMILY_V4: u8 = 4;
const ADDRESS_FAMILY_V6: u8 = 6;
const SOCKADDR_IN6_FAMILY: u16 = 23;

/// Advances a 24-bit counter, wrapping from `0xffffff` to zero
pub fn next_triad(value: u32) -> u32 {
    value.wrapping_add(1) & TRIAD_MAX
}

macro_rules! read_impl {
    ($name:ident, $ty:ty, $getter:ident) => {
        pub fn $name(&mut self) -> Result<$ty, CodecError> {
            self.ensure(std::mem::size_of::<$ty>())?;
            let mut slice = &self.buf[self.pos..];
            let value = slice.$getter();
            self.pos += std::mem::size_of::<$ty>();
            Ok(value)
        }
    };
}

macro_rules! read_varint_impl {
    ($name:ident, $ty:ty, $getter:ident) => {
        pub fn $name(&mut self) -> Result<$ty, CodecError> {
            let mut slice = &self.buf[self.pos..];
            let before = slice.len();
            let value = slice
                .$getter()
                .map_err(|e| CodecError::MalformedVarInt(format!("{:?}", e)))?;
            self.pos += before - slice.len();
            Ok(value)
        }
    };
}

/// Read cursor over a received buffer
#[derive(Debug, Clone)]
pub struct BinaryReader {
    buf: Bytes,
    pos: usize,
}

impl BinaryReader {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self {
            buf: buf.into(),
            pos: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True once every byte has been consumed
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn ensure(&self, needed: usize) -> Result<(), CodecError> {
        if self.remaining() < needed {
            return Err(CodecError::UnexpectedEof {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Returns the next byte without advancing the cursor
    pub fn peek_u8(&self) -> Result<u8, CodecError> {
        self.ensure(1)?;
        Ok(self.buf[self.pos])
    }

    pub fn skip(&mut self, count: usize) -> Result<(), CodecError> {
        self.ensure(count)?;
        self.pos += count;
        Ok(())
    }

    /// Appends bytes after the current end without moving the read cursor
    pub fn append(&mut self, more: &[u8]) {
        let mut joined = BytesMut::with_capacity(self.buf.len() + more.len());
        joined.put_slice(&self.buf);
        joined.put_slice(more);
        self.buf = joined.freeze();
    }

    read_impl!(read_u8, u8, get_u8);
    read_impl!(read_u16_be, u16, get_u16);
    read_impl!(read_u16_le, u16, get_u16_le);
    read_impl!(read_i16_le, i16, get_i16_le);
    read_impl!(read_u32_be, u32, get_u32);
    read_impl!(read_i32_be, i32, get_i32);
    read_impl!(read_i32_le, i32, get_i32_le);
    read_impl!(read_u32_le, u32, get_u32_le);
    read_impl!(read_i64_be, i64, get_i64);
    read_impl!(read_u64_be, u64, get_u64);
    read_impl!(read_i64_le, i64, get_i64_le);
    read_impl!(read_f32_be, f32, get_f32);
    read_impl!(read_f32_le, f32, get_f32_le);
    read_impl!(read_f64_le, f64, get_f64_le);

    read_varint_impl!(read_var_u32, u32, get_u32_varint);
    read_varint_impl!(read_var_i32, i32, get_i32_varint);
    read_varint_impl!(read_var_u64, u64, get_u64_varint);
    read_varint_impl!(read_var_i64, i64, get_i64_varint);

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a 24-bit little-endian counter
    pub fn read_triad(&mut self) -> Result<u32, CodecError> {
        self.ensure(3)?;
        let b = &self.buf[self.pos..self.pos + 3];
        let value = u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16;
        self.pos += 3;
        Ok(value)
    }

    /// Zero-copy slice of the next `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, CodecError> {
        self.ensure(len)?;
        let out = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    /// Everything from the cursor to the end of the buffer
    pub fn read_remaining(&mut self) -> Bytes {
        let out = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        out
    }

    /// Byte string prefixed with an unsigned varint length
    pub fn read_byte_string(&mut self) -> Result<Bytes, CodecError> {
        let len = self.read_var_u32()? as usize;
        self.read_bytes(len)
    }

    /// UTF-8 string prefixed with an unsigned varint length
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let raw = self.read_byte_string()?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    /// UTF-8 string prefixed with a big-endian u16 length, as used offline
    pub fn read_short_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16_be()? as usize;
        let raw = self.read_bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_magic(&mut self) -> Result<(), CodecError> {
        let raw = self.read_bytes(MAGIC.len())?;
        if raw[..] != MAGIC {
            return Err(CodecError::InvalidMagic);
        }
        Ok(())
    }

    /// Reads an address; IPv4 octets are stored bitwise-inverted
    pub fn read_address(&mut self) -> Result<SocketAddr, CodecError> {
        match self.read_u8()? {
            ADDRESS_FAMILY_V4 => {
                let mut octets = [0u8; 4];
                for octet in octets.iter_mut() {
                    *octet = !self.read_u8()?;
                }
                let port = self.read_u16_be()?;
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            ADDRESS_FAMILY_V6 => {
                self.read_u16_le()?;
                let port = self.read_u16_be()?;
                let flow_info = self.read_u32_be()?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.read_bytes(16)?);
                let scope_id = self.read_u32_be()?;
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flow_info,
                    scope_id,
                )))
            }
            other => Err(CodecError::UnsupportedAddressFamily(other)),
        }
    }
}

/// Writers for the framing primitives on top of [`BufMut`]
pub trait BinaryWriteExt: BufMut + VarIntSupportMut {
    fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    /// Writes the low 24 bits of `value`, little-endian
    fn put_triad(&mut self, value: u32) {
        let value = value & TRIAD_MAX;
        self.put_u8(value as u8);
        self.put_u8((value >> 8) as u8);
        self.put_u8((value >> 16) as u8);
    }

    fn put_var_u32(&mut self, value: u32) {
        self.put_u32_varint(value);
    }

    fn put_var_i32(&mut self, value: i32) {
        self.put_i32_varint(value);
    }

    fn put_var_u64(&mut self, value: u64) {
        self.put_u64_varint(value);
    }

    fn put_var_i64(&mut self, value: i64) {
        self.put_i64_varint(value);
    }

    fn put_byte_string(&mut self, value: &[u8]) {
        self.put_var_u32(value.len() as u32);
        self.put_slice(value);
    }

    fn put_string(&mut self, value: &str) {
        self.put_byte_string(value.as_bytes());
    }

    fn put_short_string(&mut self, value: &str) {
        let len = value.len().min(u16::MAX as usize);
        self.put_u16(len as u16);
        self.put_slice(&value.as_bytes()[..len]);
    }

    fn put_magic(&mut self) {
        self.put_slice(&MAGIC);
    }

    fn put_address(&mut self, addr: &SocketAddr) {
        match addr {
            SocketAddr::V4(v4) => {
                self.put_u8(ADDRESS_FAMILY_V4);
                for octet in v4.ip().octets() {
                    self.put_u8(!octet);
                }
                self.put_u16(v4.port());
            }
            SocketAddr::V6(v6) => {
                self.put_u8(ADDRESS_FAMILY_V6);
                self.put_u16_le(SOCKADDR_IN6_FAMILY);
                self.put_u16(v6.port());
                self.put_u32(v6.flowinfo());
                self.put_slice(&v6.ip().octets());
                self.put_u32(v6.scope_id());
            }
        }
    }
}

impl<T: BufMut> BinaryWriteExt for T {}

/// Splits `buf` into ordered chunks of at most `max` bytes; the last chunk holds the remainder
pub fn split_chunks(buf: &Bytes, max: usize) -> Vec<Bytes> {
    if max == 0 || buf.is_empty() {
        return Vec::new();
    }
    (0..buf.len())
        .step_by(max)
        .map(|start| buf.slice(start..(start + max).min(buf.len())))
        .collect()
}

/// Concatenates parts in order into one contiguous buffer
pub fn concat<'a>(parts: impl IntoIterator<Item = &'a Bytes>) -> Bytes {
    let mut out = BytesMut::new();
    for part in parts {
        out.put_slice(part);
    }
    out.freeze()
}

/// Encoded length of an unsigned varint
pub fn var_u32_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn reader(buf: BytesMut) -> BinaryReader {
        BinaryReader::new(buf.freeze())
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut r = BinaryReader::new(vec![0x84, 0x01]);
        assert_eq!(r.peek_u8().unwrap(), 0x84);
        assert_eq!(r.position(), 0);
        assert_eq!(r.read_u8().unwrap(), 0x84);
        assert_eq!(r.peek_u8().unwrap(), 0x01);
    }

    #[test]
    fn test_fixed_width_endianness() {
        let mut w = BytesMut::new();
        w.put_u16(0x1234);
        w.put_u16_le(0x1234);
        w.put_i32_le(-2);
        w.put_i64(-3);
        assert_eq!(&w[..4], &[0x12, 0x34, 0x34, 0x12]);

        let mut r = reader(w);
        assert_eq!(r.read_u16_be().unwrap(), 0x1234);
        assert_eq!(r.read_u16_le().unwrap(), 0x1234);
        assert_eq!(r.read_i32_le().unwrap(), -2);
        assert_eq!(r.read_i64_be().unwrap(), -3);
        assert!(r.is_exhausted());
    }

    #[test]
    fn test_floats_little_endian() {
        let mut w = BytesMut::new();
        w.put_f32_le(1.5);
        w.put_f64_le(-1234.25);
        w.put_f32_le(std::f32::consts::PI);

        let mut r = reader(w);
        assert_approx_eq!(r.read_f32_le().unwrap(), 1.5);
        assert_approx_eq!(r.read_f64_le().unwrap(), -1234.25);
        assert_approx_eq!(r.read_f32_le().unwrap(), std::f32::consts::PI);
    }

    #[test]
    fn test_varint_boundaries() {
        let unsigned = [0u32, 1, 127, 128, 16_383, 16_384, u32::MAX];
        let signed = [0i32, -1, 1, i32::MIN, i32::MAX];
        let unsigned_long = [0u64, u64::from(u32::MAX) + 1, u64::MAX];
        let signed_long = [0i64, -1, i64::MIN, i64::MAX];

        let mut w = BytesMut::new();
        unsigned.iter().for_each(|v| w.put_var_u32(*v));
        signed.iter().for_each(|v| w.put_var_i32(*v));
        unsigned_long.iter().for_each(|v| w.put_var_u64(*v));
        signed_long.iter().for_each(|v| w.put_var_i64(*v));

        let mut r = reader(w);
        for v in unsigned {
            assert_eq!(r.read_var_u32().unwrap(), v);
        }
        for v in signed {
            assert_eq!(r.read_var_i32().unwrap(), v);
        }
        for v in unsigned_long {
            assert_eq!(r.read_var_u64().unwrap(), v);
        }
        for v in signed_long {
            assert_eq!(r.read_var_i64().unwrap(), v);
        }
        assert!(r.is_exhausted());
    }

    #[test]
    fn test_varint_seven_bits_per_byte() {
        let mut w = BytesMut::new();
        w.put_var_u32(300);
        assert_eq!(&w[..], &[0xac, 0x02]);
        assert_eq!(var_u32_len(300), 2);
        assert_eq!(var_u32_len(u32::MAX), 5);
    }

    #[test]
    fn test_truncated_varint_is_error() {
        let mut r = BinaryReader::new(vec![0x80, 0x80]);
        assert!(r.read_var_u32().is_err());
    }

    #[test]
    fn test_triad_wraps() {
        assert_eq!(next_triad(TRIAD_MAX), 0);
        assert_eq!(next_triad(41), 42);

        let mut w = BytesMut::new();
        w.put_triad(0x00ab_cdef);
        w.put_triad(TRIAD_MAX + 5);
        assert_eq!(&w[..3], &[0xef, 0xcd, 0xab]);

        let mut r = reader(w);
        assert_eq!(r.read_triad().unwrap(), 0x00ab_cdef);
        assert_eq!(r.read_triad().unwrap(), 4);
    }

    #[test]
    fn test_ipv4_address_is_inverted() {
        let addr: SocketAddr = "192.168.1.20:19132".parse().unwrap();
        let mut w = BytesMut::new();
        w.put_address(&addr);
        assert_eq!(&w[..5], &[4, !192u8, !168u8, !1u8, !20u8]);

        let mut r = reader(w);
        assert_eq!(r.read_address().unwrap(), addr);
    }

    #[test]
    fn test_ipv6_address() {
        let addr: SocketAddr = "[fe80::1]:19133".parse().unwrap();
        let mut w = BytesMut::new();
        w.put_address(&addr);
        assert_eq!(w.len(), 29);
        assert_eq!(reader(w).read_address().unwrap(), addr);
    }

    #[test]
    fn test_unknown_address_family() {
        let mut r = BinaryReader::new(vec![9, 0, 0]);
        assert_eq!(
            r.read_address(),
            Err(CodecError::UnsupportedAddressFamily(9))
        );
    }

    #[test]
    fn test_strings() {
        let mut w = BytesMut::new();
        w.put_string("lobby");
        w.put_short_string("MCPE;motd");
        w.put_byte_string(&[1, 2, 3]);
        w.put_bool(true);

        let mut r = reader(w);
        assert_eq!(r.read_string().unwrap(), "lobby");
        assert_eq!(r.read_short_string().unwrap(), "MCPE;motd");
        assert_eq!(&r.read_byte_string().unwrap()[..], &[1, 2, 3]);
        assert!(r.read_bool().unwrap());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut w = BytesMut::new();
        w.put_byte_string(&[0xff, 0xfe]);
        assert_eq!(reader(w).read_string(), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_magic() {
        let mut w = BytesMut::new();
        w.put_magic();
        assert!(reader(w).read_magic().is_ok());

        let mut r = BinaryReader::new(vec![0u8; 16]);
        assert_eq!(r.read_magic(), Err(CodecError::InvalidMagic));
    }

    #[test]
    fn test_underflow_reports_sizes() {
        let mut r = BinaryReader::new(vec![1, 2]);
        assert_eq!(
            r.read_u32_be(),
            Err(CodecError::UnexpectedEof {
                needed: 4,
                remaining: 2
            })
        );
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn test_split_chunks() {
        let buf = Bytes::from((0..10u8).collect::<Vec<_>>());
        let chunks = split_chunks(&buf, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[2][..], &[8, 9]);
        assert_eq!(concat(&chunks), buf);

        assert_eq!(split_chunks(&buf, 10).len(), 1);
        assert!(split_chunks(&Bytes::new(), 4).is_empty());
    }

    #[test]
    fn test_append_keeps_cursor() {
        let mut r = BinaryReader::new(vec![1, 2]);
        r.read_u8().unwrap();
        r.append(&[3, 4]);
        assert_eq!(r.position(), 1);
        assert_eq!(&r.read_remaining()[..], &[2, 3, 4]);
    }
}
