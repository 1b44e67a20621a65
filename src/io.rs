use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

use bytes::{Buf, BufMut, BytesMut};

use crate::{
    error::StratumError,
    types::StratumResult,
};

/// A device file opened by the raw disk manager. All I/O is
/// page-granular and positional; the inner file handle is shared
/// between threads behind a mutex.
pub struct DeviceFile {
    file: Mutex<File>,
}

impl DeviceFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StratumError> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn get_file(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap()
    }

    /// Read `buf.len()` bytes starting at byte `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> StratumResult {
        let mut file = self.get_file();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write `buf` starting at byte `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> StratumResult {
        let mut file = self.get_file();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    pub fn set_len(&self, len: u64) -> StratumResult {
        self.get_file().set_len(len)?;
        Ok(())
    }

    pub fn sync(&self) -> StratumResult {
        self.get_file().sync_all()?;
        Ok(())
    }
}

pub trait Encodeable {
    fn encode_to(&self, writer: &mut StratumWriter);
}

pub trait Decodeable: Sized {
    fn decode_from(reader: &mut StratumReader<'_>) -> Self;
}

/// Cursor over an on-disk byte region. All multi-byte fields are
/// little-endian.
pub struct StratumReader<'a> {
    buf: &'a [u8],
}

impl<'a> StratumReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn read<T: Decodeable>(&mut self) -> T {
        T::decode_from(self)
    }

    pub fn read_u8(&mut self) -> u8 {
        self.buf.get_u8()
    }

    pub fn read_u16(&mut self) -> u16 {
        self.buf.get_u16_le()
    }

    pub fn read_i16(&mut self) -> i16 {
        self.buf.get_i16_le()
    }

    pub fn read_u32(&mut self) -> u32 {
        self.buf.get_u32_le()
    }

    pub fn read_i32(&mut self) -> i32 {
        self.buf.get_i32_le()
    }

    pub fn read_u64(&mut self) -> u64 {
        self.buf.get_u64_le()
    }

    pub fn read_i64(&mut self) -> i64 {
        self.buf.get_i64_le()
    }

    pub fn read_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        self.buf.copy_to_slice(&mut out);
        out
    }

    pub fn skip(&mut self, n: usize) {
        self.buf.advance(n);
    }
}

/// Growable little-endian byte sink, the encode half of
/// [`StratumReader`].
pub struct StratumWriter {
    buf: BytesMut,
}

impl StratumWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        obj.encode_to(self);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn to_padded_bytes(&self, size: usize) -> Vec<u8> {
        let mut buf = self.buf.to_vec();

        assert!(
            buf.len() <= size,
            "buffer size is larger than the given size: {} > {}",
            buf.len(),
            size
        );

        buf.resize(size, 0);
        buf
    }
}

macro_rules! impl_serialization {
    (for $($t:ty: $r:ident / $w:ident),+) => {
        $(
            impl Encodeable for $t {
                fn encode_to(&self, writer: &mut StratumWriter) {
                    writer.$w(*self);
                }
            }

            impl Decodeable for $t {
                fn decode_from(reader: &mut StratumReader<'_>) -> Self {
                    reader.$r()
                }
            }
        )*
    }
}

impl_serialization!(for
    u8: read_u8 / write_u8,
    u16: read_u16 / write_u16,
    i16: read_i16 / write_i16,
    u32: read_u32 / write_u32,
    i32: read_i32 / write_i32,
    u64: read_u64 / write_u64,
    i64: read_i64 / write_i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut w = StratumWriter::new();
        w.write_u16(0xBEEF);
        w.write_i16(-7);
        w.write_u32(123456);
        w.write_bytes(b"abc");

        let bytes = w.to_padded_bytes(16);
        assert_eq!(bytes.len(), 16);

        let mut r = StratumReader::new(&bytes);
        assert_eq!(r.read_u16(), 0xBEEF);
        assert_eq!(r.read_i16(), -7);
        assert_eq!(r.read_u32(), 123456);
        assert_eq!(r.read_bytes(3), b"abc".to_vec());
    }
}
