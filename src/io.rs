use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::Path,
};

use bit_vec::BitVec;

use crate::{error::SmallError, types::SmallResult};

/// Thin wrapper around a positioned file, used for both the write-ahead
/// log and the page files. All multi-byte integers are little-endian.
pub struct SmallFile {
    file: File,
}

impl SmallFile {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .open(file_path)
            .unwrap();

        Self { file }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) -> SmallResult {
        self.file
            .write_all(&obj.encode())
            .or(Err(SmallError::new("io error")))
    }

    pub fn read<T: Decodeable>(&mut self) -> Result<T, SmallError> {
        Ok(T::decode_from(&mut self.file))
    }

    pub fn get_size(&self) -> Result<u64, SmallError> {
        let metadata = self.file.metadata().or(Err(SmallError::new("io error")))?;
        Ok(metadata.len())
    }

    pub fn get_current_position(&mut self) -> Result<u64, SmallError> {
        self.file
            .seek(SeekFrom::Current(0))
            .or(Err(SmallError::new("io error")))
    }

    pub fn set_len(&self, len: u64) -> SmallResult {
        self.file.set_len(len).or(Err(SmallError::new("io error")))
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, SmallError> {
        self.file.seek(pos).or(Err(SmallError::new("io error")))
    }

    pub fn flush(&mut self) -> SmallResult {
        self.file.flush().or(Err(SmallError::new("io error")))
    }

    /// Positioned read, independent of the file's running seek offset.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, SmallError> {
        self.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact(&mut buf)
            .or(Err(SmallError::new("io error")))?;
        Ok(buf)
    }

    /// Positioned write, the way the buffer pool writes a page back to
    /// its home location (never appends).
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> SmallResult {
        self.seek(SeekFrom::Start(offset))?;
        self.file
            .write_all(data)
            .or(Err(SmallError::new("io error")))
    }

    pub fn sync_all(&self) -> SmallResult {
        self.file.sync_all().or(Err(SmallError::new("io error")))
    }
}

pub fn read_into<T: Decodeable, R: Read>(reader: &mut R) -> T {
    T::decode_from(reader)
}

pub fn read_exact<R: Read>(reader: &mut R, bytes_count: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .unwrap_or_else(|_| panic!("io error, expect {} bytes", bytes_count));
    buffer
}

pub struct SmallWriter {
    buf: Vec<u8>,
}

impl SmallWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn to_padded_bytes(&self, size: usize) -> Vec<u8> {
        let mut buf = self.buf.clone();
        if buf.len() > size {
            panic!(
                "buffer size is larger than the given size: {} > {}",
                buf.len(),
                size
            );
        }
        buf.resize(size, 0);
        buf
    }
}

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable {
    fn decode_from<R: Read>(reader: &mut R) -> Self;
}

/// # Format
///
/// - 2 bytes: bytes size (range: 0 - 65535) (65535 * 8 = 524280 bits)
/// - n bytes: bit vector
impl Encodeable for BitVec {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let payload = self.to_bytes();
        let len = payload.len() as u16;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        buf
    }
}

impl Decodeable for BitVec {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let size = u16::from_le_bytes(read_exact(reader, 2).try_into().unwrap());
        let buf = read_exact(reader, size as usize);
        BitVec::from_bytes(&buf)
    }
}

impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        u8::decode_from(reader) == 1
    }
}

impl Encodeable for &[u8] {
    fn encode(&self) -> Vec<u8> {
        self.to_vec()
    }
}

/// A byte blob, prefixed with its length as a u32. This is what every
/// log record uses to carry a page image or a pending-record body,
/// since those routinely exceed 255 bytes (the old u8-length encoding
/// silently truncated anything larger).
impl Encodeable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(4 + self.len());
        let len = self.len() as u32;
        buffer.extend_from_slice(&len.to_le_bytes());
        buffer.extend_from_slice(self);
        buffer
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let len = u32::from_le_bytes(read_exact(reader, 4).try_into().unwrap());
        read_exact(reader, len as usize)
    }
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: Read>(reader: &mut R) -> Self {
                    let bytes = read_exact(reader, size_of::<Self>());
                    Self::from_le_bytes(bytes.try_into().unwrap())
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, isize, usize, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_vec_u8_round_trip_large() {
        let payload: Vec<u8> = (0..5000).map(|i| (i % 256) as u8).collect();
        let encoded = payload.encode();
        let mut cursor = Cursor::new(encoded);
        let decoded = Vec::<u8>::decode_from(&mut cursor);
        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_integers_round_trip() {
        let mut w = SmallWriter::new();
        w.write(&42u32);
        w.write(&7u64);
        let bytes = w.to_bytes();
        let mut cursor = Cursor::new(bytes);
        assert_eq!(u32::decode_from(&mut cursor), 42u32);
        assert_eq!(u64::decode_from(&mut cursor), 7u64);
    }
}
