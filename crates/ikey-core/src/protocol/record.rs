//! Firmware record stream decoding.
//!
//! An image is a flat sequence of records, each a 4-byte big-endian header
//! (`length: u8`, `address: u16`, `record_type: u8`) followed by `length`
//! payload bytes. A non-zero record type ends the stream.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::MAX_INTERNAL_ADDRESS;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("Truncated record header at offset {offset}: {remaining} bytes remain")]
    TruncatedHeader { offset: usize, remaining: usize },
    #[error("Truncated record payload at offset {offset}: need {length}, {remaining} remain")]
    TruncatedPayload {
        offset: usize,
        length: usize,
        remaining: usize,
    },
}

/// Memory region a record is loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegion {
    Internal,
    External,
}

impl MemoryRegion {
    pub fn of(address: u16) -> Self {
        if address <= MAX_INTERNAL_ADDRESS {
            MemoryRegion::Internal
        } else {
            MemoryRegion::External
        }
    }
}

/// Record header (4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub length: u8,
    pub address: u16,
    pub record_type: u8,
}

impl RecordHeader {
    pub const SIZE: usize = 4;
    pub const TYPE_DATA: u8 = 0;

    /// Decode the header at `offset`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, RecordError> {
        let remaining = data.len().saturating_sub(offset);
        if remaining < Self::SIZE {
            return Err(RecordError::TruncatedHeader { offset, remaining });
        }
        let mut cursor = Cursor::new(&data[offset..offset + Self::SIZE]);
        let header = Self {
            length: cursor
                .read_u8()
                .map_err(|_| RecordError::TruncatedHeader { offset, remaining })?,
            address: cursor
                .read_u16::<BigEndian>()
                .map_err(|_| RecordError::TruncatedHeader { offset, remaining })?,
            record_type: cursor
                .read_u8()
                .map_err(|_| RecordError::TruncatedHeader { offset, remaining })?,
        };
        Ok(header)
    }

    pub fn is_data(&self) -> bool {
        self.record_type == Self::TYPE_DATA
    }

    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::of(self.address)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [self.length, 0, 0, self.record_type];
        BigEndian::write_u16(&mut buf[1..3], self.address);
        buf
    }
}

/// Decode one record at `offset`.
///
/// Returns `(length, address, record_type, payload_offset)`.
pub fn parse(data: &[u8], offset: usize) -> Result<(u8, u16, u8, usize), RecordError> {
    let header = RecordHeader::parse(data, offset)?;
    let payload_offset = offset + RecordHeader::SIZE;
    let length = header.length as usize;
    let remaining = data.len() - payload_offset;
    if remaining < length {
        return Err(RecordError::TruncatedPayload {
            offset,
            length,
            remaining,
        });
    }
    Ok((
        header.length,
        header.address,
        header.record_type,
        payload_offset,
    ))
}

/// A decoded data record borrowing its payload from the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub address: u16,
    pub record_type: u8,
    pub payload: &'a [u8],
    /// Offset of the header within the image.
    pub offset: usize,
}

impl<'a> Record<'a> {
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::of(self.address)
    }

    /// Offset of the byte following this record.
    pub fn end(&self) -> usize {
        self.offset + RecordHeader::SIZE + self.payload.len()
    }

    /// Encode a record into `out`.
    ///
    /// # Panics
    ///
    /// If `payload` is longer than 255 bytes; the length field is one byte.
    pub fn encode(address: u16, record_type: u8, payload: &[u8], out: &mut Vec<u8>) {
        let Ok(length) = u8::try_from(payload.len()) else {
            panic!("record payload of {} bytes exceeds 255", payload.len());
        };
        let header = RecordHeader {
            length,
            address,
            record_type,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(payload);
    }
}

/// Iterator over the data records of an image.
///
/// Stops at the first terminator or at the end of the buffer; a malformed
/// record is yielded once as an error and ends iteration.
pub struct Records<'a> {
    data: &'a [u8],
    offset: usize,
    terminated: bool,
    done: bool,
}

impl<'a> Records<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            terminated: false,
            done: false,
        }
    }

    /// Current cursor position.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether iteration stopped on a terminator record.
    pub fn terminated(&self) -> bool {
        self.terminated
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record<'a>, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            return None;
        }

        let header = match RecordHeader::parse(self.data, self.offset) {
            Ok(h) => h,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if !header.is_data() {
            self.terminated = true;
            self.done = true;
            return None;
        }

        match parse(self.data, self.offset) {
            Ok((length, address, record_type, payload_offset)) => {
                let payload = &self.data[payload_offset..payload_offset + length as usize];
                let record = Record {
                    address,
                    record_type,
                    payload,
                    offset: self.offset,
                };
                self.offset = record.end();
                Some(Ok(record))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
