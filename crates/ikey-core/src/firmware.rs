//! Firmware images: loading, validation and summaries.
//!
//! Images are supplied either as the binary record stream the loader consumes
//! or as Intel HEX text, whose lines carry the same length/address/type
//! layout plus a checksum.

use std::fmt;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::info;

use crate::protocol::{MemoryRegion, RecordError, Records};

// Intel HEX record types.
const HEX_DATA: u8 = 0x00;
const HEX_EOF: u8 = 0x01;
const HEX_EXT_SEGMENT: u8 = 0x02;
const HEX_START_SEGMENT: u8 = 0x03;
const HEX_EXT_LINEAR: u8 = 0x04;
const HEX_START_LINEAR: u8 = 0x05;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Malformed record stream: {0}")]
    Record(#[from] RecordError),
    #[error("Intel HEX line {line}: {message}")]
    Hex { line: usize, message: String },
    #[error("Intel HEX line {line}: checksum mismatch (expected 0x{expected:02X}, got 0x{actual:02X})")]
    HexChecksum {
        line: usize,
        expected: u8,
        actual: u8,
    },
    #[error("Image {0} is empty")]
    Empty(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A validated firmware record stream.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    name: String,
    data: Vec<u8>,
    payload_len: usize,
}

impl FirmwareImage {
    /// Wrap a binary record stream, checking every data record is complete.
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Result<Self, FirmwareError> {
        let mut payload_len = 0;
        for record in Records::new(&data) {
            payload_len += record?.payload.len();
        }
        Ok(Self {
            name: name.into(),
            data,
            payload_len,
        })
    }

    /// Convert Intel HEX text into a record stream.
    ///
    /// Data records are copied with their checksum dropped and the EOF
    /// record becomes the terminator. Extended address records must select
    /// the first 64 KiB; start address records are ignored.
    pub fn from_intel_hex(name: impl Into<String>, text: &str) -> Result<Self, FirmwareError> {
        let mut data = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let hex = line.strip_prefix(':').ok_or_else(|| FirmwareError::Hex {
                line: line_no,
                message: "missing ':' start code".into(),
            })?;
            let bytes = decode_hex(hex).ok_or_else(|| FirmwareError::Hex {
                line: line_no,
                message: "invalid hex digits".into(),
            })?;
            // length, address (2), type, checksum
            if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
                return Err(FirmwareError::Hex {
                    line: line_no,
                    message: format!("length field does not match {} data bytes", bytes.len()),
                });
            }

            let (body, checksum) = bytes.split_at(bytes.len() - 1);
            let expected = body
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b))
                .wrapping_neg();
            if expected != checksum[0] {
                return Err(FirmwareError::HexChecksum {
                    line: line_no,
                    expected,
                    actual: checksum[0],
                });
            }

            match body[3] {
                HEX_DATA => data.extend_from_slice(body),
                HEX_EOF => {
                    data.extend_from_slice(body);
                    break;
                }
                HEX_EXT_SEGMENT | HEX_EXT_LINEAR => {
                    if body[0] != 2 {
                        return Err(FirmwareError::Hex {
                            line: line_no,
                            message: format!("extended address record with {} data bytes", body[0]),
                        });
                    }
                    let upper = BigEndian::read_u16(&body[4..6]);
                    if upper != 0 {
                        return Err(FirmwareError::Hex {
                            line: line_no,
                            message: format!(
                                "extended address 0x{:04X} is outside the 16-bit address space",
                                upper
                            ),
                        });
                    }
                }
                HEX_START_SEGMENT | HEX_START_LINEAR => {}
                other => {
                    return Err(FirmwareError::Hex {
                        line: line_no,
                        message: format!("unknown record type 0x{:02X}", other),
                    });
                }
            }
        }

        Self::from_bytes(name, data)
    }

    /// Load an image from disk, detecting Intel HEX by its leading ':'.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FirmwareError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let raw = std::fs::read(path)?;
        if raw.is_empty() {
            return Err(FirmwareError::Empty(name));
        }

        let image = if raw.first() == Some(&b':') {
            let text = String::from_utf8_lossy(&raw);
            Self::from_intel_hex(name, &text)?
        } else {
            Self::from_bytes(name, raw)?
        };

        info!(
            image = %image.name,
            bytes = image.data.len(),
            payload = image.payload_len,
            "Loaded firmware image"
        );
        Ok(image)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Sum of all data record payload lengths.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn summary(&self) -> ImageSummary {
        let mut summary = ImageSummary::default();
        let mut records = Records::new(&self.data);
        for record in records.by_ref().flatten() {
            match record.region() {
                MemoryRegion::Internal => {
                    summary.internal_records += 1;
                    summary.internal_bytes += record.payload.len();
                }
                MemoryRegion::External => {
                    summary.external_records += 1;
                    summary.external_bytes += record.payload.len();
                }
            }
            summary.lowest_address = Some(
                summary
                    .lowest_address
                    .map_or(record.address, |a| a.min(record.address)),
            );
            let last = record
                .address
                .saturating_add(record.payload.len().saturating_sub(1) as u16);
            summary.highest_address =
                Some(summary.highest_address.map_or(last, |a| a.max(last)));
        }
        summary.terminated = records.terminated();
        summary.stream_len = records.offset();
        summary
    }
}

/// Record statistics of an image.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub internal_records: usize,
    pub internal_bytes: usize,
    pub external_records: usize,
    pub external_bytes: usize,
    pub lowest_address: Option<u16>,
    pub highest_address: Option<u16>,
    /// Whether the stream ends with a terminator record.
    pub terminated: bool,
    /// Bytes consumed up to the terminator (or the whole stream).
    pub stream_len: usize,
}

impl fmt::Display for ImageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "internal: {} records, {} bytes",
            self.internal_records, self.internal_bytes
        )?;
        writeln!(
            f,
            "external: {} records, {} bytes",
            self.external_records, self.external_bytes
        )?;
        if let (Some(lo), Some(hi)) = (self.lowest_address, self.highest_address) {
            writeln!(f, "range:    0x{:04X}..=0x{:04X}", lo, hi)?;
        }
        write!(
            f,
            "stream:   {} bytes, {}",
            self.stream_len,
            if self.terminated {
                "terminated"
            } else {
                "no terminator"
            }
        )
    }
}

/// The two images the bring-up sequence loads.
#[derive(Debug, Clone)]
pub struct FirmwareSet {
    /// Loader image; services external RAM writes.
    pub loader: FirmwareImage,
    /// Main firmware image.
    pub firmware: FirmwareImage,
}

impl FirmwareSet {
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        loader: P,
        firmware: Q,
    ) -> Result<Self, FirmwareError> {
        Ok(Self {
            loader: FirmwareImage::load(loader)?,
            firmware: FirmwareImage::load(firmware)?,
        })
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}
