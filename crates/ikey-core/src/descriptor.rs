//! Standard descriptor retrieval for diagnostics.

use std::fmt;

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

use crate::protocol::constants::{
    CONFIG_DESCRIPTOR_BUF, DESC_CONFIGURATION, DESC_DEVICE, DESC_HID_REPORT, DESC_STRING,
    DEVICE_DESCRIPTOR_BUF, HID_REPORT_DESCRIPTOR_SIZES, REQ_GET_DESCRIPTOR, STRING_DESCRIPTOR_BUF,
};
use crate::protocol::ControlSetup;
use crate::transport::{TransportError, UsbTransport};

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Descriptor read failed: {0}")]
    Transport(#[from] TransportError),
    #[error("Descriptor too short: expected {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// Issue GET_DESCRIPTOR sized to `buf` and copy the reply into it.
///
/// Returns the number of bytes the device sent.
pub fn get_descriptor<T: UsbTransport + ?Sized>(
    transport: &T,
    descriptor_type: u8,
    index: u8,
    language_id: u16,
    buf: &mut [u8],
) -> Result<usize, TransportError> {
    let setup = ControlSetup::standard_in(
        REQ_GET_DESCRIPTOR,
        (descriptor_type as u16) << 8 | index as u16,
        language_id,
    );
    let length = buf.len().min(u16::MAX as usize) as u16;
    let data = transport.control_in(setup, length)?;
    let n = data.len().min(buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    debug!(
        descriptor_type = %format!("0x{:02X}", descriptor_type),
        index,
        len = n,
        "Descriptor read"
    );
    Ok(n)
}

/// Decode a string descriptor (bLength, bDescriptorType, UTF-16LE text).
pub fn decode_string(buf: &[u8]) -> String {
    let len = buf.first().map_or(0, |&l| l as usize).min(buf.len());
    if len < 2 {
        return String::new();
    }
    let units: Vec<u16> = buf[2..len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Fields of a standard device descriptor (18 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;

    pub fn parse(data: &[u8]) -> Result<Self, DescriptorError> {
        if data.len() < Self::SIZE {
            return Err(DescriptorError::TooShort {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(&data[2..Self::SIZE]);
        let too_short = |_| DescriptorError::TooShort {
            expected: Self::SIZE,
            actual: data.len(),
        };
        let usb_version = cursor.read_u16::<LittleEndian>().map_err(too_short)?;
        let class = cursor.read_u8().map_err(too_short)?;
        let subclass = cursor.read_u8().map_err(too_short)?;
        let protocol = cursor.read_u8().map_err(too_short)?;
        let max_packet_size0 = cursor.read_u8().map_err(too_short)?;
        let vendor_id = cursor.read_u16::<LittleEndian>().map_err(too_short)?;
        let product_id = cursor.read_u16::<LittleEndian>().map_err(too_short)?;
        let device_version = cursor.read_u16::<LittleEndian>().map_err(too_short)?;
        // iManufacturer, iProduct, iSerialNumber
        cursor.set_position(cursor.position() + 3);
        let num_configurations = cursor.read_u8().map_err(too_short)?;

        Ok(Self {
            usb_version,
            class,
            subclass,
            protocol,
            max_packet_size0,
            vendor_id,
            product_id,
            device_version,
            num_configurations,
        })
    }
}

/// Everything the bring-up sequence reads for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub device: Option<Vec<u8>>,
    pub configuration: Option<Vec<u8>>,
    /// Report descriptors of interfaces 0, 1 and 2.
    pub hid_reports: Vec<Vec<u8>>,
}

impl Diagnostics {
    /// Decoded device descriptor, if one was read.
    pub fn device_descriptor(&self) -> Option<DeviceDescriptor> {
        self.device
            .as_deref()
            .and_then(|d| DeviceDescriptor::parse(d).ok())
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "manufacturer: {}", self.manufacturer.as_deref().unwrap_or("?"))?;
        writeln!(f, "product:      {}", self.product.as_deref().unwrap_or("?"))?;
        if let Some(dev) = self.device_descriptor() {
            writeln!(
                f,
                "device:       {:04X}:{:04X} release {:04X}",
                dev.vendor_id, dev.product_id, dev.device_version
            )?;
        }
        write!(f, "hid reports:  {}", self.hid_reports.len())
    }
}

/// Read one named diagnostic item, with the descriptor bytes trimmed to what arrived.
fn read_item<T: UsbTransport + ?Sized>(
    transport: &T,
    descriptor_type: u8,
    index: u8,
    size: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut buf = vec![0u8; size];
    let n = get_descriptor(transport, descriptor_type, index, 0, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

/// Collect diagnostics.
///
/// Each read is handed to `on_error`; returning `Err` aborts the collection,
/// returning `Ok` skips the item.
pub fn collect_diagnostics<T: UsbTransport + ?Sized>(
    transport: &T,
    mut on_error: impl FnMut(&str, TransportError) -> Result<(), TransportError>,
) -> Result<Diagnostics, TransportError> {
    let mut diag = Diagnostics::default();

    match read_item(transport, DESC_STRING, 1, STRING_DESCRIPTOR_BUF) {
        Ok(buf) => diag.manufacturer = Some(decode_string(&buf)),
        Err(e) => on_error("string 1", e)?,
    }
    match read_item(transport, DESC_STRING, 2, STRING_DESCRIPTOR_BUF) {
        Ok(buf) => diag.product = Some(decode_string(&buf)),
        Err(e) => on_error("string 2", e)?,
    }
    match read_item(transport, DESC_DEVICE, 0, DEVICE_DESCRIPTOR_BUF) {
        Ok(mut buf) => {
            let len = buf.first().map_or(0, |&l| l as usize);
            if len > 0 && len < buf.len() {
                buf.truncate(len);
            }
            diag.device = Some(buf);
        }
        Err(e) => on_error("device", e)?,
    }
    match read_item(transport, DESC_CONFIGURATION, 0, CONFIG_DESCRIPTOR_BUF) {
        Ok(buf) => diag.configuration = Some(buf),
        Err(e) => on_error("configuration", e)?,
    }
    for (i, &size) in HID_REPORT_DESCRIPTOR_SIZES.iter().enumerate() {
        match read_item(transport, DESC_HID_REPORT, i as u8, size) {
            Ok(buf) => diag.hid_reports.push(buf),
            Err(e) => on_error("hid report", e)?,
        }
    }

    Ok(diag)
}
