//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for talking to one opened device and the
//! `UsbBus` trait for enumerating and opening devices, allowing different
//! implementations (nusb, mock, etc.).

use std::fmt;
use std::time::Duration;

use crate::protocol::ControlSetup;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to enumerate devices: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint 0x{endpoint:02X} not found in active configuration")]
    EndpointNotFound { endpoint: u8 },

    #[error("Control transfer failed ({setup}): {message}")]
    ControlFailed { setup: String, message: String },

    #[error("Write to endpoint 0x{endpoint:02X} failed: {message}")]
    WriteFailed { endpoint: u8, message: String },

    #[error("Read from endpoint 0x{endpoint:02X} failed: {message}")]
    ReadFailed { endpoint: u8, message: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl TransportError {
    pub(crate) fn control(setup: &ControlSetup, message: impl fmt::Display) -> Self {
        TransportError::ControlFailed {
            setup: setup.to_string(),
            message: message.to_string(),
        }
    }
}

/// Identity and bus location of an attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_id: String,
    pub address: u8,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} (bus {} addr {})",
            self.vendor_id, self.product_id, self.bus_id, self.address
        )
    }
}

/// Abstract USB transport interface for one opened device.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send + Sync {
    /// Control transfer with an OUT (or empty) data stage.
    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<(), TransportError>;

    /// Control transfer with an IN data stage of up to `length` bytes.
    fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError>;

    /// Write raw bytes to an interrupt/bulk OUT endpoint.
    fn write(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `max_len` bytes from an interrupt/bulk IN endpoint.
    fn read(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}

/// Device enumeration surface of the host stack.
pub trait UsbBus {
    type Transport: UsbTransport;

    /// List attached devices in host enumeration order.
    fn list_devices(&self) -> Result<Vec<DeviceIdentity>, TransportError>;

    /// Open a previously listed device.
    fn open(&self, device: &DeviceIdentity) -> Result<Self::Transport, TransportError>;
}
