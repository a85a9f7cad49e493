//! USB control request setup fields.

use std::fmt;

/// Data stage direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// Request type (bits 5..6 of bmRequestType).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Standard,
    Class,
    Vendor,
}

/// Request recipient (bits 0..4 of bmRequestType).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Setup packet of a control transfer, minus the length (taken from the data stage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub direction: Direction,
    pub control_type: ControlType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// Vendor OUT request addressed to the device.
    pub fn vendor_out(request: u8, value: u16, index: u16) -> Self {
        Self {
            direction: Direction::Out,
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }

    /// Standard OUT request addressed to the device.
    pub fn standard_out(request: u8, value: u16, index: u16) -> Self {
        Self {
            direction: Direction::Out,
            control_type: ControlType::Standard,
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }

    /// Standard IN request addressed to the device.
    pub fn standard_in(request: u8, value: u16, index: u16) -> Self {
        Self {
            direction: Direction::In,
            control_type: ControlType::Standard,
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }

    /// Encoded bmRequestType byte.
    pub fn request_type(&self) -> u8 {
        let dir = match self.direction {
            Direction::Out => 0,
            Direction::In => 1,
        };
        let ty = match self.control_type {
            ControlType::Standard => 0,
            ControlType::Class => 1,
            ControlType::Vendor => 2,
        };
        let rcpt = match self.recipient {
            Recipient::Device => 0,
            Recipient::Interface => 1,
            Recipient::Endpoint => 2,
            Recipient::Other => 3,
        };
        (dir << 7) | (ty << 5) | rcpt
    }
}

impl fmt::Display for ControlSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bmRequestType=0x{:02X} bRequest=0x{:02X} wValue=0x{:04X} wIndex=0x{:04X}",
            self.request_type(),
            self.request,
            self.value,
            self.index
        )
    }
}
