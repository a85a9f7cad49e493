//! Session state machine types.

use std::fmt;

use crate::protocol::constants::{
    INTELLITOOLS_VENDOR_ID, PROGRAMMED_PRODUCT_ID, UNPROGRAMMED_PRODUCT_ID,
};
use crate::protocol::Response;
use crate::transport::DeviceIdentity;

/// Where the session is in bringing the device up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No device handle; scanning for a matching vendor ID.
    #[default]
    Searching,
    /// Unprogrammed part attached; firmware download in progress.
    LoaderPresent,
    /// Programmed part attached; command protocol active.
    Programmed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Searching => write!(f, "SEARCHING"),
            SessionState::LoaderPresent => write!(f, "LOADER_PRESENT"),
            SessionState::Programmed => write!(f, "PROGRAMMED"),
        }
    }
}

/// What a product ID under our vendor means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Unprogrammed,
    Programmed,
    Unknown(u16),
}

impl DeviceKind {
    pub fn from_product_id(pid: u16) -> Self {
        match pid {
            UNPROGRAMMED_PRODUCT_ID => DeviceKind::Unprogrammed,
            PROGRAMMED_PRODUCT_ID => DeviceKind::Programmed,
            other => DeviceKind::Unknown(other),
        }
    }
}

/// First device with our vendor ID, in enumeration order.
pub fn select_device(devices: &[DeviceIdentity]) -> Option<&DeviceIdentity> {
    devices.iter().find(|d| d.vendor_id == INTELLITOOLS_VENDOR_ID)
}

/// Result of one session step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// No device with our vendor ID is attached.
    NoDevice,
    /// Vendor matched but the product ID is neither known identity.
    Unhandled { product_id: u16 },
    /// Both images were downloaded; the device should re-enumerate.
    FirmwareLoaded,
    /// Programmed device initialized; carries the GET_VERSION response.
    Ready { version: Response },
    /// Programmed device still attached, nothing to do.
    Idle,
    /// The device went away; back to searching.
    Detached,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(vid: u16, pid: u16, address: u8) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: vid,
            product_id: pid,
            bus_id: "1".into(),
            address,
        }
    }

    #[test]
    fn test_device_kind() {
        assert_eq!(DeviceKind::from_product_id(0x0100), DeviceKind::Unprogrammed);
        assert_eq!(DeviceKind::from_product_id(0x0101), DeviceKind::Programmed);
        assert_eq!(DeviceKind::from_product_id(0x0102), DeviceKind::Unknown(0x0102));
    }

    #[test]
    fn test_first_vendor_match_wins() {
        let devices = vec![
            dev(0x046D, 0x0100, 1),
            dev(0x095E, 0x0999, 2),
            dev(0x095E, 0x0100, 3),
        ];
        assert_eq!(select_device(&devices).map(|d| d.address), Some(2));
        assert!(select_device(&devices[..1]).is_none());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Searching.to_string(), "SEARCHING");
        assert_eq!(SessionState::LoaderPresent.to_string(), "LOADER_PRESENT");
        assert_eq!(SessionState::Programmed.to_string(), "PROGRAMMED");
    }
}
