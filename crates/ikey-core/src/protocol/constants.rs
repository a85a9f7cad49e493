//! Protocol constants for the IntelliKeys and its EZUSB controller.

// ============================================================================
// Device Identification
// ============================================================================

/// IntelliTools vendor ID
pub const INTELLITOOLS_VENDOR_ID: u16 = 0x095E;

/// Unprogrammed part, EZUSB default loader identity (needs firmware)
pub const UNPROGRAMMED_PRODUCT_ID: u16 = 0x0100;

/// Programmed part, re-enumerated after the firmware download
pub const PROGRAMMED_PRODUCT_ID: u16 = 0x0101;

// ============================================================================
// Standard USB Requests
// ============================================================================

pub const REQ_GET_DESCRIPTOR: u8 = 6;
pub const REQ_SET_INTERFACE: u8 = 11;

pub const DESC_DEVICE: u8 = 0x01;
pub const DESC_CONFIGURATION: u8 = 0x02;
pub const DESC_STRING: u8 = 0x03;
pub const DESC_HID_REPORT: u8 = 0x22;

// ============================================================================
// EZUSB Anchor Loader
// ============================================================================

/// Vendor request: write to internal RAM
pub const ANCHOR_LOAD_INTERNAL: u8 = 0xA0;

/// Vendor request: write to external RAM (handled by the loader image)
pub const ANCHOR_LOAD_EXTERNAL: u8 = 0xA3;

/// 8051 CPU control and status register
pub const CPUCS_REG: u16 = 0x7F92;

/// Highest address that lives in internal RAM
pub const MAX_INTERNAL_ADDRESS: u16 = 0x1B3F;

// ============================================================================
// HID Command Channel
// ============================================================================

/// Size of every command report and response.
pub const REPORT_SIZE: usize = 8;

/// Interrupt OUT endpoint for report index 0.
pub const EP_COMMAND_OUT: u8 = 0x02;
/// Interrupt OUT endpoint for any other report index.
pub const EP_COMMAND_OUT_ALT: u8 = 0x03;
/// Interrupt IN endpoint carrying command responses.
pub const EP_STATUS_IN: u8 = 0x82;

/// HID report descriptor sizes for the no-subclass, keyboard and mouse interfaces.
pub const HID_REPORT_DESCRIPTOR_SIZES: [usize; 3] = [28, 55, 44];

// ============================================================================
// Diagnostic buffer sizes
// ============================================================================

pub const STRING_DESCRIPTOR_BUF: usize = 38;
pub const DEVICE_DESCRIPTOR_BUF: usize = 38;
pub const CONFIG_DESCRIPTOR_BUF: usize = 98;
