//! Protocol module - EZUSB loader and IntelliKeys command definitions.

pub mod command;
pub mod constants;
pub mod record;
pub mod request;

pub use command::{Command, CommandReport, Response};
pub use constants::*;
pub use record::{MemoryRegion, Record, RecordError, RecordHeader, Records};
pub use request::{ControlSetup, ControlType, Direction, Recipient};
