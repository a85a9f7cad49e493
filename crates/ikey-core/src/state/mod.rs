//! State machine module.

pub mod machine;

pub use machine::{DeviceKind, SessionState, StepOutcome, select_device};
