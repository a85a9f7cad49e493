//! IKey-Core: IntelliKeys USB bring-up in Rust.
//!
//! An IntelliKeys keyboard enumerates first as a bare EZUSB part with no
//! firmware. The host downloads a loader and the main firmware into it, the
//! device re-enumerates under a new product ID, and from then on it speaks an
//! 8-byte HID report command protocol.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, load records, command reports, control setups
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Firmware / Loader**: Image supply and the EZUSB anchor download
//! - **Descriptor / Channel**: Diagnostic reads and the command channel
//! - **State**: Device identity state machine
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use ikey_core::session::{IkSession, SessionConfig};
//! use ikey_core::transport::NusbBus;
//!
//! let config = SessionConfig {
//!     loader_path: Some("loader.hex".to_string()),
//!     firmware_path: Some("firmware.hex".to_string()),
//!     ..Default::default()
//! };
//!
//! let images = config.load_images().expect("images");
//! let bus = NusbBus::new(config.control_timeout());
//! let mut session = IkSession::new(config, bus, images);
//! session.run().expect("session failed");
//! ```

pub mod channel;
pub mod descriptor;
pub mod events;
pub mod firmware;
pub mod loader;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use channel::{ChannelConfig, CommandChannel, CommandError};
pub use descriptor::{Diagnostics, collect_diagnostics};
pub use events::{IkEvent, IkObserver, LogLevel, NullObserver, TracingObserver};
pub use firmware::{FirmwareError, FirmwareImage, FirmwareSet, ImageSummary};
pub use loader::{DownloadStats, EzUsbLoader, LoadError};
pub use protocol::{Command, CommandReport, Response};
pub use session::{DiagnosticsPolicy, IkSession, SessionConfig};
pub use state::{DeviceKind, SessionState, StepOutcome};
pub use transport::{
    DeviceIdentity, MockBus, MockTransport, NusbBus, NusbTransport, TransportError, UsbBus,
    UsbTransport,
};
