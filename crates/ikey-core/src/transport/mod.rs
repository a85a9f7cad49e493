//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod observable;
pub mod traits;

pub use mock::{MockBus, MockTransport, UsbOp};
pub use self::nusb::{NusbBus, NusbTransport};
pub use observable::ObservableTransport;
pub use traits::{DeviceIdentity, TransportError, UsbBus, UsbTransport};
