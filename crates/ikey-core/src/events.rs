//! Event system for UI decoupling.
//!
//! Lets the CLI (or anything else) follow the session without being wired
//! into the core logic.

use std::fmt;

use crate::protocol::{Command, Response};
use crate::state::SessionState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by the session.
#[derive(Debug, Clone)]
pub enum IkEvent {
    /// Device acquired.
    DeviceConnected { vid: u16, pid: u16 },
    /// Device handle released (the device is expected to re-enumerate or is gone).
    DeviceDisconnected,
    /// State changed.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Firmware download progress, in payload bytes.
    Progress {
        image: String,
        current: u64,
        total: u64,
    },
    /// A descriptor was read for diagnostics.
    Descriptor { kind: String, data: Vec<u8> },
    /// Command written to the device.
    CommandSent { command: Command, data: u8 },
    /// Response read for a command.
    ResponseReceived {
        command: Command,
        response: Response,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error occurred; the session falls back to searching.
    Error { message: String },
    /// USB Packet sent/received on an endpoint.
    Packet {
        direction: PacketDirection,
        endpoint: u8,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Device is initialized and idle.
    Ready,
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving session events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait IkObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &IkEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl IkObserver for NullObserver {
    fn on_event(&self, _event: &IkEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl IkObserver for TracingObserver {
    fn on_event(&self, event: &IkEvent) {
        match event {
            IkEvent::DeviceConnected { vid, pid } => {
                tracing::info!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    "Device connected"
                );
            }
            IkEvent::DeviceDisconnected => {
                tracing::info!("Device released");
            }
            IkEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            IkEvent::Progress {
                image,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(image = %image, progress = %format!("{}%", pct), "Progress");
            }
            IkEvent::Descriptor { kind, data } => {
                tracing::info!(kind = %kind, len = data.len(), "Descriptor {:02X?}", data);
            }
            IkEvent::CommandSent { command, data } => {
                tracing::debug!(command = %command, data = data, "Command sent");
            }
            IkEvent::ResponseReceived { command, response } => {
                tracing::info!(command = %command, response = %response, "Response");
            }
            IkEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            IkEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            IkEvent::Packet {
                direction,
                endpoint,
                length,
                ..
            } => {
                tracing::trace!(
                    dir = %direction,
                    ep = %format!("0x{:02X}", endpoint),
                    len = length,
                    "USB Packet"
                );
            }
            IkEvent::Ready => {
                tracing::info!("Device ready");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Observer that keeps every event for inspection.
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub events: Mutex<Vec<IkEvent>>,
    }

    impl IkObserver for RecordingObserver {
        fn on_event(&self, event: &IkEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_recording_observer() {
        let obs = RecordingObserver::default();
        obs.on_event(&IkEvent::Ready);
        obs.on_event(&IkEvent::DeviceDisconnected);
        assert_eq!(obs.events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_packet_direction_display() {
        assert_eq!(PacketDirection::Tx.to_string(), "TX");
        assert_eq!(PacketDirection::Rx.to_string(), "RX");
    }
}
