//! HID report command channel.
//!
//! Strict request/response alternation: one 8-byte report out, one 8-byte
//! response in from the status endpoint. There is no correlation id, so only
//! one command may be outstanding.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::protocol::constants::{EP_COMMAND_OUT, EP_COMMAND_OUT_ALT, EP_STATUS_IN, REPORT_SIZE};
use crate::protocol::{Command, CommandReport, Response};
use crate::transport::{TransportError, UsbTransport};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{command}: no response within {timeout_ms}ms")]
    Timeout { command: Command, timeout_ms: u64 },
    #[error("{command}: short response ({actual} of {expected} bytes)")]
    ShortRead {
        command: Command,
        expected: usize,
        actual: usize,
    },
    #[error("{command}: {source}")]
    Transport {
        command: Command,
        #[source]
        source: TransportError,
    },
}

/// Endpoint layout and timing of the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Report ID prefixed to outgoing reports; 0 sends no prefix.
    pub report_id: u8,
    pub response_timeout: Duration,
    pub out_endpoint: u8,
    pub alt_out_endpoint: u8,
    pub status_endpoint: u8,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            report_id: 0,
            response_timeout: Duration::from_millis(2),
            out_endpoint: EP_COMMAND_OUT,
            alt_out_endpoint: EP_COMMAND_OUT_ALT,
            status_endpoint: EP_STATUS_IN,
        }
    }
}

pub struct CommandChannel<'a, T: UsbTransport + ?Sized> {
    transport: &'a T,
    config: ChannelConfig,
}

impl<'a, T: UsbTransport + ?Sized> CommandChannel<'a, T> {
    pub fn new(transport: &'a T, config: ChannelConfig) -> Self {
        Self { transport, config }
    }

    /// Write a HID output report on the endpoint for report `index`.
    pub fn send_report(&self, index: usize, report: &CommandReport) -> Result<(), TransportError> {
        let endpoint = if index == 0 {
            self.config.out_endpoint
        } else {
            self.config.alt_out_endpoint
        };
        self.transport
            .write(endpoint, &report.framed(self.config.report_id))?;
        Ok(())
    }

    /// Send a command and wait for its response.
    #[instrument(skip(self), fields(command = %command))]
    pub fn send_command(&self, command: Command, data: u8) -> Result<Response, CommandError> {
        let transport_err = |source| CommandError::Transport { command, source };

        let report = CommandReport::new(command, data);
        debug!(report = ?report.as_bytes(), "Sending command");
        self.send_report(0, &report).map_err(transport_err)?;

        let bytes = self
            .transport
            .read(
                self.config.status_endpoint,
                REPORT_SIZE,
                self.config.response_timeout,
            )
            .map_err(|e| match e {
                TransportError::Timeout { timeout_ms } => CommandError::Timeout {
                    command,
                    timeout_ms,
                },
                other => transport_err(other),
            })?;

        let buf: [u8; REPORT_SIZE] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CommandError::ShortRead {
                    command,
                    expected: REPORT_SIZE,
                    actual: bytes.len(),
                })?;
        let response = Response::from_bytes(buf);
        debug!(response = %response, "Response received");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, UsbOp};

    #[test]
    fn test_init_framing_and_single_read() {
        let mock = MockTransport::new();
        mock.queue_read(&[0x06, 0, 0, 0, 0, 0, 0, 0]);
        let channel = CommandChannel::new(&mock, ChannelConfig::default());

        let resp = channel.send_command(Command::Init, 0).unwrap();
        assert_eq!(resp.code(), 0x06);

        assert_eq!(
            mock.ops(),
            vec![
                UsbOp::Write {
                    endpoint: 0x02,
                    data: vec![6, 0, 0, 0, 0, 0, 0, 0],
                },
                UsbOp::Read {
                    endpoint: 0x82,
                    max_len: 8,
                },
            ]
        );
    }

    #[test]
    fn test_data_byte_passthrough_and_report_id() {
        let mock = MockTransport::new();
        mock.queue_read(&[0; 8]);
        let config = ChannelConfig {
            report_id: 3,
            ..Default::default()
        };
        CommandChannel::new(&mock, config)
            .send_command(Command::Scan, 1)
            .unwrap();
        assert_eq!(mock.writes()[0].1, vec![3, 3, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_alt_report_endpoint() {
        let mock = MockTransport::new();
        let channel = CommandChannel::new(&mock, ChannelConfig::default());
        channel
            .send_report(1, &CommandReport::new(Command::Led, 5))
            .unwrap();
        assert_eq!(mock.writes()[0].0, 0x03);
    }

    #[test]
    fn test_timeout_is_reported() {
        let mock = MockTransport::new();
        let channel = CommandChannel::new(&mock, ChannelConfig::default());
        let err = channel.send_command(Command::GetVersion, 0).unwrap_err();
        assert!(matches!(
            err,
            CommandError::Timeout {
                command: Command::GetVersion,
                timeout_ms: 2
            }
        ));
        // Not retried.
        let reads = mock
            .ops()
            .iter()
            .filter(|op| matches!(op, UsbOp::Read { .. }))
            .count();
        assert_eq!(reads, 1);
    }

    #[test]
    fn test_short_read_is_fatal() {
        let mock = MockTransport::new();
        mock.queue_read(&[1, 2, 3]);
        let channel = CommandChannel::new(&mock, ChannelConfig::default());
        assert!(matches!(
            channel.send_command(Command::AllSensors, 0),
            Err(CommandError::ShortRead { actual: 3, .. })
        ));
    }

    #[test]
    fn test_disconnect_surfaces_transport_error() {
        let mock = MockTransport::new();
        mock.disconnect();
        let channel = CommandChannel::new(&mock, ChannelConfig::default());
        assert!(matches!(
            channel.send_command(Command::Init, 0),
            Err(CommandError::Transport {
                source: TransportError::Disconnected,
                ..
            })
        ));
    }
}
