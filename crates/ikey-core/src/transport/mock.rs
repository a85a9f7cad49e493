//! Mock USB transport and bus for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{DeviceIdentity, TransportError, UsbBus, UsbTransport};
use crate::protocol::ControlSetup;

/// One operation observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbOp {
    ControlOut { setup: ControlSetup, data: Vec<u8> },
    ControlIn { setup: ControlSetup, length: u16 },
    Write { endpoint: u8, data: Vec<u8> },
    Read { endpoint: u8, max_len: usize },
}

/// State shared between a mock and everything cloned from it.
#[derive(Debug, Default)]
struct Shared {
    /// Queued endpoint read responses.
    read_queue: VecDeque<Vec<u8>>,
    /// Queued control IN responses.
    control_in_queue: VecDeque<Vec<u8>>,
    /// Captured operations.
    ops: Vec<UsbOp>,
    /// Whether device is "disconnected".
    disconnected: bool,
    /// Fail the control OUT with this index (0-based, counted over the log).
    fail_control_out_at: Option<usize>,
}

/// Mock transport for unit testing loader, channel and session logic.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_ids(
            crate::protocol::INTELLITOOLS_VENDOR_ID,
            crate::protocol::PROGRAMMED_PRODUCT_ID,
        )
    }

    pub fn with_ids(vid: u16, pid: u16) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            vid,
            pid,
        }
    }

    /// Same operation log and queues, different identity.
    fn sibling(&self, vid: u16, pid: u16) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            vid,
            pid,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        // A panicking test thread poisons the lock; the data is still usable.
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a response to be returned on the next endpoint read.
    pub fn queue_read(&self, bytes: &[u8]) {
        self.lock().read_queue.push_back(bytes.to_vec());
    }

    /// Queue a response to be returned on the next control IN transfer.
    pub fn queue_control_in(&self, bytes: &[u8]) {
        self.lock().control_in_queue.push_back(bytes.to_vec());
    }

    /// Make the n-th control OUT transfer (0-based) fail.
    pub fn fail_control_out_at(&self, n: usize) {
        self.lock().fail_control_out_at = Some(n);
    }

    /// Get all captured operations.
    pub fn ops(&self) -> Vec<UsbOp> {
        self.lock().ops.clone()
    }

    /// Captured control OUT transfers.
    pub fn control_outs(&self) -> Vec<(ControlSetup, Vec<u8>)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                UsbOp::ControlOut { setup, data } => Some((setup, data)),
                _ => None,
            })
            .collect()
    }

    /// Captured endpoint writes.
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                UsbOp::Write { endpoint, data } => Some((endpoint, data)),
                _ => None,
            })
            .collect()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.lock().disconnected = false;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<(), TransportError> {
        let mut shared = self.lock();
        if shared.disconnected {
            return Err(TransportError::Disconnected);
        }
        let index = shared
            .ops
            .iter()
            .filter(|op| matches!(op, UsbOp::ControlOut { .. }))
            .count();
        if shared.fail_control_out_at == Some(index) {
            return Err(TransportError::control(&setup, "injected failure"));
        }
        shared.ops.push(UsbOp::ControlOut {
            setup,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError> {
        let mut shared = self.lock();
        if shared.disconnected {
            return Err(TransportError::Disconnected);
        }
        shared.ops.push(UsbOp::ControlIn { setup, length });
        shared
            .control_in_queue
            .pop_front()
            .map(|mut bytes| {
                bytes.truncate(length as usize);
                bytes
            })
            .ok_or_else(|| TransportError::control(&setup, "stall"))
    }

    fn write(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        let mut shared = self.lock();
        if shared.disconnected {
            return Err(TransportError::Disconnected);
        }
        shared.ops.push(UsbOp::Write {
            endpoint,
            data: data.to_vec(),
        });
        Ok(data.len())
    }

    fn read(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut shared = self.lock();
        if shared.disconnected {
            return Err(TransportError::Disconnected);
        }
        shared.ops.push(UsbOp::Read { endpoint, max_len });
        shared
            .read_queue
            .pop_front()
            .map(|mut bytes| {
                bytes.truncate(max_len);
                bytes
            })
            .ok_or(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

/// Mock bus that replays a script of device lists.
///
/// Each `list_devices` call consumes the next list of the script; the last
/// list keeps being returned once the script runs out. Every transport opened
/// from the bus shares the operation log of `transport()`.
pub struct MockBus {
    script: Mutex<VecDeque<Vec<DeviceIdentity>>>,
    transport: MockTransport,
    opened: Mutex<Vec<DeviceIdentity>>,
}

impl MockBus {
    pub fn new(script: Vec<Vec<DeviceIdentity>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            transport: MockTransport::new(),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Identity on a fake bus location.
    pub fn device(vid: u16, pid: u16) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: vid,
            product_id: pid,
            bus_id: "mock".to_string(),
            address: 1,
        }
    }

    /// Handle on the shared operation log and response queues.
    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }

    /// Devices opened so far, in order.
    pub fn opened(&self) -> Vec<DeviceIdentity> {
        self.opened.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl UsbBus for MockBus {
    type Transport = MockTransport;

    fn list_devices(&self) -> Result<Vec<DeviceIdentity>, TransportError> {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        let list = if script.len() > 1 {
            script.pop_front().unwrap_or_default()
        } else {
            script.front().cloned().unwrap_or_default()
        };
        Ok(list)
    }

    fn open(&self, device: &DeviceIdentity) -> Result<MockTransport, TransportError> {
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(device.clone());
        Ok(self.transport.sibling(device.vendor_id, device.product_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_read_queue() {
        let mock = MockTransport::new();
        mock.queue_read(&[1, 2, 3]);

        let bytes = mock.read(0x82, 8, Duration::from_millis(2)).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        // Queue is empty now
        assert!(matches!(
            mock.read(0x82, 8, Duration::from_millis(2)),
            Err(TransportError::Timeout { timeout_ms: 2 })
        ));
    }

    #[test]
    fn test_mock_op_capture() {
        let mock = MockTransport::new();
        mock.write(0x02, b"Hello").unwrap();
        mock.control_out(ControlSetup::vendor_out(0xA0, 0x1000, 0), &[1])
            .unwrap();

        let ops = mock.ops();
        assert_eq!(ops.len(), 2);
        assert_eq!(mock.writes(), vec![(0x02, b"Hello".to_vec())]);
        assert_eq!(mock.control_outs()[0].1, vec![1]);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        mock.disconnect();
        assert!(mock.write(0x02, b"test").is_err());
        mock.reconnect();
        assert!(mock.write(0x02, b"test").is_ok());
    }

    #[test]
    fn test_mock_bus_script() {
        let first = MockBus::device(0x095E, 0x0100);
        let second = MockBus::device(0x095E, 0x0101);
        let bus = MockBus::new(vec![vec![first.clone()], vec![], vec![second.clone()]]);

        assert_eq!(bus.list_devices().unwrap(), vec![first.clone()]);
        assert!(bus.list_devices().unwrap().is_empty());
        assert_eq!(bus.list_devices().unwrap(), vec![second.clone()]);
        // Last list sticks.
        assert_eq!(bus.list_devices().unwrap(), vec![second.clone()]);

        let t = bus.open(&first).unwrap();
        assert_eq!(t.product_id(), 0x0100);
        t.write(0x02, &[0]).unwrap();
        assert_eq!(bus.transport().writes().len(), 1);
        assert_eq!(bus.opened(), vec![first]);
    }
}
