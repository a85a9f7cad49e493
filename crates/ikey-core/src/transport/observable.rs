//! Transport wrapper that emits packet events.

use std::time::Duration;

use super::traits::{TransportError, UsbTransport};
use crate::events::{IkEvent, IkObserver, PacketDirection};
use crate::protocol::ControlSetup;

pub struct ObservableTransport<'a, T: UsbTransport, O: IkObserver + ?Sized> {
    inner: &'a T,
    observer: &'a O,
}

impl<'a, T: UsbTransport, O: IkObserver + ?Sized> ObservableTransport<'a, T, O> {
    pub fn new(inner: &'a T, observer: &'a O) -> Self {
        Self { inner, observer }
    }

    fn packet(&self, direction: PacketDirection, endpoint: u8, data: &[u8]) {
        self.observer.on_event(&IkEvent::Packet {
            direction,
            endpoint,
            length: data.len(),
            data: Some(data.iter().take(32).cloned().collect()),
        });
    }
}

impl<'a, T: UsbTransport, O: IkObserver + ?Sized> UsbTransport for ObservableTransport<'a, T, O> {
    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.control_out(setup, data);
        if res.is_ok() {
            self.packet(PacketDirection::Tx, 0x00, data);
        }
        res
    }

    fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.control_in(setup, length);
        if let Ok(data) = &res {
            self.packet(PacketDirection::Rx, 0x80, data);
        }
        res
    }

    fn write(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        let res = self.inner.write(endpoint, data);
        if res.is_ok() {
            self.packet(PacketDirection::Tx, endpoint, data);
        }
        res
    }

    fn read(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.read(endpoint, max_len, timeout);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.packet(PacketDirection::Rx, endpoint, data);
        }
        res
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id()
    }
}
