//! nusb-based USB transport implementation.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, In, Interrupt, Out};
use nusb::{Device, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{DeviceIdentity, TransportError, UsbBus, UsbTransport};
use crate::protocol::{ControlSetup, ControlType, Recipient};

/// Host USB stack backed by nusb.
#[derive(Debug, Clone)]
pub struct NusbBus {
    control_timeout: Duration,
}

impl NusbBus {
    pub fn new(control_timeout: Duration) -> Self {
        Self { control_timeout }
    }
}

impl Default for NusbBus {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl UsbBus for NusbBus {
    type Transport = NusbTransport;

    fn list_devices(&self) -> Result<Vec<DeviceIdentity>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

        Ok(devices
            .map(|d| DeviceIdentity {
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                bus_id: d.bus_id().to_string(),
                address: d.device_address(),
            })
            .collect())
    }

    #[instrument(level = "info", skip(self, device), fields(device = %device))]
    fn open(&self, device: &DeviceIdentity) -> Result<NusbTransport, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?
            .find(|d| d.bus_id() == device.bus_id && d.device_address() == device.address)
            .ok_or(TransportError::DeviceNotFound {
                vid: device.vendor_id,
                pid: device.product_id,
            })?;

        let handle = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!(
            vendor_id = %format!("{:04X}", device_info.vendor_id()),
            product_id = %format!("{:04X}", device_info.product_id()),
            "Device opened"
        );

        Ok(NusbTransport {
            device: handle,
            interfaces: Mutex::new(HashMap::new()),
            control_timeout: self.control_timeout,
            vid: device_info.vendor_id(),
            pid: device_info.product_id(),
        })
    }
}

/// nusb-based USB transport.
///
/// Control transfers go straight to the device. Interfaces are claimed on
/// first use of one of their endpoints, detaching the kernel HID driver.
pub struct NusbTransport {
    device: Device,
    interfaces: Mutex<HashMap<u8, Interface>>,
    control_timeout: Duration,
    vid: u16,
    pid: u16,
}

fn control_type(ty: ControlType) -> nusb::transfer::ControlType {
    match ty {
        ControlType::Standard => nusb::transfer::ControlType::Standard,
        ControlType::Class => nusb::transfer::ControlType::Class,
        ControlType::Vendor => nusb::transfer::ControlType::Vendor,
    }
}

fn recipient(r: Recipient) -> nusb::transfer::Recipient {
    match r {
        Recipient::Device => nusb::transfer::Recipient::Device,
        Recipient::Interface => nusb::transfer::Recipient::Interface,
        Recipient::Endpoint => nusb::transfer::Recipient::Endpoint,
        Recipient::Other => nusb::transfer::Recipient::Other,
    }
}

fn write_failed(endpoint: u8, e: impl std::fmt::Display) -> TransportError {
    TransportError::WriteFailed {
        endpoint,
        message: e.to_string(),
    }
}

impl NusbTransport {
    /// Find the interface owning `endpoint` in the active configuration.
    fn interface_number_for(&self, endpoint: u8) -> Result<u8, TransportError> {
        let config = self
            .device
            .active_configuration()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for iface in config.interfaces() {
            for alt in iface.alt_settings() {
                if alt.endpoints().any(|ep| ep.address() == endpoint) {
                    return Ok(iface.interface_number());
                }
            }
        }
        Err(TransportError::EndpointNotFound { endpoint })
    }

    fn interface_for(&self, endpoint: u8) -> Result<Interface, TransportError> {
        let number = self.interface_number_for(endpoint)?;
        let mut interfaces = self
            .interfaces
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if let Some(iface) = interfaces.get(&number) {
            return Ok(iface.clone());
        }

        let iface = self
            .device
            .detach_and_claim_interface(number)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: number,
                message: e.to_string(),
            })?;
        debug!(interface = number, "Claimed interface");
        interfaces.insert(number, iface.clone());
        Ok(iface)
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, setup, data), fields(request = %setup, len = data.len()))]
    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<(), TransportError> {
        self.device
            .control_out(
                ControlOut {
                    control_type: control_type(setup.control_type),
                    recipient: recipient(setup.recipient),
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    data,
                },
                self.control_timeout,
            )
            .wait()
            .map_err(|e| TransportError::control(&setup, e))
    }

    #[instrument(skip(self, setup), fields(request = %setup))]
    fn control_in(&self, setup: ControlSetup, length: u16) -> Result<Vec<u8>, TransportError> {
        let data = self
            .device
            .control_in(
                ControlIn {
                    control_type: control_type(setup.control_type),
                    recipient: recipient(setup.recipient),
                    request: setup.request,
                    value: setup.value,
                    index: setup.index,
                    length,
                },
                self.control_timeout,
            )
            .wait()
            .map_err(|e| TransportError::control(&setup, e))?;

        debug!(bytes_read = data.len(), "Control IN complete");
        Ok(data)
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransportError> {
        let iface = self.interface_for(endpoint)?;
        let ep = iface
            .endpoint::<Interrupt, Out>(endpoint)
            .map_err(|e| write_failed(endpoint, e))?;

        let packet_size = ep.max_packet_size();
        let mut writer = ep
            .writer(packet_size.max(data.len()))
            .with_write_timeout(self.control_timeout);
        writer
            .write_all(data)
            .map_err(|e| write_failed(endpoint, e))?;
        writer.flush().map_err(|e| write_failed(endpoint, e))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self), fields(max_len))]
    fn read(
        &self,
        endpoint: u8,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let iface = self.interface_for(endpoint)?;
        let ep = iface
            .endpoint::<Interrupt, In>(endpoint)
            .map_err(|e| TransportError::ReadFailed {
                endpoint,
                message: e.to_string(),
            })?;

        let packet_size = ep.max_packet_size();
        let mut reader = ep.reader(packet_size).with_read_timeout(timeout);
        let mut buf = vec![0u8; max_len];

        let n = reader.read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
            _ => TransportError::ReadFailed {
                endpoint,
                message: e.to_string(),
            },
        })?;

        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
