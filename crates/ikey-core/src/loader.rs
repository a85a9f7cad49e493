//! EZUSB firmware loader.
//!
//! Pushes a record stream into the 8051 core of an unprogrammed part:
//! internal RAM records first (vendor request 0xA0), then external RAM records
//! (0xA3, serviced by a previously loaded loader image). The core is held in
//! reset through CPUCS between the passes.

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::firmware::FirmwareImage;
use crate::protocol::constants::{ANCHOR_LOAD_EXTERNAL, ANCHOR_LOAD_INTERNAL, CPUCS_REG};
use crate::protocol::{ControlSetup, MemoryRegion, RecordError, Records};
use crate::transport::{TransportError, UsbTransport};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Malformed firmware record in {image}: {source}")]
    Record {
        image: String,
        #[source]
        source: RecordError,
    },
    #[error("Transfer failed: {0}")]
    Transport(#[from] TransportError),
}

/// Payload counters for one download.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadStats {
    pub internal_records: usize,
    pub internal_bytes: usize,
    pub external_records: usize,
    pub external_bytes: usize,
}

impl DownloadStats {
    pub fn total_bytes(&self) -> usize {
        self.internal_bytes + self.external_bytes
    }

    fn add(&mut self, region: MemoryRegion, len: usize) {
        match region {
            MemoryRegion::Internal => {
                self.internal_records += 1;
                self.internal_bytes += len;
            }
            MemoryRegion::External => {
                self.external_records += 1;
                self.external_bytes += len;
            }
        }
    }
}

/// Last value written to CPUCS during this attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Held,
    Running,
}

/// Firmware loader bound to one attached unprogrammed device.
pub struct EzUsbLoader<'a, T: UsbTransport + ?Sized> {
    transport: &'a T,
    cpu: Option<CpuState>,
}

impl<'a, T: UsbTransport + ?Sized> EzUsbLoader<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self {
            transport,
            cpu: None,
        }
    }

    /// Run state of the 8051 core as last commanded, if any.
    pub fn cpu_state(&self) -> Option<CpuState> {
        self.cpu
    }

    fn load_xfer(&self, request: u8, address: u16, data: &[u8]) -> Result<(), TransportError> {
        self.transport
            .control_out(ControlSetup::vendor_out(request, address, 0), data)
    }

    /// Hold (`true`) or release (`false`) the 8051 core.
    ///
    /// A write that would not change the last commanded state is skipped.
    pub fn set_reset(&mut self, reset: bool) -> Result<(), TransportError> {
        let target = if reset {
            CpuState::Held
        } else {
            CpuState::Running
        };
        if self.cpu == Some(target) {
            debug!(state = ?target, "CPUCS already in requested state");
            return Ok(());
        }
        debug!(reset, "Writing CPUCS");
        self.load_xfer(ANCHOR_LOAD_INTERNAL, CPUCS_REG, &[reset as u8])?;
        self.cpu = Some(target);
        Ok(())
    }

    /// Download one image in two passes, leaving the core held in reset.
    #[instrument(skip(self, image, progress), fields(image = %image.name()))]
    pub fn download(
        &mut self,
        image: &FirmwareImage,
        mut progress: impl FnMut(u64, u64),
    ) -> Result<DownloadStats, LoadError> {
        let total = image.payload_len() as u64;
        let mut sent = 0u64;
        let mut stats = DownloadStats::default();

        for region in [MemoryRegion::Internal, MemoryRegion::External] {
            let request = match region {
                MemoryRegion::Internal => ANCHOR_LOAD_INTERNAL,
                MemoryRegion::External => ANCHOR_LOAD_EXTERNAL,
            };

            // Every pass walks the whole image and picks its own records.
            for record in Records::new(image.data()) {
                let record = record.map_err(|source| LoadError::Record {
                    image: image.name().to_string(),
                    source,
                })?;
                if record.region() != region {
                    continue;
                }
                debug!(
                    request = %format!("0x{:02X}", request),
                    address = %format!("0x{:04X}", record.address),
                    len = record.payload.len(),
                    "Load record"
                );
                self.load_xfer(request, record.address, record.payload)?;
                stats.add(region, record.payload.len());
                sent += record.payload.len() as u64;
                progress(sent, total);
            }

            if region == MemoryRegion::Internal {
                self.set_reset(true)?;
            }
        }

        info!(
            internal = stats.internal_records,
            external = stats.external_records,
            bytes = stats.total_bytes(),
            "Image downloaded"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Direction, Record};
    use crate::transport::MockTransport;

    fn image(records: &[(u16, Vec<u8>)], terminate: bool) -> FirmwareImage {
        let mut data = Vec::new();
        for (addr, payload) in records {
            Record::encode(*addr, 0, payload, &mut data);
        }
        if terminate {
            Record::encode(0, 1, &[], &mut data);
        }
        FirmwareImage::from_bytes("test", data).unwrap()
    }

    fn cpucs_writes(mock: &MockTransport) -> Vec<u8> {
        mock.control_outs()
            .into_iter()
            .filter(|(s, _)| s.request == ANCHOR_LOAD_INTERNAL && s.value == CPUCS_REG)
            .map(|(_, d)| d[0])
            .collect()
    }

    #[test]
    fn test_each_payload_sent_once_with_region_request() {
        let records = vec![
            (0x2000, vec![0xE0; 4]),
            (0x0000, vec![0x02, 0x00, 0x80]),
            (0x1B3F, vec![0x11]),
            (0x1B40, vec![0x22, 0x33]),
            (0x0100, vec![0x44]),
        ];
        let mock = MockTransport::new();
        let mut loader = EzUsbLoader::new(&mock);
        let stats = loader.download(&image(&records, true), |_, _| {}).unwrap();

        let loads: Vec<_> = mock
            .control_outs()
            .into_iter()
            .filter(|(s, _)| s.value != CPUCS_REG)
            .collect();
        assert_eq!(loads.len(), records.len());

        for (addr, payload) in &records {
            let hits: Vec<_> = loads.iter().filter(|(s, _)| s.value == *addr).collect();
            assert_eq!(hits.len(), 1, "address 0x{:04X}", addr);
            let (setup, data) = hits[0];
            assert_eq!(data, payload);
            assert_eq!(setup.direction, Direction::Out);
            assert_eq!(setup.request_type(), 0x40);
            assert_eq!(setup.index, 0);
            let expected = if *addr <= 0x1B3F { 0xA0 } else { 0xA3 };
            assert_eq!(setup.request, expected);
        }

        // Internal pass completes before any external transfer.
        let first_external = loads.iter().position(|(s, _)| s.request == 0xA3).unwrap();
        assert!(loads[..first_external].iter().all(|(s, _)| s.request == 0xA0));
        assert!(loads[first_external..].iter().all(|(s, _)| s.request == 0xA3));

        assert_eq!(stats.internal_records, 3);
        assert_eq!(stats.external_records, 2);
        assert_eq!(stats.total_bytes(), 11);
    }

    #[test]
    fn test_reset_held_after_internal_pass() {
        let mock = MockTransport::new();
        let mut loader = EzUsbLoader::new(&mock);
        loader
            .download(&image(&[(0x3000, vec![1])], true), |_, _| {})
            .unwrap();

        let ops = mock.control_outs();
        // No internal records: the hold is still issued, before the external load.
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].0.value, CPUCS_REG);
        assert_eq!(ops[0].1, vec![1]);
        assert_eq!(ops[1].0.request, ANCHOR_LOAD_EXTERNAL);
        assert_eq!(loader.cpu_state(), Some(CpuState::Held));
    }

    #[test]
    fn test_terminator_halts_pass() {
        let mut data = Vec::new();
        Record::encode(0x0010, 0, &[1], &mut data);
        Record::encode(0x0000, 1, &[], &mut data);
        // A well-formed data record after the terminator must never be sent.
        Record::encode(0x0020, 0, &[2], &mut data);
        let img = FirmwareImage::from_bytes("t", data).unwrap();

        let mock = MockTransport::new();
        EzUsbLoader::new(&mock).download(&img, |_, _| {}).unwrap();
        assert!(mock.control_outs().iter().all(|(s, _)| s.value != 0x0020));
    }

    #[test]
    fn test_redundant_reset_writes_skipped() {
        let mock = MockTransport::new();
        let mut loader = EzUsbLoader::new(&mock);
        loader.set_reset(true).unwrap();
        loader.set_reset(true).unwrap();
        loader.set_reset(false).unwrap();
        loader.set_reset(false).unwrap();
        assert_eq!(cpucs_writes(&mock), vec![1, 0]);
    }

    #[test]
    fn test_transfer_failure_propagates() {
        let mock = MockTransport::new();
        mock.fail_control_out_at(1);
        let img = image(&[(0x0000, vec![1]), (0x0001, vec![2])], false);
        let err = EzUsbLoader::new(&mock).download(&img, |_, _| {}).unwrap_err();
        assert!(matches!(err, LoadError::Transport(_)));
        assert_eq!(mock.control_outs().len(), 1);
    }

    #[test]
    fn test_progress_reaches_total() {
        let mock = MockTransport::new();
        let img = image(&[(0x0000, vec![0; 10]), (0x4000, vec![0; 6])], true);
        let mut last = (0, 0);
        EzUsbLoader::new(&mock)
            .download(&img, |cur, total| last = (cur, total))
            .unwrap();
        assert_eq!(last, (16, 16));
    }
}
