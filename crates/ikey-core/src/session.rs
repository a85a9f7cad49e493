//! IntelliKeys session - top-level driver for device bring-up.
//!
//! Every step (re)acquires the first device with the IntelliTools vendor ID,
//! then either downloads firmware into an unprogrammed part or runs the
//! command-protocol bring-up on a programmed one. The session never finishes
//! on its own: after a download the device re-enumerates and is picked up
//! again, and after bring-up the session holds until the device detaches.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::channel::{ChannelConfig, CommandChannel};
use crate::descriptor::collect_diagnostics;
use crate::events::{IkEvent, IkObserver, LogLevel, TracingObserver};
use crate::firmware::{FirmwareImage, FirmwareSet};
use crate::loader::EzUsbLoader;
use crate::protocol::constants::REQ_SET_INTERFACE;
use crate::protocol::{Command, ControlSetup, Response};
use crate::state::{DeviceKind, SessionState, StepOutcome, select_device};
use crate::transport::{DeviceIdentity, ObservableTransport, UsbBus, UsbTransport};

/// What to do when a diagnostic descriptor read fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticsPolicy {
    /// Fail the bring-up step.
    Strict,
    /// Log the failure and carry on.
    #[default]
    BestEffort,
    /// Do not read descriptors at all.
    Skip,
}

impl fmt::Display for DiagnosticsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticsPolicy::Strict => write!(f, "strict"),
            DiagnosticsPolicy::BestEffort => write!(f, "best-effort"),
            DiagnosticsPolicy::Skip => write!(f, "skip"),
        }
    }
}

impl FromStr for DiagnosticsPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(DiagnosticsPolicy::Strict),
            "best-effort" => Ok(DiagnosticsPolicy::BestEffort),
            "skip" => Ok(DiagnosticsPolicy::Skip),
            other => Err(format!(
                "unknown diagnostics policy '{}' (expected strict, best-effort or skip)",
                other
            )),
        }
    }
}

/// Configuration for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path to the loader image.
    pub loader_path: Option<String>,
    /// Path to the main firmware image.
    pub firmware_path: Option<String>,
    /// Descriptor read failure handling.
    pub diagnostics: DiagnosticsPolicy,
    /// HID report ID prefixed to command reports (0 = none).
    pub report_id: u8,
    /// Command response read timeout.
    pub response_timeout_ms: u64,
    /// Timeout for control transfers and report writes.
    pub control_timeout_ms: u64,
    /// Pause between SCAN and ALL_SENSORS.
    pub scan_settle_ms: u64,
    /// Pause after a download while the device re-enumerates.
    pub reenumerate_delay_ms: u64,
    /// Initial device discovery poll interval.
    pub poll_interval_ms: u64,
    /// Discovery backoff cap.
    pub max_poll_interval_ms: u64,
    /// Give up discovery after this long; unset searches forever.
    pub discovery_timeout_secs: Option<u64>,
    /// Detach check interval once the device is up.
    pub hold_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loader_path: None,
            firmware_path: None,
            diagnostics: DiagnosticsPolicy::default(),
            report_id: 0,
            response_timeout_ms: 2,
            control_timeout_ms: 1000,
            scan_settle_ms: 250,
            reenumerate_delay_ms: 2000,
            poll_interval_ms: 100,
            max_poll_interval_ms: 2000,
            discovery_timeout_secs: None,
            hold_poll_ms: 1000,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            report_id: self.report_id,
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            ..Default::default()
        }
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    /// Load both firmware images named by the configuration.
    pub fn load_images(&self) -> Result<FirmwareSet> {
        let loader = self
            .loader_path
            .as_deref()
            .ok_or_else(|| anyhow!("No loader image configured"))?;
        let firmware = self
            .firmware_path
            .as_deref()
            .ok_or_else(|| anyhow!("No firmware image configured"))?;
        FirmwareSet::load(loader, firmware)
            .with_context(|| format!("Loading images {} and {}", loader, firmware))
    }
}

/// Exponential discovery backoff.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// IntelliKeys session - owns the device handle across attach cycles.
pub struct IkSession<B: UsbBus, O: IkObserver> {
    config: SessionConfig,
    bus: B,
    observer: Arc<O>,
    images: FirmwareSet,
    state: SessionState,
    device: Option<B::Transport>,
    identity: Option<DeviceIdentity>,
    ready: bool,
}

impl<B: UsbBus> IkSession<B, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig, bus: B, images: FirmwareSet) -> Self {
        Self::with_observer(config, bus, images, Arc::new(TracingObserver))
    }
}

impl<B: UsbBus, O: IkObserver> IkSession<B, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(
        config: SessionConfig,
        bus: B,
        images: FirmwareSet,
        observer: Arc<O>,
    ) -> Self {
        Self {
            config,
            bus,
            observer,
            images,
            state: SessionState::Searching,
            device: None,
            identity: None,
            ready: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether a device handle is currently held.
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    fn emit(&self, event: IkEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(IkEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn goto(&mut self, to: SessionState) {
        if self.state != to {
            let from = self.state;
            self.state = to;
            self.emit(IkEvent::StateChanged { from, to });
        }
    }

    /// Drop the device handle.
    fn release(&mut self) {
        self.identity = None;
        self.ready = false;
        if self.device.take().is_some() {
            self.emit(IkEvent::DeviceDisconnected);
        }
    }

    fn scan(&self) -> Result<Option<DeviceIdentity>> {
        let devices = self.bus.list_devices()?;
        for d in &devices {
            trace!(device = %d, "Enumerated");
        }
        Ok(select_device(&devices).cloned())
    }

    /// Run one iteration of the session loop.
    ///
    /// On error the device handle is released and the session is back in
    /// `Searching`, so the next step starts from a fresh scan.
    pub fn step(&mut self) -> Result<StepOutcome> {
        match self.step_inner() {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.emit(IkEvent::Error {
                    message: format!("{:#}", e),
                });
                self.release();
                self.goto(SessionState::Searching);
                Err(e)
            }
        }
    }

    fn step_inner(&mut self) -> Result<StepOutcome> {
        if self.device.is_none() {
            let Some(identity) = self.scan()? else {
                return Ok(StepOutcome::NoDevice);
            };
            let kind = DeviceKind::from_product_id(identity.product_id);
            if let DeviceKind::Unknown(product_id) = kind {
                debug!(device = %identity, "Ignoring device with unknown product ID");
                return Ok(StepOutcome::Unhandled { product_id });
            }

            let transport = self.bus.open(&identity)?;
            self.emit(IkEvent::DeviceConnected {
                vid: transport.vendor_id(),
                pid: transport.product_id(),
            });
            self.device = Some(transport);
            self.identity = Some(identity);
            self.ready = false;
        }

        let product_id = self
            .device
            .as_ref()
            .map(|d| d.product_id())
            .ok_or_else(|| anyhow!("Device handle lost"))?;

        match DeviceKind::from_product_id(product_id) {
            DeviceKind::Unprogrammed => {
                self.goto(SessionState::LoaderPresent);
                self.load_firmware()?;
                info!("Firmware loaded, waiting for re-enumeration");
                self.release();
                self.goto(SessionState::Searching);
                thread::sleep(Duration::from_millis(self.config.reenumerate_delay_ms));
                Ok(StepOutcome::FirmwareLoaded)
            }
            DeviceKind::Programmed if !self.ready => {
                self.goto(SessionState::Programmed);
                info!("Re-enumerated with loaded firmware");
                let version = self.bring_up()?;
                self.ready = true;
                self.emit(IkEvent::Ready);
                Ok(StepOutcome::Ready { version })
            }
            DeviceKind::Programmed => self.hold(),
            DeviceKind::Unknown(product_id) => {
                self.release();
                Ok(StepOutcome::Unhandled { product_id })
            }
        }
    }

    /// SET_INTERFACE, then loader and firmware images bracketed by CPU reset.
    #[instrument(skip(self))]
    fn load_firmware(&self) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| anyhow!("No device to load"))?;
        let transport = ObservableTransport::new(device, self.observer.as_ref());

        transport
            .control_out(ControlSetup::standard_out(REQ_SET_INTERFACE, 0, 0), &[])
            .context("SET_INTERFACE")?;

        let mut loader = EzUsbLoader::new(&transport);
        loader.set_reset(true)?;

        info!(image = %self.images.loader.name(), "Loading loader");
        loader.download(&self.images.loader, |current, total| {
            self.progress(&self.images.loader, current, total)
        })?;
        loader.set_reset(false)?;

        info!(image = %self.images.firmware.name(), "Loading firmware");
        loader.download(&self.images.firmware, |current, total| {
            self.progress(&self.images.firmware, current, total)
        })?;
        // Restart the core from the freshly loaded external code.
        loader.set_reset(true)?;
        loader.set_reset(false)?;

        self.log(LogLevel::Info, "Firmware loaded");
        Ok(())
    }

    fn progress(&self, image: &FirmwareImage, current: u64, total: u64) {
        self.emit(IkEvent::Progress {
            image: image.name().to_string(),
            current,
            total,
        });
    }

    /// Diagnostics, then INIT, SCAN(1), ALL_SENSORS, GET_VERSION.
    #[instrument(skip(self))]
    fn bring_up(&self) -> Result<Response> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| anyhow!("No device to initialize"))?;
        let transport = ObservableTransport::new(device, self.observer.as_ref());

        let policy = self.config.diagnostics;
        if policy != DiagnosticsPolicy::Skip {
            let diag = collect_diagnostics(&transport, |what, e| {
                if policy == DiagnosticsPolicy::Strict {
                    return Err(e);
                }
                warn!(descriptor = what, error = %e, "Skipping descriptor");
                Ok(())
            })
            .context("Reading descriptors")?;

            info!(
                manufacturer = diag.manufacturer.as_deref().unwrap_or("?"),
                product = diag.product.as_deref().unwrap_or("?"),
                "Device strings"
            );
            if let Some(dev) = &diag.device {
                self.emit(IkEvent::Descriptor {
                    kind: "device".into(),
                    data: dev.clone(),
                });
            }
            if let Some(config) = &diag.configuration {
                self.emit(IkEvent::Descriptor {
                    kind: "configuration".into(),
                    data: config.clone(),
                });
            }
            for (i, report) in diag.hid_reports.iter().enumerate() {
                self.emit(IkEvent::Descriptor {
                    kind: format!("hid report {}", i),
                    data: report.clone(),
                });
            }
        }

        let channel = CommandChannel::new(&transport, self.config.channel_config());
        self.command(&channel, Command::Init, 0)?;
        self.command(&channel, Command::Scan, 1)?;
        thread::sleep(Duration::from_millis(self.config.scan_settle_ms));
        self.command(&channel, Command::AllSensors, 0)?;
        let version = self.command(&channel, Command::GetVersion, 0)?;
        Ok(version)
    }

    fn command<T: UsbTransport + ?Sized>(
        &self,
        channel: &CommandChannel<'_, T>,
        command: Command,
        data: u8,
    ) -> Result<Response> {
        self.emit(IkEvent::CommandSent { command, data });
        let response = channel.send_command(command, data)?;
        self.emit(IkEvent::ResponseReceived { command, response });
        Ok(response)
    }

    /// Idle until the initialized device disappears from the bus.
    fn hold(&mut self) -> Result<StepOutcome> {
        let devices = self.bus.list_devices()?;
        let attached = self
            .identity
            .as_ref()
            .is_some_and(|id| devices.iter().any(|d| d == id));

        if attached {
            thread::sleep(Duration::from_millis(self.config.hold_poll_ms));
            return Ok(StepOutcome::Idle);
        }

        info!("Device detached");
        self.release();
        self.goto(SessionState::Searching);
        Ok(StepOutcome::Detached)
    }

    /// Run forever. Returns only if the discovery timeout expires.
    pub fn run(&mut self) -> Result<()> {
        self.drive(false).map(|_| ())
    }

    /// Run until a programmed device has been initialized.
    pub fn run_until_ready(&mut self) -> Result<Response> {
        self.drive(true)?
            .ok_or_else(|| anyhow!("Session ended before the device was ready"))
    }

    fn drive(&mut self, stop_when_ready: bool) -> Result<Option<Response>> {
        info!("Waiting for device...");
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.poll_interval_ms),
            Duration::from_millis(self.config.max_poll_interval_ms),
        );
        let timeout = self.config.discovery_timeout_secs.map(Duration::from_secs);
        let mut searching_since = Instant::now();
        let mut poll_count = 0u64;

        loop {
            match self.step() {
                Ok(StepOutcome::NoDevice) | Ok(StepOutcome::Unhandled { .. }) => {
                    poll_count += 1;
                    if let Some(limit) = timeout
                        && searching_since.elapsed() > limit
                    {
                        bail!(
                            "Timeout waiting for device after {}s ({} polls)",
                            limit.as_secs(),
                            poll_count
                        );
                    }
                    thread::sleep(backoff.next_delay());
                }
                Ok(StepOutcome::Ready { version }) => {
                    info!(version = %version, "Device ready");
                    if stop_when_ready {
                        return Ok(Some(version));
                    }
                    backoff.reset();
                }
                Ok(StepOutcome::Idle) => {}
                Ok(outcome) => {
                    debug!(?outcome, "Step complete");
                    backoff.reset();
                    searching_since = Instant::now();
                    poll_count = 0;
                }
                Err(e) => {
                    poll_count += 1;
                    if let Some(limit) = timeout
                        && searching_since.elapsed() > limit
                    {
                        return Err(e.context(format!(
                            "Timeout waiting for device after {}s ({} polls)",
                            limit.as_secs(),
                            poll_count
                        )));
                    }
                    warn!(error = %format!("{:#}", e), "Session step failed, searching again");
                    thread::sleep(backoff.next_delay());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::events::tests::RecordingObserver;
    use crate::protocol::constants::{ANCHOR_LOAD_INTERNAL, CPUCS_REG};
    use crate::protocol::Record;
    use crate::transport::{MockBus, UsbOp};

    const VID: u16 = 0x095E;

    fn images() -> FirmwareSet {
        let mut loader = Vec::new();
        Record::encode(0x0000, 0, &[0x02, 0x01, 0x00], &mut loader);
        Record::encode(0x0100, 0, &[0x75, 0x81, 0x40], &mut loader);
        Record::encode(0x0000, 1, &[], &mut loader);

        let mut firmware = Vec::new();
        Record::encode(0x2000, 0, &[0xAA; 8], &mut firmware);
        Record::encode(0x0200, 0, &[0x55; 4], &mut firmware);
        Record::encode(0x0000, 1, &[], &mut firmware);

        FirmwareSet {
            loader: FirmwareImage::from_bytes("loader", loader).unwrap(),
            firmware: FirmwareImage::from_bytes("firmware", firmware).unwrap(),
        }
    }

    fn config(diagnostics: DiagnosticsPolicy) -> SessionConfig {
        SessionConfig {
            diagnostics,
            scan_settle_ms: 0,
            reenumerate_delay_ms: 0,
            poll_interval_ms: 0,
            max_poll_interval_ms: 0,
            hold_poll_ms: 0,
            ..Default::default()
        }
    }

    fn queue_responses(bus: &MockBus) {
        for code in [6u8, 3, 18, 1] {
            bus.transport().queue_read(&[code, 0, 0, 0, 0, 0, 0, 0]);
        }
    }

    fn session(
        bus: MockBus,
        diagnostics: DiagnosticsPolicy,
    ) -> (IkSession<MockBus, RecordingObserver>, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let session =
            IkSession::with_observer(config(diagnostics), bus, images(), Arc::clone(&observer));
        (session, observer)
    }

    #[test]
    fn test_load_then_bring_up() {
        let bus = MockBus::new(vec![
            vec![MockBus::device(VID, 0x0100)],
            vec![MockBus::device(VID, 0x0101)],
        ]);
        queue_responses(&bus);
        let (mut session, _) = session(bus, DiagnosticsPolicy::Skip);

        assert_eq!(session.step().unwrap(), StepOutcome::FirmwareLoaded);
        assert_eq!(session.state(), SessionState::Searching);
        assert!(!session.has_device());

        let outcome = session.step().unwrap();
        assert!(matches!(outcome, StepOutcome::Ready { version } if version.code() == 1));
        assert_eq!(session.state(), SessionState::Programmed);

        let ops = session.bus.transport().ops();

        // Exactly one load sequence, opened by SET_INTERFACE(0).
        let set_interface: Vec<_> = ops
            .iter()
            .filter(|op| {
                matches!(op, UsbOp::ControlOut { setup, .. } if setup.request == REQ_SET_INTERFACE)
            })
            .collect();
        assert_eq!(set_interface.len(), 1);
        match &ops[0] {
            UsbOp::ControlOut { setup, data } => {
                assert_eq!(setup.request_type(), 0x00);
                assert_eq!(setup.request, 11);
                assert_eq!(setup.value, 0);
                assert_eq!(setup.index, 0);
                assert!(data.is_empty());
            }
            other => panic!("unexpected first op {:?}", other),
        }

        // Commands follow the download, in order.
        let writes: Vec<_> = ops
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match op {
                UsbOp::Write { data, .. } => Some((i, data[0], data[1])),
                _ => None,
            })
            .collect();
        let opcodes: Vec<_> = writes.iter().map(|&(_, op, data)| (op, data)).collect();
        assert_eq!(opcodes, vec![(6, 0), (3, 1), (18, 0), (1, 0)]);
        let last_control = ops
            .iter()
            .rposition(|op| matches!(op, UsbOp::ControlOut { .. }))
            .unwrap();
        assert!(writes[0].0 > last_control);

        assert_eq!(
            session.bus.opened(),
            vec![MockBus::device(VID, 0x0100), MockBus::device(VID, 0x0101)]
        );
    }

    #[test]
    fn test_reset_bracketing() {
        let bus = MockBus::new(vec![vec![MockBus::device(VID, 0x0100)]]);
        let (mut session, _) = session(bus, DiagnosticsPolicy::Skip);
        session.step().unwrap();

        let cpucs: Vec<u8> = session
            .bus
            .transport()
            .control_outs()
            .into_iter()
            .filter(|(s, _)| s.request == ANCHOR_LOAD_INTERNAL && s.value == CPUCS_REG)
            .map(|(_, d)| d[0])
            .collect();
        assert_eq!(cpucs, vec![1, 0, 1, 0]);
    }

    #[test]
    fn test_unknown_product_stays_searching() {
        let bus = MockBus::new(vec![vec![MockBus::device(VID, 0x0200)]]);
        let (mut session, _) = session(bus, DiagnosticsPolicy::BestEffort);

        for _ in 0..3 {
            assert_eq!(
                session.step().unwrap(),
                StepOutcome::Unhandled { product_id: 0x0200 }
            );
            assert_eq!(session.state(), SessionState::Searching);
        }
        assert!(session.bus.transport().ops().is_empty());
        assert!(session.bus.opened().is_empty());
    }

    #[test]
    fn test_other_vendor_ignored() {
        let bus = MockBus::new(vec![vec![MockBus::device(0x046D, 0x0100)]]);
        let (mut session, _) = session(bus, DiagnosticsPolicy::BestEffort);
        assert_eq!(session.step().unwrap(), StepOutcome::NoDevice);
        assert!(session.bus.opened().is_empty());
    }

    #[test]
    fn test_command_timeout_falls_back_to_searching() {
        let bus = MockBus::new(vec![vec![MockBus::device(VID, 0x0101)]]);
        let (mut session, observer) = session(bus, DiagnosticsPolicy::Skip);

        // No responses queued: INIT times out.
        assert!(session.step().is_err());
        assert_eq!(session.state(), SessionState::Searching);
        assert!(!session.has_device());
        assert!(
            observer
                .events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, IkEvent::Error { .. }))
        );

        // Next step re-acquires from scratch and succeeds.
        queue_responses(&session.bus);
        assert!(matches!(session.step().unwrap(), StepOutcome::Ready { .. }));
        assert_eq!(session.bus.opened().len(), 2);
    }

    #[test]
    fn test_load_failure_releases_device() {
        let bus = MockBus::new(vec![vec![MockBus::device(VID, 0x0100)]]);
        bus.transport().fail_control_out_at(2);
        let (mut session, _) = session(bus, DiagnosticsPolicy::Skip);

        assert!(session.step().is_err());
        assert_eq!(session.state(), SessionState::Searching);
        assert!(!session.has_device());
    }

    #[test]
    fn test_diagnostics_policies() {
        // Strict: stalled descriptor reads fail the bring-up.
        let bus = MockBus::new(vec![vec![MockBus::device(VID, 0x0101)]]);
        queue_responses(&bus);
        let (mut strict, _) = session(bus, DiagnosticsPolicy::Strict);
        assert!(strict.step().is_err());
        assert!(strict.bus.transport().writes().is_empty());

        // Best effort: the same stalls are skipped and commands still run.
        let bus = MockBus::new(vec![vec![MockBus::device(VID, 0x0101)]]);
        queue_responses(&bus);
        let (mut lenient, _) = session(bus, DiagnosticsPolicy::BestEffort);
        assert!(matches!(lenient.step().unwrap(), StepOutcome::Ready { .. }));
        let control_ins = lenient
            .bus
            .transport()
            .ops()
            .iter()
            .filter(|op| matches!(op, UsbOp::ControlIn { .. }))
            .count();
        assert_eq!(control_ins, 7);
        assert_eq!(lenient.bus.transport().writes().len(), 4);
    }

    #[test]
    fn test_hold_until_detach() {
        let programmed = MockBus::device(VID, 0x0101);
        let bus = MockBus::new(vec![vec![programmed.clone()], vec![programmed], vec![]]);
        queue_responses(&bus);
        let (mut session, observer) = session(bus, DiagnosticsPolicy::Skip);

        assert!(matches!(session.step().unwrap(), StepOutcome::Ready { .. }));
        assert_eq!(session.step().unwrap(), StepOutcome::Idle);
        assert_eq!(session.step().unwrap(), StepOutcome::Detached);
        assert_eq!(session.state(), SessionState::Searching);
        assert_eq!(session.step().unwrap(), StepOutcome::NoDevice);

        // Idle steps send nothing further.
        assert_eq!(session.bus.transport().writes().len(), 4);
        let events = observer.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e, IkEvent::Ready)));
        assert!(events.iter().any(|e| matches!(e, IkEvent::DeviceDisconnected)));
    }

    #[test]
    fn test_run_until_ready() {
        let bus = MockBus::new(vec![
            vec![],
            vec![MockBus::device(VID, 0x0100)],
            vec![],
            vec![MockBus::device(VID, 0x0101)],
        ]);
        queue_responses(&bus);
        let (mut session, observer) = session(bus, DiagnosticsPolicy::Skip);

        let version = session.run_until_ready().unwrap();
        assert_eq!(version.code(), 1);

        let events = observer.events.lock().unwrap();
        let progress_done = events.iter().any(|e| {
            matches!(e, IkEvent::Progress { image, current, total }
                if image == "firmware" && current == total && *total == 12)
        });
        assert!(progress_done);
        let states: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                IkEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::LoaderPresent,
                SessionState::Searching,
                SessionState::Programmed
            ]
        );
    }

    #[test]
    fn test_discovery_timeout() {
        let bus = MockBus::new(vec![vec![]]);
        let observer = Arc::new(NullObserver);
        let config = SessionConfig {
            discovery_timeout_secs: Some(0),
            poll_interval_ms: 1,
            max_poll_interval_ms: 1,
            ..Default::default()
        };
        let mut session = IkSession::with_observer(config, bus, images(), observer);
        let err = session.run().unwrap_err();
        assert!(err.to_string().contains("Timeout waiting for device"));
    }

    #[test]
    fn test_discovery_timeout_with_failing_steps() {
        let bus = MockBus::new(vec![vec![MockBus::device(VID, 0x0100)]]);
        bus.transport().fail_control_out_at(0);
        let observer = Arc::new(NullObserver);
        let config = SessionConfig {
            discovery_timeout_secs: Some(0),
            poll_interval_ms: 1,
            max_poll_interval_ms: 1,
            ..Default::default()
        };
        let mut session = IkSession::with_observer(config, bus, images(), observer);

        let err = session.run().unwrap_err();
        assert!(err.to_string().contains("Timeout waiting for device"));
        assert!(format!("{:#}", err).contains("injected failure"));
        assert_eq!(session.state(), SessionState::Searching);
        assert!(!session.has_device());
        assert!(!session.bus.opened().is_empty());
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<_> = (0..4).map(|_| b.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
        b.reset();
        assert_eq!(b.next_delay().as_millis(), 100);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = SessionConfig {
            loader_path: Some("loader.hex".into()),
            firmware_path: Some("firmware.hex".into()),
            diagnostics: DiagnosticsPolicy::Strict,
            discovery_timeout_secs: Some(30),
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("diagnostics = \"strict\""));
        let parsed: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);

        // Missing keys take defaults.
        let partial: SessionConfig = toml::from_str("report_id = 0\n").unwrap();
        assert_eq!(partial, SessionConfig::default());
        assert_eq!(partial.response_timeout_ms, 2);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("skip".parse::<DiagnosticsPolicy>(), Ok(DiagnosticsPolicy::Skip));
        assert_eq!(
            "best-effort".parse::<DiagnosticsPolicy>(),
            Ok(DiagnosticsPolicy::BestEffort)
        );
        assert!("loud".parse::<DiagnosticsPolicy>().is_err());
    }

    #[test]
    fn test_load_images_requires_paths() {
        let err = SessionConfig::default().load_images().unwrap_err();
        assert!(err.to_string().contains("No loader image"));
    }

    #[test]
    fn test_load_images_from_files() {
        let dir = std::env::temp_dir();
        let loader = dir.join(format!("ikey-session-{}-loader.hex", std::process::id()));
        let firmware = dir.join(format!("ikey-session-{}-firmware.bin", std::process::id()));
        std::fs::write(&loader, ":0300000002000BF0\n:00000001FF\n").unwrap();
        std::fs::write(&firmware, images().firmware.data()).unwrap();

        let config = SessionConfig {
            loader_path: Some(loader.display().to_string()),
            firmware_path: Some(firmware.display().to_string()),
            ..Default::default()
        };
        let set = config.load_images().unwrap();
        assert_eq!(set.loader.payload_len(), 3);
        assert_eq!(set.firmware.payload_len(), 12);

        std::fs::remove_file(&firmware).unwrap();
        let err = config.load_images().unwrap_err();
        assert!(err.to_string().contains("Loading images"));
        std::fs::remove_file(&loader).unwrap();
    }
}
