//! IntelliKeys command opcodes and report framing.

use std::fmt;

use super::constants::REPORT_SIZE;

/// Command opcodes understood by the programmed firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    GetVersion = 1,
    Led = 2,
    Scan = 3,
    Tone = 4,
    GetEvent = 5,
    Init = 6,
    EepromRead = 7,
    EepromWrite = 8,
    OnOffSwitch = 9,
    Correct = 10,
    EepromReadByte = 11,
    ResetDevice = 12,
    StartAuto = 13,
    StopAuto = 14,
    AllLeds = 15,
    StartOutput = 16,
    StopOutput = 17,
    AllSensors = 18,
}

impl Command {
    pub const ALL: [Command; 18] = [
        Command::GetVersion,
        Command::Led,
        Command::Scan,
        Command::Tone,
        Command::GetEvent,
        Command::Init,
        Command::EepromRead,
        Command::EepromWrite,
        Command::OnOffSwitch,
        Command::Correct,
        Command::EepromReadByte,
        Command::ResetDevice,
        Command::StartAuto,
        Command::StopAuto,
        Command::AllLeds,
        Command::StartOutput,
        Command::StopOutput,
        Command::AllSensors,
    ];

    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.opcode() == opcode)
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::GetVersion => "GET_VERSION",
            Command::Led => "LED",
            Command::Scan => "SCAN",
            Command::Tone => "TONE",
            Command::GetEvent => "GET_EVENT",
            Command::Init => "INIT",
            Command::EepromRead => "EEPROM_READ",
            Command::EepromWrite => "EEPROM_WRITE",
            Command::OnOffSwitch => "ONOFFSWITCH",
            Command::Correct => "CORRECT",
            Command::EepromReadByte => "EEPROM_READBYTE",
            Command::ResetDevice => "RESET_DEVICE",
            Command::StartAuto => "START_AUTO",
            Command::StopAuto => "STOP_AUTO",
            Command::AllLeds => "ALL_LEDS",
            Command::StartOutput => "START_OUTPUT",
            Command::StopOutput => "STOP_OUTPUT",
            Command::AllSensors => "ALL_SENSORS",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Outbound command report: `[opcode, data, 0, 0, 0, 0, 0, 0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandReport([u8; REPORT_SIZE]);

impl CommandReport {
    pub fn new(command: Command, data: u8) -> Self {
        let mut buf = [0u8; REPORT_SIZE];
        buf[0] = command.opcode();
        buf[1] = data;
        Self(buf)
    }

    pub fn as_bytes(&self) -> &[u8; REPORT_SIZE] {
        &self.0
    }

    /// Report bytes as written to the endpoint, with the report ID prefixed when non-zero.
    pub fn framed(&self, report_id: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(REPORT_SIZE + 1);
        if report_id > 0 {
            out.push(report_id);
        }
        out.extend_from_slice(&self.0);
        out
    }
}

/// Inbound response read from the status endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Response([u8; REPORT_SIZE]);

impl Response {
    pub fn from_bytes(bytes: [u8; REPORT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; REPORT_SIZE] {
        &self.0
    }

    /// First byte of the response.
    pub fn code(&self) -> u8 {
        self.0[0]
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Response({})", self)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}
