use std::fmt;

use crate::error::{Result, WireError};

/// Request opcodes understood by the radar controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    SetRadarChan = b'R',
    QueryIniSettings = b'i',
    GetParameters = b'c',
    SetParameters = b'C',
    RequestClearFreqSearch = b'<',
    RequestAssignedFreq = b'>',
    RegisterSeq = b'+',
    SetActive = b'A',
    SetInactive = b'a',
    SetReadyFlag = b'1',
    GetData = b'd',
    Ping = b'=',
    Quit = b'.',
}

impl Opcode {
    pub const ALL: [Opcode; 13] = [
        Self::SetRadarChan,
        Self::QueryIniSettings,
        Self::GetParameters,
        Self::SetParameters,
        Self::RequestClearFreqSearch,
        Self::RequestAssignedFreq,
        Self::RegisterSeq,
        Self::SetActive,
        Self::SetInactive,
        Self::SetReadyFlag,
        Self::GetData,
        Self::Ping,
        Self::Quit,
    ];

    pub fn from_byte(b: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_byte() == b)
            .ok_or(WireError::UnknownOpcode { code: b })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SetRadarChan => "SET_RADAR_CHAN",
            Self::QueryIniSettings => "QUERY_INI_SETTINGS",
            Self::GetParameters => "GET_PARAMETERS",
            Self::SetParameters => "SET_PARAMETERS",
            Self::RequestClearFreqSearch => "REQUEST_CLEAR_FREQ_SEARCH",
            Self::RequestAssignedFreq => "REQUEST_ASSIGNED_FREQ",
            Self::RegisterSeq => "REGISTER_SEQ",
            Self::SetActive => "SET_ACTIVE",
            Self::SetInactive => "SET_INACTIVE",
            Self::SetReadyFlag => "SET_READY_FLAG",
            Self::GetData => "GET_DATA",
            Self::Ping => "PING",
            Self::Quit => "QUIT",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
