//! Controller requests and their payload blocks.
//!
//! Every exchange is one [`Request`] (header followed by payload) answered by
//! a typed response payload and a trailing status header. Response payloads
//! are read field by field by the session functions in [`crate::seq`], since
//! their length depends on earlier fields (sample counts, transmitter counts).

pub mod clrfreq;
pub mod data;
pub mod params;
pub mod scan;
pub mod sequence;
pub mod settings;

use crate::codec;
use crate::frame::Header;
use crate::opcode::Opcode;

/// A request sent to the controller.
#[derive(Debug, Clone)]
pub enum Request {
    SetRadarChan { radar: i32, channel: i32 },
    QueryIniSettings(settings::IniQuery),
    GetParameters,
    SetParameters(params::ControlParameters),
    RequestClearFreqSearch(clrfreq::ClearFreqParameters),
    RequestAssignedFreq,
    RegisterSeq(Box<sequence::SequenceRegistration>),
    SetActive(scan::ScanStart),
    SetInactive,
    SetReadyFlag,
    GetData,
    Ping,
    Quit,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::SetRadarChan { .. } => Opcode::SetRadarChan,
            Request::QueryIniSettings(_) => Opcode::QueryIniSettings,
            Request::GetParameters => Opcode::GetParameters,
            Request::SetParameters(_) => Opcode::SetParameters,
            Request::RequestClearFreqSearch(_) => Opcode::RequestClearFreqSearch,
            Request::RequestAssignedFreq => Opcode::RequestAssignedFreq,
            Request::RegisterSeq(_) => Opcode::RegisterSeq,
            Request::SetActive(_) => Opcode::SetActive,
            Request::SetInactive => Opcode::SetInactive,
            Request::SetReadyFlag => Opcode::SetReadyFlag,
            Request::GetData => Opcode::GetData,
            Request::Ping => Opcode::Ping,
            Request::Quit => Opcode::Quit,
        }
    }

    /// Request payload, without the header.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Request::SetRadarChan { radar, channel } => {
                let mut buf = Vec::with_capacity(8);
                codec::write_i32(&mut buf, *radar);
                codec::write_i32(&mut buf, *channel);
                buf
            }
            Request::QueryIniSettings(q) => q.encode(),
            Request::SetParameters(p) => p.encode(),
            Request::RequestClearFreqSearch(p) => p.encode(),
            Request::RegisterSeq(r) => r.encode(),
            Request::SetActive(s) => s.encode(),
            Request::GetParameters
            | Request::RequestAssignedFreq
            | Request::SetInactive
            | Request::SetReadyFlag
            | Request::GetData
            | Request::Ping
            | Request::Quit => vec![],
        }
    }

    /// Full wire encoding: header then payload.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut wire = Vec::with_capacity(crate::frame::HEADER_LEN + payload.len());
        wire.extend_from_slice(&Header::request(self.opcode()).encode());
        wire.extend_from_slice(&payload);
        wire
    }

    /// Format as a hex debug line: `"SET_PARAMETERS 46B | 0102..."`.
    pub fn debug_hex(&self) -> String {
        let payload = self.payload();
        let mut s = format!("{} {}B", self.opcode(), payload.len());
        if !payload.is_empty() {
            s.push_str(" | ");
            let limit = 20;
            for b in payload.iter().take(limit) {
                s.push_str(&format!("{b:02X}"));
            }
            if payload.len() > limit {
                s.push_str("...");
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_request_is_bare_header() {
        assert_eq!(Request::Ping.encode(), vec![b'=', 0, 0, 0, 0]);
        assert_eq!(Request::Quit.encode(), vec![b'.', 0, 0, 0, 0]);
    }

    #[test]
    fn set_radar_chan_payload() {
        let wire = Request::SetRadarChan { radar: 1, channel: 2 }.encode();
        assert_eq!(wire, vec![b'R', 0, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0]);
    }

    #[test]
    fn set_parameters_follows_header() {
        let req = Request::SetParameters(params::ControlParameters { beam: 3, ..Default::default() });
        let wire = req.encode();
        assert_eq!(wire.len(), 5 + params::ControlParameters::LEN);
        assert_eq!(wire[0], b'C');
        assert_eq!(codec::read_i32(&wire, 5 + 6).unwrap(), 3);
    }

    #[test]
    fn debug_hex_truncates() {
        let req = Request::SetParameters(params::ControlParameters::default());
        let s = req.debug_hex();
        assert!(s.starts_with("SET_PARAMETERS 46B | "));
        assert!(s.ends_with("..."));
        assert_eq!(Request::Ping.debug_hex(), "PING 0B");
    }
}
