//! Exchange header parsing and encoding.
//!
//! Wire format:
//! ```text
//! [OPCODE:1] [STATUS:4 little-endian i32]
//! ```
//!
//! Every request starts with a header; every response ends with one. There is
//! no padding between the opcode and the status.

use crate::codec;
use crate::error::{Result, WireError};
use crate::opcode::Opcode;

/// Size of an encoded header in bytes.
pub const HEADER_LEN: usize = 5;

/// A parsed exchange header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: Opcode,
    pub status: i32,
}

impl Header {
    /// A request header. Requests always carry a zero status.
    pub fn request(opcode: Opcode) -> Self {
        Self { opcode, status: 0 }
    }

    /// Parse a header from exactly [`HEADER_LEN`] bytes (extra bytes are ignored).
    pub fn parse(wire: &[u8]) -> Result<Self> {
        if wire.len() < HEADER_LEN {
            return Err(WireError::HeaderTooShort { len: wire.len() });
        }
        let opcode = Opcode::from_byte(wire[0])?;
        let status = codec::read_i32(wire, 1)?;
        Ok(Self { opcode, status })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let s = self.status.to_le_bytes();
        [self.opcode.as_byte(), s[0], s[1], s[2], s[3]]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ping() {
        assert_eq!(Header::request(Opcode::Ping).encode(), [b'=', 0, 0, 0, 0]);
    }

    #[test]
    fn parse_negative_status() {
        let wire = [b'A', 0xFF, 0xFF, 0xFF, 0xFF];
        let h = Header::parse(&wire).unwrap();
        assert_eq!(h.opcode, Opcode::SetActive);
        assert_eq!(h.status, -1);
    }

    #[test]
    fn round_trip() {
        let h = Header { opcode: Opcode::RegisterSeq, status: 1 };
        assert_eq!(Header::parse(&h.encode()).unwrap(), h);
    }

    #[test]
    fn too_short() {
        assert!(matches!(
            Header::parse(&[b'=', 0, 0]),
            Err(WireError::HeaderTooShort { len: 3 })
        ));
    }

    #[test]
    fn unknown_opcode() {
        assert!(matches!(
            Header::parse(&[b'?', 0, 0, 0, 0]),
            Err(WireError::UnknownOpcode { code: b'?' })
        ));
    }
}
