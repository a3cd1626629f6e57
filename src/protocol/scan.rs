//! Scan plan carried by `SET_ACTIVE`.

use crate::codec;

/// `SET_ACTIVE` payload.
///
/// Layout: `nbeams:i32 beams[nbeams]:i32 fstarts[nbeams]:i32
/// bandwidths[nbeams]:i32 fixfreq:i32 scnsc:i32 scnus:i32 intsc:i32 intus:i32
/// start:i32`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStart {
    pub beams: Vec<i32>,
    /// Clear-frequency band start per beam (kHz).
    pub fstarts: Vec<i32>,
    /// Clear-frequency bandwidth per beam (kHz).
    pub bandwidths: Vec<i32>,
    /// Fixed transmit frequency, or -1 when frequencies are searched.
    pub fixfreq: i32,
    pub scnsc: i32,
    pub scnus: i32,
    pub intsc: i32,
    pub intus: i32,
    /// Index into `beams` of the first beam to run.
    pub start: i32,
}

impl ScanStart {
    pub fn encode(&self) -> Vec<u8> {
        let n = self.beams.len();
        let mut buf = Vec::with_capacity(4 * (7 + 3 * n));
        codec::write_i32(&mut buf, n as i32);
        codec::write_i32_array(&mut buf, &self.beams);
        codec::write_i32_array(&mut buf, &self.fstarts);
        codec::write_i32_array(&mut buf, &self.bandwidths);
        for v in [self.fixfreq, self.scnsc, self.scnus, self.intsc, self.intus, self.start] {
            codec::write_i32(&mut buf, v);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_follow_count() {
        let s = ScanStart {
            beams: vec![0, 1],
            fstarts: vec![10400, 10400],
            bandwidths: vec![300, 300],
            fixfreq: -1,
            scnsc: 60,
            scnus: 0,
            intsc: 3,
            intus: 0,
            start: 1,
        };
        let wire = s.encode();
        assert_eq!(wire.len(), 4 * (1 + 6 + 6));
        assert_eq!(codec::read_i32(&wire, 0).unwrap(), 2);
        assert_eq!(codec::read_i32(&wire, 12).unwrap(), 10400);
        assert_eq!(codec::read_i32(&wire, 28).unwrap(), -1);
        assert_eq!(codec::read_i32(&wire, 48).unwrap(), 1);
    }
}
