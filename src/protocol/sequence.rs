//! Pulse sequence registration payload. Type '+'.

use crate::codec;
use crate::timing::TimingSequence;

/// Fixed part of a sequence registration: eighteen i32 fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceParameters {
    pub index: i32,
    /// Number of entries in the rep/code step tables.
    pub len: i32,
    /// Clock step of the tables (µs).
    pub step: i32,
    pub samples: i32,
    pub smdelay: i32,
    pub nrang: i32,
    pub frang: i32,
    pub rsep: i32,
    pub smsep: i32,
    pub lagfr: i32,
    pub txpl: i32,
    pub mppul: i32,
    pub mpinc: i32,
    pub mlag: i32,
    pub nbaud: i32,
    pub stdelay: i32,
    pub gort: i32,
    pub rtoxmin: i32,
}

impl SequenceParameters {
    pub const LEN: usize = 18 * 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        for v in [
            self.index,
            self.len,
            self.step,
            self.samples,
            self.smdelay,
            self.nrang,
            self.frang,
            self.rsep,
            self.smsep,
            self.lagfr,
            self.txpl,
            self.mppul,
            self.mpinc,
            self.mlag,
            self.nbaud,
            self.stdelay,
            self.gort,
            self.rtoxmin,
        ] {
            codec::write_i32(&mut buf, v);
        }
        buf
    }
}

/// Everything sent with `REGISTER_SEQ`: the parameter block, the compressed
/// rep/code tables, the pulse pattern and one copy of the phase code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRegistration {
    pub params: SequenceParameters,
    pub rep: Vec<u8>,
    pub code: Vec<u8>,
    pub pattern: Vec<i32>,
    pub phase_code: Vec<i32>,
}

impl SequenceRegistration {
    pub fn from_timing(index: i32, ts: &TimingSequence) -> Self {
        let p = &ts.params;
        let params = SequenceParameters {
            index,
            len: ts.rep.len() as i32,
            step: crate::timing::CLOCK_PERIOD,
            samples: ts.samples,
            smdelay: ts.smdelay,
            nrang: p.nrang,
            frang: p.frang,
            rsep: p.rsep,
            smsep: ts.smsep,
            lagfr: ts.lagfr,
            txpl: p.txpl,
            mppul: p.pattern.len() as i32,
            mpinc: p.mpinc,
            mlag: 0,
            nbaud: p.nbaud,
            stdelay: p.stdelay,
            gort: 1,
            rtoxmin: 0,
        };
        // Only one baud's worth of the phase code goes over the wire.
        let phase_code = if p.nbaud > 1 {
            p.phase_code.iter().take(p.nbaud as usize).copied().collect()
        } else {
            vec![1]
        };
        Self {
            params,
            rep: ts.rep.clone(),
            code: ts.code.clone(),
            pattern: p.pattern.clone(),
            phase_code,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.params.encode();
        buf.extend_from_slice(&self.rep);
        buf.extend_from_slice(&self.code);
        codec::write_i32_array(&mut buf, &self.pattern);
        codec::write_i32_array(&mut buf, &self.phase_code);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_block_is_72_bytes() {
        let p = SequenceParameters { nbaud: 5, ..Default::default() };
        let wire = p.encode();
        assert_eq!(wire.len(), SequenceParameters::LEN);
        assert_eq!(codec::read_i32(&wire, 14 * 4).unwrap(), 5);
    }

    #[test]
    fn registration_layout() {
        let reg = SequenceRegistration {
            params: SequenceParameters { len: 3, mppul: 2, nbaud: 1, ..Default::default() },
            rep: vec![1, 2, 3],
            code: vec![4, 5, 6],
            pattern: vec![0, 9],
            phase_code: vec![1],
        };
        let wire = reg.encode();
        assert_eq!(wire.len(), 72 + 3 + 3 + 8 + 4);
        assert_eq!(&wire[72..78], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(codec::read_i32(&wire, 82).unwrap(), 9);
    }
}
