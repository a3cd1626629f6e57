//! Radar control and data parameter blocks.

use crate::codec;
use crate::error::{Result, WireError};

/// Radar control parameter block. Exchanged by `GET_PARAMETERS` (response)
/// and `SET_PARAMETERS` (request).
///
/// Layout (46 bytes, little-endian, packed):
/// ```text
/// radar:u8 channel:u8 priority:i32 beam:i32 tfreq:i32 rfreq:i32 trise:i32
/// number_of_samples:i32 buffer_index:i32 baseband_samplerate:f32
/// filter_bandwidth:f32 match_filter:i32 status:i32
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlParameters {
    pub radar: u8,
    pub channel: u8,
    pub priority: i32,
    /// Transmit beam number.
    pub beam: i32,
    /// Transmit frequency (kHz).
    pub tfreq: i32,
    /// Receive frequency (kHz).
    pub rfreq: i32,
    /// Transmit rise time (ns).
    pub trise: i32,
    pub number_of_samples: i32,
    pub buffer_index: i32,
    /// Baseband sample rate (Hz).
    pub baseband_samplerate: f32,
    /// Receive filter bandwidth (Hz).
    pub filter_bandwidth: f32,
    pub match_filter: i32,
    pub status: i32,
}

impl ControlParameters {
    pub const LEN: usize = 46;

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::LEN {
            return Err(WireError::payload_too_short("ControlParameters", Self::LEN, payload.len()));
        }
        Ok(Self {
            radar: payload[0],
            channel: payload[1],
            priority: codec::read_i32(payload, 2)?,
            beam: codec::read_i32(payload, 6)?,
            tfreq: codec::read_i32(payload, 10)?,
            rfreq: codec::read_i32(payload, 14)?,
            trise: codec::read_i32(payload, 18)?,
            number_of_samples: codec::read_i32(payload, 22)?,
            buffer_index: codec::read_i32(payload, 26)?,
            baseband_samplerate: codec::read_f32(payload, 30)?,
            filter_bandwidth: codec::read_f32(payload, 34)?,
            match_filter: codec::read_i32(payload, 38)?,
            status: codec::read_i32(payload, 42)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.push(self.radar);
        buf.push(self.channel);
        codec::write_i32(&mut buf, self.priority);
        codec::write_i32(&mut buf, self.beam);
        codec::write_i32(&mut buf, self.tfreq);
        codec::write_i32(&mut buf, self.rfreq);
        codec::write_i32(&mut buf, self.trise);
        codec::write_i32(&mut buf, self.number_of_samples);
        codec::write_i32(&mut buf, self.buffer_index);
        codec::write_f32(&mut buf, self.baseband_samplerate);
        codec::write_f32(&mut buf, self.filter_bandwidth);
        codec::write_i32(&mut buf, self.match_filter);
        codec::write_i32(&mut buf, self.status);
        buf
    }

    /// Expected acquisition time for one sequence at this sample rate.
    pub fn acquisition_micros(&self) -> u64 {
        if self.baseband_samplerate <= 0.0 || self.number_of_samples <= 0 {
            return 0;
        }
        (f64::from(self.number_of_samples) / f64::from(self.baseband_samplerate) * 1e6) as u64
    }
}

/// Leading block of a `GET_DATA` response. Type 'd'.
///
/// Layout (16 bytes): `event_secs:i32 event_nsecs:i32 samples:u32 status:i32`.
/// A zero status means sample arrays follow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataParameters {
    pub event_secs: i32,
    pub event_nsecs: i32,
    pub samples: u32,
    pub status: i32,
}

impl DataParameters {
    pub const LEN: usize = 16;

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::LEN {
            return Err(WireError::payload_too_short("DataParameters", Self::LEN, payload.len()));
        }
        Ok(Self {
            event_secs: codec::read_i32(payload, 0)?,
            event_nsecs: codec::read_i32(payload, 4)?,
            samples: codec::read_u32(payload, 8)?,
            status: codec::read_i32(payload, 12)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        codec::write_i32(&mut buf, self.event_secs);
        codec::write_i32(&mut buf, self.event_nsecs);
        codec::write_u32(&mut buf, self.samples);
        codec::write_i32(&mut buf, self.status);
        buf
    }

    /// True when the controller produced samples for this sequence.
    pub fn has_samples(&self) -> bool {
        self.status == 0
    }
}
