//! Clear-frequency search request and assigned-frequency reply.

use crate::codec;
use crate::error::{Result, WireError};

/// Averages the controller takes per clear-frequency search.
pub const CLEAR_FREQ_NAVE: i32 = 20;
/// Search filter bandwidth (kHz).
pub const CLEAR_FREQ_BANDWIDTH: f32 = 250.0;

/// `REQUEST_CLEAR_FREQ_SEARCH` payload (16 bytes):
/// `start:i32 end:i32 filter_bandwidth:f32 nave:i32`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClearFreqParameters {
    /// Band start (kHz).
    pub start: i32,
    /// Band end (kHz).
    pub end: i32,
    pub filter_bandwidth: f32,
    pub nave: i32,
}

impl ClearFreqParameters {
    pub const LEN: usize = 16;

    /// A search over `[start, end]` with the standard averaging settings.
    pub fn band(start: i32, end: i32) -> Self {
        Self {
            start,
            end,
            filter_bandwidth: CLEAR_FREQ_BANDWIDTH,
            nave: CLEAR_FREQ_NAVE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        codec::write_i32(&mut buf, self.start);
        codec::write_i32(&mut buf, self.end);
        codec::write_f32(&mut buf, self.filter_bandwidth);
        codec::write_i32(&mut buf, self.nave);
        buf
    }
}

/// `REQUEST_ASSIGNED_FREQ` reply (8 bytes): `tfreq:i32 noise:f32`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssignedFrequency {
    /// Selected transmit frequency (kHz).
    pub tfreq: i32,
    /// Noise estimate at the selected frequency.
    pub noise: f32,
}

impl AssignedFrequency {
    pub const LEN: usize = 8;

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::LEN {
            return Err(WireError::payload_too_short("AssignedFrequency", Self::LEN, payload.len()));
        }
        Ok(Self {
            tfreq: codec::read_i32(payload, 0)?,
            noise: codec::read_f32(payload, 4)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        codec::write_i32(&mut buf, self.tfreq);
        codec::write_f32(&mut buf, self.noise);
        buf
    }
}
