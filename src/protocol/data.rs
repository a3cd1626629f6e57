//! Raw sequence data returned by `GET_DATA`.

use std::fmt;

/// A window during which a transmitter reported a bad transmission,
/// relative to the start of the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadWindow {
    pub start_usec: u32,
    pub duration_usec: u32,
}

/// Per-transmitter status flags reported alongside each sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxStatus {
    pub agc: Vec<i32>,
    pub low_power: Vec<i32>,
}

impl TxStatus {
    pub fn transmitters(&self) -> usize {
        self.agc.len()
    }
}

/// Samples and side information for one completed pulse sequence.
///
/// Each sample is a packed I/Q pair: I in the low 16 bits, Q in the high
/// 16 bits, both two's complement.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RawSequenceData {
    /// Main array samples.
    pub main: Vec<u32>,
    /// Interferometer array samples; same length as `main`.
    pub back: Vec<u32>,
    pub bad_windows: Vec<BadWindow>,
    pub tx_status: TxStatus,
}

impl RawSequenceData {
    pub fn samples(&self) -> usize {
        self.main.len()
    }

    /// Bytes occupied by both channels when stored back to back.
    pub fn byte_len(&self) -> usize {
        (self.main.len() + self.back.len()) * 4
    }
}

impl fmt::Debug for RawSequenceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawSequenceData {{ samples: {}, bad_windows: {:?}, transmitters: {} }}",
            self.main.len(),
            self.bad_windows,
            self.tx_status.transmitters(),
        )
    }
}
