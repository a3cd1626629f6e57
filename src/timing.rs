//! Pulse timing: pulse length and lag-spacing rules, Barker phase codes, and
//! the timing-sequence generator that produces the controller's rep/code
//! step tables.

use thiserror::Error;

/// Step of the rep/code tables (µs).
pub const CLOCK_PERIOD: i32 = 10;

/// Code table bit: transmitter on.
pub const BIT_TX: u8 = 0x01;
/// Code table bit: phase flipped for the current chip.
pub const BIT_PHASE: u8 = 0x02;
/// Code table bit: receiver sampling gate open.
pub const BIT_SAMPLE: u8 = 0x04;

/// Round-trip time per km of range (µs/km), as the integer ratio 20/3.
const US_PER_KM_NUM: i32 = 20;
const US_PER_KM_DEN: i32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimingError {
    #[error("unsupported baud count {0} (supported: 1, 2, 3, 4, 5, 7, 11, 13)")]
    UnsupportedBaud(i32),

    #[error("range separation {rsep} km gives a zero pulse length for nbaud {nbaud}")]
    ZeroPulseLength { nbaud: i32, rsep: i32 },

    #[error("mpinc {mpinc} µs is not a non-zero multiple of both 10 and txpl {txpl} µs")]
    InvalidMpinc { mpinc: i32, txpl: i32 },

    #[error("pulse pattern is empty")]
    EmptyPattern,

    #[error("invalid timing sequence: smsep {smsep} µs, lagfr {lagfr} µs")]
    InvalidSequence { smsep: i32, lagfr: i32 },
}

/// Transmit pulse length (µs) for `nbaud` chips at `rsep` km range separation.
pub fn pulse_length(nbaud: i32, rsep: i32) -> i32 {
    nbaud * rsep * US_PER_KM_NUM / US_PER_KM_DEN
}

/// Move `mpinc` to a multiple of `txpl` (and thereby 10) when possible.
///
/// Values already valid are returned unchanged. Otherwise, when `txpl` is a
/// multiple of 10, `mpinc` moves to the nearer multiple of `txpl` (upward on
/// a tie) and never to zero. The result still has to pass
/// [`check_mpinc`].
pub fn adjust_mpinc(mpinc: i32, txpl: i32) -> i32 {
    if txpl <= 0 || (mpinc % txpl == 0 && mpinc % 10 == 0) {
        return mpinc;
    }
    if txpl % 10 != 0 {
        return mpinc;
    }
    let mpinc = mpinc.max(txpl);
    let minus = mpinc % txpl;
    let plus = txpl - minus;
    let adjusted = if plus > minus { mpinc - minus } else { mpinc + plus };
    if adjusted == 0 { adjusted + plus } else { adjusted }
}

pub fn check_mpinc(mpinc: i32, txpl: i32) -> Result<(), TimingError> {
    if txpl <= 0 || mpinc == 0 || mpinc % txpl != 0 || mpinc % 10 != 0 {
        return Err(TimingError::InvalidMpinc { mpinc, txpl });
    }
    Ok(())
}

/// Barker code of length `nbaud`.
pub fn barker(nbaud: i32) -> Result<&'static [i32], TimingError> {
    Ok(match nbaud {
        1 => &[1],
        2 => &[1, -1],
        3 => &[1, 1, -1],
        4 => &[1, 1, -1, 1],
        5 => &[1, 1, 1, -1, 1],
        7 => &[1, 1, 1, -1, -1, 1, -1],
        11 => &[1, 1, 1, -1, -1, -1, 1, -1, -1, 1, -1],
        13 => &[1, 1, 1, 1, 1, -1, -1, 1, 1, -1, 1, -1, 1],
        other => return Err(TimingError::UnsupportedBaud(other)),
    })
}

/// Timing parameters for one beam configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingSequenceParameters {
    pub nrang: i32,
    /// Distance to first range (km).
    pub frang: i32,
    /// Range separation (km).
    pub rsep: i32,
    /// Pulse length (µs).
    pub txpl: i32,
    /// Lag spacing (µs).
    pub mpinc: i32,
    pub nbaud: i32,
    /// Start delay in clock periods.
    pub stdelay: i32,
    /// Pulse positions in units of `mpinc`.
    pub pattern: Vec<i32>,
    /// Phase code, repeated once per pulse (`pattern.len() * nbaud` chips).
    pub phase_code: Vec<i32>,
}

impl TimingSequenceParameters {
    /// Derive pulse length, adjust `mpinc` and pick the Barker code.
    ///
    /// Fails when the baud count has no Barker code or `mpinc` cannot be
    /// brought to a valid value.
    pub fn new(
        nrang: i32,
        frang: i32,
        rsep: i32,
        nbaud: i32,
        mpinc: i32,
        pattern: &[i32],
    ) -> Result<Self, TimingError> {
        let code = barker(nbaud)?;
        if pattern.is_empty() {
            return Err(TimingError::EmptyPattern);
        }
        let txpl = pulse_length(nbaud, rsep);
        if txpl <= 0 {
            return Err(TimingError::ZeroPulseLength { nbaud, rsep });
        }
        let mpinc = adjust_mpinc(mpinc, txpl);
        check_mpinc(mpinc, txpl)?;
        let phase_code = pattern.iter().flat_map(|_| code.iter().copied()).collect();
        Ok(Self {
            nrang,
            frang,
            rsep,
            txpl,
            mpinc,
            nbaud,
            stdelay: 0,
            pattern: pattern.to_vec(),
            phase_code,
        })
    }

    /// One pulse's worth of phase code.
    pub fn code(&self) -> &[i32] {
        &self.phase_code[..self.nbaud as usize]
    }

    pub fn mppul(&self) -> usize {
        self.pattern.len()
    }
}

/// Output of the timing-sequence generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingSequence {
    pub params: TimingSequenceParameters,
    /// Sample separation (µs).
    pub smsep: i32,
    /// Lag to first range (µs).
    pub lagfr: i32,
    /// Samples per sequence, counted from the first pulse.
    pub samples: i32,
    /// Samples taken before the first pulse.
    pub smdelay: i32,
    /// Run lengths of the step table, in clock periods.
    pub rep: Vec<u8>,
    /// Control bits for each run.
    pub code: Vec<u8>,
}

impl TimingSequence {
    /// Build the sample timing and the compressed step table.
    pub fn make(params: &TimingSequenceParameters) -> Result<Self, TimingError> {
        let smsep = params.txpl / params.nbaud;
        let lagfr = params.frang * US_PER_KM_NUM / US_PER_KM_DEN;
        if smsep <= 0 || lagfr <= 0 {
            return Err(TimingError::InvalidSequence { smsep, lagfr });
        }
        let last_pulse = params.pattern.iter().copied().max().unwrap_or(0) * params.mpinc;
        let window = last_pulse + lagfr + params.nrang * smsep;
        let start = params.stdelay * CLOCK_PERIOD;
        let smdelay = start / smsep;
        let samples = window / smsep;

        let code = params.code();
        let chip = smsep.max(1);
        let total_ticks = (start + window) / CLOCK_PERIOD;
        let mut bits = Vec::with_capacity(total_ticks as usize);
        for tick in 0..total_ticks {
            let t = tick * CLOCK_PERIOD - start;
            let mut b = if t >= 0 { BIT_SAMPLE } else { 0 };
            for &p in &params.pattern {
                let offset = t - p * params.mpinc;
                if (0..params.txpl).contains(&offset) {
                    b |= BIT_TX;
                    if code[(offset / chip) as usize % code.len()] < 0 {
                        b |= BIT_PHASE;
                    }
                }
            }
            bits.push(b);
        }
        let (rep, code) = run_length(&bits);

        Ok(Self {
            params: params.clone(),
            smsep,
            lagfr,
            samples,
            smdelay,
            rep,
            code,
        })
    }

    /// Samples the controller should capture per sequence.
    pub fn total_samples(&self) -> i32 {
        self.samples + self.smdelay
    }

    /// Baseband sample rate (Hz) implied by the chip length.
    pub fn sample_rate(&self) -> f32 {
        (f64::from(self.params.nbaud) / f64::from(self.params.txpl) * 1e6) as f32
    }
}

fn run_length(bits: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut rep = Vec::new();
    let mut code = Vec::new();
    for &b in bits {
        match (rep.last_mut(), code.last()) {
            (Some(r), Some(&c)) if c == b && *r < u8::MAX => *r += 1,
            _ => {
                rep.push(1);
                code.push(b);
            }
        }
    }
    (rep, code)
}

/// Shared IQ buffer size in bytes for an integration of `intsc` seconds.
///
/// `ceil(2 · mppul · 4 · 1e6 · (intsc + 1) · nbaud / mpinc)`: room for both
/// channels at one sample per chip per lag spacing, with a second of slack.
pub fn iq_buffer_size(mppul: usize, intsc: i32, nbaud: i32, mpinc: i32) -> usize {
    if mpinc <= 0 {
        return 0;
    }
    let bytes = 2.0 * mppul as f64 * 4.0 * 1e6 * f64::from(intsc + 1) * f64::from(nbaud)
        / f64::from(mpinc);
    bytes.ceil() as usize
}
