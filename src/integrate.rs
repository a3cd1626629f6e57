//! Integration state machine: one beam's acquisition loop.
//!
//! Per sequence: push the parameter block, arm, wait for the acquisition,
//! collect samples, stop on a beam change, invert and phase-decode, copy into
//! the shared IQ buffer, record, and hand the samples to the ACF engine. The
//! loop exits when no duration was requested and one sequence has been
//! accumulated, or when the projected end of the next sequence passes the
//! deadline latched by [`Integrator::start`].

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::acf::{
    AcfContext, AcfEngine, CorrelationPart, Geometry, IntegrationAccumulator, LagTable, MAX_RANGE,
    SequenceSamples, StandardAcf,
};
use crate::conn::{ConnError, Connection};
use crate::decode;
use crate::iqbuf::IqBuffer;
use crate::protocol::data::BadWindow;
use crate::protocol::params::ControlParameters;
use crate::seq;
use crate::seqlog::{SeqLog, SeqLogEntry};
use crate::shutdown::{Cancelled, Checkpoint};
use crate::timing::TimingSequence;

/// Transmitter rise time sent with every sequence (ns).
pub const TRISE: i32 = 5000;
/// Extra samples requested beyond the timing sequence.
const SAMPLE_PAD: i32 = 10;

/// Negative result: the accumulator could not be built.
pub const ERR_ALLOC: i32 = -1;

#[derive(Debug, Error)]
pub enum IntegrateError {
    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationState {
    Idle,
    Priming,
    Acquiring(u32),
    Decoding(u32),
    Accumulating(u32),
    Finalizing,
}

/// What the caller asks of one beam.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamRequest {
    pub beam: i32,
    /// Transmit frequency (kHz).
    pub tfreq: i32,
    /// Receive frequency (kHz); `None` follows `tfreq`.
    pub rfreq: Option<i32>,
    /// `None` integrates until one sequence has been accumulated.
    pub duration: Option<Duration>,
    /// Accumulate cross-correlations this integration.
    pub xcf: bool,
    /// Noise estimate from the last clear-frequency search.
    pub noise: f32,
}

/// Fixed per-channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntegrationOptions {
    pub radar: u8,
    pub channel: u8,
    pub match_filter: bool,
    /// Negate the main channel before decoding.
    pub invert: bool,
}

/// One accumulated sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRecord {
    pub event_secs: i32,
    pub event_usecs: i32,
    pub attenuation: i32,
    pub noise: f32,
    pub bad_windows: Vec<BadWindow>,
    /// Byte offset in the IQ buffer.
    pub offset: usize,
    pub len: usize,
    /// False when the copy overran the IQ buffer.
    pub stored: bool,
}

/// Everything the loop borrows from the session for one integration.
pub struct Acquisition<'a, S> {
    pub conn: &'a mut Connection<S>,
    pub iq: &'a mut IqBuffer,
    pub seqlog: Option<&'a mut SeqLog>,
    pub checkpoint: &'a Checkpoint,
}

pub struct Integrator<E = StandardAcf> {
    engine: E,
    timing: TimingSequence,
    lags: LagTable,
    options: IntegrationOptions,
    state: IntegrationState,
    deadline: Option<Instant>,
    accumulator: IntegrationAccumulator,
    records: Vec<SequenceRecord>,
    last_params: ControlParameters,
    overruns: u32,
}

impl<E: AcfEngine> Integrator<E> {
    pub fn new(engine: E, timing: TimingSequence, lags: LagTable, options: IntegrationOptions) -> Self {
        let accumulator = IntegrationAccumulator::new(0, 0);
        Self {
            engine,
            timing,
            lags,
            options,
            state: IntegrationState::Idle,
            deadline: None,
            accumulator,
            records: Vec::new(),
            last_params: ControlParameters::default(),
            overruns: 0,
        }
    }

    pub fn state(&self) -> IntegrationState {
        self.state
    }

    pub fn timing(&self) -> &TimingSequence {
        &self.timing
    }

    pub fn lags(&self) -> &LagTable {
        &self.lags
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn accumulator(&self) -> &IntegrationAccumulator {
        &self.accumulator
    }

    pub fn records(&self) -> &[SequenceRecord] {
        &self.records
    }

    /// Parameter block the controller echoed for the last sequence.
    pub fn last_params(&self) -> &ControlParameters {
        &self.last_params
    }

    /// Sequences whose copy overran the IQ buffer in the last integration.
    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    /// Parameter block for one sequence of `req`.
    pub fn parameter_block(&self, req: &BeamRequest) -> ControlParameters {
        let rate = self.timing.sample_rate();
        ControlParameters {
            radar: self.options.radar,
            channel: self.options.channel,
            priority: i32::from(self.options.channel),
            beam: req.beam,
            tfreq: req.tfreq,
            rfreq: req.rfreq.filter(|f| *f >= 0).unwrap_or(req.tfreq),
            trise: TRISE,
            number_of_samples: self.timing.total_samples() + self.timing.params.nbaud + SAMPLE_PAD,
            buffer_index: 0,
            baseband_samplerate: rate,
            filter_bandwidth: rate,
            match_filter: i32::from(self.options.match_filter),
            status: 0,
        }
    }

    /// Prime the controller for `req` and latch the integration deadline.
    ///
    /// Time spent between this and [`run`](Self::run), such as a
    /// clear-frequency search, counts against the duration.
    pub fn start<S: Read + Write>(
        &mut self,
        conn: &mut Connection<S>,
        req: &BeamRequest,
    ) -> Result<(), ConnError> {
        self.state = IntegrationState::Priming;
        seq::ping(conn)?;
        seq::get_parameters(conn)?;
        seq::set_parameters(conn, &self.parameter_block(req))?;
        self.deadline = req.duration.map(|d| Instant::now() + d);
        debug!(beam = req.beam, tfreq = req.tfreq, deadline = ?req.duration, "integration primed");
        Ok(())
    }

    /// Run the integration. Returns `nave`, or [`ERR_ALLOC`] when the
    /// accumulator cannot be sized for the timing sequence.
    ///
    /// Without a preceding [`start`](Self::start) the deadline is latched
    /// here.
    pub fn run<S: Read + Write>(
        &mut self,
        io: &mut Acquisition<'_, S>,
        req: &BeamRequest,
    ) -> Result<i32, IntegrateError> {
        let nrang = self.timing.params.nrang;
        if !(1..=MAX_RANGE as i32).contains(&nrang) {
            warn!(nrang, "range count out of bounds");
            self.state = IntegrationState::Idle;
            return Ok(ERR_ALLOC);
        }
        if self.state != IntegrationState::Priming {
            self.deadline = req.duration.map(|d| Instant::now() + d);
        }
        let extended = self.lags.is_extended();
        self.accumulator = IntegrationAccumulator::new(nrang as usize, self.lags.output_lags());
        self.records.clear();
        self.overruns = 0;

        let geometry = Geometry::new(&self.timing);
        let badrng = self.engine.bad_lag_zero(&geometry, &self.timing.params.pattern);
        let ctx = AcfContext { geometry, lags: &self.lags, badrng };
        let block = self.parameter_block(req);
        let settle = Duration::from_micros(block.acquisition_micros());
        let code = self.timing.params.code().to_vec();
        let mut kept: Vec<(Vec<u32>, Vec<u32>)> = Vec::new();

        let started = Instant::now();
        let mut offset = 0usize;
        let mut nave: u32 = 0;

        loop {
            io.checkpoint.check()?;
            self.state = IntegrationState::Acquiring(nave);

            // Running average of the observed sequence period.
            let now = Instant::now();
            let tavg = if nave > 0 { (now - started) / nave } else { Duration::ZERO };
            let projected = now + tavg;
            let done = match self.deadline {
                None => nave > 0,
                Some(deadline) => nave > 0 && projected > deadline,
            };
            if done {
                break;
            }

            seq::set_parameters(io.conn, &block)?;
            seq::set_ready(io.conn)?;
            std::thread::sleep(settle);
            io.checkpoint.check()?;
            let reply = seq::get_data(io.conn)?;
            self.last_params = reply.params;

            // Every sequence is logged as the controller ran it, including
            // one that ends the integration.
            let event_usecs = reply.event.event_nsecs / 1000;
            if let Some(log) = io.seqlog.as_deref_mut() {
                let entry = SeqLogEntry {
                    event_secs: reply.event.event_secs,
                    event_usecs,
                    beam: self.last_params.beam,
                    tfreq: self.last_params.tfreq,
                    bad_windows: reply.data.as_ref().map_or(&[][..], |d| d.bad_windows.as_slice()),
                };
                if let Err(e) = log.write(&entry) {
                    warn!("sequence log write failed: {e}");
                }
            }

            if self.last_params.beam != req.beam {
                info!(requested = req.beam, reported = self.last_params.beam, nave, "beam changed");
                break;
            }
            let Some(mut data) = reply.data else {
                debug!(status = reply.event.status, "sequence returned no samples");
                continue;
            };

            self.state = IntegrationState::Decoding(nave);
            if self.options.invert {
                decode::invert(&mut data.main);
            }
            if code.len() > 1 {
                decode::phase_decode(&mut data.main, &code);
                decode::phase_decode(&mut data.back, &code);
            }

            let len = data.byte_len();
            let stored = match io.iq.write_sequence(offset, &data.main, &data.back) {
                Ok(_) => true,
                Err(e) => {
                    warn!(seq = nave, "{e}");
                    self.overruns += 1;
                    false
                }
            };

            self.state = IntegrationState::Accumulating(nave);
            let samples = SequenceSamples { main: &data.main, back: &data.back };
            if extended {
                kept.push((data.main.clone(), data.back.clone()));
            } else {
                self.engine.sum_power(&ctx, samples, &mut self.accumulator);
                self.engine.calculate(&ctx, samples, CorrelationPart::Acf, &mut self.accumulator);
                if req.xcf {
                    self.engine.calculate(&ctx, samples, CorrelationPart::Xcf, &mut self.accumulator);
                }
            }

            self.records.push(SequenceRecord {
                event_secs: reply.event.event_secs,
                event_usecs,
                attenuation: 0,
                noise: req.noise,
                bad_windows: std::mem::take(&mut data.bad_windows),
                offset,
                len,
                stored,
            });
            trace!(seq = nave, offset, len, stored, "sequence accumulated");
            offset += len;
            nave += 1;
        }

        self.state = IntegrationState::Finalizing;
        self.accumulator.nave = nave;
        if extended {
            let sequences: Vec<SequenceSamples<'_>> =
                kept.iter().map(|(main, back)| SequenceSamples { main, back }).collect();
            self.engine.calculate_extended(&ctx, &sequences, &mut self.accumulator);
        } else {
            self.engine.average(&mut self.accumulator);
        }
        self.deadline = None;
        self.state = IntegrationState::Idle;
        info!(beam = req.beam, nave, overruns = self.overruns, "integration complete");
        Ok(nave as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{pack, unpack};
    use crate::opcode::Opcode;
    use crate::testutil::Script;
    use crate::timing::TimingSequenceParameters;

    fn integrator(nbaud: i32, invert: bool) -> Integrator {
        let p = TimingSequenceParameters::new(3, 180, 15, nbaud, 2000, &[0, 1]).unwrap();
        let ts = TimingSequence::make(&p).unwrap();
        let lags = LagTable::new(vec![(0, 0), (0, 1), (0, 0)]).unwrap();
        let options = IntegrationOptions { radar: 1, channel: 1, match_filter: false, invert };
        Integrator::new(StandardAcf, ts, lags, options)
    }

    fn request(duration: Option<Duration>) -> BeamRequest {
        BeamRequest { beam: 7, tfreq: 10500, rfreq: None, duration, xcf: false, noise: 1.5 }
    }

    fn run(integ: &mut Integrator, script: Script, iq: &mut IqBuffer, req: &BeamRequest) -> i32 {
        let mut conn = Connection::from_stream(script.stream());
        let checkpoint = Checkpoint::new();
        let mut io = Acquisition { conn: &mut conn, iq, seqlog: None, checkpoint: &checkpoint };
        integ.run(&mut io, req).unwrap()
    }

    #[test]
    fn parameter_block_layout() {
        let integ = integrator(5, false);
        let block = integ.parameter_block(&request(None));
        assert_eq!(block.beam, 7);
        assert_eq!(block.rfreq, 10500);
        assert_eq!(block.trise, TRISE);
        assert_eq!(block.priority, 1);
        assert_eq!(block.number_of_samples, integ.timing().total_samples() + 5 + 10);
        assert_eq!(block.baseband_samplerate, 10_000.0);
        assert_eq!(block.filter_bandwidth, block.baseband_samplerate);
    }

    #[test]
    fn zero_duration_accumulates_exactly_one_sequence() {
        let mut integ = integrator(1, false);
        let main = vec![pack(1, 1); 64];
        let script = Script::new().sequence(&main, &main, 7).sequence(&main, &main, 7);
        let mut iq = IqBuffer::anonymous("test", 4096);
        let nave = run(&mut integ, script, &mut iq, &request(None));
        assert_eq!(nave, 1);
        assert_eq!(integ.records().len(), 1);
        assert_eq!(integ.accumulator().nave, 1);
        assert_eq!(integ.state(), IntegrationState::Idle);
    }

    #[test]
    fn beam_change_discards_sequence() {
        let mut integ = integrator(1, false);
        let main = vec![pack(2, 0); 64];
        let script = Script::new()
            .sequence(&main, &main, 7)
            .sequence(&main, &main, 8)
            .sequence(&main, &main, 7);
        let mut iq = IqBuffer::anonymous("test", 4096);
        let req = request(Some(Duration::from_secs(60)));
        let mut conn = Connection::from_stream(script.stream());
        let checkpoint = Checkpoint::new();
        let mut io = Acquisition { conn: &mut conn, iq: &mut iq, seqlog: None, checkpoint: &checkpoint };
        assert_eq!(integ.run(&mut io, &req).unwrap(), 1);
        assert_eq!(integ.last_params().beam, 8);
        // The third sequence was never requested.
        assert!(conn.get_ref().remaining() > 0);
    }

    #[test]
    fn beam_change_on_first_sequence_gives_zero() {
        let mut integ = integrator(1, false);
        let main = vec![0u32; 64];
        let script = Script::new().sequence(&main, &main, 3);
        let mut iq = IqBuffer::anonymous("test", 4096);
        let nave = run(&mut integ, script, &mut iq, &request(Some(Duration::from_secs(60))));
        assert_eq!(nave, 0);
        assert!(integ.records().is_empty());
    }

    #[test]
    fn short_deadline_still_takes_first_sequence() {
        let mut integ = integrator(1, false);
        let main = vec![0u32; 64];
        let mut iq = IqBuffer::anonymous("test", 4096);
        let req = request(Some(Duration::from_micros(1)));
        let primed = Script::new()
            .status(Opcode::Ping, 0)
            .params(&ControlParameters::default())
            .status(Opcode::SetParameters, 0)
            .sequence(&main, &main, 7)
            .sequence(&main, &main, 7);
        let mut conn = Connection::from_stream(primed.stream());
        integ.start(&mut conn, &req).unwrap();
        assert_eq!(integ.state(), IntegrationState::Priming);
        let checkpoint = Checkpoint::new();
        let mut io = Acquisition { conn: &mut conn, iq: &mut iq, seqlog: None, checkpoint: &checkpoint };
        assert_eq!(integ.run(&mut io, &req).unwrap(), 1);
    }

    #[test]
    fn offsets_are_contiguous_and_overrun_is_recorded() {
        let mut integ = integrator(1, false);
        let main = vec![pack(1, 0); 16];
        let mut script = Script::new();
        for _ in 0..3 {
            script = script.sequence(&main, &main, 7);
        }
        // Room for two sequences of 128 bytes.
        let mut iq = IqBuffer::anonymous("test", 256);
        let mut conn = Connection::from_stream(script.stream());
        let checkpoint = Checkpoint::new();
        let req = request(Some(Duration::from_secs(60)));
        let mut io = Acquisition { conn: &mut conn, iq: &mut iq, seqlog: None, checkpoint: &checkpoint };
        // The script runs out after three sequences.
        assert!(matches!(integ.run(&mut io, &req), Err(IntegrateError::Conn(ConnError::Disconnected))));
        let recs = integ.records();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 128, 256]);
        assert_eq!(recs.iter().map(|r| r.stored).collect::<Vec<_>>(), vec![true, true, false]);
        assert_eq!(integ.overruns(), 1);
    }

    #[test]
    fn inverts_and_decodes_before_storing() {
        let mut integ = integrator(5, true);
        let code = [1, 1, 1, -1, 1];
        let mut main: Vec<u32> = code.iter().map(|&c| pack((-100 * c) as i16, 0)).collect();
        main.resize(64, 0);
        let back = vec![0u32; 64];
        let script = Script::new().sequence(&main, &back, 7);
        let mut iq = IqBuffer::anonymous("test", 4096);
        let nave = run(&mut integ, script, &mut iq, &request(None));
        assert_eq!(nave, 1);
        let first = u32::from_ne_bytes(iq.as_slice()[..4].try_into().unwrap());
        assert_eq!(unpack(first), (100, 0));
    }

    #[test]
    fn cancelled_before_first_sequence() {
        let mut integ = integrator(1, false);
        let mut conn = Connection::from_stream(Script::new().stream());
        let mut iq = IqBuffer::anonymous("test", 64);
        let checkpoint = Checkpoint::new();
        checkpoint.cancel();
        let mut io = Acquisition { conn: &mut conn, iq: &mut iq, seqlog: None, checkpoint: &checkpoint };
        assert!(matches!(integ.run(&mut io, &request(None)), Err(IntegrateError::Cancelled(_))));
        assert!(conn.get_ref().written().is_empty());
    }

    #[test]
    fn xcf_only_when_requested() {
        let mut integ = integrator(1, false);
        let main = vec![pack(1, 0); 64];
        let back = vec![pack(0, 1); 64];
        let mut req = request(None);
        let mut iq = IqBuffer::anonymous("test", 4096);
        run(&mut integ, Script::new().sequence(&main, &back, 7), &mut iq, &req);
        assert!(integ.accumulator().xcfd.iter().all(|&v| v == 0.0));

        req.xcf = true;
        let mut iq = IqBuffer::anonymous("test", 4096);
        run(&mut integ, Script::new().sequence(&main, &back, 7), &mut iq, &req);
        assert!(integ.accumulator().xcfd.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn seqlog_records_echoed_beam_of_every_sequence() {
        let dir = std::env::temp_dir().join(format!("radarctl-integrate-seqlog-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let mut log = SeqLog::new(&dir, "tst", 1);

        let mut integ = integrator(1, false);
        let main = vec![pack(1, 0); 64];
        let script = Script::new().sequence(&main, &main, 7).sequence(&main, &main, 8);
        let mut iq = IqBuffer::anonymous("test", 4096);
        let mut conn = Connection::from_stream(script.stream());
        let checkpoint = Checkpoint::new();
        let req = request(Some(Duration::from_secs(60)));
        let mut io = Acquisition { conn: &mut conn, iq: &mut iq, seqlog: Some(&mut log), checkpoint: &checkpoint };
        assert_eq!(integ.run(&mut io, &req).unwrap(), 1);

        let path = log.current_path().unwrap();
        log.close().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        // Two 20-byte entries: the accepted sequence and the one that changed beam.
        assert_eq!(bytes.len(), 40);
        let beam = |entry: usize| i32::from_le_bytes(bytes[entry * 20 + 8..entry * 20 + 12].try_into().unwrap());
        assert_eq!((beam(0), beam(1)), (7, 8));
        // tfreq comes from the echo, not the request.
        assert_eq!(i32::from_le_bytes(bytes[12..16].try_into().unwrap()), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
