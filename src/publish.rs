//! Result messages and downstream task streams.
//!
//! Each completed beam produces one multi-part message, sent to every
//! configured task. A message on the wire:
//!
//! ```text
//! 'd' count:i32 total:i32 { type:i32 tag:i32 size:i32 offset:i32 }[count] bodies
//! ```
//!
//! Task failures are logged and never stop the scan.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::acf::{IntegrationAccumulator, LagTable};
use crate::codec;
use crate::integrate::SequenceRecord;
use crate::shutdown;
use crate::timing::TimingSequence;

/// Format revision written into parameter and IQ parts.
pub const REVISION: (i32, i32) = (1, 0);

const MSG_OPEN: u8 = b'O';
const MSG_CLOSE: u8 = b'C';
const MSG_RESET: u8 = b'r';
const MSG_DATA: u8 = b'd';

/// Longest a task may take to accept a message or acknowledge it.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PartType {
    Parameters = b'p',
    Iq = b'i',
    BadTransmissions = b'b',
    IqSegment = b'I',
    Raw = b'r',
    Fit = b'f',
    ProgramName = b'n',
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub kind: PartType,
    pub tag: i32,
    pub body: Vec<u8>,
}

/// One beam's worth of parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMessage {
    parts: Vec<Part>,
}

impl ResultMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: PartType, body: Vec<u8>) {
        self.parts.push(Part { kind, tag: 0, body });
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn part(&self, kind: PartType) -> Option<&Part> {
        self.parts.iter().find(|p| p.kind == kind)
    }

    pub fn total_size(&self) -> usize {
        self.parts.iter().map(|p| p.body.len()).sum()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + 16 * self.parts.len() + self.total_size());
        buf.push(MSG_DATA);
        codec::write_i32(&mut buf, self.parts.len() as i32);
        codec::write_i32(&mut buf, self.total_size() as i32);
        let mut offset = 0usize;
        for p in &self.parts {
            codec::write_i32(&mut buf, i32::from(p.kind as u8));
            codec::write_i32(&mut buf, p.tag);
            codec::write_i32(&mut buf, p.body.len() as i32);
            codec::write_i32(&mut buf, offset as i32);
            offset += p.body.len();
        }
        for p in &self.parts {
            buf.extend_from_slice(&p.body);
        }
        buf
    }
}

// ---------------------------------------------------------------------------
// Part bodies
// ---------------------------------------------------------------------------

/// Radar operating parameters of one integration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RadarParm {
    pub revision: (i32, i32),
    pub cp: i32,
    pub stid: String,
    pub time: String,
    pub nave: i32,
    pub channel: i32,
    pub bmnum: i32,
    pub scan: i32,
    pub intt: (i32, i32),
    pub txpl: i32,
    pub mpinc: i32,
    pub mppul: usize,
    pub mplgs: usize,
    pub mplgexs: usize,
    pub nrang: i32,
    pub frang: i32,
    pub rsep: i32,
    pub lagfr: i32,
    pub smsep: i32,
    pub xcf: bool,
    pub tfreq: i32,
    pub noise_search: f32,
    pub ifmode: i32,
    pub combf: String,
    pub pulse: Vec<i32>,
    pub lag: Vec<(i32, i32)>,
}

/// Everything [`RadarParm::build`] reads besides the integration itself.
#[derive(Debug, Clone, Copy)]
pub struct BeamContext<'a> {
    pub station: &'a str,
    pub cpid: i32,
    pub channel: i32,
    pub beam: i32,
    /// True for the first beam of a scan.
    pub scan_start: bool,
    pub intt: (i32, i32),
    pub tfreq: i32,
    pub noise: f32,
    pub xcf: bool,
    pub ifmode: i32,
    pub program: &'a str,
}

fn timestamp(secs: i32, usecs: i32) -> String {
    let when = DateTime::from_timestamp(i64::from(secs), (usecs.max(0) as u32) * 1000).unwrap_or_else(Utc::now);
    when.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

impl RadarParm {
    pub fn build(ctx: &BeamContext<'_>, ts: &TimingSequence, lags: &LagTable, nave: i32, first: Option<&SequenceRecord>) -> Self {
        let p = &ts.params;
        let time = match first {
            Some(r) => timestamp(r.event_secs, r.event_usecs),
            None => Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
        };
        Self {
            revision: REVISION,
            cp: ctx.cpid,
            stid: ctx.station.to_string(),
            time,
            nave,
            channel: ctx.channel,
            bmnum: ctx.beam,
            scan: i32::from(ctx.scan_start),
            intt: ctx.intt,
            txpl: p.txpl,
            mpinc: p.mpinc,
            mppul: p.mppul(),
            mplgs: lags.mplgs(),
            mplgexs: if lags.is_extended() { lags.output_lags() } else { 0 },
            nrang: p.nrang,
            frang: p.frang,
            rsep: p.rsep,
            lagfr: ts.lagfr,
            smsep: ts.smsep,
            xcf: ctx.xcf,
            tfreq: ctx.tfreq,
            noise_search: ctx.noise,
            ifmode: ctx.ifmode,
            combf: ctx.program.to_string(),
            pulse: p.pattern.clone(),
            lag: lags.lags().to_vec(),
        }
    }

    pub fn flatten(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Per-sequence metadata of the IQ samples in the shared buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IqSequence {
    pub time: (i32, i32),
    pub atten: i32,
    pub noise: f32,
    pub offset: usize,
    pub size: usize,
    pub badtr: usize,
    pub stored: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IqMeta {
    pub revision: (i32, i32),
    pub seqnum: usize,
    pub chnnum: i32,
    pub smpnum: i32,
    pub skpnum: i32,
    pub sequences: Vec<IqSequence>,
}

impl IqMeta {
    pub fn build(records: &[SequenceRecord], chnnum: i32, ts: &TimingSequence) -> Self {
        Self {
            revision: REVISION,
            seqnum: records.len(),
            chnnum,
            smpnum: ts.total_samples(),
            skpnum: ts.smdelay,
            sequences: records
                .iter()
                .map(|r| IqSequence {
                    time: (r.event_secs, r.event_usecs),
                    atten: r.attenuation,
                    noise: r.noise,
                    offset: r.offset,
                    size: r.len,
                    badtr: r.bad_windows.len(),
                    stored: r.stored,
                })
                .collect(),
        }
    }

    pub fn flatten(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// All bad-transmission windows of an integration as `start:u32 duration:u32`
/// pairs, in sequence order.
pub fn flatten_bad_windows(records: &[SequenceRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    for w in records.iter().flat_map(|r| &r.bad_windows) {
        codec::write_u32(&mut buf, w.start_usec);
        codec::write_u32(&mut buf, w.duration_usec);
    }
    buf
}

/// `nrang:i32 mplgs:i32 xcf:i32 pwr0[nrang]:f32 acfd[nrang][mplgs][2]:f32`
/// then `xcfd` in the same shape when `xcf` is set.
pub fn flatten_raw(acc: &IntegrationAccumulator, xcf: bool) -> Vec<u8> {
    let floats = |v: &[f64]| v.iter().map(|x| *x as f32).collect::<Vec<f32>>();
    let mut buf = Vec::new();
    codec::write_i32(&mut buf, acc.nrang as i32);
    codec::write_i32(&mut buf, acc.mplgs as i32);
    codec::write_i32(&mut buf, i32::from(xcf));
    codec::write_f32_array(&mut buf, &floats(&acc.pwr0));
    codec::write_f32_array(&mut buf, &floats(&acc.acfd));
    if xcf {
        codec::write_f32_array(&mut buf, &floats(&acc.xcfd));
    }
    buf
}

/// Text followed by a NUL, with no length prefix.
fn cstring(s: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(s.len() + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    buf
}

/// Inputs to [`assemble`].
pub struct BeamResult<'a> {
    pub parm: &'a RadarParm,
    pub iq: &'a IqMeta,
    pub records: &'a [SequenceRecord],
    pub segment: &'a str,
    pub accumulator: &'a IntegrationAccumulator,
    pub fit: Option<Vec<u8>>,
    pub program: &'a str,
}

/// Build the message for one beam: parameters, IQ metadata, bad
/// transmissions, IQ segment name, raw correlations, fit (when present) and
/// program name, in that order.
pub fn assemble(result: BeamResult<'_>) -> serde_json::Result<ResultMessage> {
    let mut msg = ResultMessage::new();
    msg.push(PartType::Parameters, result.parm.flatten()?);
    msg.push(PartType::Iq, result.iq.flatten()?);
    msg.push(PartType::BadTransmissions, flatten_bad_windows(result.records));
    msg.push(PartType::IqSegment, cstring(result.segment));
    msg.push(PartType::Raw, flatten_raw(result.accumulator, result.parm.xcf));
    if let Some(fit) = result.fit {
        msg.push(PartType::Fit, fit);
    }
    msg.push(PartType::ProgramName, cstring(result.program));
    Ok(msg)
}

// ---------------------------------------------------------------------------
// Task streams
// ---------------------------------------------------------------------------

/// One downstream task. Every message is answered with an `i32`
/// acknowledgement. A task that fails or times out is dropped.
pub struct Task<S = TcpStream> {
    addr: String,
    stream: Option<S>,
    /// Descriptor published for interrupt escalation.
    fd: Option<RawFd>,
}

impl Task<TcpStream> {
    /// Connect to `addr`. A task that is not listening is kept in the list
    /// and skipped.
    pub fn connect(addr: &str) -> Self {
        Self::connect_with_timeout(addr, TASK_TIMEOUT)
    }

    pub fn connect_with_timeout(addr: &str, timeout: Duration) -> Self {
        let stream = TcpStream::connect(addr).and_then(|s| {
            s.set_read_timeout(Some(timeout))?;
            s.set_write_timeout(Some(timeout))?;
            let _ = s.set_nodelay(true);
            Ok(s)
        });
        match stream {
            Ok(s) => {
                let fd = s.as_raw_fd();
                let fd = shutdown::register_task_socket(fd).then_some(fd);
                Self { addr: addr.to_string(), stream: Some(s), fd }
            }
            Err(e) => {
                warn!(addr, "task unavailable: {e}");
                Self { addr: addr.to_string(), stream: None, fd: None }
            }
        }
    }
}

impl<S> Task<S> {
    fn disconnect(&mut self) {
        if let Some(fd) = self.fd.take() {
            shutdown::clear_task_socket(fd);
        }
        self.stream = None;
    }
}

impl<S> Drop for Task<S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<S: Read + Write> Task<S> {
    pub fn from_stream(addr: &str, stream: S) -> Self {
        Self { addr: addr.to_string(), stream: Some(stream), fd: None }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn get_ref(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    fn exchange(&mut self, wire: &[u8]) -> io::Result<i32> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        stream.write_all(wire)?;
        stream.flush()?;
        let mut ack = [0u8; 4];
        stream.read_exact(&mut ack)?;
        Ok(i32::from_le_bytes(ack))
    }

    fn send_logged(&mut self, what: &str, wire: &[u8]) -> bool {
        if self.stream.is_none() {
            return false;
        }
        match self.exchange(wire) {
            Ok(ack) => {
                debug!(addr = %self.addr, what, ack, "task acknowledged");
                true
            }
            Err(e) => {
                warn!(addr = %self.addr, what, "task send failed, dropping: {e}");
                self.disconnect();
                false
            }
        }
    }

    pub fn open(&mut self, command: &str) -> bool {
        let mut wire = vec![MSG_OPEN];
        codec::write_i32(&mut wire, command.len() as i32);
        wire.extend_from_slice(command.as_bytes());
        self.send_logged("open", &wire)
    }

    pub fn close(&mut self) -> bool {
        self.send_logged("close", &[MSG_CLOSE])
    }

    pub fn reset(&mut self) -> bool {
        self.send_logged("reset", &[MSG_RESET])
    }

    pub fn send(&mut self, msg: &ResultMessage) -> bool {
        self.send_logged("data", &msg.encode())
    }
}

/// All downstream tasks plus the command string they are opened with.
pub struct Publisher<S = TcpStream> {
    tasks: Vec<Task<S>>,
    command: String,
}

impl Publisher<TcpStream> {
    pub fn connect(addrs: &[String], command: &str) -> Self {
        let tasks = addrs.iter().map(|a| Task::connect(a)).collect();
        Self::new(tasks, command)
    }
}

impl<S: Read + Write> Publisher<S> {
    pub fn new(tasks: Vec<Task<S>>, command: &str) -> Self {
        Self { tasks, command: command.to_string() }
    }

    pub fn tasks(&self) -> &[Task<S>] {
        &self.tasks
    }

    /// Reset and open every task.
    pub fn start(&mut self) {
        for t in &mut self.tasks {
            t.reset();
            t.open(&self.command);
        }
        info!(tasks = self.tasks.len(), "downstream tasks opened");
    }

    /// Close and re-open every task so they start new files.
    pub fn reopen(&mut self) {
        info!("opening new files");
        for t in &mut self.tasks {
            t.close();
            t.open(&self.command);
        }
    }

    /// Send to every task. Returns how many acknowledged.
    pub fn send(&mut self, msg: &ResultMessage) -> usize {
        self.tasks.iter_mut().map(|t| t.send(msg)).filter(|ok| *ok).count()
    }

    pub fn close(&mut self) {
        for t in &mut self.tasks {
            t.close();
        }
    }
}
