//! Session context: the connection, IQ buffer, sequence log and checkpoint
//! of one radar channel, plus the setup and scan-signalling steps that use
//! more than one of them.
//!
//! Every fatal path ends in [`Site::terminate`], which runs at most once.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::acf::AcfEngine;
use crate::config::{ConfigError, SiteConfig};
use crate::conn::{ConnError, Connection};
use crate::integrate::{Acquisition, BeamRequest, IntegrateError, Integrator};
use crate::iqbuf::{IqBuffer, IqBufferError};
use crate::opcode::Opcode;
use crate::protocol::clrfreq::{AssignedFrequency, ClearFreqParameters};
use crate::protocol::params::ControlParameters;
use crate::protocol::scan::ScanStart;
use crate::protocol::sequence::SequenceRegistration;
use crate::protocol::settings::IFMODE_SETTING;
use crate::scan::next_boundary;
use crate::seq;
use crate::seqlog::SeqLog;
use crate::shutdown::{self, Cancelled, Checkpoint, StopReason};
use crate::timing::{TimingError, TimingSequence, iq_buffer_size};

/// Poll interval while waiting for a boundary.
pub const BOUNDARY_POLL: Duration = Duration::from_millis(50);
/// Backoff after a busy or rejected scan start.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SiteError {
    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error("radar {radar} channel {channel} unavailable (status {status})")]
    ChannelUnavailable { radar: i32, channel: i32, status: i32 },

    #[error("unsupported IF mode {0:?}")]
    UnsupportedIfMode(Option<i32>),

    #[error(transparent)]
    IqAlloc(#[from] IqBufferError),

    #[error(transparent)]
    Timing(#[from] TimingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl From<IntegrateError> for SiteError {
    fn from(e: IntegrateError) -> Self {
        match e {
            IntegrateError::Conn(e) => SiteError::Conn(e),
            IntegrateError::Cancelled(c) => SiteError::Cancelled(c),
        }
    }
}

impl SiteError {
    /// Process exit status: 0 for a requested stop, else the OS error
    /// carried by the failure, else 1.
    pub fn exit_code(&self) -> i32 {
        let os = match self {
            SiteError::Cancelled(_) => return 0,
            SiteError::Conn(e) => e.raw_os_error(),
            SiteError::IqAlloc(e) => e.raw_os_error(),
            SiteError::Config(e) => e.raw_os_error(),
            _ => None,
        };
        os.unwrap_or(1)
    }

    /// The controller refused the request with `opcode`.
    pub fn is_rejected(&self, opcode: Opcode) -> bool {
        matches!(self, SiteError::Conn(ConnError::Rejected { opcode: op, .. }) if *op == opcode)
    }
}

/// Seconds since the epoch as a float.
fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

pub struct Site<S = TcpStream> {
    config: SiteConfig,
    conn: Option<Connection<S>>,
    iq: Option<IqBuffer>,
    seqlog: Option<SeqLog>,
    checkpoint: Checkpoint,
    ifmode: Option<i32>,
    terminated: bool,
}

impl Site<TcpStream> {
    /// Connect to the configured controller and publish the socket for
    /// interrupt escalation.
    pub fn connect(config: SiteConfig, checkpoint: Checkpoint) -> Result<Self, SiteError> {
        let addr = config.controller_addr();
        let conn = Connection::connect(addr.as_str())?;
        shutdown::register_socket(conn.raw_fd());
        info!(%addr, "connected to controller");
        Ok(Self::from_connection(config, conn, checkpoint))
    }
}

impl<S: Read + Write> Site<S> {
    pub fn from_connection(config: SiteConfig, conn: Connection<S>, checkpoint: Checkpoint) -> Self {
        Self {
            config,
            conn: Some(conn),
            iq: None,
            seqlog: None,
            checkpoint,
            ifmode: None,
            terminated: false,
        }
    }

    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    pub fn ifmode(&self) -> Option<i32> {
        self.ifmode
    }

    pub fn iq(&self) -> Option<&IqBuffer> {
        self.iq.as_ref()
    }

    pub fn connection(&self) -> Option<&Connection<S>> {
        self.conn.as_ref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn conn(&mut self) -> Result<&mut Connection<S>, SiteError> {
        self.conn.as_mut().ok_or(SiteError::Conn(ConnError::Disconnected))
    }

    /// Check the stop condition; the first terminal observation shuts the
    /// session down.
    pub fn checkpoint(&mut self) -> Result<(), SiteError> {
        if let Err(c) = self.checkpoint.check() {
            self.terminate();
            return Err(c.into());
        }
        Ok(())
    }

    /// Sleep with checkpoints.
    pub fn sleep(&mut self, total: Duration) -> Result<(), SiteError> {
        if let Err(c) = self.checkpoint.sleep(total, BOUNDARY_POLL) {
            self.terminate();
            return Err(c.into());
        }
        Ok(())
    }

    /// Route a failure through the shutdown sequence. A connection failure
    /// after a stop was requested is the stop itself (interrupt escalation
    /// shuts the sockets) and is reported as cancelled.
    pub fn fail(&mut self, err: SiteError) -> SiteError {
        let err = match (err, self.checkpoint.reason()) {
            (SiteError::Conn(_), Some(reason)) => {
                debug!("connection closed after stop request");
                SiteError::Cancelled(Cancelled(reason))
            }
            (err, _) => err,
        };
        if !matches!(err, SiteError::Cancelled(_)) {
            error!("{err}");
        }
        self.terminate();
        err
    }

    /// Claim the channel, check the IF mode, allocate the IQ buffer for
    /// `timing` and open the sequence log.
    pub fn setup_radar(&mut self, timing: &TimingSequence, intsc: i32) -> Result<(), SiteError> {
        self.checkpoint()?;
        let (radar, channel) = (self.config.rnum, self.config.cnum);
        match seq::set_channel(self.conn()?, radar, channel) {
            Ok(()) => {}
            Err(ConnError::Rejected { status, .. }) => {
                std::thread::sleep(RETRY_BACKOFF);
                return Err(SiteError::ChannelUnavailable { radar, channel, status });
            }
            Err(e) => return Err(e.into()),
        }

        let ifmode = seq::query_bool_setting(self.conn()?, IFMODE_SETTING)?;
        if !matches!(ifmode, Some(0 | 1)) {
            return Err(SiteError::UnsupportedIfMode(ifmode));
        }
        self.ifmode = ifmode;
        seq::get_parameters(self.conn()?)?;

        self.allocate_iq(timing, intsc)?;

        if let Some(dir) = self.config.seqlog_dir.clone() {
            info!(dir = %dir.display(), "sequence log enabled");
            self.seqlog = Some(SeqLog::new(dir, &self.config.station, channel));
        }
        Ok(())
    }

    /// (Re)allocate the IQ buffer for `timing`.
    pub fn allocate_iq(&mut self, timing: &TimingSequence, intsc: i32) -> Result<(), SiteError> {
        let p = &timing.params;
        let size = iq_buffer_size(p.mppul(), intsc, p.nbaud, p.mpinc);
        let name = IqBuffer::segment_name(self.config.rnum, self.config.cnum);
        if let Some(mut old) = self.iq.take() {
            old.release();
        }
        info!(%name, size, intsc, nbaud = p.nbaud, mpinc = p.mpinc, "allocating IQ buffer");
        self.iq = Some(IqBuffer::allocate(&name, size)?);
        Ok(())
    }

    /// Use a caller-provided IQ buffer.
    pub fn set_iq(&mut self, iq: IqBuffer) {
        self.iq = Some(iq);
    }

    /// Register `timing` as sequence 0. A rejection comes back as
    /// `SiteError::Conn(ConnError::Rejected { .. })`.
    pub fn register_sequence(&mut self, timing: &TimingSequence) -> Result<i32, SiteError> {
        self.checkpoint()?;
        let reg = SequenceRegistration::from_timing(0, timing);
        let index = seq::register_sequence(self.conn()?, &reg)?;
        info!(index, len = reg.rep.len(), smsep = timing.smsep, lagfr = timing.lagfr, "sequence registered");
        Ok(index)
    }

    /// Ping once a second until the second of the minute reaches
    /// `wait_seconds`, then announce the scan.
    pub fn start_scan(&mut self, plan: &ScanStart, wait_seconds: u32) -> Result<(), SiteError> {
        let mut count = 0;
        while count < wait_seconds {
            self.checkpoint()?;
            if (now_secs() as u64 % 60) >= u64::from(wait_seconds) {
                break;
            }
            seq::ping(self.conn()?)?;
            count += 1;
            self.sleep(Duration::from_secs(1))?;
        }
        self.checkpoint()?;
        seq::set_active(self.conn()?, plan)?;
        debug!(beams = plan.beams.len(), start = plan.start, "scan started");
        Ok(())
    }

    /// Deactivate, then ping until the next multiple of `period`.
    pub fn end_scan(&mut self, period: Duration) -> Result<(), SiteError> {
        self.checkpoint()?;
        let boundary = next_boundary(now_secs(), period.as_secs_f64());
        seq::set_inactive(self.conn()?)?;
        debug!(boundary, "waiting for scan boundary");
        self.ping_until(boundary)
    }

    /// Ping every [`BOUNDARY_POLL`] until the wall clock passes `boundary`
    /// (seconds since the epoch).
    pub fn ping_until(&mut self, boundary: f64) -> Result<(), SiteError> {
        loop {
            self.checkpoint()?;
            if now_secs() > boundary {
                return Ok(());
            }
            seq::ping(self.conn()?)?;
            self.sleep(BOUNDARY_POLL)?;
        }
    }

    /// Keep the controller connection alive for `wait`.
    pub fn ping_for(&mut self, wait: Duration) -> Result<(), SiteError> {
        self.ping_until(now_secs() + wait.as_secs_f64())
    }

    /// Clear-frequency search over `[start, end)` kHz. The parameter block
    /// is pushed first so the controller searches on the right beam.
    pub fn clear_frequency(
        &mut self,
        block: &ControlParameters,
        start: i32,
        end: i32,
    ) -> Result<AssignedFrequency, SiteError> {
        self.checkpoint()?;
        let block = ControlParameters { tfreq: start, rfreq: start, ..block.clone() };
        let conn = self.conn()?;
        seq::set_parameters(conn, &block)?;
        let assigned = seq::clear_frequency_search(conn, &ClearFreqParameters::band(start, end))?;
        info!(start, end, tfreq = assigned.tfreq, noise = assigned.noise, "clear frequency assigned");
        Ok(assigned)
    }

    /// Prime the controller for a beam.
    pub fn start_integration<E: AcfEngine>(
        &mut self,
        integ: &mut Integrator<E>,
        req: &BeamRequest,
    ) -> Result<(), SiteError> {
        self.checkpoint()?;
        integ.start(self.conn()?, req)?;
        Ok(())
    }

    /// Run one integration. Cancellation inside the loop shuts the session
    /// down before returning.
    pub fn integrate<E: AcfEngine>(
        &mut self,
        integ: &mut Integrator<E>,
        req: &BeamRequest,
    ) -> Result<i32, SiteError> {
        self.checkpoint()?;
        let (Some(conn), Some(iq)) = (self.conn.as_mut(), self.iq.as_mut()) else {
            return Err(SiteError::Conn(ConnError::Disconnected));
        };
        let mut io = Acquisition {
            conn,
            iq,
            seqlog: self.seqlog.as_mut(),
            checkpoint: &self.checkpoint,
        };
        let result = integ.run(&mut io, req);
        if let Some(log) = self.seqlog.as_mut()
            && let Err(e) = log.flush()
        {
            warn!("sequence log flush failed: {e}");
        }
        match result {
            Ok(nave) => Ok(nave),
            Err(IntegrateError::Cancelled(c)) => {
                self.terminate();
                Err(c.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Quit, close the connection, flush the sequence log and release the
    /// IQ buffer. Only the first call does anything.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let reason = self.checkpoint.reason().unwrap_or(StopReason::Requested);
        info!(%reason, "shutting down");

        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = seq::quit(&mut conn) {
                debug!("quit not acknowledged: {e}");
            }
            shutdown::clear_socket();
        }
        if let Some(mut log) = self.seqlog.take()
            && let Err(e) = log.close()
        {
            warn!("sequence log close failed: {e}");
        }
        if let Some(mut iq) = self.iq.take() {
            iq.release();
        }
    }
}

impl<S> Drop for Site<S> {
    fn drop(&mut self) {
        // The buffer and log release themselves; the escalation hook must
        // not outlive the socket.
        if self.conn.is_some() {
            shutdown::clear_socket();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockStream, Script};

    fn config() -> SiteConfig {
        SiteConfig::from_json(r#"{"station": "tst"}"#).unwrap()
    }

    fn site(script: Script) -> Site<MockStream> {
        Site::from_connection(config(), Connection::from_stream(script.stream()), Checkpoint::new())
    }

    #[test]
    fn exit_codes() {
        assert_eq!(SiteError::Cancelled(Cancelled(StopReason::Requested)).exit_code(), 0);
        assert_eq!(SiteError::UnsupportedIfMode(Some(3)).exit_code(), 1);
        let io = std::io::Error::from_raw_os_error(libc::ECONNRESET);
        assert_eq!(SiteError::Conn(ConnError::Io(io)).exit_code(), libc::ECONNRESET);
    }

    #[test]
    fn channel_unavailable_is_fatal() {
        let mut s = site(Script::new().status(Opcode::SetRadarChan, -1));
        let ts = crate::config::ScanConfig::default().timing().unwrap();
        assert!(matches!(
            s.setup_radar(&ts, 7),
            Err(SiteError::ChannelUnavailable { radar: 1, channel: 1, status: -1 })
        ));
    }

    #[test]
    fn bad_ifmode_is_fatal() {
        let script = Script::new()
            .status(Opcode::SetRadarChan, 0)
            .u8(b'b')
            .i32(4)
            .i32(2)
            .status(Opcode::QueryIniSettings, 1);
        let mut s = site(script);
        let ts = crate::config::ScanConfig::default().timing().unwrap();
        assert!(matches!(s.setup_radar(&ts, 7), Err(SiteError::UnsupportedIfMode(Some(2)))));
    }

    #[test]
    fn checkpoint_terminates_exactly_once() {
        let mut s = site(Script::new().status(Opcode::Quit, 0));
        s.set_iq(IqBuffer::anonymous("test", 16));
        s.checkpoint.cancel();
        assert!(matches!(s.checkpoint(), Err(SiteError::Cancelled(_))));
        assert!(s.is_terminated());
        assert!(s.connection().is_none());
        assert!(s.iq().is_none());
        // Second observation: no further I/O, still cancelled.
        assert!(matches!(s.checkpoint(), Err(SiteError::Cancelled(_))));
    }

    #[test]
    fn disconnect_after_stop_exits_cleanly() {
        let mut s = site(Script::new());
        s.checkpoint.cancel();
        let err = s.fail(SiteError::Conn(ConnError::Disconnected));
        assert!(matches!(err, SiteError::Cancelled(_)));
        assert_eq!(err.exit_code(), 0);
        assert!(s.is_terminated());
    }

    #[test]
    fn disconnect_while_running_is_fatal() {
        let mut s = site(Script::new());
        let err = s.fail(SiteError::Conn(ConnError::Disconnected));
        assert!(matches!(err, SiteError::Conn(ConnError::Disconnected)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn terminate_tolerates_dead_controller() {
        let mut s = site(Script::new());
        s.terminate();
        assert!(s.is_terminated());
    }

    #[test]
    fn clear_frequency_pushes_block_first() {
        let script = Script::new()
            .status(Opcode::SetParameters, 0)
            .status(Opcode::RequestClearFreqSearch, 0)
            .i32(10650)
            .f32(0.5)
            .status(Opcode::RequestAssignedFreq, 0);
        let mut s = site(script);
        let block = ControlParameters { beam: 3, tfreq: 12000, ..Default::default() };
        let assigned = s.clear_frequency(&block, 10400, 10700).unwrap();
        assert_eq!(assigned.tfreq, 10650);
        let written = s.connection().unwrap().get_ref().written();
        assert_eq!(written[0], b'C');
        let sent = ControlParameters::decode(&written[5..]).unwrap();
        assert_eq!((sent.beam, sent.tfreq), (3, 10400));
    }

    #[test]
    fn start_scan_without_wait() {
        let mut s = site(Script::new().status(Opcode::SetActive, 0));
        s.start_scan(&ScanStart::default(), 0).unwrap();
    }

    #[test]
    fn busy_scan_start_is_recognisable() {
        let mut s = site(Script::new().status(Opcode::SetActive, -1));
        let err = s.start_scan(&ScanStart::default(), 0).unwrap_err();
        assert!(err.is_rejected(Opcode::SetActive));
        assert!(!s.is_terminated());
    }
}
