//! Scan Orchestrator.
//!
//! The pure scheduling pieces (beam plan, starting beam, clear-frequency
//! schedule, cross-correlation cadence, file reopen clock, boundary
//! arithmetic) come first; [`Scanner`] drives them against a [`Site`].

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, info, warn};

use crate::acf::{AcfEngine, StandardAcf};
use crate::config::{ScanConfig, SiteConfig};
use crate::integrate::{BeamRequest, IntegrationOptions, Integrator};
use crate::opcode::Opcode;
use crate::protocol::scan::ScanStart;
use crate::publish::{self, BeamContext, BeamResult, IqMeta, Publisher, RadarParm};
use crate::shutdown;
use crate::site::{RETRY_BACKOFF, Site, SiteError};
use crate::timing::TimingSequence;

/// Hours per downstream file block.
pub const REOPEN_HOURS: i64 = 2;
/// Lead subtracted when locating the starting beam (µs).
const SKIP_LEAD_US: i64 = 100_000;

/// Next multiple of `period` strictly after `now` (both in seconds).
pub fn next_boundary(now: f64, period: f64) -> f64 {
    if period <= 0.0 {
        return now;
    }
    period * (1.0 + now / period).floor()
}

/// Day operation at UTC `hour`. `day`/`night` are the hours each starts;
/// the window wraps midnight when `day > night`.
pub fn is_day(hour: u32, day: u32, night: u32) -> bool {
    if day < night {
        hour >= day && hour < night
    } else {
        hour < night || hour >= day
    }
}

/// Beams visited by one scan, with the clear-frequency band of each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeamScanPlan {
    pub beams: Vec<i32>,
    pub fstarts: Vec<i32>,
    pub bandwidths: Vec<i32>,
}

impl BeamScanPlan {
    /// `count` beams stepping up from `sbm`, or down from `ebm - 1` when
    /// `backward`.
    pub fn beam_order(sbm: i32, ebm: i32, backward: bool, count: usize) -> Vec<i32> {
        let (first, step) = if backward { (ebm - 1, -1) } else { (sbm, 1) };
        (0..count as i32).map(|i| first + step * i).collect()
    }

    pub fn build(site: &SiteConfig, scan: &ScanConfig, hour: u32) -> Self {
        let beams = Self::beam_order(site.sbm, site.ebm, site.backward, scan.nbeams);
        let fstart = if is_day(hour, site.day, site.night) { site.dfrq } else { site.nfrq };
        Self {
            fstarts: vec![fstart; beams.len()],
            bandwidths: vec![site.frqrng; beams.len()],
            beams,
        }
    }

    pub fn len(&self) -> usize {
        self.beams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }

    /// The `SET_ACTIVE` announcement, starting at beam index `start`.
    pub fn scan_start(&self, scan: &ScanConfig, start: usize) -> ScanStart {
        ScanStart {
            beams: self.beams.clone(),
            fstarts: self.fstarts.clone(),
            bandwidths: self.bandwidths.clone(),
            fixfreq: scan.fixfrq.unwrap_or(-1),
            scnsc: scan.scnsc,
            scnus: scan.scnus,
            intsc: scan.intsc,
            intus: scan.intus,
            start: start as i32,
        }
    }
}

/// Index of the beam that should be running at `now`, so a late start
/// joins the scan in step with the boundary.
pub fn find_skip(now: DateTime<Utc>, scan: Duration, intt: Duration, nbeams: usize) -> usize {
    let scan_us = scan.as_micros() as i64;
    let intt_us = intt.as_micros() as i64;
    if scan_us <= 0 || intt_us <= 0 {
        return 0;
    }
    let into_hour = (i64::from(now.minute()) * 60 + i64::from(now.second())) * 1_000_000
        + i64::from(now.nanosecond() / 1000);
    let skip = (into_hour + intt_us / 2 - SKIP_LEAD_US).rem_euclid(scan_us) / intt_us;
    if skip < 0 || skip as usize >= nbeams { 0 } else { skip as usize }
}

/// Wait before a beam whose start is pinned `offset_ms` into the scan
/// period; `None` when already late.
pub fn beam_sync_wait(now: DateTime<Utc>, scan: Duration, offset_ms: u32) -> Option<Duration> {
    let period_ms = scan.as_millis() as i64;
    if period_ms <= 0 {
        return None;
    }
    let now_ms = (i64::from(now.minute()) * 60 + i64::from(now.second())) * 1000
        + i64::from(now.nanosecond() / 1_000_000);
    let wait = i64::from(offset_ms) - now_ms % period_ms;
    (wait > 0).then(|| Duration::from_millis(wait as u64))
}

/// Decides when a clear-frequency search is due.
#[derive(Debug, Clone)]
pub struct ClearFreqSchedule {
    /// Minimum seconds between searches; negative searches every beam.
    skip_secs: i32,
    last: Option<Instant>,
    forced: bool,
}

impl ClearFreqSchedule {
    /// The first check after construction is always due.
    pub fn new(skip_secs: i32) -> Self {
        Self { skip_secs, last: None, forced: true }
    }

    /// Make the next check due regardless of elapsed time.
    pub fn force(&mut self) {
        self.forced = true;
    }

    pub fn due(&self, now: Instant) -> bool {
        if self.forced {
            return true;
        }
        match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last).as_secs() as i64 >= i64::from(self.skip_secs),
        }
    }

    /// Record a search (or a skipped search under a fixed frequency).
    pub fn mark(&mut self, now: Instant) {
        self.forced = false;
        self.last = Some(now);
    }
}

/// Enables cross-correlation on every `every`th beam integration.
#[derive(Debug, Clone, Copy, Default)]
pub struct XcfCadence {
    every: u32,
    count: u32,
}

impl XcfCadence {
    pub fn new(every: u32) -> Self {
        Self { every, count: 0 }
    }

    /// Whether the next completed integration is the one that computes
    /// XCFs. Does not advance the count.
    pub fn due(&self) -> bool {
        self.every != 0 && self.count + 1 == self.every
    }

    /// Count one completed integration; true when it was the XCF one.
    pub fn tick(&mut self) -> bool {
        if self.every == 0 {
            return false;
        }
        self.count += 1;
        if self.count == self.every {
            self.count = 0;
            true
        } else {
            false
        }
    }
}

/// Signals when the wall clock crosses into a new [`REOPEN_HOURS`] block.
#[derive(Debug, Clone, Default)]
pub struct ReopenClock {
    block: Option<i64>,
}

impl ReopenClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first call only records the current block.
    pub fn check(&mut self, now: DateTime<Utc>) -> bool {
        let block = now.timestamp().div_euclid(REOPEN_HOURS * 3600);
        let changed = self.block.is_some_and(|b| b != block);
        self.block = Some(block);
        changed
    }
}

// ---------------------------------------------------------------------------
// Scan loop
// ---------------------------------------------------------------------------

/// How a scan attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed { beams: usize },
    /// The controller refused the sequence or the scan start; try again.
    Retry,
}

pub struct Scanner<S = TcpStream, T = TcpStream, E = StandardAcf> {
    site: Site<S>,
    scan: ScanConfig,
    integrator: Integrator<E>,
    publisher: Publisher<T>,
    program: String,
    clear: ClearFreqSchedule,
    xcf: XcfCadence,
    reopen: ReopenClock,
    registered: bool,
    tfreq: i32,
    noise: f32,
}

impl<S: Read + Write, T: Read + Write, E: AcfEngine> Scanner<S, T, E> {
    pub fn new(
        site: Site<S>,
        scan: ScanConfig,
        engine: E,
        publisher: Publisher<T>,
        program: &str,
    ) -> Result<Self, SiteError> {
        let timing = scan.timing()?;
        let lags = scan.lags()?;
        let cfg = site.config();
        let options = IntegrationOptions {
            radar: cfg.rnum as u8,
            channel: cfg.cnum as u8,
            match_filter: cfg.match_filter,
            invert: cfg.invert,
        };
        let tfreq = scan.fixfrq.unwrap_or(cfg.dfrq);
        let xcf = XcfCadence::new(cfg.xcf);
        let clear = ClearFreqSchedule::new(scan.clrskip_secs);
        Ok(Self {
            integrator: Integrator::new(engine, timing, lags, options),
            site,
            scan,
            publisher,
            program: program.to_string(),
            clear,
            xcf,
            reopen: ReopenClock::new(),
            registered: false,
            tfreq,
            noise: 0.0,
        })
    }

    pub fn site(&self) -> &Site<S> {
        &self.site
    }

    pub fn publisher(&self) -> &Publisher<T> {
        &self.publisher
    }

    pub fn integrator(&self) -> &Integrator<E> {
        &self.integrator
    }

    fn timing(&self) -> &TimingSequence {
        self.integrator.timing()
    }

    /// Claim the channel, allocate the IQ buffer and open the downstream
    /// tasks.
    pub fn setup(&mut self) -> Result<(), SiteError> {
        let timing = self.timing().clone();
        if let Err(e) = self.site.setup_radar(&timing, self.scan.intsc) {
            return Err(self.site.fail(e));
        }
        self.publisher.start();
        Ok(())
    }

    /// Run scans until cancelled or a fatal error. Either way the session
    /// has been shut down when this returns.
    pub fn run(&mut self) -> SiteError {
        info!(program = %self.program, nbeams = self.scan.nbeams, "entering scan loop");
        loop {
            match self.run_scan() {
                Ok(outcome) => debug!(?outcome, "scan attempt finished"),
                Err(e) => {
                    self.publisher.close();
                    return self.site.fail(e);
                }
            }
        }
    }

    /// Close the downstream tasks and shut the session down.
    pub fn shutdown(&mut self) {
        self.publisher.close();
        self.site.terminate();
    }

    /// One scan attempt: register the sequence if needed, announce the
    /// plan, integrate each beam and wait out the boundary.
    pub fn run_scan(&mut self) -> Result<ScanOutcome, SiteError> {
        self.site.checkpoint()?;

        if !self.registered {
            let timing = self.timing().clone();
            match self.site.register_sequence(&timing) {
                Ok(_) => self.registered = true,
                Err(e) if e.is_rejected(Opcode::RegisterSeq) => {
                    warn!("{e}, retrying");
                    self.site.sleep(RETRY_BACKOFF)?;
                    return Ok(ScanOutcome::Retry);
                }
                Err(e) => return Err(e),
            }
        }

        let now = Utc::now();
        let plan = BeamScanPlan::build(self.site.config(), &self.scan, now.hour());
        let start = match (self.scan.nowait, self.scan.intt()) {
            (false, Some(intt)) => find_skip(now, self.scan.scan_period(), intt, plan.len()),
            _ => 0,
        };

        match self.site.start_scan(&plan.scan_start(&self.scan, start), self.scan.start_wait_secs) {
            Ok(()) => {}
            Err(e) if e.is_rejected(Opcode::SetActive) => {
                warn!("{e}, channel busy");
                self.site.sleep(RETRY_BACKOFF)?;
                return Ok(ScanOutcome::Retry);
            }
            Err(e) => return Err(e),
        }

        if self.reopen.check(Utc::now()) | shutdown::take_reopen() {
            self.publisher.reopen();
        }
        if self.scan.clrscan {
            self.clear.force();
        }
        info!(start, beams = plan.len(), "starting scan");

        let mut done = 0;
        for index in start..plan.len() {
            self.run_beam(&plan, index, index == start)?;
            done += 1;
        }

        if !self.scan.nowait {
            self.site.end_scan(self.scan.scan_period())?;
        }
        Ok(ScanOutcome::Completed { beams: done })
    }

    fn run_beam(&mut self, plan: &BeamScanPlan, index: usize, first: bool) -> Result<(), SiteError> {
        self.site.checkpoint()?;
        let beam = plan.beams[index];

        if let Some(offset) = self.scan.sync_offsets_ms.as_ref().and_then(|t| t.get(index).copied())
            && let Some(wait) = beam_sync_wait(Utc::now(), self.scan.scan_period(), offset)
        {
            debug!(beam, wait_ms = wait.as_millis() as u64, "synchronising beam start");
            self.site.ping_for(wait)?;
        }

        let mut stfrq = plan.fstarts[index];
        if let Some(fix) = self.scan.fixfrq {
            stfrq = fix;
            self.tfreq = fix;
            self.noise = 0.0;
        }

        let mut req = BeamRequest {
            beam,
            tfreq: self.tfreq,
            rfreq: None,
            duration: self.scan.intt(),
            xcf: self.xcf.due(),
            noise: self.noise,
        };
        info!(beam, intsc = self.scan.intsc, intus = self.scan.intus, xcf = req.xcf, "integrating beam");
        self.site.start_integration(&mut self.integrator, &req)?;

        let now = Instant::now();
        if self.clear.due(now) {
            if self.scan.fixfrq.is_none() {
                let block = self.integrator.parameter_block(&req);
                let assigned = self.site.clear_frequency(&block, stfrq, stfrq + plan.bandwidths[index])?;
                self.tfreq = assigned.tfreq;
                self.noise = assigned.noise;
                req.tfreq = self.tfreq;
                req.noise = self.noise;
            }
            self.clear.mark(now);
        }
        info!(tfreq = self.tfreq, noise = self.noise, "transmitting");

        let nave = self.site.integrate(&mut self.integrator, &req)?;
        if nave < 0 {
            warn!(beam, nave, "integration error, skipping beam");
            return Ok(());
        }
        self.xcf.tick();
        info!(beam, nave, "number of sequences");
        self.publish(&req, nave, first);
        Ok(())
    }

    fn publish(&mut self, req: &BeamRequest, nave: i32, first: bool) {
        let cfg = self.site.config();
        let ctx = BeamContext {
            station: &cfg.station,
            cpid: self.scan.effective_cpid(),
            channel: cfg.cnum,
            beam: req.beam,
            scan_start: first,
            intt: (self.scan.intsc, self.scan.intus),
            tfreq: req.tfreq,
            noise: req.noise,
            xcf: req.xcf,
            ifmode: self.site.ifmode().unwrap_or(0),
            program: &self.program,
        };
        let integ = &self.integrator;
        let records = integ.records();
        let parm = RadarParm::build(&ctx, integ.timing(), integ.lags(), nave, records.first());
        let iq = IqMeta::build(records, cfg.rxchn, integ.timing());
        let segment = self.site.iq().map(|b| b.name().to_string()).unwrap_or_default();
        let result = BeamResult {
            parm: &parm,
            iq: &iq,
            records,
            segment: &segment,
            accumulator: integ.accumulator(),
            fit: integ.engine().fit(integ.accumulator()),
            program: &self.program,
        };
        match publish::assemble(result) {
            Ok(msg) => {
                let acked = self.publisher.send(&msg);
                debug!(beam = req.beam, parts = msg.parts().len(), acked, "results published");
            }
            Err(e) => warn!(beam = req.beam, "result encoding failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: u32, sec: u32, ms: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, min, sec).unwrap() + chrono::Duration::milliseconds(i64::from(ms))
    }

    #[test]
    fn day_window() {
        assert!(is_day(12, 10, 18));
        assert!(!is_day(18, 10, 18));
        assert!(!is_day(9, 10, 18));
        // wraps midnight
        assert!(is_day(20, 18, 10));
        assert!(is_day(3, 18, 10));
        assert!(!is_day(12, 18, 10));
    }

    #[test]
    fn beam_order_directions() {
        assert_eq!(BeamScanPlan::beam_order(0, 16, false, 4), vec![0, 1, 2, 3]);
        assert_eq!(BeamScanPlan::beam_order(0, 16, true, 4), vec![15, 14, 13, 12]);
    }

    #[test]
    fn plan_uses_day_or_night_band() {
        let mut site = SiteConfig::from_json(r#"{"station": "tst", "dfrq": 12000, "nfrq": 10200, "frqrng": 250}"#).unwrap();
        site.day = 10;
        site.night = 18;
        let scan = ScanConfig { nbeams: 3, ..Default::default() };
        let day = BeamScanPlan::build(&site, &scan, 12);
        assert_eq!(day.fstarts, vec![12000; 3]);
        assert_eq!(day.bandwidths, vec![250; 3]);
        let night = BeamScanPlan::build(&site, &scan, 22);
        assert_eq!(night.fstarts, vec![10200; 3]);
    }

    #[test]
    fn scan_start_carries_fixed_frequency() {
        let site = SiteConfig::from_json(r#"{"station": "tst"}"#).unwrap();
        let scan = ScanConfig { nbeams: 2, fixfrq: Some(10900), ..Default::default() };
        let s = BeamScanPlan::build(&site, &scan, 0).scan_start(&scan, 1);
        assert_eq!(s.fixfreq, 10900);
        assert_eq!(s.start, 1);
        let scan = ScanConfig { nbeams: 2, ..Default::default() };
        assert_eq!(BeamScanPlan::build(&site, &scan, 0).scan_start(&scan, 0).fixfreq, -1);
    }

    #[test]
    fn skip_follows_wall_clock() {
        let scan = Duration::from_secs(60);
        let intt = Duration::from_secs(3);
        // 12:00:00 lands in the first slot.
        assert_eq!(find_skip(at(0, 0, 0), scan, intt, 16), 0);
        // 12:07:31 → 31 s into the minute → beam 10.
        assert_eq!(find_skip(at(7, 31, 0), scan, intt, 16), 10);
        // past the planned beams
        assert_eq!(find_skip(at(0, 55, 0), scan, intt, 16), 0);
        assert_eq!(find_skip(at(0, 30, 0), scan, Duration::ZERO, 16), 0);
    }

    #[test]
    fn sync_wait_only_when_early() {
        let scan = Duration::from_secs(60);
        assert_eq!(beam_sync_wait(at(1, 10, 0), scan, 12_500), Some(Duration::from_millis(2500)));
        assert_eq!(beam_sync_wait(at(1, 13, 0), scan, 12_500), None);
    }

    #[test]
    fn clear_search_skipped_inside_threshold() {
        let mut s = ClearFreqSchedule::new(60);
        let t0 = Instant::now();
        assert!(s.due(t0));
        s.mark(t0);
        assert!(!s.due(t0 + Duration::from_secs(10)));
        assert!(s.due(t0 + Duration::from_secs(60)));
        s.force();
        assert!(s.due(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn negative_skip_searches_every_beam() {
        let mut s = ClearFreqSchedule::new(-1);
        let t0 = Instant::now();
        s.mark(t0);
        assert!(s.due(t0));
    }

    #[test]
    fn xcf_every_third_integration() {
        let mut c = XcfCadence::new(3);
        let got: Vec<bool> = (0..6).map(|_| c.tick()).collect();
        assert_eq!(got, [false, false, true, false, false, true]);
        let mut off = XcfCadence::new(0);
        assert!((0..5).all(|_| !off.due() && !off.tick()));
    }

    #[test]
    fn xcf_cadence_skips_failed_integrations() {
        let mut c = XcfCadence::new(2);
        assert!(!c.due());
        c.tick();
        // A failed integration checks the cadence but never ticks it.
        assert!(c.due());
        assert!(c.due());
        assert!(c.tick());
        assert!(!c.due());
    }

    #[test]
    fn reopen_on_two_hour_block_change() {
        let mut r = ReopenClock::new();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 1, 59, 0).unwrap();
        assert!(!r.check(t));
        assert!(!r.check(t + chrono::Duration::seconds(30)));
        assert!(r.check(t + chrono::Duration::minutes(2)));
        assert!(!r.check(t + chrono::Duration::minutes(3)));
    }

    #[test]
    fn boundary_is_next_multiple() {
        assert_eq!(next_boundary(125.0, 60.0), 180.0);
        assert_eq!(next_boundary(120.0, 60.0), 180.0);
        assert_eq!(next_boundary(5.0, 0.0), 5.0);
    }
}
