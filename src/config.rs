//! Site configuration and scan parameters.
//!
//! The site file is JSON at `$SITE_CFG/site.<stid>/<stid>.json` (or
//! `<stid>.<chan>.json` for a channel-specific file). Every setting except
//! `station` has a default; missing settings are logged with the value used.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::acf::{AcfError, LagTable};
use crate::timing::{TimingError, TimingSequence, TimingSequenceParameters};

/// Environment variable naming the site configuration root.
pub const SITE_CFG_ENV: &str = "SITE_CFG";
/// Environment variable naming the sequence log directory when the site
/// file has none.
pub const SEQLOG_DIR_ENV: &str = "SEQLOG_DIR";

/// Start delay of registered sequences, in clock periods.
pub const STDELAY: i32 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{SITE_CFG_ENV} is not set")]
    NoConfigDir,

    #[error("read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("parse {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },

    #[error("no 'station' setting in site configuration")]
    MissingStation,

    #[error(transparent)]
    Timing(#[from] TimingError),

    #[error(transparent)]
    Lags(#[from] AcfError),
}

impl ConfigError {
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ConfigError::Read { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawRos {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTasks {
    baseport: Option<u16>,
    ports: Option<Vec<u16>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSiteConfig {
    station: Option<String>,
    match_filter: Option<i32>,
    backward: Option<i32>,
    xcf: Option<u32>,
    sbm: Option<i32>,
    ebm: Option<i32>,
    rnum: Option<i32>,
    cnum: Option<i32>,
    ros: Option<RawRos>,
    tasks: Option<RawTasks>,
    invert: Option<i32>,
    rxchn: Option<i32>,
    day: Option<u32>,
    night: Option<u32>,
    dfrq: Option<i32>,
    nfrq: Option<i32>,
    frqrng: Option<i32>,
    seqlog_dir: Option<PathBuf>,
}

/// Station settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    pub station: String,
    pub match_filter: bool,
    /// Scan beams in decreasing order.
    pub backward: bool,
    /// Cross-correlation cadence: every Nth integration, 0 disables.
    pub xcf: u32,
    /// First beam of the scan range.
    pub sbm: i32,
    /// End of the scan range (exclusive).
    pub ebm: i32,
    pub rnum: i32,
    pub cnum: i32,
    pub ros_host: String,
    pub ros_port: u16,
    pub task_baseport: u16,
    /// Downstream task ports as offsets from `task_baseport`.
    pub task_ports: Vec<u16>,
    /// Negate the main channel.
    pub invert: bool,
    pub rxchn: i32,
    /// UTC hour day operation starts.
    pub day: u32,
    /// UTC hour night operation starts.
    pub night: u32,
    /// Day clear-frequency start (kHz).
    pub dfrq: i32,
    /// Night clear-frequency start (kHz).
    pub nfrq: i32,
    /// Clear-frequency band width (kHz).
    pub frqrng: i32,
    pub seqlog_dir: Option<PathBuf>,
}

fn setting<T: Debug>(value: Option<T>, name: &str, default: T) -> T {
    value.unwrap_or_else(|| {
        warn!(setting = name, default = ?default, "site setting undefined, using default");
        default
    })
}

impl SiteConfig {
    /// Path of the site file for station `stid`, optional channel `chan`.
    pub fn path(dir: &Path, stid: &str, chan: Option<&str>) -> PathBuf {
        let file = match chan {
            Some(chan) => format!("{stid}.{chan}.json"),
            None => format!("{stid}.json"),
        };
        dir.join(format!("site.{stid}")).join(file)
    }

    /// Load the site file from `$SITE_CFG`.
    pub fn from_env(stid: &str, chan: Option<&str>) -> Result<Self, ConfigError> {
        let dir = std::env::var_os(SITE_CFG_ENV).ok_or(ConfigError::NoConfigDir)?;
        Self::load(&Self::path(Path::new(&dir), stid, chan))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!(path = %path.display(), "opening site configuration");
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_json(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path: path.to_path_buf(), source },
            other => other,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawSiteConfig = serde_json::from_str(text)
            .map_err(|source| ConfigError::Parse { path: PathBuf::new(), source })?;
        Self::resolve(raw)
    }

    fn resolve(raw: RawSiteConfig) -> Result<Self, ConfigError> {
        let station = raw.station.filter(|s| !s.is_empty()).ok_or(ConfigError::MissingStation)?;
        let ros = raw.ros.unwrap_or_default();
        let tasks = raw.tasks.unwrap_or_default();
        let seqlog_dir = raw
            .seqlog_dir
            .or_else(|| std::env::var_os(SEQLOG_DIR_ENV).map(PathBuf::from));
        let config = Self {
            station,
            match_filter: setting(raw.match_filter, "match_filter", 0) != 0,
            backward: setting(raw.backward, "backward", 0) != 0,
            xcf: setting(raw.xcf, "xcf", 0),
            sbm: setting(raw.sbm, "sbm", 0),
            ebm: setting(raw.ebm, "ebm", 16),
            rnum: setting(raw.rnum, "rnum", 1),
            cnum: setting(raw.cnum, "cnum", 1),
            ros_host: setting(ros.host, "ros.host", "127.0.0.1".to_string()),
            ros_port: setting(ros.port, "ros.port", 45000),
            task_baseport: setting(tasks.baseport, "tasks.baseport", 45001),
            task_ports: tasks.ports.unwrap_or_default(),
            invert: setting(raw.invert, "invert", 1) != 0,
            rxchn: setting(raw.rxchn, "rxchn", 1),
            day: setting(raw.day, "day", 18),
            night: setting(raw.night, "night", 10),
            dfrq: setting(raw.dfrq, "dfrq", 10400),
            nfrq: setting(raw.nfrq, "nfrq", 10400),
            frqrng: setting(raw.frqrng, "frqrng", 300),
            seqlog_dir,
        };
        info!(station = %config.station, rnum = config.rnum, cnum = config.cnum, "site configuration loaded");
        Ok(config)
    }

    pub fn controller_addr(&self) -> String {
        format!("{}:{}", self.ros_host, self.ros_port)
    }

    /// Downstream task addresses on the local host.
    pub fn task_addrs(&self) -> Vec<String> {
        self.task_ports
            .iter()
            .map(|off| format!("127.0.0.1:{}", u32::from(self.task_baseport) + u32::from(*off)))
            .collect()
    }
}

/// Control program parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub intsc: i32,
    pub intus: i32,
    pub scnsc: i32,
    pub scnus: i32,
    /// Lag spacing (µs), before adjustment.
    pub mpinc: i32,
    pub nrang: i32,
    pub frang: i32,
    pub rsep: i32,
    pub nbaud: i32,
    pub nbeams: usize,
    /// Pulse positions in units of `mpinc`.
    pub pulse_table: Vec<i32>,
    /// Lag pairs; the last entry is the alternate lag-zero pair.
    pub lag_table: Vec<(i32, i32)>,
    /// Minimum seconds between clear-frequency searches.
    pub clrskip_secs: i32,
    /// Force a clear-frequency search at every scan start.
    pub clrscan: bool,
    /// Do not wait for scan boundaries.
    pub nowait: bool,
    pub fixfrq: Option<i32>,
    pub cpid: i32,
    pub discretionary: bool,
    /// Second of the minute to wait for before starting a scan.
    pub start_wait_secs: u32,
    /// Beam start offsets within the scan period (ms).
    pub sync_offsets_ms: Option<Vec<u32>>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            intsc: 7,
            intus: 0,
            scnsc: 180,
            scnus: 0,
            mpinc: 20000,
            nrang: 100,
            frang: 180,
            rsep: 15,
            nbaud: 5,
            nbeams: 16,
            pulse_table: (0..=32).collect(),
            lag_table: vec![(0, 0), (0, 1), (9, 9)],
            clrskip_secs: -1,
            clrscan: false,
            nowait: false,
            fixfrq: None,
            cpid: 10000,
            discretionary: false,
            start_wait_secs: 0,
            sync_offsets_ms: None,
        }
    }
}

impl ScanConfig {
    /// One-minute scans of three-second integrations.
    pub fn fast(&mut self) {
        self.scnsc = 60;
        self.scnus = 0;
        self.intsc = 3;
        self.intus = 0;
    }

    pub fn onesec(&mut self) {
        self.intsc = 1;
        self.intus = 0;
    }

    /// Spread `scan - 3 s` over the beams when a long scan has to fit the
    /// boundary. No-op for 16 beams or fewer, or without boundary waiting.
    pub fn fit_integration_to_scan(&mut self, onesec: bool) {
        if self.nbeams <= 16 || self.nowait || onesec {
            return;
        }
        let total = (i64::from(self.scnsc) - 3) * 1_000_000 + i64::from(self.scnus);
        let per_beam = total / self.nbeams as i64;
        self.intsc = (per_beam / 1_000_000) as i32;
        self.intus = (per_beam % 1_000_000) as i32;
        info!(intsc = self.intsc, intus = self.intus, nbeams = self.nbeams, "integration time fitted to scan");
    }

    /// Integration time, or `None` to integrate a single sequence.
    pub fn intt(&self) -> Option<Duration> {
        let us = i64::from(self.intsc) * 1_000_000 + i64::from(self.intus);
        (us > 0).then(|| Duration::from_micros(us as u64))
    }

    pub fn scan_period(&self) -> Duration {
        let us = i64::from(self.scnsc) * 1_000_000 + i64::from(self.scnus);
        Duration::from_micros(us.max(0) as u64)
    }

    /// Control program id as reported downstream; negative for
    /// discretionary time.
    pub fn effective_cpid(&self) -> i32 {
        if self.discretionary { -self.cpid } else { self.cpid }
    }

    pub fn lags(&self) -> Result<LagTable, ConfigError> {
        Ok(LagTable::new(self.lag_table.clone())?)
    }

    pub fn timing_parameters(&self) -> Result<TimingSequenceParameters, ConfigError> {
        let mut p = TimingSequenceParameters::new(
            self.nrang,
            self.frang,
            self.rsep,
            self.nbaud,
            self.mpinc,
            &self.pulse_table,
        )?;
        p.stdelay = STDELAY;
        Ok(p)
    }

    pub fn timing(&self) -> Result<TimingSequence, ConfigError> {
        Ok(TimingSequence::make(&self.timing_parameters()?)?)
    }
}
