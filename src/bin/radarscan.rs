//! Standard phase-coded scan: sweep the configured beams once per scan
//! period, integrate each beam and publish the results to the downstream
//! tasks.

use clap::Parser;
use radarctl::config::{ConfigError, ScanConfig, SiteConfig};
use radarctl::publish::Publisher;
use radarctl::{Checkpoint, Scanner, Site, StandardAcf, shutdown};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub type BinResult<T, E = Box<dyn std::error::Error + Send + Sync>> = Result<T, E>;

const PROGRAM: &str = "radarscan";

fn main() {
    match bin_main() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            if let Some(e) = e.source() {
                eprintln!("error: {e}");
            }
            std::process::exit(1);
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Station id string, e.g. "sas" (defaults to $STSTR)
    #[arg(long)]
    stid: Option<String>,

    /// Channel string selecting `<stid>.<chan>.json`
    #[arg(long)]
    chan: Option<String>,

    /// Controller host
    #[arg(long)]
    ros: Option<String>,

    /// Radar channel number, minimum 1
    #[arg(short = 'c', long)]
    cnum: Option<i32>,

    /// Baud count for phase-coded sequences
    #[arg(long)]
    baud: Option<i32>,

    /// Lag spacing (µs)
    #[arg(long)]
    tau: Option<i32>,

    /// Number of range gates
    #[arg(long)]
    nrang: Option<i32>,

    /// Distance to first range (km)
    #[arg(long)]
    frang: Option<i32>,

    /// Range separation (km)
    #[arg(long)]
    rsep: Option<i32>,

    /// UTC hour day operation starts
    #[arg(long)]
    dt: Option<u32>,

    /// UTC hour night operation starts
    #[arg(long)]
    nt: Option<u32>,

    /// Day clear-frequency start (kHz)
    #[arg(long)]
    df: Option<i32>,

    /// Night clear-frequency start (kHz)
    #[arg(long)]
    nf: Option<i32>,

    /// Transmit on this frequency (kHz) without searching
    #[arg(long)]
    fixfrq: Option<i32>,

    /// Compute cross-correlations on every Nth integration
    #[arg(long)]
    xcf: Option<u32>,

    /// Base port of the downstream tasks
    #[arg(long)]
    bp: Option<u16>,

    /// First beam
    #[arg(long)]
    sb: Option<i32>,

    /// End beam (exclusive)
    #[arg(long)]
    eb: Option<i32>,

    /// Minimum seconds between clear-frequency searches
    #[arg(long)]
    clrskip: Option<i32>,

    /// Force a clear-frequency search at the start of every scan
    #[arg(long)]
    clrscan: bool,

    /// Control program id
    #[arg(long)]
    cpid: Option<i32>,

    /// Discretionary time
    #[arg(long)]
    di: bool,

    /// One-minute scans
    #[arg(long)]
    fast: bool,

    /// One-second integrations
    #[arg(long)]
    onesec: bool,

    /// Do not wait for scan boundaries
    #[arg(long)]
    nowait: bool,

    /// Second of the minute the first scan waits for
    #[arg(long)]
    wait: Option<u32>,

    /// Beam start offsets within the scan period (ms), comma separated
    #[arg(long, value_delimiter = ',')]
    sync: Vec<u32>,

    /// Print the derived parameters and exit without connecting
    #[arg(long)]
    test: bool,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn apply_site(&self, site: &mut SiteConfig) {
        if let Some(v) = &self.ros {
            site.ros_host = v.clone();
        }
        if let Some(v) = self.cnum {
            site.cnum = v;
        }
        if let Some(v) = self.dt {
            site.day = v;
        }
        if let Some(v) = self.nt {
            site.night = v;
        }
        if let Some(v) = self.df {
            site.dfrq = v;
        }
        if let Some(v) = self.nf {
            site.nfrq = v;
        }
        if let Some(v) = self.xcf {
            site.xcf = v;
        }
        if let Some(v) = self.bp {
            site.task_baseport = v;
        }
        if let Some(v) = self.sb {
            site.sbm = v;
        }
        if let Some(v) = self.eb {
            site.ebm = v;
        }
    }

    fn scan_config(&self, site: &SiteConfig) -> ScanConfig {
        let mut scan = ScanConfig {
            nbeams: (site.ebm - site.sbm).max(0) as usize,
            clrscan: self.clrscan,
            nowait: self.nowait,
            discretionary: self.di,
            fixfrq: self.fixfrq.filter(|f| *f > 0),
            ..Default::default()
        };
        if self.fast {
            scan.fast();
        }
        if self.onesec {
            scan.onesec();
        }
        if let Some(v) = self.baud {
            scan.nbaud = v;
        }
        if let Some(v) = self.tau {
            scan.mpinc = v;
        }
        if let Some(v) = self.nrang {
            scan.nrang = v;
        }
        if let Some(v) = self.frang {
            scan.frang = v;
        }
        if let Some(v) = self.rsep {
            scan.rsep = v;
        }
        if let Some(v) = self.clrskip {
            scan.clrskip_secs = v;
        }
        if let Some(v) = self.cpid {
            scan.cpid = v;
        }
        if let Some(v) = self.wait {
            scan.start_wait_secs = v.min(59);
        }
        if !self.sync.is_empty() {
            scan.sync_offsets_ms = Some(self.sync.clone());
        }
        scan.fit_integration_to_scan(self.onesec);
        scan
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn print_parameters(site: &SiteConfig, scan: &ScanConfig) -> BinResult<()> {
    let p = scan.timing_parameters()?;
    println!("Control program parameters:");
    println!("  xcf: {} nbaud: {} clrskip: {}", site.xcf, scan.nbaud, scan.clrskip_secs);
    println!("  cpid: {} program: '{PROGRAM}'", scan.effective_cpid());
    println!("Scan sequence parameters:");
    println!("  txpl: {} mpinc: {} nbaud: {} rsep: {}", p.txpl, p.mpinc, p.nbaud, p.rsep);
    println!(
        "  intsc: {} intus: {} scnsc: {} scnus: {} nowait: {}",
        scan.intsc, scan.intus, scan.scnsc, scan.scnus, scan.nowait
    );
    println!("  sbm: {} ebm: {} beams per scan: {}", site.sbm, site.ebm, scan.nbeams);
    let ts = scan.timing()?;
    println!("Sequence parameters:");
    println!("  lagfr: {} smsep: {} txpl: {}", ts.lagfr, ts.smsep, p.txpl);
    println!("The phase coded timing sequence looks good");
    Ok(())
}

fn bin_main() -> BinResult<i32> {
    let args = Args::parse();
    init_logging(args.debug);

    let stid = match args.stid.clone().or_else(|| std::env::var("STSTR").ok()) {
        Some(s) => s,
        None => return Err(ConfigError::MissingStation.into()),
    };
    let mut site = SiteConfig::from_env(&stid, args.chan.as_deref())?;
    args.apply_site(&mut site);
    let scan = args.scan_config(&site);

    if args.test {
        print_parameters(&site, &scan)?;
        println!("Test option enabled, exiting");
        return Ok(0);
    }
    // Bad timing or lags are configuration errors, caught before connecting.
    scan.timing()?;
    scan.lags()?;

    shutdown::install()?;
    let checkpoint = Checkpoint::new();
    let command = std::env::args().collect::<Vec<_>>().join(" ");

    let site_cfg = site.clone();
    let radar = match Site::connect(site, checkpoint) {
        Ok(s) => s,
        Err(e) => {
            error!("controller connection failed: {e}");
            return Ok(e.exit_code());
        }
    };
    let publisher = Publisher::connect(&site_cfg.task_addrs(), &command);
    let mut scanner = Scanner::new(radar, scan, StandardAcf, publisher, PROGRAM)?;
    if let Err(e) = scanner.setup() {
        return Ok(e.exit_code());
    }

    let stop = scanner.run();
    let code = stop.exit_code();
    info!(code, "{stop}");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> SiteConfig {
        SiteConfig::from_json(r#"{"station": "tst", "ebm": 4}"#).unwrap()
    }

    #[test]
    fn scan_timing_options() {
        let args = Args::try_parse_from(["radarscan", "--wait", "30", "--sync", "0,15000,30000,45000"]).unwrap();
        let scan = args.scan_config(&site());
        assert_eq!(scan.start_wait_secs, 30);
        assert_eq!(scan.sync_offsets_ms, Some(vec![0, 15_000, 30_000, 45_000]));
        assert_eq!(scan.nbeams, 4);
    }

    #[test]
    fn defaults_without_timing_options() {
        let scan = Args::try_parse_from(["radarscan"]).unwrap().scan_config(&site());
        assert_eq!(scan.start_wait_secs, 0);
        assert_eq!(scan.sync_offsets_ms, None);
    }

    #[test]
    fn fixed_frequency_must_be_positive() {
        let scan = Args::try_parse_from(["radarscan", "--fixfrq", "0"]).unwrap().scan_config(&site());
        assert_eq!(scan.fixfrq, None);
        let scan = Args::try_parse_from(["radarscan", "--fixfrq", "10900"]).unwrap().scan_config(&site());
        assert_eq!(scan.fixfrq, Some(10900));
    }
}
