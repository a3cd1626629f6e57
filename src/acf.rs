//! Correlation engine contract and accumulator.
//!
//! The integration loop owns an [`IntegrationAccumulator`] and lends it to an
//! [`AcfEngine`] once per sequence. [`StandardAcf`] is the lag-product engine
//! used by the scan program; other engines plug in through the trait.

use thiserror::Error;

use crate::decode::unpack;
use crate::timing::TimingSequence;

/// Largest range count an accumulator is built for.
pub const MAX_RANGE: usize = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcfError {
    #[error("lag table needs at least one lag and the alternate lag-zero pair")]
    ShortLagTable,

    #[error("range count {0} out of bounds (max {MAX_RANGE})")]
    RangeCount(i32),
}

/// Pulse-position pairs defining each lag.
///
/// Entries are pulse positions in units of the lag spacing. The last entry is
/// the alternate lag-zero pair used for ranges contaminated by the second
/// pulse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagTable {
    pairs: Vec<(i32, i32)>,
}

impl LagTable {
    pub fn new(pairs: Vec<(i32, i32)>) -> Result<Self, AcfError> {
        if pairs.len() < 2 {
            return Err(AcfError::ShortLagTable);
        }
        Ok(Self { pairs })
    }

    /// Number of lags, excluding the alternate lag-zero pair.
    pub fn mplgs(&self) -> usize {
        self.pairs.len() - 1
    }

    pub fn lags(&self) -> &[(i32, i32)] {
        &self.pairs[..self.mplgs()]
    }

    pub fn alternate_zero(&self) -> (i32, i32) {
        self.pairs[self.pairs.len() - 1]
    }

    pub fn pairs(&self) -> &[(i32, i32)] {
        &self.pairs
    }

    /// Pairs per lag number `|p2 - p1|`, over the lags proper.
    pub fn lag_sums(&self) -> Vec<usize> {
        let max = self.lags().iter().map(|(a, b)| (b - a).unsigned_abs() as usize).max().unwrap_or(0);
        let mut sums = vec![0; max + 1];
        for (a, b) in self.lags() {
            sums[(b - a).unsigned_abs() as usize] += 1;
        }
        sums
    }

    /// True when several pairs map to the same lag number, so lags are
    /// averaged across pairs by the extended engine path.
    pub fn is_extended(&self) -> bool {
        self.lag_sums().iter().any(|&n| n > 1)
    }

    /// Lags in the accumulator: one per pair, or one per lag number when
    /// extended.
    pub fn output_lags(&self) -> usize {
        if self.is_extended() { self.lag_sums().len() } else { self.mplgs() }
    }
}

/// Which pair of channels a correlation combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationPart {
    /// Main with main.
    Acf,
    /// Main with interferometer.
    Xcf,
}

/// Sample index arithmetic for one timing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub nrang: usize,
    smdelay: i32,
    lagfr: i32,
    mpinc: i32,
    smsep: i32,
}

impl Geometry {
    pub fn new(ts: &TimingSequence) -> Self {
        Self {
            nrang: ts.params.nrang.max(0) as usize,
            smdelay: ts.smdelay,
            lagfr: ts.lagfr,
            mpinc: ts.params.mpinc,
            smsep: ts.smsep.max(1),
        }
    }

    /// Index of the sample holding range `range` after the pulse at `pos`.
    pub fn index(&self, pos: i32, range: usize) -> usize {
        let t = pos * self.mpinc + self.lagfr;
        (self.smdelay + t / self.smsep) as usize + range
    }

    /// First range whose echo from the first pulse is sampled while the
    /// second pulse is on the air.
    pub fn bad_range(&self, pattern: &[i32]) -> usize {
        let [first, second, ..] = pattern else {
            return self.nrang;
        };
        let gap = (second - first) * self.mpinc - self.lagfr;
        if gap <= 0 {
            return 0;
        }
        ((gap / self.smsep) as usize).min(self.nrang)
    }
}

/// The two channels of one sequence.
#[derive(Debug, Clone, Copy)]
pub struct SequenceSamples<'a> {
    pub main: &'a [u32],
    pub back: &'a [u32],
}

/// Per-range power and per-range-per-lag complex correlations, summed over
/// the sequences of one integration.
///
/// `acfd`/`xcfd` are laid out `[range][lag][re, im]`.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationAccumulator {
    pub nrang: usize,
    pub mplgs: usize,
    pub pwr0: Vec<f64>,
    pub acfd: Vec<f64>,
    pub xcfd: Vec<f64>,
    pub nave: u32,
}

impl IntegrationAccumulator {
    pub fn new(nrang: usize, mplgs: usize) -> Self {
        Self {
            nrang,
            mplgs,
            pwr0: vec![0.0; nrang],
            acfd: vec![0.0; nrang * mplgs * 2],
            xcfd: vec![0.0; nrang * mplgs * 2],
            nave: 0,
        }
    }

    pub fn reset(&mut self) {
        self.pwr0.iter_mut().for_each(|v| *v = 0.0);
        self.acfd.iter_mut().for_each(|v| *v = 0.0);
        self.xcfd.iter_mut().for_each(|v| *v = 0.0);
        self.nave = 0;
    }

    fn slot(&self, range: usize, lag: usize) -> usize {
        (range * self.mplgs + lag) * 2
    }

    pub fn acf(&self, range: usize, lag: usize) -> (f64, f64) {
        let i = self.slot(range, lag);
        (self.acfd[i], self.acfd[i + 1])
    }

    pub fn xcf(&self, range: usize, lag: usize) -> (f64, f64) {
        let i = self.slot(range, lag);
        (self.xcfd[i], self.xcfd[i + 1])
    }

    fn add(&mut self, part: CorrelationPart, range: usize, lag: usize, re: f64, im: f64) {
        let i = self.slot(range, lag);
        let buf = match part {
            CorrelationPart::Acf => &mut self.acfd,
            CorrelationPart::Xcf => &mut self.xcfd,
        };
        buf[i] += re;
        buf[i + 1] += im;
    }
}

/// Everything an engine needs to reduce one sequence.
#[derive(Debug, Clone, Copy)]
pub struct AcfContext<'a> {
    pub geometry: Geometry,
    pub lags: &'a LagTable,
    /// First range that uses the alternate lag-zero pair.
    pub badrng: usize,
}

/// Correlation engine call contract.
pub trait AcfEngine {
    /// First range contaminated for lag zero. Called once per integration.
    fn bad_lag_zero(&self, geometry: &Geometry, pattern: &[i32]) -> usize {
        geometry.bad_range(pattern)
    }

    /// Add this sequence's lag-zero power into `acc.pwr0`.
    fn sum_power(&self, ctx: &AcfContext<'_>, seq: SequenceSamples<'_>, acc: &mut IntegrationAccumulator);

    /// Add this sequence's lag products into `acc.acfd` or `acc.xcfd`.
    fn calculate(
        &self,
        ctx: &AcfContext<'_>,
        seq: SequenceSamples<'_>,
        part: CorrelationPart,
        acc: &mut IntegrationAccumulator,
    );

    /// Divide the sums by `acc.nave`.
    fn average(&self, acc: &mut IntegrationAccumulator) {
        if acc.nave == 0 {
            return;
        }
        let n = f64::from(acc.nave);
        acc.pwr0.iter_mut().for_each(|v| *v /= n);
        acc.acfd.iter_mut().for_each(|v| *v /= n);
        acc.xcfd.iter_mut().for_each(|v| *v /= n);
    }

    /// Whole-integration reduction for lag tables with redundant pairs.
    /// `acc.nave` is already set; the result is averaged.
    fn calculate_extended(
        &self,
        ctx: &AcfContext<'_>,
        sequences: &[SequenceSamples<'_>],
        acc: &mut IntegrationAccumulator,
    );

    /// Fitted parameters in the engine's own encoding, if it fits.
    fn fit(&self, _acc: &IntegrationAccumulator) -> Option<Vec<u8>> {
        None
    }
}

/// Plain lag-product engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardAcf;

fn sample(channel: &[u32], index: usize) -> Option<(f64, f64)> {
    channel.get(index).map(|&s| {
        let (i, q) = unpack(s);
        (f64::from(i), f64::from(q))
    })
}

/// Real `I1·I2 + Q1·Q2`, imaginary `I1·Q2 − Q1·I2`.
fn lag_product((i1, q1): (f64, f64), (i2, q2): (f64, f64)) -> (f64, f64) {
    (i1 * i2 + q1 * q2, i1 * q2 - q1 * i2)
}

impl StandardAcf {
    fn pair_for(ctx: &AcfContext<'_>, lag: usize, range: usize) -> (i32, i32) {
        if lag == 0 && range >= ctx.badrng {
            ctx.lags.alternate_zero()
        } else {
            ctx.lags.lags()[lag]
        }
    }
}

impl AcfEngine for StandardAcf {
    fn sum_power(&self, ctx: &AcfContext<'_>, seq: SequenceSamples<'_>, acc: &mut IntegrationAccumulator) {
        for range in 0..ctx.geometry.nrang.min(acc.nrang) {
            let (pos, _) = Self::pair_for(ctx, 0, range);
            if let Some((i, q)) = sample(seq.main, ctx.geometry.index(pos, range)) {
                acc.pwr0[range] += i * i + q * q;
            }
        }
    }

    fn calculate(
        &self,
        ctx: &AcfContext<'_>,
        seq: SequenceSamples<'_>,
        part: CorrelationPart,
        acc: &mut IntegrationAccumulator,
    ) {
        let second = match part {
            CorrelationPart::Acf => seq.main,
            CorrelationPart::Xcf => seq.back,
        };
        for range in 0..ctx.geometry.nrang.min(acc.nrang) {
            for lag in 0..ctx.lags.mplgs().min(acc.mplgs) {
                let (p1, p2) = Self::pair_for(ctx, lag, range);
                let s1 = sample(seq.main, ctx.geometry.index(p1, range));
                let s2 = sample(second, ctx.geometry.index(p2, range));
                if let (Some(s1), Some(s2)) = (s1, s2) {
                    let (re, im) = lag_product(s1, s2);
                    acc.add(part, range, lag, re, im);
                }
            }
        }
    }

    fn calculate_extended(
        &self,
        ctx: &AcfContext<'_>,
        sequences: &[SequenceSamples<'_>],
        acc: &mut IntegrationAccumulator,
    ) {
        let sums = ctx.lags.lag_sums();
        for seq in sequences {
            self.sum_power(ctx, *seq, acc);
            for range in 0..ctx.geometry.nrang.min(acc.nrang) {
                for &(p1, p2) in ctx.lags.lags() {
                    let lag = (p2 - p1).unsigned_abs() as usize;
                    if lag >= acc.mplgs {
                        continue;
                    }
                    let s1 = sample(seq.main, ctx.geometry.index(p1, range));
                    let s2 = sample(seq.main, ctx.geometry.index(p2, range));
                    if let (Some(s1), Some(s2)) = (s1, s2) {
                        let (re, im) = lag_product(s1, s2);
                        acc.add(CorrelationPart::Acf, range, lag, re, im);
                    }
                }
            }
        }
        let nave = f64::from(acc.nave.max(1));
        acc.pwr0.iter_mut().for_each(|v| *v /= nave);
        for range in 0..acc.nrang {
            for (lag, &count) in sums.iter().enumerate().take(acc.mplgs) {
                if count == 0 {
                    continue;
                }
                let i = acc.slot(range, lag);
                let div = nave * count as f64;
                acc.acfd[i] /= div;
                acc.acfd[i + 1] /= div;
            }
        }
    }
}
