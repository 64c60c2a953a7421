//! Summary statistics applied to per-site sample vectors.
//!
//! The registry is fixed: [`Stat::registry`] returns the stats every
//! aggregation pass computes, in display order.

use serde::Serialize;

/// Probability below which two distributions are considered different.
pub const SIGNIFICANCE_THRESHOLD: f64 = 0.05;

/// Fraction of the cross-site mean below which a value is favourable.
const PAINT_LOW: f64 = 0.8;
/// Fraction of the cross-site mean above which a value is unfavourable.
const PAINT_HIGH: f64 = 1.2;

/// Highlight assigned to a value relative to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Below,
    #[default]
    Neutral,
    Above,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatKind {
    Count,
    Mean,
    StdDev,
    /// Percentile in `[0, 100]`.
    Percentile(f64),
    /// Two-sided Mann-Whitney U p-value against the reference samples.
    Significance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub name: &'static str,
    pub kind: StatKind,
}

impl Stat {
    pub const fn new(name: &'static str, kind: StatKind) -> Self {
        Self { name, kind }
    }

    pub fn registry() -> Vec<Stat> {
        vec![
            Stat::new("n", StatKind::Count),
            Stat::new("mean", StatKind::Mean),
            Stat::new("stddev", StatKind::StdDev),
            Stat::new("p10", StatKind::Percentile(10.0)),
            Stat::new("p25", StatKind::Percentile(25.0)),
            Stat::new("p50", StatKind::Percentile(50.0)),
            Stat::new("p75", StatKind::Percentile(75.0)),
            Stat::new("p90", StatKind::Percentile(90.0)),
            Stat::new("p95", StatKind::Percentile(95.0)),
            Stat::new("significance", StatKind::Significance),
        ]
    }

    /// Whether the stat is computed for the reference site.
    pub fn applies_to_reference(&self) -> bool {
        !matches!(self.kind, StatKind::Significance)
    }

    /// Whether subtracting the reference value is meaningful.
    pub fn diff_applicable(&self) -> bool {
        !matches!(self.kind, StatKind::Significance)
    }

    /// Evaluate over `samples`, using `reference` where the stat compares
    /// two distributions directly.
    pub fn compute(&self, samples: &[f64], reference: Option<&[f64]>) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        match self.kind {
            StatKind::Count => Some(samples.len() as f64),
            StatKind::Mean => Some(mean(samples)),
            StatKind::StdDev => std_dev(samples),
            StatKind::Percentile(p) => Some(percentile(samples, p)),
            StatKind::Significance => mann_whitney_p(samples, reference?),
        }
    }

    /// Classify a cross-site vector of values.
    pub fn classify(&self, values: &[f64]) -> Vec<Verdict> {
        match self.kind {
            StatKind::Count => vec![Verdict::Neutral; values.len()],
            StatKind::Significance => values
                .iter()
                .map(|p| {
                    if *p < SIGNIFICANCE_THRESHOLD {
                        Verdict::Above
                    } else {
                        Verdict::Neutral
                    }
                })
                .collect(),
            _ => paint_relative(values),
        }
    }
}

/// Flag values far from the cross-site mean.
fn paint_relative(values: &[f64]) -> Vec<Verdict> {
    if values.is_empty() {
        return Vec::new();
    }
    let avg = mean(values);
    values
        .iter()
        .map(|value| {
            if *value < avg * PAINT_LOW {
                Verdict::Below
            } else if *value > avg * PAINT_HIGH {
                Verdict::Above
            } else {
                Verdict::Neutral
            }
        })
        .collect()
}

pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; undefined below two samples.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let avg = mean(values);
    let variance =
        values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Linear-interpolation percentile (R-7) of unsorted `values`, `p` in `[0, 100]`.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, p)
}

/// As [`percentile`], for input already sorted ascending.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let h = (n - 1) as f64 * (p / 100.0).clamp(0.0, 1.0);
    let lower = h.floor() as usize;
    let frac = h - h.floor();
    if lower + 1 >= n {
        return sorted[n - 1];
    }
    sorted[lower] + frac * (sorted[lower + 1] - sorted[lower])
}

/// Two-sided p-value of the Mann-Whitney U test, normal approximation with
/// tie correction and continuity correction.
pub fn mann_whitney_p(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let n1 = a.len() as f64;
    let n2 = b.len() as f64;

    let mut pooled: Vec<(f64, bool)> = a
        .iter()
        .map(|v| (*v, true))
        .chain(b.iter().map(|v| (*v, false)))
        .collect();
    pooled.sort_by(|x, y| x.0.total_cmp(&y.0));

    let mut rank_sum_a = 0.0;
    let mut tie_term = 0.0;
    let mut i = 0;
    while i < pooled.len() {
        let mut j = i;
        while j + 1 < pooled.len() && pooled[j + 1].0 == pooled[i].0 {
            j += 1;
        }
        // ranks are 1-based; ties share the average rank
        let rank = (i + j) as f64 / 2.0 + 1.0;
        let group = (j - i + 1) as f64;
        tie_term += group.powi(3) - group;
        rank_sum_a += pooled[i..=j].iter().filter(|(_, from_a)| *from_a).count() as f64 * rank;
        i = j + 1;
    }

    let u = rank_sum_a - n1 * (n1 + 1.0) / 2.0;
    let n = n1 + n2;
    let mu = n1 * n2 / 2.0;
    let variance = n1 * n2 / 12.0 * ((n + 1.0) - tie_term / (n * (n - 1.0)));
    if variance <= 0.0 {
        return Some(1.0);
    }
    let z = ((u - mu).abs() - 0.5).max(0.0) / variance.sqrt();
    Some((2.0 * (1.0 - normal_cdf(z))).clamp(0.0, 1.0))
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Abramowitz & Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}
