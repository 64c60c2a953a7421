//! Incremental aggregation of per-site samples into comparable statistics.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::BenchError;
use crate::stats::{Stat, Verdict};

/// Readings from one successful check, one per tracked metric.
pub type MetricSample = Vec<f64>;

/// Value, reference-relative diff and highlight of one stat for one site.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct DerivedResult {
    pub value: Option<f64>,
    pub diff: Option<f64>,
    pub highlight: Verdict,
}

/// Snapshot produced by one aggregation pass.
///
/// `cells[site][metric][stat]` all derive from the first `min_iterations`
/// samples of their site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultsSnapshot {
    pub min_iterations: usize,
    pub sites: Vec<String>,
    pub metrics: Vec<String>,
    pub stats: Vec<String>,
    pub cells: Vec<Vec<Vec<DerivedResult>>>,
}

impl ResultsSnapshot {
    pub fn cell(&self, site: usize, metric: usize, stat: usize) -> Option<&DerivedResult> {
        self.cells.get(site)?.get(metric)?.get(stat)
    }

    /// Look a cell up by metric and stat name.
    pub fn get(&self, site: usize, metric: &str, stat: &str) -> Option<&DerivedResult> {
        let metric = self.metrics.iter().position(|m| m == metric)?;
        let stat = self.stats.iter().position(|s| s == stat)?;
        self.cell(site, metric, stat)
    }
}

/// Owns the raw sample matrix and the scheduling counters of one cycle.
#[derive(Debug)]
pub struct MetricsAggregator {
    sites: Vec<String>,
    metrics: Vec<String>,
    stats: Vec<Stat>,
    target: usize,
    /// `raw[site][metric]` in completion order.
    raw: Vec<Vec<Vec<f64>>>,
    completed: Vec<usize>,
    in_flight: Vec<usize>,
}

impl MetricsAggregator {
    pub fn new(sites: Vec<String>, metrics: Vec<String>, stats: Vec<Stat>, target: usize) -> Self {
        let site_count = sites.len();
        let metric_count = metrics.len();
        Self {
            sites,
            metrics,
            stats,
            target,
            raw: vec![vec![Vec::new(); metric_count]; site_count],
            completed: vec![0; site_count],
            in_flight: vec![0; site_count],
        }
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    pub fn site_name(&self, site: usize) -> &str {
        &self.sites[site]
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn completed(&self, site: usize) -> usize {
        self.completed[site]
    }

    pub fn in_flight(&self, site: usize) -> usize {
        self.in_flight[site]
    }

    pub fn total_in_flight(&self) -> usize {
        self.in_flight.iter().sum()
    }

    pub fn report_start(&mut self, site: usize) {
        self.in_flight[site] += 1;
    }

    pub fn report_end(&mut self, site: usize) {
        self.in_flight[site] = self.in_flight[site].saturating_sub(1);
    }

    /// Append one accepted sample for `site`.
    pub fn add_sample(&mut self, site: usize, sample: &[f64]) -> Result<(), BenchError> {
        if sample.len() != self.metrics.len() {
            return Err(BenchError::SampleShape {
                site,
                got: sample.len(),
                expected: self.metrics.len(),
            });
        }
        for (series, value) in self.raw[site].iter_mut().zip(sample) {
            series.push(*value);
        }
        self.completed[site] += 1;
        Ok(())
    }

    /// Site that should receive the next check, or `None` once every site
    /// reached the target.
    ///
    /// Only sites still below target are candidates; among them the one with
    /// the fewest completed plus in-flight checks wins, lowest index on ties.
    pub fn next_site_index(&self) -> Option<usize> {
        (0..self.sites.len())
            .filter(|site| self.completed[*site] < self.target)
            .min_by_key(|site| (self.completed[*site] + self.in_flight[*site], *site))
    }

    pub fn least_iterations(&self) -> usize {
        self.completed.iter().copied().min().unwrap_or(0)
    }

    /// Raw samples of one site and metric, in completion order.
    pub fn samples(&self, site: usize, metric: usize) -> &[f64] {
        &self.raw[site][metric]
    }

    /// Recompute every derived cell over the common truncation window.
    pub fn calculate_results(&self) -> ResultsSnapshot {
        let window = self.least_iterations();
        let site_count = self.sites.len();
        if site_count == 0 {
            return ResultsSnapshot {
                min_iterations: 0,
                sites: Vec::new(),
                metrics: self.metrics.clone(),
                stats: self.stats.iter().map(|stat| stat.name.to_string()).collect(),
                cells: Vec::new(),
            };
        }

        // cross-site vectors for this pass only
        let mut cross_site: HashMap<(usize, usize), Vec<Option<f64>>> = HashMap::new();
        for metric in 0..self.metrics.len() {
            let reference = &self.raw[0][metric][..window];
            for (index, stat) in self.stats.iter().enumerate() {
                let values = (0..site_count)
                    .map(|site| {
                        if window == 0 || (site == 0 && !stat.applies_to_reference()) {
                            return None;
                        }
                        let samples = &self.raw[site][metric][..window];
                        stat.compute(samples, Some(reference))
                    })
                    .collect();
                cross_site.insert((metric, index), values);
            }
        }

        let mut cells =
            vec![vec![vec![DerivedResult::default(); self.stats.len()]; self.metrics.len()]; site_count];
        for ((metric, index), values) in &cross_site {
            let stat = &self.stats[*index];
            let highlights = paint(stat, values);
            for site in 0..site_count {
                let value = values[site];
                let diff = match (site, value, values[0]) {
                    (0, _, _) => None,
                    (_, Some(v), Some(r)) if stat.diff_applicable() => Some(v - r),
                    _ => None,
                };
                cells[site][*metric][*index] = DerivedResult {
                    value,
                    diff,
                    highlight: highlights[site],
                };
            }
        }

        ResultsSnapshot {
            min_iterations: window,
            sites: self.sites.clone(),
            metrics: self.metrics.clone(),
            stats: self.stats.iter().map(|stat| stat.name.to_string()).collect(),
            cells,
        }
    }
}

/// Highlights for a cross-site vector.
///
/// Sites the stat does not apply to stay neutral and are left out of the
/// comparison; any other missing value leaves the whole vector neutral.
fn paint(stat: &Stat, values: &[Option<f64>]) -> Vec<Verdict> {
    let mut verdicts = vec![Verdict::Neutral; values.len()];
    let skip = usize::from(!stat.applies_to_reference());
    if values.len() <= skip {
        return verdicts;
    }
    let numeric: Option<Vec<f64>> = values[skip..].iter().copied().collect();
    if let Some(numeric) = numeric {
        for (slot, verdict) in verdicts[skip..].iter_mut().zip(stat.classify(&numeric)) {
            *slot = verdict;
        }
    }
    verdicts
}
