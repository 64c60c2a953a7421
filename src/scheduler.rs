//! Worker pool feeding check results into a [`MetricsAggregator`].
//!
//! Everything runs on the calling task: in-flight checks live in a
//! `FuturesUnordered`, so samples are appended strictly in completion order
//! and the aggregator never needs a lock.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::Site;
use crate::error::BenchError;
use crate::metrics::{MetricSample, MetricsAggregator};

/// Where the record/replay proxy for a site is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEndpoint {
    pub host: String,
    pub http_port: u16,
    pub https_port: u16,
}

/// One unit of work handed to a [`Checker`].
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub site: Site,
    pub site_index: usize,
    /// Per-site slot: completed plus in-flight checks of the site at dispatch.
    /// Failed checks leave their slot to be reused.
    pub iteration: usize,
    pub replay: Option<ReplayEndpoint>,
}

/// Loads a page once and reports one reading per metric.
#[async_trait]
pub trait Checker: Send + Sync {
    /// Names of the readings returned by [`Checker::check`], in order.
    fn metric_names(&self) -> Vec<String>;

    async fn check(&self, request: &CheckRequest) -> Result<MetricSample>;
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub workers: usize,
    pub check_timeout: Duration,
    pub tick: Duration,
}

/// Counters describing one scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerReport {
    pub dispatched: usize,
    pub accepted: usize,
    pub failed: usize,
    pub timed_out: usize,
}

pub struct Scheduler<'a, C: Checker + ?Sized> {
    checker: &'a C,
    sites: &'a [Site],
    replay: Vec<Option<ReplayEndpoint>>,
    options: SchedulerOptions,
}

impl<'a, C: Checker + ?Sized> Scheduler<'a, C> {
    pub fn new(checker: &'a C, sites: &'a [Site], options: SchedulerOptions) -> Self {
        Self {
            checker,
            sites,
            replay: vec![None; sites.len()],
            options,
        }
    }

    /// Route each site's checks through its replay proxy.
    pub fn with_replay(mut self, endpoints: Vec<Option<ReplayEndpoint>>) -> Self {
        self.replay = endpoints;
        self.replay.resize(self.sites.len(), None);
        self
    }

    /// Run checks until every site has reached the aggregator's target.
    ///
    /// `on_tick` is called with the aggregator every `tick` and once more
    /// when the run completes. A sample whose shape does not match the
    /// aggregator's metrics aborts the run.
    pub async fn run<F>(
        &self,
        aggregator: &mut MetricsAggregator,
        mut on_tick: F,
    ) -> Result<SchedulerReport, BenchError>
    where
        F: FnMut(&MetricsAggregator),
    {
        let workers = self.options.workers.max(1);
        let mut report = SchedulerReport::default();
        let mut in_flight = FuturesUnordered::new();

        let mut ticker = tokio::time::interval(self.options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        loop {
            while in_flight.len() < workers {
                let Some(site) = aggregator.next_site_index() else {
                    break;
                };
                let request = CheckRequest {
                    site: self.sites[site].clone(),
                    site_index: site,
                    iteration: aggregator.completed(site) + aggregator.in_flight(site),
                    replay: self.replay[site].clone(),
                };
                aggregator.report_start(site);
                debug!(site = %request.site.name, iteration = request.iteration, "dispatching check");
                report.dispatched += 1;
                in_flight.push(run_check(self.checker, request, self.options.check_timeout));
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = ticker.tick() => on_tick(aggregator),
                Some((site, outcome)) = in_flight.next() => {
                    aggregator.report_end(site);
                    self.accept(aggregator, site, outcome, &mut report)?;
                    // ticks and outer timeouts must fire even when checks never await
                    tokio::task::yield_now().await;
                }
            }
        }

        on_tick(aggregator);
        Ok(report)
    }

    fn accept(
        &self,
        aggregator: &mut MetricsAggregator,
        site: usize,
        outcome: Result<MetricSample, BenchError>,
        report: &mut SchedulerReport,
    ) -> Result<(), BenchError> {
        let name = &self.sites[site].name;
        let outcome = outcome.and_then(|sample| aggregator.add_sample(site, &sample));
        match outcome {
            Ok(()) => {
                report.accepted += 1;
                debug!(site = %name, completed = aggregator.completed(site), "sample accepted");
            }
            Err(err @ BenchError::SampleShape { .. }) => return Err(err),
            Err(err @ BenchError::CheckTimeout { .. }) => {
                report.timed_out += 1;
                warn!(site = %name, error = %err, "dropping sample");
            }
            Err(err) => {
                report.failed += 1;
                warn!(site = %name, error = %err, "dropping sample");
            }
        }
        Ok(())
    }
}

async fn run_check<C: Checker + ?Sized>(
    checker: &C,
    request: CheckRequest,
    timeout: Duration,
) -> (usize, Result<MetricSample, BenchError>) {
    let outcome = match tokio::time::timeout(timeout, checker.check(&request)).await {
        Ok(Ok(sample)) => Ok(sample),
        Ok(Err(err)) => Err(BenchError::CheckFailed {
            site: request.site.name.clone(),
            message: format!("{err:#}"),
        }),
        Err(_) => Err(BenchError::CheckTimeout {
            site: request.site.name.clone(),
            timeout,
        }),
    };
    (request.site_index, outcome)
}
