//! Live, record and replay benchmark cycles for one comparison.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::archive::{ArchiveCatalog, WprArchive, archive_file_name};
use crate::config::{BenchSettings, Comparison, Site};
use crate::error::BenchError;
use crate::metrics::{MetricsAggregator, ResultsSnapshot};
use crate::pairing::{ArchivePair, select_pairs};
use crate::ports::PortAllocator;
use crate::scheduler::{
    CheckRequest, Checker, ReplayEndpoint, Scheduler, SchedulerOptions, SchedulerReport,
};
use crate::stats::Stat;
use crate::wpr::{WprLogPaths, WprMode, WprProcess, build_command, resolve_binary};

/// Results of one full cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub started_at: DateTime<Utc>,
    pub results: ResultsSnapshot,
    pub report: SchedulerReport,
}

/// One replay cycle and the archive pair it replayed.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub pair: ArchivePair,
    #[serde(flatten)]
    pub outcome: CycleOutcome,
}

/// Drives benchmark cycles and owns the on-disk run layout.
///
/// Archives live in `<output>/wpr` so later replays find them; proxy logs go
/// to `<output>/logs`, tagged with the run id.
#[derive(Debug, Clone)]
pub struct Benchmark {
    settings: BenchSettings,
    output_dir: PathBuf,
    run_id: String,
}

impl Benchmark {
    pub fn from_settings(settings: BenchSettings) -> Result<Self> {
        let output_dir = settings.resolve_output_dir()?;
        Ok(Self::with_output_dir(settings, output_dir))
    }

    pub fn with_output_dir(settings: BenchSettings, output_dir: impl Into<PathBuf>) -> Self {
        let mut run_id = Uuid::new_v4().simple().to_string();
        run_id.truncate(8);
        Self {
            settings,
            output_dir: output_dir.into(),
            run_id,
        }
    }

    pub fn settings(&self) -> &BenchSettings {
        &self.settings
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.output_dir.join("wpr")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.output_dir.join("logs")
    }

    fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            workers: self.settings.workers,
            check_timeout: self.settings.check_timeout(),
            tick: self.settings.tick(),
        }
    }

    /// Run one cycle against the live network.
    pub async fn run_live<C: Checker + ?Sized>(
        &self,
        comparison: &Comparison,
        checker: &C,
    ) -> Result<CycleOutcome> {
        let span = info_span!("live", comparison = %comparison.name, run = %self.run_id);
        self.run_cycle(comparison, checker, Vec::new())
            .instrument(span)
            .await
    }

    async fn run_cycle<C: Checker + ?Sized>(
        &self,
        comparison: &Comparison,
        checker: &C,
        replay: Vec<Option<ReplayEndpoint>>,
    ) -> Result<CycleOutcome> {
        let started_at = Utc::now();
        let mut aggregator = MetricsAggregator::new(
            comparison.site_names(),
            checker.metric_names(),
            Stat::registry(),
            self.settings.iterations,
        );
        info!(
            sites = comparison.sites.len(),
            target = self.settings.iterations,
            workers = self.settings.workers,
            replay = !replay.is_empty(),
            "cycle started"
        );

        let report = Scheduler::new(checker, &comparison.sites, self.scheduler_options())
            .with_replay(replay)
            .run(&mut aggregator, log_progress)
            .await?;
        let results = aggregator.calculate_results();
        info!(
            min_iterations = results.min_iterations,
            accepted = report.accepted,
            failed = report.failed,
            timed_out = report.timed_out,
            "cycle finished"
        );
        Ok(CycleOutcome {
            started_at,
            results,
            report,
        })
    }

    /// Record `record_count` archives per site, one page load each.
    pub async fn record<C: Checker + ?Sized>(
        &self,
        comparison: &Comparison,
        checker: &C,
        allocator: &mut PortAllocator,
    ) -> Result<Vec<WprArchive>> {
        let span = info_span!("record", comparison = %comparison.name, run = %self.run_id);
        self.record_all(comparison, checker, allocator)
            .instrument(span)
            .await
    }

    async fn record_all<C: Checker + ?Sized>(
        &self,
        comparison: &Comparison,
        checker: &C,
        allocator: &mut PortAllocator,
    ) -> Result<Vec<WprArchive>> {
        let binary = resolve_binary(&self.settings.wpr)?;
        let archive_dir = self.archive_dir();
        fs::create_dir_all(&archive_dir).with_context(|| {
            format!("Failed to create archive directory {}", archive_dir.display())
        })?;

        let mut recorded = Vec::new();
        for (site_index, site) in comparison.sites.iter().enumerate() {
            for id in 0..self.settings.wpr.record_count {
                let archive = self
                    .record_archive(&binary, &archive_dir, site_index, site, id, checker, allocator)
                    .await
                    .with_context(|| format!("recording archive {id} of '{}' failed", site.name))?;
                info!(
                    site = %site.name,
                    archive_id = id,
                    size_bytes = archive.size_bytes,
                    "archive recorded"
                );
                recorded.push(archive);
            }
        }
        Ok(recorded)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_archive<C: Checker + ?Sized>(
        &self,
        binary: &Path,
        archive_dir: &Path,
        site_index: usize,
        site: &Site,
        id: usize,
        checker: &C,
        allocator: &mut PortAllocator,
    ) -> Result<WprArchive> {
        let path = archive_dir.join(archive_file_name(&site.name, id));
        let mut proxy = self
            .launch(binary, WprMode::Record, site, id, &path, allocator)
            .await?;
        let request = CheckRequest {
            site: site.clone(),
            site_index,
            iteration: id,
            replay: Some(self.endpoint(&proxy)),
        };

        let timeout = self.settings.check_timeout();
        let checked = tokio::time::timeout(timeout, checker.check(&request)).await;
        let stopped = stop_and_wait(&mut proxy).await;
        match checked {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(BenchError::CheckTimeout {
                    site: site.name.clone(),
                    timeout,
                }
                .into());
            }
        }
        stopped?;

        let size_bytes = fs::metadata(&path)
            .with_context(|| format!("proxy did not write archive {}", path.display()))?
            .len();
        Ok(WprArchive {
            filename: path,
            site_name: site.name.clone(),
            archive_id: id,
            size_bytes,
        })
    }

    /// Choose the archive pairs a replay would use.
    pub fn pairs(&self, comparison: &Comparison) -> Result<Vec<ArchivePair>> {
        let catalog = ArchiveCatalog::scan(&self.archive_dir(), &comparison.site_names())?;
        debug!(archives = catalog.len(), "archive catalog loaded");
        let wpr = &self.settings.wpr;
        let pairs = select_pairs(
            &catalog,
            &comparison.site_names(),
            wpr.select_count,
            wpr.select_method,
        )?;
        Ok(pairs)
    }

    /// Replay every selected archive pair in its own cycle.
    pub async fn replay<C: Checker + ?Sized>(
        &self,
        comparison: &Comparison,
        checker: &C,
        allocator: &mut PortAllocator,
    ) -> Result<Vec<CycleReport>> {
        let span = info_span!("replay", comparison = %comparison.name, run = %self.run_id);
        self.replay_pairs(comparison, checker, allocator)
            .instrument(span)
            .await
    }

    async fn replay_pairs<C: Checker + ?Sized>(
        &self,
        comparison: &Comparison,
        checker: &C,
        allocator: &mut PortAllocator,
    ) -> Result<Vec<CycleReport>> {
        let catalog = ArchiveCatalog::scan(&self.archive_dir(), &comparison.site_names())?;
        let wpr = &self.settings.wpr;
        let pairs = select_pairs(
            &catalog,
            &comparison.site_names(),
            wpr.select_count,
            wpr.select_method,
        )?;
        if pairs.is_empty() {
            return Err(BenchError::NoArchivePairs.into());
        }
        let binary = resolve_binary(wpr)?;

        let mut reports = Vec::with_capacity(pairs.len());
        for pair in pairs {
            info!(
                a_archive = pair.a_archive_id,
                b_archive = pair.b_archive_id,
                diff = pair.diff,
                "replaying pair"
            );
            let ids = [pair.a_archive_id, pair.b_archive_id];
            let mut proxies = Vec::with_capacity(ids.len());
            for (site, id) in comparison.sites.iter().zip(ids) {
                let archive = catalog
                    .find(&site.name, id)
                    .with_context(|| format!("archive {id} of '{}' vanished", site.name))?;
                match self
                    .launch(&binary, WprMode::Replay, site, id, &archive.filename, allocator)
                    .await
                {
                    Ok(proxy) => proxies.push(proxy),
                    Err(err) => {
                        for proxy in &mut proxies {
                            proxy.kill().await;
                        }
                        return Err(err);
                    }
                }
            }

            let endpoints = proxies.iter().map(|p| Some(self.endpoint(p))).collect();
            let outcome = self.run_cycle(comparison, checker, endpoints).await;

            let mut shutdown = Ok(());
            for proxy in &mut proxies {
                if let Err(err) = stop_and_wait(proxy).await {
                    warn!(name = %proxy.name(), error = %err, "proxy shutdown failed");
                    if shutdown.is_ok() {
                        shutdown = Err(err);
                    }
                }
            }
            let outcome = outcome?;
            shutdown?;
            reports.push(CycleReport { pair, outcome });
        }
        Ok(reports)
    }

    async fn launch(
        &self,
        binary: &Path,
        mode: WprMode,
        site: &Site,
        archive_id: usize,
        archive: &Path,
        allocator: &mut PortAllocator,
    ) -> Result<WprProcess> {
        let wpr = &self.settings.wpr;
        let (http_port, https_port) = allocator.allocate_pair().await?;
        let command = build_command(binary, mode, wpr, http_port, https_port, archive);
        let logs = WprLogPaths::for_run(&self.log_dir(), &site.name, &self.run_id, Some(archive_id));
        let mut proxy = WprProcess::new(
            format!("wpr {} {}", mode.verb(), site.name),
            command,
            logs,
            http_port,
            https_port,
            wpr.start_grace(),
            wpr.wait_timeout(),
        );
        proxy.start().await?;
        Ok(proxy)
    }

    fn endpoint(&self, proxy: &WprProcess) -> ReplayEndpoint {
        let (http_port, https_port) = proxy.ports();
        ReplayEndpoint {
            host: self.settings.wpr.host.clone(),
            http_port,
            https_port,
        }
    }
}

/// Graceful shutdown, falling back to a kill when it does not complete.
async fn stop_and_wait(proxy: &mut WprProcess) -> Result<(), BenchError> {
    let result = match proxy.stop() {
        Ok(()) => proxy.wait().await,
        Err(err) => Err(err),
    };
    if result.is_err() {
        proxy.kill().await;
    }
    result
}

fn log_progress(aggregator: &MetricsAggregator) {
    let snapshot = aggregator.calculate_results();
    info!(
        min_iterations = snapshot.min_iterations,
        target = aggregator.target(),
        in_flight = aggregator.total_in_flight(),
        "progress"
    );
    let Some(metric) = snapshot.metrics.first() else {
        return;
    };
    for (site, name) in snapshot.sites.iter().enumerate() {
        if let Some(cell) = snapshot.get(site, metric, "mean") {
            debug!(
                site = %name,
                completed = aggregator.completed(site),
                metric = %metric,
                mean = ?cell.value,
                diff = ?cell.diff,
                "site progress"
            );
        }
    }
}
