use std::cmp::Reverse;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::Utc;
use directories::ProjectDirs;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::TraceSettings;

const TRACE_SUFFIX: &str = ".trace.jsonl";

static TRACE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ACTIVE_TRACE_FILE: OnceCell<PathBuf> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Install the tracing subscriber, optionally mirroring events to a JSON trace file.
///
/// Only the first call installs anything.
pub fn init_tracing(verbose: bool, traces: &TraceSettings) -> Result<()> {
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let level = if verbose { "pagerace=debug" } else { "pagerace=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let trace_layer = build_trace_file_layer(traces)?.map(|(writer, guard, path)| {
        let _ = TRACE_GUARD.set(guard);
        let _ = ACTIVE_TRACE_FILE.set(path);
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .with_filter(LevelFilter::DEBUG)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(trace_layer)
        .try_init()
        .context("tracing subscriber already installed")?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Trace file written by this process, if export is enabled.
pub fn current_trace_file() -> Option<&'static PathBuf> {
    ACTIVE_TRACE_FILE.get()
}

fn build_trace_file_layer(
    settings: &TraceSettings,
) -> Result<Option<(NonBlocking, WorkerGuard, PathBuf)>> {
    if !settings.enabled {
        return Ok(None);
    }
    let directory = match &settings.directory {
        Some(dir) => dir.clone(),
        None => ProjectDirs::from("dev", "pagerace", "pagerace")
            .context("Unable to resolve platform trace directory")?
            .cache_dir()
            .join("traces"),
    };
    fs::create_dir_all(&directory)
        .with_context(|| format!("Failed to create trace directory {}", directory.display()))?;

    let (file, path) = create_trace_file(&directory)?;
    prune_old_traces(&directory, settings.max_files, &path)?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    Ok(Some((writer, guard, path)))
}

fn create_trace_file(directory: &Path) -> Result<(fs::File, PathBuf)> {
    let stem = format!("pagerace-{}", Utc::now().format("%Y%m%dT%H%M%SZ"));
    let path = (0u32..)
        .map(|n| match n {
            0 => directory.join(format!("{stem}{TRACE_SUFFIX}")),
            n => directory.join(format!("{stem}-{n}{TRACE_SUFFIX}")),
        })
        .find(|candidate| !candidate.exists())
        .context("no free trace file name")?;

    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("Failed to open trace file {}", path.display()))?;
    Ok((file, path))
}

/// Keep at most `max_files` traces including `keep`, newest first.
fn prune_old_traces(directory: &Path, max_files: usize, keep: &Path) -> Result<()> {
    if max_files == 0 || !directory.exists() {
        return Ok(());
    }

    let listing = fs::read_dir(directory)
        .with_context(|| format!("Failed to read trace directory {}", directory.display()))?;
    let mut traces: Vec<(SystemTime, PathBuf)> = listing
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(TRACE_SUFFIX))
        .filter(|entry| entry.path() != keep)
        .filter_map(|entry| {
            let meta = entry.metadata().ok().filter(|meta| meta.is_file())?;
            Some((meta.modified().ok()?, entry.path()))
        })
        .collect();

    traces.sort_by_key(|(modified, _)| Reverse(*modified));
    for (_, stale) in traces.into_iter().skip(max_files.saturating_sub(1)) {
        let _ = fs::remove_file(stale);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn trace_files_are_unique_per_call() {
        let dir = tempdir().expect("tempdir");
        let (_, first) = create_trace_file(dir.path()).expect("first");
        let (_, second) = create_trace_file(dir.path()).expect("second");
        assert_ne!(first, second);
        assert!(first.to_string_lossy().ends_with(TRACE_SUFFIX));
    }

    #[test]
    fn prune_keeps_newest_traces() {
        let dir = tempdir().expect("tempdir");
        for index in 0..4 {
            fs::write(dir.path().join(format!("old-{index}{TRACE_SUFFIX}")), "{}")
                .expect("write trace");
        }
        fs::write(dir.path().join("notes.txt"), "keep me").expect("write");
        let (_, keep) = create_trace_file(dir.path()).expect("trace");

        prune_old_traces(dir.path(), 3, &keep).expect("prune");

        let traces = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(TRACE_SUFFIX))
            .count();
        assert_eq!(traces, 3);
        assert!(keep.exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn second_init_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let settings = TraceSettings {
            enabled: true,
            directory: Some(dir.path().to_path_buf()),
            max_files: 2,
        };

        init_tracing(false, &settings).expect("first init");
        init_tracing(true, &settings).expect("second init");

        let trace = current_trace_file().expect("trace file");
        assert!(trace.starts_with(dir.path()));
        let written = fs::read_dir(dir.path()).expect("read dir").count();
        assert_eq!(written, 1);
    }

    #[test]
    fn disabled_export_builds_no_layer() {
        let settings = TraceSettings::default();
        assert!(build_trace_file_layer(&settings).expect("layer").is_none());
    }
}
