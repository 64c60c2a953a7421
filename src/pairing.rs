//! Choosing which recorded archives of two sites are replayed side by side.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::archive::{ArchiveCatalog, WprArchive};
use crate::config::SelectMethod;
use crate::error::BenchError;
use crate::stats::percentile_sorted;

const BAND_LOW: f64 = 35.0;
const BAND_MID: f64 = 50.0;
const BAND_HIGH: f64 = 65.0;

/// Archives of the reference site (`a`) and the other site (`b`) replayed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchivePair {
    pub a_archive_id: usize,
    pub a_size: u64,
    pub b_archive_id: usize,
    pub b_size: u64,
    /// `b_size - a_size`.
    pub diff: i64,
}

impl ArchivePair {
    fn new(a: &WprArchive, b: &WprArchive) -> Self {
        Self {
            a_archive_id: a.archive_id,
            a_size: a.size_bytes,
            b_archive_id: b.archive_id,
            b_size: b.size_bytes,
            diff: b.size_bytes as i64 - a.size_bytes as i64,
        }
    }
}

/// Pick up to `count` comparable pairs for exactly two sites.
///
/// An empty result is valid; callers that need at least one cycle decide
/// whether that is fatal.
pub fn select_pairs(
    catalog: &ArchiveCatalog,
    sites: &[String],
    count: usize,
    method: SelectMethod,
) -> Result<Vec<ArchivePair>, BenchError> {
    let [a, b] = sites else {
        return Err(BenchError::UnsupportedSiteCount(sites.len()));
    };
    let pool_a = catalog.archives(a);
    let pool_b = catalog.archives(b);
    let pairs = match method {
        SelectMethod::Quantile => select_quantile(pool_a, pool_b, count),
        SelectMethod::Closest => select_closest(pool_a, pool_b, count),
    };
    info!(
        method = %method,
        requested = count,
        selected = pairs.len(),
        "selected archive pairs"
    );
    Ok(pairs)
}

fn sorted_by_size(pool: &[WprArchive]) -> Vec<&WprArchive> {
    let mut sorted: Vec<&WprArchive> = pool.iter().collect();
    sorted.sort_by_key(|archive| (archive.size_bytes, archive.archive_id));
    sorted
}

/// Archives whose size lies within the pool's 35th..65th percentile band,
/// ascending by size.
fn typical_band(pool: &[WprArchive]) -> Vec<&WprArchive> {
    let sorted = sorted_by_size(pool);
    if sorted.is_empty() {
        return sorted;
    }
    let sizes: Vec<f64> = sorted.iter().map(|a| a.size_bytes as f64).collect();
    let low = percentile_sorted(&sizes, BAND_LOW);
    let mid = percentile_sorted(&sizes, BAND_MID);
    let high = percentile_sorted(&sizes, BAND_HIGH);
    debug!(low, mid, high, total = sorted.len(), "archive size band");
    sorted
        .into_iter()
        .filter(|archive| {
            let size = archive.size_bytes as f64;
            size >= low && size <= high
        })
        .collect()
}

/// Trim each pool to its typical band and pair by sorted position.
pub fn select_quantile(a: &[WprArchive], b: &[WprArchive], count: usize) -> Vec<ArchivePair> {
    let band_a = typical_band(a);
    let band_b = typical_band(b);
    band_a
        .iter()
        .zip(band_b.iter())
        .take(count)
        .map(|(a, b)| ArchivePair::new(a, b))
        .collect()
}

/// Greedily take the globally closest pairs, using each archive at most once.
///
/// Equal absolute differences prefer the smaller signed diff, then lower ids.
pub fn select_closest(a: &[WprArchive], b: &[WprArchive], count: usize) -> Vec<ArchivePair> {
    let mut candidates: Vec<ArchivePair> = a
        .iter()
        .flat_map(|left| b.iter().map(move |right| ArchivePair::new(left, right)))
        .collect();
    candidates.sort_by_key(|pair| {
        (
            pair.diff.unsigned_abs(),
            pair.diff,
            pair.a_archive_id,
            pair.b_archive_id,
        )
    });

    let mut used_a = HashSet::new();
    let mut used_b = HashSet::new();
    let mut selected = Vec::with_capacity(count);
    for pair in candidates {
        if selected.len() == count {
            break;
        }
        if used_a.contains(&pair.a_archive_id) || used_b.contains(&pair.b_archive_id) {
            continue;
        }
        used_a.insert(pair.a_archive_id);
        used_b.insert(pair.b_archive_id);
        selected.push(pair);
    }
    selected
}
