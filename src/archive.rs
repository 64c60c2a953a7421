use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::error::BenchError;
use crate::wpr::ARCHIVE_EXTENSION;

/// One recorded traffic archive found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WprArchive {
    pub filename: PathBuf,
    pub site_name: String,
    pub archive_id: usize,
    pub size_bytes: u64,
}

/// File name for archive `id` of `site`.
pub fn archive_file_name(site: &str, id: usize) -> String {
    format!("{site}-{id}.{ARCHIVE_EXTENSION}")
}

/// Split `{siteName}-{id}.{ext}` into its site name and id.
///
/// Site names may themselves contain dashes; the id is everything after the
/// last one.
pub fn parse_archive_name(path: &Path) -> Result<(String, usize), BenchError> {
    let malformed = || BenchError::MalformedArchiveName(path.to_path_buf());
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(malformed)?;
    let (site, id) = stem.rsplit_once('-').ok_or_else(malformed)?;
    if site.is_empty() {
        return Err(malformed());
    }
    let id = id.parse::<usize>().map_err(|_| malformed())?;
    Ok((site.to_string(), id))
}

/// Inventory of archives for the sites of one comparison.
#[derive(Debug, Clone, Default)]
pub struct ArchiveCatalog {
    by_site: BTreeMap<String, Vec<WprArchive>>,
}

impl ArchiveCatalog {
    /// Scan `dir` for archives belonging to `sites`.
    ///
    /// Files with other extensions are ignored. An archive file whose name
    /// does not follow the naming convention aborts the scan.
    pub fn scan(dir: &Path, sites: &[String]) -> Result<Self> {
        let mut by_site: BTreeMap<String, Vec<WprArchive>> = sites
            .iter()
            .map(|site| (site.clone(), Vec::new()))
            .collect();

        if !dir.exists() {
            return Ok(Self { by_site });
        }

        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read archive directory {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(ARCHIVE_EXTENSION) {
                continue;
            }
            let (site_name, archive_id) = parse_archive_name(&path)?;
            let Some(pool) = by_site.get_mut(&site_name) else {
                debug!(path = %path.display(), "archive belongs to another site, skipping");
                continue;
            };
            let size_bytes = entry
                .metadata()
                .with_context(|| format!("Failed to stat archive {}", path.display()))?
                .len();
            pool.push(WprArchive {
                filename: path,
                site_name,
                archive_id,
                size_bytes,
            });
        }

        for pool in by_site.values_mut() {
            pool.sort_by_key(|archive| archive.archive_id);
        }
        Ok(Self { by_site })
    }

    pub fn from_archives(archives: impl IntoIterator<Item = WprArchive>) -> Self {
        let mut by_site: BTreeMap<String, Vec<WprArchive>> = BTreeMap::new();
        for archive in archives {
            by_site
                .entry(archive.site_name.clone())
                .or_default()
                .push(archive);
        }
        Self { by_site }
    }

    pub fn archives(&self, site: &str) -> &[WprArchive] {
        self.by_site.get(site).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find(&self, site: &str, archive_id: usize) -> Option<&WprArchive> {
        self.archives(site)
            .iter()
            .find(|archive| archive.archive_id == archive_id)
    }

    pub fn len(&self) -> usize {
        self.by_site.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
