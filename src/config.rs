use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

/// A web property taking part in a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub mobile: bool,
}

impl Site {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            mobile: false,
        }
    }
}

/// Named, ordered list of sites. The first site is the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub name: String,
    pub sites: Vec<Site>,
}

impl Comparison {
    pub fn reference(&self) -> Option<&Site> {
        self.sites.first()
    }

    pub fn site_names(&self) -> Vec<String> {
        self.sites.iter().map(|site| site.name.clone()).collect()
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("comparison name is empty");
        }
        if self.sites.len() < 2 {
            bail!(
                "comparison '{}' needs at least 2 sites, got {}",
                self.name,
                self.sites.len()
            );
        }
        let mut seen = HashSet::new();
        for site in &self.sites {
            if site.name.is_empty() || site.name.contains('/') {
                bail!(
                    "comparison '{}' has invalid site name '{}'",
                    self.name,
                    site.name
                );
            }
            if !seen.insert(site.name.as_str()) {
                bail!(
                    "comparison '{}' lists site '{}' more than once",
                    self.name,
                    site.name
                );
            }
            Url::parse(&site.url).with_context(|| {
                format!("site '{}' has an invalid url '{}'", site.name, site.url)
            })?;
        }
        Ok(())
    }
}

/// Strategy used to pair recorded archives across sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SelectMethod {
    /// Pair archives by position inside each site's typical size band.
    Quantile,
    /// Greedily pair the archives with the smallest size difference.
    Closest,
}

impl Default for SelectMethod {
    fn default() -> Self {
        SelectMethod::Closest
    }
}

impl std::fmt::Display for SelectMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectMethod::Quantile => write!(f, "quantile"),
            SelectMethod::Closest => write!(f, "closest"),
        }
    }
}

/// Settings for the record/replay proxy binary and its port range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WprSettings {
    pub binary: Option<PathBuf>,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub inject_scripts: PathBuf,
    pub host: String,
    pub port_begin: u16,
    pub port_end: u16,
    pub port_step: u16,
    pub start_grace_ms: u64,
    pub wait_timeout_ms: u64,
    pub record_count: usize,
    pub select_count: usize,
    pub select_method: SelectMethod,
}

impl WprSettings {
    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for WprSettings {
    fn default() -> Self {
        Self {
            binary: None,
            cert_file: PathBuf::from("wpr_cert.pem"),
            key_file: PathBuf::from("wpr_key.pem"),
            inject_scripts: PathBuf::from("deterministic.js"),
            host: "127.0.0.1".to_string(),
            port_begin: 9000,
            port_end: 10000,
            port_step: 10,
            start_grace_ms: 500,
            wait_timeout_ms: 10_000,
            record_count: 5,
            select_count: 3,
            select_method: SelectMethod::default(),
        }
    }
}

/// Controls structured JSON trace export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "TraceSettings::default_max_files")]
    pub max_files: usize,
}

impl TraceSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

/// Top-level benchmark configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchSettings {
    pub iterations: usize,
    pub workers: usize,
    pub check_timeout_ms: u64,
    pub check_attempts: usize,
    pub tick_ms: u64,
    pub output_dir: Option<PathBuf>,
    pub comparisons: Vec<Comparison>,
    pub wpr: WprSettings,
    pub traces: TraceSettings,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            iterations: 10,
            workers: 1,
            check_timeout_ms: 60_000,
            check_attempts: 2,
            tick_ms: 500,
            output_dir: None,
            comparisons: Vec::new(),
            wpr: WprSettings::default(),
            traces: TraceSettings::default(),
        }
    }
}

impl BenchSettings {
    /// Read settings from a TOML file, falling back to defaults when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config at {}", path.display()))?;
        let parsed: Self = toml::from_str(&raw)
            .with_context(|| format!("Malformed config at {}", path.display()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            bail!("iterations must be at least 1");
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.check_attempts == 0 {
            bail!("check_attempts must be at least 1");
        }
        if self.wpr.port_begin >= self.wpr.port_end {
            bail!(
                "wpr port range {}..{} is empty",
                self.wpr.port_begin,
                self.wpr.port_end
            );
        }
        if self.wpr.port_step < 2 {
            bail!("wpr port_step must be at least 2, got {}", self.wpr.port_step);
        }
        let mut names = HashSet::new();
        for comparison in &self.comparisons {
            comparison.validate()?;
            if !names.insert(comparison.name.as_str()) {
                bail!("comparison '{}' is defined twice", comparison.name);
            }
        }
        Ok(())
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn comparison(&self, name: Option<&str>) -> Result<&Comparison> {
        match name {
            Some(name) => self
                .comparisons
                .iter()
                .find(|comparison| comparison.name == name)
                .with_context(|| format!("no comparison named '{name}' in config")),
            None => self
                .comparisons
                .first()
                .context("config does not define any comparisons"),
        }
    }

    /// Resolve the directory that receives archives and logs.
    pub fn resolve_output_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.output_dir {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("dev", "pagerace", "pagerace")
            .context("Unable to resolve platform data directory")?;
        Ok(dirs.data_dir().join("runs"))
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "pagerace", "pagerace")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("pagerace.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn two_sites() -> Comparison {
        Comparison {
            name: "search".into(),
            sites: vec![
                Site::new("alpha", "https://alpha.example/"),
                Site::new("beta", "https://beta.example/"),
            ],
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let settings =
            BenchSettings::load_or_default(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(settings.iterations, 10);
        assert_eq!(settings.wpr.select_method, SelectMethod::Closest);
        assert_eq!(settings.wpr.port_step, 10);
    }

    #[test]
    fn parses_toml_config() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("pagerace.toml");
        fs::write(
            &path,
            r#"
iterations = 5
workers = 2

[wpr]
select_method = "quantile"
select_count = 2

[[comparisons]]
name = "news"
sites = [
  { name = "left", url = "https://left.example/" },
  { name = "right", url = "https://right.example/", mobile = true },
]
"#,
        )
        .expect("write config");

        let settings = BenchSettings::load_or_default(&path).expect("parse");
        assert_eq!(settings.iterations, 5);
        assert_eq!(settings.workers, 2);
        assert_eq!(settings.wpr.select_method, SelectMethod::Quantile);
        assert_eq!(settings.wpr.select_count, 2);
        assert_eq!(settings.wpr.port_begin, 9000);
        let comparison = settings.comparison(Some("news")).expect("comparison");
        assert_eq!(comparison.reference().map(|s| s.name.as_str()), Some("left"));
        assert!(comparison.sites[1].mobile);
    }

    #[test]
    fn rejects_single_site_comparison() {
        let mut settings = BenchSettings::default();
        let mut comparison = two_sites();
        comparison.sites.pop();
        settings.comparisons.push(comparison);
        let err = settings.validate().expect_err("single site rejected");
        assert!(err.to_string().contains("at least 2 sites"));
    }

    #[test]
    fn rejects_duplicate_site_names() {
        let mut settings = BenchSettings::default();
        let mut comparison = two_sites();
        comparison.sites[1].name = "alpha".into();
        settings.comparisons.push(comparison);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_bad_url_and_port_range() {
        let mut settings = BenchSettings::default();
        let mut comparison = two_sites();
        comparison.sites[0].url = "not a url".into();
        settings.comparisons.push(comparison);
        assert!(settings.validate().is_err());

        let mut settings = BenchSettings::default();
        settings.wpr.port_end = settings.wpr.port_begin;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_port_step_below_pair_size() {
        let mut settings = BenchSettings::default();
        settings.wpr.port_step = 1;
        let err = settings.validate().expect_err("step of 1 rejected");
        assert!(err.to_string().contains("port_step"));

        settings.wpr.port_step = 2;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn comparison_lookup_defaults_to_first() {
        let mut settings = BenchSettings::default();
        assert!(settings.comparison(None).is_err());
        settings.comparisons.push(two_sites());
        assert_eq!(settings.comparison(None).expect("first").name, "search");
        assert!(settings.comparison(Some("other")).is_err());
    }
}
