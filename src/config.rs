//! Operational settings.
//!
//! Defaults are tuned for the Wayback Machine's tolerance; a TOML file next
//! to the database (or named with `--config`) overrides them. Everything has
//! a default so a bare `pagehist history pages.db` works.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::extract::parking::DEFAULT_SIZE_LIMIT;
use crate::meter::MeterConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Requests per second against the archive.
    pub rate: f64,
    /// Maximum in-flight requests.
    pub concurrency: usize,
    /// Deadline for one metered acquisition, seconds.
    pub query_timeout: u64,
    /// TCP connect timeout, seconds.
    pub connect_timeout: u64,
    /// HTTP session lifetime, seconds.
    pub session_timeout: u64,
    pub user_agent: String,
    /// Archive identifier recorded in the database.
    pub archive: String,
    /// Archive host queried for CDX and snapshots.
    pub archive_host: String,
    pub parking: ParkingSettings,
    /// External segmenter commands keyed by language code (zh, ar, ja, th, vi).
    pub segmenters: HashMap<String, Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rate: 30.0,
            concurrency: 5,
            query_timeout: 900,
            connect_timeout: 5,
            session_timeout: 1800,
            user_agent: format!("pagehist/{} (history retrieval)", env!("CARGO_PKG_VERSION")),
            archive: "wayback".to_string(),
            archive_host: "web.archive.org".to_string(),
            parking: ParkingSettings::default(),
            segmenters: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParkingSettings {
    /// `full`, `balanced`, or `min`.
    pub preset: String,
    pub strong_rules: Option<PathBuf>,
    pub weak1_rules: Option<PathBuf>,
    pub weak2_rules: Option<PathBuf>,
    /// Allowlist file for the preset (one strong-rule tag per line).
    pub allowlist: Option<PathBuf>,
    pub size_limit: usize,
}

impl Default for ParkingSettings {
    fn default() -> Self {
        Self {
            preset: "full".to_string(),
            strong_rules: None,
            weak1_rules: None,
            weak2_rules: None,
            allowlist: None,
            size_limit: DEFAULT_SIZE_LIMIT,
        }
    }
}

impl Settings {
    /// Load settings: the named file if given, else `pagehist.toml` next to
    /// the database if present, else defaults.
    pub fn load(explicit: Option<&Path>, db_path: &Path) -> anyhow::Result<Self> {
        let candidate = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let sibling = db_path.with_file_name("pagehist.toml");
                sibling.exists().then_some(sibling)
            }
        };
        match candidate {
            Some(path) => {
                let text = std::fs::read_to_string(&path)?;
                let settings = toml::from_str(&text)?;
                Ok(settings)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn meter_config(&self) -> MeterConfig {
        MeterConfig {
            rate: self.rate,
            concurrency: self.concurrency,
            query_timeout: Duration::from_secs(self.query_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            session_timeout: Duration::from_secs(self.session_timeout),
            user_agent: self.user_agent.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.rate, 30.0);
        assert_eq!(s.concurrency, 5);
        assert_eq!(s.archive, "wayback");
        assert_eq!(s.archive_host, "web.archive.org");
        assert_eq!(s.parking.preset, "full");
    }

    #[test]
    fn toml_overrides_apply() {
        let s: Settings = toml::from_str(
            r#"
            rate = 10.0
            concurrency = 2

            [parking]
            preset = "balanced"

            [segmenters]
            zh = ["stanford-segmenter", "--lang", "zh"]
        "#,
        )
        .unwrap();
        assert_eq!(s.rate, 10.0);
        assert_eq!(s.concurrency, 2);
        assert_eq!(s.parking.preset, "balanced");
        assert_eq!(s.segmenters["zh"][0], "stanford-segmenter");
        // Unspecified fields keep their defaults.
        assert_eq!(s.query_timeout, 900);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Settings>("rats = 30").is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(None, &dir.path().join("pages.db")).unwrap();
        assert_eq!(s.rate, 30.0);
    }

    #[test]
    fn sibling_config_is_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pagehist.toml"), "rate = 5.0\n").unwrap();
        let s = Settings::load(None, &dir.path().join("pages.db")).unwrap();
        assert_eq!(s.rate, 5.0);
    }
}
