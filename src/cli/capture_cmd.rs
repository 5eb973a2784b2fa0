//! The `capture` subcommand: live capture through proxies.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::capture::{run_capture, CaptureConfig, HttpFetcher};
use crate::proxy::parse_proxy_config;

pub async fn run(
    locations: &Path,
    urls_file: &Path,
    output_dir: PathBuf,
    cfg: CaptureConfig,
) -> anyhow::Result<()> {
    let location_text = std::fs::read_to_string(locations)
        .with_context(|| format!("reading {}", locations.display()))?;
    let specs = parse_proxy_config(&location_text)?;

    let urls = read_url_file(urls_file)?;

    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(60)));
    run_capture(specs, urls, output_dir, cfg, fetcher).await
}

/// One URL per line, UTF-8; blank lines and `#` comments ignored.
fn read_url_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
