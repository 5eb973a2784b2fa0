//! The `history` subcommand: archive-backed retrieval.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;

use crate::archive::WaybackClient;
use crate::config::Settings;
use crate::db::Database;
use crate::errlog::ErrorLog;
use crate::extract::bundle::ExtractContext;
use crate::extract::parking::{ParkingClassifier, RulePreset};
use crate::extract::segment::Segmenter;
use crate::history::{HistorySession, SessionContext};
use crate::meter::Meter;
use crate::progress::StatusLine;

pub async fn run(db_path: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let settings = Settings::load(config, db_path).context("loading settings")?;
    let preset = RulePreset::parse(&settings.parking.preset)
        .with_context(|| format!("unknown parking preset {:?}", settings.parking.preset))?;

    let db = Database::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;

    let log_dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    let wayback_errlog = Arc::new(ErrorLog::open(log_dir.join("wayback-machine-errors.log"))?);
    let session_errlog = Arc::new(ErrorLog::open(log_dir.join("history-retrieval-errors.log"))?);

    let meter = Meter::new(settings.meter_config());
    let wayback = WaybackClient::new(meter, settings.archive_host.clone(), wayback_errlog);

    let parking = build_parking(&settings, preset)?;
    let segmenter = Segmenter::new().with_external_commands(&settings.segmenters);

    let ctx = Arc::new(SessionContext {
        archive: settings.archive.clone(),
        db,
        wayback,
        extract: ExtractContext::new(parking, segmenter),
        errlog: session_errlog,
        status: StatusLine::new(),
        n_errors: AtomicU64::new(0),
    });

    let mut session = HistorySession::new(ctx);

    // SIGINT finishes the current cycle, then exits cleanly.
    let cancel = session.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::Relaxed);
        }
    });

    session.run().await
}

fn build_parking(settings: &Settings, preset: RulePreset) -> anyhow::Result<ParkingClassifier> {
    let p = &settings.parking;
    match (&p.strong_rules, &p.weak1_rules, &p.weak2_rules) {
        (Some(strong), Some(weak1), Some(weak2)) => {
            let allowlist = match (&p.allowlist, preset) {
                // `full` means every strong rule; no filtering.
                (_, RulePreset::Full) | (None, _) => None,
                (Some(path), _) => {
                    let text = std::fs::read_to_string(path)
                        .with_context(|| format!("reading allowlist {}", path.display()))?;
                    Some(
                        text.lines()
                            .map(str::trim)
                            .filter(|l| !l.is_empty())
                            .map(str::to_string)
                            .collect::<HashSet<String>>(),
                    )
                }
            };
            Ok(ParkingClassifier::from_files(
                strong,
                weak1,
                weak2,
                allowlist.as_ref(),
                p.size_limit,
            )?)
        }
        (None, None, None) => Ok(ParkingClassifier::builtin()),
        _ => anyhow::bail!("parking rule files must be given all together or not at all"),
    }
}
