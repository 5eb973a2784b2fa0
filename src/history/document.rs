//! Per-document retrieval state machine.
//!
//! One `Document` owns one URL's retrieval plan: which snapshots the archive
//! has, which window of them matters, which are already captured, and which
//! remain. All progress is persisted, so a killed process resumes exactly
//! where it stopped.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::session::SessionContext;
use crate::archive::cdx::format_timestamp;
use crate::extract::bundle::extract_page;
use crate::schedule::{one_year, ruler_order, select_snapshots};

pub struct Document {
    pub urlid: i64,
    pub url: String,
    /// Dates of available snapshots; `None` until loaded.
    snapshots: Option<Vec<DateTime<Utc>>>,
    /// Date the URL was flagged by its source.
    lodate: Option<DateTime<Utc>>,
    /// Date the URL was last seen live by our own collector.
    hidate: Option<DateTime<Utc>>,
    /// Dates for which a historical page record already exists.
    texts: HashSet<DateTime<Utc>>,
    /// Remaining work, in ruler order; popped from the end.
    to_retrieve: Vec<DateTime<Utc>>,
}

impl Document {
    /// A document never seen before under this archive.
    pub fn new(urlid: i64, url: String) -> Self {
        Self {
            urlid,
            url,
            snapshots: None,
            lodate: None,
            hidate: None,
            texts: HashSet::new(),
            to_retrieve: Vec::new(),
        }
    }

    /// A document resumed from an existing availability record.
    pub fn resumed(
        urlid: i64,
        url: String,
        snapshots: Vec<DateTime<Utc>>,
        lodate: Option<DateTime<Utc>>,
        hidate: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            urlid,
            url,
            snapshots: Some(snapshots),
            lodate,
            hidate,
            texts: HashSet::new(),
            to_retrieve: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.to_retrieve.is_empty()
    }

    /// One `+`/`-` per known snapshot: captured or not. Printed when the
    /// document completes.
    pub fn coverage_symbol(&self) -> String {
        self.snapshots
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|d| if self.texts.contains(d) { '+' } else { '-' })
            .collect()
    }

    /// Bring the retrieval plan up to date with the database and, if the
    /// archive has never been asked about this URL, with the archive.
    ///
    /// The plan covers `[lodate - 1 year, hidate]` at thirty-day spacing,
    /// minus already-captured snapshots, in ruler order. `hidate` itself is
    /// appended to the snapshot list so the selector's walk always
    /// terminates at the window's high edge.
    pub async fn load_history(&mut self, ctx: &SessionContext) -> anyhow::Result<()> {
        if self.snapshots.is_none() {
            self.snapshots = ctx.db.load_page_availability(&ctx.archive, self.urlid).await?;
        }
        if self.snapshots.is_none() {
            let snaps = ctx.wayback.list_snapshots(&self.url).await;
            ctx.db
                .record_page_availability(&ctx.archive, self.urlid, &snaps)
                .await?;
            self.snapshots = Some(snaps);
        }

        if self.lodate.is_none() || self.hidate.is_none() {
            let (lo, hi) = ctx.db.load_date_range_for_url(&ctx.archive, self.urlid).await?;
            self.lodate = Some(lo);
            self.hidate = Some(hi);
        }
        let lodate = self.lodate.expect("window set above");
        let hidate = self.hidate.expect("window set above");

        let snapshots = self.snapshots.as_mut().expect("snapshots set above");
        snapshots.push(hidate);
        snapshots.sort();

        self.texts
            .extend(ctx.db.load_page_texts(&ctx.archive, self.urlid).await?);

        let wanted: Vec<DateTime<Utc>> =
            select_snapshots(snapshots, lodate - one_year(), hidate)
                .into_iter()
                .filter(|snap| !self.texts.contains(snap))
                .collect();
        self.to_retrieve = ruler_order(&wanted);

        debug!(
            url = self.url,
            available = snapshots.len(),
            to_retrieve = self.to_retrieve.len(),
            "retrieval plan loaded"
        );

        // Nothing left to fetch: everything in the window is already
        // captured. Flag it now so restarts skip the document entirely.
        if self.to_retrieve.is_empty() {
            ctx.db.note_page_processed(&ctx.archive, self.urlid).await?;
        }
        Ok(())
    }

    /// Fetch, extract, and record one snapshot off the end of the plan.
    ///
    /// Failures are contained: logged with the URL and timestamp, counted,
    /// and the document stays eligible for future cycles (and the failed
    /// snapshot for future runs). The document is flagged processed once the
    /// plan empties.
    pub async fn retrieve_next(&mut self, ctx: &SessionContext) {
        let Some(snap) = self.to_retrieve.pop() else {
            return;
        };

        if let Err(e) = self.retrieve_one(ctx, snap).await {
            ctx.errlog.record_chain(
                &format!(
                    "while retrieving snapshot {} for {}",
                    format_timestamp(snap),
                    self.url
                ),
                &e,
            );
            ctx.n_errors.fetch_add(1, Ordering::Relaxed);
        }

        self.texts.insert(snap);

        if self.to_retrieve.is_empty() {
            ctx.status
                .finish(&format!("{}:  {}", self.url, self.coverage_symbol()));
            if let Err(e) = ctx.db.note_page_processed(&ctx.archive, self.urlid).await {
                ctx.errlog
                    .record(&format!("marking {} processed", self.url), &e);
            }
        }
    }

    async fn retrieve_one(
        &mut self,
        ctx: &SessionContext,
        snap: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let page = ctx.wayback.get_page_at(&self.url, snap).await?;

        // Extraction is CPU-bound; one suspension point per job.
        let extract_ctx = Arc::clone(&ctx.extract);
        let ec = tokio::task::spawn_blocking(move || extract_page(page, &extract_ctx)).await?;

        ctx.db.record_historical_page(&ctx.archive, snap, &ec).await?;
        Ok(())
    }

    /// Remaining retrieval plan, in pop order (end first).
    pub fn remaining(&self) -> &[DateTime<Utc>] {
        &self.to_retrieve
    }

    /// The `[lodate, hidate]` window, once loaded.
    pub fn window(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (self.lodate, self.hidate)
    }
}
