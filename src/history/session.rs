//! The retrieval dispatcher.
//!
//! Cycle 0 loads every document's plan; each later cycle gives every
//! remaining document exactly one `retrieve_next` call, in shuffled order so
//! load spreads across archive frontends. Documents drop out as their plans
//! empty. A stop signal takes effect at the next cycle boundary.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::task::JoinSet;
use tracing::info;

use super::document::Document;
use crate::archive::WaybackClient;
use crate::db::Database;
use crate::errlog::ErrorLog;
use crate::extract::bundle::ExtractContext;
use crate::progress::StatusLine;

/// Everything a document task needs, shared across the whole session.
pub struct SessionContext {
    pub archive: String,
    pub db: Database,
    pub wayback: WaybackClient,
    pub extract: Arc<ExtractContext>,
    pub errlog: Arc<ErrorLog>,
    pub status: StatusLine,
    /// Document-level errors, shown on the progress line.
    pub n_errors: AtomicU64,
}

#[derive(Clone, Copy)]
enum Phase {
    Load,
    Retrieve,
}

pub struct HistorySession {
    ctx: Arc<SessionContext>,
    cancel: Arc<AtomicBool>,
    cycle: u64,
    n_unprocessed: usize,
    n_complete: u64,
}

impl HistorySession {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            cancel: Arc::new(AtomicBool::new(false)),
            cycle: 0,
            n_unprocessed: 0,
            n_complete: 0,
        }
    }

    /// Request a stop at the next cycle boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run to completion (or cancellation).
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let ctx = Arc::clone(&self.ctx);

        ctx.status.update("loading...");
        let unprocessed = ctx.db.get_unprocessed_pages(&ctx.archive).await?;
        ctx.status
            .update(&format!("loading: {} unprocessed...", unprocessed.len()));

        let incomplete = ctx.db.get_incomplete_pages(&ctx.archive).await?;
        ctx.status.update(&format!(
            "loading: {} unprocessed, {} partial...",
            unprocessed.len(),
            incomplete.len()
        ));

        self.n_complete = ctx.db.load_page_processed_count(&ctx.archive).await?;
        ctx.status.finish(&format!(
            "loading: {} unprocessed, {} partial, {} complete.",
            unprocessed.len(),
            incomplete.len(),
            self.n_complete
        ));

        let mut docs: Vec<Document> = unprocessed
            .into_iter()
            .map(|(urlid, url)| Document::new(urlid, url))
            .chain(incomplete.into_iter().map(|page| {
                Document::resumed(
                    page.urlid,
                    page.url,
                    page.snapshots,
                    page.lodate,
                    page.hidate,
                )
            }))
            .collect();

        // Cycle 0: bring every plan up to date with the database/archive.
        docs = self.run_cycle(docs, Phase::Load).await;

        while !docs.is_empty() {
            if self.cancel.load(Ordering::Relaxed) {
                self.ctx
                    .status
                    .finish("stopped; partial progress is in the database.");
                info!(remaining = docs.len(), "session cancelled at cycle boundary");
                return Ok(());
            }

            self.cycle += 1;
            docs.shuffle(&mut rand::thread_rng());
            docs = self.run_cycle(docs, Phase::Retrieve).await;
        }

        self.progress(".", true);
        Ok(())
    }

    /// One cycle: one task per document, all awaited. Per-document failures
    /// are recorded and the document is dropped for this run; everything
    /// else proceeds.
    async fn run_cycle(&mut self, docs: Vec<Document>, phase: Phase) -> Vec<Document> {
        self.n_unprocessed = docs.len();

        let mut tasks = JoinSet::new();
        for mut doc in docs {
            let ctx = Arc::clone(&self.ctx);
            tasks.spawn(async move {
                let result = match phase {
                    Phase::Load => doc.load_history(&ctx).await,
                    Phase::Retrieve => {
                        // retrieve_next contains its own failures.
                        doc.retrieve_next(&ctx).await;
                        Ok(())
                    }
                };
                (doc, result)
            });
        }

        let mut remaining = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            self.n_unprocessed = self.n_unprocessed.saturating_sub(1);
            match joined {
                Ok((doc, Ok(()))) => {
                    if doc.is_complete() {
                        self.n_complete += 1;
                    } else {
                        remaining.push(doc);
                    }
                }
                Ok((doc, Err(e))) => {
                    self.ctx
                        .errlog
                        .record_chain(&format!("loading history for {}", doc.url), &e);
                    self.ctx.n_errors.fetch_add(1, Ordering::Relaxed);
                }
                Err(join_error) => {
                    self.ctx
                        .errlog
                        .note(&format!("document task panicked: {}", join_error));
                    self.ctx.n_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.progress("", false);
        }

        self.progress("complete.", true);
        remaining
    }

    fn progress(&self, message: &str, done: bool) {
        let engine = self.ctx.wayback.stats();
        let mut line = format!(
            "cycle {}: {} to do, {} complete, {} errors; wb {}p/{}e/{}r",
            self.cycle,
            self.n_unprocessed,
            self.n_complete,
            self.ctx.n_errors.load(Ordering::Relaxed),
            engine.pending,
            engine.errors,
            engine.requests,
        );
        if !message.is_empty() && message != "." {
            line.push_str("; ");
            line.push_str(message);
        }
        if done {
            self.ctx.status.finish(&line);
        } else {
            self.ctx.status.update(&line);
        }
    }
}
