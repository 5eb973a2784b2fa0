//! Wayback Machine client.
//!
//! Two operations over the metered HTTP engine: enumerate the snapshots of a
//! URL from the CDX index, and retrieve one snapshot's page. The archive has
//! quirky semantics this module absorbs so nothing downstream has to know
//! about them: cookie accumulation, internal redirects that must not be
//! confused with origin-site redirects, and errors of its own served with
//! the same status codes as errors it faithfully replays.

pub mod cdx;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::canon;
use crate::errlog::ErrorLog;
use crate::meter::Meter;
use crate::retry::Backoff;

/// Consecutive failures after which one snapshot fetch is abandoned.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Manual redirect budget per snapshot fetch.
const MAX_REDIRECTIONS: u32 = 20;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// An error generated by the archive itself (as opposed to one it
    /// replayed from the origin site).
    #[error("archive error: {status} {reason}")]
    Archive { status: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("query timed out")]
    Timeout,

    #[error("gave up after {0} consecutive failures")]
    GaveUp(u32),
}

impl ArchiveError {
    /// 4xx from the archive itself means the query we built is wrong;
    /// retrying cannot help.
    fn is_our_bug(&self) -> bool {
        matches!(self, ArchiveError::Archive { status, .. } if (400..500).contains(status))
    }
}

/// One page as retrieved from the archive, before extraction.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// The canonical URL we asked the archive about.
    pub url: String,
    /// The real target after following origin-site redirects.
    pub redir_url: String,
    /// Upstream status after archive-vs-replayed classification.
    pub status: u16,
    pub reason: String,
    pub content_type: Option<String>,
    /// Raw bytes in the page's original character encoding; the extractor
    /// does encoding detection.
    pub body: Vec<u8>,
}

/// Request counters surfaced on the progress line.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    pub pending: AtomicI64,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineStatsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub pending: i64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one raw HTTP exchange with the archive.
struct RawResponse {
    status: u16,
    reason: String,
    location: Option<String>,
    content_type: Option<String>,
    /// `None` for redirects (the body, if any, is archive chrome).
    body: Option<Vec<u8>>,
}

pub struct WaybackClient {
    meter: Arc<Meter>,
    host: String,
    errlog: Arc<ErrorLog>,
    stats: EngineStats,
}

impl WaybackClient {
    pub fn new(meter: Arc<Meter>, host: impl Into<String>, errlog: Arc<ErrorLog>) -> Self {
        Self {
            meter,
            host: host.into(),
            errlog,
            stats: EngineStats::default(),
        }
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Enumerate all retrievable snapshots of `url`, collapsed by content
    /// digest.
    ///
    /// Retries transient failures indefinitely with exponential backoff; a
    /// 403 from the index means the archive has captures it may not show us
    /// (robots.txt) and yields an empty list.
    pub async fn list_snapshots(&self, url: &str) -> Vec<DateTime<Utc>> {
        let query = cdx::CdxQuery::new(&self.host, url)
            .collapse("digest")
            .fields(&["original", "timestamp", "statuscode"])
            .build();

        let mut backoff = Backoff::new();
        let body = loop {
            match self.snapshots_request(url, &query).await {
                Ok(body) => break body,
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    self.errlog.record(&format!("GET {}", query), &e);
                    backoff.sleep().await;
                }
            }
        };

        parse_snapshots_logging(url, &body, &self.errlog)
    }

    async fn snapshots_request(&self, url: &str, query: &str) -> Result<String, ArchiveError> {
        let mut guard = self.meter.acquire().await;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.stats.pending.fetch_add(1, Ordering::Relaxed);

        guard.clear_cookies();
        let result = tokio::time::timeout(guard.query_timeout(), async {
            let resp = guard.client().get(query).send().await?;
            let status = resp.status();
            match status.as_u16() {
                200 => Ok(resp.text().await.unwrap_or_default()),
                403 => {
                    // The index has captures but robots.txt forbids showing
                    // them. Not an error, just nothing retrievable.
                    self.errlog
                        .note(&format!("GET {} = 403 {}", url, reason_of(status)));
                    Ok(String::new())
                }
                code => Err(ArchiveError::Archive {
                    status: code,
                    reason: reason_of(status),
                }),
            }
        })
        .await;

        self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        match result {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => {
                if matches!(e, ArchiveError::Transport(_)) {
                    guard.discard();
                }
                Err(e)
            }
            Err(_) => {
                guard.discard();
                Err(ArchiveError::Timeout)
            }
        }
    }

    /// Retrieve `url` as captured at `snap`.
    ///
    /// Redirects are followed manually, distinguishing archive-internal
    /// hops (snapshot date adjustments) from replayed origin-site redirects
    /// which update the real target URL. A redirect chain longer than 20
    /// hops, or one with an unusable Location, degrades to an empty body
    /// that still flows through extraction.
    pub async fn get_page_at(
        &self,
        url: &str,
        snap: DateTime<Utc>,
    ) -> Result<FetchedPage, ArchiveError> {
        // The undocumented "id_" token makes the archive serve the page
        // without rewriting links or injecting its toolbar. The URL must not
        // be quoted beyond its canonical form.
        let snap_ts = cdx::format_timestamp(snap);
        let mut query = format!("https://{}/web/{}id_/{}", self.host, snap_ts, url);
        let mut redir_url = url.to_string();

        let mut redirections = 0;
        let mut last: RawResponse;
        loop {
            last = self.page_request(&query).await?;
            let Some(loc) = last.location.take() else {
                break;
            };
            if last.body.is_some() {
                break;
            }
            redirections += 1;
            if redirections >= MAX_REDIRECTIONS {
                debug!(url, "redirection budget exhausted");
                break;
            }
            match redirect_target(&self.host, &snap_ts, &redir_url, &loc) {
                Ok((next_query, next_redir)) => {
                    query = next_query;
                    redir_url = next_redir;
                }
                Err(_) => {
                    // Unusable Location; treat like a redirection loop.
                    warn!(url, location = loc, "invalid redirect target");
                    break;
                }
            }
        }

        Ok(FetchedPage {
            url: url.to_string(),
            redir_url,
            status: last.status,
            reason: last.reason,
            content_type: last.content_type,
            // None here means the redirect walk never reached content.
            body: last.body.unwrap_or_default(),
        })
    }

    /// One page request with the retry policy: exponential backoff, at most
    /// ten consecutive failures, archive-generated 4xx never retried.
    async fn page_request(&self, query: &str) -> Result<RawResponse, ArchiveError> {
        let mut backoff = Backoff::new();
        loop {
            match self.page_request_once(query).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    self.errlog.record(&format!("GET {}", query), &e);
                    if e.is_our_bug() {
                        return Err(e);
                    }
                    if backoff.failures() + 1 >= MAX_CONSECUTIVE_FAILURES {
                        return Err(ArchiveError::GaveUp(MAX_CONSECUTIVE_FAILURES));
                    }
                    backoff.sleep().await;
                }
            }
        }
    }

    async fn page_request_once(&self, query: &str) -> Result<RawResponse, ArchiveError> {
        let mut guard = self.meter.acquire().await;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.stats.pending.fetch_add(1, Ordering::Relaxed);

        guard.clear_cookies();
        let result = tokio::time::timeout(guard.query_timeout(), async {
            let resp = guard.client().get(query).send().await?;
            let status = resp.status();
            let code = status.as_u16();
            let reason = reason_of(status);
            let location = header_str(&resp, reqwest::header::LOCATION);
            let content_type = header_str(&resp, reqwest::header::CONTENT_TYPE);

            if (300..400).contains(&code) {
                // Don't read redirect bodies; they are archive chrome.
                return Ok(RawResponse {
                    status: code,
                    reason,
                    location,
                    content_type: None,
                    body: None,
                });
            }

            // The archive faithfully records and replays malformed HTTP
            // responses; a body that cannot be read is an empty document,
            // not a failure.
            let body = match resp.bytes().await {
                Ok(b) => b.to_vec(),
                Err(e) => {
                    warn!(query, error = %e, "unreadable replayed body, treating as empty");
                    Vec::new()
                }
            };

            if error_from_archive(code, &body) {
                return Err(ArchiveError::Archive {
                    status: code,
                    reason,
                });
            }

            Ok(RawResponse {
                status: code,
                reason,
                location: None,
                content_type,
                body: Some(body),
            })
        })
        .await;

        self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        match result {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                if matches!(e, ArchiveError::Transport(_)) {
                    guard.discard();
                }
                Err(e)
            }
            Err(_) => {
                guard.discard();
                Err(ArchiveError::Timeout)
            }
        }
    }
}

fn reason_of(status: reqwest::StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or_else(|| crate::status::reason_phrase(status.as_u16()))
        .to_string()
}

fn header_str(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn parse_snapshots_logging(url: &str, body: &str, errlog: &ErrorLog) -> Vec<DateTime<Utc>> {
    let before = body.lines().filter(|l| !l.is_empty()).count();
    let snaps = cdx::parse_snapshot_lines(url, body);
    if before > 0 && snaps.is_empty() {
        errlog.note(&format!("CDX: no retrievable rows for {}", url));
    }
    snaps
}

/// Classify a redirect `Location`.
///
/// Redirections happen either because the origin page redirected when it was
/// crawled, or because the snapshot date is off by a little (the archive
/// redirects within itself to the nearest capture). In the former case the
/// real target URL changes; in the latter it must not.
///
/// Returns `(next_query, next_redir_url)`.
pub fn redirect_target(
    host: &str,
    snap_ts: &str,
    redir_url: &str,
    location: &str,
) -> Result<(String, String), canon::CanonError> {
    if location.starts_with("/web/") {
        return Ok((format!("https://{}{}", host, location), redir_url.to_string()));
    }
    let host_prefix = format!("https://{}/", host);
    if location.starts_with(&host_prefix) {
        return Ok((location.to_string(), redir_url.to_string()));
    }

    let new_target = if location.starts_with("http://") || location.starts_with("https://") {
        canon::canonicalize(location)?
    } else {
        canon::canonicalize_join(redir_url, location)?
    };
    let query = format!("https://{}/web/{}id_/{}", host, snap_ts, new_target);
    Ok((query, new_target))
}

/// True when a non-redirect response was generated by the archive itself
/// rather than replayed from the origin site.
///
/// Statuses 200, 401, 403, 404, 410, 451 always reflect the page's true
/// status. For everything else, the archive's own error pages always name
/// its host (or its scheduled-maintenance banner) and are pure ASCII;
/// replayed errors are not.
pub fn error_from_archive(status: u16, body: &[u8]) -> bool {
    if matches!(status, 200 | 401 | 403 | 404 | 410 | 451) {
        return false;
    }
    let Ok(decoded) = std::str::from_utf8(body) else {
        return false;
    };
    if !decoded.is_ascii() {
        return false;
    }
    decoded.contains("//web.archive.org/")
        || decoded.contains("//archive.org/")
        || decoded.contains(">Internet Archive: Scheduled Maintenance<")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::MeterConfig;

    fn unreachable_client() -> (WaybackClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let errlog = Arc::new(ErrorLog::open(dir.path().join("errors.log")).unwrap());
        let meter = Meter::new(MeterConfig {
            rate: 1000.0,
            ..MeterConfig::default()
        });
        // Port 1 refuses connections; every attempt is a transport failure.
        (WaybackClient::new(meter, "127.0.0.1:1", errlog), dir)
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_ten_consecutive_failures() {
        let (client, _dir) = unreachable_client();
        let snap = chrono::Utc::now();
        let result = client.get_page_at("http://example.com/", snap).await;
        assert!(
            matches!(result, Err(ArchiveError::GaveUp(10))),
            "{result:?}"
        );
        let stats = client.stats();
        assert_eq!(stats.errors, 10);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn archive_error_detection_by_status() {
        let body = b"ERROR ... see https://web.archive.org/ for details";
        // Trusted statuses are never archive errors, whatever the body says.
        for status in [200, 401, 403, 404, 410, 451] {
            assert!(!error_from_archive(status, body), "status {status}");
        }
        assert!(error_from_archive(503, body));
        assert!(error_from_archive(500, body));
    }

    #[test]
    fn replayed_error_is_not_archive_error() {
        assert!(!error_from_archive(503, b"<html>Site temporarily down</html>"));
    }

    #[test]
    fn maintenance_banner_is_archive_error() {
        assert!(error_from_archive(
            502,
            b"<title>Internet Archive: Scheduled Maintenance</title>\
              <h1>Internet Archive: Scheduled Maintenance</h1>"
        ));
    }

    #[test]
    fn non_ascii_body_is_replayed() {
        assert!(!error_from_archive(
            503,
            "web.archive.org / tillfälligt fel".as_bytes()
        ));
    }

    #[test]
    fn archive_internal_redirect_keeps_target() {
        let (query, redir) = redirect_target(
            "web.archive.org",
            "20130701000000",
            "http://foo.example/a",
            "/web/20130701000512id_/http://foo.example/a",
        )
        .unwrap();
        assert_eq!(
            query,
            "https://web.archive.org/web/20130701000512id_/http://foo.example/a"
        );
        assert_eq!(redir, "http://foo.example/a");
    }

    #[test]
    fn absolute_archive_redirect_keeps_target() {
        let (query, redir) = redirect_target(
            "web.archive.org",
            "20130701000000",
            "http://foo.example/a",
            "https://web.archive.org/web/20130701000512id_/http://foo.example/a",
        )
        .unwrap();
        assert!(query.starts_with("https://web.archive.org/web/"));
        assert_eq!(redir, "http://foo.example/a");
    }

    #[test]
    fn origin_redirect_updates_target_and_requeries() {
        let (query, redir) = redirect_target(
            "web.archive.org",
            "20130701000000",
            "http://foo.example/a",
            "http://bar.example/b",
        )
        .unwrap();
        assert_eq!(redir, "http://bar.example/b");
        assert_eq!(
            query,
            "https://web.archive.org/web/20130701000000id_/http://bar.example/b"
        );
    }

    #[test]
    fn relative_origin_redirect_resolves_against_target() {
        let (query, redir) = redirect_target(
            "web.archive.org",
            "20130701000000",
            "http://foo.example/a/b",
            "../c",
        )
        .unwrap();
        assert_eq!(redir, "http://foo.example/c");
        assert!(query.ends_with("id_/http://foo.example/c"));
    }

    #[test]
    fn invalid_origin_redirect_is_an_error() {
        assert!(redirect_target(
            "web.archive.org",
            "20130701000000",
            "http://foo.example/a",
            "ftp://bar.example/x",
        )
        .is_err());
    }
}
