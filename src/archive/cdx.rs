//! Wayback Machine CDX index protocol.
//!
//! Query-URL construction, line-oriented response parsing, and timestamp
//! handling for the archive's snapshot index.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

/// Status codes under which a capture counts as retrievable: a success, or a
/// redirect we can chase through the archive.
const RETRIEVABLE_STATUS: [&str; 6] = ["200", "301", "302", "303", "307", "308"];

/// Builder for CDX index query URLs.
pub struct CdxQuery {
    host: String,
    url: String,
    collapse: Option<String>,
    fields: Vec<String>,
}

impl CdxQuery {
    /// Query for all captures of `url` on the archive at `host`.
    pub fn new(host: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            url: url.into(),
            collapse: None,
            fields: Vec::new(),
        }
    }

    /// Set the collapse field (`collapse=` parameter).
    pub fn collapse(mut self, field: impl Into<String>) -> Self {
        self.collapse = Some(field.into());
        self
    }

    /// Set the fields to return (`fl=` parameter).
    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Build the final query URL.
    pub fn build(&self) -> String {
        let mut out = format!(
            "https://{}/cdx/search/cdx?url={}",
            self.host,
            urlquery_encode(&self.url)
        );
        if let Some(ref c) = self.collapse {
            out.push_str("&collapse=");
            out.push_str(c);
        }
        if !self.fields.is_empty() {
            out.push_str("&fl=");
            out.push_str(&self.fields.join(","));
        }
        out
    }
}

/// Percent-encode a URL for embedding as a query-string value. The URL is
/// already canonical ASCII, so only the query-metacharacters need escaping.
fn urlquery_encode(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    for b in url.bytes() {
        match b {
            b'&' => out.push_str("%26"),
            b'+' => out.push_str("%2B"),
            b'#' => out.push_str("%23"),
            b' ' => out.push_str("%20"),
            _ => out.push(b as char),
        }
    }
    out
}

/// Parse the line-oriented CDX response for `queried_url`.
///
/// Each line is `original timestamp statuscode`, whitespace-separated. Rows
/// are kept when the echoed URL matches the queried one exactly (the index
/// does not honor the scheme, so it may answer for relatives we did not ask
/// about) and the capture status is retrievable. Unparseable lines are
/// logged and skipped.
pub fn parse_snapshot_lines(queried_url: &str, body: &str) -> Vec<DateTime<Utc>> {
    let mut snapshots = Vec::new();
    for line in body.lines() {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (url, timestamp, statuscode) = match (fields.next(), fields.next(), fields.next()) {
            (Some(u), Some(t), Some(s)) => (u, t, s),
            _ => {
                warn!(url = queried_url, line, "CDX parse error: short line");
                continue;
            }
        };
        if url != queried_url || !RETRIEVABLE_STATUS.contains(&statuscode) {
            continue;
        }
        match parse_timestamp(timestamp) {
            Some(ts) => snapshots.push(ts),
            None => warn!(url = queried_url, line, "CDX parse error: bad timestamp"),
        }
    }
    snapshots
}

/// Parse an archive timestamp (`YYYYMMDDHHMMSS`) into a [`DateTime<Utc>`].
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    if ts.len() != 14 {
        return None;
    }
    NaiveDateTime::parse_from_str(ts, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| dt.and_utc())
}

/// Format a [`DateTime<Utc>`] as an archive timestamp (`YYYYMMDDHHMMSS`).
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%d%H%M%S").to_string()
}
