//! SQLite persistence.
//!
//! One connection, serialized behind an async lock: SQLite gives us
//! asynchrony-friendly short transactions but not per-connection
//! concurrency, so every database operation takes the lock, does its work
//! synchronously, and releases. Interning and historical-page insertion for
//! one extracted page happen inside a single transaction; no partial page is
//! ever visible.

pub mod intern;

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::archive::cdx::{format_timestamp, parse_timestamp};
use crate::canon::{self, CanonError};
use crate::extract::bundle::ExtractedContent;
use crate::status;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Canon(#[from] CanonError),
    #[error("missing dates for url {urlid}: no source or capture dates recorded")]
    MissingDates { urlid: i64 },
    #[error("fine status {detail:?} maps to conflicting coarse results")]
    InconsistentStatus { detail: String },
}

pub type DbResult<T> = Result<T, DbError>;

/// A partially processed document as loaded from the availability table.
#[derive(Debug, Clone)]
pub struct IncompletePage {
    pub urlid: i64,
    pub url: String,
    pub lodate: Option<DateTime<Utc>>,
    pub hidate: Option<DateTime<Utc>>,
    pub snapshots: Vec<DateTime<Utc>>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS url_strings (
    id   INTEGER PRIMARY KEY,
    url  TEXT NOT NULL UNIQUE
);

-- The work list, populated by the URL-ingest pipelines.
CREATE TABLE IF NOT EXISTS urls (
    url            INTEGER NOT NULL REFERENCES url_strings(id),
    source_date    TEXT,
    last_seen_date TEXT
);

CREATE TABLE IF NOT EXISTS historical_page_availability (
    id            INTEGER PRIMARY KEY,
    archive       TEXT NOT NULL,
    url           INTEGER NOT NULL REFERENCES url_strings(id),
    snapshots     TEXT,
    earliest_date TEXT,
    latest_date   TEXT,
    processed     INTEGER NOT NULL DEFAULT 0,
    UNIQUE (archive, url)
);

CREATE TABLE IF NOT EXISTS capture_coarse_result (
    id     INTEGER PRIMARY KEY,
    result TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS capture_fine_result (
    id     INTEGER PRIMARY KEY,
    result INTEGER NOT NULL REFERENCES capture_coarse_result(id),
    detail TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS capture_html_content (
    id                    INTEGER PRIMARY KEY,
    hash                  BLOB NOT NULL UNIQUE,
    content               BLOB,
    extracted             INTEGER REFERENCES extracted_content_ov(id),
    is_parked             INTEGER,
    parking_rules_matched TEXT
);

CREATE TABLE IF NOT EXISTS extracted_plaintext (
    id        INTEGER PRIMARY KEY,
    hash      BLOB NOT NULL UNIQUE,
    plaintext TEXT,
    segmented TEXT
);

CREATE TABLE IF NOT EXISTS extracted_headings (
    id       INTEGER PRIMARY KEY,
    hash     BLOB NOT NULL UNIQUE,
    headings TEXT
);

CREATE TABLE IF NOT EXISTS extracted_urls (
    id   INTEGER PRIMARY KEY,
    hash BLOB NOT NULL UNIQUE,
    urls TEXT
);

CREATE TABLE IF NOT EXISTS extracted_dom_stats (
    id        INTEGER PRIMARY KEY,
    hash      BLOB NOT NULL UNIQUE,
    dom_stats TEXT
);

CREATE TABLE IF NOT EXISTS extracted_content_ov (
    id          INTEGER PRIMARY KEY,
    content_len INTEGER NOT NULL,
    raw_text    INTEGER NOT NULL REFERENCES extracted_plaintext(id),
    pruned_text INTEGER NOT NULL REFERENCES extracted_plaintext(id),
    links       INTEGER NOT NULL REFERENCES extracted_urls(id),
    resources   INTEGER NOT NULL REFERENCES extracted_urls(id),
    headings    INTEGER NOT NULL REFERENCES extracted_headings(id),
    dom_stats   INTEGER NOT NULL REFERENCES extracted_dom_stats(id)
);

CREATE TABLE IF NOT EXISTS historical_pages (
    url          INTEGER NOT NULL REFERENCES url_strings(id),
    archive      TEXT NOT NULL,
    archive_time TEXT NOT NULL,
    result       INTEGER NOT NULL REFERENCES capture_fine_result(id),
    redir_url    INTEGER NOT NULL REFERENCES url_strings(id),
    html_content INTEGER NOT NULL REFERENCES capture_html_content(id),
    is_parked    INTEGER NOT NULL,
    UNIQUE (archive, archive_time, url)
);
"#;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> DbResult<()> {
        // WAL for concurrent readers; NORMAL sync is safe with WAL.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 30000;
        "#,
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn schema_for_tests() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        Self::init(&conn).unwrap();
        conn
    }

    /// Canonicalize `url` and intern it in `url_strings`.
    ///
    /// Returns `(id, canonical_url)`.
    pub async fn add_url_string(&self, url: &str) -> DbResult<(i64, String)> {
        let conn = self.conn.lock().await;
        add_url_string(&conn, url)
    }

    /// Register a URL in the work list. The ingest pipelines normally do
    /// this; it is part of the public surface for seeding and tests.
    pub async fn seed_url(
        &self,
        url: &str,
        source_date: DateTime<Utc>,
        last_seen_date: DateTime<Utc>,
    ) -> DbResult<i64> {
        let conn = self.conn.lock().await;
        let (urlid, _) = add_url_string(&conn, url)?;
        conn.execute(
            "INSERT INTO urls (url, source_date, last_seen_date) VALUES (?1, ?2, ?3)",
            rusqlite::params![urlid, source_date.to_rfc3339(), last_seen_date.to_rfc3339()],
        )?;
        Ok(urlid)
    }

    /// The `[lodate, hidate]` window of interest for one URL: cached on the
    /// availability record, derived on first use from the ingest metadata
    /// (earliest source date, latest live sighting).
    pub async fn load_date_range_for_url(
        &self,
        archive: &str,
        urlid: i64,
    ) -> DbResult<(DateTime<Utc>, DateTime<Utc>)> {
        let conn = self.conn.lock().await;

        let cached: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT earliest_date, latest_date FROM historical_page_availability
                  WHERE archive = ?1 AND url = ?2",
                rusqlite::params![archive, urlid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((Some(lo), Some(hi))) = cached {
            if let (Some(lo), Some(hi)) = (parse_rfc3339(&lo), parse_rfc3339(&hi)) {
                return Ok((lo, hi));
            }
        }

        let (lo, hi): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(source_date), MAX(last_seen_date) FROM urls WHERE url = ?1",
            [urlid],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let lodate = lo.as_deref().and_then(parse_rfc3339);
        let hidate = hi.as_deref().and_then(parse_rfc3339);
        let (lodate, hidate) = match (lodate, hidate) {
            (Some(lo), Some(hi)) => (lo, hi),
            _ => return Err(DbError::MissingDates { urlid }),
        };

        conn.execute(
            "UPDATE historical_page_availability
                SET earliest_date = ?1, latest_date = ?2
              WHERE archive = ?3 AND url = ?4",
            rusqlite::params![lodate.to_rfc3339(), hidate.to_rfc3339(), archive, urlid],
        )?;

        Ok((lodate, hidate))
    }

    /// Previously recorded snapshot list, if any.
    pub async fn load_page_availability(
        &self,
        archive: &str,
        urlid: i64,
    ) -> DbResult<Option<Vec<DateTime<Utc>>>> {
        let conn = self.conn.lock().await;
        let snapshots: Option<Option<String>> = conn
            .query_row(
                "SELECT snapshots FROM historical_page_availability
                  WHERE archive = ?1 AND url = ?2",
                rusqlite::params![archive, urlid],
                |row| row.get(0),
            )
            .optional()?;
        match snapshots.flatten() {
            Some(json) => Ok(Some(snapshots_from_json(&json)?)),
            None => Ok(None),
        }
    }

    /// Create the availability record for a URL whose snapshots were just
    /// enumerated.
    pub async fn record_page_availability(
        &self,
        archive: &str,
        urlid: i64,
        snapshots: &[DateTime<Utc>],
    ) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO historical_page_availability (archive, url, snapshots)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![archive, urlid, snapshots_to_json(snapshots)?],
        )?;
        Ok(())
    }

    /// Flip the availability record to processed. Happens exactly once per
    /// record, when the retrieval plan empties.
    pub async fn note_page_processed(&self, archive: &str, urlid: i64) -> DbResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE historical_page_availability SET processed = 1
              WHERE archive = ?1 AND url = ?2",
            rusqlite::params![archive, urlid],
        )?;
        Ok(())
    }

    pub async fn load_page_processed_count(&self, archive: &str) -> DbResult<u64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM historical_page_availability
              WHERE archive = ?1 AND processed = 1",
            [archive],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Timestamps for which a historical page record already exists.
    pub async fn load_page_texts(
        &self,
        archive: &str,
        urlid: i64,
    ) -> DbResult<Vec<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT archive_time FROM historical_pages
              WHERE url = ?1 AND archive = ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![urlid, archive], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            if let Some(ts) = parse_timestamp(&row?) {
                out.push(ts);
            }
        }
        Ok(out)
    }

    /// Persist one extracted page: intern every artifact, link the
    /// extraction overview, and insert the historical page record — all in
    /// one transaction.
    pub async fn record_historical_page(
        &self,
        archive: &str,
        date: DateTime<Utc>,
        ec: &ExtractedContent,
    ) -> DbResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let (docid, mut eid) = intern::intern_html_content(&tx, &ec.ohash, &ec.original)?;

            if eid.is_none() {
                let cid = intern::intern_plaintext_segmented(
                    &tx,
                    &ec.chash,
                    &ec.content,
                    ec.csegmtd.as_deref(),
                )?;
                let pid = intern::intern_plaintext_segmented(
                    &tx,
                    &ec.phash,
                    &ec.pruned,
                    ec.psegmtd.as_deref(),
                )?;
                let hid = intern::intern_blob(
                    &tx,
                    "extracted_headings",
                    "headings",
                    &ec.hhash,
                    &ec.heads,
                    true,
                )?;
                let lid =
                    intern::intern_blob(&tx, "extracted_urls", "urls", &ec.lhash, &ec.links, true)?;
                let rid =
                    intern::intern_blob(&tx, "extracted_urls", "urls", &ec.rhash, &ec.rsrcs, true)?;
                let did = intern::intern_blob(
                    &tx,
                    "extracted_dom_stats",
                    "dom_stats",
                    &ec.dhash,
                    &ec.domst,
                    true,
                )?;

                tx.execute(
                    "INSERT INTO extracted_content_ov
                     (content_len, raw_text, pruned_text, links, resources, headings, dom_stats)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![ec.olen as i64, cid, pid, lid, rid, hid, did],
                )?;
                let new_eid = tx.last_insert_rowid();

                tx.execute(
                    "UPDATE capture_html_content
                        SET extracted = ?1, is_parked = ?2, parking_rules_matched = ?3
                      WHERE id = ?4",
                    rusqlite::params![
                        new_eid,
                        ec.parked,
                        serde_json::to_string(&ec.prules)?,
                        docid
                    ],
                )?;
                eid = Some(new_eid);
            }
            debug_assert!(eid.is_some());

            let (uid, _) = add_url_string(&tx, &ec.url)?;
            let ruid = if ec.redir_url == ec.url {
                uid
            } else {
                add_url_string(&tx, &ec.redir_url)?.0
            };

            let sid = add_http_status(&tx, ec.status, &ec.reason)?;

            tx.execute(
                "INSERT INTO historical_pages
                 (url, archive, archive_time, result, redir_url, html_content, is_parked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    uid,
                    archive,
                    format_timestamp(date),
                    sid,
                    ruid,
                    docid,
                    ec.parked
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// URLs with no availability record under this archive.
    pub async fn get_unprocessed_pages(&self, archive: &str) -> DbResult<Vec<(i64, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT u.url, s.url
               FROM urls u
               JOIN url_strings s ON u.url = s.id
               LEFT JOIN historical_page_availability h
                 ON h.archive = ?1 AND h.url = u.url
              WHERE h.url IS NULL",
        )?;
        let rows = stmt.query_map([archive], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// URLs with an availability record that is not yet processed.
    pub async fn get_incomplete_pages(&self, archive: &str) -> DbResult<Vec<IncompletePage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT h.url, s.url, h.earliest_date, h.latest_date, h.snapshots
               FROM historical_page_availability h
               JOIN url_strings s ON h.url = s.id
              WHERE h.archive = ?1 AND h.processed = 0",
        )?;
        let rows = stmt.query_map([archive], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (urlid, url, lo, hi, snapshots) = row?;
            let mut snapshots = match snapshots {
                Some(json) => snapshots_from_json(&json)?,
                None => Vec::new(),
            };
            snapshots.sort();
            out.push(IncompletePage {
                urlid,
                url,
                lodate: lo.as_deref().and_then(parse_rfc3339),
                hidate: hi.as_deref().and_then(parse_rfc3339),
                snapshots,
            });
        }
        Ok(out)
    }

    /// The interned content id recorded for a page, if the page exists.
    pub async fn page_content_id(
        &self,
        archive: &str,
        urlid: i64,
        date: DateTime<Utc>,
    ) -> DbResult<Option<i64>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT html_content FROM historical_pages
              WHERE archive = ?1 AND url = ?2 AND archive_time = ?3",
            rusqlite::params![archive, urlid, format_timestamp(date)],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// `(id, extracted)` of an interned HTML content row, by hash.
    pub async fn html_content_row(&self, hash: &[u8]) -> DbResult<Option<(i64, Option<i64>)>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, extracted FROM capture_html_content WHERE hash = ?1",
            [hash],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Fine-result detail and coarse-result bucket recorded for a page.
    pub async fn page_result(
        &self,
        archive: &str,
        urlid: i64,
        date: DateTime<Utc>,
    ) -> DbResult<Option<(String, String)>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT f.detail, c.result
               FROM historical_pages p
               JOIN capture_fine_result f ON p.result = f.id
               JOIN capture_coarse_result c ON f.result = c.id
              WHERE p.archive = ?1 AND p.url = ?2 AND p.archive_time = ?3",
            rusqlite::params![archive, urlid, format_timestamp(date)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(Into::into)
    }
}

/// Canonicalize and intern a URL string. Free function so transaction code
/// can call it on a borrowed connection.
fn add_url_string(conn: &Connection, url: &str) -> DbResult<(i64, String)> {
    let canonical = canon::canonicalize(url)?;
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM url_strings WHERE url = ?1",
            [&canonical],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok((id, canonical));
    }
    conn.execute("INSERT INTO url_strings (url) VALUES (?1)", [&canonical])?;
    Ok((conn.last_insert_rowid(), canonical))
}

/// Intern a status line as a fine result linked to its coarse bucket.
fn add_http_status(conn: &Connection, code: u16, reason: &str) -> DbResult<i64> {
    let coarse = status::coarse_result(code);
    let fine = status::fine_result(code, reason);

    let cid: i64 = match conn
        .query_row(
            "SELECT id FROM capture_coarse_result WHERE result = ?1",
            [coarse],
            |row| row.get(0),
        )
        .optional()?
    {
        Some(id) => id,
        None => {
            conn.execute(
                "INSERT INTO capture_coarse_result (result) VALUES (?1)",
                [coarse],
            )?;
            conn.last_insert_rowid()
        }
    };

    let existing: Option<(i64, i64)> = conn
        .query_row(
            "SELECT id, result FROM capture_fine_result WHERE detail = ?1",
            [&fine],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match existing {
        Some((fid, prior_cid)) => {
            if prior_cid != cid {
                return Err(DbError::InconsistentStatus { detail: fine });
            }
            Ok(fid)
        }
        None => {
            conn.execute(
                "INSERT INTO capture_fine_result (result, detail) VALUES (?1, ?2)",
                rusqlite::params![cid, fine],
            )?;
            Ok(conn.last_insert_rowid())
        }
    }
}

fn snapshots_to_json(snapshots: &[DateTime<Utc>]) -> Result<String, serde_json::Error> {
    let strings: Vec<String> = snapshots.iter().map(|d| format_timestamp(*d)).collect();
    serde_json::to_string(&strings)
}

fn snapshots_from_json(json: &str) -> DbResult<Vec<DateTime<Utc>>> {
    let strings: Vec<String> = serde_json::from_str(json)?;
    Ok(strings.iter().filter_map(|s| parse_timestamp(s)).collect())
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
