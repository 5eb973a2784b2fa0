//! End-to-end tests of the extraction/interning pipeline and the
//! per-document resume logic, against an in-memory database.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use pagehist::archive::{FetchedPage, WaybackClient};
use pagehist::db::Database;
use pagehist::errlog::ErrorLog;
use pagehist::extract::bundle::{extract_page, sha256, ExtractContext, ExtractedContent};
use pagehist::extract::parking::ParkingClassifier;
use pagehist::extract::segment::Segmenter;
use pagehist::history::{Document, SessionContext};
use pagehist::meter::{Meter, MeterConfig};
use pagehist::progress::StatusLine;
use pagehist::schedule::{one_year, ruler_order, select_snapshots};

fn d(y: i32, m: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, day, 0, 0, 0).unwrap()
}

fn extract_ctx() -> Arc<ExtractContext> {
    ExtractContext::new(ParkingClassifier::builtin(), Segmenter::new())
}

fn sample_page(url: &str, body: &str) -> FetchedPage {
    FetchedPage {
        url: url.to_string(),
        redir_url: url.to_string(),
        status: 200,
        reason: "OK".to_string(),
        content_type: Some("text/html; charset=utf-8".to_string()),
        body: body.as_bytes().to_vec(),
    }
}

fn sample_ec(url: &str, body: &str) -> ExtractedContent {
    extract_page(sample_page(url, body), &extract_ctx())
}

fn session_context(db: Database) -> Arc<SessionContext> {
    let dir = tempfile::tempdir().unwrap();
    let errlog = Arc::new(ErrorLog::open(dir.path().join("errors.log")).unwrap());
    let meter = Meter::new(MeterConfig::default());
    let wayback = WaybackClient::new(meter, "web.archive.org", Arc::clone(&errlog));
    Arc::new(SessionContext {
        archive: "wayback".to_string(),
        db,
        wayback,
        extract: extract_ctx(),
        errlog,
        status: StatusLine::new(),
        n_errors: AtomicU64::new(0),
    })
}

// Two captures with byte-identical HTML intern one content row, two page
// rows sharing it, and one extraction.
#[tokio::test]
async fn identical_html_is_interned_once() {
    let db = Database::open_in_memory().unwrap();
    let url = "http://example.org/";
    let urlid = db.seed_url(url, d(2012, 6, 1), d(2014, 6, 1)).await.unwrap();

    let body = "<html><body>Unchanged for years.</body></html>";
    let ec1 = sample_ec(url, body);
    let ec2 = sample_ec(url, body);
    assert_eq!(ec1.ohash, ec2.ohash);

    db.record_historical_page("wayback", d(2012, 1, 1), &ec1).await.unwrap();

    // The second capture sees the existing extraction and must not repeat
    // the extraction stage.
    let (_, extracted) = db.html_content_row(&ec2.ohash).await.unwrap().unwrap();
    assert!(extracted.is_some());

    db.record_historical_page("wayback", d(2013, 1, 1), &ec2).await.unwrap();

    let id1 = db.page_content_id("wayback", urlid, d(2012, 1, 1)).await.unwrap().unwrap();
    let id2 = db.page_content_id("wayback", urlid, d(2013, 1, 1)).await.unwrap().unwrap();
    assert_eq!(id1, id2);
}

// A recorded page always points at fully-extracted content.
#[tokio::test]
async fn no_partial_insert() {
    let db = Database::open_in_memory().unwrap();
    let url = "http://example.org/full";
    let ec = sample_ec(url, "<html><h1>Title</h1><p>Body text.</p></html>");

    db.record_historical_page("wayback", d(2012, 1, 1), &ec).await.unwrap();

    let (id, extracted) = db.html_content_row(&ec.ohash).await.unwrap().unwrap();
    assert!(id > 0);
    assert!(extracted.is_some(), "content row has no extraction pointer");
    assert_eq!(sha256(&ec.original), ec.ohash);
}

// Oversized text is recorded with NULL segmentation; everything else lands.
#[tokio::test]
async fn oversized_segmentation_still_records_page() {
    let db = Database::open_in_memory().unwrap();
    let url = "http://example.org/huge";
    let (urlid, _) = db.add_url_string(url).await.unwrap();

    let mut ec = sample_ec(url, "<html><body>big page stand-in</body></html>");
    ec.csegmtd = None;
    ec.psegmtd = None;

    db.record_historical_page("wayback", d(2012, 1, 1), &ec).await.unwrap();

    let content_id = db.page_content_id("wayback", urlid, d(2012, 1, 1)).await.unwrap();
    assert!(content_id.is_some());
    let (_, extracted) = db.html_content_row(&ec.ohash).await.unwrap().unwrap();
    assert!(extracted.is_some());
}

// The recorded status is the true upstream status with its coarse bucket.
#[tokio::test]
async fn replayed_error_status_is_recorded() {
    let db = Database::open_in_memory().unwrap();
    let url = "http://example.org/down";
    let (urlid, _) = db.add_url_string(url).await.unwrap();

    let mut page = sample_page(url, "<html>Site temporarily down</html>");
    page.status = 503;
    page.reason = "Service Unavailable".to_string();
    let ec = extract_page(page, &extract_ctx());

    db.record_historical_page("wayback", d(2012, 1, 1), &ec).await.unwrap();

    let (detail, coarse) = db
        .page_result("wayback", urlid, d(2012, 1, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detail, "503 Service Unavailable");
    assert_eq!(coarse, "service unavailable (503)");
}

// Kill-and-restart: load_history rebuilds the plan with exactly the missing
// timestamps, in ruler order.
#[tokio::test]
async fn resume_replans_only_missing_snapshots() {
    let db = Database::open_in_memory().unwrap();
    let url = "http://example.org/resume";
    let urlid = db.seed_url(url, d(2012, 6, 1), d(2014, 6, 1)).await.unwrap();

    // Thirty snapshots, two months apart.
    let snapshots: Vec<DateTime<Utc>> = (0..30)
        .map(|i| d(2010, 1, 1) + chrono::Duration::days(i * 61))
        .collect();
    db.record_page_availability("wayback", urlid, &snapshots).await.unwrap();

    // Simulate a prior run that captured a prefix of the plan, then died.
    let lodate = d(2012, 6, 1) - one_year();
    let hidate = d(2014, 6, 1);
    let mut all_snapshots = snapshots.clone();
    all_snapshots.push(hidate);
    all_snapshots.sort();
    let wanted = select_snapshots(&all_snapshots, lodate, hidate);
    assert!(wanted.len() > 4, "test needs a non-trivial plan");

    let captured: Vec<DateTime<Utc>> = wanted.iter().take(3).cloned().collect();
    for snap in &captured {
        let ec = sample_ec(url, &format!("<html>state at {}</html>", snap));
        db.record_historical_page("wayback", *snap, &ec).await.unwrap();
    }

    // Restart: the document reloads from the database alone.
    let ctx = session_context(db);
    let mut doc = Document::resumed(urlid, url.to_string(), snapshots, None, None);
    doc.load_history(&ctx).await.unwrap();

    let expected: Vec<DateTime<Utc>> = wanted
        .iter()
        .filter(|s| !captured.contains(s))
        .cloned()
        .collect();
    assert_eq!(doc.remaining(), ruler_order(&expected).as_slice());
    assert!(!doc.is_complete());
    assert_eq!(doc.window(), (Some(d(2012, 6, 1)), Some(d(2014, 6, 1))));
}

// A document whose whole window is already captured is flagged processed
// during the load phase.
#[tokio::test]
async fn fully_captured_document_completes_at_load() {
    let db = Database::open_in_memory().unwrap();
    let url = "http://example.org/done";
    let urlid = db.seed_url(url, d(2012, 6, 1), d(2012, 9, 1)).await.unwrap();

    let snapshots = vec![d(2012, 1, 1), d(2012, 7, 1)];
    db.record_page_availability("wayback", urlid, &snapshots).await.unwrap();

    // Capture everything the selector could want, including the appended
    // hidate entry.
    let mut all = snapshots.clone();
    all.push(d(2012, 9, 1));
    all.sort();
    let lodate = d(2012, 6, 1) - one_year();
    for snap in select_snapshots(&all, lodate, d(2012, 9, 1)) {
        let ec = sample_ec(url, &format!("<html>at {}</html>", snap));
        db.record_historical_page("wayback", snap, &ec).await.unwrap();
    }

    let ctx = session_context(db);
    let mut doc = Document::resumed(urlid, url.to_string(), snapshots, None, None);
    doc.load_history(&ctx).await.unwrap();

    assert!(doc.is_complete());
    assert_eq!(ctx.db.load_page_processed_count("wayback").await.unwrap(), 1);
}

// Redirected pages intern both URL strings and keep the redirect target.
#[tokio::test]
async fn redirected_page_interns_both_urls() {
    let db = Database::open_in_memory().unwrap();
    let mut page = sample_page("http://foo.example/a", "<html>moved content</html>");
    page.redir_url = "http://bar.example/b".to_string();
    let ec = extract_page(page, &extract_ctx());

    db.record_historical_page("wayback", d(2013, 7, 1), &ec).await.unwrap();

    let (id_orig, _) = db.add_url_string("http://foo.example/a").await.unwrap();
    let (id_redir, _) = db.add_url_string("http://bar.example/b").await.unwrap();
    assert_ne!(id_orig, id_redir);

    let content = db
        .page_content_id("wayback", id_orig, d(2013, 7, 1))
        .await
        .unwrap();
    assert!(content.is_some(), "page is keyed by the original URL");
}
