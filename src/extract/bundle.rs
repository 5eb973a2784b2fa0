//! The complete per-page artifact bundle.
//!
//! [`extract_page`] is the worker-pool job: it runs the DOM extraction, the
//! language detection and segmentation, the parking classifier, and the
//! hashing and compression that turn one fetched page into the
//! content-addressed artifacts the interning store persists.

use std::io::Write;
use std::sync::Arc;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use url::Url;

use super::lang::detect_language_runs;
use super::parking::ParkingClassifier;
use super::segment::Segmenter;
use super::extract;
use crate::archive::FetchedPage;

/// Documents whose UTF-8 form exceeds this are stored unsegmented: the
/// segmented JSON would blow through the storage layer's per-cell limit.
pub const SEGMENTATION_SIZE_LIMIT: usize = 80 * 1024 * 1024;

/// Shared extraction context: everything the worker job needs beyond the
/// page itself. Built once, shared across all workers.
pub struct ExtractContext {
    pub parking: ParkingClassifier,
    pub segmenter: Segmenter,
}

impl ExtractContext {
    pub fn new(parking: ParkingClassifier, segmenter: Segmenter) -> Arc<Self> {
        Arc::new(Self { parking, segmenter })
    }
}

/// One interned artifact: its SHA-256 over the canonical byte form.
pub type ArtifactHash = [u8; 32];

/// Everything extracted from one page, hashed and ready to intern.
#[derive(Debug, Clone)]
pub struct ExtractedContent {
    pub url: String,
    pub redir_url: String,
    pub status: u16,
    pub reason: String,

    /// zlib-compressed raw page bytes; the hash is over the compressed form
    /// because that is what gets stored.
    pub ohash: ArtifactHash,
    pub olen: usize,
    pub original: Vec<u8>,

    pub chash: ArtifactHash,
    pub content: String,
    pub csegmtd: Option<String>,

    pub phash: ArtifactHash,
    pub pruned: String,
    pub psegmtd: Option<String>,

    pub hhash: ArtifactHash,
    pub heads: String,

    pub lhash: ArtifactHash,
    pub links: String,

    pub rhash: ArtifactHash,
    pub rsrcs: String,

    pub dhash: ArtifactHash,
    pub domst: String,

    pub parked: bool,
    pub prules: Vec<String>,
}

pub fn sha256(data: &[u8]) -> ArtifactHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("writing to a Vec");
    encoder.finish().expect("finishing zlib stream to a Vec")
}

/// Hash a text artifact and, when it fits under the size guard, segment it
/// per detected language run.
///
/// Returns `(hash, segmented_json)`; `None` segmented means "too large",
/// which downstream stores as NULL.
fn hash_and_maybe_segment(segmenter: &Segmenter, text: &str) -> (ArtifactHash, Option<String>) {
    let hash = sha256(text.as_bytes());
    if text.len() >= SEGMENTATION_SIZE_LIMIT {
        return (hash, None);
    }
    let runs = detect_language_runs(text);
    let segmented: Vec<serde_json::Value> = runs
        .iter()
        .map(|run| {
            serde_json::json!({
                "l": run.lang,
                "t": segmenter.segment(&run.lang, &run.text),
            })
        })
        .collect();
    (
        hash,
        Some(serde_json::to_string(&segmented).expect("serializing tokens")),
    )
}

/// Registered-domain approximation for the parking classifier: the host
/// with a leading `www.` dropped.
fn parking_domain(url: &str) -> String {
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    host.strip_prefix("www.").unwrap_or(&host).to_string()
}

/// Worker-pool job: turn one fetched page into its artifact bundle.
pub fn extract_page(page: FetchedPage, ctx: &ExtractContext) -> ExtractedContent {
    let extraction = extract(&page.redir_url, &page.body, page.content_type.as_deref());

    let (chash, csegmtd) = hash_and_maybe_segment(&ctx.segmenter, &extraction.text_content);
    let (phash, psegmtd) = hash_and_maybe_segment(&ctx.segmenter, &extraction.text_pruned);

    let original = zlib_compress(&page.body);
    let olen = page.body.len();
    let ohash = sha256(&original);

    let heads = serde_json::to_string(&extraction.headings).expect("serializing headings");
    let hhash = sha256(heads.as_bytes());
    let links = serde_json::to_string(&extraction.links).expect("serializing links");
    let lhash = sha256(links.as_bytes());
    let rsrcs = serde_json::to_string(&extraction.resources).expect("serializing resources");
    let rhash = sha256(rsrcs.as_bytes());
    let domst =
        serde_json::to_string(&extraction.dom_stats.to_json()).expect("serializing dom stats");
    let dhash = sha256(domst.as_bytes());

    // The classifier sees the page as served, not the extracted text.
    let raw_text = String::from_utf8_lossy(&page.body);
    let (parked, prules) = ctx
        .parking
        .is_parked(&raw_text, &parking_domain(&page.redir_url));

    ExtractedContent {
        url: page.url,
        redir_url: page.redir_url,
        status: page.status,
        reason: page.reason,
        ohash,
        olen,
        original,
        chash,
        content: extraction.text_content,
        csegmtd,
        phash,
        pruned: extraction.text_pruned,
        psegmtd,
        hhash,
        heads,
        lhash,
        links,
        rhash,
        rsrcs,
        dhash,
        domst,
        parked,
        prules,
    }
}
