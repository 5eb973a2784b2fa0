//! Content extraction from retrieved HTML.
//!
//! A pure, synchronous transformation from raw page bytes to structured
//! artifacts: visible text, pruned text, hyperlinks, sub-resource references,
//! headings, and DOM statistics. Expensive by design, so it runs on the
//! blocking worker pool, never on the I/O core.

pub mod bundle;
pub mod lang;
pub mod parking;
pub mod segment;

use std::collections::BTreeMap;

use encoding_rs::{Encoding, WINDOWS_1252};
use ego_tree::iter::Edge;
use scraper::node::Node;
use scraper::Html;
use url::Url;

use crate::canon;

/// Elements whose subtrees hold no visible text. `<canvas>` is absent so its
/// fallback content is kept.
const DISCARD_TEXT: &[&str] = &[
    "audio", "embed", "head", "iframe", "img", "noframes", "noscript", "object", "script",
    "style", "template", "video",
];

/// Elements treated as page chrome when computing the pruned text.
const BOILERPLATE_TAGS: &[&str] = &["nav", "header", "footer", "aside", "form"];

/// id/class substrings marking chrome containers.
const BOILERPLATE_MARKERS: &[&str] = &[
    "nav", "menu", "footer", "header", "sidebar", "banner", "breadcrumb", "comment", "widget",
    "cookie", "share", "advert",
];

/// How to pull URLs out of one element's attributes.
#[derive(Clone, Copy, PartialEq)]
enum UrlKind {
    Hyperlink,
    Resource,
}

/// DOM statistics: per-tag occurrence counts and per-depth tag counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomStats {
    pub tags: BTreeMap<String, u64>,
    pub tags_at_depth: BTreeMap<u32, u64>,
}

impl DomStats {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "tags": self.tags,
            "tags_at_depth": self.tags_at_depth.iter()
                .map(|(d, c)| (d.to_string(), *c))
                .collect::<BTreeMap<String, u64>>(),
        })
    }
}

/// Everything the DOM walk produces.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Effective base URL after `<base href>` resolution.
    pub base_url: String,
    pub text_content: String,
    pub text_pruned: String,
    pub links: Vec<String>,
    pub resources: Vec<String>,
    pub headings: Vec<String>,
    pub dom_stats: DomStats,
}

/// Parse a Content-Type header value into `(mime_type, charset)`.
pub fn parse_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';');
    let mime = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let charset = parts
        .map(str::trim)
        .filter_map(|p| {
            let head = p.get(..8)?;
            head.eq_ignore_ascii_case("charset=").then(|| &p[8..])
        })
        .map(|c| c.trim_matches('"').trim().to_string())
        .find(|c| !c.is_empty());
    (mime, charset)
}

/// Decode page bytes to UTF-8 text.
///
/// Precedence: byte-order mark, then the transport charset, then a
/// `<meta charset>` scan over the first KiB, then windows-1252 (the HTML5
/// fallback for unlabeled content).
pub fn decode_html(bytes: &[u8], transport_charset: Option<&str>) -> String {
    if let Some((enc, _)) = Encoding::for_bom(bytes) {
        return enc.decode(bytes).0.into_owned();
    }
    if let Some(label) = transport_charset {
        if let Some(enc) = Encoding::for_label(label.as_bytes()) {
            return enc.decode(bytes).0.into_owned();
        }
    }
    if let Some(enc) = sniff_meta_charset(&bytes[..bytes.len().min(1024)]) {
        return enc.decode(bytes).0.into_owned();
    }
    WINDOWS_1252.decode(bytes).0.into_owned()
}

fn sniff_meta_charset(prefix: &[u8]) -> Option<&'static Encoding> {
    let haystack = String::from_utf8_lossy(prefix).to_ascii_lowercase();
    let idx = haystack.find("charset")?;
    let rest = &haystack[idx + "charset".len()..];
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let rest = rest.trim_start_matches(['"', '\'']);
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':'))
        .unwrap_or(rest.len());
    Encoding::for_label(rest[..end].as_bytes())
}

/// Extract structured content from one page.
///
/// `redir_url` is the final canonical URL the page was actually served
/// from; relative references resolve against it (or against a `<base href>`
/// if the head declares one).
pub fn extract(redir_url: &str, body: &[u8], content_type: Option<&str>) -> Extraction {
    let (_mime, charset) = content_type
        .map(parse_content_type)
        .unwrap_or_else(|| (String::new(), None));
    let text = decode_html(body, charset.as_deref());
    let document = Html::parse_document(&text);

    let base_url = effective_base(redir_url, &document);
    let base = Url::parse(&base_url).or_else(|_| Url::parse(redir_url)).ok();

    let mut ext = Extraction {
        base_url,
        ..Default::default()
    };

    let mut content = String::new();
    let mut pruned = String::new();
    let mut heading: Option<String> = None;

    // Counters rather than booleans: discard regions nest.
    let mut discard = 0u32;
    let mut boiler = 0u32;
    let mut depth = 0u32;

    let mut links = Vec::new();
    let mut resources = Vec::new();

    for edge in document.tree.root().traverse() {
        match edge {
            Edge::Open(node) => match node.value() {
                Node::Element(el) => {
                    let name = el.name();
                    *ext.dom_stats.tags.entry(name.to_string()).or_insert(0) += 1;
                    *ext.dom_stats.tags_at_depth.entry(depth).or_insert(0) += 1;
                    depth += 1;

                    if DISCARD_TEXT.contains(&name) {
                        discard += 1;
                    }
                    if is_boilerplate(&el) {
                        boiler += 1;
                    }
                    if is_heading(name) && heading.is_none() {
                        heading = Some(String::new());
                    }

                    for (kind, raw) in element_urls(name, &el) {
                        let Some(base) = base.as_ref() else { continue };
                        let Ok(resolved) = base.join(&raw) else { continue };
                        if within_this_document(base, &resolved) {
                            continue;
                        }
                        match kind {
                            UrlKind::Hyperlink => links.push(resolved.to_string()),
                            UrlKind::Resource => resources.push(resolved.to_string()),
                        }
                    }
                }
                Node::Text(t) => {
                    if discard == 0 {
                        content.push_str(&t);
                        if boiler == 0 {
                            pruned.push_str(&t);
                        }
                    }
                    if let Some(h) = heading.as_mut() {
                        h.push_str(&t);
                    }
                }
                _ => {}
            },
            Edge::Close(node) => {
                if let Node::Element(el) = node.value() {
                    let name = el.name();
                    depth = depth.saturating_sub(1);
                    if DISCARD_TEXT.contains(&name) {
                        discard = discard.saturating_sub(1);
                    }
                    if is_boilerplate(&el) {
                        boiler = boiler.saturating_sub(1);
                    }
                    if is_heading(name) {
                        if let Some(h) = heading.take() {
                            let collapsed = collapse_whitespace(&h);
                            if !collapsed.is_empty() {
                                ext.headings.push(collapsed);
                            }
                        }
                    }
                }
            }
        }
    }

    ext.text_content = collapse_whitespace(&content);
    ext.text_pruned = collapse_whitespace(&pruned);

    links.sort();
    links.dedup();
    resources.sort();
    resources.dedup();
    ext.links = links;
    ext.resources = resources;
    ext
}

fn is_heading(name: &str) -> bool {
    matches!(name, "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
}

fn is_boilerplate(el: &scraper::node::Element) -> bool {
    if BOILERPLATE_TAGS.contains(&el.name()) {
        return true;
    }
    for attr in ["id", "class", "role"] {
        if let Some(v) = el.attr(attr) {
            let v = v.to_ascii_lowercase();
            if BOILERPLATE_MARKERS.iter().any(|m| v.contains(m)) {
                return true;
            }
        }
    }
    false
}

fn effective_base(redir_url: &str, document: &Html) -> String {
    let selector = scraper::Selector::parse("head base[href]").unwrap();
    if let Some(base_el) = document.select(&selector).next() {
        if let Some(href) = base_el.value().attr("href") {
            let href = strip_space_characters(href);
            if let Ok(joined) = canon::canonicalize_join(redir_url, &href) {
                return joined;
            }
        }
    }
    redir_url.to_string()
}

/// True if `url` points back into the same document as `doc` (compared with
/// fragments removed).
fn within_this_document(doc: &Url, url: &Url) -> bool {
    let mut a = doc.clone();
    a.set_fragment(None);
    let mut b = url.clone();
    b.set_fragment(None);
    a == b
}

/// Strip HTML "space characters" (a narrower set than White_Space) from the
/// ends of a URL attribute value.
fn strip_space_characters(s: &str) -> String {
    s.trim_matches([' ', '\t', '\r', '\n', '\x0c']).to_string()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// URLs carried by one element's attributes, with their classification.
fn element_urls(name: &str, el: &scraper::node::Element) -> Vec<(UrlKind, String)> {
    use UrlKind::*;

    let attr = |a: &str| el.attr(a).map(strip_space_characters);
    let one = |kind: UrlKind, v: Option<String>| -> Vec<(UrlKind, String)> {
        v.into_iter().map(|u| (kind, u)).collect()
    };

    match name {
        // resources
        "audio" | "embed" | "iframe" | "script" | "source" | "track" => one(Resource, attr("src")),
        "video" => {
            let mut v = one(Resource, attr("src"));
            v.extend(one(Resource, attr("poster")));
            v
        }
        "object" => one(Resource, attr("data")),
        "menuitem" => one(Resource, attr("icon")),
        "img" => {
            let mut v = one(Resource, attr("src"));
            if let Some(srcset) = el.attr("srcset") {
                v.extend(srcset_urls(srcset).into_iter().map(|u| (Resource, u)));
            }
            v
        }

        // hyperlinks
        "a" | "area" => one(Hyperlink, attr("href")),
        "form" => one(Hyperlink, attr("action")),
        "button" | "input" => one(Hyperlink, attr("formaction")),
        "blockquote" | "del" | "ins" | "q" => one(Hyperlink, attr("cite")),

        // classification depends on rel
        "link" => link_href(el),

        _ => Vec::new(),
    }
}

/// `srcset` is a comma-separated list of image candidate strings: a URL
/// optionally followed by width/density descriptors. Leading spaces in each
/// field belong to the URL position, so in `srcset=" 1x"`, "1x" is a URL.
fn srcset_urls(srcset: &str) -> Vec<String> {
    srcset
        .split(',')
        .filter_map(|candidate| {
            let stripped = strip_space_characters(candidate);
            stripped
                .split([' ', '\t', '\r', '\n', '\x0c'])
                .next()
                .filter(|u| !u.is_empty())
                .map(|u| u.to_string())
        })
        .collect()
}

fn link_href(el: &scraper::node::Element) -> Vec<(UrlKind, String)> {
    let (Some(href), Some(rel)) = (el.attr("href"), el.attr("rel")) else {
        return Vec::new();
    };
    let rels: Vec<&str> = rel.split([' ', '\t', '\r', '\n', '\x0c']).collect();
    for ty in ["icon", "pingback", "prefetch", "stylesheet"] {
        if rels.contains(&ty) {
            return vec![(UrlKind::Resource, strip_space_characters(href))];
        }
    }
    for ty in [
        "alternate", "author", "help", "license", "next", "prev", "search", "sidebar",
    ] {
        if rels.contains(&ty) {
            return vec![(UrlKind::Hyperlink, strip_space_characters(href))];
        }
    }
    vec![(UrlKind::Resource, strip_space_characters(href))]
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "http://example.com/page";

    fn extract_str(html: &str) -> Extraction {
        extract(DOC, html.as_bytes(), Some("text/html; charset=utf-8"))
    }

    #[test]
    fn visible_text_skips_script_and_style() {
        let ext = extract_str(
            "<html><head><title>T</title><style>body{}</style></head>\
             <body>Hello <script>var x=1;</script>world</body></html>",
        );
        assert_eq!(ext.text_content, "Hello world");
    }

    #[test]
    fn title_text_is_not_visible() {
        // <head> is a discard root; the title must not leak into the text.
        let ext = extract_str("<html><head><title>Secret</title></head><body>Shown</body></html>");
        assert_eq!(ext.text_content, "Shown");
    }

    #[test]
    fn whitespace_is_collapsed() {
        let ext = extract_str("<body>a\n\n  b\t\tc</body>");
        assert_eq!(ext.text_content, "a b c");
    }

    #[test]
    fn links_and_resources_are_classified() {
        let ext = extract_str(
            r#"<body>
                <a href="/l1">one</a>
                <img src="/r1.png">
                <form action="/submit"></form>
                <blockquote cite="http://other.net/q"></blockquote>
            </body>"#,
        );
        assert_eq!(
            ext.links,
            vec![
                "http://example.com/l1".to_string(),
                "http://example.com/submit".to_string(),
                "http://other.net/q".to_string(),
            ]
        );
        assert_eq!(ext.resources, vec!["http://example.com/r1.png".to_string()]);
    }

    #[test]
    fn link_rel_classification() {
        let ext = extract_str(
            r#"<head>
                <link rel="stylesheet" href="/s.css">
                <link rel="next" href="/page2">
                <link rel="unknown-thing" href="/misc">
            </head>"#,
        );
        assert_eq!(ext.links, vec!["http://example.com/page2".to_string()]);
        assert_eq!(
            ext.resources,
            vec![
                "http://example.com/misc".to_string(),
                "http://example.com/s.css".to_string(),
            ]
        );
    }

    #[test]
    fn srcset_candidates_split() {
        let ext = extract_str(r#"<body><img srcset="/a.png 1x, /b.png 2x"></body>"#);
        assert_eq!(
            ext.resources,
            vec![
                "http://example.com/a.png".to_string(),
                "http://example.com/b.png".to_string(),
            ]
        );
    }

    #[test]
    fn same_document_urls_dropped() {
        let ext = extract_str(r##"<body><a href="#top">top</a><a href="/page#sec">sec</a></body>"##);
        assert!(ext.links.is_empty(), "{:?}", ext.links);
    }

    #[test]
    fn base_href_changes_resolution() {
        let ext = extract_str(
            r#"<head><base href="http://cdn.example.net/x/"></head>
               <body><a href="rel">r</a></body>"#,
        );
        assert_eq!(ext.base_url, "http://cdn.example.net/x/");
        assert_eq!(ext.links, vec!["http://cdn.example.net/x/rel".to_string()]);
    }

    #[test]
    fn headings_collected_in_order() {
        let ext = extract_str("<body><h1>First</h1><p>x</p><h2>  Second\nheading </h2></body>");
        assert_eq!(ext.headings, vec!["First", "Second heading"]);
    }

    #[test]
    fn pruned_text_drops_chrome() {
        let ext = extract_str(
            r#"<body>
                <nav>Home | About</nav>
                <div class="cookie-banner">We use cookies</div>
                <p>Real content.</p>
                <footer>(c) 2015</footer>
            </body>"#,
        );
        assert!(ext.text_content.contains("Home | About"));
        assert!(ext.text_content.contains("We use cookies"));
        assert_eq!(ext.text_pruned, "Real content.");
    }

    #[test]
    fn dom_stats_count_tags_and_depths() {
        let ext = extract_str("<html><body><div><p>a</p><p>b</p></div></body></html>");
        assert_eq!(ext.dom_stats.tags.get("p"), Some(&2));
        assert_eq!(ext.dom_stats.tags.get("div"), Some(&1));
        // html at depth 0, head+body at 1, div at 2, p at 3.
        assert_eq!(ext.dom_stats.tags_at_depth.get(&0), Some(&1));
        assert_eq!(ext.dom_stats.tags_at_depth.get(&3), Some(&2));
    }

    #[test]
    fn content_type_parsing() {
        assert_eq!(
            parse_content_type("text/html; charset=ISO-8859-2"),
            ("text/html".to_string(), Some("ISO-8859-2".to_string()))
        );
        assert_eq!(parse_content_type("text/html"), ("text/html".to_string(), None));
        assert_eq!(
            parse_content_type("TEXT/HTML; charset=\"utf-8\""),
            ("text/html".to_string(), Some("utf-8".to_string()))
        );
    }

    #[test]
    fn decodes_declared_charset() {
        // "café" in latin-1.
        let bytes = b"<body>caf\xe9</body>";
        let ext = extract(DOC, bytes, Some("text/html; charset=iso-8859-1"));
        assert_eq!(ext.text_content, "café");
    }

    #[test]
    fn decodes_meta_charset_without_transport_hint() {
        let bytes = b"<head><meta charset=\"iso-8859-1\"></head><body>caf\xe9</body>";
        let ext = extract(DOC, bytes, None);
        assert_eq!(ext.text_content, "café");
    }

    #[test]
    fn bom_wins_over_wrong_transport_charset() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice("<body>café</body>".as_bytes());
        let ext = extract(DOC, &bytes, Some("text/html; charset=iso-8859-1"));
        assert_eq!(ext.text_content, "café");
    }

    #[test]
    fn empty_body_extracts_cleanly() {
        let ext = extract(DOC, b"", None);
        assert_eq!(ext.text_content, "");
        assert!(ext.links.is_empty());
    }
}
