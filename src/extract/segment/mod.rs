//! Language-aware word segmentation.
//!
//! Presegmentation is language-independent: split on Unicode whitespace,
//! pass embedded URLs through verbatim, split the rest on word-breaking
//! punctuation, trim leading and trailing punctuation, and emit each
//! survivor NFKC-normalized and case-folded. Language-specific handlers
//! replace the final "emit as-is" step; scripts that do not delimit words
//! with spaces go through an external segmenter process (§ the sentinel
//! protocol in [`external`]).

pub mod external;

use std::collections::HashMap;
use std::sync::Mutex;

use linkify::{LinkFinder, LinkKind};
use regex::Regex;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

use self::external::ExternalSegmenter;

/// Languages with a dedicated segmentation strategy.
///
/// The Arabic segmenter is trained on the language, not the script, but
/// still does better than the generic path on the other common languages
/// written with that script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegLang {
    Thai,
    Japanese,
    Chinese,
    Vietnamese,
    Arabic,
    Default,
}

impl SegLang {
    pub fn from_code(code: &str) -> Self {
        match code {
            "th" => SegLang::Thai,
            "ja" => SegLang::Japanese,
            "zh" | "zh-Hant" | "zh-hant" => SegLang::Chinese,
            "vi" => SegLang::Vietnamese,
            "ar" | "fa" | "ku" | "ps" | "ur" => SegLang::Arabic,
            _ => SegLang::Default,
        }
    }
}

/// Word segmenter with per-language handlers.
///
/// External processes are started lazily and kept running across batches;
/// a handler whose process is not configured (or has died) degrades to
/// presegmentation alone.
pub struct Segmenter {
    // Word-breaking punctuation: P and S minus the few characters that may
    // appear inside a word.
    split: Regex,
    trim_left: Regex,
    trim_right: Regex,
    nonword: Regex,
    url_finder: LinkFinder,
    external: HashMap<SegLang, Mutex<ExternalSegmenter>>,
}

impl Segmenter {
    /// Build a segmenter with no external processes configured.
    pub fn new() -> Self {
        let mut url_finder = LinkFinder::new();
        url_finder.kinds(&[LinkKind::Url]);
        url_finder.url_must_have_scheme(false);

        Self {
            split: Regex::new(r"[[\p{P}\p{S}]--[\-‐'’.]]+").unwrap(),
            trim_left: Regex::new(r"^[\p{P}\p{S}\s]+").unwrap(),
            trim_right: Regex::new(r"[\p{P}\p{S}\s]+$").unwrap(),
            nonword: Regex::new(r"^[\p{P}\p{S}\p{N}\s]+$").unwrap(),
            url_finder,
            external: HashMap::new(),
        }
    }

    /// Attach external segmenter commands, keyed by language code
    /// (`zh`, `ar`, `ja`, `th`, `vi`).
    pub fn with_external_commands(mut self, commands: &HashMap<String, Vec<String>>) -> Self {
        for (code, argv) in commands {
            let lang = SegLang::from_code(code);
            if lang == SegLang::Default || argv.is_empty() {
                warn!(code, "ignoring external segmenter for unhandled language");
                continue;
            }
            self.external
                .insert(lang, Mutex::new(ExternalSegmenter::new(argv.clone())));
        }
        self
    }

    /// If `text` begins with a URL, return it.
    pub fn find_url(&self, text: &str) -> Option<String> {
        let link = self.url_finder.links(text).next()?;
        if link.start() == 0 {
            Some(link.as_str().to_string())
        } else {
            None
        }
    }

    /// True if `text` consists entirely of digits, punctuation, and spaces.
    pub fn is_nonword(&self, text: &str) -> bool {
        self.nonword.is_match(text)
    }

    /// Generic word segmentation, with no language-specific step.
    pub fn presegment(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.presegment_into(text, &mut out, |word, out| out.push(word.to_string()));
        out
    }

    /// Language-aware word segmentation.
    pub fn segment(&self, lang: &str, text: &str) -> Vec<String> {
        match SegLang::from_code(lang) {
            SegLang::Default => self.presegment(text),
            SegLang::Vietnamese => self.segment_vietnamese(text),
            SegLang::Arabic => {
                let mut out = Vec::new();
                self.presegment_into(text, &mut out, |word, out| {
                    for piece in arabic_presplit(word) {
                        self.emit_via_external(SegLang::Arabic, &piece, out);
                    }
                });
                out
            }
            handled => {
                let mut out = Vec::new();
                self.presegment_into(text, &mut out, |word, out| {
                    self.emit_via_external(handled, word, out);
                });
                out
            }
        }
    }

    /// The presegmentation loop: whitespace split, URL passthrough,
    /// punctuation split and trim, then NFKC + casefold before handing each
    /// surviving token to `emit`.
    fn presegment_into<F>(&self, text: &str, out: &mut Vec<String>, emit: F)
    where
        F: Fn(&str, &mut Vec<String>),
    {
        for word in text.split(is_breaking_space) {
            if word.is_empty() {
                continue;
            }
            if let Some(url) = self.find_url(word) {
                out.push(url);
                continue;
            }
            for piece in self.split.split(word) {
                let trimmed = self.trim(piece);
                if trimmed.is_empty() {
                    continue;
                }
                let normalized: String = trimmed.nfkc().collect::<String>().to_lowercase();
                emit(&normalized, out);
            }
        }
    }

    fn trim<'a>(&self, piece: &'a str) -> &'a str {
        let piece = match self.trim_left.find(piece) {
            Some(m) => &piece[m.end()..],
            None => piece,
        };
        match self.trim_right.find(piece) {
            Some(m) => &piece[..m.start()],
            None => piece,
        }
    }

    fn emit_via_external(&self, lang: SegLang, word: &str, out: &mut Vec<String>) {
        if let Some(seg) = self.external.get(&lang) {
            let mut seg = seg.lock().unwrap();
            match seg.segment(word) {
                Ok(tokens) => {
                    out.extend(tokens);
                    return;
                }
                Err(e) => warn!(?lang, error = %e, "external segmenter failed, degrading"),
            }
        }
        out.push(word.to_string());
    }

    /// Vietnamese: spaces appear *within* multisyllabic words and the
    /// segmenter cares about capitalization, so the presegmentation loop is
    /// reimplemented here. Trimmed syllables accumulate into a run (spaces
    /// preserved); the run is flushed through the segmenter at URLs and at
    /// end of input, and its output trimmed again and case-folded.
    fn segment_vietnamese(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut run: Vec<String> = Vec::new();

        let flush = |run: &mut Vec<String>, out: &mut Vec<String>| {
            if run.is_empty() {
                return;
            }
            let joined = run.join(" ");
            run.clear();
            let words = match self.external.get(&SegLang::Vietnamese) {
                Some(seg) => match seg.lock().unwrap().segment(&joined) {
                    Ok(tokens) => tokens,
                    Err(e) => {
                        warn!(error = %e, "vietnamese segmenter failed, degrading");
                        joined.split_whitespace().map(str::to_string).collect()
                    }
                },
                None => joined.split_whitespace().map(str::to_string).collect(),
            };
            for w in words {
                let trimmed = self.trim(&w);
                if !trimmed.is_empty() {
                    out.push(trimmed.to_lowercase());
                }
            }
        };

        for word in text.split(is_breaking_space) {
            if word.is_empty() {
                continue;
            }
            if let Some(url) = self.find_url(word) {
                flush(&mut run, &mut out);
                out.push(url);
                continue;
            }
            for piece in self.split.split(word) {
                let trimmed = self.trim(piece);
                if !trimmed.is_empty() {
                    run.push(trimmed.nfkc().collect());
                }
            }
        }
        flush(&mut run, &mut out);
        out
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Whitespace for splitting purposes: Unicode whitespace plus all C0/C1
/// controls and the common zero-width/direction format characters.
fn is_breaking_space(c: char) -> bool {
    c.is_whitespace()
        || c.is_control()
        || matches!(
            c,
            '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}' | '\u{FEFF}'
        )
}

/// Split a word immediately before every occurrence of the Arabic definite
/// article `ال` (NFKC guarantees no other form survives), and at boundaries
/// between Arabic and non-Arabic characters.
fn arabic_presplit(word: &str) -> Vec<String> {
    const AL: [char; 2] = ['\u{0627}', '\u{0644}'];

    let chars: Vec<char> = word.chars().collect();
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut i = 0;
    while i < chars.len() {
        let at_al = chars[i] == AL[0] && chars.get(i + 1) == Some(&AL[1]);
        let boundary = i > 0 && is_arabic_char(chars[i]) != is_arabic_char(chars[i - 1]);
        if (at_al || boundary) && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        current.push(chars[i]);
        i += 1;
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn is_arabic_char(c: char) -> bool {
    matches!(c as u32,
        0x0600..=0x06FF | 0x0750..=0x077F | 0x08A0..=0x08FF
        | 0xFB50..=0xFDFF | 0xFE70..=0xFEFF | 0x10E60..=0x10E7F | 0x1EE00..=0x1EEFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg() -> Segmenter {
        Segmenter::new()
    }

    #[test]
    fn splits_on_whitespace_and_lowercases() {
        assert_eq!(seg().presegment("Hello World"), vec!["hello", "world"]);
    }

    #[test]
    fn splits_on_punctuation() {
        assert_eq!(
            seg().presegment("one,two;three(four)"),
            vec!["one", "two", "three", "four"]
        );
    }

    #[test]
    fn keeps_word_internal_marks() {
        assert_eq!(seg().presegment("don't re-do"), vec!["don't", "re-do"]);
        assert_eq!(seg().presegment("e.g. test"), vec!["e.g", "test"]);
    }

    #[test]
    fn trims_surrounding_punctuation() {
        assert_eq!(seg().presegment("\"quoted!\""), vec!["quoted"]);
        assert_eq!(seg().presegment("...dots..."), vec!["dots"]);
    }

    #[test]
    fn urls_pass_through_verbatim() {
        let tokens = seg().presegment("see http://Example.com/Path?q=1 now");
        assert!(tokens.contains(&"http://Example.com/Path?q=1".to_string()), "{tokens:?}");
        assert!(tokens.contains(&"see".to_string()));
        assert!(tokens.contains(&"now".to_string()));
    }

    #[test]
    fn nfkc_normalization_applies() {
        // U+FF21 FULLWIDTH LATIN CAPITAL LETTER A -> "a"
        assert_eq!(seg().presegment("\u{FF21}\u{FF22}"), vec!["ab"]);
    }

    #[test]
    fn nonword_detection() {
        let s = seg();
        assert!(s.is_nonword("123"));
        assert!(s.is_nonword("!!..--"));
        assert!(s.is_nonword("12.34%"));
        assert!(!s.is_nonword("a1"));
    }

    #[test]
    fn default_language_is_presegmentation() {
        let s = seg();
        assert_eq!(s.segment("de", "Grüße, Welt"), s.presegment("Grüße, Welt"));
    }

    #[test]
    fn unconfigured_chinese_degrades_to_presegmentation() {
        let s = seg();
        assert_eq!(s.segment("zh", "你好 世界"), vec!["你好", "世界"]);
    }

    #[test]
    fn arabic_presplit_cuts_before_definite_article() {
        let word = "\u{0643}\u{062A}\u{0627}\u{0628}\u{0627}\u{0644}\u{0628}\u{064A}\u{062A}";
        let pieces = arabic_presplit(word);
        assert_eq!(pieces.len(), 2);
        assert!(pieces[1].starts_with("\u{0627}\u{0644}"));
    }

    #[test]
    fn arabic_presplit_separates_scripts() {
        let pieces = arabic_presplit("abc\u{0645}\u{0631}");
        assert_eq!(pieces, vec!["abc", "\u{0645}\u{0631}"]);
    }

    #[test]
    fn vietnamese_without_segmenter_splits_syllables() {
        let s = seg();
        let tokens = s.segment("vi", "Xin chào thế giới");
        assert_eq!(tokens, vec!["xin", "chào", "thế", "giới"]);
    }

    #[test]
    fn control_characters_break_words() {
        assert_eq!(seg().presegment("a\u{0001}b\u{200B}c"), vec!["a", "b", "c"]);
    }
}
