//! Language detection over extracted text.
//!
//! The segmenter needs `(language, chunk)` pairs: one entry per run of text
//! in a given language, so that a page mixing scripts gets each run
//! tokenized by the right handler. Text is first split into script runs,
//! then each run is identified with `whatlang`.

use whatlang::{Lang, Script};

/// A run of text attributed to one language.
#[derive(Debug, Clone, PartialEq)]
pub struct LangRun {
    /// Two-letter code where one exists, otherwise the ISO 639-3 code.
    pub lang: String,
    pub text: String,
}

/// Coarse script class used to cut the text into runs before detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptClass {
    Han,
    Kana,
    Hangul,
    Arabic,
    Thai,
    Hebrew,
    Cyrillic,
    Greek,
    Devanagari,
    Other,
}

fn script_class(c: char) -> Option<ScriptClass> {
    let x = c as u32;
    Some(match x {
        // CJK radicals, symbols, unified ideographs, compat, SIP
        0x2E80..=0x2FDF | 0x3190..=0x319F | 0x3400..=0x4DBF | 0x4E00..=0x9FFF
        | 0xF900..=0xFAFF | 0x20000..=0x2FFFF => ScriptClass::Han,
        0x3040..=0x30FF | 0x31F0..=0x31FF | 0xFF66..=0xFF9F => ScriptClass::Kana,
        0x1100..=0x11FF | 0xAC00..=0xD7AF | 0x3130..=0x318F => ScriptClass::Hangul,
        0x0600..=0x06FF | 0x0750..=0x077F | 0x08A0..=0x08FF | 0xFB50..=0xFDFF
        | 0xFE70..=0xFEFF => ScriptClass::Arabic,
        0x0E00..=0x0E7F => ScriptClass::Thai,
        0x0590..=0x05FF => ScriptClass::Hebrew,
        0x0400..=0x04FF | 0x0500..=0x052F => ScriptClass::Cyrillic,
        0x0370..=0x03FF => ScriptClass::Greek,
        0x0900..=0x097F => ScriptClass::Devanagari,
        _ if c.is_alphabetic() => ScriptClass::Other,
        _ => return None, // spaces, digits, punctuation attach to any run
    })
}

/// Split `text` into maximal runs of a single script class. Characters with
/// no class of their own (whitespace, digits, punctuation) stay with the
/// current run.
fn script_runs(text: &str) -> Vec<(ScriptClass, String)> {
    let mut runs: Vec<(ScriptClass, String)> = Vec::new();
    let mut current: Option<ScriptClass> = None;
    for c in text.chars() {
        match script_class(c) {
            Some(class) if current != Some(class) => {
                current = Some(class);
                runs.push((class, String::new()));
                runs.last_mut().unwrap().1.push(c);
            }
            _ => match runs.last_mut() {
                Some(run) => run.1.push(c),
                None => {
                    current = Some(ScriptClass::Other);
                    runs.push((ScriptClass::Other, String::new()));
                    runs.last_mut().unwrap().1.push(c);
                }
            },
        }
    }
    runs
}

/// Fallback code when detection is inconclusive but the script is clear.
fn default_code(class: ScriptClass) -> &'static str {
    match class {
        ScriptClass::Han => "zh",
        ScriptClass::Kana => "ja",
        ScriptClass::Hangul => "ko",
        ScriptClass::Arabic => "ar",
        ScriptClass::Thai => "th",
        ScriptClass::Hebrew => "he",
        ScriptClass::Cyrillic => "ru",
        ScriptClass::Greek => "el",
        ScriptClass::Devanagari => "hi",
        ScriptClass::Other => "un",
    }
}

/// Two-letter code for a detected language, falling back to the ISO 639-3
/// code whatlang reports for languages without a two-letter assignment.
fn lang_code(lang: Lang) -> String {
    match lang {
        Lang::Eng => "en",
        Lang::Cmn => "zh",
        Lang::Jpn => "ja",
        Lang::Kor => "ko",
        Lang::Tha => "th",
        Lang::Vie => "vi",
        Lang::Ara => "ar",
        Lang::Pes => "fa",
        Lang::Urd => "ur",
        Lang::Heb => "he",
        Lang::Rus => "ru",
        Lang::Ukr => "uk",
        Lang::Ell => "el",
        Lang::Hin => "hi",
        Lang::Spa => "es",
        Lang::Por => "pt",
        Lang::Fra => "fr",
        Lang::Deu => "de",
        Lang::Ita => "it",
        Lang::Nld => "nl",
        Lang::Swe => "sv",
        Lang::Dan => "da",
        Lang::Fin => "fi",
        Lang::Pol => "pl",
        Lang::Ces => "cs",
        Lang::Tur => "tr",
        Lang::Ind => "id",
        other => return other.code().to_string(),
    }
    .to_string()
}

/// Detect the language of each run of `text`.
///
/// Adjacent runs that resolve to the same language are merged, so the output
/// has at most one entry per language run, in document order.
pub fn detect_language_runs(text: &str) -> Vec<LangRun> {
    let mut out: Vec<LangRun> = Vec::new();
    for (class, chunk) in script_runs(text) {
        if chunk.trim().is_empty() {
            continue;
        }
        let code = match whatlang::detect(&chunk) {
            Some(info) if info.is_reliable() => lang_code(info.lang()),
            // Short or ambiguous runs: trust the script when the script only
            // plausibly means one of the languages we special-case.
            _ => match class {
                ScriptClass::Other => match whatlang::detect(&chunk) {
                    Some(info) => lang_code(info.lang()),
                    None => default_code(class).to_string(),
                },
                _ => default_code(class).to_string(),
            },
        };
        match out.last_mut() {
            Some(last) if last.lang == code => last.text.push_str(&chunk),
            _ => out.push(LangRun {
                lang: code,
                text: chunk,
            }),
        }
    }
    out
}

/// Detected script of a text, exposed for callers that only need the script.
pub fn detect_script(text: &str) -> Option<Script> {
    whatlang::detect_script(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_has_no_runs() {
        assert!(detect_language_runs("").is_empty());
        assert!(detect_language_runs("   \n ").is_empty());
    }

    #[test]
    fn single_language_is_one_run() {
        let runs = detect_language_runs(
            "The quick brown fox jumps over the lazy dog and keeps running onward.",
        );
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].lang, "en");
    }

    #[test]
    fn mixed_scripts_split_into_runs() {
        let runs = detect_language_runs("Breaking news today. 東京は雨です。ひどい雨。");
        assert!(runs.len() >= 2, "{runs:?}");
        assert!(runs.iter().any(|r| r.lang == "ja" || r.lang == "zh"));
    }

    #[test]
    fn thai_script_resolves_to_thai() {
        let runs = detect_language_runs("สวัสดีครับ");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].lang, "th");
    }

    #[test]
    fn arabic_script_resolves_to_arabic_family() {
        let runs = detect_language_runs("مرحبا بالعالم");
        assert_eq!(runs.len(), 1);
        assert!(["ar", "fa", "ur"].contains(&runs[0].lang.as_str()), "{runs:?}");
    }

    #[test]
    fn runs_cover_all_non_space_text() {
        let text = "Hello world 你好世界 goodbye";
        let runs = detect_language_runs(text);
        let total: usize = runs.iter().map(|r| r.text.len()).sum();
        assert_eq!(total, text.len());
    }
}
