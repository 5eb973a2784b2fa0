//! Parked-domain classification.
//!
//! A page is "parked" when its live content is a registrar or reseller
//! placeholder. Classification is regex-driven: a set of strong rules each
//! matching one known parking template, and two sets of weak rules matching
//! general parking vocabulary, where only the conjunction of both weak sets
//! counts. Rules live in line-oriented files of `tag regex` pairs so the
//! rule corpus can evolve without code changes.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// Pages larger than this are never parking placeholders; skip the regex
/// pass entirely.
pub const DEFAULT_SIZE_LIMIT: usize = 200_000;

#[derive(Debug, Error)]
pub enum ParkingRuleError {
    #[error("cannot read rule file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("bad rule line {line:?}: {reason}")]
    BadRule { line: String, reason: String },
}

/// Which strong rules to apply.
///
/// `Balanced` keeps the rules that have earned their keep (more true than
/// false positives); `Min` is the minimal set covering the parked pages
/// `Full` finds, give or take a few percent. Weak rules are never filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RulePreset {
    #[default]
    Full,
    Balanced,
    Min,
}

impl RulePreset {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "balanced" => Some(Self::Balanced),
            "min" => Some(Self::Min),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Rule {
    tag: String,
    regex: Regex,
}

fn parse_rule_lines(
    text: &str,
    allowlist: Option<&HashSet<String>>,
) -> Result<Vec<Rule>, ParkingRuleError> {
    let mut rules = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (tag, pattern) = line.split_once(' ').ok_or_else(|| ParkingRuleError::BadRule {
            line: line.to_string(),
            reason: "expected `tag regex`".to_string(),
        })?;
        if let Some(allowed) = allowlist {
            if !allowed.contains(tag) {
                continue;
            }
        }
        let regex = RegexBuilder::new(pattern.trim())
            .case_insensitive(true)
            .size_limit(1 << 24)
            .build()
            .map_err(|e| ParkingRuleError::BadRule {
                line: line.to_string(),
                reason: e.to_string(),
            })?;
        rules.push(Rule {
            tag: tag.to_string(),
            regex,
        });
    }
    Ok(rules)
}

/// The classifier: three ordered rule sets plus the size short-circuit.
pub struct ParkingClassifier {
    size_limit: usize,
    strong: Vec<Rule>,
    weak1: Vec<Rule>,
    weak2: Vec<Rule>,
}

impl ParkingClassifier {
    /// Load rules from the three rule files. `allowlist` filters strong
    /// rules only (the preset files list the tags to keep).
    pub fn from_files(
        strong: &Path,
        weak1: &Path,
        weak2: &Path,
        allowlist: Option<&HashSet<String>>,
        size_limit: usize,
    ) -> Result<Self, ParkingRuleError> {
        let read = |path: &Path| {
            fs::read_to_string(path).map_err(|source| ParkingRuleError::Io {
                path: path.display().to_string(),
                source,
            })
        };
        Ok(Self {
            size_limit,
            strong: parse_rule_lines(&read(strong)?, allowlist)?,
            weak1: parse_rule_lines(&read(weak1)?, None)?,
            weak2: parse_rule_lines(&read(weak2)?, None)?,
        })
    }

    /// Build from in-memory rule text, same format as the files.
    pub fn from_rule_text(
        strong: &str,
        weak1: &str,
        weak2: &str,
        allowlist: Option<&HashSet<String>>,
        size_limit: usize,
    ) -> Result<Self, ParkingRuleError> {
        Ok(Self {
            size_limit,
            strong: parse_rule_lines(strong, allowlist)?,
            weak1: parse_rule_lines(weak1, None)?,
            weak2: parse_rule_lines(weak2, None)?,
        })
    }

    /// A small built-in rule set covering the common parking services, for
    /// running without external rule files.
    pub fn builtin() -> Self {
        const STRONG: &str = "\
sedoparking sedoparking\\.com
parkingcrew parkingcrew\\.net
godaddypark This\\s+Web\\s+page\\s+is\\s+parked\\s+FREE
domainsponsor domainsponsor\\.com
cashparking CashParking
skenzo skenzo\\.com
";
        const WEAK1: &str = "\
buydomain (buy|purchase)\\s+this\\s+domain
forsale domain\\s+(is|may\\s+be)\\s+for\\s+sale
parkedfree parked\\s+free
";
        const WEAK2: &str = "\
sponsored sponsored\\s+listings?
relatedlinks related\\s+(links|searches)
whythisad why\\s+am\\s+I\\s+seeing\\s+this
";
        Self::from_rule_text(STRONG, WEAK1, WEAK2, None, DEFAULT_SIZE_LIMIT)
            .expect("builtin parking rules are valid")
    }

    /// Classify a page. `domain` is the registered domain the page was
    /// served from (`example.co.uk`, not `www.example.co.uk`).
    ///
    /// Returns `(is_parked, matched_rule_tags)`.
    pub fn is_parked(&self, html: &str, domain: &str) -> (bool, Vec<String>) {
        if html.len() > self.size_limit {
            return (false, Vec::new());
        }

        let s_matches = apply_rules(html, &self.strong);
        let w1_matches = apply_rules(html, &self.weak1);
        let w2_matches = apply_rules(html, &self.weak2);

        if !s_matches.is_empty() || (!w1_matches.is_empty() && !w2_matches.is_empty()) {
            let mut tags = s_matches;
            tags.extend(w1_matches);
            tags.extend(w2_matches);
            return (true, tags);
        }

        // Last-resort heuristic: registrar placeholders that name the domain
        // itself in both a click-through line and a keywords meta tag.
        let lower = html.to_lowercase();
        let last_two = last_two_labels(domain);
        for keyword in ["tppunknown.com", last_two.as_str()] {
            if keyword.is_empty() {
                continue;
            }
            let click = format!("click here to go to {}", keyword);
            let meta = format!("<meta name=\"keywords\" content=\"{}\">", keyword);
            if lower.contains(&click) && lower.contains(&meta) {
                return (true, vec!["generalparking".to_string()]);
            }
        }

        (false, Vec::new())
    }
}

fn apply_rules(html: &str, rules: &[Rule]) -> Vec<String> {
    rules
        .iter()
        .filter(|r| r.regex.is_match(html))
        .map(|r| r.tag.clone())
        .collect()
}

fn last_two_labels(domain: &str) -> String {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        domain.to_lowercase()
    } else {
        labels[labels.len() - 2..].join(".").to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ParkingClassifier {
        ParkingClassifier::from_rule_text(
            "sedo sedoparking\\.com\ngodaddy parked\\s+FREE",
            "w1a buy\\s+this\\s+domain",
            "w2a sponsored\\s+listings",
            None,
            DEFAULT_SIZE_LIMIT,
        )
        .unwrap()
    }

    #[test]
    fn strong_rule_alone_is_parked() {
        let (parked, tags) = classifier().is_parked(
            "<html><script src='http://sedoparking.com/x.js'></script></html>",
            "example.com",
        );
        assert!(parked);
        assert_eq!(tags, vec!["sedo"]);
    }

    #[test]
    fn one_weak_set_is_not_enough() {
        let (parked, tags) =
            classifier().is_parked("<html>Buy this domain today!</html>", "example.com");
        assert!(!parked);
        assert!(tags.is_empty());
    }

    #[test]
    fn both_weak_sets_are_parked() {
        let (parked, tags) = classifier().is_parked(
            "<html>Buy this domain. Sponsored listings below.</html>",
            "example.com",
        );
        assert!(parked);
        assert_eq!(tags, vec!["w1a", "w2a"]);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let (parked, _) =
            classifier().is_parked("<html>SEDOPARKING.COM</html>", "example.com");
        assert!(parked);
    }

    #[test]
    fn oversized_page_short_circuits() {
        let mut big = String::from("sedoparking.com");
        big.push_str(&"x".repeat(DEFAULT_SIZE_LIMIT + 1));
        let (parked, tags) = classifier().is_parked(&big, "example.com");
        assert!(!parked);
        assert!(tags.is_empty());
    }

    #[test]
    fn general_parking_heuristic_needs_both_needles() {
        let c = classifier();
        let html_one = "<html>Click here to go to example.com</html>";
        assert!(!c.is_parked(html_one, "example.com").0);

        let html_both = "<html>Click here to go to example.com\
                         <meta name=\"keywords\" content=\"example.com\"></html>";
        let (parked, tags) = c.is_parked(html_both, "www.example.com");
        assert!(parked);
        assert_eq!(tags, vec!["generalparking"]);
    }

    #[test]
    fn general_parking_matches_tppunknown() {
        let html = "<html>Click here to go to tppunknown.com\
                    <meta name=\"keywords\" content=\"tppunknown.com\"></html>";
        let (parked, tags) = classifier().is_parked(html, "whatever.net");
        assert!(parked);
        assert_eq!(tags, vec!["generalparking"]);
    }

    #[test]
    fn allowlist_filters_strong_rules_only() {
        let allow: HashSet<String> = ["godaddy".to_string()].into_iter().collect();
        let c = ParkingClassifier::from_rule_text(
            "sedo sedoparking\\.com\ngodaddy parked\\s+FREE",
            "w1a buy\\s+this\\s+domain",
            "w2a sponsored\\s+listings",
            Some(&allow),
            DEFAULT_SIZE_LIMIT,
        )
        .unwrap();

        // sedo was filtered out of the strong set.
        assert!(!c.is_parked("sedoparking.com", "example.com").0);
        assert!(c.is_parked("This page is parked FREE", "example.com").0);
        // Weak rules are unaffected by the allowlist.
        assert!(
            c.is_parked("Buy this domain. Sponsored listings.", "example.com")
                .0
        );
    }

    #[test]
    fn bad_rule_line_is_an_error() {
        let err = ParkingClassifier::from_rule_text("notag", "", "", None, 1000);
        assert!(matches!(err, Err(ParkingRuleError::BadRule { .. })));
    }

    #[test]
    fn builtin_rules_load() {
        let c = ParkingClassifier::builtin();
        assert!(c.is_parked("... sedoparking.com ...", "example.com").0);
        assert!(!c.is_parked("an ordinary page", "example.com").0);
    }

    #[test]
    fn last_two_labels_of_registered_domain() {
        assert_eq!(last_two_labels("example.co.uk"), "co.uk");
        assert_eq!(last_two_labels("example.com"), "example.com");
    }
}
