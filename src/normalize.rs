//! Record normalization and text utilities.
//!
//! Everything here is pure. The `normalize_*` functions produce comparison keys
//! and are never used for display; the `clean_*`/`extract_*` helpers are used by
//! the source adapters while mapping raw hits into records.

use regex::Regex;
use std::sync::LazyLock;

/// DOI prefixes stripped by [`normalize_doi`], in preference order.
const DOI_PREFIXES: &[&str] = &["doi:", "https://doi.org/", "http://doi.org/", "doi.org/"];

/// Characters removed by [`normalize_title`].
const TITLE_PUNCTUATION: &[char] = &[
    '.', ',', ':', ';', '!', '?', '(', ')', '[', ']', '{', '}', '"', '\'',
];

/// Tokens dropped by [`normalize_title`].
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for",
];

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").expect("valid non-word regex"));
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid digit regex"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("valid year regex"));
static DOI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:https?://(?:dx\.)?doi\.org/|doi:\s*)?(10\.\d{4,9}/[-._;()/:a-z0-9]+)")
        .expect("valid doi regex")
});
static DOI_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^10\.\d{4,9}/\S+$").expect("valid doi key regex"));

/// Canonical DOI for identity comparison.
///
/// Lowercases, trims and removes the first matching prefix only.
pub fn normalize_doi(doi: &str) -> String {
    let lowered = doi.trim().to_lowercase();
    for prefix in DOI_PREFIXES {
        if let Some(rest) = lowered.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    lowered
}

/// Canonical title for identity comparison.
///
/// Idempotent: punctuation and stop-words are gone after one pass, so a second
/// pass finds nothing left to remove.
pub fn normalize_title(title: &str) -> String {
    let lowered = title.trim().to_lowercase();
    let stripped: String = lowered
        .chars()
        .filter(|c| !TITLE_PUNCTUATION.contains(c))
        .collect();

    stripped
        .split_whitespace()
        .filter(|token| !STOP_WORDS.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text preparation for domain term matching.
///
/// Non-word characters and digit runs become spaces, then whitespace collapses.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let no_punct = NON_WORD.replace_all(&lowered, " ");
    let no_digits = DIGITS.replace_all(&no_punct, " ");
    WHITESPACE.replace_all(&no_digits, " ").trim().to_string()
}

/// Display cleanup: drops control characters, straightens curly quotes and
/// collapses whitespace runs.
pub fn clean_text(text: &str) -> String {
    let mapped: String = text
        .chars()
        .filter_map(|c| match c {
            '\u{2018}' | '\u{2019}' => Some('\''),
            '\u{201C}' | '\u{201D}' => Some('"'),
            c if c.is_whitespace() => Some(' '),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove JATS/HTML tags, then [`clean_text`].
pub fn strip_markup(text: &str) -> String {
    clean_text(&MARKUP.replace_all(text, " "))
}

/// First plausible 19xx/20xx year in free text.
pub fn extract_year(text: &str) -> Option<i32> {
    YEAR.find(text).and_then(|m| m.as_str().parse().ok())
}

/// First DOI-looking token in free text, without resolver prefix.
pub fn extract_doi(text: &str) -> Option<String> {
    let caps = DOI.captures(text)?;
    let doi = caps
        .get(1)?
        .as_str()
        .trim_end_matches(['.', ',', ';', ')', ':', '/']);
    if doi.is_empty() {
        None
    } else {
        Some(doi.to_string())
    }
}

/// Abstract-store key: normalized DOI when present, otherwise normalized title.
pub fn abstract_key(doi: &str, title: &str) -> String {
    let doi = normalize_doi(doi);
    if doi.is_empty() {
        normalize_title(title)
    } else {
        doi
    }
}

/// Re-canonicalize a key read back from an abstracts file.
///
/// Files written by the adapters key abstracts by raw DOI or raw title.
pub fn canonical_key(raw: &str) -> String {
    let doi = normalize_doi(raw);
    if DOI_KEY.is_match(&doi) {
        doi
    } else {
        normalize_title(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_doi_prefixes() {
        let expected = "10.1/x";
        assert_eq!(normalize_doi("https://doi.org/10.1/X"), expected);
        assert_eq!(normalize_doi("doi:10.1/X"), expected);
        assert_eq!(normalize_doi("10.1/x"), expected);
        assert_eq!(normalize_doi("  http://doi.org/10.1/X "), expected);
        assert_eq!(normalize_doi("DOI.ORG/10.1/X"), expected);
        assert_eq!(normalize_doi(""), "");
    }

    #[test]
    fn test_normalize_doi_strips_only_first_prefix() {
        assert_eq!(normalize_doi("doi:doi.org/10.1/x"), "doi.org/10.1/x");
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(
            normalize_title("  The Effect of AI on Fisheries: A Review! "),
            "effect of ai fisheries review"
        );
        assert_eq!(
            normalize_title("Deep   learning (for) \"stock\" forecasting"),
            "deep learning stock forecasting"
        );
        assert_eq!(normalize_title(""), "");
    }

    #[test]
    fn test_normalize_title_idempotent() {
        let titles = [
            "The Effect of AI on Fisheries: A Review!",
            "An and the or",
            "A. B. C.",
            "Forecasting {catch} [per] unit-effort; 2010–2020?",
            "Pesquerías y pronóstico: ¿qué sabemos?",
            "'Quoted' \"title\"",
            "  ",
        ];
        for title in titles {
            let once = normalize_title(title);
            assert_eq!(normalize_title(&once), once, "title: {title}");
        }
    }

    #[test]
    fn test_normalize_title_matches_across_sources() {
        assert_eq!(
            normalize_title("Machine Learning for Fish Stock Forecasting."),
            normalize_title("machine learning   fish stock forecasting")
        );
        assert_eq!(
            normalize_title("A review: neural networks in the fishery"),
            normalize_title("Review, Neural Networks, Fishery")
        );
        assert_ne!(
            normalize_title("Fish stock forecasting"),
            normalize_title("Fish-stock forecasting")
        );
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(
            normalize_text("A Time-Series Approach (2019) to Forecast!"),
            "a time series approach to forecast"
        );
        assert_eq!(normalize_text("AR1 models"), "ar models");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  Hello\n\t world\u{0007} "), "Hello world");
        assert_eq!(clean_text("\u{201C}quoted\u{201D} it\u{2019}s"), "\"quoted\" it's");
    }

    #[test]
    fn test_strip_markup() {
        assert_eq!(
            strip_markup("<jats:p>Fish <jats:italic>stocks</jats:italic></jats:p>"),
            "Fish stocks"
        );
        assert_eq!(strip_markup("No tags"), "No tags");
    }

    #[test]
    fn test_extract_year() {
        assert_eq!(extract_year("Published in 2019, revised 2020"), Some(2019));
        assert_eq!(extract_year("Volume 12345"), None);
        assert_eq!(extract_year("no year"), None);
        assert_eq!(extract_year("1850 census"), None);
    }

    #[test]
    fn test_extract_doi() {
        assert_eq!(
            extract_doi("see https://doi.org/10.1016/j.fishres.2020.105.").as_deref(),
            Some("10.1016/j.fishres.2020.105")
        );
        assert_eq!(
            extract_doi("DOI: 10.3390/fishes7010001").as_deref(),
            Some("10.3390/fishes7010001")
        );
        assert_eq!(extract_doi("no identifier here"), None);
    }

    #[test]
    fn test_abstract_key() {
        assert_eq!(abstract_key("https://doi.org/10.1/AB", "Title"), "10.1/ab");
        assert_eq!(abstract_key("", "The Title"), "title");
    }

    #[test]
    fn test_canonical_key() {
        assert_eq!(canonical_key("DOI:10.5555/X"), "10.5555/x");
        assert_eq!(canonical_key("The Big Fish"), "big fish");
        // titles that happen to start like a DOI stay titles
        assert_eq!(canonical_key("10. Lessons from the Tuna Fishery"), "10 lessons from tuna fishery");
        assert_eq!(canonical_key("10.5 tonnes of cod"), "105 tonnes of cod");
    }
}
