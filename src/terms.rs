//! Compiled term lists.
//!
//! A term with more than one word matches by substring containment. A
//! single-word term must match on word boundaries, so "cast" does not match
//! "forecasting". Nothing is stemmed: "fishery" does not match "fisheries".

use regex::Regex;
use tracing::warn;

/// Text preparation applied to both the terms and the searched text.
pub type Normalizer = fn(&str) -> String;

#[derive(Debug, Clone)]
enum Pattern {
    Phrase(String),
    Word(Regex),
}

#[derive(Debug, Clone)]
struct CompiledTerm {
    original: String,
    pattern: Pattern,
}

impl CompiledTerm {
    fn is_match(&self, prepared: &str) -> bool {
        match &self.pattern {
            Pattern::Phrase(phrase) => prepared.contains(phrase.as_str()),
            Pattern::Word(re) => re.is_match(prepared),
        }
    }
}

/// A term list ready for repeated matching against prepared text.
#[derive(Debug, Clone)]
pub struct TermMatcher {
    terms: Vec<CompiledTerm>,
    normalizer: Normalizer,
}

impl TermMatcher {
    /// Compile `terms`, skipping any that are empty after normalization.
    pub fn new<S: AsRef<str>>(terms: &[S], normalizer: Normalizer) -> Self {
        let mut compiled = Vec::with_capacity(terms.len());

        for term in terms {
            let original = term.as_ref().trim();
            let normalized = normalizer(original);
            if normalized.is_empty() {
                continue;
            }

            let pattern = if normalized.split_whitespace().count() > 1 {
                Pattern::Phrase(normalized)
            } else {
                match Regex::new(&word_pattern(&normalized)) {
                    Ok(re) => Pattern::Word(re),
                    Err(e) => {
                        warn!(term = original, error = %e, "Skipping uncompilable term");
                        continue;
                    }
                }
            };

            compiled.push(CompiledTerm {
                original: original.to_string(),
                pattern,
            });
        }

        Self {
            terms: compiled,
            normalizer,
        }
    }

    /// Prepare raw text with this matcher's normalizer.
    pub fn prepare(&self, text: &str) -> String {
        (self.normalizer)(text)
    }

    /// Whether any term occurs in already-prepared text.
    pub fn matches(&self, prepared: &str) -> bool {
        !prepared.is_empty() && self.terms.iter().any(|t| t.is_match(prepared))
    }

    /// Original spelling of every term that occurs in already-prepared text.
    pub fn matching_terms<'s, 'p>(&'s self, prepared: &'p str) -> impl Iterator<Item = &'s str> + 'p
    where
        's: 'p,
    {
        self.terms
            .iter()
            .filter(move |t| !prepared.is_empty() && t.is_match(prepared))
            .map(|t| t.original.as_str())
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whole-word pattern for one term. `\b` only anchors next to a word
/// character, so an edge like the `+` of `c++` needs an explicit non-word
/// neighbour instead.
fn word_pattern(term: &str) -> String {
    let lead = if term.starts_with(is_word_char) { r"\b" } else { r"(?:^|\W)" };
    let trail = if term.ends_with(is_word_char) { r"\b" } else { r"(?:$|\W)" };
    format!("{}{}{}", lead, regex::escape(term), trail)
}

/// Lowercase plus whitespace cleanup, used for post-fetch verification.
pub fn lowercase(text: &str) -> String {
    crate::normalize::clean_text(text).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_text;

    #[test]
    fn test_single_word_needs_boundaries() {
        let matcher = TermMatcher::new(&["cast"], normalize_text);
        assert!(!matcher.matches(&matcher.prepare("Forecasting tools")));
        assert!(matcher.matches(&matcher.prepare("Cast nets in artisanal fisheries")));
    }

    #[test]
    fn test_phrase_matches_substring() {
        let matcher = TermMatcher::new(&["time series"], normalize_text);
        assert!(matcher.matches(&matcher.prepare("A Time-Series Approach")));
        assert!(matcher.matches(&matcher.prepare("Multivariate time seriesology")));
        assert!(!matcher.matches(&matcher.prepare("Series of times")));
    }

    #[test]
    fn test_no_stemming() {
        let matcher = TermMatcher::new(&["fishery"], normalize_text);
        assert!(!matcher.matches(&matcher.prepare("Global fisheries outlook")));
    }

    #[test]
    fn test_empty_terms_are_skipped() {
        let matcher = TermMatcher::new(&["", "  ", "2020", "!!"], normalize_text);
        assert!(matcher.is_empty());
        assert!(!matcher.matches(&matcher.prepare("anything at all")));
    }

    #[test]
    fn test_matching_terms() {
        let matcher = TermMatcher::new(&["forecast", "time series", "arima"], normalize_text);
        let prepared = matcher.prepare("A Time Series Approach to Forecast Fish Stocks");
        let hits: Vec<&str> = matcher.matching_terms(&prepared).collect();
        assert_eq!(hits, vec!["forecast", "time series"]);
    }

    #[test]
    fn test_lowercase_normalizer_keeps_punctuation() {
        let matcher = TermMatcher::new(&["Machine Learning", "c++"], lowercase);
        assert!(matcher.matches(&matcher.prepare("MACHINE   learning for stocks")));
        assert_eq!(matcher.len(), 2);

        let cpp = TermMatcher::new(&["c++"], lowercase);
        assert!(cpp.matches(&cpp.prepare("Stock models written in C++")));
        assert!(cpp.matches(&cpp.prepare("C++ tools, compared")));
        assert!(!cpp.matches(&cpp.prepare("An abc++ library")));

        let dotnet = TermMatcher::new(&[".net"], lowercase);
        assert!(dotnet.matches(&dotnet.prepare("Built on .NET")));
        assert!(!dotnet.matches(&dotnet.prepare("Built on ASP.NET")));
    }
}
