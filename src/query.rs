//! Search request, boolean query rendering and post-fetch verification.

use crate::error::{BiblioError, Result};
use crate::record::ArticleRecord;
use crate::terms::{lowercase, TermMatcher};
use chrono::Datelike;
use std::cmp::Reverse;

/// Inclusive publication-year window, open on either side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct YearRange {
    pub start: Option<i32>,
    pub end: Option<i32>,
}

impl YearRange {
    pub fn new(start: Option<i32>, end: Option<i32>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, year: i32) -> bool {
        self.start.map_or(true, |s| year >= s) && self.end.map_or(true, |e| year <= e)
    }

    /// Local year check applied after the API filter.
    ///
    /// Records whose year could not be resolved are kept.
    pub fn admits(&self, year: Option<i32>) -> bool {
        year.map_or(true, |y| self.contains(y))
    }

    pub fn is_open(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// `start-end` form with open sides left blank (`2008-`, `-2020`).
    pub fn to_api_range(&self) -> Option<String> {
        match (self.start, self.end) {
            (None, None) => None,
            (s, e) => Some(format!(
                "{}-{}",
                s.map(|v| v.to_string()).unwrap_or_default(),
                e.map(|v| v.to_string()).unwrap_or_default()
            )),
        }
    }

    /// `start-end` form with both sides filled, for APIs that reject open ranges.
    pub fn to_closed_range(&self) -> Option<String> {
        if self.is_open() {
            return None;
        }
        let current = chrono::Local::now().year();
        let start = self.start.unwrap_or(1900);
        let end = self.end.unwrap_or(current + 1);
        Some(format!("{}-{}", start, end))
    }
}

/// Per-run search parameters shared by every source adapter.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Term lists, one per domain, conjunctive across domains
    pub domains: Vec<Vec<String>>,
    pub max_results: usize,
    pub years: YearRange,
}

impl SearchRequest {
    /// Validate and build a request.
    ///
    /// Blank terms and domains left empty afterwards are dropped. Fails when no
    /// domain has any term, when `max_results` is zero, or when the year window
    /// is inverted.
    pub fn new(domains: Vec<Vec<String>>, max_results: usize, years: YearRange) -> Result<Self> {
        let domains: Vec<Vec<String>> = domains
            .into_iter()
            .map(|terms| {
                terms
                    .into_iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|terms| !terms.is_empty())
            .collect();

        if domains.is_empty() {
            return Err(BiblioError::Config(
                "at least one domain with search terms is required".to_string(),
            ));
        }
        if max_results == 0 {
            return Err(BiblioError::Config("max_results must be positive".to_string()));
        }
        if let (Some(s), Some(e)) = (years.start, years.end) {
            if s > e {
                return Err(BiblioError::Config(format!(
                    "year_start {} is after year_end {}",
                    s, e
                )));
            }
        }

        Ok(Self {
            domains,
            max_results,
            years,
        })
    }

    /// `("a" OR "b") AND ("c")` over every term.
    pub fn boolean_query(&self) -> String {
        render_boolean(&self.domains, usize::MAX)
    }

    /// Boolean query using only the first `per_domain` terms of each domain.
    pub fn boolean_query_limited(&self, per_domain: usize) -> String {
        render_boolean(&self.domains, per_domain)
    }

    /// Space-joined keywords, first `per_domain` terms of each domain.
    pub fn keyword_query(&self, per_domain: usize) -> String {
        self.domains
            .iter()
            .flat_map(|terms| terms.iter().take(per_domain))
            .map(|t| t.replace('"', ""))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn verifier(&self) -> DomainVerifier {
        DomainVerifier {
            matchers: self
                .domains
                .iter()
                .map(|terms| TermMatcher::new(terms.as_slice(), lowercase))
                .collect(),
        }
    }
}

fn render_boolean(domains: &[Vec<String>], per_domain: usize) -> String {
    domains
        .iter()
        .map(|terms| {
            let quoted = terms
                .iter()
                .take(per_domain)
                .map(|t| format!("\"{}\"", t.replace('"', "")))
                .collect::<Vec<_>>()
                .join(" OR ");
            format!("({})", quoted)
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Post-fetch filter: every domain must have a term in title plus abstract.
#[derive(Debug, Clone)]
pub struct DomainVerifier {
    matchers: Vec<TermMatcher>,
}

impl DomainVerifier {
    pub fn matches(&self, title: &str, abstract_text: &str) -> bool {
        let text = lowercase(&format!("{} {}", title, abstract_text));
        self.matchers.iter().all(|m| m.matches(&text))
    }
}

/// Year descending, unknown year last. Stable.
pub fn sort_by_year_desc(records: &mut [ArticleRecord]) {
    records.sort_by_key(|r| Reverse(r.year.unwrap_or(i32::MIN)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn request() -> SearchRequest {
        SearchRequest::new(
            vec![
                terms(&["machine learning", "neural network", "deep learning"]),
                terms(&["forecast", "prediction"]),
                terms(&["fishery", " ", "fish stock"]),
            ],
            50,
            YearRange::new(Some(2008), None),
        )
        .expect("valid request")
    }

    #[test]
    fn test_boolean_query() {
        assert_eq!(
            request().boolean_query(),
            "(\"machine learning\" OR \"neural network\" OR \"deep learning\") AND (\"forecast\" OR \"prediction\") AND (\"fishery\" OR \"fish stock\")"
        );
    }

    #[test]
    fn test_boolean_query_limited() {
        assert_eq!(
            request().boolean_query_limited(1),
            "(\"machine learning\") AND (\"forecast\") AND (\"fishery\")"
        );
    }

    #[test]
    fn test_keyword_query() {
        assert_eq!(
            request().keyword_query(2),
            "machine learning neural network forecast prediction fishery fish stock"
        );
    }

    #[test]
    fn test_new_rejects_empty_domains() {
        let err = SearchRequest::new(vec![terms(&["", " "]), vec![]], 10, YearRange::default());
        assert!(matches!(err, Err(BiblioError::Config(_))));
    }

    #[test]
    fn test_new_rejects_inverted_years() {
        let err = SearchRequest::new(
            vec![terms(&["a"])],
            10,
            YearRange::new(Some(2020), Some(2010)),
        );
        assert!(err.is_err());
        assert!(SearchRequest::new(vec![terms(&["a"])], 0, YearRange::default()).is_err());
    }

    #[test]
    fn test_year_range() {
        let range = YearRange::new(Some(2008), Some(2020));
        assert!(range.contains(2008));
        assert!(range.contains(2020));
        assert!(!range.contains(2021));
        assert!(range.admits(None));
        assert!(!range.admits(Some(1999)));
        assert_eq!(range.to_api_range().as_deref(), Some("2008-2020"));
        assert_eq!(YearRange::new(Some(2008), None).to_api_range().as_deref(), Some("2008-"));
        assert_eq!(YearRange::default().to_api_range(), None);
        assert!(YearRange::default().contains(1));
    }

    #[test]
    fn test_verifier_requires_every_domain() {
        let verifier = request().verifier();
        assert!(verifier.matches(
            "Deep learning for fish stock assessment",
            "We forecast biomass."
        ));
        assert!(!verifier.matches("Deep learning for fish stock assessment", ""));
        // "forecast" inside "forecasting" is not a whole-word hit
        assert!(!verifier.matches(
            "Deep learning forecasting of fishery landings",
            ""
        ));
    }

    #[test]
    fn test_sort_by_year_desc() {
        let mut records: Vec<ArticleRecord> = [Some(2010), None, Some(2020), Some(2015)]
            .into_iter()
            .map(|year| ArticleRecord {
                title: format!("{:?}", year),
                year,
                ..Default::default()
            })
            .collect();
        sort_by_year_desc(&mut records);
        let years: Vec<Option<i32>> = records.iter().map(|r| r.year).collect();
        assert_eq!(years, vec![Some(2020), Some(2015), Some(2010), None]);
    }
}
