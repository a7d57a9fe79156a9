//! Canonical article record, source identity and abstract store.

use crate::error::{BiblioError, Result};
use crate::normalize::{clean_text, extract_year};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// External search backend a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "Science Direct")]
    ScienceDirect,
    #[serde(rename = "Crossref")]
    Crossref,
    #[serde(rename = "Semantic Scholar")]
    SemanticScholar,
    #[serde(rename = "Google Scholar")]
    GoogleScholar,
}

impl Source {
    /// Order in which sources are searched and integrated.
    ///
    /// Deduplication keeps the first record seen, so this order decides which
    /// source's copy of a shared article survives.
    pub const INTEGRATION_ORDER: [Source; 4] = [
        Source::ScienceDirect,
        Source::Crossref,
        Source::SemanticScholar,
        Source::GoogleScholar,
    ];

    /// Display name, also the value stored in the `source` field.
    pub fn name(self) -> &'static str {
        match self {
            Source::ScienceDirect => "Science Direct",
            Source::Crossref => "Crossref",
            Source::SemanticScholar => "Semantic Scholar",
            Source::GoogleScholar => "Google Scholar",
        }
    }

    /// File name stem used for `<stem>_results.json` and `<stem>_abstracts.json`.
    pub fn file_stem(self) -> &'static str {
        match self {
            Source::ScienceDirect => "sciencedirect",
            Source::Crossref => "crossref",
            Source::SemanticScholar => "semanticscholar",
            Source::GoogleScholar => "google_scholar",
        }
    }

    pub fn results_file(self) -> String {
        format!("{}_results.json", self.file_stem())
    }

    pub fn abstracts_file(self) -> String {
        format!("{}_abstracts.json", self.file_stem())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Source {
    type Err = BiblioError;

    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "sciencedirect" | "scopus" | "elsevier" => Ok(Source::ScienceDirect),
            "crossref" => Ok(Source::Crossref),
            "semanticscholar" | "s2" => Ok(Source::SemanticScholar),
            "googlescholar" | "gscholar" | "scholar" => Ok(Source::GoogleScholar),
            _ => Err(BiblioError::Config(format!("Unknown source '{}'", s))),
        }
    }
}

/// One publication as reported by one source.
///
/// `year` and `citations` stay `None` when the source gave nothing usable, so an
/// unknown year is never confused with year 0. An empty `doi` means no DOI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub journal: String,
    #[serde(default)]
    pub doi: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub citations: Option<u64>,
    /// Stamped by the integrator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
}

impl ArticleRecord {
    /// Build a record from a loosely-typed JSON object.
    ///
    /// Accepts numbers or numeric strings for `year`/`citations` and either a
    /// list or a comma-separated string for `authors`. Fails only when the
    /// title is missing or blank.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| BiblioError::Validation("record is not a JSON object".to_string()))?;

        let title = obj
            .get("title")
            .and_then(text_of)
            .map(|t| clean_text(&t))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BiblioError::Validation("record has no title".to_string()))?;

        let authors = match obj.get("authors").or_else(|| obj.get("author")) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(text_of)
                .map(|a| clean_text(&a))
                .filter(|a| !a.is_empty())
                .collect(),
            Some(Value::String(s)) => s
                .split([',', ';'])
                .map(clean_text)
                .filter(|a| !a.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        let source = obj
            .get("source")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());

        Ok(Self {
            title,
            authors,
            year: obj.get("year").and_then(year_of),
            journal: string_field(obj.get("journal")),
            doi: string_field(obj.get("doi")),
            url: string_field(obj.get("url")),
            citations: obj.get("citations").and_then(count_of),
            source,
        })
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(text_of),
        Value::Object(map) => map.get("name").and_then(text_of),
        _ => None,
    }
}

fn string_field(value: Option<&Value>) -> String {
    value
        .and_then(text_of)
        .map(|s| clean_text(&s))
        .unwrap_or_default()
}

fn year_of(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()).filter(|y| *y > 0),
        Value::String(s) => s.trim().parse().ok().or_else(|| extract_year(s)),
        _ => None,
    }
}

fn count_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Abstract text keyed by normalized DOI, or normalized title when no DOI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbstractStore(BTreeMap<String, String>);

impl AbstractStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless an existing entry under `key` is at least as long.
    ///
    /// Length is counted in characters. Returns whether the store changed.
    pub fn insert_longest(&mut self, key: String, text: String) -> bool {
        if key.is_empty() || text.trim().is_empty() {
            return false;
        }
        match self.0.get(&key) {
            Some(existing) if existing.chars().count() >= text.chars().count() => false,
            _ => {
                self.0.insert(key, text);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl IntoIterator for AbstractStore {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_names_and_files() {
        assert_eq!(Source::ScienceDirect.results_file(), "sciencedirect_results.json");
        assert_eq!(Source::GoogleScholar.abstracts_file(), "google_scholar_abstracts.json");
        assert_eq!(Source::SemanticScholar.to_string(), "Semantic Scholar");
        assert_eq!(
            serde_json::to_value(Source::ScienceDirect).ok(),
            Some(json!("Science Direct"))
        );
    }

    #[test]
    fn test_source_from_str() {
        assert_eq!("Science Direct".parse::<Source>().ok(), Some(Source::ScienceDirect));
        assert_eq!("google_scholar".parse::<Source>().ok(), Some(Source::GoogleScholar));
        assert_eq!("crossref".parse::<Source>().ok(), Some(Source::Crossref));
        assert!("arxiv".parse::<Source>().is_err());
    }

    #[test]
    fn test_from_value_lenient_types() {
        let raw = json!({
            "title": "  Fish   stocks ",
            "authors": "Ana Ruiz, Bo Li",
            "year": "2019",
            "journal": null,
            "doi": "10.1/x",
            "citations": "42"
        });
        let record = ArticleRecord::from_value(&raw).expect("valid record");
        assert_eq!(record.title, "Fish stocks");
        assert_eq!(record.authors, vec!["Ana Ruiz", "Bo Li"]);
        assert_eq!(record.year, Some(2019));
        assert_eq!(record.journal, "");
        assert_eq!(record.citations, Some(42));
        assert_eq!(record.source, None);
    }

    #[test]
    fn test_from_value_missing_fields() {
        let raw = json!({"title": "Only a title", "year": "n.d."});
        let record = ArticleRecord::from_value(&raw).expect("valid record");
        assert_eq!(record.year, None);
        assert_eq!(record.citations, None);
        assert!(record.authors.is_empty());
    }

    #[test]
    fn test_from_value_rejects_untitled() {
        assert!(ArticleRecord::from_value(&json!({"title": "   "})).is_err());
        assert!(ArticleRecord::from_value(&json!({"doi": "10.1/x"})).is_err());
        assert!(ArticleRecord::from_value(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn test_record_json_shape() {
        let record = ArticleRecord {
            title: "T".to_string(),
            year: None,
            citations: Some(3),
            source: Some(Source::Crossref),
            ..Default::default()
        };
        let value = serde_json::to_value(&record).expect("serializable");
        assert_eq!(value["year"], Value::Null);
        assert_eq!(value["citations"], json!(3));
        assert_eq!(value["source"], json!("Crossref"));
        assert_eq!(value["doi"], json!(""));
    }

    #[test]
    fn test_insert_longest() {
        let mut store = AbstractStore::new();
        assert!(store.insert_longest("k".to_string(), "short".to_string()));
        assert!(store.insert_longest("k".to_string(), "a longer abstract text".to_string()));
        assert!(!store.insert_longest("k".to_string(), "short".to_string()));
        assert!(!store.insert_longest("k".to_string(), "a longer abstract text".to_string()));
        assert!(!store.insert_longest(String::new(), "text".to_string()));
        assert!(!store.insert_longest("e".to_string(), "   ".to_string()));
        assert_eq!(store.get("k"), Some("a longer abstract text"));
        assert_eq!(store.len(), 1);
    }
}
