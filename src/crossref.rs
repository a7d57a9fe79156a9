//! Crossref works search.
//!
//! Queries `/works` with the boolean domain query, keeps journal articles that
//! carry an abstract, and maps each item into an [`ArticleRecord`]. Items are
//! handled as raw JSON because the year fallback needs the serialized item.

use crate::error::{OptionExt, Result};
use crate::http::{build_client, check_status, read_json};
use crate::normalize::{abstract_key, clean_text, extract_year, strip_markup};
use crate::outcome::{IssueKind, SourceOutcome};
use crate::query::{sort_by_year_desc, DomainVerifier, SearchRequest};
use crate::record::{ArticleRecord, Source};
use crate::retry::{retry_transient, RetryPolicy};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Crossref API base URL
pub const CROSSREF_API_URL: &str = "https://api.crossref.org/works";

/// Crossref caps `rows` per request.
const MAX_ROWS: usize = 1000;

/// Titles longer than this that mention abstract/keywords markers hold several fields.
const COMPOUND_TITLE_LEN: usize = 200;

static COMPOUND_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(.*?)(?:abstract:|authors:|keywords:|doi:)").expect("valid title regex")
});
static COMPOUND_ABSTRACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)abstract:?\s*(.*?)(?:keywords:|doi:|$)").expect("valid abstract regex")
});
static COMPOUND_AUTHORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)authors:?\s*(.*?)(?:abstract:|keywords:|doi:|$)").expect("valid authors regex")
});
static COMPOUND_DOI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)doi:?\s*(\S+)").expect("valid doi regex"));

/// Crossref client. Each [`search`](Self::search) owns its own backoff state.
pub struct CrossrefClient {
    client: reqwest::Client,
    base_url: String,
    mailto: Option<String>,
    retry: RetryPolicy,
    verify: bool,
}

impl CrossrefClient {
    /// Create a client with a 45 s request timeout.
    ///
    /// `mailto` puts requests in Crossref's polite pool.
    pub fn new(mailto: Option<String>) -> Result<Self> {
        Self::with_timeout(mailto, Duration::from_secs(45))
    }

    pub fn with_timeout(mailto: Option<String>, timeout: Duration) -> Result<Self> {
        let user_agent = match &mailto {
            Some(mail) => format!("rustbiblio/0.1 (mailto:{})", mail),
            None => "rustbiblio/0.1".to_string(),
        };
        Ok(Self {
            client: build_client(&user_agent, timeout, None)?,
            base_url: CROSSREF_API_URL.to_string(),
            mailto,
            retry: RetryPolicy::default(),
            verify: true,
        })
    }

    /// Point at a different `/works` endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Toggle the post-fetch term verification.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Run the domain query. Never fails: problems end up in `outcome.issues`.
    pub async fn search(&self, request: &SearchRequest) -> SourceOutcome {
        let mut outcome = SourceOutcome::new(Source::Crossref);
        let query = request.boolean_query();
        info!(query = %query, max_results = request.max_results, "Starting Crossref search");

        let body = retry_transient(&self.retry, "crossref works", || {
            self.fetch(&query, request)
        })
        .await;

        let body = match body {
            Ok(body) => body,
            Err(e) => {
                let kind = if e.is_transient() {
                    IssueKind::TransientExhausted
                } else {
                    IssueKind::RequestFailed
                };
                warn!(error = %e, "Crossref search failed, continuing with no results");
                outcome.issue(kind, e.to_string());
                return outcome;
            }
        };

        let verifier = self.verify.then(|| request.verifier());
        parse_works(&body, request, verifier.as_ref(), &mut outcome);

        info!(
            count = outcome.records.len(),
            abstracts = outcome.abstracts.len(),
            skipped = outcome.issues.len(),
            "Crossref search complete"
        );
        outcome
    }

    async fn fetch(&self, query: &str, request: &SearchRequest) -> Result<Value> {
        let rows = (request.max_results * 3).min(MAX_ROWS).to_string();

        let mut filter = vec![
            "type:journal-article".to_string(),
            "has-abstract:true".to_string(),
        ];
        if let Some(start) = request.years.start {
            filter.push(format!("from-pub-date:{}", start));
        }
        if let Some(end) = request.years.end {
            filter.push(format!("until-pub-date:{}", end));
        }
        let filter = filter.join(",");

        let mut params = vec![
            ("query", query),
            ("rows", rows.as_str()),
            ("sort", "relevance"),
            ("order", "desc"),
            ("filter", filter.as_str()),
        ];
        if let Some(mail) = &self.mailto {
            params.push(("mailto", mail.as_str()));
        }

        debug!(url = %self.base_url, rows = %rows, filter = %filter, "Requesting Crossref works");

        let response = self.client.get(&self.base_url).query(&params).send().await?;
        let response = check_status(response, "Crossref").await?;
        read_json(response, "Crossref").await
    }
}

/// Map a `/works` response body into records and abstracts.
///
/// Stops once `max_results` records have been kept; sorts by year descending.
pub fn parse_works(
    body: &Value,
    request: &SearchRequest,
    verifier: Option<&DomainVerifier>,
    outcome: &mut SourceOutcome,
) {
    let Some(items) = body.pointer("/message/items").and_then(Value::as_array) else {
        outcome.issue(
            IssueKind::MalformedItem,
            "response has no message.items array",
        );
        return;
    };
    info!(count = items.len(), "Crossref returned items");

    for (idx, item) in items.iter().enumerate() {
        if outcome.records.len() >= request.max_results {
            break;
        }
        match parse_item(item, request, verifier) {
            Ok(Some((record, abstract_text))) => {
                if let Some(text) = abstract_text {
                    outcome
                        .abstracts
                        .insert_longest(abstract_key(&record.doi, &record.title), text);
                }
                outcome.records.push(record);
            }
            Ok(None) => {}
            Err(e) => {
                debug!(idx = idx, error = %e, "Skipping Crossref item");
                outcome.issue(IssueKind::MalformedItem, format!("item {}: {}", idx, e));
            }
        }
    }

    sort_by_year_desc(&mut outcome.records);
}

/// `Ok(None)` when the item is valid but filtered out by year or terms.
fn parse_item(
    item: &Value,
    request: &SearchRequest,
    verifier: Option<&DomainVerifier>,
) -> Result<Option<(ArticleRecord, Option<String>)>> {
    let mut item = item.as_object().ok_or_parse("item is not an object")?.clone();
    repair_compound_title(&mut item);

    let title = item
        .get("title")
        .and_then(first_text)
        .map(|t| clean_text(&t))
        .filter(|t| !t.is_empty())
        .ok_or_parse("item has no title")?;

    let year = resolve_year(&item, &title);
    if !request.years.admits(year) {
        return Ok(None);
    }

    let abstract_text = item
        .get("abstract")
        .and_then(Value::as_str)
        .map(strip_markup)
        .unwrap_or_default();

    if let Some(verifier) = verifier {
        if !verifier.matches(&title, &abstract_text) {
            return Ok(None);
        }
    }

    let authors = item
        .get("author")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(author_name).collect())
        .unwrap_or_default();

    let record = ArticleRecord {
        title,
        authors,
        year,
        journal: item
            .get("container-title")
            .and_then(first_text)
            .map(|j| clean_text(&j))
            .unwrap_or_default(),
        doi: item
            .get("DOI")
            .and_then(Value::as_str)
            .map(clean_text)
            .unwrap_or_default(),
        url: item
            .get("URL")
            .and_then(Value::as_str)
            .map(clean_text)
            .unwrap_or_default(),
        citations: item.get("is-referenced-by-count").and_then(Value::as_u64),
        source: None,
    };

    let abstract_text = (!abstract_text.is_empty()).then_some(abstract_text);
    Ok(Some((record, abstract_text)))
}

/// Year from `published`/`issued` date-parts, then the title, then the whole item.
fn resolve_year(item: &Map<String, Value>, title: &str) -> Option<i32> {
    ["published", "issued"]
        .iter()
        .find_map(|field| {
            item.get(*field)
                .and_then(|d| d.pointer("/date-parts/0/0"))
                .and_then(Value::as_i64)
                .and_then(|y| i32::try_from(y).ok())
        })
        .or_else(|| extract_year(title))
        .or_else(|| {
            serde_json::to_string(item)
                .ok()
                .and_then(|text| extract_year(&text))
        })
}

fn first_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
        _ => None,
    }
}

fn author_name(author: &Value) -> Option<String> {
    let name = match author {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                let given = map.get("given").and_then(Value::as_str).unwrap_or("");
                let family = map.get("family").and_then(Value::as_str).unwrap_or("");
                format!("{} {}", given, family)
            }
        },
        _ => return None,
    };
    let name = clean_text(&name);
    (!name.is_empty()).then_some(name)
}

/// Split a title that swallowed the abstract, authors and DOI into its parts.
///
/// Extracted fields only fill gaps; existing structured fields are kept.
fn repair_compound_title(item: &mut Map<String, Value>) {
    let Some(text) = item.get("title").and_then(first_text) else {
        return;
    };
    let lowered = text.to_lowercase();
    if text.chars().count() <= COMPOUND_TITLE_LEN
        || !(lowered.contains("abstract") || lowered.contains("keywords"))
    {
        return;
    }

    let preview: String = text.chars().take(100).collect();
    warn!(title = %preview, "Splitting compound Crossref title");

    let title = COMPOUND_TITLE
        .captures(&text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| text.chars().take(150).collect::<String>().trim().to_string());
    item.insert("title".to_string(), Value::from(vec![title]));

    if let Some(abstract_text) = COMPOUND_ABSTRACT
        .captures(&text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
    {
        item.insert("abstract".to_string(), Value::from(abstract_text));
    }

    let has_authors = item
        .get("author")
        .and_then(Value::as_array)
        .is_some_and(|a| !a.is_empty());
    if !has_authors {
        if let Some(names) = COMPOUND_AUTHORS.captures(&text).and_then(|c| c.get(1)) {
            let authors: Vec<Value> = names
                .as_str()
                .split([',', ';'])
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(|a| serde_json::json!({ "name": a }))
                .collect();
            if !authors.is_empty() {
                item.insert("author".to_string(), Value::Array(authors));
            }
        }
    }

    let has_doi = item
        .get("DOI")
        .and_then(Value::as_str)
        .is_some_and(|d| !d.is_empty());
    if !has_doi {
        if let Some(doi) = COMPOUND_DOI.captures(&text).and_then(|c| c.get(1)) {
            item.insert("DOI".to_string(), Value::from(doi.as_str()));
        }
    }

    let has_date = item
        .get("published")
        .and_then(|d| d.pointer("/date-parts/0/0"))
        .is_some();
    if !has_date {
        if let Some(year) = extract_year(&text) {
            item.insert(
                "published".to_string(),
                serde_json::json!({ "date-parts": [[year]] }),
            );
        }
    }
}
