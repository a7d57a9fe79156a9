//! Science Direct search through the Elsevier Scopus API.
//!
//! Requires an API key. Verification runs after detail enrichment over title,
//! abstract and author keywords, since search entries rarely carry an abstract.

use crate::error::{OptionExt, Result};
use crate::http::{build_client, check_status, read_json};
use crate::normalize::{abstract_key, clean_text, extract_year, strip_markup};
use crate::outcome::{IssueKind, SourceOutcome};
use crate::query::{sort_by_year_desc, DomainVerifier, SearchRequest};
use crate::record::{ArticleRecord, Source};
use crate::retry::{retry_transient, RetryPolicy};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Elsevier API base URL
pub const ELSEVIER_API_BASE: &str = "https://api.elsevier.com/content";

/// Entries per Scopus page
const PAGE_SIZE: usize = 25;

/// Scopus refuses `start` beyond this for standard keys
const MAX_START: usize = 5000;

/// Entries gathered per wanted result when verification waits for details
const DETAIL_OVERFETCH: usize = 3;

/// One mapped Scopus entry. Keywords only feed verification.
#[derive(Debug, Clone)]
struct Entry {
    record: ArticleRecord,
    abstract_text: String,
    keywords: Vec<String>,
}

/// Scopus search client.
pub struct ScienceDirectClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
    fetch_details: bool,
    detail_delay: Duration,
    verify: bool,
}

impl ScienceDirectClient {
    /// Create a client with a 60 s request timeout.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_timeout(api_key, Duration::from_secs(60))
    }

    pub fn with_timeout(api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client("rustbiblio/0.1", timeout, None)?,
            base_url: ELSEVIER_API_BASE.to_string(),
            api_key: api_key.into(),
            retry: RetryPolicy::default(),
            fetch_details: false,
            detail_delay: Duration::from_secs(1),
            verify: true,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Look up each DOI's article record for an abstract when the search
    /// entry had none. Costs one request per article, `delay` apart.
    pub fn with_details(mut self, fetch_details: bool, delay: Duration) -> Self {
        self.fetch_details = fetch_details;
        self.detail_delay = delay;
        self
    }

    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub async fn search(&self, request: &SearchRequest) -> SourceOutcome {
        let mut outcome = SourceOutcome::new(Source::ScienceDirect);
        if self.api_key.trim().is_empty() {
            warn!("No Science Direct API key configured, skipping source");
            outcome.issue(IssueKind::Skipped, "no API key configured");
            return outcome;
        }

        let query = format!("TITLE-ABS-KEY({})", request.boolean_query());
        info!(query = %query, max_results = request.max_results, "Starting Science Direct search");

        let verifier = self.verify.then(|| request.verifier());
        // Detail abstracts only arrive after paging, so with details on the
        // pages are over-fetched and verified once enrichment is done.
        let (page_verifier, wanted) = if self.fetch_details {
            (None, request.max_results.saturating_mul(DETAIL_OVERFETCH))
        } else {
            (verifier.as_ref(), request.max_results)
        };

        let mut entries: Vec<Entry> = Vec::new();
        let mut start = 0;
        loop {
            let label = format!("scopus search start {}", start);
            let page = retry_transient(&self.retry, &label, || {
                self.fetch_page(&query, request, start)
            })
            .await;

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    let kind = if e.is_transient() {
                        IssueKind::TransientExhausted
                    } else {
                        IssueKind::RequestFailed
                    };
                    warn!(start = start, error = %e, "Science Direct page failed, keeping what was collected");
                    outcome.issue(kind, format!("start {}: {}", start, e));
                    break;
                }
            };

            let (mapped, total) = parse_search_page(&page, request, &mut outcome);
            let page_len = mapped.len();
            entries.extend(
                mapped
                    .into_iter()
                    .filter(|entry| page_verifier.map_or(true, |v| entry_matches(v, entry))),
            );

            start += PAGE_SIZE;
            if entries.len() >= wanted || page_len == 0 || start >= total || start >= MAX_START {
                break;
            }
        }
        entries.truncate(wanted);

        if self.fetch_details {
            self.enrich(&mut entries).await;
        }

        collect(entries, verifier.as_ref(), request.max_results, &mut outcome);

        info!(
            count = outcome.records.len(),
            abstracts = outcome.abstracts.len(),
            "Science Direct search complete"
        );
        outcome
    }

    async fn fetch_page(&self, query: &str, request: &SearchRequest, start: usize) -> Result<Value> {
        let url = format!("{}/search/scopus", self.base_url.trim_end_matches('/'));
        let start = start.to_string();
        let count = PAGE_SIZE.to_string();
        let date = request.years.to_closed_range();

        let mut params = vec![
            ("query", query),
            ("start", start.as_str()),
            ("count", count.as_str()),
        ];
        if let Some(range) = date.as_deref() {
            params.push(("date", range));
        }

        debug!(url = %url, start = %start, "Requesting Scopus page");

        let response = self
            .client
            .get(&url)
            .query(&params)
            .header("X-ELS-APIKey", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = check_status(response, "Scopus").await?;
        read_json(response, "Scopus").await
    }

    /// Fill missing abstracts from the article endpoint. Failures are skipped.
    async fn enrich(&self, entries: &mut [Entry]) {
        let total = entries.len();
        for (idx, entry) in entries.iter_mut().enumerate() {
            if entry.record.doi.is_empty() || !entry.abstract_text.is_empty() {
                continue;
            }
            debug!(idx = idx + 1, total = total, doi = %entry.record.doi, "Fetching article details");

            match self.fetch_details(&entry.record.doi).await {
                Ok(body) => {
                    if let Some(text) = detail_abstract(&body) {
                        entry.abstract_text = text;
                    }
                }
                Err(e) => {
                    debug!(doi = %entry.record.doi, error = %e, "Article details unavailable");
                }
            }

            if !self.detail_delay.is_zero() {
                tokio::time::sleep(self.detail_delay).await;
            }
        }
    }

    async fn fetch_details(&self, doi: &str) -> Result<Value> {
        let encoded = doi
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let url = format!(
            "{}/article/doi/{}",
            self.base_url.trim_end_matches('/'),
            encoded
        );
        let response = self
            .client
            .get(&url)
            .header("X-ELS-APIKey", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = check_status(response, "Elsevier article").await?;
        read_json(response, "Elsevier article").await
    }
}

/// Map one `search-results` page. Returns the entries and the reported total.
fn parse_search_page(
    body: &Value,
    request: &SearchRequest,
    outcome: &mut SourceOutcome,
) -> (Vec<Entry>, usize) {
    let Some(results) = body.get("search-results") else {
        outcome.issue(IssueKind::MalformedItem, "response has no search-results");
        return (Vec::new(), 0);
    };

    let total = results
        .get("opensearch:totalResults")
        .and_then(|t| match t {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            _ => None,
        })
        .unwrap_or(0);

    let raw_entries = results
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut entries = Vec::new();
    for (idx, raw) in raw_entries.iter().enumerate() {
        if raw.get("error").is_some() {
            // "Result set was empty"
            continue;
        }
        match parse_entry(raw) {
            Ok(entry) if request.years.admits(entry.record.year) => entries.push(entry),
            Ok(_) => {}
            Err(e) => {
                debug!(idx = idx, error = %e, "Skipping Scopus entry");
                outcome.issue(IssueKind::MalformedItem, format!("entry {}: {}", idx, e));
            }
        }
    }

    (entries, total)
}

fn parse_entry(raw: &Value) -> Result<Entry> {
    let title = raw
        .get("dc:title")
        .and_then(Value::as_str)
        .map(clean_text)
        .filter(|t| !t.is_empty())
        .ok_or_parse("entry has no dc:title")?;

    let year = raw
        .get("prism:coverDate")
        .and_then(Value::as_str)
        .and_then(|d| d.get(..4))
        .and_then(|y| y.parse().ok())
        .or_else(|| extract_year(&title))
        .or_else(|| extract_year(&raw.to_string()));

    let mut authors: Vec<String> = raw
        .get("author")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|a| {
                    a.get("authname").and_then(Value::as_str).map(str::to_string).or_else(|| {
                        let given = a.get("given-name").and_then(Value::as_str)?;
                        let surname = a.get("surname").and_then(Value::as_str)?;
                        Some(format!("{} {}", given, surname))
                    })
                })
                .map(|n| clean_text(&n))
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if authors.is_empty() {
        if let Some(creator) = raw.get("dc:creator").and_then(Value::as_str) {
            authors.push(clean_text(creator));
        }
    }

    let keywords = match raw.get("authkeywords") {
        Some(Value::String(s)) => s
            .split(['|', ';', ','])
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|k| k.as_str().or_else(|| k.get("$").and_then(Value::as_str)))
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    let citations = match raw.get("citedby-count") {
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(Value::Number(n)) => n.as_u64(),
        _ => None,
    };

    let text_field = |key: &str| {
        raw.get(key)
            .and_then(Value::as_str)
            .map(clean_text)
            .unwrap_or_default()
    };

    Ok(Entry {
        record: ArticleRecord {
            title,
            authors,
            year,
            journal: text_field("prism:publicationName"),
            doi: text_field("prism:doi"),
            url: text_field("prism:url"),
            citations,
            source: None,
        },
        abstract_text: raw
            .get("dc:description")
            .and_then(Value::as_str)
            .map(strip_markup)
            .unwrap_or_default(),
        keywords,
    })
}

fn detail_abstract(body: &Value) -> Option<String> {
    body.pointer("/full-text-retrieval-response/coredata/dc:description")
        .or_else(|| body.pointer("/abstracts-retrieval-response/coredata/dc:description"))
        .and_then(Value::as_str)
        .map(strip_markup)
        .filter(|s| !s.is_empty())
}

fn entry_matches(verifier: &DomainVerifier, entry: &Entry) -> bool {
    let text = format!("{} {}", entry.abstract_text, entry.keywords.join(" "));
    verifier.matches(&entry.record.title, &text)
}

/// Verify, keep at most `limit`, store abstracts and order the final entries.
fn collect(entries: Vec<Entry>, verifier: Option<&DomainVerifier>, limit: usize, outcome: &mut SourceOutcome) {
    let kept = entries
        .into_iter()
        .filter(|entry| verifier.map_or(true, |v| entry_matches(v, entry)))
        .take(limit);
    for entry in kept {
        if !entry.abstract_text.is_empty() {
            outcome.abstracts.insert_longest(
                abstract_key(&entry.record.doi, &entry.record.title),
                entry.abstract_text,
            );
        }
        outcome.records.push(entry.record);
    }
    sort_by_year_desc(&mut outcome.records);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::YearRange;
    use serde_json::json;

    fn request(years: YearRange) -> SearchRequest {
        SearchRequest::new(
            vec![vec!["neural network".to_string()], vec!["fishery".to_string()]],
            10,
            years,
        )
        .expect("valid request")
    }

    fn page() -> Value {
        json!({"search-results": {
            "opensearch:totalResults": "3",
            "entry": [
                {
                    "dc:title": "Neural network models of fishery yield",
                    "dc:creator": "Pérez J.",
                    "prism:publicationName": "Fisheries Research",
                    "prism:coverDate": "2019-07-01",
                    "prism:doi": "10.1016/j.fishres.2019.01",
                    "prism:url": "https://api.elsevier.com/content/abstract/scopus_id/1",
                    "citedby-count": "15",
                    "authkeywords": "neural network | fishery",
                    "dc:description": "Yield models."
                },
                {
                    "dc:title": "Old fishery paper",
                    "prism:coverDate": "1999-01-01",
                    "citedby-count": "2"
                },
                {"prism:doi": "10.1/untitled"}
            ]
        }})
    }

    #[test]
    fn test_parse_search_page() {
        let req = request(YearRange::new(Some(2008), None));
        let mut outcome = SourceOutcome::new(Source::ScienceDirect);
        let (entries, total) = parse_search_page(&page(), &req, &mut outcome);

        assert_eq!(total, 3);
        assert_eq!(entries.len(), 1);
        let record = &entries[0].record;
        assert_eq!(record.year, Some(2019));
        assert_eq!(record.citations, Some(15));
        assert_eq!(record.authors, vec!["Pérez J."]);
        assert_eq!(entries[0].keywords, vec!["neural network", "fishery"]);
        assert_eq!(outcome.issues.len(), 1);
    }

    #[test]
    fn test_empty_result_set_marker() {
        let body = json!({"search-results": {
            "opensearch:totalResults": "0",
            "entry": [{"@_fa": "true", "error": "Result set was empty"}]
        }});
        let req = request(YearRange::default());
        let mut outcome = SourceOutcome::new(Source::ScienceDirect);
        let (entries, total) = parse_search_page(&body, &req, &mut outcome);
        assert!(entries.is_empty());
        assert_eq!(total, 0);
        assert!(outcome.issues.is_empty());
    }

    #[test]
    fn test_author_list_preferred_over_creator() {
        let entry = parse_entry(&json!({
            "dc:title": "T",
            "dc:creator": "Smith A.",
            "author": [{"authname": "Smith A."}, {"given-name": "Bo", "surname": "Li"}]
        }))
        .expect("valid entry");
        assert_eq!(entry.record.authors, vec!["Smith A.", "Bo Li"]);
        assert_eq!(entry.record.citations, None);
    }

    #[test]
    fn test_collect_verifies_with_keywords() {
        let req = request(YearRange::default());
        let mut outcome = SourceOutcome::new(Source::ScienceDirect);
        let (entries, _) = parse_search_page(&page(), &req, &mut outcome);
        let mut unrelated = entries[0].clone();
        unrelated.record.title = "Coral reef survey".to_string();
        unrelated.keywords.clear();
        unrelated.abstract_text.clear();
        unrelated.record.doi.clear();

        let mut outcome = SourceOutcome::new(Source::ScienceDirect);
        collect(vec![entries[0].clone(), unrelated], Some(&req.verifier()), 10, &mut outcome);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.abstracts.get("10.1016/j.fishres.2019.01"), Some("Yield models."));
    }

    #[test]
    fn test_detail_abstract() {
        let body = json!({"full-text-retrieval-response": {"coredata": {"dc:description": " <p>Full abstract</p> "}}});
        assert_eq!(detail_abstract(&body).as_deref(), Some("Full abstract"));
        assert_eq!(detail_abstract(&json!({})), None);
    }

    fn scopus_entry(title: &str, doi: &str) -> Value {
        json!({"dc:title": title, "prism:coverDate": "2020-01-01", "prism:doi": doi})
    }

    /// Answer each connection with the canned page for its `start` parameter.
    async fn serve_pages(pages: Vec<Value>) -> Result<std::net::SocketAddr> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 16 * 1024];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                let start: usize = head
                    .split("start=")
                    .nth(1)
                    .and_then(|rest| rest.split(|c: char| !c.is_ascii_digit()).next())
                    .and_then(|digits| digits.parse().ok())
                    .unwrap_or(0);
                let body = pages
                    .get(start / PAGE_SIZE)
                    .cloned()
                    .unwrap_or_else(|| json!({"search-results": {"opensearch:totalResults": "0", "entry": []}}))
                    .to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        Ok(addr)
    }

    #[tokio::test]
    async fn test_unverified_entries_do_not_fill_the_cap() -> Result<()> {
        let first = json!({"search-results": {
            "opensearch:totalResults": "50",
            "entry": [
                scopus_entry("Fishery policy review", "10.1/p1"),
                scopus_entry("Fishery governance", "10.1/p2"),
                scopus_entry("Neural network for traffic", "10.1/p3")
            ]
        }});
        let second = json!({"search-results": {
            "opensearch:totalResults": "50",
            "entry": [
                scopus_entry("Neural network fishery forecasting", "10.1/m1"),
                scopus_entry("A neural network for fishery landings", "10.1/m2")
            ]
        }});
        let addr = serve_pages(vec![first, second]).await?;

        let client = ScienceDirectClient::with_timeout("key", Duration::from_secs(5))?
            .with_base_url(format!("http://{}", addr))
            .with_retry(RetryPolicy::new(1, Duration::from_millis(1)));
        let req = SearchRequest::new(
            vec![vec!["neural network".to_string()], vec!["fishery".to_string()]],
            2,
            YearRange::default(),
        )?;

        let outcome = client.search(&req).await;
        assert!(outcome.issues.is_empty(), "{:?}", outcome.issues);
        let dois: Vec<&str> = outcome.records.iter().map(|r| r.doi.as_str()).collect();
        assert_eq!(dois, vec!["10.1/m1", "10.1/m2"]);
        Ok(())
    }

    #[test]
    fn test_collect_caps_after_verification() {
        let req = request(YearRange::default());
        let mut outcome = SourceOutcome::new(Source::ScienceDirect);
        let (entries, _) = parse_search_page(&page(), &req, &mut outcome);
        let mut unrelated = entries[0].clone();
        unrelated.record.title = "Coral reef survey".to_string();
        unrelated.keywords.clear();
        unrelated.abstract_text.clear();

        let mut outcome = SourceOutcome::new(Source::ScienceDirect);
        collect(vec![unrelated, entries[0].clone()], Some(&req.verifier()), 1, &mut outcome);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].title, "Neural network models of fishery yield");
    }

    #[tokio::test]
    async fn test_missing_key_is_skipped() -> Result<()> {
        let client = ScienceDirectClient::new("  ")?.with_base_url("http://127.0.0.1:9");
        let outcome = client.search(&request(YearRange::default())).await;
        assert!(outcome.is_empty());
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].kind, IssueKind::Skipped);
        Ok(())
    }

    #[tokio::test]
    async fn test_search_times_out_to_empty_outcome() -> Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let client = ScienceDirectClient::with_timeout("key", Duration::from_millis(200))?
            .with_base_url(format!("http://{}", addr))
            .with_retry(RetryPolicy::new(2, Duration::from_millis(5)));

        let outcome = client.search(&request(YearRange::default())).await;
        assert!(outcome.records.is_empty());
        assert!(outcome.abstracts.is_empty());
        assert_eq!(outcome.issues[0].kind, IssueKind::TransientExhausted);
        drop(listener);
        Ok(())
    }
}
