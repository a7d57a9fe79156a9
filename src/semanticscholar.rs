//! Semantic Scholar Graph API search.
//!
//! API Details:
//! - Search endpoint: GET /graph/v1/paper/search
//! - Max 100 papers per page, offset + limit must stay below 1000
//! - Keyword search only: boolean syntax and quoting are ignored server-side,
//!   so the query uses the first two terms of each domain and relies on the
//!   local verification filter
//! - Rate limit: shared pool without key, higher with `x-api-key`

use crate::error::{OptionExt, Result};
use crate::http::{build_client, check_status, read_json};
use crate::normalize::{abstract_key, clean_text, extract_year};
use crate::outcome::{IssueKind, SourceOutcome};
use crate::query::{sort_by_year_desc, DomainVerifier, SearchRequest};
use crate::record::{ArticleRecord, Source};
use crate::retry::{retry_transient, RetryPolicy};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Semantic Scholar API base URL
pub const SS_API_BASE: &str = "https://api.semanticscholar.org/graph/v1";

/// Papers per page
const PAGE_SIZE: usize = 100;

/// Search results past this offset are not served
const MAX_OFFSET: usize = 1000;

/// Terms per domain in the keyword query
const TERMS_PER_DOMAIN: usize = 2;

const FIELDS: &str = "title,authors,year,venue,publicationVenue,url,abstract,externalIds,citationCount,publicationDate";

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    data: Option<Vec<Value>>,
    #[serde(default)]
    next: Option<usize>,
    #[serde(default)]
    total: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SSPaper {
    title: Option<String>,
    authors: Option<Vec<SSAuthor>>,
    year: Option<i32>,
    publication_date: Option<String>,
    venue: Option<String>,
    publication_venue: Option<SSVenue>,
    url: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    external_ids: Option<SSExternalIds>,
    citation_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SSAuthor {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SSVenue {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SSExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
}

/// Semantic Scholar search client.
pub struct SemanticScholarClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
    page_delay: Duration,
    verify: bool,
}

impl SemanticScholarClient {
    /// Create a client with a 30 s request timeout.
    pub fn new(api_key: Option<String>) -> Result<Self> {
        Self::with_timeout(api_key, Duration::from_secs(30))
    }

    pub fn with_timeout(api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client("rustbiblio/0.1", timeout, None)?,
            base_url: SS_API_BASE.to_string(),
            api_key,
            retry: RetryPolicy::default(),
            page_delay: Duration::from_secs(1),
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

    /// Pause between result pages.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Page through keyword search results until `max_results` papers pass the filters.
    pub async fn search(&self, request: &SearchRequest) -> SourceOutcome {
        let mut outcome = SourceOutcome::new(Source::SemanticScholar);
        let query = request.keyword_query(TERMS_PER_DOMAIN);
        let verifier = self.verify.then(|| request.verifier());

        info!(
            query = %query,
            max_results = request.max_results,
            authenticated = self.api_key.is_some(),
            "Starting Semantic Scholar search"
        );

        let mut offset = 0;
        loop {
            let label = format!("semantic scholar search offset {}", offset);
            let page = retry_transient(&self.retry, &label, || {
                self.fetch_page(&query, request, offset)
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
                    warn!(offset = offset, error = %e, "Semantic Scholar page failed, keeping what was collected");
                    outcome.issue(kind, format!("offset {}: {}", offset, e));
                    break;
                }
            };

            let next = parse_page(&page, request, verifier.as_ref(), &mut outcome);
            if outcome.records.len() >= request.max_results {
                break;
            }
            match next {
                Some(n) if n > offset && n + PAGE_SIZE <= MAX_OFFSET => offset = n,
                _ => break,
            }
            if !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }
        }

        sort_by_year_desc(&mut outcome.records);
        info!(
            count = outcome.records.len(),
            abstracts = outcome.abstracts.len(),
            "Semantic Scholar search complete"
        );
        outcome
    }

    async fn fetch_page(&self, query: &str, request: &SearchRequest, offset: usize) -> Result<Value> {
        let url = format!("{}/paper/search", self.base_url.trim_end_matches('/'));
        let offset = offset.to_string();
        let limit = PAGE_SIZE.to_string();
        let years = request.years.to_api_range();

        let mut params = vec![
            ("query", query),
            ("offset", offset.as_str()),
            ("limit", limit.as_str()),
            ("fields", FIELDS),
        ];
        if let Some(range) = years.as_deref() {
            params.push(("year", range));
        }

        debug!(url = %url, offset = %offset, "Requesting Semantic Scholar page");

        let mut builder = self.client.get(&url).query(&params);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }

        let response = check_status(builder.send().await?, "Semantic Scholar").await?;
        read_json(response, "Semantic Scholar").await
    }
}

/// Map one search page into `outcome`. Returns the next offset, if any.
pub fn parse_page(
    body: &Value,
    request: &SearchRequest,
    verifier: Option<&DomainVerifier>,
    outcome: &mut SourceOutcome,
) -> Option<usize> {
    let page: SearchPage = match serde_json::from_value(body.clone()) {
        Ok(page) => page,
        Err(e) => {
            outcome.issue(IssueKind::MalformedItem, format!("unexpected page shape: {}", e));
            return None;
        }
    };

    let Some(papers) = page.data else {
        outcome.issue(IssueKind::MalformedItem, "response has no data array");
        return None;
    };
    debug!(count = papers.len(), total = ?page.total, "Semantic Scholar page");

    for (idx, raw) in papers.iter().enumerate() {
        if outcome.records.len() >= request.max_results {
            break;
        }
        match parse_paper(raw, request, verifier) {
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
                debug!(idx = idx, error = %e, "Skipping Semantic Scholar paper");
                outcome.issue(IssueKind::MalformedItem, format!("paper {}: {}", idx, e));
            }
        }
    }

    page.next
}

fn parse_paper(
    raw: &Value,
    request: &SearchRequest,
    verifier: Option<&DomainVerifier>,
) -> Result<Option<(ArticleRecord, Option<String>)>> {
    let paper: SSPaper = serde_json::from_value(raw.clone())?;

    let title = paper
        .title
        .as_deref()
        .map(clean_text)
        .filter(|t| !t.is_empty())
        .ok_or_parse("paper has no title")?;

    let year = paper
        .year
        .or_else(|| paper.publication_date.as_deref().and_then(extract_year))
        .or_else(|| extract_year(&title))
        .or_else(|| extract_year(&raw.to_string()));
    if !request.years.admits(year) {
        return Ok(None);
    }

    let abstract_text = paper.abstract_text.as_deref().map(clean_text).unwrap_or_default();
    if let Some(verifier) = verifier {
        if !verifier.matches(&title, &abstract_text) {
            return Ok(None);
        }
    }

    let journal = paper
        .venue
        .filter(|v| !v.trim().is_empty())
        .or_else(|| paper.publication_venue.and_then(|v| v.name))
        .map(|v| clean_text(&v))
        .unwrap_or_default();

    let record = ArticleRecord {
        title,
        authors: paper
            .authors
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| a.name)
            .map(|n| clean_text(&n))
            .filter(|n| !n.is_empty())
            .collect(),
        year,
        journal,
        doi: paper
            .external_ids
            .and_then(|ids| ids.doi)
            .map(|d| clean_text(&d))
            .unwrap_or_default(),
        url: paper.url.unwrap_or_default(),
        citations: paper.citation_count,
        source: None,
    };

    let abstract_text = (!abstract_text.is_empty()).then_some(abstract_text);
    Ok(Some((record, abstract_text)))
}
