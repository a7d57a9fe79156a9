//! Google Scholar scraping.
//!
//! Scholar has no API, so result pages are fetched as HTML and parsed with
//! `scraper`. Requests are paced with a randomized delay, replay stored browser
//! cookies, and stop as soon as a CAPTCHA page appears or the circuit breaker
//! trips.

use crate::cookies::CookieManager;
use crate::error::{BiblioError, Result};
use crate::http::{build_client, check_status};
use crate::normalize::{abstract_key, clean_text, extract_doi, extract_year};
use crate::outcome::{IssueKind, SourceOutcome};
use crate::query::{sort_by_year_desc, SearchRequest, YearRange};
use crate::record::{ArticleRecord, Source};
use crate::retry::{CircuitBreaker, DelayRange};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default Google Scholar URL
pub const DEFAULT_SCHOLAR_URL: &str = "https://scholar.google.com";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Hits per result page
const PAGE_SIZE: usize = 10;

/// Scholar stops serving results past this offset
const MAX_START: usize = 990;

/// Longer OR-lists make Scholar return nothing
const TERMS_PER_DOMAIN: usize = 2;

static ITEM: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.gs_r.gs_or.gs_scl").expect("valid item selector"));
static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h3.gs_rt").expect("valid title selector"));
static LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h3.gs_rt a").expect("valid link selector"));
static META: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.gs_a").expect("valid meta selector"));
static SNIPPET: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.gs_rs").expect("valid snippet selector"));
static FOOTER_LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.gs_fl a").expect("valid footer selector"));

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("valid year regex"));
// English ("Cited by X") and Chinese ("被引用 X 次") interfaces
static CITED_BY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:Cited by\s*|被引用\s*)(\d+)").expect("valid cite regex"));
static TITLE_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\s*\[[A-Z]+\])+\s*").expect("valid tag regex"));

/// One parsed result block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScholarHit {
    pub title: String,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub venue: String,
    pub url: String,
    pub doi: String,
    pub citations: Option<u64>,
    pub snippet: String,
}

impl ScholarHit {
    fn into_record(self) -> (ArticleRecord, String) {
        let record = ArticleRecord {
            title: self.title,
            authors: self.authors,
            year: self.year,
            journal: self.venue,
            doi: self.doi,
            url: self.url,
            citations: self.citations,
            source: None,
        };
        (record, self.snippet)
    }
}

/// Scraping options, mirroring what a browser session would send.
#[derive(Debug, Clone)]
pub struct ScholarOptions {
    /// Proxy URL (e.g., "http://127.0.0.1:7890")
    pub proxy: Option<String>,
    /// Mirror site instead of scholar.google.com
    pub base_url: Option<String>,
    /// Source data type filter ("0,5" excludes patents)
    pub sdt: String,
    pub timeout: Duration,
    /// Pause between page requests
    pub page_delay: DelayRange,
    /// Extra pause after a failed request
    pub error_delay: DelayRange,
    /// Consecutive failures before giving up on the source
    pub breaker_threshold: u32,
    pub verify: bool,
}

impl Default for ScholarOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            base_url: None,
            sdt: "0,5".to_string(),
            timeout: Duration::from_secs(30),
            page_delay: DelayRange::new(Duration::from_secs(3), Duration::from_secs(6)),
            error_delay: DelayRange::new(Duration::from_secs(5), Duration::from_secs(10)),
            breaker_threshold: 3,
            verify: true,
        }
    }
}

pub struct ScholarClient {
    client: reqwest::Client,
    base_url: String,
    cookie_header: String,
    options: ScholarOptions,
}

impl ScholarClient {
    pub fn new(options: ScholarOptions, cookies: &CookieManager) -> Result<Self> {
        let client = build_client(USER_AGENT, options.timeout, options.proxy.as_deref())?;
        let base_url = options
            .base_url
            .as_deref()
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_SCHOLAR_URL.to_string());

        let cookie_header = cookies.cookie_header();
        if cookie_header.is_empty() {
            warn!(
                path = %cookies.path().display(),
                "No Google cookies loaded, Scholar is more likely to block. Run 'rustbiblio cookies import'"
            );
        }

        Ok(Self {
            client,
            base_url,
            cookie_header,
            options,
        })
    }

    pub async fn search(&self, request: &SearchRequest) -> SourceOutcome {
        let mut outcome = SourceOutcome::new(Source::GoogleScholar);
        let query = request.boolean_query_limited(TERMS_PER_DOMAIN);
        let verifier = self.options.verify.then(|| request.verifier());
        info!(query = %query, url = %self.base_url, max_results = request.max_results, "Starting Google Scholar search");

        let mut breaker = CircuitBreaker::new(self.options.breaker_threshold);
        let mut hits: Vec<(ArticleRecord, String)> = Vec::new();
        let mut start = 0;

        'pages: while hits.len() < request.max_results && start <= MAX_START {
            let url = match build_search_url(&self.base_url, &query, start, &self.options.sdt, request.years) {
                Ok(url) => url,
                Err(e) => {
                    outcome.issue(IssueKind::RequestFailed, e.to_string());
                    break;
                }
            };

            self.options.page_delay.wait().await;
            debug!(start = start, url = %url, "Fetching Scholar page");

            let html = match self.fetch_page(&url).await {
                Ok(html) => html,
                Err(BiblioError::Blocked(reason)) => {
                    warn!(start = start, reason = %reason, "Google Scholar is blocking requests, stopping");
                    outcome.issue(IssueKind::Blocked, format!("start {}: {}", start, reason));
                    break;
                }
                Err(e) => {
                    warn!(start = start, error = %e, failures = breaker.consecutive() + 1, "Scholar page failed");
                    if breaker.record_failure() {
                        outcome.issue(
                            IssueKind::Blocked,
                            format!("{} consecutive failures, last: {}", breaker.consecutive(), e),
                        );
                        break;
                    }
                    self.options.error_delay.wait().await;
                    continue;
                }
            };
            breaker.record_success();

            let items = parse_result_items(&html);
            info!(start = start, count = items.len(), "Parsed Scholar page");
            if items.is_empty() {
                break;
            }

            for (idx, item) in items.into_iter().enumerate() {
                match item {
                    Ok(hit) => {
                        breaker.record_success();
                        if !request.years.admits(hit.year) {
                            continue;
                        }
                        if let Some(verifier) = &verifier {
                            if !verifier.matches(&hit.title, &hit.snippet) {
                                debug!(title = %hit.title, "Dropping hit without every domain");
                                continue;
                            }
                        }
                        hits.push(hit.into_record());
                        if hits.len() >= request.max_results {
                            break 'pages;
                        }
                    }
                    Err(e) => {
                        outcome.issue(IssueKind::MalformedItem, format!("start {} item {}: {}", start, idx, e));
                        if breaker.record_failure() {
                            warn!("Repeated unparseable results, the page layout may have changed");
                            outcome.issue(IssueKind::Blocked, "circuit breaker opened on malformed results");
                            break 'pages;
                        }
                    }
                }
            }

            start += PAGE_SIZE;
        }

        for (record, snippet) in hits {
            outcome
                .abstracts
                .insert_longest(abstract_key(&record.doi, &record.title), snippet);
            outcome.records.push(record);
        }
        sort_by_year_desc(&mut outcome.records);

        let with_doi = outcome.records.iter().filter(|r| !r.doi.is_empty()).count();
        info!(
            count = outcome.records.len(),
            with_doi = with_doi,
            "Google Scholar search complete"
        );
        outcome
    }

    async fn fetch_page(&self, url: &Url) -> Result<String> {
        let mut request = self
            .client
            .get(url.as_str())
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Cache-Control", "no-cache")
            .header("Pragma", "no-cache")
            .header("Sec-Fetch-Dest", "document")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Sec-Fetch-Site", "none")
            .header("Sec-Fetch-User", "?1")
            .header("Upgrade-Insecure-Requests", "1");

        if !self.cookie_header.is_empty() {
            request = request.header("Cookie", &self.cookie_header);
        }

        let response = check_status(request.send().await?, "Google Scholar").await?;
        let html = response.text().await?;
        if is_block_page(&html) {
            return Err(BiblioError::Blocked("CAPTCHA page served".to_string()));
        }
        Ok(html)
    }
}

fn is_block_page(html: &str) -> bool {
    html.contains("Solving the above CAPTCHA")
        || html.contains("unusual traffic")
        || html.contains("id=\"gs_captcha_ccl\"")
}

fn build_search_url(base_url: &str, query: &str, start: usize, sdt: &str, years: YearRange) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/scholar", base_url))
        .map_err(|e| BiblioError::Config(format!("Invalid base URL: {}", e)))?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("q", query);
        // English locale keeps "Cited by" parseable
        params.append_pair("hl", "en-US");
        params.append_pair("start", &start.to_string());
        params.append_pair("as_sdt", sdt);
        if let Some(year) = years.start {
            params.append_pair("as_ylo", &year.to_string());
        }
        if let Some(year) = years.end {
            params.append_pair("as_yhi", &year.to_string());
        }
    }

    Ok(url)
}

/// Parse every result block on a Scholar page.
///
/// Each block is parsed on its own so one broken block does not lose the page.
pub fn parse_result_items(html: &str) -> Vec<Result<ScholarHit>> {
    let document = Html::parse_document(html);
    document.select(&ITEM).map(parse_item).collect()
}

fn element_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<String>())
}

fn parse_item(item: ElementRef<'_>) -> Result<ScholarHit> {
    let mut hit = ScholarHit::default();

    if let Some(link) = item.select(&LINK).next() {
        hit.title = element_text(link);
        hit.url = link.value().attr("href").unwrap_or_default().to_string();
    } else if let Some(title) = item.select(&TITLE).next() {
        hit.title = element_text(title);
    }
    hit.title = TITLE_TAGS.replace(&hit.title, "").trim().to_string();
    if hit.title.is_empty() {
        return Err(BiblioError::Parse("result has no title".to_string()));
    }

    // "A Author, B Author - Venue, 2019 - publisher.com"
    if let Some(meta) = item.select(&META).next() {
        let meta_text = element_text(meta);
        let parts: Vec<&str> = meta_text.split(" - ").collect();

        if let Some(authors) = parts.first() {
            hit.authors = authors
                .split(',')
                .map(|a| a.trim().trim_end_matches('…').trim())
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(venue_year) = parts.get(1) {
            match YEAR.find(venue_year) {
                Some(m) => {
                    hit.year = m.as_str().parse().ok();
                    hit.venue = venue_year[..m.start()]
                        .trim()
                        .trim_end_matches(',')
                        .trim_start_matches('…')
                        .trim()
                        .to_string();
                }
                None => hit.venue = venue_year.trim().trim_start_matches('…').trim().to_string(),
            }
        }
    }

    if let Some(snippet) = item.select(&SNIPPET).next() {
        hit.snippet = element_text(snippet);
    }

    for link in item.select(&FOOTER_LINK) {
        let href = link.value().attr("href").unwrap_or_default();
        if !href.contains("cites=") {
            continue;
        }
        let text = link.text().collect::<String>();
        if let Some(count) = CITED_BY.captures(&text).and_then(|c| c.get(1)) {
            hit.citations = count.as_str().parse().ok();
            break;
        }
    }

    let raw = item.html();
    hit.year = hit
        .year
        .or_else(|| extract_year(&hit.title))
        .or_else(|| extract_year(&element_text(item)));
    hit.doi = extract_doi(&hit.url)
        .or_else(|| extract_doi(&hit.snippet))
        .or_else(|| extract_doi(&hit.title))
        .or_else(|| extract_doi(&raw))
        .unwrap_or_default();

    Ok(hit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAGE: &str = r#"<html><body>
      <div class="gs_r gs_or gs_scl">
        <h3 class="gs_rt"><span>[PDF]</span><a href="https://doi.org/10.1016/j.fishres.2020.105500">Machine learning for fishery forecast</a></h3>
        <div class="gs_a">J Smith, A Lee… - Fisheries Research, 2020 - Elsevier</div>
        <div class="gs_rs">We forecast landings with machine learning.</div>
        <div class="gs_fl gs_flb"><a href="/scholar?cites=123">Cited by 42</a><a href="/related">Related articles</a></div>
      </div>
      <div class="gs_r gs_or gs_scl">
        <h3 class="gs_rt"><span class="gs_ctu">[CITATION]</span> Neural network fishery prediction</h3>
        <div class="gs_a">P Perez - Marine Policy</div>
        <div class="gs_rs">Published online 2015. See doi:10.1016/j.marpol.2015.01.002.</div>
      </div>
      <div class="gs_r gs_or gs_scl"><div class="gs_a">nobody</div></div>
    </body></html>"#;

    #[test]
    fn test_build_search_url() -> Result<()> {
        let url = build_search_url(
            "https://scholar.google.com",
            "\"machine learning\"",
            20,
            "0,5",
            YearRange::new(Some(2008), Some(2020)),
        )?;
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("q".to_string(), "\"machine learning\"".to_string())));
        assert!(pairs.contains(&("start".to_string(), "20".to_string())));
        assert!(pairs.contains(&("as_ylo".to_string(), "2008".to_string())));
        assert!(pairs.contains(&("as_yhi".to_string(), "2020".to_string())));
        assert!(build_search_url("not a url", "q", 0, "0,5", YearRange::default()).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_empty_html() {
        assert!(parse_result_items("<html><body></body></html>").is_empty());
    }

    #[test]
    fn test_parse_result_items() {
        let items = parse_result_items(PAGE);
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());

        let first = items[0].as_ref().expect("first hit parses");
        assert_eq!(first.title, "Machine learning for fishery forecast");
        assert_eq!(first.authors, vec!["J Smith", "A Lee"]);
        assert_eq!(first.venue, "Fisheries Research");
        assert_eq!(first.year, Some(2020));
        assert_eq!(first.citations, Some(42));
        assert_eq!(first.doi, "10.1016/j.fishres.2020.105500");

        let second = items[1].as_ref().expect("second hit parses");
        assert_eq!(second.title, "Neural network fishery prediction");
        assert_eq!(second.venue, "Marine Policy");
        assert_eq!(second.year, Some(2015));
        assert_eq!(second.citations, None);
        assert_eq!(second.doi, "10.1016/j.marpol.2015.01.002");
    }

    #[test]
    fn test_block_page_detection() {
        assert!(is_block_page("<p>Our systems have detected unusual traffic</p>"));
        assert!(!is_block_page(PAGE));
    }

    #[tokio::test]
    async fn test_breaker_stops_unreachable_source() -> Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let dir = TempDir::new()?;
        let options = ScholarOptions {
            base_url: Some(format!("http://{}", addr)),
            timeout: Duration::from_millis(200),
            page_delay: DelayRange::none(),
            error_delay: DelayRange::none(),
            ..Default::default()
        };
        let client = ScholarClient::new(options, &CookieManager::with_path(dir.path().join("c.json")))?;
        let request = SearchRequest::new(
            vec![vec!["fishery".to_string()]],
            10,
            YearRange::default(),
        )?;

        let outcome = client.search(&request).await;
        assert!(outcome.records.is_empty());
        assert!(outcome.abstracts.is_empty());
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].kind, IssueKind::Blocked);
        drop(listener);
        Ok(())
    }
}
