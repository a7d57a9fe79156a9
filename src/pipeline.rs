//! End-to-end run: search every source, integrate, analyse domains, classify.
//!
//! Each stage reads and writes files in the output directory, so any stage can
//! be skipped and picked up later from the files an earlier run left behind.

use crate::config::PipelineConfig;
use crate::cookies::CookieManager;
use crate::crossref::CrossrefClient;
use crate::domain::{analyze_dir, DomainStats, DOMAIN_RESULTS_FILE};
use crate::error::Result;
use crate::gscholar::ScholarClient;
use crate::integrate::{integrate_dir, IntegrationStats};
use crate::llm_classifier::{
    classify_file, load_questions, ClassificationSummary, Classifier, ClassifierConfig, CLASSIFIED_RESULTS_FILE,
};
use crate::outcome::{Issue, IssueKind, SourceOutcome, Stage};
use crate::query::SearchRequest;
use crate::record::{ArticleRecord, Source};
use crate::sciencedirect::ScienceDirectClient;
use crate::semanticscholar::SemanticScholarClient;
use crate::store::write_json;
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

pub const PIPELINE_SUMMARY_FILE: &str = "pipeline_summary.json";

/// One finished phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub name: String,
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    /// Seconds
    pub duration: f64,
    pub success: bool,
    pub details: Value,
}

/// A phase that has started but not finished.
#[derive(Debug)]
pub struct PhaseStart {
    name: String,
    start: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct PhaseLog {
    started: DateTime<Local>,
    phases: Vec<PhaseRecord>,
}

impl Default for PhaseLog {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseLog {
    pub fn new() -> Self {
        let started = Local::now();
        info!(start = %started.to_rfc3339(), "Starting pipeline");
        Self {
            started,
            phases: Vec::new(),
        }
    }

    pub fn begin(&self, name: &str) -> PhaseStart {
        info!(phase = name, "Starting phase");
        PhaseStart {
            name: name.to_string(),
            start: Local::now(),
        }
    }

    pub fn finish(&mut self, phase: PhaseStart, success: bool, details: Value) {
        let end = Local::now();
        let duration = (end - phase.start).num_milliseconds() as f64 / 1000.0;
        if success {
            info!(phase = %phase.name, duration_secs = duration, "Phase finished");
        } else {
            error!(phase = %phase.name, duration_secs = duration, details = %details, "Phase failed");
        }
        self.phases.push(PhaseRecord {
            name: phase.name,
            start: phase.start,
            end,
            duration,
            success,
            details,
        });
    }

    pub fn phases(&self) -> &[PhaseRecord] {
        &self.phases
    }

    pub fn all_succeeded(&self) -> bool {
        self.phases.iter().all(|p| p.success)
    }
}

/// Run settings echoed into the summary file.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub domains: Vec<String>,
    pub max_results: usize,
    pub year_range: String,
    pub output_dir: String,
    pub sources: Vec<Source>,
    pub skip_searches: bool,
    pub skip_integration: bool,
    pub skip_domain_analysis: bool,
    pub skip_classification: bool,
}

impl From<&PipelineConfig> for ConfigSummary {
    fn from(config: &PipelineConfig) -> Self {
        let bound = |y: Option<i32>, open: &str| y.map(|y| y.to_string()).unwrap_or_else(|| open.to_string());
        Self {
            domains: config.active_domains().iter().map(|d| d.name.clone()).collect(),
            max_results: config.max_results,
            year_range: format!("{}-{}", bound(config.year_start, "any"), bound(config.year_end, "present")),
            output_dir: config.output_dir.display().to_string(),
            sources: config.enabled_sources(),
            skip_searches: config.skip_searches,
            skip_integration: config.skip_integration,
            skip_domain_analysis: config.skip_domain_analysis,
            skip_classification: config.skip_classification,
        }
    }
}

/// Contents of `pipeline_summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub success: bool,
    pub total_phases: usize,
    pub successful_phases: usize,
    pub failed_phases: usize,
    pub phases: Vec<PhaseRecord>,
    pub configuration: ConfigSummary,
    pub search: Vec<SourceSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration: Option<IntegrationStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domains: Option<DomainStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationSummary>,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub source: Source,
    pub records: usize,
    pub abstracts: usize,
    pub issues: usize,
}

impl From<&SourceOutcome> for SourceSummary {
    fn from(outcome: &SourceOutcome) -> Self {
        Self {
            source: outcome.source,
            records: outcome.records.len(),
            abstracts: outcome.abstracts.len(),
            issues: outcome.issues.len(),
        }
    }
}

/// Query one source with the credentials and options in `config`.
///
/// Never fails: a client that cannot be built becomes an empty outcome with
/// an issue.
pub async fn search_source(source: Source, config: &PipelineConfig, request: &SearchRequest) -> SourceOutcome {
    let creds = &config.credentials;
    let built = match source {
        Source::ScienceDirect => ScienceDirectClient::new(creds.science_direct_key.clone().unwrap_or_default())
            .map(|c| Client::ScienceDirect(c.with_details(config.fetch_details, Duration::from_secs(1)))),
        Source::Crossref => CrossrefClient::new(creds.crossref_mailto.clone()).map(Client::Crossref),
        Source::SemanticScholar => {
            SemanticScholarClient::new(creds.semantic_scholar_key.clone()).map(Client::SemanticScholar)
        }
        Source::GoogleScholar => {
            let cookies = config
                .cookie_file
                .as_ref()
                .map(CookieManager::with_path)
                .unwrap_or_default();
            ScholarClient::new(config.scholar.clone(), &cookies).map(Client::GoogleScholar)
        }
    };

    match built {
        Ok(client) => client.search(request).await,
        Err(e) => {
            warn!(source = %source, error = %e, "Could not build client");
            let mut outcome = SourceOutcome::new(source);
            outcome.issue(IssueKind::RequestFailed, format!("client setup failed: {}", e));
            outcome
        }
    }
}

enum Client {
    ScienceDirect(ScienceDirectClient),
    Crossref(CrossrefClient),
    SemanticScholar(SemanticScholarClient),
    GoogleScholar(ScholarClient),
}

impl Client {
    async fn search(&self, request: &SearchRequest) -> SourceOutcome {
        match self {
            Client::ScienceDirect(c) => c.search(request).await,
            Client::Crossref(c) => c.search(request).await,
            Client::SemanticScholar(c) => c.search(request).await,
            Client::GoogleScholar(c) => c.search(request).await,
        }
    }
}

/// Write `<stem>_results.json` and `<stem>_abstracts.json`, empty or not.
pub fn write_source_outcome(dir: &Path, outcome: &SourceOutcome) -> Result<()> {
    write_json(&dir.join(outcome.source.results_file()), &outcome.records)?;
    write_json(&dir.join(outcome.source.abstracts_file()), &outcome.abstracts)?;
    Ok(())
}

/// Article counts per decade (`2010` covers 2010..=2019). Records without a
/// year are left out.
pub fn decade_distribution(records: &[ArticleRecord]) -> BTreeMap<i32, usize> {
    let mut decades = BTreeMap::new();
    for year in records.iter().filter_map(|r| r.year) {
        *decades.entry(year.div_euclid(10) * 10).or_insert(0) += 1;
    }
    decades
}

fn log_year_distribution(outcome: &SourceOutcome, request: &SearchRequest) {
    if request.years.is_open() {
        return;
    }
    let years: Vec<i32> = outcome.records.iter().filter_map(|r| r.year).collect();
    let (Some(min), Some(max)) = (years.iter().min(), years.iter().max()) else {
        return;
    };
    let decades = decade_distribution(&outcome.records)
        .into_iter()
        .map(|(decade, count)| format!("{}s: {}", decade, count))
        .collect::<Vec<_>>()
        .join(", ");
    info!(
        source = %outcome.source,
        min_year = min,
        max_year = max,
        without_year = outcome.records.len() - years.len(),
        decades = %decades,
        "Year distribution"
    );
}

/// Search every enabled source one after another and persist each outcome.
pub async fn run_searches(config: &PipelineConfig, request: &SearchRequest) -> Result<Vec<SourceOutcome>> {
    let mut outcomes = Vec::new();
    for source in config.enabled_sources() {
        info!(source = %source, "Searching source");
        let outcome = search_source(source, config, request).await;
        log_year_distribution(&outcome, request);
        write_source_outcome(&config.output_dir, &outcome)?;
        info!(
            source = %source,
            records = outcome.records.len(),
            abstracts = outcome.abstracts.len(),
            issues = outcome.issues.len(),
            "Source finished"
        );
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

/// Classify the domain-analysed corpus when a key and questions are available.
///
/// Returns `None` when classification was skipped, with the reason in `issues`.
async fn run_classification(config: &PipelineConfig, issues: &mut Vec<Issue>) -> Result<Option<ClassificationSummary>> {
    let skip = |issues: &mut Vec<Issue>, reason: &str| {
        warn!(reason = reason, "Skipping classification");
        issues.push(Issue::new(Stage::Classification, IssueKind::Skipped, reason));
    };

    let Some(key) = config.credentials.anthropic_key.clone() else {
        skip(issues, "no Anthropic API key configured");
        return Ok(None);
    };
    let settings = &config.classification;
    if !settings.questions_file.exists() {
        skip(
            issues,
            &format!("questions file {} not found", settings.questions_file.display()),
        );
        return Ok(None);
    }
    let questions = load_questions(&settings.questions_file)?;

    let classifier = Classifier::new(ClassifierConfig {
        model: settings.model.clone(),
        parallel: settings.parallel,
        workers: settings.workers,
        limit: settings.limit,
        start_index: settings.start_index,
        ..ClassifierConfig::new(key)
    })?;
    if !classifier.check_connection().await {
        issues.push(Issue::new(
            Stage::Classification,
            IssueKind::RequestFailed,
            "Anthropic API connection check failed",
        ));
        return Ok(None);
    }

    let run = classify_file(
        &classifier,
        &config.output_dir.join(DOMAIN_RESULTS_FILE),
        &questions,
        &config.output_dir.join(CLASSIFIED_RESULTS_FILE),
    )
    .await?;
    issues.extend(run.issues);
    Ok(Some(run.summary))
}

/// Run every non-skipped stage and write `pipeline_summary.json`.
///
/// A stage that fails stops the run; the summary is still written and
/// reports `success: false`. Configuration problems fail before any phase.
pub async fn run_pipeline(config: &PipelineConfig) -> Result<PipelineSummary> {
    config.validate()?;
    let request = config.search_request()?;
    let mut log = PhaseLog::new();
    let mut issues: Vec<Issue> = Vec::new();
    let mut search = Vec::new();
    let mut integration = None;
    let mut domains = None;
    let mut classification = None;

    'phases: {
        if !config.skip_searches {
            let phase = log.begin("search");
            match run_searches(config, &request).await {
                Ok(outcomes) => {
                    search = outcomes.iter().map(SourceSummary::from).collect::<Vec<_>>();
                    let total: usize = search.iter().map(|s| s.records).sum();
                    issues.extend(outcomes.into_iter().flat_map(|o| o.issues));
                    log.finish(phase, true, json!({ "sources": search.len(), "records": total }));
                }
                Err(e) => {
                    log.finish(phase, false, json!({ "error": e.to_string() }));
                    break 'phases;
                }
            }
        }

        if !config.skip_integration {
            let phase = log.begin("integration");
            match integrate_dir(&config.output_dir) {
                Ok(corpus) => {
                    log.finish(
                        phase,
                        true,
                        json!({
                            "loaded": corpus.stats.loaded,
                            "duplicates": corpus.stats.duplicates(),
                            "total": corpus.stats.total,
                        }),
                    );
                    issues.extend(corpus.issues);
                    integration = Some(corpus.stats);
                }
                Err(e) => {
                    log.finish(phase, false, json!({ "error": e.to_string() }));
                    break 'phases;
                }
            }
        }

        if !config.skip_domain_analysis {
            let phase = log.begin("domain_analysis");
            match analyze_dir(&config.output_dir, config.active_domains()) {
                Ok(analysis) => {
                    log.finish(
                        phase,
                        true,
                        json!({ "articles": analysis.stats.total_articles }),
                    );
                    issues.extend(analysis.issues);
                    domains = Some(analysis.stats);
                }
                Err(e) => {
                    log.finish(phase, false, json!({ "error": e.to_string() }));
                    break 'phases;
                }
            }
        }

        if !config.skip_classification {
            let phase = log.begin("classification");
            match run_classification(config, &mut issues).await {
                Ok(Some(summary)) => {
                    log.finish(
                        phase,
                        true,
                        json!({
                            "articles": summary.total_articles,
                            "errors": summary.classification_errors,
                        }),
                    );
                    classification = Some(summary);
                }
                Ok(None) => log.finish(phase, true, json!({ "skipped": true })),
                Err(e) => log.finish(phase, false, json!({ "error": e.to_string() })),
            }
        }
    }

    let phases = log.phases().to_vec();
    let successful = phases.iter().filter(|p| p.success).count();
    let summary = PipelineSummary {
        start_time: log.started,
        end_time: Local::now(),
        success: log.all_succeeded(),
        total_phases: phases.len(),
        successful_phases: successful,
        failed_phases: phases.len() - successful,
        phases,
        configuration: ConfigSummary::from(config),
        search,
        integration,
        domains,
        classification,
        issues,
    };
    write_json(&config.output_dir.join(PIPELINE_SUMMARY_FILE), &summary)?;
    info!(
        success = summary.success,
        phases = summary.total_phases,
        issues = summary.issues.len(),
        "Pipeline finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainSpec;
    use crate::store::read_json;
    use serde_json::json;
    use tempfile::TempDir;

    fn domain(name: &str, terms: &[&str]) -> DomainSpec {
        DomainSpec::new(name, terms.iter().map(|t| t.to_string()).collect())
    }

    fn config(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            domains: vec![
                domain("AI", &["machine learning"]),
                domain("Fisheries", &["fishery"]),
            ],
            output_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    fn record(title: &str, year: Option<i32>) -> ArticleRecord {
        ArticleRecord {
            title: title.to_string(),
            year,
            ..Default::default()
        }
    }

    #[test]
    fn test_decade_distribution() {
        let records = vec![
            record("a", Some(2009)),
            record("b", Some(2010)),
            record("c", Some(2019)),
            record("d", None),
        ];
        let decades = decade_distribution(&records);
        assert_eq!(decades.get(&2000), Some(&1));
        assert_eq!(decades.get(&2010), Some(&2));
        assert_eq!(decades.len(), 2);
    }

    #[test]
    fn test_phase_log() {
        let mut log = PhaseLog::new();
        let phase = log.begin("search");
        log.finish(phase, true, json!({ "records": 3 }));
        let phase = log.begin("integration");
        log.finish(phase, false, json!({ "error": "disk full" }));

        assert_eq!(log.phases().len(), 2);
        assert_eq!(log.phases()[0].name, "search");
        assert!(log.phases()[0].duration >= 0.0);
        assert!(!log.all_succeeded());
    }

    #[tokio::test]
    async fn test_search_without_key_writes_empty_files() -> Result<()> {
        let dir = TempDir::new()?;
        let config = PipelineConfig {
            sources: vec![Source::ScienceDirect],
            ..config(dir.path())
        };
        let outcomes = run_searches(&config, &config.search_request()?).await?;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].records.is_empty());
        assert_eq!(outcomes[0].issues[0].kind, IssueKind::Skipped);

        let results: Vec<Value> = read_json(&dir.path().join("sciencedirect_results.json"))?;
        assert!(results.is_empty());
        assert!(dir.path().join("sciencedirect_abstracts.json").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_pipeline_from_existing_source_files() -> Result<()> {
        let dir = TempDir::new()?;
        write_json(
            &dir.path().join("crossref_results.json"),
            &json!([
                {"title": "Machine learning for fishery management", "doi": "10.1/a", "year": 2021},
                {"title": "Unrelated title", "year": 2015}
            ]),
        )?;
        write_json(
            &dir.path().join("semanticscholar_results.json"),
            &json!([{"title": "Machine Learning for Fishery Management", "doi": "https://doi.org/10.1/A"}]),
        )?;

        let config = PipelineConfig {
            skip_searches: true,
            ..config(dir.path())
        };
        let summary = run_pipeline(&config).await?;

        assert!(summary.success);
        assert_eq!(summary.total_phases, 3);
        let integration = summary.integration.as_ref().map(|s| (s.total, s.duplicates_by_doi));
        assert_eq!(integration, Some((2, 1)));
        let both = summary.domains.as_ref().and_then(|d| d.intersection("AI_Fisheries")).map(|i| i.count);
        assert_eq!(both, Some(1));
        assert!(summary.classification.is_none());
        assert!(summary
            .issues
            .iter()
            .any(|i| i.stage == Stage::Classification && i.kind == IssueKind::Skipped));

        let saved: Value = read_json(&dir.path().join(PIPELINE_SUMMARY_FILE))?;
        assert_eq!(saved["success"], json!(true));
        assert_eq!(saved["phases"][0]["name"], json!("integration"));
        assert!(dir.path().join(DOMAIN_RESULTS_FILE).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_pipeline_rejects_invalid_config() {
        let dir = TempDir::new().expect("temp dir");
        let config = PipelineConfig {
            domains: vec![domain("AI", &["machine learning"])],
            ..config(dir.path())
        };
        assert!(run_pipeline(&config).await.is_err());
        assert!(!dir.path().join(PIPELINE_SUMMARY_FILE).exists());
    }
}
