//! Pipeline configuration.
//!
//! Everything the CLI gathers ends up in a [`PipelineConfig`], which is
//! validated once before any request leaves the machine.

use crate::domain::{DomainSpec, MAX_DOMAINS};
use crate::error::{BiblioError, Result};
use crate::gscholar::ScholarOptions;
use crate::llm_classifier::DEFAULT_MODEL;
use crate::query::{SearchRequest, YearRange};
use crate::record::Source;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_OUTPUT_DIR: &str = "outputs";
pub const DEFAULT_QUESTIONS_FILE: &str = "questions.json";
pub const DEFAULT_MAX_RESULTS: usize = 100;
pub const DEFAULT_YEAR_START: i32 = 2008;
pub const DEFAULT_SCIENCE_DIRECT_KEY_FILE: &str = "secrets/sciencedirect_apikey.txt";
pub const DEFAULT_ANTHROPIC_KEY_FILE: &str = "secrets/anthropic-apikey";

/// Read one term per row from the first CSV column.
///
/// Rows are trimmed and blank rows skipped. A file with no usable rows yields
/// an empty list.
pub fn load_domain_terms(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut terms = Vec::new();
    for row in reader.records() {
        let row = row?;
        if let Some(term) = row.get(0).map(str::trim).filter(|t| !t.is_empty()) {
            terms.push(term.to_string());
        }
    }
    info!(count = terms.len(), path = %path.display(), "Loaded domain terms");
    Ok(terms)
}

/// A domain term file plus an optional display name.
#[derive(Debug, Clone)]
pub struct DomainFile {
    pub path: PathBuf,
    pub name: Option<String>,
}

impl DomainFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Load domains in order, naming unnamed ones `Domain1`, `Domain2`, ...
///
/// Files after the second are optional: a missing or empty one is skipped
/// with a warning. The first two must be readable.
pub fn load_domains(files: &[DomainFile]) -> Result<Vec<DomainSpec>> {
    let mut domains = Vec::with_capacity(files.len());
    for (i, file) in files.iter().enumerate() {
        let name = file
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Domain{}", i + 1));

        if i >= 2 && !file.path.exists() {
            warn!(domain = %name, path = %file.path.display(), "Optional domain file not found, skipping");
            continue;
        }
        let terms = load_domain_terms(&file.path).map_err(|e| {
            BiblioError::Config(format!("Cannot read domain file {}: {}", file.path.display(), e))
        })?;
        if i >= 2 && terms.is_empty() {
            warn!(domain = %name, path = %file.path.display(), "Optional domain file has no terms, skipping");
            continue;
        }
        domains.push(DomainSpec::new(name, terms));
    }
    Ok(domains)
}

/// Read an API key stored as the trimmed content of a file.
pub fn read_key_file(path: &Path) -> Result<String> {
    let key = std::fs::read_to_string(path)
        .map_err(|e| BiblioError::Config(format!("Cannot read key file {}: {}", path.display(), e)))?;
    let key = key.trim().to_string();
    if key.is_empty() {
        return Err(BiblioError::Config(format!("Key file {} is empty", path.display())));
    }
    Ok(key)
}

/// Pick a key from the flag/env value first, then from a key file.
///
/// An unreadable key file is logged and treated as no key, so a missing
/// optional credential never stops the run.
pub fn resolve_key(value: Option<String>, file: Option<&Path>) -> Option<String> {
    if let Some(key) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        return Some(key);
    }
    let file = file?;
    if !file.exists() {
        debug!(path = %file.display(), "Key file not present");
        return None;
    }
    match read_key_file(file) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(path = %file.display(), error = %e, "Ignoring key file");
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub science_direct_key: Option<String>,
    pub semantic_scholar_key: Option<String>,
    pub anthropic_key: Option<String>,
    /// Contact address for the Crossref polite pool
    pub crossref_mailto: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClassificationSettings {
    pub questions_file: PathBuf,
    pub model: String,
    pub parallel: bool,
    pub workers: usize,
    pub limit: Option<usize>,
    pub start_index: usize,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        Self {
            questions_file: PathBuf::from(DEFAULT_QUESTIONS_FILE),
            model: DEFAULT_MODEL.to_string(),
            parallel: false,
            workers: 5,
            limit: None,
            start_index: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub domains: Vec<DomainSpec>,
    pub max_results: usize,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
    pub output_dir: PathBuf,
    /// Sources to query, searched in integration order regardless of listing order
    pub sources: Vec<Source>,
    pub credentials: Credentials,
    pub scholar: ScholarOptions,
    pub cookie_file: Option<PathBuf>,
    /// Fetch Science Direct article details for records without an abstract
    pub fetch_details: bool,
    pub classification: ClassificationSettings,
    pub skip_searches: bool,
    pub skip_integration: bool,
    pub skip_domain_analysis: bool,
    pub skip_classification: bool,
    pub skip_google_scholar: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            max_results: DEFAULT_MAX_RESULTS,
            year_start: Some(DEFAULT_YEAR_START),
            year_end: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            sources: Source::INTEGRATION_ORDER.to_vec(),
            credentials: Credentials::default(),
            scholar: ScholarOptions::default(),
            cookie_file: None,
            fetch_details: false,
            classification: ClassificationSettings::default(),
            skip_searches: false,
            skip_integration: false,
            skip_domain_analysis: false,
            skip_classification: false,
            skip_google_scholar: false,
        }
    }
}

impl PipelineConfig {
    pub fn years(&self) -> YearRange {
        YearRange::new(self.year_start, self.year_end)
    }

    /// Check everything that would make the run pointless before it starts.
    ///
    /// More than three domains is accepted: only the first three are used.
    pub fn validate(&self) -> Result<()> {
        if self.domains.iter().all(|d| d.terms.is_empty()) {
            return Err(BiblioError::Config("No domain has any terms".to_string()));
        }
        for (i, label) in ["first", "second"].iter().enumerate() {
            match self.domains.get(i) {
                Some(domain) if !domain.terms.is_empty() => {}
                Some(domain) => {
                    return Err(BiblioError::Config(format!(
                        "The {} domain ({}) has no terms",
                        label, domain.name
                    )))
                }
                None => return Err(BiblioError::Config(format!("The {} domain is required", label))),
            }
        }
        if let (Some(start), Some(end)) = (self.year_start, self.year_end) {
            if start > end {
                return Err(BiblioError::Config(format!(
                    "year_start {} is after year_end {}",
                    start, end
                )));
            }
        }
        if self.max_results == 0 {
            return Err(BiblioError::Config("max_results must be greater than 0".to_string()));
        }
        if self.domains.len() > MAX_DOMAINS {
            warn!(
                configured = self.domains.len(),
                used = MAX_DOMAINS,
                "More than {} domains configured, using the first {}",
                MAX_DOMAINS,
                MAX_DOMAINS
            );
        }
        Ok(())
    }

    /// Domains actually used for searching and analysis.
    pub fn active_domains(&self) -> &[DomainSpec] {
        &self.domains[..self.domains.len().min(MAX_DOMAINS)]
    }

    pub fn search_request(&self) -> Result<SearchRequest> {
        SearchRequest::new(
            self.active_domains().iter().map(|d| d.terms.clone()).collect(),
            self.max_results,
            self.years(),
        )
    }

    /// Enabled sources in integration order, minus Google Scholar when skipped.
    pub fn enabled_sources(&self) -> Vec<Source> {
        Source::INTEGRATION_ORDER
            .into_iter()
            .filter(|s| self.sources.contains(s))
            .filter(|s| !(self.skip_google_scholar && *s == Source::GoogleScholar))
            .collect()
    }
}
