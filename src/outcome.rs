//! Recoverable-issue accumulator shared by every pipeline stage.
//!
//! Adapters, the integrator and the classifier never fail for per-item or
//! per-source problems. They return their best-effort data together with a
//! list of [`Issue`]s and let the caller decide what to surface.

use crate::record::{AbstractStore, ArticleRecord, Source};
use serde::Serialize;
use std::fmt;

/// Pipeline stage an issue was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Search,
    Integration,
    DomainAnalysis,
    Classification,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Search => "search",
            Stage::Integration => "integration",
            Stage::DomainAnalysis => "domain_analysis",
            Stage::Classification => "classification",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Retry budget used up for a whole request
    TransientExhausted,
    /// Request rejected with a non-retryable error
    RequestFailed,
    /// One item could not be mapped and was skipped
    MalformedItem,
    /// An expected input file was absent or unreadable
    MissingInput,
    /// Source served a block page or tripped the circuit breaker
    Blocked,
    /// Source intentionally not queried (disabled, no credentials)
    Skipped,
    /// An article could not be classified and received defaults
    Classification,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub kind: IssueKind,
    pub message: String,
}

impl Issue {
    pub fn new(stage: Stage, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            source: None,
            kind,
            message: message.into(),
        }
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            Some(source) => write!(f, "[{}/{}] {:?}: {}", self.stage, source, self.kind, self.message),
            None => write!(f, "[{}] {:?}: {}", self.stage, self.kind, self.message),
        }
    }
}

/// Everything one source adapter produced in one run.
#[derive(Debug, Clone)]
pub struct SourceOutcome {
    pub source: Source,
    pub records: Vec<ArticleRecord>,
    pub abstracts: AbstractStore,
    pub issues: Vec<Issue>,
}

impl SourceOutcome {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            records: Vec::new(),
            abstracts: AbstractStore::new(),
            issues: Vec::new(),
        }
    }

    /// Record a search-stage issue attributed to this source.
    pub fn issue(&mut self, kind: IssueKind, message: impl Into<String>) {
        self.issues
            .push(Issue::new(Stage::Search, kind, message).with_source(self.source));
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
