//! Cross-source merge and deduplication.
//!
//! Sources are concatenated in integration order and deduplicated in one
//! left-to-right pass: a record is dropped when its normalized DOI, or failing
//! that its normalized title, was already seen. The first copy wins, so the
//! order of the batches decides which source's record survives.

use crate::error::Result;
use crate::normalize::{canonical_key, normalize_doi, normalize_title};
use crate::outcome::{Issue, IssueKind, SourceOutcome, Stage};
use crate::record::{AbstractStore, ArticleRecord, Source};
use crate::store::{read_abstract_map, read_json_array, write_json};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

pub const INTEGRATED_RESULTS_FILE: &str = "integrated_results.json";
pub const INTEGRATED_ABSTRACTS_FILE: &str = "integrated_abstracts.json";

/// One source's contribution to a run.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub source: Source,
    pub records: Vec<ArticleRecord>,
    pub abstracts: AbstractStore,
}

impl SourceBatch {
    pub fn empty(source: Source) -> Self {
        Self {
            source,
            records: Vec::new(),
            abstracts: AbstractStore::new(),
        }
    }
}

impl From<SourceOutcome> for SourceBatch {
    fn from(outcome: SourceOutcome) -> Self {
        Self {
            source: outcome.source,
            records: outcome.records,
            abstracts: outcome.abstracts,
        }
    }
}

/// Which identity a duplicate was recognised by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Doi,
    Title,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCount {
    pub source: Source,
    pub loaded: usize,
    /// Records of this source left after deduplication
    pub kept: usize,
}

/// A dropped duplicate and the record it duplicated, kept for manual audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicatePair {
    pub kind: MatchKind,
    pub kept_source: Option<Source>,
    pub kept_title: String,
    pub dropped_source: Option<Source>,
    pub dropped_title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrationStats {
    pub sources: Vec<SourceCount>,
    pub loaded: usize,
    pub duplicates_by_doi: usize,
    pub duplicates_by_title: usize,
    pub total: usize,
    pub abstracts: usize,
    /// Every duplicate removed, in detection order
    pub duplicate_pairs: Vec<DuplicatePair>,
}

impl IntegrationStats {
    pub fn duplicates(&self) -> usize {
        self.duplicates_by_doi + self.duplicates_by_title
    }
}

/// Deduplicated, source-tagged and sorted corpus with its merged abstracts.
#[derive(Debug, Clone, Default)]
pub struct IntegratedCorpus {
    pub records: Vec<ArticleRecord>,
    pub abstracts: AbstractStore,
    pub stats: IntegrationStats,
    pub issues: Vec<Issue>,
}

/// Merge source batches in the order given.
///
/// Pass batches in [`Source::INTEGRATION_ORDER`] for reproducible output.
pub fn integrate(batches: Vec<SourceBatch>) -> IntegratedCorpus {
    let mut stats = IntegrationStats::default();
    let mut working: Vec<ArticleRecord> = Vec::new();
    let mut abstracts = AbstractStore::new();

    for batch in batches {
        if batch.records.is_empty() {
            warn!(source = %batch.source, "Source contributed 0 records");
        } else {
            info!(source = %batch.source, count = batch.records.len(), "Loaded source records");
        }
        stats.sources.push(SourceCount {
            source: batch.source,
            loaded: batch.records.len(),
            kept: 0,
        });
        stats.loaded += batch.records.len();

        working.extend(batch.records.into_iter().map(|mut record| {
            record.source = Some(batch.source);
            record
        }));

        for (key, text) in batch.abstracts {
            abstracts.insert_longest(canonical_key(&key), text);
        }
    }

    let mut records = deduplicate(working, &mut stats);
    sort_by_year_and_citations(&mut records);

    for count in &mut stats.sources {
        count.kept = records
            .iter()
            .filter(|r| r.source == Some(count.source))
            .count();
    }
    stats.total = records.len();
    stats.abstracts = abstracts.len();

    info!(
        loaded = stats.loaded,
        duplicates_by_doi = stats.duplicates_by_doi,
        duplicates_by_title = stats.duplicates_by_title,
        total = stats.total,
        abstracts = stats.abstracts,
        "Integration complete"
    );

    IntegratedCorpus {
        records,
        abstracts,
        stats,
        issues: Vec::new(),
    }
}

fn deduplicate(working: Vec<ArticleRecord>, stats: &mut IntegrationStats) -> Vec<ArticleRecord> {
    // normalized key -> index into `kept`
    let mut seen_dois: HashMap<String, usize> = HashMap::new();
    let mut seen_titles: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<ArticleRecord> = Vec::with_capacity(working.len());

    for record in working {
        let doi = normalize_doi(&record.doi);
        let title = normalize_title(&record.title);

        let duplicate_of = if doi.is_empty() {
            None
        } else {
            seen_dois.get(&doi).map(|&idx| (idx, MatchKind::Doi))
        }
        .or_else(|| {
            if title.is_empty() {
                None
            } else {
                seen_titles.get(&title).map(|&idx| (idx, MatchKind::Title))
            }
        });

        if let Some((idx, kind)) = duplicate_of {
            let original = &kept[idx];
            info!(
                kind = ?kind,
                kept_source = ?original.source,
                kept_title = %original.title,
                dropped_source = ?record.source,
                dropped_title = %record.title,
                "Duplicate removed"
            );
            match kind {
                MatchKind::Doi => stats.duplicates_by_doi += 1,
                MatchKind::Title => stats.duplicates_by_title += 1,
            }
            stats.duplicate_pairs.push(DuplicatePair {
                kind,
                kept_source: original.source,
                kept_title: original.title.clone(),
                dropped_source: record.source,
                dropped_title: record.title,
            });
            continue;
        }

        let idx = kept.len();
        if !doi.is_empty() {
            seen_dois.insert(doi, idx);
        }
        if !title.is_empty() {
            seen_titles.insert(title, idx);
        }
        kept.push(record);
    }

    kept
}

/// Year then citations, both descending, absent values counting as 0. Stable.
pub fn sort_by_year_and_citations(records: &mut [ArticleRecord]) {
    records.sort_by_key(|r| Reverse((r.year.unwrap_or(0), r.citations.unwrap_or(0))));
}

/// Load every source's result and abstract files from `dir`.
///
/// Missing or unreadable files count as an empty contribution and are
/// reported as issues. Batches come back in integration order.
pub fn load_source_batches(dir: &Path) -> (Vec<SourceBatch>, Vec<Issue>) {
    let mut batches = Vec::new();
    let mut issues = Vec::new();

    for source in Source::INTEGRATION_ORDER {
        let mut batch = SourceBatch::empty(source);

        let results_path = dir.join(source.results_file());
        let (records, record_issues) = load_records(&results_path, Stage::Integration);
        batch.records = records.unwrap_or_default();
        issues.extend(record_issues.into_iter().map(|i| i.with_source(source)));

        let abstracts_path = dir.join(source.abstracts_file());
        match read_abstract_map(&abstracts_path) {
            Ok(Some(map)) => {
                for (key, text) in map {
                    batch.abstracts.insert_longest(key, text);
                }
            }
            Ok(None) => debug!(path = %abstracts_path.display(), "No abstracts file"),
            Err(e) => {
                warn!(path = %abstracts_path.display(), error = %e, "Ignoring unreadable abstracts file");
                issues.push(
                    Issue::new(Stage::Integration, IssueKind::MissingInput, e.to_string())
                        .with_source(source),
                );
            }
        }

        batches.push(batch);
    }

    (batches, issues)
}

/// Read a JSON array of article records, skipping entries that do not map.
///
/// Returns `None` when the file is absent or unreadable, with an issue saying so.
pub fn load_records(path: &Path, stage: Stage) -> (Option<Vec<ArticleRecord>>, Vec<Issue>) {
    let mut issues = Vec::new();
    let items = match read_json_array(path) {
        Ok(Some(items)) => items,
        Ok(None) => {
            warn!(path = %path.display(), "Input file not found, treating as empty");
            issues.push(Issue::new(
                stage,
                IssueKind::MissingInput,
                format!("{} not found", path.display()),
            ));
            return (None, issues);
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Input file unreadable, treating as empty");
            issues.push(Issue::new(stage, IssueKind::MissingInput, e.to_string()));
            return (None, issues);
        }
    };

    let mut records = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match ArticleRecord::from_value(item) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), idx = idx, error = %e, "Skipping malformed record");
                issues.push(Issue::new(
                    stage,
                    IssueKind::MalformedItem,
                    format!("{} entry {}: {}", path.display(), idx, e),
                ));
            }
        }
    }
    (Some(records), issues)
}

/// Write `integrated_results.json` and `integrated_abstracts.json` into `dir`.
pub fn write_integrated(dir: &Path, corpus: &IntegratedCorpus) -> Result<()> {
    write_json(&dir.join(INTEGRATED_RESULTS_FILE), &corpus.records)?;
    write_json(&dir.join(INTEGRATED_ABSTRACTS_FILE), &corpus.abstracts)?;
    info!(dir = %dir.display(), records = corpus.records.len(), "Saved integrated corpus");
    Ok(())
}

/// Load, merge and persist in one step.
pub fn integrate_dir(dir: &Path) -> Result<IntegratedCorpus> {
    let (batches, issues) = load_source_batches(dir);
    let mut corpus = integrate(batches);
    corpus.issues = issues;
    write_integrated(dir, &corpus)?;
    Ok(corpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::read_json;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(title: &str, doi: &str, year: Option<i32>, citations: Option<u64>) -> ArticleRecord {
        ArticleRecord {
            title: title.to_string(),
            doi: doi.to_string(),
            year,
            citations,
            ..Default::default()
        }
    }

    fn batch(source: Source, records: Vec<ArticleRecord>) -> SourceBatch {
        SourceBatch {
            source,
            records,
            abstracts: AbstractStore::new(),
        }
    }

    #[test]
    fn test_same_doi_keeps_first_seen() {
        let corpus = integrate(vec![
            batch(Source::ScienceDirect, vec![record("Fish stocks", "10.1/ABC", Some(2020), None)]),
            batch(
                Source::Crossref,
                vec![record("Completely different wording", "https://doi.org/10.1/abc", Some(2020), Some(50))],
            ),
        ]);
        assert_eq!(corpus.records.len(), 1);
        assert_eq!(corpus.records[0].title, "Fish stocks");
        assert_eq!(corpus.records[0].source, Some(Source::ScienceDirect));
        assert_eq!(corpus.stats.duplicates_by_doi, 1);
    }

    #[test]
    fn test_title_fallback_without_doi() {
        let corpus = integrate(vec![
            batch(Source::Crossref, vec![record("The Forecast of Fish", "", Some(2019), None)]),
            batch(Source::GoogleScholar, vec![record("forecast of fish.", "", Some(2019), None)]),
        ]);
        assert_eq!(corpus.records.len(), 1);
        assert_eq!(corpus.records[0].source, Some(Source::Crossref));
        assert_eq!(corpus.stats.duplicates_by_title, 1);
    }

    #[test]
    fn test_duplicate_pairs_keep_both_titles() {
        let corpus = integrate(vec![
            batch(Source::ScienceDirect, vec![record("Fish stocks", "10.1000/abc", None, None)]),
            batch(
                Source::Crossref,
                vec![
                    record("Fish Stocks!", "", None, None),
                    record("Another wording", "doi:10.1000/ABC", None, None),
                ],
            ),
        ]);
        assert_eq!(corpus.records.len(), 1);
        assert_eq!(
            corpus.stats.duplicate_pairs,
            vec![
                DuplicatePair {
                    kind: MatchKind::Title,
                    kept_source: Some(Source::ScienceDirect),
                    kept_title: "Fish stocks".to_string(),
                    dropped_source: Some(Source::Crossref),
                    dropped_title: "Fish Stocks!".to_string(),
                },
                DuplicatePair {
                    kind: MatchKind::Doi,
                    kept_source: Some(Source::ScienceDirect),
                    kept_title: "Fish stocks".to_string(),
                    dropped_source: Some(Source::Crossref),
                    dropped_title: "Another wording".to_string(),
                },
            ]
        );
        assert_eq!(corpus.stats.duplicates(), corpus.stats.duplicate_pairs.len());
    }

    #[test]
    fn test_title_match_even_when_dois_differ() {
        // a DOI miss falls through to the title check
        let corpus = integrate(vec![
            batch(Source::Crossref, vec![record("Same title", "10.1/a", None, None)]),
            batch(Source::SemanticScholar, vec![record("Same Title", "10.1/b", None, None)]),
        ]);
        assert_eq!(corpus.records.len(), 1);
    }

    #[test]
    fn test_distinct_records_retained() {
        let corpus = integrate(vec![
            batch(Source::Crossref, vec![record("Paper one", "10.1/a", None, None)]),
            batch(Source::SemanticScholar, vec![record("Paper two", "10.1/b", None, None)]),
        ]);
        assert_eq!(corpus.records.len(), 2);
        assert_eq!(corpus.stats.duplicates(), 0);
    }

    #[test]
    fn test_abstract_merge_prefers_longer() {
        let mut short = AbstractStore::new();
        short.insert_longest("10.1000/x".to_string(), "short".to_string());
        let mut long = AbstractStore::new();
        long.insert_longest("https://doi.org/10.1000/X".to_string(), "a longer abstract text".to_string());

        let corpus = integrate(vec![
            SourceBatch { abstracts: short, ..SourceBatch::empty(Source::ScienceDirect) },
            SourceBatch { abstracts: long, ..SourceBatch::empty(Source::Crossref) },
        ]);
        assert_eq!(corpus.abstracts.len(), 1);
        assert_eq!(corpus.abstracts.get("10.1000/x"), Some("a longer abstract text"));
    }

    #[test]
    fn test_sorted_by_year_then_citations() {
        let corpus = integrate(vec![batch(
            Source::Crossref,
            vec![
                record("a", "", None, Some(100)),
                record("b", "", Some(2020), Some(1)),
                record("c", "", Some(2020), Some(9)),
                record("d", "", Some(2015), None),
            ],
        )]);
        let titles: Vec<&str> = corpus.records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["c", "b", "d", "a"]);
        // absent values are only treated as 0 for ordering
        assert_eq!(corpus.records[3].year, None);

        let keys: Vec<(i32, u64)> = corpus
            .records
            .iter()
            .map(|r| (r.year.unwrap_or(0), r.citations.unwrap_or(0)))
            .collect();
        assert!(keys.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_integrate_dir_without_science_direct() -> Result<()> {
        let dir = TempDir::new()?;
        write_json(
            &dir.path().join(Source::Crossref.results_file()),
            &json!([
                {"title": "Neural forecast of landings", "doi": "10.1000/n", "year": 2021, "citations": 3},
                {"doi": "10.1/untitled"}
            ]),
        )?;
        write_json(
            &dir.path().join(Source::Crossref.abstracts_file()),
            &json!({"10.1000/N": "We forecast landings."}),
        )?;
        std::fs::write(dir.path().join(Source::SemanticScholar.results_file()), "{not json")?;

        let corpus = integrate_dir(dir.path())?;
        assert_eq!(corpus.records.len(), 1);
        assert_eq!(corpus.stats.sources[0].source, Source::ScienceDirect);
        assert_eq!(corpus.stats.sources[0].loaded, 0);
        assert_eq!(corpus.abstracts.get("10.1000/n"), Some("We forecast landings."));

        let missing = corpus
            .issues
            .iter()
            .filter(|i| i.kind == IssueKind::MissingInput)
            .count();
        // Science Direct, Semantic Scholar (unreadable) and Google Scholar
        assert_eq!(missing, 3);
        assert!(corpus
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::MalformedItem && i.source == Some(Source::Crossref)));

        let saved: Vec<ArticleRecord> = read_json(&dir.path().join(INTEGRATED_RESULTS_FILE))?;
        assert_eq!(saved[0].source, Some(Source::Crossref));
        Ok(())
    }
}
