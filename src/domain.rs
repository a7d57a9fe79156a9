//! Term-presence domain tagging and coverage statistics.
//!
//! Membership is tracked per article as a `Vec<bool>` indexed by domain
//! position. The `in_<name>_domain` keys only appear when rows are written.

use crate::error::Result;
use crate::integrate::{load_records, INTEGRATED_RESULTS_FILE};
use crate::normalize::normalize_text;
use crate::outcome::{Issue, Stage};
use crate::record::ArticleRecord;
use crate::store::{csv_writer, write_json};
use crate::terms::TermMatcher;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

pub const DOMAIN_RESULTS_FILE: &str = "domain_analyzed_results.json";
pub const DOMAIN_STATS_FILE: &str = "domain_statistics.csv";

/// Domains beyond this are ignored.
pub const MAX_DOMAINS: usize = 3;

/// Key of the all-domains intersection.
pub const ALL_DOMAINS_KEY: &str = "all_domains";

/// One facet of the search, e.g. AI methods or fisheries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainSpec {
    pub name: String,
    pub terms: Vec<String>,
}

impl DomainSpec {
    /// Blank terms are dropped.
    pub fn new(name: impl Into<String>, terms: Vec<String>) -> Self {
        Self {
            name: name.into(),
            terms: terms
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// `in_<lowercased name, spaces as underscores>_domain`
    pub fn flag_key(&self) -> String {
        format!("in_{}_domain", self.name.to_lowercase().replace(' ', "_"))
    }
}

/// An integrated record plus its per-domain membership.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedArticle {
    pub record: ArticleRecord,
    /// Indexed like the analysed domains
    pub flags: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TermHit {
    pub term: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainSummary {
    pub name: String,
    pub count: usize,
    pub percentage: f64,
    /// Most frequent first
    pub terms: Vec<TermHit>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intersection {
    /// `A_B` for a pair, `all_domains` for the triple
    pub key: String,
    pub domains: Vec<String>,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomainStats {
    pub total_articles: usize,
    pub domains: Vec<DomainSummary>,
    pub intersections: Vec<Intersection>,
}

impl DomainStats {
    pub fn intersection(&self, key: &str) -> Option<&Intersection> {
        self.intersections.iter().find(|i| i.key == key)
    }
}

fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 / total as f64 * 10_000.0).round() / 100.0
}

/// Tag every article with domain membership based on its title.
///
/// Articles with an empty title match nothing but still count toward
/// `total_articles`.
pub fn classify(corpus: &[ArticleRecord], domains: &[DomainSpec]) -> (Vec<TaggedArticle>, DomainStats) {
    if domains.len() > MAX_DOMAINS {
        warn!(
            configured = domains.len(),
            used = MAX_DOMAINS,
            "More than {} domains configured, analysing the first {}",
            MAX_DOMAINS,
            MAX_DOMAINS
        );
    }
    let domains = &domains[..domains.len().min(MAX_DOMAINS)];
    let matchers: Vec<TermMatcher> = domains
        .iter()
        .map(|d| TermMatcher::new(d.terms.as_slice(), normalize_text))
        .collect();

    let mut counts = vec![0usize; domains.len()];
    let mut term_counts: Vec<HashMap<&str, usize>> = vec![HashMap::new(); domains.len()];
    let mut tagged = Vec::with_capacity(corpus.len());

    for record in corpus {
        let title = normalize_text(&record.title);
        let mut flags = Vec::with_capacity(matchers.len());
        for (idx, matcher) in matchers.iter().enumerate() {
            let mut hit = false;
            for term in matcher.matching_terms(&title) {
                hit = true;
                *term_counts[idx].entry(term).or_default() += 1;
            }
            if hit {
                counts[idx] += 1;
            }
            flags.push(hit);
        }
        tagged.push(TaggedArticle {
            record: record.clone(),
            flags,
        });
    }

    let total = corpus.len();
    let summaries = domains
        .iter()
        .zip(counts)
        .zip(term_counts)
        .map(|((domain, count), mut hits)| {
            // ties keep the configured term order
            let mut terms: Vec<TermHit> = domain
                .terms
                .iter()
                .filter_map(|t| {
                    hits.remove(t.as_str()).map(|count| TermHit {
                        term: t.clone(),
                        count,
                    })
                })
                .collect();
            terms.sort_by(|a, b| b.count.cmp(&a.count));
            DomainSummary {
                name: domain.name.clone(),
                count,
                percentage: percentage(count, total),
                terms,
            }
        })
        .collect();

    let mut intersections = Vec::new();
    for i in 0..domains.len() {
        for j in (i + 1)..domains.len() {
            let count = tagged.iter().filter(|t| t.flags[i] && t.flags[j]).count();
            intersections.push(Intersection {
                key: format!("{}_{}", domains[i].name, domains[j].name),
                domains: vec![domains[i].name.clone(), domains[j].name.clone()],
                count,
                percentage: percentage(count, total),
            });
        }
    }
    if domains.len() == MAX_DOMAINS {
        let count = tagged.iter().filter(|t| t.flags.iter().all(|&f| f)).count();
        intersections.push(Intersection {
            key: ALL_DOMAINS_KEY.to_string(),
            domains: domains.iter().map(|d| d.name.clone()).collect(),
            count,
            percentage: percentage(count, total),
        });
    }

    let stats = DomainStats {
        total_articles: total,
        domains: summaries,
        intersections,
    };

    for summary in &stats.domains {
        info!(domain = %summary.name, count = summary.count, percentage = summary.percentage, "Domain coverage");
    }
    if let Some(all) = stats.intersection(ALL_DOMAINS_KEY) {
        info!(count = all.count, percentage = all.percentage, "Articles in every domain");
    }

    (tagged, stats)
}

/// Flatten tagged articles into JSON objects with `in_<name>_domain` ints.
pub fn to_json_rows(tagged: &[TaggedArticle], domains: &[DomainSpec]) -> Result<Vec<Value>> {
    let keys: Vec<String> = domains.iter().map(DomainSpec::flag_key).collect();
    tagged
        .iter()
        .map(|article| {
            let mut value = serde_json::to_value(&article.record)?;
            if let Value::Object(map) = &mut value {
                for (key, &flag) in keys.iter().zip(&article.flags) {
                    map.insert(key.clone(), Value::from(u8::from(flag)));
                }
            }
            Ok(value)
        })
        .collect()
}

/// Human-readable statistics table.
pub fn write_stats_csv(path: &Path, stats: &DomainStats) -> Result<()> {
    let mut writer = csv_writer(path)?;
    let blank = [""];

    writer.write_record(["Domain Statistics"])?;
    writer.write_record(["Total articles analyzed".to_string(), stats.total_articles.to_string()])?;
    writer.write_record(blank)?;

    writer.write_record(["Statistics by Domain"])?;
    writer.write_record(["Domain", "Articles", "Percentage"])?;
    for domain in &stats.domains {
        writer.write_record([
            domain.name.clone(),
            domain.count.to_string(),
            format!("{:.2}%", domain.percentage),
        ])?;
    }
    writer.write_record(blank)?;

    writer.write_record(["Domain Intersections"])?;
    writer.write_record(["Domains", "Articles", "Percentage"])?;
    for intersection in &stats.intersections {
        writer.write_record([
            intersection.domains.join(" & "),
            intersection.count.to_string(),
            format!("{:.2}%", intersection.percentage),
        ])?;
    }
    writer.write_record(blank)?;

    for domain in &stats.domains {
        writer.write_record([format!("Most frequent terms in {}", domain.name)])?;
        writer.write_record(["Term", "Frequency"])?;
        for hit in &domain.terms {
            writer.write_record([hit.term.clone(), hit.count.to_string()])?;
        }
        writer.write_record(blank)?;
    }

    writer.flush()?;
    Ok(())
}

/// Result of [`analyze_dir`].
#[derive(Debug, Clone)]
pub struct DomainAnalysis {
    pub tagged: Vec<TaggedArticle>,
    pub stats: DomainStats,
    pub issues: Vec<Issue>,
}

/// Tag `integrated_results.json` in `dir` and write both outputs.
///
/// A missing input is analysed as an empty corpus.
pub fn analyze_dir(dir: &Path, domains: &[DomainSpec]) -> Result<DomainAnalysis> {
    let (records, issues) = load_records(&dir.join(INTEGRATED_RESULTS_FILE), Stage::DomainAnalysis);
    let records = records.unwrap_or_default();
    info!(count = records.len(), domains = domains.len(), "Starting domain analysis");

    let (tagged, stats) = classify(&records, domains);
    let used = &domains[..domains.len().min(MAX_DOMAINS)];
    write_json(&dir.join(DOMAIN_RESULTS_FILE), &to_json_rows(&tagged, used)?)?;
    write_stats_csv(&dir.join(DOMAIN_STATS_FILE), &stats)?;

    Ok(DomainAnalysis {
        tagged,
        stats,
        issues,
    })
}
