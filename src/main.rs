//! rustbiblio - multi-source bibliometric pipeline
//!
//! Searches Science Direct, Crossref, Semantic Scholar and Google Scholar for
//! articles at the intersection of up to three domains, merges the results,
//! tags domain membership and optionally classifies the corpus with an LLM.
//!
//! ## Usage
//!
//! ```bash
//! rustbiblio run --domain1 ai.csv --domain2 fisheries.csv --year-start 2015
//! rustbiblio search --source crossref --domain1 ai.csv --domain2 fisheries.csv
//! rustbiblio cookies import < cookies.json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rustbiblio::config::{
    load_domains, resolve_key, ClassificationSettings, Credentials, DomainFile, PipelineConfig,
    DEFAULT_ANTHROPIC_KEY_FILE, DEFAULT_QUESTIONS_FILE, DEFAULT_SCIENCE_DIRECT_KEY_FILE,
};
use rustbiblio::cookies::CookieManager;
use rustbiblio::domain::{analyze_dir, DomainStats, DOMAIN_RESULTS_FILE};
use rustbiblio::gscholar::ScholarOptions;
use rustbiblio::integrate::integrate_dir;
use rustbiblio::llm_classifier::{
    classify_file, load_questions, ClassificationSummary, Classifier, ClassifierConfig, CLASSIFIED_RESULTS_FILE,
    DEFAULT_MODEL,
};
use rustbiblio::outcome::Issue;
use rustbiblio::pipeline::{run_pipeline, run_searches, PIPELINE_SUMMARY_FILE};
use rustbiblio::record::Source;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Multi-source bibliometric search, integration and domain analysis
#[derive(Parser)]
#[command(name = "rustbiblio")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Also append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run search, integration, domain analysis and classification
    Run {
        #[command(flatten)]
        search: SearchArgs,

        #[command(flatten)]
        classify: ClassifyArgs,

        /// Skip the source searches and reuse existing result files
        #[arg(long)]
        skip_searches: bool,

        #[arg(long)]
        skip_integration: bool,

        #[arg(long)]
        skip_domain_analysis: bool,

        #[arg(long)]
        skip_classification: bool,

        #[arg(long)]
        skip_google_scholar: bool,
    },

    /// Search sources and write per-source result files
    Search {
        #[command(flatten)]
        search: SearchArgs,

        /// Source to query (repeatable): sciencedirect, crossref, semanticscholar, gscholar
        #[arg(long = "source", value_parser = parse_source)]
        sources: Vec<Source>,
    },

    /// Merge per-source result files into the integrated corpus
    Integrate {
        #[arg(short, long, default_value = "outputs")]
        output_dir: PathBuf,
    },

    /// Tag the integrated corpus with domain membership
    Analyze {
        #[command(flatten)]
        domains: DomainArgs,

        #[arg(short, long, default_value = "outputs")]
        output_dir: PathBuf,
    },

    /// Classify articles with the Anthropic API
    Classify {
        /// Input JSON array (default: <output-dir>/domain_analyzed_results.json)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Output file (default: <output-dir>/classified_results.json)
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(short, long, default_value = "outputs")]
        output_dir: PathBuf,

        #[command(flatten)]
        classify: ClassifyArgs,
    },

    /// Manage Google Scholar cookies
    Cookies {
        /// Cookie file (default: ~/.rustbiblio_scholar_cookies.json)
        #[arg(long, global = true)]
        cookie_file: Option<PathBuf>,

        #[command(subcommand)]
        action: CookieAction,
    },
}

#[derive(Subcommand)]
enum CookieAction {
    /// Show cookie file path
    Path,
    /// Clear stored cookies
    Clear,
    /// Import a browser cookie export (JSON array) from a file or stdin
    Import {
        /// Read from this file instead of stdin
        file: Option<PathBuf>,
    },
}

#[derive(Args)]
struct DomainArgs {
    /// CSV with the first domain's terms, one per row
    #[arg(long, default_value = "Domain1.csv")]
    domain1: PathBuf,

    #[arg(long, default_value = "Domain2.csv")]
    domain2: PathBuf,

    /// Optional third domain, skipped when the file does not exist
    #[arg(long, default_value = "Domain3.csv")]
    domain3: PathBuf,

    #[arg(long)]
    domain1_name: Option<String>,

    #[arg(long)]
    domain2_name: Option<String>,

    #[arg(long)]
    domain3_name: Option<String>,
}

impl DomainArgs {
    fn files(&self) -> Vec<DomainFile> {
        [
            (&self.domain1, &self.domain1_name),
            (&self.domain2, &self.domain2_name),
            (&self.domain3, &self.domain3_name),
        ]
        .into_iter()
        .map(|(path, name)| {
            let file = DomainFile::new(path);
            match name {
                Some(name) => file.named(name),
                None => file,
            }
        })
        .collect()
    }
}

#[derive(Args)]
struct SearchArgs {
    #[command(flatten)]
    domains: DomainArgs,

    /// Maximum results per source
    #[arg(long, default_value_t = 100)]
    max_results: usize,

    #[arg(long, default_value_t = 2008)]
    year_start: i32,

    #[arg(long)]
    year_end: Option<i32>,

    #[arg(short, long, default_value = "outputs")]
    output_dir: PathBuf,

    #[arg(long, env = "SCIENCE_DIRECT_API_KEY", hide_env_values = true)]
    science_direct_key: Option<String>,

    /// File whose trimmed content is the Science Direct key
    #[arg(long, default_value = DEFAULT_SCIENCE_DIRECT_KEY_FILE)]
    science_direct_key_file: PathBuf,

    /// Fetch article details for Science Direct records without an abstract
    #[arg(long)]
    fetch_details: bool,

    #[arg(long, env = "SEMANTIC_SCHOLAR_API_KEY", hide_env_values = true)]
    semantic_scholar_key: Option<String>,

    /// Contact email for the Crossref polite pool
    #[arg(long, env = "CROSSREF_MAILTO")]
    email: Option<String>,

    /// Proxy URL for Google Scholar (e.g., http://127.0.0.1:7890)
    #[arg(long)]
    proxy: Option<String>,

    /// Google Scholar mirror site URL
    #[arg(long)]
    mirror: Option<String>,

    /// Google Scholar cookie file
    #[arg(long)]
    cookie_file: Option<PathBuf>,
}

#[derive(Args)]
struct ClassifyArgs {
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_key: Option<String>,

    /// File whose trimmed content is the Anthropic key
    #[arg(long, default_value = DEFAULT_ANTHROPIC_KEY_FILE)]
    anthropic_key_file: PathBuf,

    /// Questions JSON file
    #[arg(long, default_value = DEFAULT_QUESTIONS_FILE)]
    questions: PathBuf,

    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Classify several articles concurrently
    #[arg(long)]
    parallel: bool,

    /// Concurrent requests in parallel mode
    #[arg(long, default_value_t = 5)]
    workers: usize,

    /// Classify at most this many articles
    #[arg(long)]
    limit: Option<usize>,

    /// Resume from this article index
    #[arg(long, default_value_t = 0)]
    start_from: usize,
}

impl ClassifyArgs {
    fn api_key(&self) -> Option<String> {
        resolve_key(self.anthropic_key.clone(), Some(&self.anthropic_key_file))
    }

    fn settings(&self) -> ClassificationSettings {
        ClassificationSettings {
            questions_file: self.questions.clone(),
            model: self.model.clone(),
            parallel: self.parallel,
            workers: self.workers,
            limit: self.limit,
            start_index: self.start_from,
        }
    }
}

fn parse_source(s: &str) -> std::result::Result<Source, String> {
    s.parse::<Source>().map_err(|e| e.to_string())
}

fn build_config(search: &SearchArgs) -> Result<PipelineConfig> {
    let domains = load_domains(&search.domains.files()).context("Failed to load domain terms")?;
    Ok(PipelineConfig {
        domains,
        max_results: search.max_results,
        year_start: Some(search.year_start),
        year_end: search.year_end,
        output_dir: search.output_dir.clone(),
        credentials: Credentials {
            science_direct_key: resolve_key(
                search.science_direct_key.clone(),
                Some(&search.science_direct_key_file),
            ),
            semantic_scholar_key: search.semantic_scholar_key.clone(),
            anthropic_key: None,
            crossref_mailto: search.email.clone(),
        },
        scholar: ScholarOptions {
            proxy: search.proxy.clone(),
            base_url: search.mirror.clone(),
            ..Default::default()
        },
        cookie_file: search.cookie_file.clone(),
        fetch_details: search.fetch_details,
        ..Default::default()
    })
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    match cli.command {
        Commands::Run {
            search,
            classify,
            skip_searches,
            skip_integration,
            skip_domain_analysis,
            skip_classification,
            skip_google_scholar,
        } => {
            let mut config = build_config(&search)?;
            config.credentials.anthropic_key = classify.api_key();
            config.classification = classify.settings();
            config.skip_searches = skip_searches;
            config.skip_integration = skip_integration;
            config.skip_domain_analysis = skip_domain_analysis;
            config.skip_classification = skip_classification;
            config.skip_google_scholar = skip_google_scholar;
            run_all(&config).await
        }
        Commands::Search { search, sources } => {
            let mut config = build_config(&search)?;
            if !sources.is_empty() {
                config.sources = sources;
            }
            search_only(&config).await
        }
        Commands::Integrate { output_dir } => integrate_only(&output_dir),
        Commands::Analyze { domains, output_dir } => {
            let domains = load_domains(&domains.files()).context("Failed to load domain terms")?;
            let analysis = analyze_dir(&output_dir, &domains).context("Domain analysis failed")?;
            print_domain_stats(&analysis.stats);
            print_issues(&analysis.issues);
            Ok(())
        }
        Commands::Classify {
            input,
            output,
            output_dir,
            classify,
        } => {
            let input = input.unwrap_or_else(|| output_dir.join(DOMAIN_RESULTS_FILE));
            let output = output.unwrap_or_else(|| output_dir.join(CLASSIFIED_RESULTS_FILE));
            classify_only(&classify, &input, &output).await
        }
        Commands::Cookies { cookie_file, action } => handle_cookies(cookie_file, action),
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let text = (!cli.log_json).then(|| fmt::layer().with_target(true).with_thread_ids(false));
    let json = cli.log_json.then(|| fmt::layer().json().with_target(true));
    let file = match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .with(file)
        .init();
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn run_all(config: &PipelineConfig) -> Result<()> {
    let summary = run_pipeline(config).await.context("Pipeline could not start")?;

    println!("\n=== Pipeline Summary ===");
    for phase in &summary.phases {
        let status = if phase.success { "ok" } else { "FAILED" };
        println!("  {:<16} {:>8.2}s  {}", phase.name, phase.duration, status);
    }
    for source in &summary.search {
        println!(
            "  {:<16} {} records, {} abstracts, {} issues",
            source.source.name(),
            source.records,
            source.abstracts,
            source.issues
        );
    }
    if let Some(stats) = &summary.integration {
        println!(
            "  Integrated {} of {} records ({} duplicates removed)",
            stats.total,
            stats.loaded,
            stats.duplicates()
        );
    }
    if let Some(stats) = &summary.domains {
        print_domain_stats(stats);
    }
    if let Some(classification) = &summary.classification {
        print_classification(classification);
    }
    print_issues(&summary.issues);
    println!(
        "\nSummary saved to {}",
        config.output_dir.join(PIPELINE_SUMMARY_FILE).display()
    );

    if !summary.success {
        bail!("Pipeline finished with {} failed phase(s)", summary.failed_phases);
    }
    Ok(())
}

async fn search_only(config: &PipelineConfig) -> Result<()> {
    config.validate()?;
    let request = config.search_request()?;
    let outcomes = run_searches(config, &request).await.context("Failed to save search results")?;

    println!("\n=== Search Results ===");
    let mut issues = Vec::new();
    for outcome in outcomes {
        println!(
            "  {:<16} {} records, {} abstracts",
            outcome.source.name(),
            outcome.records.len(),
            outcome.abstracts.len()
        );
        issues.extend(outcome.issues);
    }
    print_issues(&issues);
    println!("\nResults saved to {}", config.output_dir.display());
    Ok(())
}

fn integrate_only(output_dir: &Path) -> Result<()> {
    let corpus = integrate_dir(output_dir).context("Integration failed")?;
    let stats = &corpus.stats;

    println!("\n=== Integration ===");
    for count in &stats.sources {
        println!("  {:<16} {} loaded, {} kept", count.source.name(), count.loaded, count.kept);
    }
    println!(
        "  Duplicates: {} by DOI, {} by title",
        stats.duplicates_by_doi, stats.duplicates_by_title
    );
    println!("  Total: {} records, {} abstracts", stats.total, stats.abstracts);
    print_issues(&corpus.issues);
    Ok(())
}

async fn classify_only(args: &ClassifyArgs, input: &Path, output: &Path) -> Result<()> {
    let Some(key) = args.api_key() else {
        bail!(
            "No Anthropic API key: pass --anthropic-key, set ANTHROPIC_API_KEY or create {}",
            args.anthropic_key_file.display()
        );
    };
    let questions = load_questions(&args.questions)
        .with_context(|| format!("Failed to load questions from {}", args.questions.display()))?;

    let settings = args.settings();
    let classifier = Classifier::new(ClassifierConfig {
        model: settings.model,
        parallel: settings.parallel,
        workers: settings.workers,
        limit: settings.limit,
        start_index: settings.start_index,
        ..ClassifierConfig::new(key)
    })?;

    info!(model = %classifier.config().model, "Checking Anthropic API connection");
    if !classifier.check_connection().await {
        bail!("Could not connect to the Anthropic API");
    }

    let run = classify_file(&classifier, input, &questions, output)
        .await
        .context("Classification failed")?;
    print_classification(&run.summary);
    print_issues(&run.issues);
    println!("\nResults saved to {}", run.output.display());
    Ok(())
}

fn handle_cookies(cookie_file: Option<PathBuf>, action: CookieAction) -> Result<()> {
    let manager = match cookie_file {
        Some(path) => CookieManager::with_path(path),
        None => CookieManager::new()?,
    };

    match action {
        CookieAction::Path => {
            println!("Cookie file: {}", manager.path().display());
        }
        CookieAction::Clear => {
            manager.clear()?;
            println!("Cookies cleared.");
        }
        CookieAction::Import { file } => {
            let content = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => {
                    println!("Paste the cookie export for https://scholar.google.com as a JSON array,");
                    println!("e.g. [{{\"name\":\"NID\",\"value\":\"xxx\",\"domain\":\".google.com\"}}], then press Ctrl-D:");
                    let mut input = String::new();
                    std::io::stdin().read_to_string(&mut input)?;
                    input
                }
            };
            let count = manager.import_json(&content).context("Failed to import cookies")?;
            println!("Saved {} cookies to {}", count, manager.path().display());
        }
    }

    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_domain_stats(stats: &DomainStats) {
    println!("\n=== Domain Statistics ({} articles) ===", stats.total_articles);
    for domain in &stats.domains {
        println!("  {:<20} {:>6} ({:.2}%)", domain.name, domain.count, domain.percentage);
        for hit in domain.terms.iter().take(5) {
            println!("      {:<30} {}", hit.term, hit.count);
        }
    }
    for intersection in &stats.intersections {
        println!(
            "  {:<20} {:>6} ({:.2}%)",
            intersection.domains.join(" & "),
            intersection.count,
            intersection.percentage
        );
    }
}

fn print_classification(summary: &ClassificationSummary) {
    println!("\n=== Classification ({} articles) ===", summary.total_articles);
    for question in &summary.questions {
        println!("  {}", question.field_name);
        for answer in &question.answers {
            let label = match &answer.value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match answer.percentage {
                Some(pct) => println!("      {:<20} {:>6} ({:.2}%)", label, answer.count, pct),
                None => println!("      {:<20} {:>6}", label, answer.count),
            }
        }
    }
    if summary.classification_errors > 0 {
        println!("  Errors: {}", summary.classification_errors);
    }
}

fn print_issues(issues: &[Issue]) {
    if issues.is_empty() {
        return;
    }
    println!("\n{} issue(s):", issues.len());
    for issue in issues {
        println!("  - {}", issue);
    }
}
