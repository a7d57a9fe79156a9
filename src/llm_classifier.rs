//! LLM classification of article titles.
//!
//! Each article in `domain_analyzed_results.json` is sent to the Anthropic
//! Messages API with a fixed list of questions, and the answers are written back
//! into the article object under each question's `field_name`. A failed
//! classification never drops an article: it gets the default answers plus a
//! `classification_error` field.

use crate::error::{BiblioError, Result};
use crate::http::{build_client, check_status, read_json};
use crate::outcome::{Issue, IssueKind, Stage};
use crate::prompts::classification::{build_user_prompt, SYSTEM_PROMPT};
use crate::retry::RetryPolicy;
use crate::store::{read_json as read_json_file, read_json_array, write_json};
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-20241022";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const CLASSIFIED_RESULTS_FILE: &str = "classified_results.json";

/// Field added to articles whose classification failed
pub const ERROR_FIELD: &str = "classification_error";

/// Growth of the request timeout after a timed-out attempt
const TIMEOUT_GROWTH: f64 = 1.5;

static INTEGER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid integer regex"));
static BINARY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[01]\b").expect("valid binary regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerType {
    Int,
    String,
}

/// One classification question, as loaded from the questions file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    /// Shown to the model after "RESPOND ONLY WITH:"
    pub response_format: String,
    pub field_name: String,
    pub answer_type: AnswerType,
    #[serde(default)]
    pub default_value: Value,
}

/// Load and check a questions file. An empty list is a configuration error.
pub fn load_questions(path: &Path) -> Result<Vec<Question>> {
    let questions: Vec<Question> = read_json_file(path)?;
    if questions.is_empty() {
        return Err(BiblioError::Config(format!(
            "No classification questions in {}",
            path.display()
        )));
    }
    info!(count = questions.len(), path = %path.display(), "Loaded classification questions");
    Ok(questions)
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    /// Initial per-request timeout
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Bounded concurrent requests instead of one at a time
    pub parallel: bool,
    pub workers: usize,
    /// Pause between articles in sequential mode
    pub item_delay: Duration,
    pub limit: Option<usize>,
    pub start_index: usize,
}

impl ClassifierConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_base: ANTHROPIC_API_BASE.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::new(3, Duration::from_secs(5)),
            parallel: false,
            workers: 5,
            item_delay: Duration::from_secs(2),
            limit: None,
            start_index: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

pub struct Classifier {
    client: reqwest::Client,
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(BiblioError::Config("Anthropic API key is required for classification".to_string()));
        }
        let client = build_client("rustbiblio/0.1", config.timeout, None)?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Cheap authenticated request to confirm the key and network work.
    pub async fn check_connection(&self) -> bool {
        let url = format!("{}/models", self.config.api_base.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => true,
            Ok(r) => {
                warn!(status = %r.status(), "Anthropic API rejected the connection check");
                false
            }
            Err(e) => {
                warn!(error = %e, "Cannot reach Anthropic API");
                false
            }
        }
    }

    /// Classify every article, keeping input order.
    pub async fn classify_articles(&self, articles: Vec<Value>, questions: &[Question]) -> (Vec<Value>, Vec<Issue>) {
        let total = articles.len();
        let mut issues = Vec::new();

        if !self.config.parallel {
            info!(count = total, "Classifying articles sequentially");
            let mut classified = Vec::with_capacity(total);
            for (idx, article) in articles.into_iter().enumerate() {
                let (article, issue) = self.classify_one(article, questions, idx, total).await;
                classified.push(article);
                issues.extend(issue);
                if idx + 1 < total && !self.config.item_delay.is_zero() {
                    debug!(done = idx + 1, total = total, "Waiting before next article");
                    tokio::time::sleep(self.config.item_delay).await;
                }
            }
            return (classified, issues);
        }

        let workers = self.config.workers.max(1);
        info!(count = total, workers = workers, "Classifying articles in parallel");
        let completed = AtomicUsize::new(0);

        let mut results: Vec<(usize, Value, Option<Issue>)> = stream::iter(articles.into_iter().enumerate())
            .map(|(idx, article)| {
                let completed = &completed;
                async move {
                    let (article, issue) = self.classify_one(article, questions, idx, total).await;
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(done = done, total = total, "Classification progress");
                    (idx, article, issue)
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        results.sort_by_key(|(idx, _, _)| *idx);
        let classified = results
            .into_iter()
            .map(|(_, article, issue)| {
                issues.extend(issue);
                article
            })
            .collect();
        (classified, issues)
    }

    async fn classify_one(
        &self,
        mut article: Value,
        questions: &[Question],
        idx: usize,
        total: usize,
    ) -> (Value, Option<Issue>) {
        if !article.is_object() {
            let issue = Issue::new(
                Stage::Classification,
                IssueKind::Classification,
                format!("article {} is not a JSON object, left unchanged", idx),
            );
            return (article, Some(issue));
        }

        let title = article
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(idx = idx + 1, total = total, title = %title.chars().take(50).collect::<String>(), "Classifying article");

        let prompt = build_user_prompt(&title, questions);
        let result = self.query(&prompt).await;
        let mut issue = None;
        if let Value::Object(map) = &mut article {
            match result {
                Ok(text) => map.extend(extract_answers(&text, questions)),
                Err(e) => {
                    warn!(idx = idx, error = %e, "Classification failed, using default answers");
                    for question in questions {
                        map.insert(question.field_name.clone(), question.default_value.clone());
                    }
                    map.insert(ERROR_FIELD.to_string(), Value::String(e.to_string()));
                    issue = Some(Issue::new(
                        Stage::Classification,
                        IssueKind::Classification,
                        format!("article {}: {}", idx, e),
                    ));
                }
            }
        }
        (article, issue)
    }

    /// Send one prompt, retrying transient failures.
    ///
    /// The request timeout grows after every attempt that timed out.
    async fn query(&self, prompt: &str) -> Result<String> {
        let mut backoff = self.config.retry.backoff();
        let mut timeout = self.config.timeout;
        loop {
            match self.send(prompt, timeout).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() => {
                    let timed_out = matches!(e, BiblioError::Timeout(_));
                    let hint = match &e {
                        BiblioError::RateLimited(secs) => Some(Duration::from_secs(*secs)),
                        _ => None,
                    };
                    let attempt = backoff.attempt();
                    let Some(wait) = backoff.next_delay(hint) else {
                        warn!(attempts = attempt, error = %e, "Anthropic retry budget exhausted");
                        return Err(e);
                    };
                    if timed_out {
                        timeout = timeout.mul_f64(TIMEOUT_GROWTH);
                    }
                    warn!(
                        attempt = attempt,
                        max_attempts = backoff.max_attempts(),
                        wait_ms = wait.as_millis() as u64,
                        timeout_ms = timeout.as_millis() as u64,
                        error = %e,
                        "Anthropic request failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "system": SYSTEM_PROMPT,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.1,
            "max_tokens": 100
        });
        let url = format!("{}/messages", self.config.api_base.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .timeout(timeout)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response, "Anthropic").await?;
        let value = read_json(response, "Anthropic").await?;
        let parsed: MessagesResponse = serde_json::from_value(value)?;

        parsed
            .content
            .into_iter()
            .next()
            .map(|block| block.text.trim().to_string())
            .ok_or_else(|| BiblioError::Parse("Anthropic response has no content".to_string()))
    }
}

/// Map a model reply onto the questions, one non-empty line per question.
///
/// Integer answers take the first number on their line, else the first
/// standalone 0/1 anywhere in the reply, else the default. String answers
/// skip bare `0`/`1` lines, which belong to integer questions.
pub fn extract_answers(text: &str, questions: &[Question]) -> Map<String, Value> {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let is_binary = |line: &str| line == "0" || line == "1";

    let mut answers = Map::new();
    for (idx, question) in questions.iter().enumerate() {
        let line = lines.get(idx).copied();
        let answer = match question.answer_type {
            AnswerType::Int => line
                .and_then(|l| INTEGER.find(l))
                .or_else(|| BINARY.find(text))
                .and_then(|m| m.as_str().parse::<i64>().ok())
                .map(Value::from),
            AnswerType::String => match line {
                Some(l) if !is_binary(l) => Some(Value::String(l.to_string())),
                _ => lines
                    .iter()
                    .copied()
                    .find(|l| !is_binary(l))
                    .map(|l| Value::String(l.to_string())),
            },
        };
        answers.insert(
            question.field_name.clone(),
            answer.unwrap_or_else(|| question.default_value.clone()),
        );
    }
    answers
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerCount {
    pub value: Value,
    pub count: usize,
    /// Only reported for integer questions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionSummary {
    pub field_name: String,
    /// Most frequent first
    pub answers: Vec<AnswerCount>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassificationSummary {
    pub total_articles: usize,
    pub questions: Vec<QuestionSummary>,
    pub classification_errors: usize,
}

/// Answer frequencies over the articles processed in this run.
pub fn summarize(articles: &[Value], questions: &[Question]) -> ClassificationSummary {
    let total = articles.len();
    let questions = questions
        .iter()
        .map(|question| {
            let mut answers: Vec<AnswerCount> = Vec::new();
            for value in articles
                .iter()
                .filter_map(|a| a.get(&question.field_name))
                .filter(|v| !v.is_null())
            {
                match answers.iter_mut().find(|a| &a.value == value) {
                    Some(existing) => existing.count += 1,
                    None => answers.push(AnswerCount {
                        value: value.clone(),
                        count: 1,
                        percentage: None,
                    }),
                }
            }
            if question.answer_type == AnswerType::Int {
                for answer in &mut answers {
                    answer.percentage = Some(if total == 0 {
                        0.0
                    } else {
                        (answer.count as f64 / total as f64 * 10_000.0).round() / 100.0
                    });
                }
            }
            answers.sort_by(|a, b| b.count.cmp(&a.count));
            QuestionSummary {
                field_name: question.field_name.clone(),
                answers,
            }
        })
        .collect();

    ClassificationSummary {
        total_articles: total,
        questions,
        classification_errors: articles.iter().filter(|a| a.get(ERROR_FIELD).is_some()).count(),
    }
}

/// `classified_results.json` -> `classified_results_backup.json`
pub fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}_backup.{}", stem, ext.to_string_lossy()),
        None => format!("{}_backup", stem),
    };
    path.with_file_name(name)
}

#[derive(Debug, Clone)]
pub struct ClassificationRun {
    pub summary: ClassificationSummary,
    pub issues: Vec<Issue>,
    pub output: PathBuf,
}

/// Classify `input` into `output`, honouring `start_index` and `limit`.
///
/// When resuming from `start_index`, the first `start_index` entries come from
/// the previous `output` if it is readable, otherwise from `input` unclassified.
/// The output and its `_backup` copy are written once, after every article is
/// done.
pub async fn classify_file(
    classifier: &Classifier,
    input: &Path,
    questions: &[Question],
    output: &Path,
) -> Result<ClassificationRun> {
    let articles = read_json_array(input)?.ok_or_else(|| {
        BiblioError::Config(format!("Classification input {} not found", input.display()))
    })?;
    let config = classifier.config();
    let start = config.start_index.min(articles.len());

    let mut selected: Vec<Value> = articles[start..].to_vec();
    if let Some(limit) = config.limit.filter(|&l| l > 0) {
        selected.truncate(limit);
    }
    info!(
        total = articles.len(),
        start_index = start,
        selected = selected.len(),
        model = %config.model,
        "Starting classification"
    );

    let (classified, issues) = classifier.classify_articles(selected, questions).await;
    let summary = summarize(&classified, questions);

    let mut combined: Vec<Value> = Vec::with_capacity(start + classified.len());
    if start > 0 {
        let previous = match read_json_array(output) {
            Ok(Some(previous)) if previous.len() >= start => previous,
            _ => {
                warn!(start_index = start, "No usable previous results, keeping earlier articles unclassified");
                articles.clone()
            }
        };
        combined.extend(previous.into_iter().take(start));
    }
    combined.extend(classified);

    write_json(output, &combined)?;
    write_json(&backup_path(output), &combined)?;

    info!(
        processed = summary.total_articles,
        errors = summary.classification_errors,
        output = %output.display(),
        "Classification complete"
    );

    Ok(ClassificationRun {
        summary,
        issues,
        output: output.to_path_buf(),
    })
}
