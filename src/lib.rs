//! # rustbiblio
//!
//! Multi-source bibliometric search, integration and domain analysis pipeline.
//!
//! ## Modules
//!
//! - [`sciencedirect`], [`crossref`], [`semanticscholar`], [`gscholar`] - source adapters
//! - [`normalize`] - DOI/title identity keys and text cleanup
//! - [`integrate`] - cross-source deduplication and merge
//! - [`domain`] - term-presence domain tagging and statistics
//! - [`llm_classifier`] - question-driven LLM classification of the tagged corpus
//! - [`pipeline`] - end-to-end orchestration with phase logging
//! - [`cookies`] - Google Scholar cookie persistence
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rustbiblio::crossref::CrossrefClient;
//! use rustbiblio::query::{SearchRequest, YearRange};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let request = SearchRequest::new(
//!         vec![vec!["machine learning".into()], vec!["fishery".into()]],
//!         50,
//!         YearRange::new(Some(2015), None),
//!     )?;
//!     let outcome = CrossrefClient::new(None)?.search(&request).await;
//!     println!("Found {} records", outcome.records.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod cookies;
pub mod crossref;
pub mod domain;
pub mod error;
pub mod gscholar;
mod http;
pub mod integrate;
pub mod llm_classifier;
pub mod normalize;
pub mod outcome;
pub mod pipeline;
pub mod prompts;
pub mod query;
pub mod record;
pub mod retry;
pub mod sciencedirect;
pub mod semanticscholar;
pub mod store;
pub mod terms;

pub use error::{BiblioError, Result};
