//! Prompt templates for LLM-based operations.

pub mod classification;

pub use classification::*;
