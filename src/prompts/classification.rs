//! Title classification prompts.
//!
//! The model answers one line per question, in question order, with nothing
//! else. Answer extraction in [`crate::llm_classifier`] relies on that layout.

use crate::llm_classifier::Question;
use std::fmt::Write as _;

/// System prompt keeping answers to bare values
pub const SYSTEM_PROMPT: &str = "You are an automatic scientific text classification system. \
You must respond ONLY with the requested values, WITHOUT ADDING ANY EXPLANATION, \
COMMENT OR ADDITIONAL NOTE. Only respond with the exact value requested.";

const CLOSING_INSTRUCTIONS: &str = "ATTENTION: You must respond ONLY with the requested values. \
DO NOT add additional explanations.
If the title does not explicitly mention what is asked, respond with the default negative value.";

/// Build the user prompt for one title.
pub fn build_user_prompt(title: &str, questions: &[Question]) -> String {
    let mut prompt = format!("Analyze this scientific title: \"{}\"\n\n", title);
    for (idx, question) in questions.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {}", idx + 1, question.text);
        let _ = writeln!(prompt, "RESPOND ONLY WITH: {}\n", question.response_format);
    }
    prompt.push_str(CLOSING_INSTRUCTIONS);
    prompt
}
