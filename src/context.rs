//! Prompt construction from reranked chunks.

use serde::Serialize;

use crate::{
    chunk::RerankedCandidate,
    error::{Error, Result},
};

/// A chunk must be longer than this (in characters, after trimming) for the
/// retrieved context to count as substantive.
pub const SUBSTANTIVE_MIN_CHARS: usize = 50;

pub const DEFAULT_GROUNDED_TEMPLATE: &str = "\
You are the Archivist, a lore assistant. Answer the question using only the \
context below, taken from the lore archive. Be factual.

Context:
{context}

Question: {question}
Answer:";

pub const DEFAULT_FALLBACK_TEMPLATE: &str = "\
You are the Archivist, a lore assistant. The archive returned nothing useful \
for this question, so answer from your general knowledge of the lore and say \
so when you are unsure.

Question: {question}
Answer:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Grounded,
    Fallback,
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateKind::Grounded => f.write_str("grounded"),
            TemplateKind::Fallback => f.write_str("fallback"),
        }
    }
}

/// A fully rendered generation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub kind: TemplateKind,
}

/// The two prompt shapes. `{question}` and (for the grounded template)
/// `{context}` are substituted at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplates {
    grounded: String,
    fallback: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            grounded: DEFAULT_GROUNDED_TEMPLATE.to_string(),
            fallback: DEFAULT_FALLBACK_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplates {
    pub fn new(grounded: String, fallback: String) -> Result<Self> {
        for (name, template, required) in [
            ("grounded", &grounded, &["{context}", "{question}"][..]),
            ("fallback", &fallback, &["{question}"][..]),
        ] {
            for placeholder in required {
                if !template.contains(placeholder) {
                    return Err(Error::Config(format!(
                        "{name} template is missing the {placeholder} placeholder"
                    )));
                }
            }
        }
        if fallback.contains("{context}") {
            return Err(Error::Config(
                "fallback template must not reference {context}".to_string(),
            ));
        }
        Ok(Self { grounded, fallback })
    }

    pub fn grounded(&self) -> &str {
        &self.grounded
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }
}

/// Whether any chunk carries more than [`SUBSTANTIVE_MIN_CHARS`] characters
/// of trimmed text. A single long chunk is enough, relevant or not.
pub fn is_substantive(chunks: &[RerankedCandidate]) -> bool {
    chunks
        .iter()
        .any(|c| c.chunk.text.trim().chars().count() > SUBSTANTIVE_MIN_CHARS)
}

/// Build the generation prompt for `question`.
pub fn assemble(
    question: &str,
    chunks: &[RerankedCandidate],
    templates: &PromptTemplates,
) -> Prompt {
    if is_substantive(chunks) {
        let context = chunks
            .iter()
            .map(|c| c.chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        Prompt {
            text: render(
                &templates.grounded,
                &[("context", &context), ("question", question)],
            ),
            kind: TemplateKind::Grounded,
        }
    } else {
        Prompt {
            text: render(&templates.fallback, &[("question", question)]),
            kind: TemplateKind::Fallback,
        }
    }
}

/// Substitute `{name}` placeholders in a single left-to-right pass.
///
/// Substituted values are copied verbatim, so braces inside a question or a
/// chunk are never expanded. Unknown placeholders are left as written.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replacement = after.find('}').and_then(|close| {
            let name = &after[..close];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value, close))
        });

        match replacement {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
