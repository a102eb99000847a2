//! Desired rule documents
//!
//! A desired rule set is a JSON array of rules, or an object with a `rules`
//! array so the document can grow other top-level keys later.

use serde::Deserialize;
use std::path::Path;

use crate::core::error::{Error, Result};
use crate::core::rule::RuleSpec;

#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    Bare(Vec<RuleSpec>),
    Wrapped { rules: Vec<RuleSpec> },
}

/// Parses a desired rule document.
///
/// Handles supplied by the caller are dropped; they only have meaning for
/// rules read back from a backend.
pub fn parse(text: &str) -> Result<Vec<RuleSpec>> {
    let document: Document = serde_json::from_str(text)?;
    let mut rules = match document {
        Document::Bare(rules) | Document::Wrapped { rules } => rules,
    };
    for rule in &mut rules {
        rule.handle = None;
    }
    Ok(rules)
}

/// Reads and parses a desired rule document from disk.
pub async fn load(path: &Path) -> Result<Vec<RuleSpec>> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {e}", path.display()),
        ))
    })?;
    let rules = parse(&text)?;
    tracing::debug!(path = %path.display(), count = rules.len(), "Loaded desired rules");
    Ok(rules)
}
