// src/core/topology.rs

//! The topology rewriter (C9, spec §4.8 step 3): substitutes `${NAME}`
//! placeholders with concrete port numbers directly in the topology
//! document's text. Operating on the raw text rather than a parsed tree is
//! what preserves document ordering and comments (spec §1 non-goal:
//! "preserve user topology authoring formatting... only by round-tripping
//! through a format-preserving library" — here achieved more simply by
//! never parsing into a tree at all). `serde_yaml` is used only afterward,
//! to confirm the rewritten text still parses as YAML.

use crate::core::errors::OrchestratorError;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("static regex is valid"));

/// Replaces every `${NAME}` token found in `document` with the port number
/// `allocation[NAME]`, leaving everything else — including comments,
/// blank lines, and key ordering — byte-for-byte untouched. Unknown
/// placeholders beyond `${NAME}` (escape sequences, nested braces) are
/// treated as opaque content per spec §9 open question.
pub fn rewrite(document: &str, allocation: &BTreeMap<String, u16>) -> Result<String, OrchestratorError> {
    let mut missing = Vec::new();
    let rewritten = PLACEHOLDER.replace_all(document, |caps: &regex::Captures| {
        let name = &caps[1];
        match allocation.get(name) {
            Some(port) => port.to_string(),
            None => {
                missing.push(name.to_string());
                caps[0].to_string()
            }
        }
    });
    if !missing.is_empty() {
        return Err(OrchestratorError::InvalidArgument(format!(
            "topology references unallocated placeholder(s): {}",
            missing.join(", ")
        )));
    }
    let rewritten = rewritten.into_owned();
    validate_yaml(&rewritten)?;
    Ok(rewritten)
}

/// Defensive check (spec §4.8 step 3 note): the rewrite path never
/// reparses-and-reserializes, but a bad substitution (e.g. a port number
/// landing somewhere that breaks scalar quoting) should still fail loudly
/// rather than silently producing a lab host will reject.
fn validate_yaml(document: &str) -> Result<(), OrchestratorError> {
    let _: serde_yaml::Value = serde_yaml::from_str(document)?;
    Ok(())
}
