use std::path::Path;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::db::OkvedEntry;
use crate::registry::is_okved_code;

/// Classifier sections are single letters `A`..`U`.
static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-U]$").unwrap());

pub struct Classifier {
    pub entries: Vec<OkvedEntry>,
    pub skipped: usize,
}

pub fn read_classifier(path: &Path) -> Result<Classifier> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read classifier {:?}", path))?;
    parse_classifier(&raw).with_context(|| format!("Failed to parse classifier {:?}", path))
}

pub fn parse_classifier(raw: &str) -> Result<Classifier> {
    let items: Value = serde_json::from_str(raw.trim_start_matches('\u{feff}'))?;
    let Value::Array(items) = items else {
        bail!("expected a JSON array of classifier entries");
    };

    let mut entries = Vec::with_capacity(items.len());
    let mut skipped = 0;
    for (i, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<OkvedEntry>(item) {
            Ok(entry) if is_valid_code(&entry.code) => entries.push(normalize(entry)),
            Ok(entry) => {
                warn!(index = i, code = %entry.code, "skipping classifier entry with invalid code");
                skipped += 1;
            }
            Err(e) => {
                warn!(index = i, error = %e, "skipping malformed classifier entry");
                skipped += 1;
            }
        }
    }
    Ok(Classifier { entries, skipped })
}

fn is_valid_code(code: &str) -> bool {
    is_okved_code(code) || SECTION_RE.is_match(code)
}

/// Blank optional fields are stored as NULL.
fn normalize(mut entry: OkvedEntry) -> OkvedEntry {
    let blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    entry.parent_code = blank(entry.parent_code);
    entry.section = blank(entry.section);
    entry.comment = blank(entry.comment);
    entry
}
