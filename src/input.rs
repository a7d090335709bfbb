use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::model::Identifier;

/// Reads the identifier list: a JSON array of integers.
pub fn load_identifiers(path: &Path) -> Result<Vec<Identifier>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Couldn't read identifier file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse identifier list JSON from {}", path.display()))
}
