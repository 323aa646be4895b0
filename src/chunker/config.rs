//! Configuration-file chunking (TOML).
//!
//! One fragment per top-level key: root-level assignments before the
//! first table form one entry, and every `[table]` / `[[array]]` header
//! starts (or continues) the entry of its top-level key, so `[server]`
//! and `[server.tls]` stay together.

use std::path::Path;

use crate::model::types::{Fragment, StructuralMetadata};

use super::{enrich, ChunkError};

pub fn chunk_config(path: &Path, text: &str) -> Result<Vec<Fragment>, ChunkError> {
    // Validate before splitting so malformed files surface as a skipped
    // artifact rather than nonsense fragments.
    text.parse::<toml::Table>().map_err(|e| ChunkError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let lines: Vec<&str> = text.lines().collect();

    // (row, top_level_key) per table header.
    let mut headers: Vec<(usize, String)> = Vec::new();
    for (row, line) in lines.iter().enumerate() {
        if let Some(key) = table_header_key(line) {
            headers.push((row, key));
        }
    }

    let mut fragments = Vec::new();
    let first_header_row = headers.first().map_or(lines.len(), |h| h.0);
    if first_header_row > 0 {
        // Root-level assignments keyed by the first key seen.
        let root_key = lines[..first_header_row]
            .iter()
            .filter_map(|l| root_key_of(l))
            .next()
            .unwrap_or_else(|| "root".to_string());
        push_entry(path, &lines, 0, first_header_row - 1, root_key, &mut fragments);
    }

    let mut idx = 0;
    while idx < headers.len() {
        let (start_row, ref key) = headers[idx];
        // Absorb consecutive tables sharing this top-level key.
        let mut next = idx + 1;
        while next < headers.len() && headers[next].1 == *key {
            next += 1;
        }
        let end_row = headers
            .get(next)
            .map_or(lines.len() - 1, |h| h.0 - 1);
        push_entry(path, &lines, start_row, end_row, key.clone(), &mut fragments);
        idx = next;
    }

    Ok(fragments)
}

/// Top-level key of a `[table]` or `[[array]]` header line, if any.
fn table_header_key(line: &str) -> Option<String> {
    let trimmed = line.trim();
    let inner = trimmed
        .strip_prefix("[[")
        .and_then(|s| s.strip_suffix("]]"))
        .or_else(|| trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')))?;
    let top = inner.split('.').next()?.trim().trim_matches('"');
    if top.is_empty() {
        None
    } else {
        Some(top.to_string())
    }
}

fn root_key_of(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let key = trimmed.split('=').next()?.trim();
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

fn push_entry(
    path: &Path,
    lines: &[&str],
    start: usize,
    end: usize,
    key: String,
    out: &mut Vec<Fragment>,
) {
    if end < start {
        return;
    }
    let content = lines[start..=end].join("\n");
    if content.trim().is_empty() {
        return;
    }
    let enriched = enrich(&key, None, &content);
    out.push(Fragment::new(
        path.to_path_buf(),
        (start as u32 + 1, end as u32 + 1),
        content,
        enriched,
        StructuralMetadata::ConfigEntry { key },
    ));
}
