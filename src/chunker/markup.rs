//! Heading-bounded markup chunking.
//!
//! Every ATX heading starts a section; a section runs to the line before
//! the next heading, so ranges never overlap (the non-overlap contract
//! wins over nesting: a parent section keeps only its lead text once a
//! deeper heading starts). Headings inside fenced code blocks are not
//! boundaries. Text before the first heading becomes a preamble section
//! at level 0.

use std::path::Path;

use crate::model::types::{Fragment, StructuralMetadata};

use super::enrich;

pub fn chunk_markup(path: &Path, text: &str) -> Vec<Fragment> {
    let lines: Vec<&str> = text.lines().collect();

    // (row, level, heading) of each boundary.
    let mut boundaries: Vec<(usize, u8, String)> = Vec::new();
    let mut in_fence = false;
    for (row, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some((level, heading)) = parse_heading(line) {
            boundaries.push((row, level, heading));
        }
    }

    let mut fragments = Vec::new();
    let first_heading_row = boundaries.first().map_or(lines.len(), |b| b.0);
    if first_heading_row > 0 {
        push_section(path, &lines, 0, first_heading_row - 1, 0, String::new(), &mut fragments);
    }
    for (idx, (row, level, heading)) in boundaries.iter().enumerate() {
        let end = boundaries
            .get(idx + 1)
            .map_or(lines.len() - 1, |next| next.0 - 1);
        push_section(path, &lines, *row, end, *level, heading.clone(), &mut fragments);
    }
    fragments
}

fn parse_heading(line: &str) -> Option<(u8, String)> {
    let hashes = line.bytes().take_while(|&b| b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') && !rest.is_empty() {
        return None;
    }
    Some((hashes as u8, rest.trim().trim_end_matches('#').trim().to_string()))
}

fn push_section(
    path: &Path,
    lines: &[&str],
    start: usize,
    end: usize,
    level: u8,
    heading: String,
    out: &mut Vec<Fragment>,
) {
    if end < start || start >= lines.len() {
        return;
    }
    let end = end.min(lines.len() - 1);
    let content = lines[start..=end].join("\n");
    if content.trim().is_empty() {
        return;
    }
    let header = if heading.is_empty() {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        heading.clone()
    };
    let enriched = enrich(&header, None, &content);
    out.push(Fragment::new(
        path.to_path_buf(),
        (start as u32 + 1, end as u32 + 1),
        content,
        enriched,
        StructuralMetadata::DocSection { heading, level },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::verify_coverage;

    #[test]
    fn splits_on_headings() {
        let text = "# Guide\n\nintro text\n\n## Setup\n\nsteps here\n\n## Usage\n\nmore text\n";
        let frags = chunk_markup(Path::new("guide.md"), text);
        assert_eq!(frags.len(), 3);
        assert_eq!(
            frags[0].structural,
            StructuralMetadata::DocSection {
                heading: "Guide".into(),
                level: 1
            }
        );
        assert!(frags[1].content.contains("steps here"));
        verify_coverage(text, &frags, 0);
    }

    #[test]
    fn preamble_before_first_heading_is_kept() {
        let text = "front matter\n\n# Title\n\nbody\n";
        let frags = chunk_markup(Path::new("doc.md"), text);
        assert_eq!(frags.len(), 2);
        assert_eq!(
            frags[0].structural,
            StructuralMetadata::DocSection {
                heading: String::new(),
                level: 0
            }
        );
        assert!(frags[0].content.contains("front matter"));
    }

    #[test]
    fn hashes_inside_code_fences_are_not_headings() {
        let text = "# Real\n\n```sh\n# not a heading\necho hi\n```\n\ntail\n";
        let frags = chunk_markup(Path::new("doc.md"), text);
        assert_eq!(frags.len(), 1);
        assert!(frags[0].content.contains("# not a heading"));
    }

    #[test]
    fn nested_heading_starts_its_own_section() {
        let text = "## Parent\n\nlead\n\n### Child\n\ndetail\n\n## Sibling\n\nend\n";
        let frags = chunk_markup(Path::new("doc.md"), text);
        assert_eq!(frags.len(), 3);
        let levels: Vec<u8> = frags
            .iter()
            .map(|f| match &f.structural {
                StructuralMetadata::DocSection { level, .. } => *level,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(levels, vec![2, 3, 2]);
        verify_coverage(text, &frags, 0);
    }

    #[test]
    fn rechunk_is_deterministic() {
        let text = "# A\n\nx\n\n## B\n\ny\n";
        let a = chunk_markup(Path::new("d.md"), text);
        let b = chunk_markup(Path::new("d.md"), text);
        assert_eq!(a, b);
    }
}
