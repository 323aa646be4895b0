//! Syntactic code chunking via tree-sitter.
//!
//! Top-level items (functions, types, traits, impl blocks, modules)
//! become one fragment each, with preceding doc comments and attributes
//! attached. Impl/class bodies longer than the configured split
//! threshold are split per method, carrying the container header in each
//! method's signature. Runs of non-item lines (imports, module-level
//! statements) are grouped into module-scope fragments so the artifact
//! stays covered.

use std::path::Path;

use tree_sitter::{Node, Parser};

use crate::model::types::{CodeLanguage, Deprecation, Fragment, StructuralMetadata};

use super::{enrich, ChunkError, ChunkerConfig};

/// If more than this fraction of AST nodes are error nodes, the parse is
/// treated as failed and the artifact is skipped.
const ERROR_THRESHOLD: f64 = 0.30;

fn ts_language(language: CodeLanguage) -> tree_sitter::Language {
    match language {
        CodeLanguage::Rust => tree_sitter_rust::LANGUAGE.into(),
        CodeLanguage::Python => tree_sitter_python::LANGUAGE.into(),
    }
}

fn is_unit_kind(language: CodeLanguage, kind: &str) -> bool {
    match language {
        CodeLanguage::Rust => matches!(
            kind,
            "function_item"
                | "struct_item"
                | "enum_item"
                | "union_item"
                | "trait_item"
                | "impl_item"
                | "mod_item"
                | "macro_definition"
                | "type_item"
                | "const_item"
                | "static_item"
                | "foreign_mod_item"
        ),
        CodeLanguage::Python => matches!(
            kind,
            "function_definition" | "class_definition" | "decorated_definition"
        ),
    }
}

fn is_prefix_kind(language: CodeLanguage, kind: &str) -> bool {
    match language {
        CodeLanguage::Rust => matches!(
            kind,
            "line_comment" | "block_comment" | "attribute_item"
        ),
        CodeLanguage::Python => kind == "comment",
    }
}

fn is_method_kind(language: CodeLanguage, kind: &str) -> bool {
    match language {
        CodeLanguage::Rust => kind == "function_item",
        CodeLanguage::Python => matches!(kind, "function_definition" | "decorated_definition"),
    }
}

pub fn chunk_code(
    path: &Path,
    text: &str,
    language: CodeLanguage,
    cfg: &ChunkerConfig,
) -> Result<Vec<Fragment>, ChunkError> {
    let mut parser = Parser::new();
    parser
        .set_language(&ts_language(language))
        .map_err(|e| ChunkError::Parse {
            path: path.to_path_buf(),
            reason: format!("grammar init: {e}"),
        })?;
    let tree = parser.parse(text, None).ok_or_else(|| ChunkError::Parse {
        path: path.to_path_buf(),
        reason: "parser returned no tree".into(),
    })?;
    let root = tree.root_node();

    let (total, errors) = count_nodes(root);
    if total > 0 && errors as f64 / total as f64 > ERROR_THRESHOLD {
        return Err(ChunkError::Parse {
            path: path.to_path_buf(),
            reason: format!("{errors}/{total} error nodes"),
        });
    }

    let mut splitter = Splitter {
        path,
        text,
        lines: text.lines().collect(),
        language,
        cfg,
        fragments: Vec::new(),
        next_free_row: 0,
    };
    splitter.walk_scope(root, None);
    Ok(splitter.fragments)
}

struct Splitter<'a> {
    path: &'a Path,
    text: &'a str,
    lines: Vec<&'a str>,
    language: CodeLanguage,
    cfg: &'a ChunkerConfig,
    fragments: Vec<Fragment>,
    /// First 0-based row not yet covered by an emitted fragment.
    next_free_row: usize,
}

impl<'a> Splitter<'a> {
    /// Walk one scope's children, emitting unit fragments and grouping
    /// the rest into module-scope runs. `container` carries the header
    /// of a split impl/class for method signatures.
    fn walk_scope(&mut self, scope: Node<'a>, container: Option<&str>) {
        let mut cursor = scope.walk();
        // (start_row, nodes) of buffered comments/attributes awaiting an item.
        let mut prefix_start: Option<usize> = None;
        // Start row of an open module-scope run.
        let mut run_start: Option<usize> = None;
        let mut run_end = 0usize;

        for child in scope.named_children(&mut cursor) {
            let kind = child.kind();
            if is_prefix_kind(self.language, kind) {
                prefix_start.get_or_insert(child.start_position().row);
                continue;
            }

            let unit = if container.is_some() {
                is_method_kind(self.language, kind)
            } else {
                is_unit_kind(self.language, kind)
            };

            if unit {
                if let Some(start) = run_start.take() {
                    self.emit_module_run(start, run_end);
                }
                let start = prefix_start.take().unwrap_or(child.start_position().row);
                self.emit_unit(child, start, container);
            } else {
                // Fold any buffered prefix into the module-scope run.
                let start = prefix_start.take().unwrap_or(child.start_position().row);
                run_start.get_or_insert(start);
                run_end = child.end_position().row;
            }
        }

        if let Some(start) = run_start {
            self.emit_module_run(start, run_end);
        } else if let Some(start) = prefix_start {
            // Trailing comments with no following item.
            let end = scope.end_position().row.min(self.lines.len().saturating_sub(1));
            if end >= start {
                self.emit_module_run(start, end);
            }
        }
    }

    fn emit_unit(&mut self, node: Node<'a>, start_row: usize, container: Option<&str>) {
        let end_row = node.end_position().row;
        let line_count = end_row.saturating_sub(node.start_position().row) as u32 + 1;

        let splittable = matches!(
            (self.language, node.kind()),
            (CodeLanguage::Rust, "impl_item") | (CodeLanguage::Python, "class_definition")
        );
        if splittable && line_count > self.cfg.unit_split_lines {
            if let Some(body) = node.child_by_field_name("body") {
                // Header lines (impl/class opener) up to the body are left
                // to the gap tolerance; each method becomes a fragment.
                let header = one_line(self.node_header(node, body));
                self.next_free_row = self.next_free_row.max(start_row);
                self.walk_scope(body, Some(&header));
                self.next_free_row = self.next_free_row.max(end_row + 1);
                return;
            }
        }

        let signature = self.signature_of(node, container);
        let doc = self.doc_between(start_row, node.start_position().row);
        self.push_fragment(start_row, end_row, signature, doc);
    }

    fn emit_module_run(&mut self, start_row: usize, end_row: usize) {
        if end_row < start_row {
            return;
        }
        let first_line = (start_row..=end_row)
            .filter_map(|i| self.lines.get(i))
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .unwrap_or("")
            .to_string();
        self.push_fragment(start_row, end_row, one_line(&first_line), None);
    }

    fn push_fragment(
        &mut self,
        start_row: usize,
        end_row: usize,
        signature: String,
        doc: Option<String>,
    ) {
        let start_row = start_row.max(self.next_free_row);
        if end_row < start_row || start_row >= self.lines.len() {
            return;
        }
        let end_row = end_row.min(self.lines.len() - 1);
        let content = self.lines[start_row..=end_row].join("\n");
        if content.trim().is_empty() {
            return;
        }
        self.next_free_row = end_row + 1;

        let enriched = enrich(&signature, doc.as_deref(), &content);
        let mut fragment = Fragment::new(
            self.path.to_path_buf(),
            (start_row as u32 + 1, end_row as u32 + 1),
            content,
            enriched,
            StructuralMetadata::CodeUnit {
                signature,
                doc,
            },
        );
        if let Some(dep) = detect_deprecation(&fragment.content) {
            fragment.operational.deprecated = Some(dep);
        }
        self.fragments.push(fragment);
    }

    /// Node text from its start up to (not including) `body`.
    fn node_header(&self, node: Node<'a>, body: Node<'a>) -> &'a str {
        self.text[node.start_byte()..body.start_byte()].trim_end_matches([' ', '{', ':', '\n'])
    }

    fn signature_of(&self, node: Node<'a>, container: Option<&str>) -> String {
        // Decorated Python definitions: the signature lives on the inner node.
        let node = if node.kind() == "decorated_definition" {
            node.child_by_field_name("definition").unwrap_or(node)
        } else {
            node
        };
        let raw = match node.child_by_field_name("body") {
            Some(body) => self.node_header(node, body),
            None => self.lines[node.start_position().row],
        };
        let sig = one_line(raw);
        match container {
            Some(header) => format!("{header} :: {sig}"),
            None => sig,
        }
    }

    /// Doc text from comment lines in `[from, to)`.
    fn doc_between(&self, from: usize, to: usize) -> Option<String> {
        let mut doc = String::new();
        for row in from..to {
            let line = self.lines.get(row)?.trim();
            let stripped = line
                .strip_prefix("///")
                .or_else(|| line.strip_prefix("//!"))
                .or_else(|| line.strip_prefix("#").filter(|_| self.language == CodeLanguage::Python));
            if let Some(text) = stripped {
                if !doc.is_empty() {
                    doc.push('\n');
                }
                doc.push_str(text.trim());
            }
        }
        if doc.is_empty() {
            None
        } else {
            Some(doc)
        }
    }
}

/// Collapse internal whitespace runs to single spaces.
fn one_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Detect a deprecation marker in fragment content and extract the
/// replacement reference when one is named.
fn detect_deprecation(content: &str) -> Option<Deprecation> {
    if let Some(attr_pos) = content.find("#[deprecated") {
        let rest = &content[attr_pos..];
        let replacement = rest
            .find("note = \"")
            .or_else(|| rest.find("note=\""))
            .and_then(|i| {
                let after = &rest[i..];
                let open = after.find('"')? + 1;
                let close = after[open..].find('"')?;
                Some(after[open..open + close].to_string())
            });
        return Some(Deprecation { replacement });
    }
    if content.lines().any(|l| l.trim_start().starts_with("@deprecated")) {
        return Some(Deprecation { replacement: None });
    }
    None
}

fn count_nodes(node: Node<'_>) -> (usize, usize) {
    let mut total = 1usize;
    let mut errors = usize::from(node.is_error());
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let (t, e) = count_nodes(child);
        total += t;
        errors += e;
    }
    (total, errors)
}
