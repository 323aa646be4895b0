//! BM25 lexical index over fragment content, backed by tantivy.
//!
//! Documents carry the fragment id as an untokenized term so removal
//! and upsert are `delete_term` + `add_document`. Content is analyzed
//! with the identifier-aware [`CodeTokenizer`], so `connect` matches
//! `connect_pool`. The reader reloads manually after each commit:
//! removals become invisible exactly when [`commit`](LexicalIndex::commit)
//! returns, not at some later polling tick.
//!
//! The on-disk directory embeds the schema version; an incompatible
//! layout gets a fresh directory and a rebuild, never an in-place
//! migration.

use std::path::Path;

use parking_lot::Mutex;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED, STRING,
};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::info;

use crate::model::types::{Fragment, FragmentId};

use super::tokenizer::{code_tokens, CodeTokenizer};
use super::IndexError;

const SCHEMA_VERSION: &str = "v1";
const TOKENIZER_NAME: &str = "code";
const WRITER_BUDGET_BYTES: usize = 50_000_000;

#[derive(Clone, Copy)]
struct Fields {
    fragment_id: Field,
    path: Field,
    kind: Field,
    content: Field,
}

pub struct LexicalIndex {
    index: Index,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    fields: Fields,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalHit {
    pub id: FragmentId,
    pub score: f32,
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_text_field("fragment_id", STRING | STORED);
    builder.add_text_field("path", STRING | STORED);
    builder.add_text_field("kind", STRING | STORED);
    let content_indexing = TextFieldIndexing::default()
        .set_tokenizer(TOKENIZER_NAME)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    builder.add_text_field(
        "content",
        TextOptions::default().set_indexing_options(content_indexing),
    );
    builder.build()
}

fn fields_from_schema(schema: &Schema) -> Result<Fields, IndexError> {
    Ok(Fields {
        fragment_id: schema.get_field("fragment_id")?,
        path: schema.get_field("path")?,
        kind: schema.get_field("kind")?,
        content: schema.get_field("content")?,
    })
}

impl LexicalIndex {
    /// Open (or create) the index under `dir/<schema version>`.
    pub fn open_or_create(dir: &Path) -> Result<Self, IndexError> {
        let versioned = dir.join(SCHEMA_VERSION);
        std::fs::create_dir_all(&versioned).map_err(|source| IndexError::Io {
            path: versioned.clone(),
            source,
        })?;
        let schema = build_schema();
        let index = if versioned.join("meta.json").exists() {
            Index::open_in_dir(&versioned)?
        } else {
            info!(path = %versioned.display(), "creating lexical index");
            Index::create_in_dir(&versioned, schema.clone())?
        };
        Self::finish_open(index, &schema)
    }

    /// RAM-backed index, used by tests and by rebuild staging.
    pub fn in_memory() -> Result<Self, IndexError> {
        let schema = build_schema();
        let index = Index::create_in_ram(schema.clone());
        Self::finish_open(index, &schema)
    }

    fn finish_open(index: Index, schema: &Schema) -> Result<Self, IndexError> {
        index
            .tokenizers()
            .register(TOKENIZER_NAME, CodeTokenizer);
        let writer = Mutex::new(index.writer(WRITER_BUDGET_BYTES)?);
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let fields = fields_from_schema(schema)?;
        Ok(Self {
            index,
            writer,
            reader,
            fields,
        })
    }

    /// Upsert a batch. Not visible until [`commit`](Self::commit).
    pub fn add_fragments(&self, fragments: &[Fragment]) -> Result<(), IndexError> {
        let writer = self.writer.lock();
        for frag in fragments {
            let id_hex = frag.id.to_hex();
            writer.delete_term(Term::from_field_text(self.fields.fragment_id, &id_hex));
            writer.add_document(doc!(
                self.fields.fragment_id => id_hex,
                self.fields.path => frag.source_path.to_string_lossy().into_owned(),
                self.fields.kind => frag.kind().as_str(),
                self.fields.content => frag.enriched_content.clone(),
            ))?;
        }
        Ok(())
    }

    /// Delete a batch. Not visible until [`commit`](Self::commit).
    pub fn remove(&self, ids: &[FragmentId]) {
        let writer = self.writer.lock();
        for id in ids {
            writer.delete_term(Term::from_field_text(self.fields.fragment_id, &id.to_hex()));
        }
    }

    /// Commit pending writes and reload the reader, so the effect of
    /// every prior add/remove is visible to the next search.
    pub fn commit(&self) -> Result<(), IndexError> {
        self.writer.lock().commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// BM25 top-k for a free-text query. The query is tokenized the
    /// same way content is, joined with OR.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<LexicalHit>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let tokens = code_tokens(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let clauses: Vec<(Occur, Box<dyn Query>)> = tokens
            .iter()
            .map(|t| {
                let term = Term::from_field_text(self.fields.content, t);
                let q: Box<dyn Query> =
                    Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
                (Occur::Should, q)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        let searcher = self.reader.searcher();
        let top = searcher.search(&query, &TopDocs::with_limit(k))?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, addr) in top {
            let stored: TantivyDocument = searcher.doc(addr)?;
            let id_hex = stored
                .get_first(self.fields.fragment_id)
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if let Some(id) = FragmentId::from_hex(id_hex) {
                hits.push(LexicalHit { id, score });
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        Ok(hits)
    }

    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::StructuralMetadata;
    use std::path::PathBuf;

    fn fragment(path: &str, line: u32, content: &str) -> Fragment {
        Fragment::new(
            PathBuf::from(path),
            (line, line + 1),
            content.to_string(),
            content.to_string(),
            StructuralMetadata::CodeUnit {
                signature: String::new(),
                doc: None,
            },
        )
    }

    #[test]
    fn finds_exact_identifier() {
        let index = LexicalIndex::in_memory().unwrap();
        let a = fragment("src/db.rs", 1, "fn connect_pool(timeout: u64) -> Pool");
        let b = fragment("src/http.rs", 1, "fn serve_requests(addr: SocketAddr)");
        index.add_fragments(&[a.clone(), b]).unwrap();
        index.commit().unwrap();

        let hits = index.search("connect_pool", 10).unwrap();
        assert_eq!(hits[0].id, a.id);
    }

    #[test]
    fn subword_query_matches_compound_identifier() {
        let index = LexicalIndex::in_memory().unwrap();
        let a = fragment("src/db.rs", 1, "fn connect_pool() {}");
        index.add_fragments(std::slice::from_ref(&a)).unwrap();
        index.commit().unwrap();

        assert!(!index.search("connect", 10).unwrap().is_empty());
        assert!(!index.search("pool", 10).unwrap().is_empty());
    }

    #[test]
    fn removal_is_visible_after_commit() {
        let index = LexicalIndex::in_memory().unwrap();
        let a = fragment("src/db.rs", 1, "fn connect_pool() {}");
        index.add_fragments(std::slice::from_ref(&a)).unwrap();
        index.commit().unwrap();
        assert_eq!(index.search("connect_pool", 10).unwrap().len(), 1);

        index.remove(&[a.id]);
        index.commit().unwrap();
        assert!(index.search("connect_pool", 10).unwrap().is_empty());
        assert_eq!(index.doc_count(), 0);
    }

    #[test]
    fn upsert_replaces_rather_than_duplicates() {
        let index = LexicalIndex::in_memory().unwrap();
        let a = fragment("src/db.rs", 1, "fn connect_pool() {}");
        index.add_fragments(std::slice::from_ref(&a)).unwrap();
        index.add_fragments(std::slice::from_ref(&a)).unwrap();
        index.commit().unwrap();
        assert_eq!(index.search("connect_pool", 10).unwrap().len(), 1);
    }

    #[test]
    fn empty_query_yields_nothing() {
        let index = LexicalIndex::in_memory().unwrap();
        assert!(index.search("", 10).unwrap().is_empty());
        assert!(index.search("!!! ---", 10).unwrap().is_empty());
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let a = fragment("src/db.rs", 1, "fn connect_pool() {}");
        {
            let index = LexicalIndex::open_or_create(dir.path()).unwrap();
            index.add_fragments(std::slice::from_ref(&a)).unwrap();
            index.commit().unwrap();
        }
        let reopened = LexicalIndex::open_or_create(dir.path()).unwrap();
        let hits = reopened.search("connect_pool", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, a.id);
    }
}
