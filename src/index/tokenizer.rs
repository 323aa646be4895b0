//! Identifier-aware tokenization shared by the lexical index, the hash
//! embedder, and the overlap re-ranker.
//!
//! Each identifier is indexed whole and as its sub-words, so a query for
//! `connect` matches `connect_pool` and `connectPool` while an exact
//! `connect_pool` query still scores the whole identifier.

use tantivy::tokenizer::{Token, TokenStream, Tokenizer};

/// Longest token the index will accept. Minified blobs can contain
/// megabyte "identifiers"; skip them.
const MAX_TOKEN_LEN: usize = 80;

/// Lowercased tokens for `text`: whole identifiers plus sub-words split
/// on `_`, case boundaries, and digit boundaries.
pub fn code_tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
        if word.is_empty() || word.len() > MAX_TOKEN_LEN {
            continue;
        }
        let whole = word.to_lowercase();
        let subs = split_subwords(word);
        if subs.len() > 1 {
            out.push(whole);
            out.extend(subs);
        } else {
            out.push(whole);
        }
    }
    out
}

/// Lowercased sub-words of one identifier.
fn split_subwords(word: &str) -> Vec<String> {
    let mut subs = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;
    for c in word.chars() {
        let boundary = match (prev, c) {
            (_, '_') => true,
            (Some(p), c) if p.is_lowercase() && c.is_uppercase() => true,
            (Some(p), c) if p.is_alphabetic() && c.is_ascii_digit() => true,
            (Some(p), c) if p.is_ascii_digit() && c.is_alphabetic() => true,
            _ => false,
        };
        if boundary && !current.is_empty() {
            subs.push(current.to_lowercase());
            current.clear();
        }
        if c != '_' {
            current.push(c);
        }
        prev = Some(c);
    }
    if !current.is_empty() {
        subs.push(current.to_lowercase());
    }
    subs
}

/// Tantivy tokenizer producing [`code_tokens`]-style output. Sub-words
/// share the position of their parent identifier so phrase queries over
/// whole identifiers still work.
#[derive(Clone, Default)]
pub struct CodeTokenizer;

pub struct CodeTokenStream {
    tokens: Vec<Token>,
    index: usize,
}

impl Tokenizer for CodeTokenizer {
    type TokenStream<'a> = CodeTokenStream;

    fn token_stream<'a>(&'a mut self, text: &'a str) -> CodeTokenStream {
        let mut tokens = Vec::new();
        let mut position = 0usize;
        let mut word_start: Option<usize> = None;
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for (byte, c) in text.char_indices() {
            if c.is_alphanumeric() || c == '_' {
                word_start.get_or_insert(byte);
            } else if let Some(start) = word_start.take() {
                spans.push((start, byte));
            }
        }
        if let Some(start) = word_start {
            spans.push((start, text.len()));
        }
        for (start, end) in spans {
            let word = &text[start..end];
            if word.len() > MAX_TOKEN_LEN {
                continue;
            }
            tokens.push(Token {
                offset_from: start,
                offset_to: end,
                position,
                text: word.to_lowercase(),
                position_length: 1,
            });
            let subs = split_subwords(word);
            if subs.len() > 1 {
                for sub in subs {
                    tokens.push(Token {
                        offset_from: start,
                        offset_to: end,
                        position,
                        text: sub,
                        position_length: 1,
                    });
                }
            }
            position += 1;
        }
        CodeTokenStream { tokens, index: 0 }
    }
}

impl TokenStream for CodeTokenStream {
    fn advance(&mut self) -> bool {
        if self.index < self.tokens.len() {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn token(&self) -> &Token {
        &self.tokens[self.index - 1]
    }

    fn token_mut(&mut self) -> &mut Token {
        &mut self.tokens[self.index - 1]
    }
}
