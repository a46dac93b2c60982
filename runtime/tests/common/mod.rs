//! Shared helpers for the protocol, generation and driver suites.
//!
//! All tests run on the byte-level tokenizer from `tiller::dummy`: every
//! byte is its own token id, eos is 256 and the placeholder glyph is 257,
//! which keeps transcript assertions readable.

use std::sync::Arc;

use tiller::dummy::ByteTokenizer;
use tiller::{Bindings, MemoryStore, Token};

/// Bindings over the byte tokenizer with a private variable store.
pub fn bindings(seq_id: usize) -> Bindings {
    bindings_with(Arc::new(MemoryStore::new()), seq_id)
}

/// Bindings over the byte tokenizer with a shared variable store.
#[allow(dead_code)]
pub fn bindings_with(store: Arc<MemoryStore>, seq_id: usize) -> Bindings {
    Bindings::new(Arc::new(ByteTokenizer), Arc::new(ByteTokenizer), store, seq_id)
}

/// Byte tokens for a literal, mirroring what `ByteTokenizer` produces.
#[allow(dead_code)]
pub fn toks(text: &str) -> Vec<Token> {
    text.bytes().map(Token::from).collect()
}
