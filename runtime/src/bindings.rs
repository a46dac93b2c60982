//! Host collaborators and the per-sequence binding bundle.
//!
//! The runtime core never talks to a model, a tokenizer implementation or a
//! process boundary directly. Everything it needs from the embedding host
//! arrives through the traits here, packaged per sequence as [`Bindings`].

use std::sync::Arc;

use anyhow::{Result, bail};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;

use crate::constraint::Constraint;
use crate::vocab::{SeqId, Token};

// =============================================================================
// Collaborator traits
// =============================================================================

/// Text to token conversion, provided by the host.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<Token>;
    fn detokenize(&self, tokens: &[Token]) -> Vec<u8>;
}

/// Static vocabulary facts, provided by the host.
pub trait Vocabulary: Send + Sync {
    /// Number of token ids; the capacity of every bias mask.
    fn vocab_size(&self) -> usize;
    /// The end-of-sequence token id.
    fn eos_token(&self) -> Token;
}

/// A process-wide store of named byte values, shared across sequences.
///
/// This is the coordination surface between forked branches: one branch
/// `set`s a variable, another suspends on it via `wait_vars`.
pub trait VarStore: Send + Sync {
    fn get(&self, name: &str) -> Option<Bytes>;
    fn set(&self, name: &str, value: Bytes);
    fn append(&self, name: &str, value: Bytes);
}

/// Factory for host-provided constraint engines.
///
/// Every selector defaults to unsupported; hosts override the ones they
/// actually ship. Construction runs inside the mid-step budget, so
/// expensive compilation belongs here rather than in controller code.
pub trait ConstraintEngines: Send + Sync {
    fn regex(&self, pattern: &str) -> Result<Box<dyn Constraint>> {
        bail!("regex constraint {pattern:?} not supported by this host")
    }

    fn grammar(&self, grammar: &str) -> Result<Box<dyn Constraint>> {
        let _ = grammar;
        bail!("grammar constraints not supported by this host")
    }

    fn substring(&self, text: &str, end: &str) -> Result<Box<dyn Constraint>> {
        let _ = (text, end);
        bail!("substring constraints not supported by this host")
    }
}

/// The default engine set: every selector is rejected.
pub struct NoEngines;

impl ConstraintEngines for NoEngines {}

// =============================================================================
// Bindings bundle
// =============================================================================

/// Everything a sequence's scheduler and controller code need from the host.
#[derive(Clone)]
pub struct Bindings {
    tokenizer: Arc<dyn Tokenizer>,
    vocab: Arc<dyn Vocabulary>,
    vars: Arc<dyn VarStore>,
    engines: Arc<dyn ConstraintEngines>,
    seq_id: SeqId,
}

impl Bindings {
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        vocab: Arc<dyn Vocabulary>,
        vars: Arc<dyn VarStore>,
        seq_id: SeqId,
    ) -> Self {
        Self {
            tokenizer,
            vocab,
            vars,
            engines: Arc::new(NoEngines),
            seq_id,
        }
    }

    /// Replace the constraint-engine factory.
    pub fn with_engines(mut self, engines: Arc<dyn ConstraintEngines>) -> Self {
        self.engines = engines;
        self
    }

    pub fn seq_id(&self) -> SeqId {
        self.seq_id
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn vars(&self) -> &Arc<dyn VarStore> {
        &self.vars
    }

    pub fn engines(&self) -> &Arc<dyn ConstraintEngines> {
        &self.engines
    }

    pub fn tokenize(&self, text: &str) -> Vec<Token> {
        self.tokenizer.tokenize(text)
    }

    pub fn detokenize(&self, tokens: &[Token]) -> Vec<u8> {
        self.tokenizer.detokenize(tokens)
    }

    /// Detokenize to text, replacing invalid UTF-8.
    pub fn text(&self, tokens: &[Token]) -> String {
        String::from_utf8_lossy(&self.tokenizer.detokenize(tokens)).into_owned()
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.vocab_size()
    }

    pub fn eos_token(&self) -> Token {
        self.vocab.eos_token()
    }
}

// =============================================================================
// In-memory variable store
// =============================================================================

/// The in-process [`VarStore`]: a concurrent map of byte values.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored variables.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl VarStore for MemoryStore {
    fn get(&self, name: &str) -> Option<Bytes> {
        self.entries.get(name).map(|v| v.clone())
    }

    fn set(&self, name: &str, value: Bytes) {
        self.entries.insert(name.to_owned(), value);
    }

    fn append(&self, name: &str, value: Bytes) {
        match self.entries.entry(name.to_owned()) {
            dashmap::Entry::Occupied(mut existing) => {
                let mut grown = BytesMut::with_capacity(existing.get().len() + value.len());
                grown.extend_from_slice(existing.get());
                grown.extend_from_slice(&value);
                existing.insert(grown.freeze());
            }
            dashmap::Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("x"), None);
        store.set("x", Bytes::from_static(b"hello"));
        assert_eq!(store.get("x"), Some(Bytes::from_static(b"hello")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn append_concatenates() {
        let store = MemoryStore::new();
        store.append("log", Bytes::from_static(b"a"));
        store.append("log", Bytes::from_static(b"bc"));
        assert_eq!(store.get("log"), Some(Bytes::from_static(b"abc")));
    }

    #[test]
    fn set_overwrites() {
        let store = MemoryStore::new();
        store.set("x", Bytes::from_static(b"one"));
        store.set("x", Bytes::from_static(b"two"));
        assert_eq!(store.get("x"), Some(Bytes::from_static(b"two")));
    }

    #[test]
    fn default_engines_reject_selectors() {
        let engines = NoEngines;
        assert!(engines.regex("a|b").is_err());
        assert!(engines.grammar("start: 'x'").is_err());
        assert!(engines.substring("text", "\"").is_err());
    }
}
