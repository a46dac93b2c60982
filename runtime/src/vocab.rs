//! Vocabulary primitives: token ids and allowed-token bitmasks.
//!
//! A [`TokenSet`] is a fixed-capacity bitmask over the vocabulary where bit
//! `i` marks token `i` as allowed. It backs the logit-bias directives a
//! controller hands to the host: hosts that add bias to raw logits can read
//! the packed words directly, and the in-crate driver samples among the set
//! bits.

/// A token id, as assigned by the host tokenizer.
pub type Token = u32;

/// A host-assigned sequence id. Fork groups are lists of these.
pub type SeqId = usize;

const WORD_BITS: usize = 32;

/// An allowed-token mask over a fixed vocabulary.
///
/// Bits past the vocabulary size are always clear, so the packed words can
/// be handed to a host bias buffer without trimming.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSet {
    words: Vec<u32>,
    capacity: usize,
}

impl TokenSet {
    /// Create an empty set for a vocabulary of `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; (capacity + WORD_BITS - 1) / WORD_BITS],
            capacity,
        }
    }

    /// The vocabulary size this set was created for.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mark `token` as allowed.
    ///
    /// Token ids at or past the capacity are a caller bug and panic.
    #[inline]
    pub fn add(&mut self, token: Token) {
        let i = token as usize;
        assert!(i < self.capacity, "token {i} outside vocabulary of {}", self.capacity);
        self.words[i / WORD_BITS] |= 1 << (i % WORD_BITS);
    }

    /// Mark `token` as rejected.
    #[inline]
    pub fn remove(&mut self, token: Token) {
        let i = token as usize;
        if i < self.capacity {
            self.words[i / WORD_BITS] &= !(1 << (i % WORD_BITS));
        }
    }

    /// Whether `token` is allowed. Ids past the capacity are never allowed.
    #[inline]
    pub fn contains(&self, token: Token) -> bool {
        let i = token as usize;
        i < self.capacity && (self.words[i / WORD_BITS] >> (i % WORD_BITS)) & 1 == 1
    }

    /// Allow every token in the vocabulary.
    pub fn fill(&mut self) {
        let full_words = self.capacity / WORD_BITS;
        let remainder = self.capacity % WORD_BITS;
        for word in self.words[..full_words].iter_mut() {
            *word = u32::MAX;
        }
        if remainder > 0 {
            self.words[full_words] = (1u32 << remainder) - 1;
        }
    }

    /// Reject every token.
    pub fn clear(&mut self) {
        for word in self.words.iter_mut() {
            *word = 0;
        }
    }

    /// Number of allowed tokens.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether no token is allowed.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterate the allowed token ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Token> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            (0..WORD_BITS as u32)
                .filter(move |bit| (word >> bit) & 1 == 1)
                .map(move |bit| wi as Token * WORD_BITS as Token + bit)
        })
    }

    /// The lowest allowed token id, if any.
    pub fn first(&self) -> Option<Token> {
        self.iter().next()
    }

    /// The packed `u32` words, bit `i` of word `i / 32` for token `i`.
    pub fn as_words(&self) -> &[u32] {
        &self.words
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("allowed", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
