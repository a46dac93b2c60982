//! Decoding constraints.
//!
//! A [`Constraint`] narrows what the host may sample next. The runtime
//! queries it once per generation step to build the allowed-token mask and
//! feeds every committed token back in, so implementations are simple
//! cursors over their own acceptor state.
//!
//! Regex, substring and grammar acceptors are host-provided (see
//! [`crate::bindings::ConstraintEngines`]); the crate ships the option-set
//! constraint [`OneOf`] and the trivial [`Unconstrained`].

use crate::vocab::{Token, TokenSet};

/// A stateful acceptor over token sequences.
///
/// `allow_tokens` must populate everything samplable right now, including
/// the end-of-sequence token when the constraint can terminate.
pub trait Constraint: Send {
    /// Whether the end-of-sequence token may be sampled now.
    fn eos_allowed(&self) -> bool;

    /// Whether the constraint can accept nothing but end-of-sequence.
    fn eos_forced(&self) -> bool;

    /// Whether `token` may be sampled now.
    fn token_allowed(&self, token: Token) -> bool;

    /// Advance the acceptor past a committed token.
    fn append_token(&mut self, token: Token);

    /// Add every currently samplable token to `set`.
    fn allow_tokens(&self, set: &mut TokenSet);
}

/// Accepts anything; backs plain (selector-free) generation.
pub struct Unconstrained;

impl Constraint for Unconstrained {
    fn eos_allowed(&self) -> bool {
        true
    }

    fn eos_forced(&self) -> bool {
        false
    }

    fn token_allowed(&self, _token: Token) -> bool {
        true
    }

    fn append_token(&mut self, _token: Token) {}

    fn allow_tokens(&self, set: &mut TokenSet) {
        set.fill();
    }
}

/// Accepts exactly one option from a fixed list.
///
/// Options are kept as token sequences sharing a single cursor: at cursor
/// position `ptr`, the tokens at `option[ptr]` of every surviving option
/// are allowed, and end-of-sequence is allowed once a surviving option has
/// been fully matched. Committing a token prunes every option that does
/// not continue with it.
pub struct OneOf {
    options: Vec<Vec<Token>>,
    ptr: usize,
    eos: Token,
}

impl OneOf {
    /// Build from pre-tokenized options and the vocabulary's eos token.
    pub fn new(options: Vec<Vec<Token>>, eos: Token) -> Self {
        Self { options, ptr: 0, eos }
    }

    /// Options still compatible with the tokens committed so far.
    pub fn surviving(&self) -> usize {
        self.options.len()
    }
}

impl Constraint for OneOf {
    fn eos_allowed(&self) -> bool {
        self.options.iter().any(|o| o.len() == self.ptr)
    }

    fn eos_forced(&self) -> bool {
        self.options.len() == 1 && self.options[0].len() == self.ptr
    }

    fn token_allowed(&self, token: Token) -> bool {
        self.options
            .iter()
            .any(|o| self.ptr < o.len() && o[self.ptr] == token)
    }

    fn append_token(&mut self, token: Token) {
        let ptr = self.ptr;
        self.options.retain(|o| ptr < o.len() && o[ptr] == token);
        self.ptr += 1;
    }

    fn allow_tokens(&self, set: &mut TokenSet) {
        for option in &self.options {
            if self.ptr < option.len() {
                set.add(option[self.ptr]);
            }
        }
        if self.eos_allowed() {
            set.add(self.eos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOS: Token = 256;

    fn byte_tokens(text: &str) -> Vec<Token> {
        text.bytes().map(Token::from).collect()
    }

    fn allowed(c: &dyn Constraint) -> Vec<Token> {
        let mut set = TokenSet::new(257);
        c.allow_tokens(&mut set);
        set.iter().collect()
    }

    // -- Option-set behavior ---

    #[test]
    fn first_step_allows_each_first_token() {
        let c = OneOf::new(vec![byte_tokens("cat"), byte_tokens("dog")], EOS);
        assert_eq!(allowed(&c), vec![99, 100]); // 'c', 'd'
        assert!(c.token_allowed(99));
        assert!(c.token_allowed(100));
        assert!(!c.token_allowed(98));
        assert!(!c.eos_allowed());
    }

    #[test]
    fn committing_a_full_option_forces_eos() {
        let mut c = OneOf::new(vec![byte_tokens("cat"), byte_tokens("dog")], EOS);
        for t in byte_tokens("cat") {
            assert!(c.token_allowed(t));
            c.append_token(t);
        }
        assert_eq!(c.surviving(), 1);
        assert!(c.eos_allowed());
        assert!(c.eos_forced());
        assert_eq!(allowed(&c), vec![EOS]);
    }

    #[test]
    fn mismatched_token_prunes_options() {
        let mut c = OneOf::new(vec![byte_tokens("cat"), byte_tokens("car")], EOS);
        c.append_token(99); // 'c'
        c.append_token(97); // 'a'
        assert_eq!(c.surviving(), 2);
        c.append_token(116); // 't'
        assert_eq!(c.surviving(), 1);
        assert!(c.eos_forced());
    }

    #[test]
    fn prefix_option_allows_eos_without_forcing() {
        let mut c = OneOf::new(vec![byte_tokens("a"), byte_tokens("ab")], EOS);
        c.append_token(97); // 'a'
        assert!(c.eos_allowed());
        assert!(!c.eos_forced()); // "ab" can still continue
        assert_eq!(allowed(&c), vec![98, EOS]);
    }

    #[test]
    fn exhausted_options_allow_nothing() {
        let mut c = OneOf::new(vec![byte_tokens("hi")], EOS);
        c.append_token(120); // 'x' matches nothing
        assert_eq!(c.surviving(), 0);
        assert!(allowed(&c).is_empty());
        assert!(!c.eos_allowed());
        assert!(!c.eos_forced());
    }

    // -- Unconstrained ---

    #[test]
    fn unconstrained_allows_the_whole_vocabulary() {
        let c = Unconstrained;
        let mut set = TokenSet::new(257);
        c.allow_tokens(&mut set);
        assert_eq!(set.len(), 257);
        assert!(c.eos_allowed());
        assert!(!c.eos_forced());
        assert!(c.token_allowed(0));
    }
}
