//! Byte-level tokenizer for tests and demos.
//!
//! Every byte is its own token id, with two reserved ids above the byte
//! range: end-of-sequence and the single-token placeholder glyph. Round
//! trips are exact, which keeps transcript assertions readable.

use crate::bindings::{Tokenizer, Vocabulary};
use crate::vocab::Token;

/// End-of-sequence token id.
pub const EOS: Token = 256;
/// Dedicated id for the scheduler's placeholder glyph '░'.
pub const PLACEHOLDER: Token = 257;
/// Vocabulary size: 256 byte tokens plus the two reserved ids.
pub const VOCAB_SIZE: usize = 258;

/// The placeholder glyph, mapped to [`PLACEHOLDER`] as a single token.
pub const PLACEHOLDER_TEXT: char = '░';

/// A tokenizer where bytes are tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::with_capacity(text.len());
        for ch in text.chars() {
            if ch == PLACEHOLDER_TEXT {
                tokens.push(PLACEHOLDER);
            } else {
                let mut buf = [0u8; 4];
                for byte in ch.encode_utf8(&mut buf).bytes() {
                    tokens.push(Token::from(byte));
                }
            }
        }
        tokens
    }

    fn detokenize(&self, tokens: &[Token]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(tokens.len());
        for &t in tokens {
            if t < 256 {
                bytes.push(t as u8);
            } else if t == PLACEHOLDER {
                bytes.extend_from_slice(PLACEHOLDER_TEXT.to_string().as_bytes());
            }
            // EOS and out-of-vocabulary ids render as nothing.
        }
        bytes
    }
}

impl Vocabulary for ByteTokenizer {
    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn eos_token(&self) -> Token {
        EOS
    }
}
