//! The controller-visible generation loop.
//!
//! [`GenParams`] selects at most one constraint (an option list in-crate;
//! regex, grammar and substring acceptors via the host's engine factory)
//! plus the stop conditions. [`Ctrl::gen_tokens`] then issues constrained
//! step requests until the token budget runs out, the accumulated text
//! contains the stop substring, or the constraint is satisfied.
//!
//! The constraint is built lazily at the first mid-step, so an expensive
//! engine compilation lands inside the mid-step budget rather than in
//! controller code.

use anyhow::{Result, bail};
use bytes::Bytes;

use crate::constraint::{Constraint, OneOf, Unconstrained};
use crate::ctrl::Ctrl;
use crate::step::{ConstraintFactory, LazyConstraint, StepRequest};
use crate::vocab::Token;

/// Default iteration budget of the generation loop.
pub const DEFAULT_MAX_TOKENS: usize = 20;

/// Parameters for one run of the generation loop.
///
/// At most one of the constraint selectors (`options`, `regex`, `grammar`,
/// `substring`) may be set; giving more than one is rejected before any
/// token is requested.
#[derive(Default)]
pub struct GenParams {
    options: Option<Vec<String>>,
    regex: Option<String>,
    grammar: Option<String>,
    substring: Option<String>,
    substring_end: Option<String>,
    stop_at: Option<String>,
    store_var: Option<String>,
    max_tokens: Option<usize>,
}

impl GenParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constrain the output to one of the given literal strings.
    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = Some(options.into_iter().map(Into::into).collect());
        self
    }

    /// Constrain the output to match a regular expression (host engine).
    pub fn regex(mut self, pattern: impl Into<String>) -> Self {
        self.regex = Some(pattern.into());
        self
    }

    /// Constrain the output to a grammar (host engine).
    pub fn grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = Some(grammar.into());
        self
    }

    /// Constrain the output to a substring of `text` (host engine).
    pub fn substring(mut self, text: impl Into<String>) -> Self {
        self.substring = Some(text.into());
        self
    }

    /// Terminator passed to the substring engine. Defaults to `"`.
    pub fn substring_end(mut self, end: impl Into<String>) -> Self {
        self.substring_end = Some(end.into());
        self
    }

    /// Stop as soon as the accumulated text contains this substring.
    pub fn stop_at(mut self, stop: impl Into<String>) -> Self {
        self.stop_at = Some(stop.into());
        self
    }

    /// Persist the generated text under this variable name on completion.
    pub fn store_var(mut self, name: impl Into<String>) -> Self {
        self.store_var = Some(name.into());
        self
    }

    /// Cap the number of generation steps (default 20).
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Turn the selector into a lazily built constraint, rejecting
    /// ambiguous parameter sets eagerly.
    fn constraint(&mut self, ctrl: &Ctrl) -> Result<LazyConstraint> {
        let selectors = [
            self.options.is_some(),
            self.regex.is_some(),
            self.grammar.is_some(),
            self.substring.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if selectors > 1 {
            bail!("at most one constraint selector may be given, got {selectors}");
        }

        let bindings = ctrl.bindings();
        let factory: ConstraintFactory = if let Some(options) = self.options.take() {
            Box::new(move || {
                let tokenized = options.iter().map(|o| bindings.tokenize(o)).collect();
                let constraint: Box<dyn Constraint> =
                    Box::new(OneOf::new(tokenized, bindings.eos_token()));
                Ok(constraint)
            })
        } else if let Some(pattern) = self.regex.take() {
            Box::new(move || bindings.engines().regex(&pattern))
        } else if let Some(grammar) = self.grammar.take() {
            Box::new(move || bindings.engines().grammar(&grammar))
        } else if let Some(text) = self.substring.take() {
            let end = self.substring_end.take().unwrap_or_else(|| "\"".to_owned());
            Box::new(move || bindings.engines().substring(&text, &end))
        } else {
            Box::new(|| {
                let constraint: Box<dyn Constraint> = Box::new(Unconstrained);
                Ok(constraint)
            })
        };
        Ok(LazyConstraint::new(factory))
    }
}

impl Ctrl {
    /// Generate tokens under `params`, returning everything committed by
    /// the loop (the end-of-sequence token included, when sampled).
    pub async fn gen_tokens(&self, mut params: GenParams) -> Result<Vec<Token>> {
        let constraint = params.constraint(self)?;
        let max_tokens = params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        let mut generated: Vec<Token> = Vec::new();
        for _ in 0..max_tokens {
            let outcome = self
                .step(StepRequest::constrained(constraint.clone()))
                .await?;
            generated.extend_from_slice(&outcome.tokens);
            if let Some(stop) = &params.stop_at {
                if self.text(&generated).contains(stop.as_str()) {
                    break;
                }
            }
            if outcome.finished {
                break;
            }
        }

        if let Some(name) = &params.store_var {
            self.set_var(name, Bytes::from(self.detokenize(&generated)));
        }
        tracing::debug!(
            seq_id = self.seq_id(),
            tokens = generated.len(),
            "generation loop done"
        );
        Ok(generated)
    }

    /// [`Ctrl::gen_tokens`], detokenized to text.
    pub async fn gen_text(&self, params: GenParams) -> Result<String> {
        let tokens = self.gen_tokens(params).await?;
        Ok(self.text(&tokens))
    }
}
