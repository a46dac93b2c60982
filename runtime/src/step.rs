//! Step requests and phase decisions.
//!
//! A step request is what controller code suspends on: a description of
//! what the host should do over the next generation step. Each variant
//! answers the three protocol phases itself; the scheduler only sequences
//! them. Requests are consumed by resolution — controller code gets a
//! [`StepOutcome`] back and issues a fresh request for the next step.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::bindings::Bindings;
use crate::constraint::Constraint;
use crate::error::ProtocolError;
use crate::vocab::{SeqId, Token, TokenSet};

// =============================================================================
// Phase decisions
// =============================================================================

/// What a request wants from the host before scheduling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreDecision {
    /// Schedule this sequence normally.
    Continue,
    /// Leave the sequence out of this step entirely.
    Suspend,
    /// Split the sequence into `n` branches.
    Fork(usize),
    /// Advisory: these literal tokens will be committed, no sampling needed.
    FastForward(Vec<Token>),
}

/// What a request decides once the sequence is scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidDecision {
    /// Terminate the sequence.
    Stop,
    /// This request produces no sampling work; the scheduler must resolve
    /// it and re-enter with the next request in the same step. Never
    /// reaches the host.
    Skip,
    /// Sample one token under this allowed-token mask.
    Bias(TokenSet),
    /// Drop `backtrack` tokens from the transcript tail, then append
    /// `tokens` verbatim.
    Splice { backtrack: usize, tokens: Vec<Token> },
}

/// The host-facing step directive: [`MidDecision`] with Skip absorbed away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDirective {
    Stop,
    SampleWithBias(TokenSet),
    Splice { backtrack: usize, tokens: Vec<Token> },
}

/// Whether the sequence continues after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostDecision {
    Continue,
    Stop,
}

impl PostDecision {
    /// Stop iff the step produced the end-of-sequence token.
    pub fn from_tokens(tokens: &[Token], eos: Token) -> Self {
        if tokens.contains(&eos) {
            PostDecision::Stop
        } else {
            PostDecision::Continue
        }
    }
}

// =============================================================================
// Labels
// =============================================================================

/// A recorded transcript position, used to rewrite from that point later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label {
    position: usize,
}

impl Label {
    pub(crate) fn at(position: usize) -> Self {
        Self { position }
    }

    /// Transcript length at the moment the label was taken.
    pub fn position(&self) -> usize {
        self.position
    }
}

// =============================================================================
// Resolution outcome
// =============================================================================

/// What an awaited request resolves to.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// Tokens the host actually appended this step (empty for requests
    /// absorbed mid-step).
    pub tokens: Vec<Token>,
    /// The fork group, for fork requests: every branch's sequence id.
    pub fork_group: Vec<SeqId>,
    /// Captured variable values, for wait-vars requests, in name order.
    pub values: Vec<Bytes>,
    /// Whether the request considers its generation finished (eos seen or
    /// the constraint forces eos).
    pub finished: bool,
}

// =============================================================================
// Lazily built constraints
// =============================================================================

/// Builds a boxed [`Constraint`].
pub type ConstraintFactory = Box<dyn FnOnce() -> anyhow::Result<Box<dyn Constraint>> + Send>;

/// A constraint cell shared by every request of one generation loop.
///
/// Construction is deferred to the first mid-step so its cost lands inside
/// the mid-step budget; a failed build is sticky and poisons the sequence.
#[derive(Clone)]
pub(crate) struct LazyConstraint {
    cell: Arc<Mutex<LazyState>>,
}

enum LazyState {
    Unbuilt(ConstraintFactory),
    Ready(Box<dyn Constraint>),
    Failed(String),
}

impl LazyConstraint {
    pub fn new(factory: ConstraintFactory) -> Self {
        Self {
            cell: Arc::new(Mutex::new(LazyState::Unbuilt(factory))),
        }
    }

    /// Run `f` against the constraint, building it first if needed.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn Constraint) -> R) -> Result<R, ProtocolError> {
        let mut state = self.cell.lock().expect("constraint cell poisoned");
        let next = match std::mem::replace(&mut *state, LazyState::Failed(String::new())) {
            LazyState::Unbuilt(factory) => match factory() {
                Ok(built) => LazyState::Ready(built),
                Err(err) => LazyState::Failed(format!("{err:#}")),
            },
            other => other,
        };
        *state = next;
        match &mut *state {
            LazyState::Ready(constraint) => Ok(f(constraint.as_mut())),
            LazyState::Failed(message) => Err(ProtocolError::ConstraintFailed {
                message: message.clone(),
            }),
            LazyState::Unbuilt(_) => unreachable!(),
        }
    }
}

// =============================================================================
// Step requests
// =============================================================================

/// The closed set of request variants.
pub(crate) enum RequestKind {
    /// Commit literal tokens, optionally rewriting from a label.
    Fixed {
        tokens: Vec<Token>,
        following: Option<Label>,
    },
    /// Terminate the sequence.
    Stop,
    /// Sample under a lazily built constraint.
    Constrained { constraint: LazyConstraint },
    /// Split into branches; resolves with the fork group.
    Fork { branches: usize },
    /// Park until every named variable exists; resolves with the values.
    WaitVars {
        names: Vec<String>,
        values: Vec<Bytes>,
    },
}

/// One outstanding unit of work against the host.
pub(crate) struct StepRequest {
    kind: RequestKind,
    finished: bool,
}

impl StepRequest {
    pub fn fixed(tokens: Vec<Token>, following: Option<Label>) -> Self {
        Self {
            kind: RequestKind::Fixed { tokens, following },
            finished: false,
        }
    }

    pub fn stop() -> Self {
        Self {
            kind: RequestKind::Stop,
            finished: false,
        }
    }

    pub fn constrained(constraint: LazyConstraint) -> Self {
        Self {
            kind: RequestKind::Constrained { constraint },
            finished: false,
        }
    }

    pub fn fork(branches: usize) -> Self {
        Self {
            kind: RequestKind::Fork { branches },
            finished: false,
        }
    }

    pub fn wait_vars(names: Vec<String>) -> Self {
        Self {
            kind: RequestKind::WaitVars {
                names,
                values: Vec::new(),
            },
            finished: false,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            RequestKind::Fixed { .. } => "fixed",
            RequestKind::Stop => "stop",
            RequestKind::Constrained { .. } => "constrained",
            RequestKind::Fork { .. } => "fork",
            RequestKind::WaitVars { .. } => "wait_vars",
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Pre-step handler.
    pub fn pre(&mut self, bindings: &Bindings) -> PreDecision {
        match &mut self.kind {
            RequestKind::Fixed { tokens, following } => {
                if following.is_none() {
                    PreDecision::FastForward(tokens.clone())
                } else {
                    PreDecision::Continue
                }
            }
            RequestKind::Stop | RequestKind::Constrained { .. } => PreDecision::Continue,
            RequestKind::Fork { branches } => PreDecision::Fork(*branches),
            RequestKind::WaitVars { names, values } => {
                let mut captured = Vec::with_capacity(names.len());
                for name in names.iter() {
                    match bindings.vars().get(name) {
                        Some(value) => captured.push(value),
                        None => return PreDecision::Suspend,
                    }
                }
                *values = captured;
                PreDecision::Continue
            }
        }
    }

    /// Mid-step handler. `transcript_len` is the transcript length at entry.
    pub fn mid(
        &mut self,
        bindings: &Bindings,
        transcript_len: usize,
    ) -> Result<MidDecision, ProtocolError> {
        match &mut self.kind {
            RequestKind::Fixed { tokens, following } => {
                let backtrack = match following {
                    Some(label) => transcript_len.checked_sub(label.position()).ok_or(
                        ProtocolError::NegativeBacktrack {
                            label: label.position(),
                            transcript: transcript_len,
                        },
                    )?,
                    None => 0,
                };
                Ok(MidDecision::Splice {
                    backtrack,
                    tokens: tokens.clone(),
                })
            }
            RequestKind::Stop => Ok(MidDecision::Stop),
            RequestKind::Constrained { constraint } => {
                let vocab_size = bindings.vocab_size();
                let set = constraint.with(|c| {
                    let mut set = TokenSet::new(vocab_size);
                    c.allow_tokens(&mut set);
                    set
                })?;
                Ok(MidDecision::Bias(set))
            }
            RequestKind::Fork { .. } | RequestKind::WaitVars { .. } => Ok(MidDecision::Skip),
        }
    }

    /// Post-step handler, invoked after the transcript was updated.
    pub fn post(&mut self, eos: Token, tokens: &[Token]) -> Result<PostDecision, ProtocolError> {
        let mut finished = tokens.contains(&eos);
        let decision = match &mut self.kind {
            RequestKind::Stop => {
                // Never finished: repeated stepping must keep yielding stop
                // instead of silently completing.
                finished = false;
                PostDecision::Stop
            }
            RequestKind::Constrained { constraint } => {
                let forced = constraint.with(|c| {
                    for &t in tokens {
                        c.append_token(t);
                    }
                    c.eos_forced()
                })?;
                if forced {
                    finished = true;
                }
                PostDecision::Continue
            }
            RequestKind::Fixed { .. } | RequestKind::Fork { .. } | RequestKind::WaitVars { .. } => {
                PostDecision::Continue
            }
        };
        self.finished = finished;
        Ok(decision)
    }

    /// Move captured wait-vars values out for the resolution outcome.
    pub fn take_values(&mut self) -> Vec<Bytes> {
        match &mut self.kind {
            RequestKind::WaitVars { values, .. } => std::mem::take(values),
            _ => Vec::new(),
        }
    }
}
