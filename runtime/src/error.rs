//! Fault taxonomy for the step protocol.
//!
//! Every variant here is an unrecoverable, per-sequence programming error:
//! once a scheduler reports one, the sequence is poisoned and every later
//! phase call repeats the original fault. Recoverable conditions (a missing
//! variable, a rejected generation parameter set) never appear here — they
//! surface as ordinary `anyhow` errors inside controller code.

use thiserror::Error;

use crate::vocab::SeqId;

/// Fatal step-protocol violations.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// A phase was invoked before the host supplied the prompt.
    #[error("step phase called before the prompt was initialized")]
    PromptNotInitialized,

    /// `init_prompt` was called a second time.
    #[error("prompt already initialized")]
    PromptAlreadyInitialized,

    /// Controller code tried to register a step request while another one
    /// was still outstanding.
    #[error("a step request is already outstanding")]
    RequestAlreadyPending,

    /// A phase needed an outstanding step request and found none. This is
    /// usually a controller that suspended on a future the runtime does not
    /// know how to resolve.
    #[error("no outstanding step request at {phase}")]
    NoOutstandingRequest { phase: &'static str },

    /// A request surfacing mid-step absorption asked to fork.
    #[error("nested fork not allowed ({branches} branches requested mid-step)")]
    NestedFork { branches: usize },

    /// A fixed-token request targets a label that now lies past the end of
    /// the transcript, which would require a negative backtrack.
    #[error("label at {label} is past the transcript end ({transcript} tokens)")]
    NegativeBacktrack { label: usize, transcript: usize },

    /// The host reported a backtrack larger than the transcript.
    #[error("backtrack of {backtrack} exceeds transcript length {transcript}")]
    BacktrackPastStart { backtrack: usize, transcript: usize },

    /// A step request was resolved twice.
    #[error("step request resolved twice")]
    StaleResolve,

    /// The configured placeholder text does not tokenize to exactly one
    /// token, so the scheduler cannot force a single-token step.
    #[error("placeholder text tokenizes to {count} tokens, expected exactly 1")]
    PlaceholderNotSingleToken { count: usize },

    /// The mid-step absorption loop ran past its iteration bound; the
    /// controller is producing pass-through requests forever.
    #[error("mid-step absorbed {limit} skip results without progress")]
    SkipLimitExceeded { limit: usize },

    /// The host resolved a fork with a group that does not contain the
    /// forking sequence.
    #[error("sequence {seq_id} not present in its own fork group")]
    MissingFromForkGroup { seq_id: SeqId },

    /// Constraint construction or evaluation failed inside a step phase.
    #[error("constraint failed: {message}")]
    ConstraintFailed { message: String },

    /// The controller program itself returned an error or panicked the
    /// runtime contract.
    #[error("controller program failed: {message}")]
    Program { message: String },

    /// The scheduler observed a slot state that is impossible for the
    /// phase being executed.
    #[error("scheduler state out of order at {phase}")]
    StateOutOfOrder { phase: &'static str },
}
