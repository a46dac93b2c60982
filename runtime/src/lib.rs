//! Tiller — controller-side runtime for steered token generation.
//!
//! Controller programs are plain async Rust: they await fixed-text fills,
//! constrained generation, forks and shared variables, and a per-sequence
//! [`Scheduler`] adapts those suspensions to the host engine's
//! pre/mid/post step protocol. The host remains responsible for actually
//! sampling tokens; the runtime decides what it may sample, what to splice
//! and when to stop.
//!
//! The crate also ships a reference [`StepDriver`] host loop, a
//! [`ControllerPool`] of cooperatively stepped sequences, and a byte-level
//! tokenizer under [`dummy`] for tests and demos.

pub mod bindings;
pub mod constraint;
pub mod ctrl;
pub mod driver;
pub mod dummy;
pub mod error;
pub mod generate;
pub mod pool;
pub mod scheduler;
pub mod step;
pub mod vocab;

pub use bindings::{Bindings, ConstraintEngines, MemoryStore, Tokenizer, VarStore, Vocabulary};
pub use constraint::{Constraint, OneOf, Unconstrained};
pub use ctrl::Ctrl;
pub use driver::{
    DriverStatus, FinishReason, Limits, SeqIds, SeqOutput, StepDriver, TokenSampler,
};
pub use error::ProtocolError;
pub use generate::GenParams;
pub use pool::ControllerPool;
pub use scheduler::Scheduler;
pub use step::{Label, PostDecision, PreDecision, StepDirective, StepOutcome};
pub use vocab::{SeqId, Token, TokenSet};
