//! The controller-side handle.
//!
//! A [`Ctrl`] is what a controller program receives when its scheduler is
//! launched. Every await point in controller code goes through it: awaiting
//! the prompt, committing fixed text, forking, waiting on shared variables
//! and the generation loop in [`crate::generate`]. The handle also exposes
//! synchronous reads of the transcript and the variable store.
//!
//! All async methods suspend the program until the host steps the sequence
//! far enough to resolve the underlying step request. At most one of them
//! may be in flight at a time; awaiting two concurrently is a protocol
//! violation that poisons the sequence.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use anyhow::{Result, bail, ensure};
use bytes::Bytes;

use crate::bindings::Bindings;
use crate::error::ProtocolError;
use crate::scheduler::{Gate, PromptGate, Shared, lock_shared};
use crate::step::{Label, StepOutcome, StepRequest};
use crate::vocab::{SeqId, Token};

/// Controller-visible handle to one sequence's scheduler state.
#[derive(Clone)]
pub struct Ctrl {
    shared: Arc<Mutex<Shared>>,
}

impl Ctrl {
    pub(crate) fn new(shared: Arc<Mutex<Shared>>) -> Self {
        Self { shared }
    }

    // -------------------------------------------------------------------------
    // Suspension points
    // -------------------------------------------------------------------------

    /// Await the host prompt.
    ///
    /// Code before this call runs under the generous prompt-acquisition
    /// budget. Once the prompt has been initialized, the recorded prompt is
    /// returned immediately.
    pub async fn prompt(&self) -> Result<Vec<Token>> {
        let gate = {
            let mut sh = lock_shared(&self.shared);
            if sh.prompt_ready {
                return Ok(sh.transcript[..sh.prompt_len].to_vec());
            }
            sh.register_prompt()?
        };
        Ok(PromptResolution { gate }.await)
    }

    /// Commit `text` verbatim as the next tokens of the sequence.
    ///
    /// Returns the committed tokens.
    pub async fn fill(&self, text: &str) -> Result<Vec<Token>> {
        let tokens = self.tokenize(text);
        let outcome = self.step(StepRequest::fixed(tokens, None)).await?;
        Ok(outcome.tokens)
    }

    /// Replace everything generated since `label` with `text`.
    pub async fn splice(&self, label: Label, text: &str) -> Result<Vec<Token>> {
        let tokens = self.tokenize(text);
        let outcome = self.step(StepRequest::fixed(tokens, Some(label))).await?;
        Ok(outcome.tokens)
    }

    /// Ask the sequence to terminate. Awaiting this never returns normally
    /// before the host stops stepping; it is only useful as the last await
    /// of a program that wants an explicit stop over the implicit tail.
    pub async fn stop(&self) -> Result<Vec<Token>> {
        let outcome = self.step(StepRequest::stop()).await?;
        Ok(outcome.tokens)
    }

    /// Fork the sequence into `branches` parallel continuations.
    ///
    /// Resolves with this branch's index within the fork group the host
    /// returned. `fork(1)` is a legal no-op that resolves to 0.
    pub async fn fork(&self, branches: usize) -> Result<usize> {
        ensure!(branches >= 1, "fork requires at least one branch");
        let outcome = self.step(StepRequest::fork(branches)).await?;
        let own = self.seq_id();
        let index = outcome
            .fork_group
            .iter()
            .position(|&id| id == own)
            .ok_or(ProtocolError::MissingFromForkGroup { seq_id: own })?;
        Ok(index)
    }

    /// Suspend until every named variable exists, then return their values
    /// in name order.
    pub async fn wait_vars(&self, names: &[&str]) -> Result<Vec<Bytes>> {
        let names = names.iter().map(|n| (*n).to_owned()).collect();
        let outcome = self.step(StepRequest::wait_vars(names)).await?;
        Ok(outcome.values)
    }

    /// Register `request` and suspend until the scheduler resolves it.
    pub(crate) async fn step(&self, request: StepRequest) -> Result<StepOutcome> {
        let gate = lock_shared(&self.shared).register(request)?;
        Ok(Resolution { gate }.await)
    }

    // -------------------------------------------------------------------------
    // Transcript and labels
    // -------------------------------------------------------------------------

    /// Record the current transcript position.
    pub fn label(&self) -> Label {
        Label::at(lock_shared(&self.shared).transcript.len())
    }

    /// The full transcript: prompt plus everything committed since.
    pub fn tokens(&self) -> Vec<Token> {
        lock_shared(&self.shared).transcript.clone()
    }

    pub fn prompt_len(&self) -> usize {
        lock_shared(&self.shared).prompt_len
    }

    /// Tokens committed since `label` was taken.
    pub fn tokens_since(&self, label: Label) -> Vec<Token> {
        let sh = lock_shared(&self.shared);
        let from = label.position().min(sh.transcript.len());
        sh.transcript[from..].to_vec()
    }

    /// Text committed since `label` was taken.
    pub fn text_since(&self, label: Label) -> String {
        let tokens = self.tokens_since(label);
        self.text(&tokens)
    }

    // -------------------------------------------------------------------------
    // Host bindings
    // -------------------------------------------------------------------------

    pub(crate) fn bindings(&self) -> Bindings {
        lock_shared(&self.shared).bindings.clone()
    }

    pub fn tokenize(&self, text: &str) -> Vec<Token> {
        lock_shared(&self.shared).bindings.tokenize(text)
    }

    pub fn detokenize(&self, tokens: &[Token]) -> Vec<u8> {
        lock_shared(&self.shared).bindings.detokenize(tokens)
    }

    /// Detokenize to text, replacing invalid UTF-8.
    pub fn text(&self, tokens: &[Token]) -> String {
        lock_shared(&self.shared).bindings.text(tokens)
    }

    pub fn eos_token(&self) -> Token {
        lock_shared(&self.shared).bindings.eos_token()
    }

    pub fn seq_id(&self) -> SeqId {
        lock_shared(&self.shared).bindings.seq_id()
    }

    // -------------------------------------------------------------------------
    // Shared variables
    // -------------------------------------------------------------------------

    pub fn get_var(&self, name: &str) -> Option<Bytes> {
        lock_shared(&self.shared).bindings.vars().get(name)
    }

    pub fn set_var(&self, name: &str, value: impl Into<Bytes>) {
        lock_shared(&self.shared).bindings.vars().set(name, value.into());
    }

    pub fn append_var(&self, name: &str, value: impl Into<Bytes>) {
        lock_shared(&self.shared)
            .bindings
            .vars()
            .append(name, value.into());
    }

    /// Assert that `name` is set to exactly `expected`.
    pub fn check_var(&self, name: &str, expected: &str) -> Result<()> {
        let Some(value) = self.get_var(name) else {
            bail!("variable {name:?} is unset");
        };
        let actual = String::from_utf8_lossy(&value);
        if actual != expected {
            bail!("variable {name:?}: {actual:?} != {expected:?}");
        }
        Ok(())
    }

    /// [`Ctrl::check_var`] over several name/value pairs.
    pub fn check_vars(&self, expected: &[(&str, &str)]) -> Result<()> {
        for (name, value) in expected {
            self.check_var(name, value)?;
        }
        Ok(())
    }

    /// The fault poisoning this sequence, if any.
    pub fn fault(&self) -> Option<ProtocolError> {
        lock_shared(&self.shared).fault.clone()
    }
}

// =============================================================================
// Resolution futures
// =============================================================================

/// Awaits a step request's resume gate.
///
/// The scheduler fills the gate and then polls the program, so a pending
/// poll never needs a real waker.
struct Resolution {
    gate: Gate,
}

impl Future for Resolution {
    type Output = StepOutcome;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<StepOutcome> {
        let mut cell = self.gate.lock().expect("resume gate poisoned");
        match cell.outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

/// Awaits the prompt gate.
struct PromptResolution {
    gate: PromptGate,
}

impl Future for PromptResolution {
    type Output = Vec<Token>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Vec<Token>> {
        let mut cell = self.gate.lock().expect("prompt gate poisoned");
        match cell.take() {
            Some(tokens) => Poll::Ready(tokens),
            None => Poll::Pending,
        }
    }
}
