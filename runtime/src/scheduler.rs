//! Per-sequence controller scheduler.
//!
//! The scheduler owns one controller program (a plain async function) and
//! adapts it to the host's three-phase step protocol. Controller code only
//! ever suspends on step requests; resolving a request runs the program
//! synchronously to its next suspension on the caller's thread. The
//! scheduler polls the program future manually with a no-op waker, so there
//! is no executor involved — a sequence's controller advances exactly when
//! the host steps it.
//!
//! The outstanding request lives in an explicit slot state machine. At most
//! one request is ever outstanding; mid-step "skip" results are absorbed
//! here by resolving the pass-through request and re-entering with whatever
//! the program issues next, substituting a single placeholder token when
//! that successor suspends.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::task::noop_waker;

use crate::bindings::Bindings;
use crate::ctrl::Ctrl;
use crate::error::ProtocolError;
use crate::step::{MidDecision, PostDecision, PreDecision, StepDirective, StepOutcome, StepRequest};
use crate::vocab::{SeqId, Token};

/// Placeholder committed when a suspended request surfaces inside the
/// mid-step absorption loop. Must tokenize to exactly one token.
pub const DEFAULT_PLACEHOLDER: &str = "░";

/// Iteration bound for the mid-step absorption loop. A finite chain of
/// pass-through requests terminates structurally; the bound turns an
/// infinite chain into a fault instead of a hung host thread.
pub const SKIP_LIMIT: usize = 4096;

// =============================================================================
// Resume gates
// =============================================================================

/// One-shot cell a resolved request's outcome travels through.
#[derive(Default)]
pub(crate) struct GateCell {
    pub outcome: Option<StepOutcome>,
}

pub(crate) type Gate = Arc<Mutex<GateCell>>;

/// One-shot cell for the initial prompt.
pub(crate) type PromptGate = Arc<Mutex<Option<Vec<Token>>>>;

// =============================================================================
// Outstanding-request state machine
// =============================================================================

/// A registered request plus its resolution plumbing.
pub(crate) struct Pending {
    pub request: StepRequest,
    /// Where the outcome goes. `None` for scheduler-installed requests
    /// (stop tails, placeholders) that no controller awaits.
    pub gate: Option<Gate>,
    /// Fork group last passed by the host, echoed into the outcome.
    pub fork_group: Vec<SeqId>,
}

impl Pending {
    fn internal(request: StepRequest) -> Self {
        Self {
            request,
            gate: None,
            fork_group: Vec::new(),
        }
    }

    fn into_parts(mut self, tokens: Vec<Token>) -> (Option<Gate>, StepOutcome) {
        let outcome = StepOutcome {
            tokens,
            fork_group: std::mem::take(&mut self.fork_group),
            values: self.request.take_values(),
            finished: self.request.is_finished(),
        };
        (self.gate, outcome)
    }
}

/// Every state the per-sequence request slot can be in.
enum Slot {
    /// Nothing outstanding. Legal only between a resolution and the next
    /// suspension, or once the program has completed.
    Idle,
    /// The program awaits the host prompt.
    AwaitingPrompt(PromptGate),
    /// One request outstanding.
    Outstanding(Pending),
    /// A placeholder request is active for the rest of this step while the
    /// real (suspended) request sits parked.
    Deferred { active: Pending, parked: Pending },
}

// =============================================================================
// Shared state
// =============================================================================

/// State shared between the scheduler and the controller-side handle.
pub(crate) struct Shared {
    pub bindings: Bindings,
    pub transcript: Vec<Token>,
    pub prompt_len: usize,
    pub prompt_ready: bool,
    pub fault: Option<ProtocolError>,
    slot: Slot,
}

impl Shared {
    /// Record the first fault and return the one that stands.
    pub fn poison(&mut self, err: ProtocolError) -> ProtocolError {
        self.fault.get_or_insert(err).clone()
    }

    /// Register a controller-issued request. Called from [`Ctrl`].
    pub fn register(&mut self, request: StepRequest) -> Result<Gate, ProtocolError> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        if !matches!(self.slot, Slot::Idle) {
            return Err(self.poison(ProtocolError::RequestAlreadyPending));
        }
        let gate = Gate::default();
        self.slot = Slot::Outstanding(Pending {
            request,
            gate: Some(gate.clone()),
            fork_group: Vec::new(),
        });
        Ok(gate)
    }

    /// Register the program's get-prompt suspension. Called from [`Ctrl`].
    pub fn register_prompt(&mut self) -> Result<PromptGate, ProtocolError> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        if !matches!(self.slot, Slot::Idle) {
            return Err(self.poison(ProtocolError::RequestAlreadyPending));
        }
        let gate = PromptGate::default();
        self.slot = Slot::AwaitingPrompt(gate.clone());
        Ok(gate)
    }
}

pub(crate) fn lock_shared(shared: &Arc<Mutex<Shared>>) -> MutexGuard<'_, Shared> {
    shared.lock().expect("scheduler state poisoned")
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives one controller program against the host step protocol.
///
/// Construction runs the program to its first suspension, which must be a
/// get-prompt or step request. The host then calls [`Scheduler::init_prompt`]
/// once, followed by [`Scheduler::pre_step`], [`Scheduler::mid_step`] and
/// [`Scheduler::post_step`] once per generation step. Any
/// [`ProtocolError`] poisons the sequence permanently.
pub struct Scheduler {
    shared: Arc<Mutex<Shared>>,
    program: Option<BoxFuture<'static, anyhow::Result<()>>>,
    placeholder: Vec<Token>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("placeholder", &self.placeholder)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Start `program` for a sequence and run it to its first suspension.
    pub fn launch<F, Fut>(bindings: Bindings, program: F) -> Result<Self, ProtocolError>
    where
        F: FnOnce(Ctrl) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::launch_with(bindings, DEFAULT_PLACEHOLDER, program)
    }

    /// [`Scheduler::launch`] with a custom placeholder glyph.
    pub fn launch_with<F, Fut>(
        bindings: Bindings,
        placeholder_text: &str,
        program: F,
    ) -> Result<Self, ProtocolError>
    where
        F: FnOnce(Ctrl) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let placeholder = bindings.tokenize(placeholder_text);
        if placeholder.len() != 1 {
            return Err(ProtocolError::PlaceholderNotSingleToken {
                count: placeholder.len(),
            });
        }
        let seq_id = bindings.seq_id();
        let shared = Arc::new(Mutex::new(Shared {
            bindings,
            transcript: Vec::new(),
            prompt_len: 0,
            prompt_ready: false,
            fault: None,
            slot: Slot::Idle,
        }));
        let future = program(Ctrl::new(shared.clone())).boxed();
        let mut scheduler = Self {
            shared,
            program: Some(future),
            placeholder,
        };
        scheduler.poll_program();

        let mut sh = lock_shared(&scheduler.shared);
        if let Some(fault) = &sh.fault {
            return Err(fault.clone());
        }
        match &sh.slot {
            Slot::AwaitingPrompt(_) | Slot::Outstanding(_) => {}
            Slot::Idle if scheduler.program.is_none() => {
                tracing::debug!(seq_id, "controller completed without issuing requests");
            }
            Slot::Idle => {
                return Err(sh.poison(ProtocolError::NoOutstandingRequest { phase: "launch" }));
            }
            Slot::Deferred { .. } => {
                return Err(sh.poison(ProtocolError::StateOutOfOrder { phase: "launch" }));
            }
        }
        drop(sh);
        Ok(scheduler)
    }

    /// Supply the prompt, seed the transcript and resolve a pending
    /// get-prompt request. Must be called exactly once, before stepping.
    pub fn init_prompt(&mut self, tokens: Vec<Token>) -> Result<(), ProtocolError> {
        let prompt_gate = {
            let mut sh = lock_shared(&self.shared);
            if let Some(fault) = &sh.fault {
                return Err(fault.clone());
            }
            if sh.prompt_ready {
                return Err(sh.poison(ProtocolError::PromptAlreadyInitialized));
            }
            sh.prompt_ready = true;
            sh.prompt_len = tokens.len();
            sh.transcript = tokens.clone();
            tracing::debug!(
                seq_id = sh.bindings.seq_id(),
                prompt_len = sh.prompt_len,
                "prompt initialized"
            );
            match std::mem::replace(&mut sh.slot, Slot::Idle) {
                Slot::AwaitingPrompt(gate) => Some(gate),
                other => {
                    sh.slot = other;
                    None
                }
            }
        };

        if let Some(gate) = prompt_gate {
            *gate.lock().expect("prompt gate poisoned") = Some(tokens);
            self.poll_program();
        }

        let mut sh = lock_shared(&self.shared);
        if let Some(fault) = &sh.fault {
            return Err(fault.clone());
        }
        match &sh.slot {
            Slot::Outstanding(_) => Ok(()),
            Slot::Idle if self.program.is_none() => Ok(()),
            Slot::Idle => Err(sh.poison(ProtocolError::NoOutstandingRequest {
                phase: "init_prompt",
            })),
            Slot::AwaitingPrompt(_) | Slot::Deferred { .. } => {
                Err(sh.poison(ProtocolError::StateOutOfOrder {
                    phase: "init_prompt",
                }))
            }
        }
    }

    /// Pre-step phase: ask the outstanding request how to schedule this
    /// sequence. A finished request is first replaced with a stop tail.
    pub fn pre_step(&mut self) -> Result<PreDecision, ProtocolError> {
        let mut guard = lock_shared(&self.shared);
        let sh = &mut *guard;
        if let Some(fault) = &sh.fault {
            return Err(fault.clone());
        }
        if !sh.prompt_ready {
            return Err(sh.poison(ProtocolError::PromptNotInitialized));
        }
        match &sh.slot {
            Slot::Outstanding(_) => {}
            Slot::Idle if self.program.is_none() => {
                tracing::trace!(seq_id = sh.bindings.seq_id(), "installing stop tail");
                sh.slot = Slot::Outstanding(Pending::internal(StepRequest::stop()));
            }
            Slot::Idle => {
                return Err(sh.poison(ProtocolError::NoOutstandingRequest { phase: "pre_step" }));
            }
            Slot::AwaitingPrompt(_) | Slot::Deferred { .. } => {
                return Err(sh.poison(ProtocolError::StateOutOfOrder { phase: "pre_step" }));
            }
        }
        let Slot::Outstanding(pending) = &mut sh.slot else {
            return Err(sh.poison(ProtocolError::StateOutOfOrder { phase: "pre_step" }));
        };
        if pending.request.is_finished() {
            tracing::trace!(
                seq_id = sh.bindings.seq_id(),
                kind = pending.request.kind_name(),
                "replacing finished request with stop"
            );
            *pending = Pending::internal(StepRequest::stop());
        }
        let decision = pending.request.pre(&sh.bindings);
        tracing::trace!(
            seq_id = sh.bindings.seq_id(),
            kind = pending.request.kind_name(),
            ?decision,
            "pre step"
        );
        Ok(decision)
    }

    /// Mid-step phase: return the host directive for this step, absorbing
    /// any skip results from pass-through requests.
    pub fn mid_step(&mut self, fork_group: &[SeqId]) -> Result<StepDirective, ProtocolError> {
        for _round in 0..SKIP_LIMIT {
            let decision = {
                let mut guard = lock_shared(&self.shared);
                let sh = &mut *guard;
                if let Some(fault) = &sh.fault {
                    return Err(fault.clone());
                }
                if !sh.prompt_ready {
                    return Err(sh.poison(ProtocolError::PromptNotInitialized));
                }
                let transcript_len = sh.transcript.len();
                let pending = match &mut sh.slot {
                    Slot::Outstanding(pending) => pending,
                    Slot::Deferred { active, .. } => active,
                    Slot::Idle | Slot::AwaitingPrompt(_) => {
                        return Err(sh.poison(ProtocolError::NoOutstandingRequest {
                            phase: "mid_step",
                        }));
                    }
                };
                pending.fork_group = fork_group.to_vec();
                match pending.request.mid(&sh.bindings, transcript_len) {
                    Ok(decision) => decision,
                    Err(err) => return Err(sh.poison(err)),
                }
            };

            match decision {
                MidDecision::Stop => return Ok(StepDirective::Stop),
                MidDecision::Bias(set) => return Ok(StepDirective::SampleWithBias(set)),
                MidDecision::Splice { backtrack, tokens } => {
                    return Ok(StepDirective::Splice { backtrack, tokens });
                }
                MidDecision::Skip => {}
            }

            // Absorb the pass-through: resolve it with no tokens, which runs
            // the program to its next suspension, then vet the successor.
            self.resolve_outstanding(Vec::new())?;

            let mut guard = lock_shared(&self.shared);
            let sh = &mut *guard;
            if let Some(fault) = &sh.fault {
                return Err(fault.clone());
            }
            match &sh.slot {
                Slot::Outstanding(_) => {}
                Slot::Idle if self.program.is_none() => {
                    sh.slot = Slot::Outstanding(Pending::internal(StepRequest::stop()));
                }
                Slot::Idle => {
                    return Err(sh.poison(ProtocolError::NoOutstandingRequest {
                        phase: "mid_step",
                    }));
                }
                Slot::AwaitingPrompt(_) | Slot::Deferred { .. } => {
                    return Err(sh.poison(ProtocolError::StateOutOfOrder { phase: "mid_step" }));
                }
            }
            let Slot::Outstanding(pending) = &mut sh.slot else {
                return Err(sh.poison(ProtocolError::StateOutOfOrder { phase: "mid_step" }));
            };
            match pending.request.pre(&sh.bindings) {
                PreDecision::Fork(branches) if branches > 1 => {
                    return Err(sh.poison(ProtocolError::NestedFork { branches }));
                }
                PreDecision::Suspend => {
                    tracing::debug!(
                        seq_id = sh.bindings.seq_id(),
                        kind = pending.request.kind_name(),
                        "stashing suspended request behind a placeholder token"
                    );
                    let placeholder =
                        Pending::internal(StepRequest::fixed(self.placeholder.clone(), None));
                    match std::mem::replace(&mut sh.slot, Slot::Idle) {
                        Slot::Outstanding(parked) => {
                            sh.slot = Slot::Deferred {
                                active: placeholder,
                                parked,
                            };
                        }
                        other => {
                            sh.slot = other;
                            return Err(sh.poison(ProtocolError::StateOutOfOrder {
                                phase: "mid_step",
                            }));
                        }
                    }
                }
                _ => {}
            }
        }
        let mut sh = lock_shared(&self.shared);
        Err(sh.poison(ProtocolError::SkipLimitExceeded { limit: SKIP_LIMIT }))
    }

    /// Post-step phase: apply the host's committed splice to the
    /// transcript, run the request's post handler, and resolve it — unless
    /// a parked request must first be restored, in which case resolution
    /// waits for a later step.
    pub fn post_step(
        &mut self,
        backtrack: usize,
        tokens: &[Token],
    ) -> Result<PostDecision, ProtocolError> {
        let (decision, resolved) = {
            let mut guard = lock_shared(&self.shared);
            let sh = &mut *guard;
            if let Some(fault) = &sh.fault {
                return Err(fault.clone());
            }
            if !sh.prompt_ready {
                return Err(sh.poison(ProtocolError::PromptNotInitialized));
            }
            let len = sh.transcript.len();
            if backtrack > len {
                return Err(sh.poison(ProtocolError::BacktrackPastStart {
                    backtrack,
                    transcript: len,
                }));
            }
            sh.transcript.truncate(len - backtrack);
            sh.transcript.extend_from_slice(tokens);
            let eos = sh.bindings.eos_token();

            match &mut sh.slot {
                Slot::Outstanding(pending) => {
                    let decision = match pending.request.post(eos, tokens) {
                        Ok(decision) => decision,
                        Err(err) => return Err(sh.poison(err)),
                    };
                    if pending.gate.is_some() {
                        match std::mem::replace(&mut sh.slot, Slot::Idle) {
                            Slot::Outstanding(pending) => (decision, Some(pending)),
                            other => {
                                sh.slot = other;
                                return Err(sh.poison(ProtocolError::StateOutOfOrder {
                                    phase: "post_step",
                                }));
                            }
                        }
                    } else {
                        // A stop tail stays outstanding so repeated stepping
                        // keeps yielding stop.
                        (decision, None)
                    }
                }
                Slot::Deferred { active, .. } => {
                    let decision = match active.request.post(eos, tokens) {
                        Ok(decision) => decision,
                        Err(err) => return Err(sh.poison(err)),
                    };
                    match std::mem::replace(&mut sh.slot, Slot::Idle) {
                        Slot::Deferred { parked, .. } => {
                            tracing::debug!(
                                seq_id = sh.bindings.seq_id(),
                                "restoring stashed request"
                            );
                            sh.slot = Slot::Outstanding(parked);
                            (decision, None)
                        }
                        other => {
                            sh.slot = other;
                            return Err(sh.poison(ProtocolError::StateOutOfOrder {
                                phase: "post_step",
                            }));
                        }
                    }
                }
                Slot::Idle => {
                    return Err(sh.poison(ProtocolError::NoOutstandingRequest {
                        phase: "post_step",
                    }));
                }
                Slot::AwaitingPrompt(_) => {
                    return Err(sh.poison(ProtocolError::StateOutOfOrder { phase: "post_step" }));
                }
            }
        };
        if let Some(pending) = resolved {
            self.deliver(pending, tokens.to_vec())?;
        }
        Ok(decision)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Poll the program future once with a no-op waker.
    fn poll_program(&mut self) {
        let Some(future) = self.program.as_mut() else {
            return;
        };
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Pending => {}
            Poll::Ready(Ok(())) => {
                self.program = None;
                let sh = lock_shared(&self.shared);
                tracing::debug!(seq_id = sh.bindings.seq_id(), "controller program completed");
            }
            Poll::Ready(Err(err)) => {
                self.program = None;
                let message = format!("{err:#}");
                let mut sh = lock_shared(&self.shared);
                let fault = sh.poison(ProtocolError::Program { message });
                tracing::warn!(
                    seq_id = sh.bindings.seq_id(),
                    %fault,
                    "controller program failed"
                );
            }
        }
    }

    /// Take the outstanding request out of the slot and resolve it.
    fn resolve_outstanding(&mut self, tokens: Vec<Token>) -> Result<(), ProtocolError> {
        let pending = {
            let mut sh = lock_shared(&self.shared);
            match std::mem::replace(&mut sh.slot, Slot::Idle) {
                Slot::Outstanding(pending) => pending,
                other => {
                    sh.slot = other;
                    return Err(sh.poison(ProtocolError::StateOutOfOrder { phase: "resolve" }));
                }
            }
        };
        self.deliver(pending, tokens)
    }

    /// Deliver an outcome through a request's gate (if any controller is
    /// awaiting it) and run the program to its next suspension.
    fn deliver(&mut self, pending: Pending, tokens: Vec<Token>) -> Result<(), ProtocolError> {
        let (gate, outcome) = pending.into_parts(tokens);
        let Some(gate) = gate else {
            return Ok(()); // scheduler-installed request: nobody to wake
        };
        {
            let mut cell = gate.lock().expect("resume gate poisoned");
            if cell.outcome.is_some() {
                drop(cell);
                let mut sh = lock_shared(&self.shared);
                return Err(sh.poison(ProtocolError::StaleResolve));
            }
            cell.outcome = Some(outcome);
        }
        self.poll_program();
        let sh = lock_shared(&self.shared);
        match &sh.fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Host-visible state
    // -------------------------------------------------------------------------

    /// The full transcript: prompt plus everything committed since.
    pub fn transcript(&self) -> Vec<Token> {
        lock_shared(&self.shared).transcript.clone()
    }

    pub fn transcript_len(&self) -> usize {
        lock_shared(&self.shared).transcript.len()
    }

    pub fn prompt_len(&self) -> usize {
        lock_shared(&self.shared).prompt_len
    }

    pub fn seq_id(&self) -> SeqId {
        lock_shared(&self.shared).bindings.seq_id()
    }

    /// A clone of this sequence's binding bundle.
    pub fn bindings(&self) -> Bindings {
        lock_shared(&self.shared).bindings.clone()
    }

    /// The recorded fault, if the sequence is poisoned.
    pub fn fault(&self) -> Option<ProtocolError> {
        lock_shared(&self.shared).fault.clone()
    }

    /// Whether the controller program ran to successful completion.
    pub fn program_complete(&self) -> bool {
        self.program.is_none() && self.fault().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::MemoryStore;
    use crate::dummy::ByteTokenizer;

    fn bindings() -> Bindings {
        Bindings::new(
            Arc::new(ByteTokenizer),
            Arc::new(ByteTokenizer),
            Arc::new(MemoryStore::new()),
            7,
        )
    }

    #[test]
    fn launch_rejects_multi_token_placeholder() {
        let err = Scheduler::launch_with(bindings(), "nope", |_ctrl| async { Ok(()) }).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PlaceholderNotSingleToken { count: 4 }
        ));
    }

    #[test]
    fn launch_rejects_foreign_suspension() {
        let err = Scheduler::launch(bindings(), |_ctrl| async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::NoOutstandingRequest { phase: "launch" }
        ));
    }

    #[test]
    fn empty_program_yields_stop_forever() {
        let mut scheduler = Scheduler::launch(bindings(), |_ctrl| async { Ok(()) }).unwrap();
        assert!(scheduler.program_complete());
        scheduler.init_prompt(vec![104, 105]).unwrap();

        for _ in 0..3 {
            assert_eq!(scheduler.pre_step().unwrap(), PreDecision::Continue);
            assert_eq!(scheduler.mid_step(&[7]).unwrap(), StepDirective::Stop);
            // Hosts that keep posting still see stop, forever.
            assert_eq!(scheduler.post_step(0, &[]).unwrap(), PostDecision::Stop);
        }
        assert_eq!(scheduler.transcript(), vec![104, 105]);
    }

    #[test]
    fn stepping_before_the_prompt_is_fatal() {
        let mut scheduler = Scheduler::launch(bindings(), |ctrl| async move {
            ctrl.fill("hi").await?;
            Ok(())
        })
        .unwrap();
        let err = scheduler.pre_step().unwrap_err();
        assert!(matches!(err, ProtocolError::PromptNotInitialized));
        // The fault is sticky.
        assert!(matches!(
            scheduler.init_prompt(vec![]),
            Err(ProtocolError::PromptNotInitialized)
        ));
    }

    #[test]
    fn double_prompt_initialization_is_fatal() {
        let mut scheduler = Scheduler::launch(bindings(), |ctrl| async move {
            ctrl.fill("hi").await?;
            Ok(())
        })
        .unwrap();
        scheduler.init_prompt(vec![1]).unwrap();
        assert!(matches!(
            scheduler.init_prompt(vec![2]),
            Err(ProtocolError::PromptAlreadyInitialized)
        ));
    }

    #[test]
    fn program_error_propagates_as_fault() {
        let mut scheduler = Scheduler::launch(bindings(), |_ctrl| async {
            anyhow::bail!("deliberate failure")
        })
        .unwrap_err();
        // Launch already observes the failure.
        let ProtocolError::Program { message } = &mut scheduler else {
            panic!("expected program fault, got {scheduler:?}");
        };
        assert!(message.contains("deliberate failure"));
    }
}
