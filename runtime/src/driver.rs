//! Reference host step driver.
//!
//! Production hosts drive schedulers from their own batching loop; this
//! driver exists so the runtime can be embedded, demoed and tested without
//! one. It walks a single scheduler through whole generation steps,
//! sampling under bias masks with a [`TokenSampler`], enforcing the
//! per-phase time budgets from [`Limits`], and classifying how the
//! sequence ended.
//!
//! Fork handling is deliberately shallow: branch ids are allocated (own id
//! first) and recorded, but only the index-0 branch keeps running. Real
//! multi-branch execution belongs to the embedding host.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::scheduler::Scheduler;
use crate::step::{PostDecision, PreDecision, StepDirective};
use crate::vocab::{SeqId, Token, TokenSet};

// =============================================================================
// Sequence id allocation
// =============================================================================

/// A shared allocator of sequence ids, used for spawned sequences and for
/// the branch ids a fork produces.
#[derive(Clone, Default)]
pub struct SeqIds {
    next: Arc<AtomicUsize>,
}

impl SeqIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> SeqId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure future ids land above `id`.
    pub fn reserve_past(&self, id: SeqId) {
        self.next.fetch_max(id + 1, Ordering::Relaxed);
    }
}

// =============================================================================
// Samplers
// =============================================================================

/// Picks one token out of an allowed-token mask.
pub enum TokenSampler {
    /// Always the lowest allowed id. Deterministic.
    Greedy,
    /// Uniform over the allowed set, from a seeded generator.
    Uniform(StdRng),
    /// A fixed script of tokens; each must be allowed when its turn comes.
    Scripted(VecDeque<Token>),
}

impl TokenSampler {
    pub fn uniform(seed: u64) -> Self {
        Self::Uniform(StdRng::seed_from_u64(seed))
    }

    pub fn scripted(tokens: impl IntoIterator<Item = Token>) -> Self {
        Self::Scripted(tokens.into_iter().collect())
    }

    /// Sample one allowed token, or `None` when the mask is empty, the
    /// script ran dry, or the scripted token is not allowed.
    pub fn sample(&mut self, allowed: &TokenSet) -> Option<Token> {
        match self {
            Self::Greedy => allowed.first(),
            Self::Uniform(rng) => {
                let count = allowed.len();
                if count == 0 {
                    None
                } else {
                    allowed.iter().nth(rng.gen_range(0..count))
                }
            }
            Self::Scripted(script) => {
                let token = script.pop_front()?;
                allowed.contains(token).then_some(token)
            }
        }
    }
}

// =============================================================================
// Limits and outputs
// =============================================================================

/// Budgets the driver enforces on a sequence.
///
/// The phase budgets keep the original protocol's 1 : 20 : 1 shape with a
/// generous base unit; prompt initialization gets a one-off allowance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Whole generation steps before the sequence is cut off.
    pub max_steps: usize,
    pub pre_budget_us: u64,
    pub mid_budget_us: u64,
    pub post_budget_us: u64,
    pub init_budget_us: u64,
    /// Consecutive pre-step suspensions before the sequence is declared
    /// deadlocked (a variable nobody will ever set).
    pub max_suspend_streak: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 256,
            pre_budget_us: 10_000,
            mid_budget_us: 200_000,
            post_budget_us: 10_000,
            init_budget_us: 1_000_000,
            max_suspend_streak: 64,
        }
    }
}

/// Why a sequence stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The step committed the end-of-sequence token.
    FoundEos,
    /// The controller issued a stop (or its program completed).
    ControllerStop,
    MaxStepsReached,
    /// The suspend streak ran out; the sequence was waiting forever.
    Deadlock,
    /// A protocol fault, budget overrun or sampler failure.
    Failed,
}

/// Everything a finished sequence reports.
#[derive(Debug, Clone, Serialize)]
pub struct SeqOutput {
    pub seq_id: SeqId,
    pub prompt_len: usize,
    pub transcript: Vec<Token>,
    /// Generated region of the transcript, detokenized.
    pub text: String,
    pub finish_reason: FinishReason,
    pub steps: usize,
    /// Every fork group this sequence produced, own id first.
    pub forks: Vec<Vec<SeqId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Whether the driver wants another [`StepDriver::step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Running,
    Done,
}

// =============================================================================
// Driver
// =============================================================================

/// Drives one scheduler to completion, one whole step at a time.
pub struct StepDriver {
    scheduler: Scheduler,
    sampler: TokenSampler,
    limits: Limits,
    seq_ids: SeqIds,
    eos: Token,
    steps: usize,
    suspend_streak: usize,
    forks: Vec<Vec<SeqId>>,
    finished: Option<FinishReason>,
    error: Option<String>,
}

impl StepDriver {
    pub fn new(scheduler: Scheduler, sampler: TokenSampler) -> Self {
        let eos = scheduler.bindings().eos_token();
        let seq_ids = SeqIds::new();
        seq_ids.reserve_past(scheduler.seq_id());
        Self {
            scheduler,
            sampler,
            limits: Limits::default(),
            seq_ids,
            eos,
            steps: 0,
            suspend_streak: 0,
            forks: Vec::new(),
            finished: None,
            error: None,
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Share a sequence-id allocator, so fork branch ids stay unique
    /// across a pool of sequences.
    pub fn with_seq_ids(mut self, seq_ids: SeqIds) -> Self {
        seq_ids.reserve_past(self.scheduler.seq_id());
        self.seq_ids = seq_ids;
        self
    }

    /// Tokenize and install the prompt, under the init budget.
    pub fn begin(&mut self, prompt: &str) -> DriverStatus {
        let bindings = self.scheduler.bindings();
        let start = Instant::now();
        let tokens = bindings.tokenize(prompt);
        if let Err(err) = self.scheduler.init_prompt(tokens) {
            return self.fail(format!("{err}"));
        }
        self.check_budget(start, self.limits.init_budget_us, "init")
    }

    /// Run one whole pre/mid/post step. Call until it reports done.
    pub fn step(&mut self) -> DriverStatus {
        if self.finished.is_some() {
            return DriverStatus::Done;
        }
        if self.steps >= self.limits.max_steps {
            return self.finish(FinishReason::MaxStepsReached);
        }
        self.steps += 1;

        // Pre phase: scheduling decision.
        let start = Instant::now();
        let pre = match self.scheduler.pre_step() {
            Ok(pre) => pre,
            Err(err) => return self.fail(format!("{err}")),
        };
        if self.check_budget(start, self.limits.pre_budget_us, "pre_step") == DriverStatus::Done {
            return DriverStatus::Done;
        }

        let fork_group = match pre {
            PreDecision::Suspend => {
                self.suspend_streak += 1;
                if self.suspend_streak > self.limits.max_suspend_streak {
                    return self.finish(FinishReason::Deadlock);
                }
                // Not scheduled this step.
                return DriverStatus::Running;
            }
            PreDecision::Fork(branches) => {
                self.suspend_streak = 0;
                let mut group = vec![self.scheduler.seq_id()];
                group.extend((1..branches).map(|_| self.seq_ids.next()));
                tracing::debug!(seq_id = group[0], ?group, "fork requested");
                self.forks.push(group.clone());
                group
            }
            PreDecision::Continue | PreDecision::FastForward(_) => {
                // Fast-forward is advisory; the mid-step splice commits it.
                self.suspend_streak = 0;
                vec![self.scheduler.seq_id()]
            }
        };

        // Mid phase: the step directive.
        let start = Instant::now();
        let directive = match self.scheduler.mid_step(&fork_group) {
            Ok(directive) => directive,
            Err(err) => return self.fail(format!("{err}")),
        };
        if self.check_budget(start, self.limits.mid_budget_us, "mid_step") == DriverStatus::Done {
            return DriverStatus::Done;
        }

        let (backtrack, tokens) = match directive {
            StepDirective::Stop => return self.finish(FinishReason::ControllerStop),
            StepDirective::SampleWithBias(allowed) => match self.sampler.sample(&allowed) {
                Some(token) => (0, vec![token]),
                None => {
                    return self.fail(format!(
                        "sampler produced no token ({} allowed)",
                        allowed.len()
                    ));
                }
            },
            StepDirective::Splice { backtrack, tokens } => (backtrack, tokens),
        };

        // Post phase: commit and classify.
        let start = Instant::now();
        let post = match self.scheduler.post_step(backtrack, &tokens) {
            Ok(post) => post,
            Err(err) => return self.fail(format!("{err}")),
        };
        if self.check_budget(start, self.limits.post_budget_us, "post_step") == DriverStatus::Done {
            return DriverStatus::Done;
        }

        if PostDecision::from_tokens(&tokens, self.eos) == PostDecision::Stop {
            return self.finish(FinishReason::FoundEos);
        }
        if post == PostDecision::Stop {
            return self.finish(FinishReason::ControllerStop);
        }
        DriverStatus::Running
    }

    /// [`StepDriver::begin`] followed by steps until the sequence ends.
    pub fn run(&mut self, prompt: &str) -> SeqOutput {
        if self.begin(prompt) == DriverStatus::Running {
            while self.step() == DriverStatus::Running {}
        }
        self.output()
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.finished.as_ref()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The sequence report. Meaningful once the driver is done; a driver
    /// interrogated mid-flight reports a failure.
    pub fn output(&self) -> SeqOutput {
        let bindings = self.scheduler.bindings();
        let transcript = self.scheduler.transcript();
        let prompt_len = self.scheduler.prompt_len();
        let text = bindings.text(&transcript[prompt_len.min(transcript.len())..]);
        let (finish_reason, error) = match &self.finished {
            Some(reason) => (reason.clone(), self.error.clone()),
            None => (
                FinishReason::Failed,
                Some("driver still running".to_owned()),
            ),
        };
        SeqOutput {
            seq_id: self.scheduler.seq_id(),
            prompt_len,
            transcript,
            text,
            finish_reason,
            steps: self.steps,
            forks: self.forks.clone(),
            error,
        }
    }

    fn finish(&mut self, reason: FinishReason) -> DriverStatus {
        tracing::debug!(seq_id = self.scheduler.seq_id(), ?reason, steps = self.steps, "sequence finished");
        self.finished = Some(reason);
        DriverStatus::Done
    }

    fn fail(&mut self, message: String) -> DriverStatus {
        tracing::warn!(seq_id = self.scheduler.seq_id(), %message, "sequence failed");
        self.error = Some(message);
        self.finished = Some(FinishReason::Failed);
        DriverStatus::Done
    }

    fn check_budget(&mut self, start: Instant, budget_us: u64, phase: &str) -> DriverStatus {
        let elapsed = start.elapsed();
        if elapsed > Duration::from_micros(budget_us) {
            self.fail(format!(
                "{phase} took {}us, budget is {budget_us}us",
                elapsed.as_micros()
            ))
        } else {
            DriverStatus::Running
        }
    }
}
