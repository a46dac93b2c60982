//! Controller pool: one cooperative task per sequence.
//!
//! Each spawned sequence runs as a tokio task owning its scheduler and
//! [`StepDriver`]. Tasks yield between steps, so sequences sharing the
//! pool's variable store can coordinate: one branch suspends on a variable
//! while another keeps stepping and eventually sets it. Commands travel
//! over an mpsc channel and answer through oneshot replies.
//!
//! The pool is a convenience for embedding and tests; hosts with their own
//! batching loop drive schedulers directly.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::bindings::{Bindings, MemoryStore, Tokenizer, VarStore, Vocabulary};
use crate::ctrl::Ctrl;
use crate::driver::{DriverStatus, Limits, SeqIds, SeqOutput, StepDriver, TokenSampler};
use crate::scheduler::Scheduler;
use crate::vocab::SeqId;

enum Command {
    /// Drive the sequence from prompt to completion and report it.
    Run {
        prompt: String,
        reply: oneshot::Sender<SeqOutput>,
    },
    /// Drop the sequence without running it further.
    Terminate,
}

struct SeqHandle {
    commands: mpsc::UnboundedSender<Command>,
}

/// A set of sequences sharing a variable store and a sequence-id space.
pub struct ControllerPool {
    tokenizer: Arc<dyn Tokenizer>,
    vocab: Arc<dyn Vocabulary>,
    store: Arc<MemoryStore>,
    seq_ids: SeqIds,
    sequences: DashMap<SeqId, SeqHandle>,
}

impl ControllerPool {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, vocab: Arc<dyn Vocabulary>) -> Self {
        Self {
            tokenizer,
            vocab,
            store: Arc::new(MemoryStore::new()),
            seq_ids: SeqIds::new(),
            sequences: DashMap::new(),
        }
    }

    /// The store shared by every sequence of this pool.
    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Launch `program` as a new sequence and park it until [`Self::run`].
    ///
    /// The program runs to its first suspension on the caller's thread, so
    /// launch-time faults surface here rather than inside the task.
    pub fn spawn<F, Fut>(
        &self,
        sampler: TokenSampler,
        limits: Limits,
        program: F,
    ) -> Result<SeqId>
    where
        F: FnOnce(Ctrl) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let seq_id = self.seq_ids.next();
        let bindings = Bindings::new(
            self.tokenizer.clone(),
            self.vocab.clone(),
            self.store.clone() as Arc<dyn VarStore>,
            seq_id,
        );
        let scheduler = Scheduler::launch(bindings, program)?;
        let mut driver = StepDriver::new(scheduler, sampler)
            .with_limits(limits)
            .with_seq_ids(self.seq_ids.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Run { prompt, reply } => {
                        if driver.begin(&prompt) == DriverStatus::Running {
                            while driver.step() == DriverStatus::Running {
                                // Let sibling sequences make progress, so a
                                // suspended variable wait can resolve.
                                tokio::task::yield_now().await;
                            }
                        }
                        let _ = reply.send(driver.output());
                    }
                    Command::Terminate => break,
                }
            }
            tracing::debug!(seq_id, "sequence task exited");
        });

        self.sequences.insert(seq_id, SeqHandle { commands: tx });
        tracing::debug!(seq_id, "sequence spawned");
        Ok(seq_id)
    }

    /// Drive a spawned sequence from `prompt` to completion.
    pub async fn run(&self, seq_id: SeqId, prompt: &str) -> Result<SeqOutput> {
        let (reply, report) = oneshot::channel();
        {
            let handle = self
                .sequences
                .get(&seq_id)
                .ok_or_else(|| anyhow!("unknown sequence {seq_id}"))?;
            handle
                .commands
                .send(Command::Run {
                    prompt: prompt.to_owned(),
                    reply,
                })
                .map_err(|_| anyhow!("sequence {seq_id} is gone"))?;
        }
        report
            .await
            .map_err(|_| anyhow!("sequence {seq_id} dropped its report"))
    }

    /// Discard a sequence. Returns whether it was registered.
    pub fn terminate(&self, seq_id: SeqId) -> bool {
        match self.sequences.remove(&seq_id) {
            Some((_, handle)) => {
                let _ = handle.commands.send(Command::Terminate);
                true
            }
            None => false,
        }
    }
}
