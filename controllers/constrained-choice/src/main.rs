//! Steers a generation toward one of a fixed set of answers.
//!
//! Runs entirely in-process: byte-level tokenizer, reference step driver,
//! greedy (or seeded uniform) sampling. The chosen answer is persisted in
//! the variable store and echoed back into the transcript.

use std::sync::Arc;

use anyhow::Result;
use tiller::dummy::ByteTokenizer;
use tiller::{Bindings, GenParams, MemoryStore, Scheduler, StepDriver, TokenSampler};

const HELP: &str = "\
Usage: constrained-choice [OPTIONS]

Steers a generation toward one of a fixed set of answers, using the
in-crate byte tokenizer and reference step driver.

Options:
  -p, --prompt <TEXT>   Prompt text [default: 'The sky today is ']
  -o, --options <LIST>  Comma-separated answer candidates [default: blue,grey,black]
  -n, --max-tokens <N>  Generation budget [default: 16]
      --seed <SEED>     Sample uniformly with this seed instead of greedily
  -h, --help            Print this help message";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        println!("{HELP}");
        return Ok(());
    }
    let prompt: String = args
        .value_from_str(["-p", "--prompt"])
        .unwrap_or_else(|_| "The sky today is ".to_owned());
    let candidates: String = args
        .value_from_str(["-o", "--options"])
        .unwrap_or_else(|_| "blue,grey,black".to_owned());
    let max_tokens: usize = args.value_from_str(["-n", "--max-tokens"]).unwrap_or(16);
    let seed: Option<u64> = args.opt_value_from_str("--seed")?;

    let choices: Vec<String> = candidates.split(',').map(str::to_owned).collect();

    let bindings = Bindings::new(
        Arc::new(ByteTokenizer),
        Arc::new(ByteTokenizer),
        Arc::new(MemoryStore::new()),
        0,
    );
    let scheduler = Scheduler::launch(bindings, move |ctrl| async move {
        ctrl.prompt().await?;
        let answer = ctrl
            .gen_text(
                GenParams::new()
                    .options(choices)
                    .max_tokens(max_tokens)
                    .store_var("answer"),
            )
            .await?;
        ctrl.check_var("answer", &answer)?;
        ctrl.fill(".").await?;
        Ok(())
    })?;

    let sampler = match seed {
        Some(seed) => TokenSampler::uniform(seed),
        None => TokenSampler::Greedy,
    };
    let mut driver = StepDriver::new(scheduler, sampler);
    let output = driver.run(&prompt);

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
