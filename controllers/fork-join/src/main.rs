//! Two cooperating sequences on one controller pool.
//!
//! The drafter generates a constrained draft, publishes it as a shared
//! variable, forks to explore endings, and rewrites everything since a
//! label with its final wording. The echo sequence suspends until the
//! draft variable exists, then commits a response built from it. Both run
//! as cooperative tokio tasks, so the wait resolves while the drafter is
//! still stepping.

use std::sync::Arc;

use anyhow::Result;
use tiller::dummy::ByteTokenizer;
use tiller::{ControllerPool, GenParams, Limits, TokenSampler};

const HELP: &str = "\
Usage: fork-join [OPTIONS]

Runs a drafting sequence and an echoing sequence on one pool, exchanging
a shared variable and splicing the draft from a label.

Options:
      --seed <SEED>     Sample uniformly with this seed instead of greedily
  -n, --max-tokens <N>  Generation budget for the draft [default: 16]
  -h, --help            Print this help message";

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        println!("{HELP}");
        return Ok(());
    }
    let seed: Option<u64> = args.opt_value_from_str("--seed")?;
    let max_tokens: usize = args.value_from_str(["-n", "--max-tokens"]).unwrap_or(16);

    let sampler = |seed: Option<u64>| match seed {
        Some(seed) => TokenSampler::uniform(seed),
        None => TokenSampler::Greedy,
    };

    let pool = ControllerPool::new(Arc::new(ByteTokenizer), Arc::new(ByteTokenizer));

    let drafter = pool.spawn(sampler(seed), Limits::default(), move |ctrl| async move {
        ctrl.fill("draft: ").await?;
        let mark = ctrl.label();
        let draft = ctrl
            .gen_text(
                GenParams::new()
                    .options(["a short note", "a long letter"])
                    .max_tokens(max_tokens)
                    .store_var("draft"),
            )
            .await?;
        // Only branch 0 keeps running under the reference driver; the
        // other ids are recorded in the fork log.
        let branch = ctrl.fork(2).await?;
        if branch == 0 {
            ctrl.splice(mark, &format!("final: {draft}")).await?;
        } else {
            ctrl.fill(" (alternate ending)").await?;
        }
        Ok(())
    })?;

    let echo = pool.spawn(sampler(seed), Limits::default(), |ctrl| async move {
        let values = ctrl.wait_vars(&["draft"]).await?;
        let draft = String::from_utf8_lossy(&values[0]).into_owned();
        ctrl.fill(&format!("the draft was: {draft}")).await?;
        Ok(())
    })?;

    let (draft_out, echo_out) = futures::join!(
        pool.run(drafter, "Write me something. "),
        pool.run(echo, "Waiting. ")
    );

    for output in [draft_out?, echo_out?] {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}
