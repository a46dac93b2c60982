//! Generation-loop tests, driven end to end by the reference driver.

mod common;

use common::{bindings, bindings_with, toks};
use std::sync::Arc;

use tiller::dummy::EOS;
use tiller::{FinishReason, GenParams, MemoryStore, Scheduler, StepDriver, TokenSampler, VarStore};

#[test]
fn option_constraint_prunes_to_one_answer() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::launch(bindings_with(store.clone(), 0), |ctrl| async move {
        ctrl.prompt().await?;
        let text = ctrl
            .gen_text(
                GenParams::new()
                    .options(["cat", "dog"])
                    .max_tokens(8)
                    .store_var("animal"),
            )
            .await?;
        ctrl.set_var("result", text);
        Ok(())
    })
    .unwrap();

    // Greedy picks 'c' over 'd' on the first step, after which only "cat"
    // survives and every later step is forced.
    let mut driver = StepDriver::new(scheduler, TokenSampler::Greedy);
    let output = driver.run("The pet is a ");

    assert_eq!(output.finish_reason, FinishReason::ControllerStop);
    assert_eq!(store.get("animal").unwrap().as_ref(), b"cat");
    assert_eq!(store.get("result").unwrap().as_ref(), b"cat");
    assert_eq!(output.text, "cat");
}

#[test]
fn max_tokens_bounds_the_loop() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::launch(bindings_with(store.clone(), 0), |ctrl| async move {
        ctrl.prompt().await?;
        ctrl.gen_tokens(GenParams::new().max_tokens(3).store_var("out"))
            .await?;
        Ok(())
    })
    .unwrap();

    let mut driver = StepDriver::new(scheduler, TokenSampler::scripted(toks("ABCDEF")));
    let output = driver.run("p");

    assert_eq!(store.get("out").unwrap().as_ref(), b"ABC");
    assert_eq!(output.finish_reason, FinishReason::ControllerStop);
    // Three sampled steps plus the final stop.
    assert_eq!(output.steps, 4);
}

#[test]
fn stop_at_halts_on_the_substring() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::launch(bindings_with(store.clone(), 0), |ctrl| async move {
        ctrl.prompt().await?;
        ctrl.gen_tokens(
            GenParams::new()
                .stop_at(".")
                .max_tokens(10)
                .store_var("sentence"),
        )
        .await?;
        Ok(())
    })
    .unwrap();

    let mut driver = StepDriver::new(scheduler, TokenSampler::scripted(toks("x.y")));
    let output = driver.run("p");

    // The loop stops the moment the accumulated text contains ".".
    assert_eq!(store.get("sentence").unwrap().as_ref(), b"x.");
    assert_eq!(output.steps, 3);
}

#[test]
fn sampled_eos_finishes_the_request_and_sequence() {
    let scheduler = Scheduler::launch(bindings(0), |ctrl| async move {
        ctrl.prompt().await?;
        ctrl.gen_tokens(GenParams::new().options(["a", "ab"]).max_tokens(5))
            .await?;
        ctrl.fill("unreachable").await?;
        Ok(())
    })
    .unwrap();

    // After 'a' both options survive: 'b' continues "ab" and eos closes
    // "a". The script picks eos.
    let mut driver = StepDriver::new(scheduler, TokenSampler::scripted([97, EOS]));
    let output = driver.run("p");

    assert_eq!(output.finish_reason, FinishReason::FoundEos);
    assert_eq!(output.transcript.last(), Some(&EOS));
    assert_eq!(output.text, "a"); // eos renders as nothing
}

#[test]
fn missing_engine_fails_the_sequence_at_mid_step() {
    let scheduler = Scheduler::launch(bindings(0), |ctrl| async move {
        ctrl.prompt().await?;
        ctrl.gen_tokens(GenParams::new().regex("[0-9]+")).await?;
        Ok(())
    })
    .unwrap();

    let mut driver = StepDriver::new(scheduler, TokenSampler::Greedy);
    let output = driver.run("p");

    assert_eq!(output.finish_reason, FinishReason::Failed);
    assert!(output.error.unwrap().contains("not supported"));
}
