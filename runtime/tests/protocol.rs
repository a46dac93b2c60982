//! Step-protocol tests: manual pre/mid/post stepping against a scheduler.

mod common;

use common::{bindings, bindings_with, toks};
use std::sync::Arc;

use tiller::dummy::{EOS, PLACEHOLDER};
use tiller::{
    MemoryStore, PostDecision, PreDecision, ProtocolError, Scheduler, StepDirective, VarStore,
};

// -- Fixed text -----------------------------------------------------------

#[test]
fn fill_commits_exact_tokens() {
    let mut scheduler = Scheduler::launch(bindings(0), |ctrl| async move {
        let prompt = ctrl.prompt().await?;
        assert_eq!(prompt, vec![72, 105]); // "Hi"
        ctrl.fill("hi").await?;
        Ok(())
    })
    .unwrap();
    scheduler.init_prompt(toks("Hi")).unwrap();

    assert_eq!(
        scheduler.pre_step().unwrap(),
        PreDecision::FastForward(toks("hi"))
    );
    assert_eq!(
        scheduler.mid_step(&[0]).unwrap(),
        StepDirective::Splice {
            backtrack: 0,
            tokens: toks("hi")
        }
    );
    assert_eq!(
        scheduler.post_step(0, &toks("hi")).unwrap(),
        PostDecision::Continue
    );

    // The transcript round-trips exactly through the tokenizer.
    let transcript = scheduler.transcript();
    assert_eq!(transcript, toks("Hihi"));
    assert_eq!(scheduler.bindings().detokenize(&transcript), b"Hihi");

    // The program is done; stepping now yields stop forever.
    assert_eq!(scheduler.pre_step().unwrap(), PreDecision::Continue);
    assert_eq!(scheduler.mid_step(&[0]).unwrap(), StepDirective::Stop);
}

#[test]
fn labelled_splice_backtracks_to_the_label() {
    let mut scheduler = Scheduler::launch(bindings(0), |ctrl| async move {
        ctrl.prompt().await?;
        let label = ctrl.label(); // position 4
        ctrl.fill("xyz").await?; // transcript grows to 7
        ctrl.splice(label, "bye").await?;
        assert_eq!(ctrl.text_since(label), "bye");
        Ok(())
    })
    .unwrap();
    scheduler.init_prompt(toks("abcd")).unwrap();

    // Step 1: the fill.
    scheduler.pre_step().unwrap();
    scheduler.mid_step(&[0]).unwrap();
    scheduler.post_step(0, &toks("xyz")).unwrap();
    assert_eq!(scheduler.transcript_len(), 7);

    // Step 2: the splice drops everything after the label.
    assert_eq!(scheduler.pre_step().unwrap(), PreDecision::Continue);
    assert_eq!(
        scheduler.mid_step(&[0]).unwrap(),
        StepDirective::Splice {
            backtrack: 3,
            tokens: toks("bye")
        }
    );
    scheduler.post_step(3, &toks("bye")).unwrap();
    assert_eq!(scheduler.transcript(), toks("abcdbye"));
    assert_eq!(scheduler.transcript_len(), 4 + 3);
}

// -- Forks ----------------------------------------------------------------

#[test]
fn fork_resolves_with_own_branch_index() {
    let store = Arc::new(MemoryStore::new());
    let mut scheduler = Scheduler::launch(bindings_with(store.clone(), 7), |ctrl| async move {
        ctrl.prompt().await?;
        let index = ctrl.fork(2).await?;
        ctrl.set_var("index", index.to_string());
        Ok(())
    })
    .unwrap();
    scheduler.init_prompt(toks("p")).unwrap();

    assert_eq!(scheduler.pre_step().unwrap(), PreDecision::Fork(2));
    // Own id 7 sits at index 1 of the host's group; the fork is absorbed
    // and the completed program leaves a stop directive.
    assert_eq!(scheduler.mid_step(&[5, 7]).unwrap(), StepDirective::Stop);
    assert_eq!(store.get("index").unwrap().as_ref(), b"1");
}

#[test]
fn fork_group_missing_own_id_fails_the_program() {
    let mut scheduler = Scheduler::launch(bindings(7), |ctrl| async move {
        ctrl.prompt().await?;
        ctrl.fork(2).await?;
        Ok(())
    })
    .unwrap();
    scheduler.init_prompt(toks("p")).unwrap();

    scheduler.pre_step().unwrap();
    let err = scheduler.mid_step(&[1, 2]).unwrap_err();
    assert!(matches!(err, ProtocolError::Program { .. }));
}

#[test]
fn nested_fork_is_fatal() {
    let mut scheduler = Scheduler::launch(bindings(0), |ctrl| async move {
        ctrl.prompt().await?;
        let _ = ctrl.fork(2).await?;
        let _ = ctrl.fork(2).await?;
        Ok(())
    })
    .unwrap();
    scheduler.init_prompt(toks("p")).unwrap();

    assert_eq!(scheduler.pre_step().unwrap(), PreDecision::Fork(2));
    // The first fork is absorbed; the second surfaces inside the same
    // mid-step, where forking again is not supported.
    let err = scheduler.mid_step(&[0, 1]).unwrap_err();
    assert!(matches!(err, ProtocolError::NestedFork { branches: 2 }));
    // The fault is sticky.
    assert!(matches!(
        scheduler.pre_step(),
        Err(ProtocolError::NestedFork { .. })
    ));
}

// -- Skip absorption and the placeholder ----------------------------------

#[test]
fn suspended_wait_surfaces_a_placeholder_token() {
    let store = Arc::new(MemoryStore::new());
    let mut scheduler = Scheduler::launch(bindings_with(store.clone(), 0), |ctrl| async move {
        ctrl.prompt().await?;
        let branch = ctrl.fork(1).await?; // legal single-branch pass-through
        assert_eq!(branch, 0);
        let values = ctrl.wait_vars(&["signal"]).await?;
        let text = String::from_utf8_lossy(&values[0]).into_owned();
        ctrl.fill(&text).await?;
        Ok(())
    })
    .unwrap();
    scheduler.init_prompt(toks("p")).unwrap();

    // Step 1: the fork is absorbed; the wait behind it has no value yet,
    // so the scheduler substitutes a single placeholder token to keep the
    // host moving.
    assert_eq!(scheduler.pre_step().unwrap(), PreDecision::Fork(1));
    assert_eq!(
        scheduler.mid_step(&[0]).unwrap(),
        StepDirective::Splice {
            backtrack: 0,
            tokens: vec![PLACEHOLDER]
        }
    );
    scheduler.post_step(0, &[PLACEHOLDER]).unwrap();

    // Step 2: the stashed wait is outstanding again, still unsatisfied.
    assert_eq!(scheduler.pre_step().unwrap(), PreDecision::Suspend);

    // Step 3: once the variable exists, the wait resolves mid-step and the
    // program's fill supplies the directive for this step.
    store.set("signal", bytes::Bytes::from_static(b"go"));
    assert_eq!(scheduler.pre_step().unwrap(), PreDecision::Continue);
    assert_eq!(
        scheduler.mid_step(&[0]).unwrap(),
        StepDirective::Splice {
            backtrack: 0,
            tokens: toks("go")
        }
    );
    scheduler.post_step(0, &toks("go")).unwrap();

    // The committed placeholder stays visible in the transcript.
    let mut expected = toks("p");
    expected.push(PLACEHOLDER);
    expected.extend(toks("go"));
    assert_eq!(scheduler.transcript(), expected);
}

#[test]
fn infinite_pass_through_chain_trips_the_skip_limit() {
    let mut scheduler = Scheduler::launch(bindings(0), |ctrl| async move {
        loop {
            ctrl.fork(1).await?;
        }
    })
    .unwrap();
    scheduler.init_prompt(toks("p")).unwrap();

    scheduler.pre_step().unwrap();
    // Every absorbed fork immediately issues another one; the bound turns
    // the would-be hang into a fault.
    let err = scheduler.mid_step(&[0]).unwrap_err();
    assert!(matches!(err, ProtocolError::SkipLimitExceeded { .. }));
}

// -- Protocol violations --------------------------------------------------

#[test]
fn two_concurrent_awaits_poison_the_sequence() {
    let err = Scheduler::launch(bindings(0), |ctrl| async move {
        let (a, b) = futures::join!(ctrl.fill("a"), ctrl.fill("b"));
        a?;
        b?;
        Ok(())
    })
    .unwrap_err();
    assert!(matches!(err, ProtocolError::RequestAlreadyPending));
}

#[test]
fn backtrack_past_transcript_start_is_fatal() {
    let mut scheduler = Scheduler::launch(bindings(0), |ctrl| async move {
        ctrl.prompt().await?;
        ctrl.fill("hi").await?;
        Ok(())
    })
    .unwrap();
    scheduler.init_prompt(toks("p")).unwrap();

    scheduler.pre_step().unwrap();
    scheduler.mid_step(&[0]).unwrap();
    let err = scheduler.post_step(5, &[]).unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::BacktrackPastStart {
            backtrack: 5,
            transcript: 1
        }
    ));
    assert!(matches!(
        scheduler.pre_step(),
        Err(ProtocolError::BacktrackPastStart { .. })
    ));
}

// -- Prompt handling ------------------------------------------------------

#[test]
fn prompt_rereads_resolve_immediately() {
    let store = Arc::new(MemoryStore::new());
    let mut scheduler = Scheduler::launch(bindings_with(store.clone(), 0), |ctrl| async move {
        let first = ctrl.prompt().await?;
        let again = ctrl.prompt().await?;
        assert_eq!(first, again);
        ctrl.set_var("prompt", ctrl.text(&first));
        ctrl.fill("!").await?;
        Ok(())
    })
    .unwrap();
    scheduler.init_prompt(toks("ask")).unwrap();
    assert_eq!(store.get("prompt").unwrap().as_ref(), b"ask");

    scheduler.pre_step().unwrap();
    scheduler.mid_step(&[0]).unwrap();
    scheduler.post_step(0, &toks("!")).unwrap();
    assert_eq!(scheduler.transcript(), toks("ask!"));
}

#[test]
fn eos_classification_is_exposed_to_hosts() {
    assert_eq!(PostDecision::from_tokens(&[104, EOS], EOS), PostDecision::Stop);
    assert_eq!(PostDecision::from_tokens(&[104], EOS), PostDecision::Continue);
}
