//! Challenge state machine scenarios against a scripted mock page.

mod support;

use authrelay::artifact::ArtifactRelay;
use authrelay::browser::page::PageHandle;
use authrelay::error::FlowError;
use authrelay::flow::machine::{ChallengeOutcome, InputKind, LoginFlow, Stage};
use serde_json::{json, Value};
use std::sync::Arc;
use support::*;

fn flow_for(page: &Arc<MockPage>, relay: &Arc<ArtifactRelay>, session_id: &str) -> LoginFlow {
    LoginFlow::new(
        page.clone() as Arc<dyn PageHandle>,
        relay.clone(),
        session_id,
        test_config(),
    )
}

fn temp_relay() -> (tempfile::TempDir, Arc<ArtifactRelay>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let relay = Arc::new(ArtifactRelay::new(dir.path()));
    (dir, relay)
}

#[tokio::test]
async fn credentials_with_puzzle_awaits_tile_choice() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    page.queue(START, start_hit());
    page.stub(TILES, tiles_hit());
    page.queue(CAPTURE, data_url(b"round-one"));

    let outcome = flow.submit_credentials("user@example.com", "hunter2").await.unwrap();

    assert_eq!(outcome, ChallengeOutcome::AwaitingInput(InputKind::TileNumber));
    assert_eq!(flow.stage(), Stage::PuzzleActive);

    // Identity and secret were typed before the submit click.
    let fills = page.fills();
    assert_eq!(fills.len(), 2);
    assert_eq!(fills[0].2, "user@example.com");
    assert_eq!(fills[1].2, "hunter2");

    // The first tile image was staged for the solver.
    assert!(relay.exists("s1").await);
    let stored = tokio::fs::read(relay.path_for("s1")).await.unwrap();
    assert_eq!(stored, b"round-one");
}

#[tokio::test]
async fn credentials_with_no_puzzle_can_authenticate_directly() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    // Submitting the form lands straight in the account area; no start
    // control ever shows up.
    page.on_click_set_url("https://www.example.com/account/home");

    let outcome = flow.submit_credentials("user@example.com", "hunter2").await.unwrap();

    assert_eq!(outcome, ChallengeOutcome::Success);
    assert_eq!(flow.stage(), Stage::Authenticated);
}

#[tokio::test]
async fn rejected_credentials_fail_terminally() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    page.stub(CREDENTIAL_ERROR, json!("Incorrect password."));

    let outcome = flow.submit_credentials("user@example.com", "wrong").await.unwrap();

    match outcome {
        ChallengeOutcome::TerminalFailure(reason) => {
            assert!(reason.contains("authentication failed"), "reason: {}", reason)
        }
        other => panic!("expected terminal failure, got {:?}", other),
    }
    assert_eq!(flow.stage(), Stage::Failed);
    assert!(flow.fail_reason().is_some());
}

#[tokio::test]
async fn out_of_range_tile_is_rejected_without_touching_the_page() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    for bad in [0u32, 7, 42] {
        let err = flow.select_tile(bad).await.unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)), "tile {}: {:?}", bad, err);
    }

    assert_eq!(page.call_count(), 0);
    assert_eq!(flow.stage(), Stage::LoggedOut);
}

#[tokio::test]
async fn stage_specific_operations_require_their_stage() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    let err = flow.select_tile(3).await.unwrap_err();
    assert!(matches!(err, FlowError::NotApplicable(_)));

    let err = flow.submit_code("123456").await.unwrap_err();
    assert!(matches!(err, FlowError::NotApplicable(_)));

    let err = flow.submit_phone("5551234567", "+1").await.unwrap_err();
    assert!(matches!(err, FlowError::NotApplicable(_)));

    // None of the rejections reached the page or moved the stage.
    assert_eq!(page.call_count(), 0);
    assert_eq!(flow.stage(), Stage::LoggedOut);
}

#[tokio::test]
async fn two_completed_puzzle_cycles_lead_to_the_code_step() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    page.queue(START, start_hit());
    page.stub(TILES, tiles_hit());
    page.queue(CAPTURE, data_url(b"round-one"));
    flow.submit_credentials("user@example.com", "hunter2").await.unwrap();
    assert_eq!(flow.stage(), Stage::PuzzleActive);

    // First cycle completes and the flow finds a second puzzle.
    page.on_tile_click_set_url("https://www.example.com/verify/round2");
    page.queue(START, start_hit());
    page.queue(CAPTURE, data_url(b"round-two"));

    let outcome = flow.select_tile(2).await.unwrap();
    assert_eq!(outcome, ChallengeOutcome::AwaitingInput(InputKind::TileNumber));
    assert_eq!(flow.challenge_attempts(), 1);
    assert_eq!(flow.stage(), Stage::PuzzleActive);

    // Second completed cycle always ends at the one-time-code step.
    page.on_tile_click_set_url("https://www.example.com/verify/code");

    let outcome = flow.select_tile(5).await.unwrap();
    assert_eq!(outcome, ChallengeOutcome::AwaitingInput(InputKind::OneTimeCode));
    assert_eq!(flow.challenge_attempts(), 2);
    assert_eq!(flow.stage(), Stage::AwaitingOneTimeCode);
}

#[tokio::test]
async fn wrong_tile_with_retry_control_republishes_the_artifact() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    page.queue(START, start_hit());
    page.stub(TILES, tiles_hit());
    page.queue(CAPTURE, data_url(b"first-image"));
    flow.submit_credentials("user@example.com", "hunter2").await.unwrap();
    assert_eq!(flow.stage(), Stage::PuzzleActive);

    page.stub(ERROR_INDICATOR, json!("Wrong tile, try again"));
    page.stub(RETRY, Value::Bool(true));
    page.queue(CAPTURE, data_url(b"second-image"));

    let outcome = flow.select_tile(4).await.unwrap();

    assert_eq!(outcome, ChallengeOutcome::AwaitingInput(InputKind::TileNumber));
    assert_eq!(flow.stage(), Stage::PuzzleRetry);
    // Still within the same cycle.
    assert_eq!(flow.challenge_attempts(), 0);

    // The regenerated image replaced the old one under the same key.
    let stored = tokio::fs::read(relay.path_for("s1")).await.unwrap();
    assert_eq!(stored, b"second-image");
}

#[tokio::test]
async fn unresolved_completion_is_treated_as_no_change() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    page.queue(START, start_hit());
    page.stub(TILES, tiles_hit());
    flow.submit_credentials("user@example.com", "hunter2").await.unwrap();
    assert_eq!(flow.stage(), Stage::PuzzleActive);

    // Both signals time out and the address never moves: not an error, the
    // flow just goes looking for the next puzzle.
    page.make_waits_fail();

    let outcome = flow.select_tile(1).await.unwrap();

    match outcome {
        ChallengeOutcome::RetryableFailure(_) => {}
        other => panic!("expected retryable outcome, got {:?}", other),
    }
    assert_eq!(flow.challenge_attempts(), 0);
    assert_eq!(flow.stage(), Stage::PuzzleSearch);
}

#[tokio::test]
async fn rejected_code_keeps_the_stage_for_resubmission() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    // No puzzle this time; the code form is already on screen.
    page.stub(CODE_FORM, Value::Bool(true));
    let outcome = flow.submit_credentials("user@example.com", "hunter2").await.unwrap();
    assert_eq!(outcome, ChallengeOutcome::AwaitingInput(InputKind::OneTimeCode));
    assert_eq!(flow.stage(), Stage::AwaitingOneTimeCode);

    page.stub(ERROR_INDICATOR, json!("That code is not valid"));
    let outcome = flow.submit_code("000000").await.unwrap();

    match outcome {
        ChallengeOutcome::RetryableFailure(reason) => {
            assert!(reason.contains("not valid"))
        }
        other => panic!("expected retryable failure, got {:?}", other),
    }
    assert_eq!(flow.stage(), Stage::AwaitingOneTimeCode);

    // The caller corrects the code and gets through.
    page.stub(ERROR_INDICATOR, Value::Null);
    let outcome = flow.submit_code("123456").await.unwrap();
    assert_eq!(outcome, ChallengeOutcome::Success);
    assert_eq!(flow.stage(), Stage::Authenticated);
}

#[tokio::test]
async fn dead_end_redirect_after_code_is_a_named_terminal_state() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    page.stub(CODE_FORM, Value::Bool(true));
    flow.submit_credentials("user@example.com", "hunter2").await.unwrap();
    assert_eq!(flow.stage(), Stage::AwaitingOneTimeCode);

    // Submitting the code bounces to the known dead-end path.
    page.on_click_set_url("https://www.example.com/login/challenge");

    let outcome = flow.submit_code("123456").await.unwrap();

    match outcome {
        ChallengeOutcome::TerminalFailure(reason) => {
            assert!(reason.contains("login challenge"))
        }
        other => panic!("expected terminal failure, got {:?}", other),
    }
    assert_eq!(flow.stage(), Stage::LoginChallengeRequired);
}

#[tokio::test]
async fn short_phone_number_never_reaches_the_page() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    let err = flow.submit_phone("555123", "+1").await.unwrap_err();

    assert!(matches!(err, FlowError::Validation(_)));
    assert_eq!(page.call_count(), 0);
}

#[tokio::test]
async fn phone_registration_advances_through_sms_verification() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    // The post-challenge page asks for a phone number.
    page.stub(PHONE_FORM, Value::Bool(true));
    let outcome = flow.submit_credentials("user@example.com", "hunter2").await.unwrap();
    assert_eq!(outcome, ChallengeOutcome::AwaitingInput(InputKind::PhoneNumber));
    assert_eq!(flow.stage(), Stage::AwaitingPhoneNumber);

    page.stub(HEADING, json!("We sent you a code by SMS"));
    let outcome = flow.submit_phone("5551234567", "+1").await.unwrap();
    assert_eq!(outcome, ChallengeOutcome::AwaitingInput(InputKind::SmsCode));
    assert_eq!(flow.stage(), Stage::AwaitingSmsCode);

    // Country code and number both made it into the form.
    let fills = page.fills();
    assert!(fills.iter().any(|(_, _, v)| v == "+1"));
    assert!(fills.iter().any(|(_, _, v)| v == "5551234567"));

    // The SMS code goes through the same code operation.
    page.stub(CODE_FORM, Value::Bool(true));
    let outcome = flow.submit_code("654321").await.unwrap();
    assert_eq!(outcome, ChallengeOutcome::Success);
    assert_eq!(flow.stage(), Stage::Authenticated);
}

#[tokio::test]
async fn status_short_circuits_once_authenticated() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    page.on_click_set_url("https://www.example.com/account/home");
    flow.submit_credentials("user@example.com", "hunter2").await.unwrap();
    assert_eq!(flow.stage(), Stage::Authenticated);

    let before = page.call_count();
    let stage = flow.status().await.unwrap();
    assert_eq!(stage, Stage::Authenticated);
    assert_eq!(page.call_count(), before, "status re-ran checks after success");
}

#[tokio::test]
async fn status_detects_late_authentication_from_the_address() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    assert_eq!(flow.status().await.unwrap(), Stage::LoggedOut);

    page.set_url("https://www.example.com/account/home");
    assert_eq!(flow.status().await.unwrap(), Stage::Authenticated);
}

#[tokio::test]
async fn challenge_controls_are_serialized_from_the_page() {
    let page = MockPage::new();
    let (_guard, relay) = temp_relay();
    let mut flow = flow_for(&page, &relay, "s1");

    page.stub(
        CONTROLS,
        json!([
            {
                "selector": "button:nth-of-type(1)",
                "tag": "button",
                "text": "Begin verification",
                "is_visible": true,
                "is_enabled": true
            }
        ]),
    );

    let controls = flow.challenge_controls().await.unwrap();
    assert_eq!(controls.len(), 1);
    assert_eq!(controls[0].tag, "button");
    assert!(controls[0].is_visible);

    // And nothing found is an empty list, not an error.
    page.stub(CONTROLS, Value::Null);
    let controls = flow.challenge_controls().await.unwrap();
    assert!(controls.is_empty());
}
