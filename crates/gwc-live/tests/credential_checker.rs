mod common;

use common::{advance, settle, Calls, FakeGateway};
use gwc_core::credentials::{CredentialState, ModelList};
use gwc_live::credentials::CredentialChecker;
use std::time::Duration;

const DEBOUNCE_MS: u64 = 500;

fn checker(gateway: &std::sync::Arc<FakeGateway>) -> CredentialChecker {
    CredentialChecker::spawn(gateway.clone(), Duration::from_millis(DEBOUNCE_MS))
}

#[tokio::test(start_paused = true)]
async fn only_the_last_edit_in_the_window_is_validated() {
    let gateway = FakeGateway::new();
    let checker = checker(&gateway);

    for key in ["s", "sk", "sk-live"] {
        checker.edit("openai", key).await.expect("edit");
        settle().await;
        advance(100).await;
    }
    assert_eq!(Calls::get(&gateway.calls.test_key), 0);
    assert_eq!(checker.state().label(), "pending");

    advance(DEBOUNCE_MS).await;
    assert_eq!(gateway.tested_keys(), vec!["sk-live".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn slow_result_for_replaced_key_is_ignored() {
    let gateway = FakeGateway::new();
    gateway.script_key("sk-a", 2_000, Ok(()));
    gateway.script_key("sk-b", 0, Err("invalid api key"));
    let checker = checker(&gateway);

    checker.edit("openai", "sk-a").await.expect("edit a");
    settle().await;
    advance(DEBOUNCE_MS).await;
    checker.edit("anthropic", "sk-b").await.expect("edit b");
    settle().await;
    advance(DEBOUNCE_MS).await;

    let expected = CredentialState::Invalid {
        provider: "anthropic".to_string(),
        error: "invalid api key".to_string(),
    };
    assert_eq!(checker.state(), expected);

    advance(2_000).await;
    assert_eq!(checker.state(), expected);
    assert_eq!(Calls::get(&gateway.calls.test_key), 2);
    assert_eq!(Calls::get(&gateway.calls.list_models), 0);
}

#[tokio::test(start_paused = true)]
async fn valid_key_loads_the_model_list() {
    let gateway = FakeGateway::new();
    gateway.set_models(&["gpt-4o", "gpt-4o-mini"]);
    let checker = checker(&gateway);

    checker.edit("openai", "sk-live").await.expect("edit");
    let state = checker.settled().await.expect("settled");

    let CredentialState::Valid { provider, models } = state else {
        panic!("expected a valid key");
    };
    assert_eq!(provider, "openai");
    let ModelList::Ready(models) = models else {
        panic!("expected a model list");
    };
    let ids: Vec<&str> = models.iter().map(|model| model.id.as_str()).collect();
    assert_eq!(ids, vec!["gpt-4o", "gpt-4o-mini"]);
    assert_eq!(Calls::get(&gateway.calls.list_models), 1);
}

#[tokio::test(start_paused = true)]
async fn clearing_the_key_returns_to_idle_without_a_call() {
    let gateway = FakeGateway::new();
    let checker = checker(&gateway);

    checker.edit("openai", "sk-1").await.expect("edit");
    settle().await;
    checker.edit("openai", "   ").await.expect("clear");
    settle().await;
    assert_eq!(checker.state(), CredentialState::Idle);

    advance(DEBOUNCE_MS * 4).await;
    assert_eq!(Calls::get(&gateway.calls.test_key), 0);
    assert_eq!(checker.state(), CredentialState::Idle);
}
