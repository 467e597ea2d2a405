use crate::client::GatewayApi;
use crate::pairing::SessionClosed;
use gwc_core::credentials::{CredentialCheck, CredentialState, KeyCheck, ModelList, ValidationOutcome};
use gwc_core::sequence::SequenceToken;
use gwc_core::wire::ModelInfo;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tracing::{debug, info};

const COMMAND_QUEUE: usize = 32;

enum Completion {
    Validated(KeyCheck, Result<(), String>),
    Models(SequenceToken, Result<Vec<ModelInfo>, String>),
}

/// Debounced provider key validation with a chained model listing.
#[derive(Debug)]
pub struct CredentialChecker {
    edits: mpsc::Sender<(String, String)>,
    sent: AtomicU64,
    applied: watch::Receiver<u64>,
    state: watch::Receiver<CredentialState>,
    task: JoinHandle<()>,
}

impl CredentialChecker {
    pub fn spawn<A: GatewayApi>(api: Arc<A>, debounce: Duration) -> Self {
        let (edits, edit_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state) = watch::channel(CredentialState::Idle);
        let (applied_tx, applied) = watch::channel(0);
        let task = tokio::spawn(run_checker(api, debounce, edit_rx, state_tx, applied_tx));
        Self {
            edits,
            sent: AtomicU64::new(0),
            applied,
            state,
            task,
        }
    }

    /// Records a provider/key edit. Only the last edit inside the debounce
    /// window reaches the gateway.
    pub async fn edit(
        &self,
        provider: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<(), SessionClosed> {
        self.edits
            .send((provider.into(), key.into()))
            .await
            .map_err(|_| SessionClosed)?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn state(&self) -> CredentialState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CredentialState> {
        self.state.clone()
    }

    /// Waits until the latest edit has a verdict and, for a valid key, a
    /// model list outcome.
    pub async fn settled(&self) -> Result<CredentialState, SessionClosed> {
        let sent = self.sent.load(Ordering::SeqCst);
        let mut applied = self.applied.clone();
        applied
            .wait_for(|count| *count >= sent)
            .await
            .map_err(|_| SessionClosed)?;
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|state| is_settled(state))
            .await
            .map_err(|_| SessionClosed)?;
        Ok(state.clone())
    }
}

impl Drop for CredentialChecker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn is_settled(state: &CredentialState) -> bool {
    match state {
        CredentialState::Pending { .. } => false,
        CredentialState::Valid { models, .. } => !matches!(models, ModelList::Loading),
        _ => true,
    }
}

async fn run_checker<A: GatewayApi>(
    api: Arc<A>,
    debounce: Duration,
    mut edits: mpsc::Receiver<(String, String)>,
    state_tx: watch::Sender<CredentialState>,
    applied_tx: watch::Sender<u64>,
) {
    let mut check = CredentialCheck::new();
    let mut waiting: Option<KeyCheck> = None;
    let mut edits_applied = 0u64;
    let mut calls: JoinSet<Completion> = JoinSet::new();
    let timer = time::sleep(debounce);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            edit = edits.recv() => {
                let Some((provider, key)) = edit else {
                    break;
                };
                waiting = check.edit(&provider, &key);
                if waiting.is_some() {
                    timer.as_mut().reset(Instant::now() + debounce);
                }
                edits_applied += 1;
            }
            _ = &mut timer, if waiting.is_some() => {
                let Some(request) = waiting.take() else {
                    continue;
                };
                if !check.is_current(request.token) {
                    continue;
                }
                debug!(event = "key_validation_started", provider = %request.provider, token = %request.token);
                let api = api.clone();
                calls.spawn(async move {
                    let result = match api.test_key(&request.provider, &request.key).await {
                        Ok(response) => response.into_result("key rejected"),
                        Err(err) => Err(err.user_message()),
                    };
                    Completion::Validated(request, result)
                });
            }
            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                let Ok(completion) = joined else {
                    continue;
                };
                match completion {
                    Completion::Validated(request, result) => {
                        match check.apply_validation(&request, result) {
                            ValidationOutcome::Stale => {
                                debug!(event = "key_validation_stale", token = %request.token);
                            }
                            ValidationOutcome::Invalid => {
                                info!(event = "key_validation_failed", provider = %request.provider);
                            }
                            ValidationOutcome::Valid(chained) => {
                                info!(event = "key_validation_passed", provider = %chained.provider);
                                let api = api.clone();
                                calls.spawn(async move {
                                    let result = match api.list_models(&chained.provider, &chained.key).await {
                                        Ok(response) if response.ok => Ok(response.models),
                                        Ok(response) => Err(response
                                            .error
                                            .unwrap_or_else(|| "model listing failed".to_string())),
                                        Err(err) => Err(err.user_message()),
                                    };
                                    Completion::Models(chained.token, result)
                                });
                            }
                        }
                    }
                    Completion::Models(token, result) => {
                        if !check.apply_models(token, result) {
                            debug!(event = "model_listing_stale", token = %token);
                        }
                    }
                }
            }
        }

        let current = check.state().clone();
        state_tx.send_if_modified(|state| {
            if *state == current {
                false
            } else {
                *state = current;
                true
            }
        });
        applied_tx.send_if_modified(|count| {
            if *count == edits_applied {
                false
            } else {
                *count = edits_applied;
                true
            }
        });
    }
}
