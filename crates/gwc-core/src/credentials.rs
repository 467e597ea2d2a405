use crate::sequence::{OperationClass, SequenceGuard, SequenceToken};
use crate::wire::ModelInfo;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "lowercase")]
pub enum ModelList {
    Loading,
    Ready(Vec<ModelInfo>),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CredentialState {
    Idle,
    Pending { provider: String },
    Invalid { provider: String, error: String },
    Valid { provider: String, models: ModelList },
}

impl CredentialState {
    pub fn label(&self) -> &'static str {
        match self {
            CredentialState::Idle => "idle",
            CredentialState::Pending { .. } => "pending",
            CredentialState::Invalid { .. } => "invalid",
            CredentialState::Valid { .. } => "valid",
        }
    }

    /// True once the key is known good; the model list may still be loading.
    pub fn can_proceed(&self) -> bool {
        matches!(self, CredentialState::Valid { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCheck {
    pub token: SequenceToken,
    pub provider: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Stale,
    Invalid,
    /// The key is valid; list models for it under the same token.
    Valid(KeyCheck),
}

/// Provider key pre-check state.
///
/// Every edit issues a new `KeyValidation` token, so a result for an older
/// provider/key pair is dropped no matter when it resolves.
#[derive(Debug, Clone)]
pub struct CredentialCheck {
    guard: SequenceGuard,
    state: CredentialState,
}

impl Default for CredentialCheck {
    fn default() -> Self {
        Self {
            guard: SequenceGuard::new(),
            state: CredentialState::Idle,
        }
    }
}

impl CredentialCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &CredentialState {
        &self.state
    }

    pub fn is_current(&self, token: SequenceToken) -> bool {
        self.guard.is_current(&OperationClass::KeyValidation, token)
    }

    /// Records an edit. Returns the check to run once the debounce settles,
    /// or `None` when the key is blank.
    pub fn edit(&mut self, provider: &str, key: &str) -> Option<KeyCheck> {
        let token = self.guard.next_token(OperationClass::KeyValidation);
        let key = key.trim();
        if key.is_empty() {
            self.state = CredentialState::Idle;
            return None;
        }
        self.state = CredentialState::Pending {
            provider: provider.to_string(),
        };
        Some(KeyCheck {
            token,
            provider: provider.to_string(),
            key: key.to_string(),
        })
    }

    pub fn apply_validation(
        &mut self,
        check: &KeyCheck,
        result: Result<(), String>,
    ) -> ValidationOutcome {
        if !self.is_current(check.token) {
            return ValidationOutcome::Stale;
        }
        match result {
            Ok(()) => {
                self.state = CredentialState::Valid {
                    provider: check.provider.clone(),
                    models: ModelList::Loading,
                };
                ValidationOutcome::Valid(check.clone())
            }
            Err(error) => {
                self.state = CredentialState::Invalid {
                    provider: check.provider.clone(),
                    error,
                };
                ValidationOutcome::Invalid
            }
        }
    }

    /// Applies a model listing result; false when it was superseded.
    pub fn apply_models(
        &mut self,
        token: SequenceToken,
        result: Result<Vec<ModelInfo>, String>,
    ) -> bool {
        if !self.is_current(token) {
            return false;
        }
        let CredentialState::Valid { models, .. } = &mut self.state else {
            return false;
        };
        *models = match result {
            Ok(list) => ModelList::Ready(list),
            Err(error) => ModelList::Failed(error),
        };
        true
    }
}
