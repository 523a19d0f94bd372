use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::candidate::{RuleAction, RuleCandidate, RuleId};
use crate::domain::rollout::{ExecutionId, RolloutPhase, VariantId};
use crate::domain::traffic::RawEvent;

/// One variant deployment. Providers must treat `idempotency_key` as the
/// identity of the variant: a repeated request with the same key returns the
/// variant that already exists instead of creating another one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub idempotency_key: String,
    pub rule_id: RuleId,
    pub execution_id: ExecutionId,
    pub phase: RolloutPhase,
    pub candidate: RuleCandidate,
    pub action_override: Option<RuleAction>,
}

impl DeployRequest {
    pub fn effective_action(&self) -> RuleAction {
        self.action_override.unwrap_or(self.candidate.action)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentErrorKind {
    Timeout,
    ProviderUnavailable,
    RateLimited,
    Unauthorized,
    RejectedExpression,
    NotFound,
}

impl DeploymentErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::RateLimited => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::RejectedExpression => "rejected_expression",
            Self::NotFound => "not_found",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::ProviderUnavailable | Self::RateLimited)
    }

    /// Maps a provider HTTP status onto the retry classification.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Unauthorized,
            404 => Self::NotFound,
            408 | 504 => Self::Timeout,
            429 => Self::RateLimited,
            400..=499 => Self::RejectedExpression,
            _ => Self::ProviderUnavailable,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{} deployment failure: {message}", .kind.as_str())]
pub struct DeploymentError {
    pub kind: DeploymentErrorKind,
    pub message: String,
}

impl DeploymentError {
    pub fn new(kind: DeploymentErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Capability for pushing rule variants to the enforcement provider.
#[async_trait]
pub trait RuleDeployer: Send + Sync {
    async fn deploy(&self, request: &DeployRequest) -> Result<VariantId, DeploymentError>;

    /// Variant created for `idempotency_key`, if the provider has one. Used to
    /// find a variant whose deploy response never arrived.
    async fn find_variant(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<VariantId>, DeploymentError>;

    /// Removing a variant that no longer exists succeeds.
    async fn remove(&self, variant_id: &VariantId) -> Result<(), DeploymentError>;

    /// Requests observed while the variant was live. An empty list is valid.
    async fn fetch_events(
        &self,
        variant_id: &VariantId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>, DeploymentError>;
}

// ---------------------------------------------------------------------------
// In-memory deployer
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeployerCall {
    Deploy { phase: RolloutPhase, idempotency_key: String, action: RuleAction },
    FindVariant { idempotency_key: String },
    Remove { variant_id: VariantId },
    FetchEvents { variant_id: VariantId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployedVariant {
    pub variant_id: VariantId,
    pub phase: RolloutPhase,
    pub action: RuleAction,
    pub live: bool,
}

/// Scripted provider double: per-phase event sets, injectable failures, and a
/// call log for asserting deploy/remove ordering.
#[derive(Clone, Default)]
pub struct InMemoryRuleDeployer {
    state: Arc<Mutex<FakeProviderState>>,
}

#[derive(Default)]
struct FakeProviderState {
    next_variant: u64,
    variants: BTreeMap<String, DeployedVariant>,
    by_key: HashMap<String, VariantId>,
    events: HashMap<RolloutPhase, Vec<RawEvent>>,
    deploy_failures: HashMap<RolloutPhase, VecDeque<DeploymentError>>,
    lost_responses: HashMap<RolloutPhase, VecDeque<DeploymentError>>,
    remove_failures: HashMap<RolloutPhase, VecDeque<DeploymentError>>,
    fetch_failures: HashMap<RolloutPhase, VecDeque<DeploymentError>>,
    calls: Vec<DeployerCall>,
}

impl InMemoryRuleDeployer {
    fn state(&self) -> MutexGuard<'_, FakeProviderState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn with_events(self, phase: RolloutPhase, events: Vec<RawEvent>) -> Self {
        self.state().events.insert(phase, events);
        self
    }

    pub fn fail_next_deploy(&self, phase: RolloutPhase, error: DeploymentError) {
        self.state().deploy_failures.entry(phase).or_default().push_back(error);
    }

    /// The next deploy for `phase` creates its variant but answers with `error`.
    pub fn lose_next_deploy_response(&self, phase: RolloutPhase, error: DeploymentError) {
        self.state().lost_responses.entry(phase).or_default().push_back(error);
    }

    pub fn fail_next_remove(&self, phase: RolloutPhase, error: DeploymentError) {
        self.state().remove_failures.entry(phase).or_default().push_back(error);
    }

    pub fn fail_next_fetch(&self, phase: RolloutPhase, error: DeploymentError) {
        self.state().fetch_failures.entry(phase).or_default().push_back(error);
    }

    pub fn calls(&self) -> Vec<DeployerCall> {
        self.state().calls.clone()
    }

    /// Every variant ever created, in creation order.
    pub fn variants(&self) -> Vec<DeployedVariant> {
        let state = self.state();
        let mut variants: Vec<DeployedVariant> = state.variants.values().cloned().collect();
        variants.sort_by_key(|variant| variant_sequence(&variant.variant_id));
        variants
    }

    pub fn live_variants(&self) -> Vec<DeployedVariant> {
        self.variants().into_iter().filter(|variant| variant.live).collect()
    }

    pub fn deploy_attempts(&self, phase: RolloutPhase) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, DeployerCall::Deploy { phase: p, .. } if *p == phase))
            .count()
    }
}

fn variant_sequence(variant_id: &VariantId) -> u64 {
    variant_id.0.rsplit('-').next().and_then(|tail| tail.parse().ok()).unwrap_or(u64::MAX)
}

#[async_trait]
impl RuleDeployer for InMemoryRuleDeployer {
    async fn deploy(&self, request: &DeployRequest) -> Result<VariantId, DeploymentError> {
        let mut state = self.state();
        let action = request.effective_action();
        state.calls.push(DeployerCall::Deploy {
            phase: request.phase,
            idempotency_key: request.idempotency_key.clone(),
            action,
        });

        if let Some(error) =
            state.deploy_failures.get_mut(&request.phase).and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let variant_id = match state.by_key.get(&request.idempotency_key) {
            Some(existing) => existing.clone(),
            None => {
                state.next_variant += 1;
                let variant_id =
                    VariantId(format!("var-{}-{}", request.phase.as_str(), state.next_variant));
                state.by_key.insert(request.idempotency_key.clone(), variant_id.clone());
                state.variants.insert(
                    variant_id.0.clone(),
                    DeployedVariant {
                        variant_id: variant_id.clone(),
                        phase: request.phase,
                        action,
                        live: true,
                    },
                );
                variant_id
            }
        };

        if let Some(error) =
            state.lost_responses.get_mut(&request.phase).and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(variant_id)
    }

    async fn find_variant(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<VariantId>, DeploymentError> {
        let mut state = self.state();
        state.calls.push(DeployerCall::FindVariant { idempotency_key: idempotency_key.to_string() });
        Ok(state.by_key.get(idempotency_key).cloned())
    }

    async fn remove(&self, variant_id: &VariantId) -> Result<(), DeploymentError> {
        let mut state = self.state();
        state.calls.push(DeployerCall::Remove { variant_id: variant_id.clone() });

        let phase = state.variants.get(&variant_id.0).map(|variant| variant.phase);
        if let Some(error) = phase
            .and_then(|phase| state.remove_failures.get_mut(&phase))
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        if let Some(variant) = state.variants.get_mut(&variant_id.0) {
            variant.live = false;
        }
        Ok(())
    }

    async fn fetch_events(
        &self,
        variant_id: &VariantId,
        _window_start: DateTime<Utc>,
        _window_end: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>, DeploymentError> {
        let mut state = self.state();
        state.calls.push(DeployerCall::FetchEvents { variant_id: variant_id.clone() });

        let phase = state.variants.get(&variant_id.0).map(|variant| variant.phase).ok_or_else(|| {
            DeploymentError::new(
                DeploymentErrorKind::NotFound,
                format!("variant `{variant_id}` is unknown"),
            )
        })?;
        if let Some(error) = state.fetch_failures.get_mut(&phase).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(state.events.get(&phase).cloned().unwrap_or_default())
    }
}
