use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use edgesec_core::audit::InMemoryAuditSink;
use edgesec_core::config::RolloutConfig;
use edgesec_core::domain::rollout::{
    ActivePhase, ExecutionId, PhaseDecision, PhaseMetrics, PhaseResult, VariantId,
};
use edgesec_core::rollout::orchestrator::{
    ABORTED_IN_PRODUCTION_REASON, ABORTED_REASON, ERROR_BUDGET_REASON, HIGH_FALSE_POSITIVE_REASON,
};
use edgesec_core::rollout::deployer::DeployerCall;
use edgesec_core::rollout::store::StoreError;
use edgesec_core::rollout::{
    DeployRequest, DeploymentError, DeploymentErrorKind, InMemoryRolloutStore,
    InMemoryRuleDeployer, ManualClock, RolloutOrchestrator, RolloutServices, RuleDeployer,
    RuleProposalStore,
};
use edgesec_core::{
    MetricsEvaluator, RawEvent, RolloutError, RolloutExecution, RolloutPhase, RolloutStatus,
    RuleAction, RuleCandidate, RuleId, RuleScope, ValidationError,
};
use tokio::sync::Notify;

struct Harness {
    deployer: InMemoryRuleDeployer,
    store: InMemoryRolloutStore,
    clock: ManualClock,
    audit: InMemoryAuditSink,
    orchestrator: RolloutOrchestrator,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("valid start time")
}

fn harness(deployer: InMemoryRuleDeployer, clock: ManualClock) -> Harness {
    let store = InMemoryRolloutStore::default();
    let provider: Arc<dyn RuleDeployer> = Arc::new(deployer.clone());
    let persistence: Arc<dyn RuleProposalStore> = Arc::new(store.clone());
    harness_with(deployer, store, provider, persistence, clock)
}

/// `provider` and `persistence` wrap `deployer` and `store`, which stay
/// reachable for assertions.
fn harness_with(
    deployer: InMemoryRuleDeployer,
    store: InMemoryRolloutStore,
    provider: Arc<dyn RuleDeployer>,
    persistence: Arc<dyn RuleProposalStore>,
    clock: ManualClock,
) -> Harness {
    let audit = InMemoryAuditSink::default();
    let services = RolloutServices::new(provider, persistence, Arc::new(clock.clone()))
        .with_audit_sink(Arc::new(audit.clone()));
    let orchestrator =
        RolloutOrchestrator::new(services, RolloutConfig::default(), MetricsEvaluator::default());

    Harness { deployer, store, clock, audit, orchestrator }
}

fn auto_harness(deployer: InMemoryRuleDeployer) -> Harness {
    harness(deployer, ManualClock::auto_advancing(start_time()))
}

fn candidate(rule: &str, action: RuleAction) -> RuleCandidate {
    RuleCandidate {
        rule_id: RuleId(rule.to_string()),
        description: "block admin scans".to_string(),
        expression: r#"http.request.uri.path contains "/wp-admin""#.to_string(),
        action,
        scope: RuleScope::Zone,
        rate_limit: None,
    }
}

fn event(path: &str, status: u16) -> RawEvent {
    RawEvent {
        occurred_at: start_time(),
        client_ip: "203.0.113.10".to_string(),
        path: path.to_string(),
        query: None,
        status_code: status,
        user_agent: "Mozilla/5.0".to_string(),
        matched: true,
    }
}

/// `benign` of `total` matched events carry no attack marker.
fn shadow_traffic(total: usize, benign: usize) -> Vec<RawEvent> {
    (0..total)
        .map(|index| {
            if index < benign {
                event("/api/products", 200)
            } else {
                event("/wp-admin/install.php", 403)
            }
        })
        .collect()
}

/// `errors` of `total` matched events answered with a 5xx.
fn enforced_traffic(total: usize, errors: usize) -> Vec<RawEvent> {
    (0..total)
        .map(|index| if index < errors { event("/checkout", 503) } else { event("/checkout", 200) })
        .collect()
}

async fn wait_until_parked(harness: &Harness, rule_id: &RuleId, status: RolloutStatus) {
    for _ in 0..10_000 {
        let parked = harness.clock.sleeper_count() == 1;
        let at_status = harness
            .store
            .load(rule_id)
            .await
            .map(|execution| execution.status == status)
            .unwrap_or(false);
        if parked && at_status {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("rollout never parked in {status:?}");
}

/// Stores an execution that is mid-way through `phase` with its variant
/// already live, as a crashed process would have left it.
async fn seed_in_flight(
    harness: &Harness,
    rule: &RuleCandidate,
    phase: RolloutPhase,
    window_started_at: DateTime<Utc>,
    window_ends_at: DateTime<Utc>,
) -> (RolloutExecution, VariantId) {
    let now = start_time();
    let mut execution = RolloutExecution::new(rule.clone(), 30, "corr-seeded", now);
    let variant_key = format!("{}:{}:persisted", rule.rule_id, phase.as_str());
    let action_override = match phase {
        RolloutPhase::Simulation => Some(RuleAction::Log),
        RolloutPhase::Canary => Some(rule.action.canary_action()),
        RolloutPhase::Production => None,
    };
    let variant_id = harness
        .deployer
        .deploy(&DeployRequest {
            idempotency_key: variant_key.clone(),
            rule_id: rule.rule_id.clone(),
            execution_id: execution.id.clone(),
            phase,
            candidate: rule.clone(),
            action_override,
        })
        .await
        .expect("pre-deployed variant");

    execution.status = match phase {
        RolloutPhase::Simulation => RolloutStatus::Simulating,
        RolloutPhase::Canary => RolloutStatus::Canarying,
        RolloutPhase::Production => RolloutStatus::Monitoring,
    };
    if phase > RolloutPhase::Simulation {
        execution.phase_history.push(PhaseResult {
            phase: RolloutPhase::Simulation,
            deployed_variant_id: None,
            started_at: now,
            ended_at: now + Duration::minutes(10),
            metrics: PhaseMetrics::NotCollected,
            decision: PhaseDecision::Proceed,
            reason: None,
        });
    }
    execution.active_phase = Some(ActivePhase {
        phase,
        started_at: window_started_at,
        variant_key,
        variant_id: Some(variant_id.clone()),
        window_started_at: Some(window_started_at),
        window_ends_at: Some(window_ends_at),
    });
    execution.state_version = 4;
    harness.store.save(&execution).await.expect("seed checkpoint");
    (execution, variant_id)
}

/// Provider whose `remove` hangs until released.
#[derive(Clone)]
struct StalledRemovals {
    inner: InMemoryRuleDeployer,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl StalledRemovals {
    fn new(inner: InMemoryRuleDeployer) -> Self {
        Self { inner, entered: Arc::new(Notify::new()), release: Arc::new(Notify::new()) }
    }
}

#[async_trait]
impl RuleDeployer for StalledRemovals {
    async fn deploy(&self, request: &DeployRequest) -> Result<VariantId, DeploymentError> {
        self.inner.deploy(request).await
    }

    async fn find_variant(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<VariantId>, DeploymentError> {
        self.inner.find_variant(idempotency_key).await
    }

    async fn remove(&self, variant_id: &VariantId) -> Result<(), DeploymentError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.remove(variant_id).await
    }

    async fn fetch_events(
        &self,
        variant_id: &VariantId,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>, DeploymentError> {
        self.inner.fetch_events(variant_id, window_start, window_end).await
    }
}

/// Store that fails scripted saves. A lost acknowledgement commits the write
/// and still reports a backend failure.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: InMemoryRolloutStore,
    rejected_saves: Arc<AtomicUsize>,
    lost_acks: Arc<AtomicUsize>,
    save_calls: Arc<AtomicUsize>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)).is_ok()
}

#[async_trait]
impl RuleProposalStore for FlakyStore {
    async fn save(&self, execution: &RolloutExecution) -> Result<(), StoreError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.rejected_saves) {
            return Err(StoreError::Backend("database is locked".to_string()));
        }
        self.inner.save(execution).await?;
        if take_one(&self.lost_acks) {
            return Err(StoreError::Backend("connection reset after commit".to_string()));
        }
        Ok(())
    }

    async fn load(&self, rule_id: &RuleId) -> Result<RolloutExecution, StoreError> {
        self.inner.load(rule_id).await
    }

    async fn load_execution(&self, id: &ExecutionId) -> Result<RolloutExecution, StoreError> {
        self.inner.load_execution(id).await
    }

    async fn list_for_rule(&self, rule_id: &RuleId) -> Result<Vec<RolloutExecution>, StoreError> {
        self.inner.list_for_rule(rule_id).await
    }

    async fn list_unfinished(&self) -> Result<Vec<RolloutExecution>, StoreError> {
        self.inner.list_unfinished().await
    }
}

#[tokio::test]
async fn high_false_positive_rate_fails_in_simulation_without_canary() {
    let deployer = InMemoryRuleDeployer::default()
        .with_events(RolloutPhase::Simulation, shadow_traffic(5, 1));
    let harness = auto_harness(deployer);
    let rule_id = RuleId("rule-fp".to_string());

    harness.orchestrator.start_rollout(candidate("rule-fp", RuleAction::Block), 30).await.expect("start");
    let execution = harness.orchestrator.wait_for(&rule_id).await.expect("finished");

    assert_eq!(execution.status, RolloutStatus::Failed);
    assert_eq!(execution.phase_history.len(), 1);
    let simulation = &execution.phase_history[0];
    assert_eq!(simulation.phase, RolloutPhase::Simulation);
    assert_eq!(simulation.decision, PhaseDecision::Rollback);
    assert_eq!(simulation.reason.as_deref(), Some(HIGH_FALSE_POSITIVE_REASON));
    assert_eq!(simulation.metrics.rate_pct(), Some(20.0));

    let failure = execution.failure.expect("failure recorded");
    assert_eq!(failure.phase, RolloutPhase::Simulation);
    assert_eq!(failure.error_class, "threshold_exceeded");

    assert_eq!(harness.deployer.deploy_attempts(RolloutPhase::Canary), 0);
    assert!(harness.deployer.live_variants().is_empty(), "shadow variant must be removed");
    assert_eq!(harness.deployer.variants()[0].action, RuleAction::Log);
    assert!(execution.completed_at.is_some());
}

#[tokio::test]
async fn healthy_rule_walks_every_phase_and_keeps_only_production() {
    let deployer = InMemoryRuleDeployer::default()
        .with_events(RolloutPhase::Simulation, shadow_traffic(25, 2))
        .with_events(RolloutPhase::Canary, enforced_traffic(50, 1))
        .with_events(RolloutPhase::Production, enforced_traffic(40, 0));
    let harness = auto_harness(deployer);
    let rule_id = RuleId("rule-ok".to_string());

    let execution_id = harness
        .orchestrator
        .start_rollout(candidate("rule-ok", RuleAction::Block), 30)
        .await
        .expect("start");
    let execution = harness.orchestrator.wait_for(&rule_id).await.expect("finished");

    assert_eq!(execution.id, execution_id);
    assert_eq!(execution.status, RolloutStatus::Succeeded);
    assert!(execution.history_is_ordered());
    assert_eq!(execution.phase_history.len(), 3);
    assert!(execution
        .phase_history
        .iter()
        .all(|result| result.decision == PhaseDecision::Proceed && result.reason.is_none()));
    assert_eq!(execution.result_for(RolloutPhase::Simulation).and_then(|r| r.metrics.rate_pct()), Some(8.0));
    assert_eq!(execution.result_for(RolloutPhase::Canary).and_then(|r| r.metrics.rate_pct()), Some(2.0));
    assert!(execution.active_phase.is_none());
    assert!(execution.failure.is_none());

    let variants = harness.deployer.variants();
    let shape: Vec<(RolloutPhase, RuleAction, bool)> =
        variants.iter().map(|variant| (variant.phase, variant.action, variant.live)).collect();
    assert_eq!(
        shape,
        vec![
            (RolloutPhase::Simulation, RuleAction::Log, false),
            (RolloutPhase::Canary, RuleAction::Challenge, false),
            (RolloutPhase::Production, RuleAction::Block, true),
        ]
    );

    let canary = execution.result_for(RolloutPhase::Canary).expect("canary result");
    let window = canary.ended_at - canary.started_at;
    assert!(window >= Duration::minutes(30), "canary observed for its full window");
}

#[tokio::test]
async fn canary_over_error_budget_fails_and_removes_canary() {
    let deployer = InMemoryRuleDeployer::default()
        .with_events(RolloutPhase::Simulation, shadow_traffic(10, 0))
        .with_events(RolloutPhase::Canary, enforced_traffic(100, 7));
    let harness = auto_harness(deployer);
    let rule_id = RuleId("rule-canary".to_string());

    harness
        .orchestrator
        .start_rollout(candidate("rule-canary", RuleAction::Challenge), 15)
        .await
        .expect("start");
    let execution = harness.orchestrator.wait_for(&rule_id).await.expect("finished");

    assert_eq!(execution.status, RolloutStatus::Failed);
    let canary = execution.phase_history.last().expect("canary result");
    assert_eq!(canary.phase, RolloutPhase::Canary);
    assert_eq!(canary.decision, PhaseDecision::Rollback);
    assert_eq!(canary.reason.as_deref(), Some(ERROR_BUDGET_REASON));
    assert!(matches!(canary.metrics, PhaseMetrics::ErrorRate { errored_requests: 7, .. }));

    assert_eq!(harness.deployer.deploy_attempts(RolloutPhase::Production), 0);
    assert!(harness.deployer.live_variants().is_empty());
    assert_eq!(execution.failure.map(|failure| failure.phase), Some(RolloutPhase::Canary));
}

#[tokio::test]
async fn production_error_rate_above_warning_threshold_is_flagged_not_rolled_back() {
    let deployer = InMemoryRuleDeployer::default()
        .with_events(RolloutPhase::Production, enforced_traffic(50, 6));
    let harness = auto_harness(deployer);
    let rule_id = RuleId("rule-warn".to_string());

    harness.orchestrator.start_rollout(candidate("rule-warn", RuleAction::Block), 5).await.expect("start");
    let execution = harness.orchestrator.wait_for(&rule_id).await.expect("finished");

    assert_eq!(execution.status, RolloutStatus::Succeeded);
    let production = execution.result_for(RolloutPhase::Production).expect("production result");
    assert_eq!(production.decision, PhaseDecision::Warn);
    assert!(production.reason.as_deref().is_some_and(|reason| reason.contains("warning threshold")));
    assert_eq!(harness.deployer.live_variants().len(), 1, "production rule stays deployed");
    assert_eq!(harness.audit.events_of_type("rollout.production.warning").len(), 1);
}

#[tokio::test]
async fn second_start_for_active_rule_conflicts_and_abort_cleans_up_shadow() {
    let harness = harness(InMemoryRuleDeployer::default(), ManualClock::new(start_time()));
    let rule_id = RuleId("rule-busy".to_string());

    let first = harness
        .orchestrator
        .start_rollout(candidate("rule-busy", RuleAction::Block), 30)
        .await
        .expect("first start");
    wait_until_parked(&harness, &rule_id, RolloutStatus::Simulating).await;

    let conflict = harness
        .orchestrator
        .start_rollout(candidate("rule-busy", RuleAction::Block), 30)
        .await
        .expect_err("second start must conflict");
    assert_eq!(
        conflict,
        RolloutError::ConcurrencyConflict { rule_id: rule_id.clone(), execution_id: first.clone() }
    );
    assert_eq!(harness.deployer.live_variants().len(), 1);

    let aborted = harness.orchestrator.abort(&rule_id).await.expect("abort");

    assert_eq!(aborted.id, first);
    assert_eq!(aborted.status, RolloutStatus::Aborted);
    let simulation = aborted.phase_history.last().expect("aborted phase recorded");
    assert_eq!(simulation.phase, RolloutPhase::Simulation);
    assert_eq!(simulation.decision, PhaseDecision::Rollback);
    assert_eq!(simulation.reason.as_deref(), Some(ABORTED_REASON));
    assert!(harness.deployer.live_variants().is_empty());

    let again = harness.orchestrator.abort(&rule_id).await.expect_err("already aborted");
    assert_eq!(again.error_class(), "not_active");
}

#[tokio::test]
async fn abort_while_monitoring_keeps_the_production_rule() {
    let harness = harness(InMemoryRuleDeployer::default(), ManualClock::new(start_time()));
    let rule_id = RuleId("rule-late-abort".to_string());

    harness
        .orchestrator
        .start_rollout(candidate("rule-late-abort", RuleAction::Block), 20)
        .await
        .expect("start");

    wait_until_parked(&harness, &rule_id, RolloutStatus::Simulating).await;
    harness.clock.advance(Duration::minutes(10));
    wait_until_parked(&harness, &rule_id, RolloutStatus::Canarying).await;
    harness.clock.advance(Duration::minutes(20));
    wait_until_parked(&harness, &rule_id, RolloutStatus::Monitoring).await;

    let aborted = harness.orchestrator.abort(&rule_id).await.expect("abort");

    assert_eq!(aborted.status, RolloutStatus::Aborted);
    let production = aborted.phase_history.last().expect("production entry");
    assert_eq!(production.phase, RolloutPhase::Production);
    assert_eq!(production.decision, PhaseDecision::Warn);
    assert_eq!(production.reason.as_deref(), Some(ABORTED_IN_PRODUCTION_REASON));
    let live = harness.deployer.live_variants();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].phase, RolloutPhase::Production);
}

#[tokio::test]
async fn transient_provider_failures_are_retried() {
    let deployer = InMemoryRuleDeployer::default();
    deployer.fail_next_deploy(
        RolloutPhase::Simulation,
        DeploymentError::new(DeploymentErrorKind::RateLimited, "slow down"),
    );
    deployer.fail_next_deploy(
        RolloutPhase::Simulation,
        DeploymentError::new(DeploymentErrorKind::ProviderUnavailable, "502 from edge api"),
    );
    let harness = auto_harness(deployer);
    let rule_id = RuleId("rule-retry".to_string());

    harness.orchestrator.start_rollout(candidate("rule-retry", RuleAction::Log), 10).await.expect("start");
    let execution = harness.orchestrator.wait_for(&rule_id).await.expect("finished");

    assert_eq!(execution.status, RolloutStatus::Succeeded);
    assert_eq!(harness.deployer.deploy_attempts(RolloutPhase::Simulation), 3);
}

#[tokio::test]
async fn permanent_provider_failure_fails_rollout_and_records_class() {
    let deployer = InMemoryRuleDeployer::default();
    deployer.fail_next_deploy(
        RolloutPhase::Canary,
        DeploymentError::new(DeploymentErrorKind::Unauthorized, "token revoked"),
    );
    let harness = auto_harness(deployer);
    let rule_id = RuleId("rule-denied".to_string());

    harness.orchestrator.start_rollout(candidate("rule-denied", RuleAction::Block), 10).await.expect("start");
    let execution = harness.orchestrator.wait_for(&rule_id).await.expect("finished");

    assert_eq!(execution.status, RolloutStatus::Failed);
    assert_eq!(harness.deployer.deploy_attempts(RolloutPhase::Canary), 1, "no retry on 401");
    let failure = execution.failure.expect("failure");
    assert_eq!(failure.phase, RolloutPhase::Canary);
    assert_eq!(failure.error_class, "unauthorized");
    assert!(harness.deployer.live_variants().is_empty());
    assert_eq!(execution.phase_history.last().map(|r| r.decision), Some(PhaseDecision::Rollback));
}

#[tokio::test]
async fn resume_continues_from_checkpoint_without_redeploying() {
    let harness = auto_harness(InMemoryRuleDeployer::default());
    let rule = candidate("rule-resume", RuleAction::Block);
    let now = start_time();
    let (execution, variant_id) = seed_in_flight(
        &harness,
        &rule,
        RolloutPhase::Canary,
        now + Duration::minutes(10),
        now + Duration::minutes(40),
    )
    .await;

    let resumed = harness.orchestrator.resume_unfinished().await.expect("resume");
    assert_eq!(resumed, vec![execution.id.clone()]);

    let finished = harness.orchestrator.wait_for(&rule.rule_id).await.expect("finished");
    assert_eq!(finished.status, RolloutStatus::Succeeded);
    assert_eq!(harness.deployer.deploy_attempts(RolloutPhase::Canary), 1, "canary not redeployed");
    assert_eq!(
        finished.result_for(RolloutPhase::Canary).and_then(|r| r.deployed_variant_id.clone()),
        Some(variant_id)
    );
    assert!(finished.state_version > 4);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_anything_is_recorded() {
    let harness = auto_harness(InMemoryRuleDeployer::default());

    let too_long = harness
        .orchestrator
        .start_rollout(candidate("rule-bad", RuleAction::Block), 1441)
        .await
        .expect_err("canary longer than a day");
    assert!(matches!(
        too_long,
        RolloutError::Validation(ValidationError::DurationOutOfRange { value: 1441, .. })
    ));

    let mut empty = candidate("rule-bad", RuleAction::Block);
    empty.expression = "   ".to_string();
    let error = harness.orchestrator.start_rollout(empty, 30).await.expect_err("empty expression");
    assert_eq!(error.error_class(), "validation");

    let missing = harness
        .orchestrator
        .get_status(&RuleId("rule-bad".to_string()))
        .await
        .expect_err("nothing recorded");
    assert_eq!(missing, RolloutError::NotFound(RuleId("rule-bad".to_string())));
    assert!(harness.deployer.calls().is_empty());
}

#[tokio::test]
async fn finished_rollouts_stay_in_history_and_allow_a_new_attempt() {
    let deployer = InMemoryRuleDeployer::default()
        .with_events(RolloutPhase::Simulation, shadow_traffic(4, 4));
    let harness = auto_harness(deployer);
    let rule_id = RuleId("rule-again".to_string());

    let first = harness
        .orchestrator
        .start_rollout(candidate("rule-again", RuleAction::Block), 10)
        .await
        .expect("first");
    harness.orchestrator.wait_for(&rule_id).await.expect("first finished");
    harness.clock.advance(Duration::minutes(1));
    let second = harness
        .orchestrator
        .start_rollout(candidate("rule-again", RuleAction::Block), 10)
        .await
        .expect("second start after terminal");
    harness.orchestrator.wait_for(&rule_id).await.expect("second finished");

    let history = harness.orchestrator.history(&rule_id).await.expect("history");
    let ids: Vec<_> = history.iter().map(|execution| execution.id.clone()).collect();
    assert_eq!(ids, vec![first, second]);
    assert!(history.iter().all(|execution| execution.status == RolloutStatus::Failed));
}

#[tokio::test]
async fn abort_during_deploy_backoff_removes_variant_whose_response_was_lost() {
    let deployer = InMemoryRuleDeployer::default();
    deployer.lose_next_deploy_response(
        RolloutPhase::Simulation,
        DeploymentError::new(DeploymentErrorKind::Timeout, "gateway timed out after create"),
    );
    let harness = harness(deployer, ManualClock::new(start_time()));
    let rule_id = RuleId("rule-lost-ack".to_string());

    harness
        .orchestrator
        .start_rollout(candidate("rule-lost-ack", RuleAction::Block), 30)
        .await
        .expect("start");
    // Parked in the retry backoff: the shadow exists but its id was never recorded.
    wait_until_parked(&harness, &rule_id, RolloutStatus::Simulating).await;
    let stored = harness.store.load(&rule_id).await.expect("checkpoint");
    assert_eq!(stored.active_phase.and_then(|active| active.variant_id), None);
    let shadow = harness.deployer.live_variants();
    assert_eq!(shadow.len(), 1);

    let aborted = harness.orchestrator.abort(&rule_id).await.expect("abort");

    assert_eq!(aborted.status, RolloutStatus::Aborted);
    assert!(harness.deployer.live_variants().is_empty(), "shadow variant left live");
    assert_eq!(
        aborted.phase_history.last().and_then(|result| result.deployed_variant_id.clone()),
        Some(shadow[0].variant_id.clone())
    );
    assert!(harness
        .deployer
        .calls()
        .iter()
        .any(|call| matches!(call, DeployerCall::FindVariant { .. })));
}

#[tokio::test]
async fn exhausted_retries_after_lost_responses_still_remove_the_canary() {
    let deployer = InMemoryRuleDeployer::default();
    for _ in 0..3 {
        deployer.lose_next_deploy_response(
            RolloutPhase::Canary,
            DeploymentError::new(DeploymentErrorKind::ProviderUnavailable, "502 after create"),
        );
    }
    let harness = auto_harness(deployer);
    let rule_id = RuleId("rule-lost-canary".to_string());

    harness
        .orchestrator
        .start_rollout(candidate("rule-lost-canary", RuleAction::Block), 10)
        .await
        .expect("start");
    let execution = harness.orchestrator.wait_for(&rule_id).await.expect("finished");

    assert_eq!(execution.status, RolloutStatus::Failed);
    let failure = execution.failure.expect("failure");
    assert_eq!(failure.phase, RolloutPhase::Canary);
    assert_eq!(failure.error_class, "provider_unavailable");
    assert_eq!(harness.deployer.deploy_attempts(RolloutPhase::Canary), 3);

    let canaries: Vec<_> = harness
        .deployer
        .variants()
        .into_iter()
        .filter(|variant| variant.phase == RolloutPhase::Canary)
        .collect();
    assert_eq!(canaries.len(), 1, "idempotent key never creates a second canary");
    assert!(!canaries[0].live);
    assert!(harness.deployer.live_variants().is_empty());
}

#[tokio::test]
async fn monitoring_fetch_failure_fails_rollout_and_removes_production_rule() {
    let deployer = InMemoryRuleDeployer::default();
    deployer.fail_next_fetch(
        RolloutPhase::Production,
        DeploymentError::new(DeploymentErrorKind::Unauthorized, "analytics token revoked"),
    );
    let harness = auto_harness(deployer);
    let rule_id = RuleId("rule-blind".to_string());

    harness.orchestrator.start_rollout(candidate("rule-blind", RuleAction::Block), 10).await.expect("start");
    let execution = harness.orchestrator.wait_for(&rule_id).await.expect("finished");

    assert_eq!(execution.status, RolloutStatus::Failed);
    assert!(execution.history_is_ordered());
    let decisions: Vec<_> = execution.phase_history.iter().map(|result| result.decision).collect();
    assert_eq!(
        decisions,
        vec![PhaseDecision::Proceed, PhaseDecision::Proceed, PhaseDecision::Rollback]
    );
    let failure = execution.failure.expect("failure");
    assert_eq!(failure.phase, RolloutPhase::Production);
    assert_eq!(failure.error_class, "unauthorized");
    assert!(harness.deployer.live_variants().is_empty());
}

#[tokio::test]
async fn cleanup_failure_after_failed_canary_keeps_threshold_reason() {
    let deployer = InMemoryRuleDeployer::default()
        .with_events(RolloutPhase::Simulation, shadow_traffic(10, 0))
        .with_events(RolloutPhase::Canary, enforced_traffic(100, 7));
    deployer.fail_next_remove(
        RolloutPhase::Canary,
        DeploymentError::new(DeploymentErrorKind::Unauthorized, "token revoked mid-rollout"),
    );
    let harness = auto_harness(deployer);
    let rule_id = RuleId("rule-sticky-canary".to_string());

    harness
        .orchestrator
        .start_rollout(candidate("rule-sticky-canary", RuleAction::Block), 15)
        .await
        .expect("start");
    let execution = harness.orchestrator.wait_for(&rule_id).await.expect("finished");

    assert_eq!(execution.status, RolloutStatus::Failed);
    let failure = execution.failure.expect("failure");
    assert_eq!(failure.phase, RolloutPhase::Canary);
    assert_eq!(failure.reason, ERROR_BUDGET_REASON);
    assert_eq!(failure.error_class, "threshold_exceeded");
    assert!(matches!(failure.last_metrics, Some(PhaseMetrics::ErrorRate { errored_requests: 7, .. })));
    assert_eq!(harness.audit.events_of_type("rollout.cleanup.failed").len(), 1);

    let live = harness.deployer.live_variants();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].phase, RolloutPhase::Canary);
}

#[tokio::test]
async fn remove_failure_after_passing_window_fails_the_phase() {
    let deployer = InMemoryRuleDeployer::default()
        .with_events(RolloutPhase::Simulation, shadow_traffic(25, 2));
    deployer.fail_next_remove(
        RolloutPhase::Simulation,
        DeploymentError::new(DeploymentErrorKind::Unauthorized, "token revoked mid-rollout"),
    );
    let harness = auto_harness(deployer);
    let rule_id = RuleId("rule-stuck-shadow".to_string());

    harness
        .orchestrator
        .start_rollout(candidate("rule-stuck-shadow", RuleAction::Block), 10)
        .await
        .expect("start");
    let execution = harness.orchestrator.wait_for(&rule_id).await.expect("finished");

    assert_eq!(execution.status, RolloutStatus::Failed);
    assert_eq!(execution.phase_history.len(), 1);
    let simulation = &execution.phase_history[0];
    assert_eq!(simulation.decision, PhaseDecision::Rollback);
    assert_eq!(simulation.metrics.rate_pct(), Some(8.0));
    let failure = execution.failure.expect("failure");
    assert_eq!(failure.phase, RolloutPhase::Simulation);
    assert_eq!(failure.error_class, "unauthorized");

    assert_eq!(harness.deployer.deploy_attempts(RolloutPhase::Canary), 0);
    assert_eq!(harness.audit.events_of_type("rollout.cleanup.failed").len(), 1);
    assert!(harness.deployer.live_variants().is_empty(), "failure cleanup retries the removal");
}

#[tokio::test]
async fn resume_mid_window_waits_only_for_the_remaining_time() {
    let now = start_time();
    let harness =
        harness(InMemoryRuleDeployer::default(), ManualClock::new(now + Duration::minutes(25)));
    let rule = candidate("rule-mid-window", RuleAction::Block);
    let (_, variant_id) = seed_in_flight(
        &harness,
        &rule,
        RolloutPhase::Canary,
        now + Duration::minutes(10),
        now + Duration::minutes(40),
    )
    .await;

    harness.orchestrator.resume_unfinished().await.expect("resume");
    wait_until_parked(&harness, &rule.rule_id, RolloutStatus::Canarying).await;

    harness.clock.advance(Duration::minutes(14));
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
    let fetched = |calls: Vec<DeployerCall>| {
        calls.iter().any(|call| matches!(call, DeployerCall::FetchEvents { .. }))
    };
    assert!(!fetched(harness.deployer.calls()), "window still has a minute left");
    assert_eq!(harness.clock.sleeper_count(), 1);

    harness.clock.advance(Duration::minutes(1));
    wait_until_parked(&harness, &rule.rule_id, RolloutStatus::Monitoring).await;

    let execution = harness.orchestrator.get_status(&rule.rule_id).await.expect("status");
    let canary = execution.result_for(RolloutPhase::Canary).expect("canary result");
    assert_eq!(canary.ended_at, now + Duration::minutes(40));
    assert_eq!(canary.deployed_variant_id, Some(variant_id));
    assert_eq!(harness.deployer.deploy_attempts(RolloutPhase::Canary), 1, "canary not redeployed");
    assert!(execution.history_is_ordered());
}

#[tokio::test]
async fn orphaned_abort_cleans_up_without_blocking_other_rules() {
    let deployer = InMemoryRuleDeployer::default();
    let store = InMemoryRolloutStore::default();
    let stalled = StalledRemovals::new(deployer.clone());
    let harness = harness_with(
        deployer,
        store.clone(),
        Arc::new(stalled.clone()),
        Arc::new(store),
        ManualClock::new(start_time()),
    );
    let rule = candidate("rule-orphan", RuleAction::Block);
    let (seeded, variant_id) = seed_in_flight(
        &harness,
        &rule,
        RolloutPhase::Simulation,
        start_time(),
        start_time() + Duration::minutes(10),
    )
    .await;

    let orchestrator = harness.orchestrator.clone();
    let rule_id = rule.rule_id.clone();
    let abort = tokio::spawn(async move { orchestrator.abort(&rule_id).await });
    stalled.entered.notified().await;

    let unrelated = tokio::time::timeout(
        std::time::Duration::from_millis(500),
        harness.orchestrator.start_rollout(candidate("rule-unrelated", RuleAction::Block), 30),
    )
    .await;
    assert!(matches!(unrelated, Ok(Ok(_))), "unrelated rule waited on cleanup: {unrelated:?}");

    let conflict = harness
        .orchestrator
        .start_rollout(candidate("rule-orphan", RuleAction::Block), 30)
        .await
        .expect_err("rule is still being aborted");
    assert_eq!(
        conflict,
        RolloutError::ConcurrencyConflict {
            rule_id: rule.rule_id.clone(),
            execution_id: seeded.id.clone(),
        }
    );

    stalled.release.notify_one();
    let aborted = abort.await.expect("abort task").expect("abort");

    assert_eq!(aborted.id, seeded.id);
    assert_eq!(aborted.status, RolloutStatus::Aborted);
    assert_eq!(
        aborted.phase_history.last().and_then(|result| result.reason.as_deref()),
        Some(ABORTED_REASON)
    );
    assert!(harness
        .deployer
        .live_variants()
        .iter()
        .all(|variant| variant.variant_id != variant_id));
    assert_eq!(
        harness.orchestrator.get_status(&rule.rule_id).await.expect("status").status,
        RolloutStatus::Aborted
    );
}

#[tokio::test]
async fn store_write_failures_are_retried_before_giving_up() {
    let deployer = InMemoryRuleDeployer::default();
    let flaky = FlakyStore::default();
    flaky.rejected_saves.store(1, Ordering::SeqCst);
    flaky.lost_acks.store(1, Ordering::SeqCst);
    let harness = harness_with(
        deployer.clone(),
        flaky.inner.clone(),
        Arc::new(deployer),
        Arc::new(flaky.clone()),
        ManualClock::auto_advancing(start_time()),
    );
    let rule_id = RuleId("rule-flaky-db".to_string());

    harness
        .orchestrator
        .start_rollout(candidate("rule-flaky-db", RuleAction::Block), 10)
        .await
        .expect("start survives a locked database and a lost commit ack");
    let execution = harness.orchestrator.wait_for(&rule_id).await.expect("finished");

    assert_eq!(execution.status, RolloutStatus::Succeeded);
    let stored = harness.store.load(&rule_id).await.expect("stored");
    assert_eq!(stored.status, RolloutStatus::Succeeded);
    assert_eq!(stored.state_version, execution.state_version);
    let versions = usize::try_from(execution.state_version).expect("small version");
    assert_eq!(flaky.save_calls.load(Ordering::SeqCst), versions + 2, "two retried saves");
}
