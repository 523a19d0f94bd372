//! Staged rollout driver: simulation, canary, then production.
//!
//! Each rule has at most one live execution. The execution record is saved
//! before every suspension point, so a restarted process picks a rollout up from
//! its checkpoint: live variants are reused through their idempotency key and
//! observation windows resume from their persisted end time.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analysis::MetricsEvaluator;
use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink, TracingAuditSink};
use crate::config::RolloutConfig;
use crate::domain::candidate::{RuleAction, RuleCandidate, RuleId, ValidationError};
use crate::domain::rollout::{
    ActivePhase, ExecutionId, PhaseDecision, PhaseMetrics, PhaseResult, RolloutExecution,
    RolloutFailure, RolloutPhase, RolloutStatus, VariantId,
};
use crate::errors::RolloutError;
use crate::rollout::clock::RolloutClock;
use crate::rollout::deployer::{DeployRequest, DeploymentError, DeploymentErrorKind, RuleDeployer};
use crate::rollout::machine::{RolloutEvent, RolloutMachine, RolloutTransitionError};
use crate::rollout::store::{RuleProposalStore, StoreError};

const ACTOR: &str = "rollout-orchestrator";

pub const HIGH_FALSE_POSITIVE_REASON: &str = "high false positive rate";
pub const ERROR_BUDGET_REASON: &str = "error budget exceeded";
pub const ABORTED_REASON: &str = "aborted by operator";
pub const ABORTED_IN_PRODUCTION_REASON: &str = "aborted by operator; production rule retained";

/// Capabilities the orchestrator drives. All are shared trait objects so the
/// same orchestrator runs against a live provider or in-memory doubles.
#[derive(Clone)]
pub struct RolloutServices {
    pub deployer: Arc<dyn RuleDeployer>,
    pub store: Arc<dyn RuleProposalStore>,
    pub clock: Arc<dyn RolloutClock>,
    pub audit: Arc<dyn AuditSink>,
}

impl RolloutServices {
    pub fn new(
        deployer: Arc<dyn RuleDeployer>,
        store: Arc<dyn RuleProposalStore>,
        clock: Arc<dyn RolloutClock>,
    ) -> Self {
        Self { deployer, store, clock, audit: Arc::new(TracingAuditSink) }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }
}

#[derive(Clone)]
pub struct RolloutOrchestrator {
    driver: Arc<Driver>,
}

struct Driver {
    services: RolloutServices,
    config: RolloutConfig,
    evaluator: MetricsEvaluator,
    machine: RolloutMachine,
    running: Mutex<HashMap<RuleId, RunningRollout>>,
}

struct RunningRollout {
    execution_id: ExecutionId,
    cancel: watch::Sender<bool>,
    finished: watch::Receiver<Option<RolloutExecution>>,
}

impl RunningRollout {
    fn is_finished(&self) -> bool {
        self.finished.borrow().is_some()
    }
}

/// Why a phase step stopped before completing.
enum Interrupt {
    Aborted,
    Deployment { error: DeploymentError, metrics: Option<PhaseMetrics> },
    Store(StoreError),
    Transition(RolloutTransitionError),
}

impl Interrupt {
    fn into_deployment_error(self, fallback: &str) -> DeploymentError {
        match self {
            Self::Deployment { error, .. } => error,
            _ => DeploymentError::new(DeploymentErrorKind::ProviderUnavailable, fallback),
        }
    }
}

impl From<StoreError> for Interrupt {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl From<RolloutTransitionError> for Interrupt {
    fn from(error: RolloutTransitionError) -> Self {
        Self::Transition(error)
    }
}

impl RolloutOrchestrator {
    pub fn new(services: RolloutServices, config: RolloutConfig, evaluator: MetricsEvaluator) -> Self {
        Self {
            driver: Arc::new(Driver {
                services,
                config,
                evaluator,
                machine: RolloutMachine,
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn start_rollout(
        &self,
        candidate: RuleCandidate,
        canary_duration_minutes: u32,
    ) -> Result<ExecutionId, RolloutError> {
        self.start_rollout_with_correlation(
            candidate,
            canary_duration_minutes,
            format!("req-{}", Uuid::new_v4()),
        )
        .await
    }

    /// Validates the candidate, records a `pending` execution and starts driving
    /// it in the background. Returns once the execution is durably recorded.
    pub async fn start_rollout_with_correlation(
        &self,
        candidate: RuleCandidate,
        canary_duration_minutes: u32,
        correlation_id: impl Into<String>,
    ) -> Result<ExecutionId, RolloutError> {
        candidate.validate()?;
        let config = &self.driver.config;
        if !(config.min_canary_minutes..=config.max_canary_minutes)
            .contains(&canary_duration_minutes)
        {
            return Err(ValidationError::DurationOutOfRange {
                field: "canary_duration_minutes",
                value: i64::from(canary_duration_minutes),
                min: config.min_canary_minutes,
                max: config.max_canary_minutes,
            }
            .into());
        }

        let mut running = self.driver.running.lock().await;
        if let Some(entry) = running.get(&candidate.rule_id) {
            if !entry.is_finished() {
                return Err(RolloutError::ConcurrencyConflict {
                    rule_id: candidate.rule_id.clone(),
                    execution_id: entry.execution_id.clone(),
                });
            }
        }
        match self.driver.services.store.load(&candidate.rule_id).await {
            Ok(existing) if !existing.is_terminal() => {
                return Err(RolloutError::ConcurrencyConflict {
                    rule_id: existing.rule_id,
                    execution_id: existing.id,
                });
            }
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(other) => return Err(other.into()),
        }

        let mut execution = RolloutExecution::new(
            candidate,
            canary_duration_minutes,
            correlation_id,
            self.driver.clock().now(),
        );
        self.driver.persist(&mut execution).await?;

        info!(
            event_name = "rollout.started",
            correlation_id = %execution.correlation_id,
            rule_id = %execution.rule_id,
            execution_id = %execution.id,
            action = execution.candidate.action.as_str(),
            canary_duration_minutes,
            "rollout accepted"
        );
        self.driver.emit(
            &execution,
            "rollout.started",
            AuditCategory::Rollout,
            AuditOutcome::Success,
            &[("canary_duration_minutes", canary_duration_minutes.to_string())],
        );

        let execution_id = execution.id.clone();
        Driver::spawn(&self.driver, &mut running, execution);
        Ok(execution_id)
    }

    /// Latest execution recorded for the rule, running or finished.
    pub async fn get_status(&self, rule_id: &RuleId) -> Result<RolloutExecution, RolloutError> {
        self.driver
            .services
            .store
            .load(rule_id)
            .await
            .map_err(|error| RolloutError::from_lookup(rule_id, error))
    }

    pub async fn history(&self, rule_id: &RuleId) -> Result<Vec<RolloutExecution>, RolloutError> {
        let history = self.driver.services.store.list_for_rule(rule_id).await?;
        if history.is_empty() {
            return Err(RolloutError::NotFound(rule_id.clone()));
        }
        Ok(history)
    }

    /// Stops the rule's active execution, removes any shadow or canary variant
    /// it has live, and marks it `aborted`.
    pub async fn abort(&self, rule_id: &RuleId) -> Result<RolloutExecution, RolloutError> {
        let mut running = self.driver.running.lock().await;

        let signalled = running.get(rule_id).filter(|entry| !entry.is_finished()).map(|entry| {
            entry.cancel.send_replace(true);
            (entry.execution_id.clone(), entry.finished.clone())
        });
        if let Some((execution_id, finished)) = signalled {
            drop(running);
            info!(
                event_name = "rollout.abort.requested",
                rule_id = %rule_id,
                execution_id = %execution_id,
                "abort signalled to running rollout"
            );

            let execution = match await_finished(finished).await {
                Some(execution) => execution,
                None => self.get_status(rule_id).await?,
            };
            return if execution.status == RolloutStatus::Aborted {
                Ok(execution)
            } else {
                Err(RolloutError::NotActive { rule_id: rule_id.clone(), status: execution.status })
            };
        }

        // Not driven by this process: abort straight from the stored checkpoint.
        let mut execution = self
            .driver
            .services
            .store
            .load(rule_id)
            .await
            .map_err(|error| RolloutError::from_lookup(rule_id, error))?;
        if execution.is_terminal() {
            return Err(RolloutError::NotActive { rule_id: rule_id.clone(), status: execution.status });
        }

        // Claim the rule so starts and resumes see it as active while provider
        // cleanup runs without the registry lock.
        let (cancel, _) = watch::channel(true);
        let (finished_tx, finished) = watch::channel(None);
        running.insert(
            rule_id.clone(),
            RunningRollout { execution_id: execution.id.clone(), cancel, finished },
        );
        drop(running);

        let outcome = self.driver.finish_aborted(&mut execution).await;
        if outcome.is_ok() {
            finished_tx.send_replace(Some(execution.clone()));
        }
        self.driver.release(rule_id, &execution.id).await;
        outcome?;
        Ok(execution)
    }

    /// Resolves when the rule's current execution stops being driven.
    pub async fn wait_for(&self, rule_id: &RuleId) -> Result<RolloutExecution, RolloutError> {
        let finished = {
            let running = self.driver.running.lock().await;
            running.get(rule_id).map(|entry| entry.finished.clone())
        };

        if let Some(finished) = finished {
            if let Some(execution) = await_finished(finished).await {
                return Ok(execution);
            }
        }
        self.get_status(rule_id).await
    }

    /// Picks up every non-terminal execution left in the store, typically after
    /// a restart, and drives each from its checkpoint.
    pub async fn resume_unfinished(&self) -> Result<Vec<ExecutionId>, RolloutError> {
        let mut unfinished = self.driver.services.store.list_unfinished().await?;
        unfinished.sort_by(|left, right| right.created_at.cmp(&left.created_at));

        let mut running = self.driver.running.lock().await;
        let mut seen = HashSet::new();
        let mut resumed = Vec::new();

        for execution in unfinished {
            if !seen.insert(execution.rule_id.clone()) {
                warn!(
                    event_name = "rollout.resume.duplicate_skipped",
                    correlation_id = %execution.correlation_id,
                    rule_id = %execution.rule_id,
                    execution_id = %execution.id,
                    "older unfinished execution for rule left untouched"
                );
                continue;
            }
            if running.get(&execution.rule_id).is_some_and(|entry| !entry.is_finished()) {
                continue;
            }

            info!(
                event_name = "rollout.resumed",
                correlation_id = %execution.correlation_id,
                rule_id = %execution.rule_id,
                execution_id = %execution.id,
                status = execution.status.as_str(),
                "resuming rollout from checkpoint"
            );
            resumed.push(execution.id.clone());
            Driver::spawn(&self.driver, &mut running, execution);
        }

        Ok(resumed)
    }
}

async fn await_finished(
    mut finished: watch::Receiver<Option<RolloutExecution>>,
) -> Option<RolloutExecution> {
    loop {
        let current = finished.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        if finished.changed().await.is_err() {
            return finished.borrow().clone();
        }
    }
}

async fn abort_requested(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Driver {
    fn clock(&self) -> &dyn RolloutClock {
        self.services.clock.as_ref()
    }

    fn spawn(
        driver: &Arc<Self>,
        running: &mut HashMap<RuleId, RunningRollout>,
        execution: RolloutExecution,
    ) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(None);
        running.insert(
            execution.rule_id.clone(),
            RunningRollout {
                execution_id: execution.id.clone(),
                cancel: cancel_tx,
                finished: finished_rx,
            },
        );

        let driver = Arc::clone(driver);
        tokio::spawn(async move {
            let rule_id = execution.rule_id.clone();
            let execution_id = execution.id.clone();
            let outcome = driver.drive(execution, cancel_rx).await;
            finished_tx.send_replace(Some(outcome));
            driver.release(&rule_id, &execution_id).await;
        });
    }

    async fn release(&self, rule_id: &RuleId, execution_id: &ExecutionId) {
        let mut running = self.running.lock().await;
        if running.get(rule_id).is_some_and(|entry| &entry.execution_id == execution_id) {
            running.remove(rule_id);
        }
    }

    async fn drive(
        &self,
        mut execution: RolloutExecution,
        mut cancel: watch::Receiver<bool>,
    ) -> RolloutExecution {
        while !execution.is_terminal() {
            let abort_pending = *cancel.borrow();
            let step = if abort_pending {
                Err(Interrupt::Aborted)
            } else {
                match execution.status {
                    RolloutStatus::Pending => self.begin(&mut execution).await,
                    RolloutStatus::Simulating => {
                        self.run_trial(&mut execution, RolloutPhase::Simulation, &mut cancel).await
                    }
                    RolloutStatus::Canarying => {
                        self.run_trial(&mut execution, RolloutPhase::Canary, &mut cancel).await
                    }
                    RolloutStatus::DeployingFull => {
                        self.deploy_production(&mut execution, &mut cancel).await
                    }
                    RolloutStatus::Monitoring => {
                        self.monitor_production(&mut execution, &mut cancel).await
                    }
                    RolloutStatus::Succeeded | RolloutStatus::Failed | RolloutStatus::Aborted => {
                        Ok(())
                    }
                }
            };

            let Err(interrupt) = step else { continue };
            let finished = match interrupt {
                Interrupt::Aborted => self.finish_aborted(&mut execution).await,
                Interrupt::Deployment { error, metrics } => {
                    self.finish_failed(&mut execution, error, metrics).await
                }
                Interrupt::Store(error) => Err(error.into()),
                Interrupt::Transition(error) => Err(error.into()),
            };
            if let Err(error) = finished {
                error!(
                    event_name = "rollout.drive.suspended",
                    correlation_id = %execution.correlation_id,
                    rule_id = %execution.rule_id,
                    execution_id = %execution.id,
                    status = execution.status.as_str(),
                    error_class = error.error_class(),
                    error = %error,
                    "rollout could not be advanced; left at its last checkpoint"
                );
                break;
            }
        }

        execution
    }

    async fn begin(&self, execution: &mut RolloutExecution) -> Result<(), Interrupt> {
        self.transition(execution, RolloutEvent::Started)?;
        self.persist(execution).await?;
        Ok(())
    }

    /// Simulation and canary: deploy a reduced-impact variant, observe it for a
    /// window, decide on the measured rate, and always remove the variant.
    async fn run_trial(
        &self,
        execution: &mut RolloutExecution,
        phase: RolloutPhase,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), Interrupt> {
        let active = self.checkpoint(execution, phase).await?;
        let active = self.ensure_deployed(execution, active, cancel).await?;
        let (variant_id, window_start, window_end) = observation_window(&active)?;

        self.wait_until(window_end, cancel).await?;

        let events = {
            let deployer = &self.services.deployer;
            let variant_id = &variant_id;
            self.call_provider(execution, "fetch_events", Some(&mut *cancel), move || {
                deployer.fetch_events(variant_id, window_start, window_end)
            })
            .await?
        };

        let (metrics, passed, event) = match phase {
            RolloutPhase::Simulation => {
                let metrics = self.evaluator.false_positive_metrics(&events);
                let passed = metrics.rate_pct().unwrap_or_default()
                    < self.config.false_positive_threshold_pct;
                let event = if passed {
                    RolloutEvent::SimulationPassed
                } else {
                    RolloutEvent::SimulationFailed
                };
                (metrics, passed, event)
            }
            RolloutPhase::Canary | RolloutPhase::Production => {
                let metrics = self.evaluator.error_rate_metrics(&events);
                let passed =
                    metrics.rate_pct().unwrap_or_default() < self.config.canary_error_budget_pct;
                let event =
                    if passed { RolloutEvent::CanaryPassed } else { RolloutEvent::CanaryFailed };
                (metrics, passed, event)
            }
        };

        let removed = self.remove_variant(execution, &variant_id).await;
        if passed {
            if let Err(error) = removed {
                return Err(Interrupt::Deployment { error, metrics: Some(metrics) });
            }
        }

        let reason = (!passed).then(|| threshold_reason(phase).to_string());
        let decision = if passed { PhaseDecision::Proceed } else { PhaseDecision::Rollback };
        let ended_at = self.clock().now();
        execution.phase_history.push(PhaseResult {
            phase,
            deployed_variant_id: Some(variant_id),
            started_at: active.started_at,
            ended_at,
            metrics: metrics.clone(),
            decision,
            reason: reason.clone(),
        });
        execution.active_phase = None;
        if let Some(reason) = reason {
            execution.failure = Some(RolloutFailure {
                phase,
                reason,
                error_class: "threshold_exceeded".to_string(),
                last_metrics: Some(metrics.clone()),
            });
        }
        self.transition(execution, event)?;
        self.persist(execution).await?;

        self.record_phase_completed(execution, phase, decision, &metrics);
        Ok(())
    }

    async fn deploy_production(
        &self,
        execution: &mut RolloutExecution,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), Interrupt> {
        let active = self.checkpoint(execution, RolloutPhase::Production).await?;
        let active = self.ensure_deployed(execution, active, cancel).await?;

        execution.active_phase = Some(active);
        self.transition(execution, RolloutEvent::ProductionDeployed)?;
        self.persist(execution).await?;
        Ok(())
    }

    /// Production is never rolled back automatically: an error rate above the
    /// warning threshold is recorded as `warn` for a human to act on.
    async fn monitor_production(
        &self,
        execution: &mut RolloutExecution,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), Interrupt> {
        let active = execution
            .active_phase
            .clone()
            .filter(|active| active.phase == RolloutPhase::Production)
            .ok_or_else(|| Interrupt::Deployment {
                error: DeploymentError::new(
                    DeploymentErrorKind::NotFound,
                    "production variant checkpoint is missing",
                ),
                metrics: None,
            })?;
        let (variant_id, window_start, window_end) = observation_window(&active)?;

        self.wait_until(window_end, cancel).await?;

        let events = {
            let deployer = &self.services.deployer;
            let variant_id = &variant_id;
            self.call_provider(execution, "fetch_events", Some(&mut *cancel), move || {
                deployer.fetch_events(variant_id, window_start, window_end)
            })
            .await?
        };
        let metrics = self.evaluator.error_rate_metrics(&events);
        let error_rate = metrics.rate_pct().unwrap_or_default();
        let warn_threshold = self.config.production_warn_threshold_pct;
        let decision =
            if error_rate > warn_threshold { PhaseDecision::Warn } else { PhaseDecision::Proceed };
        let reason = (decision == PhaseDecision::Warn).then(|| {
            format!("production error rate {error_rate}% exceeds warning threshold {warn_threshold}%")
        });

        execution.phase_history.push(PhaseResult {
            phase: RolloutPhase::Production,
            deployed_variant_id: Some(variant_id),
            started_at: active.started_at,
            ended_at: self.clock().now(),
            metrics: metrics.clone(),
            decision,
            reason: reason.clone(),
        });
        execution.active_phase = None;
        self.transition(execution, RolloutEvent::MonitoringElapsed)?;
        self.persist(execution).await?;

        self.record_phase_completed(execution, RolloutPhase::Production, decision, &metrics);
        if let Some(reason) = reason {
            warn!(
                event_name = "rollout.production.warning",
                correlation_id = %execution.correlation_id,
                rule_id = %execution.rule_id,
                execution_id = %execution.id,
                error_rate_pct = error_rate,
                threshold_pct = warn_threshold,
                "production error rate above warning threshold; rule left in place for review"
            );
            self.emit(
                execution,
                "rollout.production.warning",
                AuditCategory::Evaluation,
                AuditOutcome::Warning,
                &[("reason", reason), ("error_rate_pct", error_rate.to_string())],
            );
        }
        Ok(())
    }

    /// Returns the in-flight checkpoint for `phase`, creating and persisting a
    /// fresh one when the phase has not started yet.
    async fn checkpoint(
        &self,
        execution: &mut RolloutExecution,
        phase: RolloutPhase,
    ) -> Result<ActivePhase, Interrupt> {
        if let Some(active) = execution.active_phase.as_ref().filter(|active| active.phase == phase)
        {
            return Ok(active.clone());
        }

        let active = ActivePhase {
            phase,
            started_at: self.clock().now(),
            variant_key: variant_key(execution, phase),
            variant_id: None,
            window_started_at: None,
            window_ends_at: None,
        };
        execution.active_phase = Some(active.clone());
        self.persist(execution).await?;

        info!(
            event_name = "rollout.phase.started",
            correlation_id = %execution.correlation_id,
            rule_id = %execution.rule_id,
            execution_id = %execution.id,
            phase = phase.as_str(),
            "rollout phase started"
        );
        self.emit(
            execution,
            "rollout.phase.started",
            AuditCategory::Rollout,
            AuditOutcome::Success,
            &[("phase", phase.as_str().to_string())],
        );
        Ok(active)
    }

    /// Deploys the phase's variant unless the checkpoint already names one, then
    /// persists the variant id together with the absolute window bounds.
    async fn ensure_deployed(
        &self,
        execution: &mut RolloutExecution,
        mut active: ActivePhase,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ActivePhase, Interrupt> {
        if active.variant_id.is_some() {
            return Ok(active);
        }

        let request = DeployRequest {
            idempotency_key: active.variant_key.clone(),
            rule_id: execution.rule_id.clone(),
            execution_id: execution.id.clone(),
            phase: active.phase,
            candidate: execution.candidate.clone(),
            action_override: action_override(active.phase, execution.candidate.action),
        };
        let variant_id = {
            let deployer = &self.services.deployer;
            let request = &request;
            self.call_provider(execution, "deploy", Some(&mut *cancel), move || deployer.deploy(request))
                .await?
        };

        let now = self.clock().now();
        active.variant_id = Some(variant_id.clone());
        active.window_started_at = Some(now);
        active.window_ends_at = Some(now + self.window_for(execution, active.phase));
        execution.active_phase = Some(active.clone());
        self.persist(execution).await?;

        info!(
            event_name = "rollout.variant.deployed",
            correlation_id = %execution.correlation_id,
            rule_id = %execution.rule_id,
            execution_id = %execution.id,
            phase = active.phase.as_str(),
            variant_id = %variant_id,
            action = request.effective_action().as_str(),
            "rule variant deployed"
        );
        self.emit(
            execution,
            "rollout.variant.deployed",
            AuditCategory::Deployment,
            AuditOutcome::Success,
            &[
                ("phase", active.phase.as_str().to_string()),
                ("variant_id", variant_id.0),
                ("action", request.effective_action().as_str().to_string()),
            ],
        );
        Ok(active)
    }

    fn window_for(&self, execution: &RolloutExecution, phase: RolloutPhase) -> Duration {
        match phase {
            RolloutPhase::Simulation => self.config.simulation_window(),
            RolloutPhase::Canary => {
                Duration::minutes(i64::from(execution.canary_duration_minutes))
            }
            RolloutPhase::Production => self.config.monitoring_window(),
        }
    }

    async fn finish_failed(
        &self,
        execution: &mut RolloutExecution,
        error: DeploymentError,
        metrics: Option<PhaseMetrics>,
    ) -> Result<(), RolloutError> {
        let phase = execution.current_phase().unwrap_or(RolloutPhase::Simulation);
        let active = execution.active_phase.take();
        let variant_id = match &active {
            Some(active) => self.resolve_variant(execution, active).await,
            None => None,
        };
        if let Some(variant_id) = &variant_id {
            // Cleanup failures are logged inside and never replace `error`.
            let _ = self.remove_variant(execution, variant_id).await;
        }

        let now = self.clock().now();
        let last_metrics = metrics.clone().or_else(|| execution.last_metrics().cloned());
        execution.phase_history.push(PhaseResult {
            phase,
            deployed_variant_id: variant_id,
            started_at: active.map(|active| active.started_at).unwrap_or(now),
            ended_at: now,
            metrics: metrics.unwrap_or(PhaseMetrics::NotCollected),
            decision: PhaseDecision::Rollback,
            reason: Some(error.to_string()),
        });
        execution.failure = Some(RolloutFailure {
            phase,
            reason: error.to_string(),
            error_class: error.kind.as_str().to_string(),
            last_metrics,
        });
        self.transition(execution, RolloutEvent::DeploymentFailed)?;
        self.persist(execution).await?;

        error!(
            event_name = "rollout.failed",
            correlation_id = %execution.correlation_id,
            rule_id = %execution.rule_id,
            execution_id = %execution.id,
            phase = phase.as_str(),
            error_class = error.kind.as_str(),
            error = %error,
            "rollout failed on provider error"
        );
        self.emit(
            execution,
            "rollout.failed",
            AuditCategory::Deployment,
            AuditOutcome::Failed,
            &[("phase", phase.as_str().to_string()), ("error", error.to_string())],
        );
        Ok(())
    }

    async fn finish_aborted(&self, execution: &mut RolloutExecution) -> Result<(), RolloutError> {
        if let Some(active) = execution.active_phase.take() {
            let variant_id = self.resolve_variant(execution, &active).await;
            let production_live = !active.phase.is_temporary() && variant_id.is_some();
            if active.phase.is_temporary() {
                if let Some(variant_id) = &variant_id {
                    let _ = self.remove_variant(execution, variant_id).await;
                }
            }

            let (decision, reason) = if production_live {
                (PhaseDecision::Warn, ABORTED_IN_PRODUCTION_REASON)
            } else {
                (PhaseDecision::Rollback, ABORTED_REASON)
            };
            execution.phase_history.push(PhaseResult {
                phase: active.phase,
                deployed_variant_id: variant_id,
                started_at: active.started_at,
                ended_at: self.clock().now(),
                metrics: PhaseMetrics::NotCollected,
                decision,
                reason: Some(reason.to_string()),
            });
        }

        self.transition(execution, RolloutEvent::AbortRequested)?;
        self.persist(execution).await?;

        info!(
            event_name = "rollout.aborted",
            correlation_id = %execution.correlation_id,
            rule_id = %execution.rule_id,
            execution_id = %execution.id,
            "rollout aborted"
        );
        self.emit(execution, "rollout.aborted", AuditCategory::Rollout, AuditOutcome::Success, &[]);
        Ok(())
    }

    /// Variant recorded in the checkpoint, or the one the provider holds under
    /// the checkpoint's idempotency key when the deploy response was lost.
    async fn resolve_variant(
        &self,
        execution: &RolloutExecution,
        active: &ActivePhase,
    ) -> Option<VariantId> {
        if let Some(variant_id) = &active.variant_id {
            return Some(variant_id.clone());
        }

        let deployer = &self.services.deployer;
        let key = active.variant_key.as_str();
        let lookup = self
            .call_provider(execution, "find_variant", None, move || deployer.find_variant(key))
            .await;
        match lookup {
            Ok(found) => {
                if let Some(variant_id) = &found {
                    info!(
                        event_name = "rollout.variant.recovered",
                        correlation_id = %execution.correlation_id,
                        rule_id = %execution.rule_id,
                        execution_id = %execution.id,
                        phase = active.phase.as_str(),
                        variant_id = %variant_id,
                        "variant found by idempotency key"
                    );
                }
                found
            }
            Err(interrupt) => {
                let error = interrupt.into_deployment_error("variant lookup was interrupted");
                error!(
                    event_name = "rollout.cleanup.failed",
                    correlation_id = %execution.correlation_id,
                    rule_id = %execution.rule_id,
                    execution_id = %execution.id,
                    phase = active.phase.as_str(),
                    variant_key = %active.variant_key,
                    error = %error,
                    "variant lookup failed; a variant may still be live"
                );
                self.emit(
                    execution,
                    "rollout.cleanup.failed",
                    AuditCategory::Deployment,
                    AuditOutcome::Failed,
                    &[("variant_key", active.variant_key.clone()), ("error", error.to_string())],
                );
                None
            }
        }
    }

    /// Best-effort removal. Failures are logged and audited, then handed back so
    /// the caller can decide whether they block progress.
    async fn remove_variant(
        &self,
        execution: &RolloutExecution,
        variant_id: &VariantId,
    ) -> Result<(), DeploymentError> {
        let deployer = &self.services.deployer;
        let removal = self
            .call_provider(execution, "remove", None, move || deployer.remove(variant_id))
            .await;

        match removal {
            Ok(()) => {
                info!(
                    event_name = "rollout.variant.removed",
                    correlation_id = %execution.correlation_id,
                    rule_id = %execution.rule_id,
                    execution_id = %execution.id,
                    variant_id = %variant_id,
                    "rule variant removed"
                );
                self.emit(
                    execution,
                    "rollout.variant.removed",
                    AuditCategory::Deployment,
                    AuditOutcome::Success,
                    &[("variant_id", variant_id.0.clone())],
                );
                Ok(())
            }
            Err(interrupt) => {
                let error = interrupt.into_deployment_error("variant removal was interrupted");
                error!(
                    event_name = "rollout.cleanup.failed",
                    correlation_id = %execution.correlation_id,
                    rule_id = %execution.rule_id,
                    execution_id = %execution.id,
                    variant_id = %variant_id,
                    error = %error,
                    "rule variant could not be removed"
                );
                self.emit(
                    execution,
                    "rollout.cleanup.failed",
                    AuditCategory::Deployment,
                    AuditOutcome::Failed,
                    &[("variant_id", variant_id.0.clone()), ("error", error.to_string())],
                );
                Err(error)
            }
        }
    }

    /// Runs a provider call under the configured timeout, retrying transient
    /// failures with exponential backoff. Backoff waits honour `cancel` when given.
    async fn call_provider<T, F, Fut>(
        &self,
        execution: &RolloutExecution,
        operation: &'static str,
        mut cancel: Option<&mut watch::Receiver<bool>>,
        mut call: F,
    ) -> Result<T, Interrupt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DeploymentError>>,
    {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = match tokio::time::timeout(self.config.provider_timeout(), call()).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(DeploymentError::new(
                    DeploymentErrorKind::Timeout,
                    format!(
                        "{operation} did not complete within {}s",
                        self.config.provider_timeout_secs
                    ),
                )),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < attempts => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        event_name = "rollout.provider.retry",
                        correlation_id = %execution.correlation_id,
                        rule_id = %execution.rule_id,
                        execution_id = %execution.id,
                        operation,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.num_milliseconds(),
                        error = %error,
                        "transient provider failure; retrying"
                    );
                    let deadline = self.clock().now() + delay;
                    match cancel.as_deref_mut() {
                        Some(cancel) => self.wait_until(deadline, cancel).await?,
                        None => self.clock().sleep_until(deadline).await,
                    }
                    attempt += 1;
                }
                Err(error) => return Err(Interrupt::Deployment { error, metrics: None }),
            }
        }
    }

    async fn wait_until(
        &self,
        deadline: DateTime<Utc>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), Interrupt> {
        tokio::select! {
            biased;
            _ = abort_requested(cancel) => Err(Interrupt::Aborted),
            _ = self.clock().sleep_until(deadline) => Ok(()),
        }
    }

    fn transition(
        &self,
        execution: &mut RolloutExecution,
        event: RolloutEvent,
    ) -> Result<(), RolloutTransitionError> {
        let outcome = self.machine.apply_with_audit(
            execution.status,
            event,
            self.services.audit.as_ref(),
            &audit_context(execution),
        )?;
        execution.status = outcome.to;
        if outcome.to.is_terminal() {
            execution.completed_at = Some(self.clock().now());
        }
        Ok(())
    }

    /// Bumps the version and saves, retrying backend failures with the provider
    /// backoff. A stale write carrying this very version after a retry means an
    /// earlier attempt landed and only its acknowledgement was lost.
    async fn persist(&self, execution: &mut RolloutExecution) -> Result<(), StoreError> {
        execution.state_version += 1;
        execution.updated_at = self.clock().now();

        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.services.store.save(execution).await {
                Err(StoreError::Backend(message)) if attempt < attempts => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        event_name = "rollout.store.retry",
                        correlation_id = %execution.correlation_id,
                        rule_id = %execution.rule_id,
                        execution_id = %execution.id,
                        state_version = execution.state_version,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.num_milliseconds(),
                        error = %message,
                        "rollout store write failed; retrying"
                    );
                    self.clock().sleep_until(self.clock().now() + delay).await;
                    attempt += 1;
                }
                Err(StoreError::StaleWrite { stored, attempted, .. })
                    if attempt > 1 && stored == attempted =>
                {
                    return Ok(());
                }
                outcome => return outcome,
            }
        }
    }

    fn record_phase_completed(
        &self,
        execution: &RolloutExecution,
        phase: RolloutPhase,
        decision: PhaseDecision,
        metrics: &PhaseMetrics,
    ) {
        let rate = metrics.rate_pct().unwrap_or_default();
        info!(
            event_name = "rollout.phase.completed",
            correlation_id = %execution.correlation_id,
            rule_id = %execution.rule_id,
            execution_id = %execution.id,
            phase = phase.as_str(),
            decision = decision.as_str(),
            rate_pct = rate,
            status = execution.status.as_str(),
            "rollout phase completed"
        );
        let outcome = match decision {
            PhaseDecision::Proceed => AuditOutcome::Success,
            PhaseDecision::Warn => AuditOutcome::Warning,
            PhaseDecision::Rollback => AuditOutcome::Rejected,
        };
        self.emit(
            execution,
            "rollout.phase.completed",
            AuditCategory::Evaluation,
            outcome,
            &[
                ("phase", phase.as_str().to_string()),
                ("decision", decision.as_str().to_string()),
                ("rate_pct", rate.to_string()),
                ("status", execution.status.as_str().to_string()),
            ],
        );
    }

    fn emit(
        &self,
        execution: &RolloutExecution,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        metadata: &[(&str, String)],
    ) {
        let event = metadata.iter().fold(
            audit_context(execution).event(event_type, category, outcome).at(self.clock().now()),
            |event, (key, value)| event.with_metadata(*key, value.clone()),
        );
        self.services.audit.emit(event);
    }
}

fn audit_context(execution: &RolloutExecution) -> AuditContext {
    AuditContext::new(
        execution.rule_id.clone(),
        Some(execution.id.clone()),
        execution.correlation_id.clone(),
        ACTOR,
    )
}

/// Deterministic per execution and phase, so a redeploy after a lost response
/// resolves to the variant that already exists.
fn variant_key(execution: &RolloutExecution, phase: RolloutPhase) -> String {
    let fingerprint: String = execution.candidate.fingerprint().chars().take(16).collect();
    format!("{}:{}:{}:{}", execution.rule_id, execution.id, phase.as_str(), fingerprint)
}

fn action_override(phase: RolloutPhase, action: RuleAction) -> Option<RuleAction> {
    match phase {
        RolloutPhase::Simulation => Some(RuleAction::Log),
        RolloutPhase::Canary => Some(action.canary_action()).filter(|canary| *canary != action),
        RolloutPhase::Production => None,
    }
}

fn threshold_reason(phase: RolloutPhase) -> &'static str {
    match phase {
        RolloutPhase::Simulation => HIGH_FALSE_POSITIVE_REASON,
        RolloutPhase::Canary | RolloutPhase::Production => ERROR_BUDGET_REASON,
    }
}

fn observation_window(
    active: &ActivePhase,
) -> Result<(VariantId, DateTime<Utc>, DateTime<Utc>), Interrupt> {
    match (&active.variant_id, active.window_started_at, active.window_ends_at) {
        (Some(variant_id), Some(start), Some(end)) => Ok((variant_id.clone(), start, end)),
        _ => Err(Interrupt::Deployment {
            error: DeploymentError::new(
                DeploymentErrorKind::NotFound,
                format!("{} checkpoint has no deployed variant window", active.phase.as_str()),
            ),
            metrics: None,
        }),
    }
}
