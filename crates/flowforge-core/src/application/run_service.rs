//! Run lifecycle orchestration
//!
//! Transitions for one run are serialized through a per-run mutex, so the
//! status guards in the aggregate can be rechecked against a fresh snapshot
//! before every mutation. The drive loop reloads the run between steps,
//! which is how cooperative cancellation and concurrent transitions become
//! visible to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::engine::{EngineGateway, EngineOperationType, EngineRequest, EngineResponse};
use crate::domain::events::{ProgressNotifier, RunProgressUpdate};
use crate::domain::flow::{FlowId, FlowVersionId};
use crate::domain::flow_run::{
    CorrelationId, FlowRun, RetryStrategy, RunId, RunStatus, StepOutput, StepOutputStatus,
    TerminationReason,
};
use crate::domain::repository::{FlowRepository, FlowRunRepository};
use crate::{DataPacket, EngineError};

/// Where a retried run's outputs accumulate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryPolicy {
    /// Reset and re-drive the same run record
    InPlace,
    /// Spawn a fresh run linked to the failed one; the original stays frozen
    NewLinkedRun,
}

/// How the caller wants to observe the run it started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressUpdateType {
    /// Fire and forget
    None,
    /// An external webhook responder is waiting on the outcome
    WebhookResponse,
    /// A test session wants the outcome synchronously
    TestFlow,
}

/// Tunables for run orchestration
#[derive(Debug, Clone)]
pub struct RunServiceConfig {
    /// Wall-clock budget per step execution
    pub step_deadline: Duration,

    /// How long a paused run waits for a resume before force-failing
    pub pause_timeout: Duration,

    /// How long a `TestFlow` start waits for the outcome before returning
    /// the in-flight snapshot
    pub sync_run_timeout: Duration,

    /// Retry placement policy
    pub retry_policy: RetryPolicy,
}

impl Default for RunServiceConfig {
    fn default() -> Self {
        Self {
            step_deadline: Duration::from_secs(30),
            pause_timeout: Duration::from_secs(3600),
            sync_run_timeout: Duration::from_secs(10),
            retry_policy: RetryPolicy::InPlace,
        }
    }
}

/// Orchestrates run execution end to end
#[derive(Clone)]
pub struct RunLifecycleManager {
    flows: Arc<dyn FlowRepository>,
    runs: Arc<dyn FlowRunRepository>,
    gateway: Arc<EngineGateway>,
    notifier: Arc<dyn ProgressNotifier>,
    transition_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    cancellations: Arc<DashMap<String, Arc<AtomicBool>>>,
    config: RunServiceConfig,
}

impl RunLifecycleManager {
    /// Create a manager over the given collaborators
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        runs: Arc<dyn FlowRunRepository>,
        gateway: Arc<EngineGateway>,
        notifier: Arc<dyn ProgressNotifier>,
        config: RunServiceConfig,
    ) -> Self {
        Self {
            flows,
            runs,
            gateway,
            notifier,
            transition_locks: Arc::new(DashMap::new()),
            cancellations: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Create a queued run and dispatch it
    ///
    /// `TestFlow` starts wait up to the sync timeout for the outcome and
    /// return whatever snapshot exists when the wait ends; the run keeps
    /// executing in the background either way.
    pub async fn start(
        &self,
        flow_id: FlowId,
        version_id: Option<FlowVersionId>,
        trigger_payload: DataPacket,
        progress: ProgressUpdateType,
    ) -> Result<FlowRun, EngineError> {
        let flow = self
            .flows
            .find_flow(&flow_id)
            .await?
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.0.clone()))?;
        let version_id = match version_id {
            Some(id) => id,
            None => flow
                .published_version_id
                .ok_or_else(|| EngineError::VersionNotFound(flow_id.0.clone()))?,
        };
        let version = self
            .flows
            .find_version(&version_id)
            .await?
            .ok_or_else(|| EngineError::VersionNotFound(version_id.0.clone()))?;

        let run = FlowRun::new(flow_id, version.id, flow.project_id, trigger_payload);
        self.runs.save(&run).await?;
        self.emit(&run).await;
        info!(run_id = %run.id.0, "run queued");

        let handle = self.spawn_execution(run.id.clone());

        if progress == ProgressUpdateType::TestFlow {
            // The task is detached on timeout, not aborted
            let _ = tokio::time::timeout(self.config.sync_run_timeout, handle).await;
        }

        self.get_run(&run.id).await
    }

    /// Drive a queued run to its next resting state
    pub async fn execute_run(&self, run_id: RunId) -> Result<(), EngineError> {
        self.transition(&run_id, |run| run.begin()).await?;
        self.drive(run_id).await
    }

    /// Evaluate a version's trigger against a sample payload
    ///
    /// No run is created; the response is handed straight back. Used by
    /// webhook capture sessions to exercise a trigger before publish.
    pub async fn test_trigger(
        &self,
        version_id: &FlowVersionId,
        payload: DataPacket,
    ) -> Result<EngineResponse, EngineError> {
        let version = self
            .flows
            .find_version(version_id)
            .await?
            .ok_or_else(|| EngineError::VersionNotFound(version_id.0.clone()))?;

        let request = EngineRequest {
            operation_type: EngineOperationType::ExecuteTrigger,
            input: DataPacket::new(json!({
                "settings": version.trigger.settings,
                "payload": payload.as_value(),
            })),
            deadline: self.step_deadline(),
        };
        self.gateway.execute(request).await
    }

    /// Execute steps from the run's cursor until it settles, pauses or fails
    async fn drive(&self, run_id: RunId) -> Result<(), EngineError> {
        loop {
            let run = self.get_run(&run_id).await?;
            if run.status != RunStatus::Running {
                return Ok(());
            }
            if self.is_cancelled(&run_id) {
                self.transition(&run_id, |run| run.fail(TerminationReason::Cancelled))
                    .await?;
                info!(run_id = %run_id.0, "run cancelled");
                return Ok(());
            }

            let version = self
                .flows
                .find_version(&run.flow_version_id)
                .await?
                .ok_or_else(|| EngineError::VersionNotFound(run.flow_version_id.0.clone()))?;
            let step_names = version.step_names();

            // The cursor is the number of outputs already recorded; retry
            // resets it by truncating the output list.
            let cursor = run.step_outputs.len();
            if cursor >= step_names.len() {
                self.transition(&run_id, |run| run.succeed()).await?;
                info!(run_id = %run_id.0, "run succeeded");
                return Ok(());
            }

            let step_name = step_names[cursor].clone();
            let settings = version
                .find_step(&step_name)
                .map(|s| s.settings.clone())
                .ok_or_else(|| EngineError::StepNotFound(step_name.clone()))?;

            let input = DataPacket::new(json!({
                "settings": settings,
                "trigger": run.trigger_payload.as_value(),
                "context": run.context.as_value(),
            }));
            let request = EngineRequest {
                operation_type: EngineOperationType::ExecuteStep,
                input: input.clone(),
                deadline: self.step_deadline(),
            };

            let started = std::time::Instant::now();
            let outcome = self.gateway.execute(request).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(EngineResponse::Ok { output }) => {
                    debug!(run_id = %run_id.0, step = %step_name, "step succeeded");
                    self.transition(&run_id, |run| {
                        run.record_step_output(StepOutput {
                            step_name,
                            status: StepOutputStatus::Succeeded,
                            input,
                            output,
                            duration_ms,
                            error: None,
                        })
                    })
                    .await?;
                }
                Ok(EngineResponse::Error { message }) => {
                    warn!(run_id = %run_id.0, step = %step_name, %message, "step failed");
                    self.transition(&run_id, |run| {
                        run.record_step_output(StepOutput {
                            step_name,
                            status: StepOutputStatus::Failed,
                            input,
                            output: DataPacket::null(),
                            duration_ms,
                            error: Some(message.clone()),
                        })?;
                        run.fail(TerminationReason::StepFailed)
                    })
                    .await?;
                    return Ok(());
                }
                Ok(EngineResponse::Paused {
                    correlation_id,
                    reason,
                }) => {
                    info!(run_id = %run_id.0, step = %step_name, "run paused");
                    self.transition(&run_id, {
                        let correlation_id = correlation_id.clone();
                        let step_name = step_name.clone();
                        move |run| run.pause(correlation_id, reason, step_name)
                    })
                    .await?;
                    self.spawn_pause_watchdog(run_id.clone(), correlation_id);
                    return Ok(());
                }
                Err(EngineError::DeadlineExceeded(detail)) => {
                    warn!(run_id = %run_id.0, step = %step_name, "step deadline exceeded");
                    self.transition(&run_id, |run| {
                        run.record_step_output(StepOutput {
                            step_name,
                            status: StepOutputStatus::Failed,
                            input,
                            output: DataPacket::null(),
                            duration_ms,
                            error: Some(format!("deadline exceeded: {detail}")),
                        })?;
                        run.fail(TerminationReason::DeadlineExceeded)
                    })
                    .await?;
                    return Ok(());
                }
                Err(err) => {
                    error!(run_id = %run_id.0, step = %step_name, %err, "engine dispatch failed");
                    self.transition(&run_id, |run| {
                        run.fail_internal();
                        Ok(())
                    })
                    .await?;
                    return Ok(());
                }
            }
        }
    }

    /// Pause a running run, recording the correlation id for resumption
    ///
    /// Idempotent: pausing again with the same correlation id is a no-op.
    /// The step at the run's cursor is the one recorded as paused.
    pub async fn pause(
        &self,
        run_id: &RunId,
        correlation_id: CorrelationId,
        reason: String,
    ) -> Result<FlowRun, EngineError> {
        let run = self.get_run(run_id).await?;
        let version = self
            .flows
            .find_version(&run.flow_version_id)
            .await?
            .ok_or_else(|| EngineError::VersionNotFound(run.flow_version_id.0.clone()))?;
        let paused_step = version
            .step_names()
            .get(run.step_outputs.len())
            .cloned()
            .ok_or_else(|| {
                EngineError::Validation(vec!["run has no step left to pause on".to_string()])
            })?;

        let paused = self
            .transition(run_id, {
                let correlation_id = correlation_id.clone();
                move |run| run.pause(correlation_id, reason, paused_step)
            })
            .await?;
        self.spawn_pause_watchdog(run_id.clone(), correlation_id);
        Ok(paused)
    }

    /// Resume a paused run by its correlation id, exactly once
    ///
    /// The winner of a concurrent race consumes the id; losers that already
    /// resolved the run see [`EngineError::AlreadyResumed`], and deliveries
    /// arriving after the index entry is gone see [`EngineError::RunNotFound`].
    pub async fn resume(
        &self,
        correlation_id: &CorrelationId,
        payload: DataPacket,
    ) -> Result<FlowRun, EngineError> {
        let run = self
            .runs
            .find_by_correlation(correlation_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(correlation_id.0.clone()))?;

        let run_id = run.id.clone();
        let correlation_id = correlation_id.clone();
        let resumed = self
            .transition(&run_id, move |run| {
                let holds_id = run
                    .pause_metadata
                    .as_ref()
                    .is_some_and(|pm| pm.correlation_id == correlation_id);
                if run.status != RunStatus::Paused || !holds_id {
                    return Err(EngineError::AlreadyResumed(correlation_id.0.clone()));
                }

                let metadata = run.resume()?;
                run.context.merge(&payload);
                run.record_step_output(StepOutput {
                    step_name: metadata.paused_step,
                    status: StepOutputStatus::Succeeded,
                    input: DataPacket::null(),
                    output: payload.clone(),
                    duration_ms: 0,
                    error: None,
                })
            })
            .await?;

        info!(run_id = %run_id.0, "run resumed");
        let manager = self.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.drive(run_id.clone()).await {
                manager.settle_internal(&run_id, err).await;
            }
        });
        Ok(resumed)
    }

    /// Retry a terminally failed run
    ///
    /// Returns the run that will execute: the same record under the
    /// `InPlace` policy, a fresh linked run under `NewLinkedRun`.
    pub async fn retry(
        &self,
        run_id: &RunId,
        strategy: RetryStrategy,
    ) -> Result<FlowRun, EngineError> {
        let retried = match self.config.retry_policy {
            RetryPolicy::InPlace => {
                self.transition(run_id, move |run| run.reset_for_retry(strategy))
                    .await?
            }
            RetryPolicy::NewLinkedRun => {
                let original = self.get_run(run_id).await?;
                let linked = original.spawn_linked_retry(strategy)?;
                self.runs.save(&linked).await?;
                self.emit(&linked).await;
                linked
            }
        };

        self.cancellations.remove(&retried.id.0);
        info!(run_id = %retried.id.0, parent = ?retried.parent_run_id, "run retried");

        let _handle = self.spawn_execution(retried.id.clone());
        Ok(retried)
    }

    /// Request cancellation of a run
    ///
    /// Queued and paused runs fail immediately; running ones stop at the
    /// next step boundary. Cancelling a terminal run is a no-op.
    pub async fn cancel(&self, run_id: &RunId) -> Result<FlowRun, EngineError> {
        self.cancellations
            .entry(run_id.0.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .store(true, Ordering::SeqCst);

        let run = self.get_run(run_id).await?;
        match run.status {
            RunStatus::Queued | RunStatus::Paused => {
                let cancelled = self
                    .transition(run_id, |run| run.fail(TerminationReason::Cancelled))
                    .await?;
                info!(run_id = %run_id.0, "run cancelled");
                Ok(cancelled)
            }
            RunStatus::Running => Ok(run),
            _ => {
                // Already settled; drop the flag set above
                self.cancellations.remove(&run_id.0);
                Ok(run)
            }
        }
    }

    /// Fetch one run by id
    pub async fn get_run(&self, run_id: &RunId) -> Result<FlowRun, EngineError> {
        self.runs
            .find_by_id(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.0.clone()))
    }

    /// List runs with optional filters
    pub async fn list_runs(
        &self,
        flow_id: Option<&FlowId>,
        status: Option<RunStatus>,
    ) -> Result<Vec<FlowRun>, EngineError> {
        self.runs.list(flow_id, status).await
    }

    fn is_cancelled(&self, run_id: &RunId) -> bool {
        self.cancellations
            .get(&run_id.0)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Force-fail the run if no resume arrives within the pause timeout
    fn spawn_pause_watchdog(&self, run_id: RunId, correlation_id: CorrelationId) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(manager.config.pause_timeout).await;
            let result = manager
                .transition(&run_id, move |run| {
                    let still_waiting = run.status == RunStatus::Paused
                        && run
                            .pause_metadata
                            .as_ref()
                            .is_some_and(|pm| pm.correlation_id == correlation_id);
                    if !still_waiting {
                        // Resumed, retried or cancelled in the meantime
                        return Err(EngineError::Validation(vec![
                            "pause already settled".to_string(),
                        ]));
                    }
                    run.fail(TerminationReason::PauseTimeout)
                })
                .await;
            if result.is_ok() {
                warn!(run_id = %run_id.0, "pause timed out");
            }
        });
    }

    /// Drive a run on a background task
    ///
    /// A failure of the drive loop itself is settled through
    /// [`Self::settle_internal`] so the run never sticks in a
    /// non-terminal state.
    fn spawn_execution(&self, run_id: RunId) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.execute_run(run_id.clone()).await {
                manager.settle_internal(&run_id, err).await;
            }
        })
    }

    /// Record an unexpected drive failure against the run
    async fn settle_internal(&self, run_id: &RunId, err: EngineError) {
        error!(run_id = %run_id.0, %err, "run execution failed unexpectedly");
        let settled = self
            .transition(run_id, |run| {
                if run.status.is_terminal() {
                    return Err(EngineError::Validation(vec![
                        "run already settled".to_string(),
                    ]));
                }
                run.fail_internal();
                Ok(())
            })
            .await;
        if let Err(err) = settled {
            debug!(run_id = %run_id.0, %err, "run settled before the failure was recorded");
        }
    }

    fn step_deadline(&self) -> chrono::DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.config.step_deadline)
                .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    /// Load-mutate-save one run under its transition mutex
    ///
    /// Mutex entries are pruned once a run settles, so the acquired mutex is
    /// re-checked against the table after the wait; a pruned or replaced
    /// entry means the run settled while this caller queued, and the fresh
    /// entry must be taken instead.
    async fn transition<F>(&self, run_id: &RunId, f: F) -> Result<FlowRun, EngineError>
    where
        F: FnOnce(&mut FlowRun) -> Result<(), EngineError>,
    {
        let _guard = loop {
            let lock = self
                .transition_locks
                .entry(run_id.0.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let guard = lock.clone().lock_owned().await;
            let current = self
                .transition_locks
                .get(&run_id.0)
                .map(|entry| Arc::ptr_eq(entry.value(), &lock))
                .unwrap_or(false);
            if current {
                break guard;
            }
        };

        let mut run = self
            .runs
            .find_by_id(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.0.clone()))?;
        if let Err(err) = f(&mut run) {
            if run.status.is_terminal() {
                self.prune_run_state(run_id);
            }
            return Err(err);
        }
        self.runs.save(&run).await?;
        self.emit(&run).await;

        if run.status.is_terminal() {
            self.prune_run_state(run_id);
        }
        Ok(run)
    }

    /// Drop per-run bookkeeping once the run can no longer transition
    fn prune_run_state(&self, run_id: &RunId) {
        self.cancellations.remove(&run_id.0);
        self.transition_locks.remove(&run_id.0);
    }

    async fn emit(&self, run: &FlowRun) {
        let update = RunProgressUpdate {
            run_id: run.id.clone(),
            status: run.status,
            steps_completed: run.step_outputs.len(),
            timestamp: Utc::now(),
        };
        if let Err(err) = self.notifier.notify(update).await {
            warn!(run_id = %run.id.0, %err, "progress notification failed");
        }
    }
}
