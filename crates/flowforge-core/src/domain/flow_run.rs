use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::flow::{FlowId, FlowVersionId, ProjectId};
use crate::{DataPacket, EngineError};

/// Value object: Flow run ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

/// Value object: Correlation ID, the sole external key that can resume a
/// paused run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

/// Flow run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created, waiting for dispatch
    Queued,
    /// Steps are being executed
    Running,
    /// Waiting for an external callback keyed by correlation id
    Paused,
    /// Terminal: all steps completed
    Succeeded,
    /// Terminal: a step failed, the run was cancelled, or a pause timed out
    Failed,
    /// Terminal: the engine itself misbehaved
    InternalError,
}

impl RunStatus {
    /// Terminal states are immutable (except through an explicit retry)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::InternalError
        )
    }
}

/// Why a run reached `Failed`, kept distinguishable for callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationReason {
    /// A step reported an application failure
    StepFailed,
    /// The run was cancelled cooperatively
    Cancelled,
    /// No resume arrived within the pause timeout
    PauseTimeout,
    /// A step overran its wall-clock deadline
    DeadlineExceeded,
    /// An unexpected engine-side condition
    Internal,
}

/// How to replay a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    /// Replay from the first non-succeeded step, reusing settled outputs
    FromFailedStep,
    /// Discard all outputs and re-execute the whole version
    FromStart,
}

/// Status of one executed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutputStatus {
    /// The step completed
    Succeeded,
    /// The step failed or timed out
    Failed,
}

/// Per-step execution record, keyed by the step's stable name
///
/// Outputs are appended in execution order and a settled prefix is never
/// mutated once a later step has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Stable name of the executed step
    pub step_name: String,

    /// Outcome
    pub status: StepOutputStatus,

    /// The input handed to the executor
    pub input: DataPacket,

    /// The output the executor produced
    pub output: DataPacket,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,

    /// Error message when the step failed
    pub error: Option<String>,
}

/// Recorded when a run pauses; holds the externally-visible correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseMetadata {
    /// External key for resumption
    pub correlation_id: CorrelationId,

    /// Why the run paused
    pub reason: String,

    /// The step that requested the pause
    pub paused_step: String,

    /// When the pause began
    pub paused_at: DateTime<Utc>,
}

/// Aggregate: one execution instance of a flow version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    /// Unique identifier
    pub id: RunId,

    /// The flow being executed
    pub flow_id: FlowId,

    /// The exact version being executed
    pub flow_version_id: FlowVersionId,

    /// Owning project
    pub project_id: ProjectId,

    /// Current status
    pub status: RunStatus,

    /// Per-step records in execution order
    pub step_outputs: Vec<StepOutput>,

    /// The payload that started the run
    pub trigger_payload: DataPacket,

    /// Mutable run context; resume payloads are merged in here
    pub context: DataPacket,

    /// Present while paused; consumed exactly once on resume
    pub pause_metadata: Option<PauseMetadata>,

    /// Set when a retry spawned this run as a new linked run
    pub parent_run_id: Option<RunId>,

    /// Why the run failed, when it did
    pub termination_reason: Option<TerminationReason>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// When the run reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl FlowRun {
    /// Create a new queued run
    pub fn new(
        flow_id: FlowId,
        flow_version_id: FlowVersionId,
        project_id: ProjectId,
        trigger_payload: DataPacket,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId(Uuid::new_v4().to_string()),
            flow_id,
            flow_version_id,
            project_id,
            status: RunStatus::Queued,
            step_outputs: Vec::new(),
            trigger_payload,
            context: DataPacket::empty_object(),
            pause_metadata: None,
            parent_run_id: None,
            termination_reason: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    /// Transition `Queued -> Running`
    pub fn begin(&mut self) -> Result<(), EngineError> {
        if self.status != RunStatus::Queued {
            return Err(EngineError::Validation(vec![format!(
                "cannot start run in state {:?}",
                self.status
            )]));
        }
        self.status = RunStatus::Running;
        self.touch();
        Ok(())
    }

    /// Transition `Running -> Paused`, recording the correlation id
    ///
    /// Idempotent: pausing again with the same correlation id is a no-op.
    pub fn pause(
        &mut self,
        correlation_id: CorrelationId,
        reason: String,
        paused_step: String,
    ) -> Result<(), EngineError> {
        if self.status == RunStatus::Paused {
            if self
                .pause_metadata
                .as_ref()
                .is_some_and(|pm| pm.correlation_id == correlation_id)
            {
                return Ok(());
            }
            return Err(EngineError::Validation(vec![
                "run is already paused under a different correlation id".to_string(),
            ]));
        }
        if self.status != RunStatus::Running {
            return Err(EngineError::Validation(vec![format!(
                "cannot pause run in state {:?}",
                self.status
            )]));
        }
        self.pause_metadata = Some(PauseMetadata {
            correlation_id,
            reason,
            paused_step,
            paused_at: Utc::now(),
        });
        self.status = RunStatus::Paused;
        self.touch();
        Ok(())
    }

    /// Transition `Paused -> Running`, consuming the pause metadata
    pub fn resume(&mut self) -> Result<PauseMetadata, EngineError> {
        if self.status != RunStatus::Paused {
            return Err(EngineError::Validation(vec![format!(
                "cannot resume run in state {:?}",
                self.status
            )]));
        }
        let metadata = self
            .pause_metadata
            .take()
            .ok_or_else(|| EngineError::Internal("paused run has no pause metadata".to_string()))?;
        self.status = RunStatus::Running;
        self.touch();
        Ok(metadata)
    }

    /// Append a step output; only legal while running
    pub fn record_step_output(&mut self, output: StepOutput) -> Result<(), EngineError> {
        if self.status != RunStatus::Running {
            return Err(EngineError::Validation(vec![format!(
                "cannot record step output in state {:?}",
                self.status
            )]));
        }
        self.step_outputs.push(output);
        self.touch();
        Ok(())
    }

    /// Transition `Running -> Succeeded`
    pub fn succeed(&mut self) -> Result<(), EngineError> {
        if self.status != RunStatus::Running {
            return Err(EngineError::Validation(vec![format!(
                "cannot complete run in state {:?}",
                self.status
            )]));
        }
        self.status = RunStatus::Succeeded;
        self.finish();
        Ok(())
    }

    /// Transition to `Failed` with a distinguishable reason
    pub fn fail(&mut self, reason: TerminationReason) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(EngineError::Validation(vec![format!(
                "cannot fail run in state {:?}",
                self.status
            )]));
        }
        self.status = RunStatus::Failed;
        self.termination_reason = Some(reason);
        self.pause_metadata = None;
        self.finish();
        Ok(())
    }

    /// Transition to `InternalError`; reserved for unexpected conditions
    pub fn fail_internal(&mut self) {
        self.status = RunStatus::InternalError;
        self.termination_reason = Some(TerminationReason::Internal);
        self.pause_metadata = None;
        self.finish();
    }

    /// Number of leading outputs that succeeded; the settled prefix
    pub fn settled_prefix_len(&self) -> usize {
        self.step_outputs
            .iter()
            .take_while(|o| o.status == StepOutputStatus::Succeeded)
            .count()
    }

    /// Reset a terminally failed run back to `Queued` for an in-place retry
    pub fn reset_for_retry(&mut self, strategy: RetryStrategy) -> Result<(), EngineError> {
        if !matches!(self.status, RunStatus::Failed | RunStatus::InternalError) {
            return Err(EngineError::NotRetryable(self.id.0.clone()));
        }
        match strategy {
            RetryStrategy::FromFailedStep => {
                let settled = self.settled_prefix_len();
                self.step_outputs.truncate(settled);
            }
            RetryStrategy::FromStart => {
                self.step_outputs.clear();
            }
        }
        self.status = RunStatus::Queued;
        self.pause_metadata = None;
        self.termination_reason = None;
        self.finished_at = None;
        self.touch();
        Ok(())
    }

    /// Clone into a fresh queued run linked back to this one
    pub fn spawn_linked_retry(&self, strategy: RetryStrategy) -> Result<FlowRun, EngineError> {
        let mut linked = self.clone();
        linked.reset_for_retry(strategy)?;
        linked.id = RunId(Uuid::new_v4().to_string());
        linked.parent_run_id = Some(self.id.clone());
        linked.created_at = Utc::now();
        linked.updated_at = linked.created_at;
        Ok(linked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_run() -> FlowRun {
        let mut run = FlowRun::new(
            FlowId("f1".to_string()),
            FlowVersionId("v1".to_string()),
            ProjectId("p1".to_string()),
            DataPacket::new(json!({"event": "webhook"})),
        );
        run.begin().unwrap();
        run
    }

    fn output(name: &str, status: StepOutputStatus) -> StepOutput {
        StepOutput {
            step_name: name.to_string(),
            status,
            input: DataPacket::null(),
            output: DataPacket::null(),
            duration_ms: 5,
            error: None,
        }
    }

    #[test]
    fn test_new_run_is_queued() {
        let run = FlowRun::new(
            FlowId("f1".to_string()),
            FlowVersionId("v1".to_string()),
            ProjectId("p1".to_string()),
            DataPacket::null(),
        );
        assert_eq!(run.status, RunStatus::Queued);
        assert!(run.step_outputs.is_empty());
        assert!(run.pause_metadata.is_none());
        assert!(run.finished_at.is_none());
    }

    #[test]
    fn test_begin_requires_queued() {
        let mut run = running_run();
        let err = run.begin().unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_pause_is_idempotent_for_same_correlation_id() {
        let mut run = running_run();
        let cid = CorrelationId("abc".to_string());

        run.pause(cid.clone(), "wait for approval".to_string(), "step_2".to_string())
            .unwrap();
        assert_eq!(run.status, RunStatus::Paused);

        // Same correlation id: no-op, not an error
        run.pause(cid, "wait for approval".to_string(), "step_2".to_string())
            .unwrap();
        assert_eq!(run.status, RunStatus::Paused);

        // Different correlation id: rejected
        let err = run
            .pause(
                CorrelationId("other".to_string()),
                "x".to_string(),
                "step_2".to_string(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_resume_consumes_pause_metadata() {
        let mut run = running_run();
        run.pause(
            CorrelationId("abc".to_string()),
            "waiting".to_string(),
            "step_1".to_string(),
        )
        .unwrap();

        let metadata = run.resume().unwrap();
        assert_eq!(metadata.correlation_id.0, "abc");
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.pause_metadata.is_none());

        // A second resume has nothing to consume
        assert!(run.resume().is_err());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut run = running_run();
        run.succeed().unwrap();
        assert!(run.fail(TerminationReason::Cancelled).is_err());
        assert!(run.begin().is_err());
        assert!(run
            .record_step_output(output("step_1", StepOutputStatus::Succeeded))
            .is_err());
    }

    #[test]
    fn test_fail_records_reason_and_clears_pause() {
        let mut run = running_run();
        run.pause(
            CorrelationId("abc".to_string()),
            "waiting".to_string(),
            "step_1".to_string(),
        )
        .unwrap();

        run.fail(TerminationReason::PauseTimeout).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.termination_reason, Some(TerminationReason::PauseTimeout));
        assert!(run.pause_metadata.is_none());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_settled_prefix() {
        let mut run = running_run();
        run.record_step_output(output("step_1", StepOutputStatus::Succeeded))
            .unwrap();
        run.record_step_output(output("step_2", StepOutputStatus::Failed))
            .unwrap();
        assert_eq!(run.settled_prefix_len(), 1);
    }

    #[test]
    fn test_retry_from_failed_step_keeps_settled_prefix() {
        let mut run = running_run();
        run.record_step_output(output("step_1", StepOutputStatus::Succeeded))
            .unwrap();
        run.record_step_output(output("step_2", StepOutputStatus::Failed))
            .unwrap();
        run.fail(TerminationReason::StepFailed).unwrap();

        run.reset_for_retry(RetryStrategy::FromFailedStep).unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.step_outputs.len(), 1);
        assert_eq!(run.step_outputs[0].step_name, "step_1");
        assert!(run.termination_reason.is_none());
        assert!(run.finished_at.is_none());
    }

    #[test]
    fn test_retry_from_start_discards_all_outputs() {
        let mut run = running_run();
        run.record_step_output(output("step_1", StepOutputStatus::Succeeded))
            .unwrap();
        run.record_step_output(output("step_2", StepOutputStatus::Failed))
            .unwrap();
        run.fail(TerminationReason::StepFailed).unwrap();

        run.reset_for_retry(RetryStrategy::FromStart).unwrap();
        assert!(run.step_outputs.is_empty());
    }

    #[test]
    fn test_retry_requires_terminal_failure() {
        let mut run = running_run();
        let err = run.reset_for_retry(RetryStrategy::FromStart).unwrap_err();
        assert!(matches!(err, EngineError::NotRetryable(_)));

        let mut succeeded = running_run();
        succeeded.succeed().unwrap();
        assert!(matches!(
            succeeded.reset_for_retry(RetryStrategy::FromStart),
            Err(EngineError::NotRetryable(_))
        ));
    }

    #[test]
    fn test_spawn_linked_retry() {
        let mut run = running_run();
        run.record_step_output(output("step_1", StepOutputStatus::Failed))
            .unwrap();
        run.fail(TerminationReason::StepFailed).unwrap();

        let linked = run.spawn_linked_retry(RetryStrategy::FromStart).unwrap();
        assert_ne!(linked.id, run.id);
        assert_eq!(linked.parent_run_id, Some(run.id.clone()));
        assert_eq!(linked.status, RunStatus::Queued);
        assert!(linked.step_outputs.is_empty());
        // The original record is untouched
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[test]
    fn test_run_serialization_roundtrip() {
        let mut run = running_run();
        run.pause(
            CorrelationId("abc".to_string()),
            "waiting".to_string(),
            "step_1".to_string(),
        )
        .unwrap();

        let serialized = serde_json::to_string(&run).unwrap();
        assert!(serialized.contains("\"PAUSED\""));
        let back: FlowRun = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back, run);
    }
}
