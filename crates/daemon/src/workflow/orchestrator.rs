// WorkflowOrchestrator: drives one step of a multi-step tool.
//
// Each step is folded into the stored WorkflowState, then the expert gate
// decides: confidence in {almost_certain, certain} with no further step
// requested skips expert analysis; everything else waits on the supervisor.
// The skip applies even on step 1, with nothing investigated yet.

use std::sync::Arc;
use std::time::Duration;

use conclave_common::ErrorKind;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::state::{StepRequest, WorkflowState};
use super::store::ConversationStore;
use crate::error::CallError;
use crate::expert::{ExpertError, ExpertSupervisor};
use crate::provider::GenerateRequest;
use crate::tools::CallContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Skipped,
    InProgress,
    Completed,
    Error,
}

pub struct WorkflowOrchestrator {
    store: Arc<dyn ConversationStore>,
    supervisor: Arc<ExpertSupervisor>,
    state_ttl: Duration,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        supervisor: Arc<ExpertSupervisor>,
        state_ttl: Duration,
    ) -> Self {
        Self { store, supervisor, state_ttl }
    }

    pub fn supervisor(&self) -> &Arc<ExpertSupervisor> {
        &self.supervisor
    }

    pub async fn run_step(
        &self,
        tool: &str,
        step: StepRequest,
        ctx: &CallContext,
    ) -> Result<Value, CallError> {
        step.validate()?;
        let mut state = self.load_state(tool, &step).await?;
        if state.apply_step(&step) {
            info!(
                continuation_id = %state.continuation_id,
                step_number = step.step_number,
                "workflow step revised earlier findings"
            );
        }
        ctx.partial.publish(step_payload(&state, StepStatus::InProgress, None, None));

        if step.confidence.permits_expert_skip() && !step.next_step_required {
            self.store.remove(&state.continuation_id).await?;
            info!(
                tool,
                continuation_id = %state.continuation_id,
                step_number = state.step_number,
                confidence = %step.confidence,
                "expert analysis skipped"
            );
            return Ok(step_payload(&state, StepStatus::Skipped, None, None));
        }

        self.store.put(&state.continuation_id, state.clone(), self.state_ttl).await?;

        let request = GenerateRequest {
            tool: tool.to_string(),
            prompt: state.render_prompt(),
            model: step.model.clone(),
            temperature: step.temperature,
            provider: step.provider.clone(),
        };
        let ticket = self.supervisor.submit(request);
        if ticket.merged() {
            let kind = ErrorKind::DuplicateCallMerged;
            ctx.progress.report(format!("{kind}: {}", kind.default_message()));
        }

        let progress = ctx.progress.clone();
        let outcome = ticket
            .wait(move |elapsed| {
                progress.report(format!("expert analysis running ({}s elapsed)", elapsed.as_secs()));
            })
            .await;

        match outcome {
            Ok(analysis) => {
                let status = if state.next_step_required {
                    StepStatus::InProgress
                } else {
                    self.store.remove(&state.continuation_id).await?;
                    StepStatus::Completed
                };
                Ok(step_payload(&state, status, Some(&analysis), None))
            }
            Err(error) => {
                warn!(
                    tool,
                    continuation_id = %state.continuation_id,
                    %error,
                    "expert analysis failed, returning accumulated findings"
                );
                Ok(step_payload(&state, StepStatus::Error, None, Some(&error)))
            }
        }
    }

    async fn load_state(&self, tool: &str, step: &StepRequest) -> Result<WorkflowState, CallError> {
        match &step.continuation_id {
            Some(id) => match self.store.get(id).await? {
                Some(state) if state.tool != tool => Err(CallError::InvalidParams(format!(
                    "continuation_id `{id}` belongs to tool `{}`",
                    state.tool
                ))),
                Some(state) => Ok(state),
                None if step.step_number == 1 => Ok(WorkflowState::new(id.clone(), tool)),
                None => Err(CallError::InvalidParams(format!(
                    "unknown or expired continuation_id `{id}`"
                ))),
            },
            None if step.step_number == 1 => {
                Ok(WorkflowState::new(Uuid::new_v4().to_string(), tool))
            }
            None => Err(CallError::InvalidParams(
                "continuation_id is required after step 1".into(),
            )),
        }
    }
}

pub fn step_payload(
    state: &WorkflowState,
    status: StepStatus,
    expert_analysis: Option<&str>,
    error: Option<&ExpertError>,
) -> Value {
    let mut payload = json!({
        "status": status,
        "continuation_id": state.continuation_id,
        "step_number": state.step_number,
        "total_steps": state.total_steps,
        "next_step_required": state.next_step_required,
        "confidence": state.confidence,
        "findings_count": state.findings.len(),
        "relevant_files": state.relevant_files,
        "findings": state.findings,
    });
    if let Some(hypothesis) = &state.hypothesis {
        payload["hypothesis"] = json!(hypothesis);
    }
    if let Some(analysis) = expert_analysis {
        payload["expert_analysis"] = json!(analysis);
    }
    if let Some(error) = error {
        payload["error"] = json!({ "kind": error.kind(), "message": error.to_string() });
    }
    payload
}
