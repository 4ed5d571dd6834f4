// Built-in tools. Business logic for workflow tools stays out of the
// daemon: each one is generic framing over the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use conclave_common::protocol::ws::CURRENT_PROTOCOL_VERSION;
use conclave_common::TimeoutConfig;
use serde_json::{json, Value};

use super::{CallContext, ToolDescriptor, ToolHandler, ToolKind};
use crate::error::CallError;
use crate::workflow::{StepRequest, WorkflowOrchestrator};

pub const WORKFLOW_TOOLS: &[(&str, &str)] = &[
    ("analyze", "Step-by-step code analysis validated by an expert model"),
    ("debug", "Systematic root-cause investigation validated by an expert model"),
    ("thinkdeep", "Extended multi-step reasoning critiqued by an expert model"),
];

/// Single-shot tool reporting the daemon's version and timeout hierarchy.
pub struct VersionTool {
    timeouts: TimeoutConfig,
}

impl VersionTool {
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl ToolHandler for VersionTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "version".into(),
            kind: ToolKind::SingleShot,
            description: "Daemon version, protocol and timeout hierarchy".into(),
        }
    }

    async fn call(&self, _params: Value, _ctx: CallContext) -> Result<Value, CallError> {
        Ok(json!({
            "name": "conclave",
            "version": env!("CARGO_PKG_VERSION"),
            "protocol": CURRENT_PROTOCOL_VERSION,
            "timeouts": {
                "expert_secs": self.timeouts.expert_timeout().as_secs_f64(),
                "tool_secs": self.timeouts.tool_timeout().as_secs_f64(),
                "daemon_secs": self.timeouts.daemon_timeout().as_secs_f64(),
                "shim_secs": self.timeouts.shim_timeout().as_secs_f64(),
                "client_secs": self.timeouts.client_timeout().as_secs_f64(),
            },
        }))
    }
}

pub struct WorkflowTool {
    name: String,
    description: String,
    orchestrator: Arc<WorkflowOrchestrator>,
}

impl WorkflowTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        orchestrator: Arc<WorkflowOrchestrator>,
    ) -> Self {
        Self { name: name.into(), description: description.into(), orchestrator }
    }
}

#[async_trait]
impl ToolHandler for WorkflowTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            kind: ToolKind::Workflow,
            description: self.description.clone(),
        }
    }

    async fn call(&self, params: Value, ctx: CallContext) -> Result<Value, CallError> {
        let step: StepRequest = serde_json::from_value(params)?;
        self.orchestrator.run_step(&self.name, step, &ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expert::{ExpertSettings, ExpertSupervisor};
    use crate::provider::ProviderRouter;
    use crate::tools::{ProgressSink, StaticToolRegistry, ToolRegistry};
    use crate::workflow::MemoryConversationStore;
    use conclave_common::ErrorKind;
    use std::time::Duration;

    fn registry() -> StaticToolRegistry {
        let supervisor =
            Arc::new(ExpertSupervisor::new(Arc::new(ProviderRouter::new()), ExpertSettings::default()));
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            Arc::new(MemoryConversationStore::new()),
            supervisor,
            Duration::from_secs(60),
        ));
        StaticToolRegistry::builtin(orchestrator, TimeoutConfig::from_secs(120.0).unwrap())
    }

    fn context() -> CallContext {
        let (progress, _received) = ProgressSink::channel("r1", Duration::ZERO);
        CallContext::new("s1", "r1", progress)
    }

    #[test]
    fn builtin_registry_lists_every_tool_sorted() {
        let names: Vec<String> =
            registry().descriptors().into_iter().map(|descriptor| descriptor.name).collect();
        assert_eq!(names, vec!["analyze", "debug", "thinkdeep", "version"]);
    }

    #[tokio::test]
    async fn version_reports_timeout_hierarchy() {
        let version = registry().resolve("version").unwrap();
        let payload = version.call(json!({}), context()).await.unwrap();
        assert_eq!(payload["protocol"], CURRENT_PROTOCOL_VERSION);
        assert_eq!(payload["timeouts"]["daemon_secs"], 180.0);
        assert_eq!(payload["timeouts"]["client_secs"], 300.0);
    }

    #[tokio::test]
    async fn workflow_tool_rejects_undecodable_params() {
        let analyze = registry().resolve("analyze").unwrap();
        let error = analyze.call(json!({"step": "missing fields"}), context()).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidParams);

        let error = analyze
            .call(
                json!({
                    "step": "s", "step_number": 1, "total_steps": 1,
                    "next_step_required": false, "findings": "f", "confidence": "sure"
                }),
                context(),
            )
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidParams);
    }

    #[tokio::test]
    async fn workflow_tool_without_provider_reports_provider_error_status() {
        let debug = registry().resolve("debug").unwrap();
        let payload = debug
            .call(
                json!({
                    "step": "s", "step_number": 1, "total_steps": 2,
                    "next_step_required": true, "findings": "f", "confidence": "low"
                }),
                context(),
            )
            .await
            .unwrap();
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error"]["kind"], "PROVIDER_ERROR");
    }
}
