// Tool registry: maps tool names to handlers.

mod builtin;
mod context;

pub use builtin::{VersionTool, WorkflowTool, WORKFLOW_TOOLS};
pub use context::{CallContext, PartialSlot, ProgressSink};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use conclave_common::TimeoutConfig;
use serde::Serialize;
use serde_json::Value;

use crate::error::CallError;
use crate::workflow::WorkflowOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    SingleShot,
    Workflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub kind: ToolKind,
    pub description: String,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn call(&self, params: Value, ctx: CallContext) -> Result<Value, CallError>;
}

pub trait ToolRegistry: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn ToolHandler>>;

    /// Sorted by name.
    fn descriptors(&self) -> Vec<ToolDescriptor>;
}

/// A fixed set of tools assembled at startup.
#[derive(Default, Clone)]
pub struct StaticToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `version` tool plus every built-in workflow tool.
    pub fn builtin(orchestrator: Arc<WorkflowOrchestrator>, timeouts: TimeoutConfig) -> Self {
        WORKFLOW_TOOLS.iter().fold(
            Self::new().with_tool(Arc::new(VersionTool::new(timeouts))),
            |registry, (name, description)| {
                registry.with_tool(Arc::new(WorkflowTool::new(
                    *name,
                    *description,
                    Arc::clone(&orchestrator),
                )))
            },
        )
    }

    /// Register `handler`, replacing any tool with the same name.
    pub fn with_tool(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.tools.insert(handler.descriptor().name, handler);
        self
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl ToolRegistry for StaticToolRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|handler| handler.descriptor()).collect()
    }
}
