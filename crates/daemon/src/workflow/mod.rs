// Multi-step workflow tools: state, persistence and the step orchestrator.

mod orchestrator;
mod state;
mod store;

pub use orchestrator::{step_payload, StepStatus, WorkflowOrchestrator};
pub use state::{normalize_path, normalize_paths, Finding, StepRequest, WorkflowState};
pub use store::{ConversationStore, MemoryConversationStore, StoreError};
