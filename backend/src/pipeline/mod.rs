// Sales Pipeline
//
// Stage registry, the per-lead state machine that applies registry-gated
// moves, and metrics over the history ledger.

pub mod machine;
pub mod metrics;
pub mod registry;

pub use machine::{PipelineError, PipelineResult, PipelineStateMachine, StageMove, UNSPECIFIED_LOSS_REASON};
pub use metrics::pipeline_metrics;
pub use registry::{RegistryConfig, RegistryError, StageDefinition, StageRegistry, Transition};
