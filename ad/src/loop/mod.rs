//! Loop definitions and the step/cycle runtime

mod definition;
mod runtime;

pub use definition::{DelegationRule, DelegationTree, LoopDefinition, SUPERVISOR_POSITION, StepDefinition};
pub use runtime::{LoopOutcome, LoopRuntime};
