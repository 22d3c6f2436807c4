pub mod engine;
pub mod states;

pub use engine::{FlowDefinition, FlowEngine, FlowTransitionError, ToolCallingFlow};
pub use states::{ConversationEvent, ConversationPhase, FlowAction, FlowContext, TransitionOutcome};
