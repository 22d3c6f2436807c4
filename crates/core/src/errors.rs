use thiserror::Error;

use crate::{domain::conversation::TurnOrderError, flows::FlowTransitionError};

/// A conversation step that broke the turn-order or phase rules.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    TurnOrder(#[from] TurnOrderError),
    #[error(transparent)]
    FlowTransition(#[from] FlowTransitionError),
}
