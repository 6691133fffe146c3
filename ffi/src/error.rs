use thiserror::Error;

/// Errors reported by the descriptor compiler, the marshaler, and the call
/// engine. Every variant is detected synchronously, before any native call
/// is attempted; a fault inside an invoked native function is the one
/// condition that is not caught.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FfiError {
    /// Malformed or semantically invalid type definition.
    #[error("invalid definition: {0}")]
    Definition(String),

    /// Value/field or argument/parameter count mismatch.
    #[error("arity mismatch: expected {expected}, got {got}")]
    Arity { expected: usize, got: usize },

    /// Array too short, size marker out of bounds, staging capacity exceeded.
    #[error("range error: {0}")]
    Range(String),

    /// A scalar conversion rejected the supplied value.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Type usable in a struct but not in this position (call argument,
    /// return slot).
    #[error("unsupported type: {0}")]
    Unsupported(String),

    /// Collaborator failure outside this subsystem's control.
    #[error("system error: {0}")]
    System(String),
}

pub type FfiResult<T> = Result<T, FfiError>;
