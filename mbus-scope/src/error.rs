use crate::scope::ScopeKind;
use mbus_core::error::BusError;

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum ScopeError {
    #[error("bus: {0}")]
    Bus(#[from] BusError),

    #[error("scope is disposed: scope={scope}")]
    Disposed { scope: String },

    #[error("invalid nesting: parent={parent}, child={child}")]
    InvalidNesting { parent: ScopeKind, child: ScopeKind },
}

pub type ScopeResult<T> = Result<T, ScopeError>;
