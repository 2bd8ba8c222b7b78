//! Error taxonomy for chute operations.
//!
//! Failures inside the runtime adapter trigger snapshot-diff cleanup
//! before they are reported upward; the executor translates whatever
//! reaches it into a safe stored state plus a warning.  Nothing in
//! this enum is allowed to propagate as a crash.

use thiserror::Error;

use crate::types::ChuteState;

#[derive(Debug, Error)]
pub enum ChuteError {
    /// The image build stream signaled an error.
    #[error("building the chute image failed: {0}")]
    BuildFailure(String),

    /// A container runtime call raised.
    #[error("container runtime error during {op}: {source}")]
    RuntimeFailure {
        op: &'static str,
        #[source]
        source: bollard::errors::Error,
    },

    /// The interface-binding helper failed.  The container may still
    /// be running; this is surfaced distinctly, never retried.
    #[error("network bind failed: {0}")]
    NetworkBindFailure(String),

    #[error("chute {0} not found")]
    NotFound(String),

    #[error("chute {0} already exists")]
    AlreadyExists(String),

    #[error("cannot {op} chute {name} in state {state}")]
    InvalidTransition {
        op: &'static str,
        name: String,
        state: ChuteState,
    },

    #[error("invalid chute spec: {0}")]
    InvalidSpec(String),

    #[error("network address pool exhausted")]
    PoolExhausted,

    #[error("interface name {0} is already in use")]
    InterfaceInUse(String),

    /// The network daemon could not be reached or returned garbage.
    #[error("network daemon error: {0}")]
    Daemon(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chute record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("{0}")]
    Unsupported(String),
}

impl ChuteError {
    /// Errors that reject an update without having touched the chute.
    /// These must not rewrite the stored state.
    pub(crate) fn is_rejection(&self) -> bool {
        matches!(
            self,
            ChuteError::NotFound(_)
                | ChuteError::AlreadyExists(_)
                | ChuteError::InvalidTransition { .. }
                | ChuteError::InvalidSpec(_)
                | ChuteError::Unsupported(_)
        )
    }
}
