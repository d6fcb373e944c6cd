//! Error types for the coupled system.
//!
//! Errors fall in four groups: setup errors raised while registering variables and evaluators,
//! validity errors raised when an entry point runs before the system is fully constructed
//! (or while a mesh change is pending), contract violations that indicate a programming error
//! in the caller, and evaluator failures propagated out of an assembly pass. None of them are
//! recovered from inside the system; the outer driver decides what to do next.
use crate::state::SystemState;
use std::error::Error as StdError;
use thiserror::Error;

/// Result type alias using [`SystemError`].
pub type Result<T> = std::result::Result<T, SystemError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SystemError {
    /// Invalid or missing setup information.
    #[error("setup error: {0}")]
    Setup(String),

    #[error("duplicate {category} name `{name}`")]
    DuplicateName { category: &'static str, name: String },

    #[error("unknown {category} `{name}`")]
    Unknown { category: &'static str, name: String },

    /// Registration attempted after the first assembly pass.
    #[error("cannot register {category} `{name}` after the first assembly pass")]
    RegistrationClosed { category: &'static str, name: String },

    #[error("finite element type {0} is not supported")]
    UnsupportedFeType(String),

    /// An entry point was invoked in a state that does not permit it.
    #[error("operation `{operation}` is not permitted in state {state:?}")]
    InvalidState { operation: &'static str, state: SystemState },

    /// The mesh was modified but `mesh_changed` has not been called yet.
    #[error("operation `{operation}` requires mesh_changed() to be called after the last mesh modification")]
    PendingMeshChange { operation: &'static str },

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("thread index {index} is out of range for {len} worker threads")]
    ThreadIndexOutOfRange { index: usize, len: usize },

    #[error("thread data is stale (generation {found}, expected {expected}); resize_all was not run")]
    StaleThreadData { found: u64, expected: u64 },

    #[error("expected a vector with {expected} entries, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("refinement would produce a non-conforming mesh: {0}")]
    NonConformingRefinement(String),

    #[error("degenerate element {element}: {reason}")]
    DegenerateElement { element: usize, reason: String },

    /// An evaluator returned an error during an assembly pass.
    #[error("evaluator `{name}` failed")]
    Evaluation {
        name: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl SystemError {
    /// Wraps an evaluator failure together with the name of the evaluator.
    pub fn evaluation(name: &str, report: eyre::Report) -> Self {
        Self::Evaluation {
            name: name.to_string(),
            source: report.into(),
        }
    }

    /// Whether the error is a contract violation, i.e. a programming error in the caller.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::ContractViolation(_)
                | Self::ThreadIndexOutOfRange { .. }
                | Self::StaleThreadData { .. }
                | Self::DimensionMismatch { .. }
        )
    }
}
