//! Lifecycle state of a coupled system.
use crate::error::{Result, SystemError};
use serde::{Deserialize, Serialize};

/// The lifecycle of a [`CoupledSystem`](crate::system::CoupledSystem).
///
/// ```text
/// Uninitialized --init()--> Initialized --mesh_mut()--> MeshChanged --mesh_changed()--> Initialized
///                                \------------------------ destroy() ------------------> Destroyed
/// ```
///
/// Entry points that read mesh-derived data (assembly, adaptivity, output) require
/// `Initialized`. A pending `MeshChanged` must be resolved first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemState {
    Uninitialized,
    Initialized,
    MeshChanged,
    Destroyed,
}

impl Default for SystemState {
    fn default() -> Self {
        Self::Uninitialized
    }
}

impl SystemState {
    /// Checks that the system is fully constructed and has no pending mesh change.
    pub fn require_initialized(self, operation: &'static str) -> Result<()> {
        match self {
            Self::Initialized => Ok(()),
            Self::MeshChanged => Err(SystemError::PendingMeshChange { operation }),
            state => Err(SystemError::InvalidState { operation, state }),
        }
    }

    /// Checks that the system has not been initialized yet.
    pub fn require_uninitialized(self, operation: &'static str) -> Result<()> {
        match self {
            Self::Uninitialized => Ok(()),
            state => Err(SystemError::InvalidState { operation, state }),
        }
    }

    /// Checks that the system is alive, i.e. initialized with or without a pending mesh change.
    pub fn require_alive(self, operation: &'static str) -> Result<()> {
        match self {
            Self::Initialized | Self::MeshChanged => Ok(()),
            state => Err(SystemError::InvalidState { operation, state }),
        }
    }

    /// Records that the mesh has been (or is about to be) modified.
    pub fn mark_mesh_modified(&mut self) {
        if *self == Self::Initialized {
            *self = Self::MeshChanged;
        }
    }
}
