//! Per-worker scratch state.
//!
//! Each worker thread owns one [`ThreadContext`] holding every evaluation buffer it needs during
//! an assembly pass. Contexts live in a [`ThreadArena`] and are reached through a validated
//! [`ThreadHandle`]. The arena is always rebuilt as a whole by
//! [`ThreadDataManager::resize_all`]; a handle obtained before a resize is rejected afterwards.
use crate::error::{Result, SystemError};
use crate::fe_data::{FeData, FeDataKind, MaterialData};
use crate::mesh::SubdomainId;
use crate::variables::VariableRegistry;
use log::debug;
use nalgebra::{DMatrix, DVector};

/// A checked reference to one worker's slot in a [`ThreadArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    index: usize,
    generation: u64,
}

impl ThreadHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A fixed-size collection of per-thread values, tagged with the generation it was allocated in.
#[derive(Debug, Clone)]
pub struct ThreadArena<T> {
    slots: Vec<T>,
    generation: u64,
}

impl<T> Default for ThreadArena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            generation: 0,
        }
    }
}

impl<T> ThreadArena<T> {
    pub fn new(slots: Vec<T>, generation: u64) -> Self {
        Self { slots, generation }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&self, index: usize) -> Result<ThreadHandle> {
        if index < self.slots.len() {
            Ok(ThreadHandle {
                index,
                generation: self.generation,
            })
        } else {
            Err(SystemError::ThreadIndexOutOfRange {
                index,
                len: self.slots.len(),
            })
        }
    }

    fn check(&self, handle: ThreadHandle) -> Result<()> {
        if handle.generation != self.generation {
            return Err(SystemError::StaleThreadData {
                found: handle.generation,
                expected: self.generation,
            });
        }
        if handle.index >= self.slots.len() {
            return Err(SystemError::ThreadIndexOutOfRange {
                index: handle.index,
                len: self.slots.len(),
            });
        }
        Ok(())
    }

    pub fn get(&self, handle: ThreadHandle) -> Result<&T> {
        self.check(handle)?;
        Ok(&self.slots[handle.index])
    }

    pub fn get_mut(&mut self, handle: ThreadHandle) -> Result<&mut T> {
        self.check(handle)?;
        Ok(&mut self.slots[handle.index])
    }

    pub fn as_slice(&self) -> &[T] {
        &self.slots
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.slots
    }
}

/// Every buffer one worker needs during an assembly pass.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    pub(crate) generation: u64,
    pub(crate) element: FeData,
    pub(crate) displaced_element: FeData,
    pub(crate) face: FeData,
    pub(crate) displaced_face: FeData,
    pub(crate) neighbor_face: FeData,
    pub(crate) node: FeData,
    pub(crate) material: MaterialData,
    pub(crate) boundary_material: MaterialData,
    pub(crate) neighbor_material: MaterialData,
    /// `(aux dof, value)` pairs computed by nodal auxiliary kernels during the current pass.
    pub(crate) aux_nodal: Vec<(usize, f64)>,
    /// `(aux dof, value)` pairs computed by elemental auxiliary kernels during the current pass.
    pub(crate) aux_elemental: Vec<(usize, f64)>,
    /// Residual contributions of this worker, indexed by global dof.
    pub(crate) residual: DVector<f64>,
    /// Jacobian contributions `(row dof, column dof, value)` in traversal order.
    pub(crate) triplets: Vec<(usize, usize, f64)>,
    pub(crate) local_matrix: DMatrix<f64>,
    pub(crate) damping: f64,
    pub(crate) current_subdomain: Option<SubdomainId>,
}

impl ThreadContext {
    pub fn new(registry: &VariableRegistry, material_properties: &[String], generation: u64) -> Self {
        let n = registry.num_coupled();
        Self {
            generation,
            element: FeData::new(FeDataKind::Element, n),
            displaced_element: FeData::new(FeDataKind::Element, n),
            face: FeData::new(FeDataKind::Side, n),
            displaced_face: FeData::new(FeDataKind::Side, n),
            neighbor_face: FeData::new(FeDataKind::NeighborSide, n),
            node: FeData::new(FeDataKind::Node, n),
            material: MaterialData::new(material_properties),
            boundary_material: MaterialData::new(material_properties),
            neighbor_material: MaterialData::new(material_properties),
            aux_nodal: Vec::new(),
            aux_elemental: Vec::new(),
            residual: DVector::zeros(0),
            triplets: Vec::new(),
            local_matrix: DMatrix::zeros(0, 0),
            damping: 1.0,
            current_subdomain: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Clears all per-pass outputs. `num_dofs` sizes the residual buffer.
    pub(crate) fn begin_pass(&mut self, num_dofs: usize) {
        if self.residual.len() == num_dofs {
            self.residual.fill(0.0);
        } else {
            self.residual = DVector::zeros(num_dofs);
        }
        self.triplets.clear();
        self.aux_nodal.clear();
        self.aux_elemental.clear();
        self.damping = 1.0;
        self.current_subdomain = None;
    }
}

/// Owns the thread contexts and keeps them consistent with the variable set and mesh.
#[derive(Debug, Default)]
pub struct ThreadDataManager {
    arena: ThreadArena<ThreadContext>,
    num_coupled: usize,
    num_properties: usize,
}

impl ThreadDataManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_threads(&self) -> usize {
        self.arena.len()
    }

    pub fn generation(&self) -> u64 {
        self.arena.generation()
    }

    /// Reallocates every thread context for `num_threads` workers.
    ///
    /// Contexts are never resized in place: all of them are rebuilt and the generation counter
    /// advances, which invalidates every outstanding [`ThreadHandle`]. The auxiliary numbering
    /// of the registry is refreshed as part of the resize.
    pub fn resize_all(
        &mut self,
        num_threads: usize,
        registry: &mut VariableRegistry,
        material_properties: &[String],
    ) {
        registry.refresh_numbering();
        let generation = self.arena.generation() + 1;
        let contexts = (0..num_threads.max(1))
            .map(|_| ThreadContext::new(registry, material_properties, generation))
            .collect();
        self.arena = ThreadArena::new(contexts, generation);
        self.num_coupled = registry.num_coupled();
        self.num_properties = material_properties.len();
        debug!(
            "allocated thread data for {} workers ({} coupled variables, generation {generation})",
            self.arena.len(),
            self.num_coupled
        );
    }

    /// Verifies that the contexts match the current variable set and thread count.
    pub fn check_fresh(&self, registry: &VariableRegistry, num_threads: usize) -> Result<()> {
        let expected = self.arena.generation();
        if let Some(stale) = self.arena.as_slice().iter().find(|c| c.generation != expected) {
            return Err(SystemError::StaleThreadData {
                found: stale.generation,
                expected,
            });
        }
        if self.arena.len() != num_threads || self.num_coupled != registry.num_coupled() {
            return Err(SystemError::StaleThreadData {
                found: expected,
                expected: expected + 1,
            });
        }
        Ok(())
    }

    pub fn handle(&self, index: usize) -> Result<ThreadHandle> {
        self.arena.handle(index)
    }

    pub fn context(&self, handle: ThreadHandle) -> Result<&ThreadContext> {
        self.arena.get(handle)
    }

    pub fn context_mut(&mut self, handle: ThreadHandle) -> Result<&mut ThreadContext> {
        self.arena.get_mut(handle)
    }

    pub fn contexts(&self) -> &[ThreadContext] {
        self.arena.as_slice()
    }

    pub fn contexts_mut(&mut self) -> &mut [ThreadContext] {
        self.arena.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::FeType;

    #[test]
    fn handles_from_previous_generation_are_rejected() {
        let mut registry = VariableRegistry::new();
        registry.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
        let mut manager = ThreadDataManager::new();
        manager.resize_all(2, &mut registry, &[]);
        let handle = manager.handle(1).unwrap();
        assert!(manager.context(handle).is_ok());

        manager.resize_all(3, &mut registry, &[]);
        assert!(matches!(
            manager.context(handle),
            Err(SystemError::StaleThreadData { .. })
        ));
        assert!(matches!(
            manager.handle(3),
            Err(SystemError::ThreadIndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn adding_a_variable_without_resize_is_detected() {
        let mut registry = VariableRegistry::new();
        registry.add_variable("u", FeType::LAGRANGE_FIRST, None).unwrap();
        let mut manager = ThreadDataManager::new();
        manager.resize_all(2, &mut registry, &[]);
        assert!(manager.check_fresh(&registry, 2).is_ok());
        registry.add_aux_variable("a", FeType::MONOMIAL_CONSTANT, None).unwrap();
        assert!(manager.check_fresh(&registry, 2).is_err());
    }
}
