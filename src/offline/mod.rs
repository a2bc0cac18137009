//! Precomputed mesh-dependent data consumed by the kernel.
//!
//! Everything in here is assembled once, ahead of time, by the offline
//! collaborator that builds and distributes the mesh: the partitioner,
//! the SIMD sparsity pattern, the lumped and consistent mass matrices,
//! the discrete gradient coefficients `c_ij`, the geometry weights
//! `β_ij`, the boundary map and the coupling pairs at partition
//! interfaces. The kernel treats all of it as read-only for the whole
//! run.
//!
//! The [`line`] submodule assembles exact P1 data for 1D interval
//! meshes; the integration tests, benchmarks and demos use it as their
//! input source.

pub mod line;

use std::sync::Arc;

use crate::comm::Partitioner;
use crate::equations::Boundary;
use crate::stencil::{SparseMatrixSimd, SparsityPattern};

/// One boundary degree of freedom.
#[derive(Clone, Debug)]
pub struct BoundaryDof<const DIM: usize> {
    /// Local DOF index.
    pub index: usize,
    /// Outward unit normal, mass-averaged over the adjacent faces.
    pub normal: [f64; DIM],
    /// Mass of the normal before normalization.
    pub normal_mass: f64,
    /// Surface measure associated with the DOF.
    pub boundary_mass: f64,
    /// Boundary condition selector.
    pub id: Boundary,
    /// Position of the DOF.
    pub position: [f64; DIM],
}

/// An owner-ghost stencil edge at a partition interface whose viscosity
/// needs post-communication symmetrization.
#[derive(Clone, Copy, Debug)]
pub struct CouplingBoundaryPair {
    /// Locally owned row.
    pub row: u32,
    /// Stencil position of the ghost column within the row.
    pub col_index: u32,
    /// The ghost column.
    pub ghost: u32,
}

/// The static inputs of the hyperbolic kernel.
pub struct OfflineData<const DIM: usize> {
    pub partitioner: Arc<Partitioner>,
    pub sparsity: Arc<SparsityPattern>,
    /// Lumped mass `m_i`, owned and ghost range.
    pub lumped_mass: Vec<f64>,
    /// Elementwise inverse of the lumped mass.
    pub lumped_mass_inverse: Vec<f64>,
    /// Consistent mass `m_ij`.
    pub mass_matrix: SparseMatrixSimd<1>,
    /// Discrete gradient `c_ij`, one `DIM`-vector per nonzero.
    pub cij_matrix: SparseMatrixSimd<DIM>,
    /// Geometry weight `β_ij` feeding the limiter relaxation.
    pub betaij_matrix: SparseMatrixSimd<1>,
    /// Boundary DOFs with their condition and geometry.
    pub boundary_map: Vec<BoundaryDof<DIM>>,
    /// Owner-ghost edges requiring symmetrization after pass 1.
    pub coupling_boundary_pairs: Vec<CouplingBoundaryPair>,
    /// Measure of the global computational domain.
    pub measure_of_omega: f64,
    /// Rows `[0, n_export_indices)` carry values that neighbour ranks
    /// import; the communication-hiding dispatch may start the halo
    /// exchange once they are done.
    pub n_export_indices: usize,
}

impl<const DIM: usize> OfflineData<DIM> {
    /// Whether `i` appears in the boundary map.
    pub fn is_boundary_dof(&self, i: usize) -> bool {
        self.boundary_map.iter().any(|b| b.index == i)
    }
}
