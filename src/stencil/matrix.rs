//! Sparse matrices over the lane-grouped pattern.

use std::sync::Arc;

use crate::comm::{Communicator, Envelope};
use crate::simd::{Lane, SIMD_WIDTH};
use crate::stencil::{split_disjoint_mut, SparsityPattern};

/// A sparse matrix with `N_COMP` values per nonzero, sharing a
/// [`SparsityPattern`].
///
/// `N_COMP = 1` stores scalars (`d_ij`, `m_ij`, `β_ij`, `l_ij`),
/// `N_COMP = dim` the discrete gradient `c_ij`, and `N_COMP = n_comp`
/// the limiter directions `p_ij`. Values follow the same
/// lane-interleaved layout as the columns; within an aligned group,
/// component `c` of entry `k` occupies one unit-stride span of
/// `SIMD_WIDTH` lanes.
pub struct SparseMatrixSimd<const N_COMP: usize> {
    sparsity: Arc<SparsityPattern>,
    values: Vec<f64>,
}

impl<const N_COMP: usize> SparseMatrixSimd<N_COMP> {
    /// Allocate a zeroed matrix over `sparsity`.
    pub fn new(sparsity: Arc<SparsityPattern>) -> Self {
        let n_values = sparsity.n_entries() * N_COMP;
        Self {
            sparsity,
            values: vec![0.0; n_values],
        }
    }

    pub fn sparsity(&self) -> &SparsityPattern {
        &self.sparsity
    }

    /// Value address of component `c` of the entry at position `pos`.
    #[inline(always)]
    fn value_addr(&self, pos: usize, c: usize) -> usize {
        let lane = self.sparsity.lane_of(pos);
        let stride = if pos < self.sparsity.n_internal_entries() {
            SIMD_WIDTH
        } else {
            1
        };
        N_COMP * (pos - lane) + c * stride + lane
    }

    /// Read one scalar component of the entry `(i, k)`.
    ///
    /// For a lane type, `i` must be the first row of an aligned group
    /// and one value per lane is returned in a single vector load.
    #[inline(always)]
    pub fn get_entry<T: Lane>(&self, i: usize, k: usize) -> T {
        debug_assert_eq!(N_COMP, 1);
        self.component::<T>(i, k, 0)
    }

    /// Write one scalar component of the entry `(i, k)`.
    #[inline(always)]
    pub fn write_entry<T: Lane>(&mut self, value: T, i: usize, k: usize) {
        debug_assert_eq!(N_COMP, 1);
        let addr = self.component_addr::<T>(i, k, 0);
        value.store(&mut self.values[addr..]);
    }

    /// Read the `N_COMP` components of the entry `(i, k)`.
    #[inline(always)]
    pub fn get_tensor<T: Lane>(&self, i: usize, k: usize) -> [T; N_COMP] {
        std::array::from_fn(|c| self.component::<T>(i, k, c))
    }

    /// Write the `N_COMP` components of the entry `(i, k)`.
    #[inline(always)]
    pub fn write_tensor<T: Lane>(&mut self, value: &[T; N_COMP], i: usize, k: usize) {
        for (c, v) in value.iter().enumerate() {
            let addr = self.component_addr::<T>(i, k, c);
            v.store(&mut self.values[addr..]);
        }
    }

    #[inline(always)]
    fn component<T: Lane>(&self, i: usize, k: usize, c: usize) -> T {
        T::load(&self.values[self.component_addr::<T>(i, k, c)..])
    }

    #[inline(always)]
    fn component_addr<T: Lane>(&self, i: usize, k: usize, c: usize) -> usize {
        if T::WIDTH == 1 {
            self.value_addr(self.sparsity.position(i, k), c)
        } else {
            debug_assert!(i % SIMD_WIDTH == 0 && i < self.sparsity.n_internal());
            let first = self.sparsity.position(i, k);
            N_COMP * first + c * SIMD_WIDTH
        }
    }

    /// Read one scalar component of the entry `(j, k')` transposed to
    /// `(i, k)`, through the precomputed transpose map.
    #[inline(always)]
    pub fn get_transposed_entry<T: Lane>(&self, i: usize, k: usize) -> T {
        debug_assert_eq!(N_COMP, 1);
        self.transposed_component::<T>(i, k, 0)
    }

    /// Read the `N_COMP` components of the transposed entry of `(i, k)`.
    #[inline(always)]
    pub fn get_transposed_tensor<T: Lane>(&self, i: usize, k: usize) -> [T; N_COMP] {
        std::array::from_fn(|c| self.transposed_component::<T>(i, k, c))
    }

    #[inline(always)]
    fn transposed_component<T: Lane>(&self, i: usize, k: usize, c: usize) -> T {
        let mut addrs = [0u32; SIMD_WIDTH];
        for (l, addr) in addrs.iter_mut().enumerate().take(T::WIDTH) {
            let pos = self.sparsity.position(i + l, k);
            let t = self.sparsity.transposed_position(pos);
            *addr = self.value_addr(t, c) as u32;
        }
        T::gather_indexed(&self.values, &addrs, 1, 0)
    }

    /// Disjoint per-batch value slices for the worker team.
    ///
    /// Slice `b` covers exactly the entries of batch `b`; ghost-row
    /// values are not handed out.
    pub fn batch_values_mut(&mut self) -> Vec<&mut [f64]> {
        let sparsity = self.sparsity.clone();
        split_disjoint_mut(
            &mut self.values,
            sparsity
                .batches()
                .iter()
                .map(|b| b.entries.start * N_COMP..b.entries.end * N_COMP),
        )
    }

    /// Overwrite every stored value.
    pub fn fill(&mut self, value: f64) {
        self.values.fill(value);
    }

    /// Post the owner-row messages of the row exchange on `channel`.
    ///
    /// Neighbour ranks ghost some of our rows (they appear as ghost rows
    /// of their pattern); send them the current values of those rows.
    /// Sending only reads owned rows.
    pub fn update_ghost_rows_start<C: Communicator>(&self, comm: &C, channel: u32) {
        let plan = self.sparsity.row_exchange();
        for (rank, positions) in &plan.send {
            let mut values = Vec::with_capacity(positions.len() * N_COMP);
            for &pos in positions {
                for c in 0..N_COMP {
                    values.push(self.values[self.value_addr(pos as usize, c)]);
                }
            }
            comm.send(
                *rank,
                Envelope {
                    channel,
                    source: comm.rank() as u32,
                    values,
                }
                .to_bytes(),
            );
        }
    }

    /// Wait for the row exchange of `channel` and scatter the received
    /// values into the ghost rows.
    pub fn update_ghost_rows_finish<C: Communicator>(&mut self, comm: &C, channel: u32) {
        let plan = self.sparsity.row_exchange().clone();
        for (rank, positions) in &plan.recv {
            let envelope = comm.recv_envelope(channel, Some(*rank));
            debug_assert_eq!(envelope.values.len(), positions.len() * N_COMP);
            for (n, &pos) in positions.iter().enumerate() {
                for c in 0..N_COMP {
                    let addr = self.value_addr(pos as usize, c);
                    self.values[addr] = envelope.values[n * N_COMP + c];
                }
            }
        }
    }
}

/// Read component `c` of entry `k` from a batch-local value slab.
///
/// The slab layout makes this the same formula for both instantiations:
/// `(k·N + c)·WIDTH` is a unit-stride lane span in the aligned case and
/// a single scalar in the other.
#[inline(always)]
pub(crate) fn read_batch_entry<T: Lane, const N_COMP: usize>(
    slab: &[f64],
    k: usize,
    c: usize,
) -> T {
    T::load(&slab[(k * N_COMP + c) * T::WIDTH..])
}

/// Write component `c` of entry `k` into a batch-local value slab.
#[inline(always)]
pub(crate) fn write_batch_entry<T: Lane, const N_COMP: usize>(
    slab: &mut [f64],
    k: usize,
    c: usize,
    value: T,
) {
    value.store(&mut slab[(k * N_COMP + c) * T::WIDTH..]);
}

/// Read all components of entry `k` from a batch-local value slab.
#[inline(always)]
pub(crate) fn read_batch_tensor<T: Lane, const N_COMP: usize>(
    slab: &[f64],
    k: usize,
) -> [T; N_COMP] {
    std::array::from_fn(|c| read_batch_entry::<T, N_COMP>(slab, k, c))
}

/// Write all components of entry `k` into a batch-local value slab.
#[inline(always)]
pub(crate) fn write_batch_tensor<T: Lane, const N_COMP: usize>(
    slab: &mut [f64],
    k: usize,
    value: &[T; N_COMP],
) {
    for (c, v) in value.iter().enumerate() {
        write_batch_entry::<T, N_COMP>(slab, k, c, *v);
    }
}
