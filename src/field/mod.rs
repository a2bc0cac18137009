//! Multi-component per-DOF fields with halo exchange.

use std::sync::Arc;

use crate::comm::{Communicator, Envelope, Partitioner};
use crate::simd::Lane;
use crate::stencil::{split_disjoint_mut, SparsityPattern};

/// One `N_COMP`-tuple of scalars per degree of freedom, owned range
/// first, ghost range after, in a contiguous flat buffer
/// (`buf[i * N_COMP + c]`).
///
/// The stencil kernels read and write whole tuples through
/// [`get_tensor`](MultiComponentVector::get_tensor) /
/// [`write_tensor`](MultiComponentVector::write_tensor); for a lane type
/// the accessors turn into strided gathers and scatters over
/// `Lane::WIDTH` consecutive DOFs. The ghost range is refreshed with
/// non-blocking start/finish pairs.
#[derive(Clone)]
pub struct MultiComponentVector<const N_COMP: usize> {
    partitioner: Arc<Partitioner>,
    data: Vec<f64>,
}

/// Scalar field over the same partitioning.
pub type ScalarVector = MultiComponentVector<1>;

impl<const N_COMP: usize> MultiComponentVector<N_COMP> {
    /// Allocate a zeroed field over the partitioner's local range.
    pub fn new(partitioner: Arc<Partitioner>) -> Self {
        let n = partitioner.n_local() * N_COMP;
        Self {
            partitioner,
            data: vec![0.0; n],
        }
    }

    pub fn partitioner(&self) -> &Arc<Partitioner> {
        &self.partitioner
    }

    /// Raw storage, owned range first.
    pub fn values(&self) -> &[f64] {
        &self.data
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Read the tuple at DOF `i` (the `Lane::WIDTH` tuples starting at
    /// `i` for a lane type).
    #[inline(always)]
    pub fn get_tensor<T: Lane>(&self, i: usize) -> [T; N_COMP] {
        std::array::from_fn(|c| T::gather_stride(&self.data, i * N_COMP + c, N_COMP))
    }

    /// Read the tuples of the scattered DOFs in `js`.
    #[inline(always)]
    pub fn get_tensor_indexed<T: Lane>(&self, js: &[u32]) -> [T; N_COMP] {
        std::array::from_fn(|c| T::gather_indexed(&self.data, js, N_COMP, c))
    }

    /// Write the tuple at DOF `i`.
    #[inline(always)]
    pub fn write_tensor<T: Lane>(&mut self, value: &[T; N_COMP], i: usize) {
        for (c, v) in value.iter().enumerate() {
            v.scatter_stride(&mut self.data, i * N_COMP + c, N_COMP);
        }
    }

    /// Disjoint per-batch slices of the owned range, one per sparsity
    /// batch, for the worker team.
    pub fn batch_values_mut(&mut self, sparsity: &SparsityPattern) -> Vec<&mut [f64]> {
        split_disjoint_mut(
            &mut self.data,
            sparsity
                .batches()
                .iter()
                .map(|b| b.first_row * N_COMP..(b.first_row + b.n_rows) * N_COMP),
        )
    }

    /// Post the ghost-value messages for this field on `channel`.
    ///
    /// Sending only reads owned values, so an exchange can be posted as
    /// soon as the exported rows of a pass are final. The matching
    /// [`update_ghost_values_finish`](Self::update_ghost_values_finish)
    /// must use the same channel.
    pub fn update_ghost_values_start<C: Communicator>(&self, comm: &C, channel: u32) {
        for (rank, indices) in self.partitioner.send_plan() {
            let mut values = Vec::with_capacity(indices.len() * N_COMP);
            for &i in indices {
                let base = i as usize * N_COMP;
                values.extend_from_slice(&self.data[base..base + N_COMP]);
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

    /// Wait for the ghost-value messages of `channel` and fill the
    /// ghost range.
    pub fn update_ghost_values_finish<C: Communicator>(&mut self, comm: &C, channel: u32) {
        let partitioner = self.partitioner.clone();
        for (rank, indices) in partitioner.recv_plan() {
            let envelope = comm.recv_envelope(channel, Some(*rank));
            debug_assert_eq!(envelope.values.len(), indices.len() * N_COMP);
            for (n, &i) in indices.iter().enumerate() {
                let base = i as usize * N_COMP;
                self.data[base..base + N_COMP]
                    .copy_from_slice(&envelope.values[n * N_COMP..(n + 1) * N_COMP]);
            }
        }
    }

    /// Blocking ghost update.
    pub fn update_ghost_values<C: Communicator>(&mut self, comm: &C, channel: u32) {
        self.update_ghost_values_start(comm, channel);
        self.update_ghost_values_finish(comm, channel);
    }

    /// `self = a * self + b * other`, owned and ghost range alike.
    ///
    /// Used by the Runge-Kutta stage combinations.
    pub fn sadd(&mut self, a: f64, b: f64, other: &Self) {
        debug_assert_eq!(self.data.len(), other.data.len());
        for (x, y) in self.data.iter_mut().zip(&other.data) {
            *x = a * *x + b * *y;
        }
    }

    /// Copy all values from `other`.
    pub fn copy_from(&mut self, other: &Self) {
        self.data.copy_from_slice(&other.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::MeshCommunicator;
    use wide::f64x4;

    #[test]
    fn tensor_round_trip_scalar_and_simd() {
        let p = Arc::new(Partitioner::single_rank(8));
        let mut v = MultiComponentVector::<3>::new(p);
        for i in 0..8 {
            v.write_tensor(&[i as f64, 10.0 + i as f64, 20.0 + i as f64], i);
        }
        assert_eq!(v.get_tensor::<f64>(5), [5.0, 15.0, 25.0]);

        let t = v.get_tensor::<f64x4>(4);
        assert_eq!(t[1].to_array(), [14.0, 15.0, 16.0, 17.0]);

        let js = [6u32, 0, 3, 1];
        let g = v.get_tensor_indexed::<f64x4>(&js);
        assert_eq!(g[2].to_array(), [26.0, 20.0, 23.0, 21.0]);
    }

    #[test]
    fn simd_write_scatters_per_dof() {
        let p = Arc::new(Partitioner::single_rank(4));
        let mut v = MultiComponentVector::<2>::new(p);
        v.write_tensor(
            &[
                f64x4::from([1.0, 2.0, 3.0, 4.0]),
                f64x4::from([5.0, 6.0, 7.0, 8.0]),
            ],
            0,
        );
        assert_eq!(v.get_tensor::<f64>(2), [3.0, 7.0]);
    }

    #[test]
    fn ghost_exchange_between_two_ranks() {
        // Two ranks, each owning two DOFs and ghosting one DOF of the
        // other: local layout [own0, own1, ghost].
        let comms = MeshCommunicator::mesh(2);
        let partitioners = [
            Arc::new(Partitioner::new(
                0,
                2,
                1,
                vec![(1, vec![1])],
                vec![(1, vec![2])],
            )),
            Arc::new(Partitioner::new(
                1,
                2,
                1,
                vec![(0, vec![0])],
                vec![(0, vec![2])],
            )),
        ];

        std::thread::scope(|scope| {
            for (rank, (comm, partitioner)) in comms.iter().zip(&partitioners).enumerate() {
                scope.spawn(move || {
                    let mut v = MultiComponentVector::<2>::new(partitioner.clone());
                    v.write_tensor(&[rank as f64, 100.0 + rank as f64], 0);
                    v.write_tensor(&[10.0 + rank as f64, 110.0 + rank as f64], 1);
                    v.update_ghost_values(comm, 5);
                    let ghost = v.get_tensor::<f64>(2);
                    if rank == 0 {
                        assert_eq!(ghost, [1.0, 101.0]); // rank 1's dof 0
                    } else {
                        assert_eq!(ghost, [10.0, 110.0]); // rank 0's dof 1
                    }
                });
            }
        });
    }

    #[test]
    fn sadd_combines_owned_and_ghost() {
        let p = Arc::new(Partitioner::single_rank(3));
        let mut a = MultiComponentVector::<1>::new(p.clone());
        let mut b = MultiComponentVector::<1>::new(p);
        for i in 0..3 {
            a.write_tensor(&[i as f64], i);
            b.write_tensor(&[1.0], i);
        }
        a.sadd(0.5, 2.0, &b);
        assert_eq!(a.get_tensor::<f64>(2), [3.0]);
    }
}
