//! The invariant-domain-preserving time-step kernel.
//!
//! One call to [`HyperbolicKernel::step`] advances the state by a
//! forward-Euler step (optionally with Runge-Kutta stage corrections)
//! through seven stencil passes:
//!
//! 0. precompute the per-DOF indicator and limiter tuples,
//! 1. off-diagonal graph viscosity `d_ij` and smoothness `α_i`,
//! 2. interface symmetrization, diagonal `d_ii`, maximal step `τ_max`,
//! 3. provably admissible low-order update, limiter bounds, `r_i`,
//! 4. limiter directions `p_ij` and first blend factors `l_ij`,
//! 5. one high-order sweep per configured limiter iteration.
//!
//! Every pass runs its export-boundary rows first, posts the halo
//! exchange of the pass through a [`SynchronizationDispatch`], and
//! processes the bulk while the messages are in flight; the exchange is
//! completed at the start of the next pass. Within a pass each row is
//! written by exactly one worker, which the per-batch slice splitting
//! turns into a compile-time guarantee.
//!
//! If any `limit` call cannot bracket its constraint the step sets a
//! restart flag; after a collective or-reduction all ranks take the
//! same branch: count a warning and keep the (possibly polluted) state,
//! or roll the step back with [`Restart`] so that the driver retries at
//! a smaller CFL number.

mod dispatch;

pub use dispatch::SynchronizationDispatch;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, info};
use rayon::prelude::*;
use thiserror::Error;
use wide::f64x4;

use crate::comm::Communicator;
use crate::equations::{
    Boundary, HyperbolicSystem, N_PRECOMPUTED_INDICATOR, N_PRECOMPUTED_LIMITER,
};
use crate::field::{MultiComponentVector, ScalarVector};
use crate::indicator::Indicator;
use crate::limiter::{Limiter, N_BOUNDS};
use crate::offline::OfflineData;
use crate::riemann::RiemannSolver;
use crate::simd::Lane;
use crate::stencil::{
    read_batch_tensor, write_batch_entry, write_batch_tensor, Batch, SparseMatrixSimd,
    SparsityPattern,
};

/// The step detected an invariant-domain violation and must be repeated
/// with a smaller time-step size.
#[derive(Clone, Copy, Debug, Error)]
#[error("invariant domain violation: insufficient CFL, restart the time step")]
pub struct Restart;

/// How the kernel responds to an invariant-domain violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdViolationStrategy {
    /// Count a warning and continue with the polluted state.
    Warn,
    /// Roll back: return [`Restart`] so the driver can retry.
    RaiseException,
}

/// Runtime options of the hyperbolic kernel.
#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// Courant number for the low-order stability bound.
    pub cfl: f64,
    /// Number of limiter sweeps; zero disables limiting (low-order
    /// update only).
    pub limiter_iterations: usize,
    /// Convergence criterion of the quadratic Newton iteration.
    pub limiter_newton_tolerance: f64,
    /// Per-edge cap on the Newton iterations.
    pub limiter_newton_max_iterations: usize,
    /// Include boundary rows in the `τ_max` reduction.
    pub cfl_with_boundary_dofs: bool,
    /// Scaling of the mesh-size dependent bound relaxation.
    pub limiter_relaxation_factor: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cfl: 0.2,
            limiter_iterations: 2,
            limiter_newton_tolerance: 1e-10,
            limiter_newton_max_iterations: 2,
            cfl_with_boundary_dofs: false,
            limiter_relaxation_factor: 2.0,
        }
    }
}

impl KernelConfig {
    pub fn with_cfl(mut self, cfl: f64) -> Self {
        self.cfl = cfl;
        self
    }

    pub fn with_limiter_iterations(mut self, iterations: usize) -> Self {
        self.limiter_iterations = iterations;
        self
    }
}

/// Channel used by the blocking ghost update of
/// [`HyperbolicKernel::apply_boundary_conditions`].
const BOUNDARY_CHANNEL: u32 = 2;

/// First channel used by the exchanges of one step.
const FIRST_STEP_CHANNEL: u32 = 10;

type DirichletCallback<'a, const DIM: usize, const N_COMP: usize> =
    Box<dyn Fn([f64; DIM], f64) -> [f64; N_COMP] + Send + Sync + 'a>;

/// The per-rank hyperbolic update kernel.
///
/// Owns the transient matrices and scratch vectors of the pass
/// structure; the static mesh data, the system model, the communicator
/// and the Dirichlet data callback are borrowed for the run.
pub struct HyperbolicKernel<'a, S, C, const DIM: usize, const N_COMP: usize>
where
    S: HyperbolicSystem<DIM, N_COMP>,
    C: Communicator,
{
    system: &'a S,
    offline: &'a OfflineData<DIM>,
    comm: &'a C,
    initial_state: DirichletCallback<'a, DIM, N_COMP>,
    config: KernelConfig,
    id_violation_strategy: IdViolationStrategy,
    n_restarts: usize,
    n_warnings: usize,

    prepared: bool,
    indicator_precomputed: MultiComponentVector<N_PRECOMPUTED_INDICATOR>,
    limiter_precomputed: MultiComponentVector<N_PRECOMPUTED_LIMITER>,
    alpha: ScalarVector,
    bounds: MultiComponentVector<N_BOUNDS>,
    r: MultiComponentVector<N_COMP>,
    dij_upper: SparseMatrixSimd<1>,
    dij_matrix: SparseMatrixSimd<1>,
    lij_matrix: SparseMatrixSimd<1>,
    lij_matrix_next: SparseMatrixSimd<1>,
    pij_matrix: SparseMatrixSimd<N_COMP>,
    boundary_dof: Vec<bool>,
}

impl<'a, S, C, const DIM: usize, const N_COMP: usize> HyperbolicKernel<'a, S, C, DIM, N_COMP>
where
    S: HyperbolicSystem<DIM, N_COMP>,
    C: Communicator,
{
    pub fn new(
        system: &'a S,
        offline: &'a OfflineData<DIM>,
        comm: &'a C,
        initial_state: impl Fn([f64; DIM], f64) -> [f64; N_COMP] + Send + Sync + 'a,
    ) -> Self {
        let partitioner = offline.partitioner.clone();
        let sparsity = offline.sparsity.clone();
        Self {
            system,
            offline,
            comm,
            initial_state: Box::new(initial_state),
            config: KernelConfig::default(),
            id_violation_strategy: IdViolationStrategy::Warn,
            n_restarts: 0,
            n_warnings: 0,
            prepared: false,
            indicator_precomputed: MultiComponentVector::new(partitioner.clone()),
            limiter_precomputed: MultiComponentVector::new(partitioner.clone()),
            alpha: ScalarVector::new(partitioner.clone()),
            bounds: MultiComponentVector::new(partitioner.clone()),
            r: MultiComponentVector::new(partitioner),
            dij_upper: SparseMatrixSimd::new(sparsity.clone()),
            dij_matrix: SparseMatrixSimd::new(sparsity.clone()),
            lij_matrix: SparseMatrixSimd::new(sparsity.clone()),
            lij_matrix_next: SparseMatrixSimd::new(sparsity.clone()),
            pij_matrix: SparseMatrixSimd::new(sparsity),
            boundary_dof: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut KernelConfig {
        &mut self.config
    }

    pub fn set_id_violation_strategy(&mut self, strategy: IdViolationStrategy) {
        self.id_violation_strategy = strategy;
    }

    /// Number of steps rolled back with [`Restart`].
    pub fn n_restarts(&self) -> usize {
        self.n_restarts
    }

    /// Number of violations tolerated under [`IdViolationStrategy::Warn`].
    pub fn n_warnings(&self) -> usize {
        self.n_warnings
    }

    /// Graph viscosity of the most recent step, after symmetrization.
    pub fn dij_matrix(&self) -> &SparseMatrixSimd<1> {
        &self.dij_matrix
    }

    /// Blend factors of the most recent step.
    pub fn lij_matrix(&self) -> &SparseMatrixSimd<1> {
        &self.lij_matrix
    }

    /// Limiter bounds of the most recent step.
    pub fn bounds(&self) -> &MultiComponentVector<N_BOUNDS> {
        &self.bounds
    }

    /// Finish allocation of the transient storage. Idempotent; called
    /// implicitly by the first [`step`](Self::step).
    pub fn prepare(&mut self) {
        if self.prepared {
            return;
        }
        let mut boundary_dof = vec![false; self.offline.partitioner.n_owned()];
        for entry in &self.offline.boundary_map {
            boundary_dof[entry.index] = true;
        }
        self.boundary_dof = boundary_dof;
        self.prepared = true;
    }

    /// Apply the configured boundary conditions to `u` at time `t` and
    /// refresh its ghost range.
    pub fn apply_boundary_conditions(&self, u: &mut MultiComponentVector<N_COMP>, t: f64) {
        for entry in &self.offline.boundary_map {
            if entry.id == Boundary::DoNothing {
                continue;
            }
            let u_i: [f64; N_COMP] = u.get_tensor(entry.index);
            let position = entry.position;
            let corrected = self.system.apply_boundary_conditions(
                entry.id,
                u_i,
                &entry.normal,
                || (self.initial_state)(position, t),
            );
            u.write_tensor(&corrected, entry.index);
        }
        u.update_ghost_values(self.comm, BOUNDARY_CHANNEL);
    }

    /// Perform one forward-Euler update from `old_u` into `new_u`,
    /// with `STAGES` additional Runge-Kutta stage states entering the
    /// high-order flux with the given weights.
    ///
    /// If `tau` is zero the maximal admissible step size is used.
    /// Returns the computed `τ_max` regardless of the `tau` actually
    /// taken. The ghost ranges of `old_u` and all stage states must be
    /// up to date.
    pub fn step<const STAGES: usize>(
        &mut self,
        old_u: &MultiComponentVector<N_COMP>,
        stage_u: [&MultiComponentVector<N_COMP>; STAGES],
        stage_weights: [f64; STAGES],
        new_u: &mut MultiComponentVector<N_COMP>,
        tau: f64,
    ) -> Result<f64, Restart> {
        self.prepare();

        let system = self.system;
        let offline = self.offline;
        let comm = self.comm;
        let config = self.config.clone();
        let sparsity: &SparsityPattern = &offline.sparsity;
        let batches = sparsity.batches();
        let n_export = batches
            .iter()
            .take_while(|b| b.first_row < offline.n_export_indices)
            .count();

        let refs = KernelRefs {
            system,
            sparsity,
            cij: &offline.cij_matrix,
            mass: &offline.mass_matrix,
            betaij: &offline.betaij_matrix,
            lumped_mass: &offline.lumped_mass,
            lumped_mass_inverse: &offline.lumped_mass_inverse,
            measure_of_omega_inverse: 1.0 / offline.measure_of_omega,
            config: &config,
        };

        let mut channel = FIRST_STEP_CHANNEL;
        let mut next_channel = move || {
            channel += 1;
            channel - 1
        };

        let restart_needed = AtomicBool::new(false);

        /*
         * Pass 0: precompute the per-DOF indicator and limiter tuples.
         */

        let precompute_channels = (next_channel(), next_channel());
        {
            let body = batch_fn2(|(batch, (indicator_slab, limiter_slab))| {
                if batch.row_length == 1 {
                    return;
                }
                if batch.is_simd() {
                    precompute_body::<f64x4, S, DIM, N_COMP>(
                        system,
                        old_u,
                        batch,
                        indicator_slab,
                        limiter_slab,
                    );
                } else {
                    precompute_body::<f64, S, DIM, N_COMP>(
                        system,
                        old_u,
                        batch,
                        indicator_slab,
                        limiter_slab,
                    );
                }
            });

            let dispatch = SynchronizationDispatch::new();
            {
                let head_i = head(self.indicator_precomputed.batch_values_mut(sparsity), n_export);
                let head_l = head(self.limiter_precomputed.batch_values_mut(sparsity), n_export);
                batches[..n_export]
                    .par_iter()
                    .zip(head_i.into_par_iter().zip(head_l))
                    .for_each(&body);
            }
            dispatch.dispatch(|| {
                self.indicator_precomputed
                    .update_ghost_values_start(comm, precompute_channels.0);
                self.limiter_precomputed
                    .update_ghost_values_start(comm, precompute_channels.1);
            });
            {
                let tail_i = tail(self.indicator_precomputed.batch_values_mut(sparsity), n_export);
                let tail_l = tail(self.limiter_precomputed.batch_values_mut(sparsity), n_export);
                batches[n_export..]
                    .par_iter()
                    .zip(tail_i.into_par_iter().zip(tail_l))
                    .for_each(&body);
            }
        }

        self.indicator_precomputed
            .update_ghost_values_finish(comm, precompute_channels.0);
        self.limiter_precomputed
            .update_ghost_values_finish(comm, precompute_channels.1);

        /*
         * Pass 1: off-diagonal d_ij (upper triangle only) and α_i.
         */

        let alpha_channel = next_channel();
        {
            let indicator_precomputed = &self.indicator_precomputed;

            let body = batch_fn2(|(batch, (dij_slab, alpha_slab))| {
                if batch.row_length == 1 {
                    return;
                }
                if batch.is_simd() {
                    viscosity_body::<f64x4, S, DIM, N_COMP>(
                        &refs,
                        old_u,
                        indicator_precomputed,
                        batch,
                        dij_slab,
                        alpha_slab,
                    );
                } else {
                    viscosity_body::<f64, S, DIM, N_COMP>(
                        &refs,
                        old_u,
                        indicator_precomputed,
                        batch,
                        dij_slab,
                        alpha_slab,
                    );
                }
            });

            let dispatch = SynchronizationDispatch::new();
            {
                let head_d = head(self.dij_upper.batch_values_mut(), n_export);
                let head_a = head(self.alpha.batch_values_mut(sparsity), n_export);
                batches[..n_export]
                    .par_iter()
                    .zip(head_d.into_par_iter().zip(head_a))
                    .for_each(&body);
            }
            dispatch.dispatch(|| {
                self.alpha.update_ghost_values_start(comm, alpha_channel);
            });
            {
                let tail_d = tail(self.dij_upper.batch_values_mut(), n_export);
                let tail_a = tail(self.alpha.batch_values_mut(sparsity), n_export);
                batches[n_export..]
                    .par_iter()
                    .zip(tail_d.into_par_iter().zip(tail_a))
                    .for_each(&body);
            }
        }

        /*
         * Pass 2: complete d_ij at the partition interface, symmetrize,
         * fill the diagonal and reduce τ_max.
         */

        let tau_max_bits = AtomicU64::new(f64::INFINITY.to_bits());
        {
            // Interface edges: recompute the mirrored estimate and keep
            // the larger one, so both ranks agree on the edge value.
            let riemann = RiemannSolver::new(system);
            for pair in &offline.coupling_boundary_pairs {
                let i = pair.row as usize;
                let j = pair.ghost as usize;
                let k = pair.col_index as usize;
                debug_assert_eq!(sparsity.column(i, k) as usize, j);

                let u_i: [f64; N_COMP] = old_u.get_tensor(i);
                let u_j: [f64; N_COMP] = old_u.get_tensor(j);
                let c_ji: [f64; DIM] = offline.cij_matrix.get_transposed_tensor(i, k);
                let norm = norm_of(&c_ji);
                debug_assert!(norm > 1e-12);
                let n_ji: [f64; DIM] = std::array::from_fn(|d| c_ji[d] / norm);
                let lambda_max = riemann.compute(&u_j, &u_i, &n_ji);

                let d = self.dij_upper.get_entry::<f64>(i, k);
                self.dij_upper.write_entry(d.max(norm * lambda_max), i, k);
            }

            let dij_upper = &self.dij_upper;
            let boundary_dof = &self.boundary_dof;
            let tau_max_bits = &tau_max_bits;
            let refs = &refs;
            let body = batch_fn1(move |(batch, dij_slab)| {
                if batch.row_length == 1 {
                    return;
                }
                for l in 0..batch.n_rows {
                    let i = batch.first_row + l;
                    let mut d_sum = 0.0;
                    for k in 1..batch.row_length {
                        let j = refs.sparsity.column(i, k) as usize;
                        // The lower triangle is missing from pass 1;
                        // fetch it through the transpose map.
                        let d = if j < i {
                            dij_upper.get_transposed_entry::<f64>(i, k)
                        } else {
                            dij_upper.get_entry::<f64>(i, k)
                        };
                        dij_slab[k * batch.n_rows + l] = d;
                        d_sum -= d;
                    }
                    dij_slab[l] = d_sum;

                    let tau_i = refs.config.cfl * refs.lumped_mass[i] / (-2.0 * d_sum);
                    if refs.config.cfl_with_boundary_dofs || !boundary_dof[i] {
                        atomic_min_f64(tau_max_bits, tau_i);
                    }
                }
            });

            let slabs = self.dij_matrix.batch_values_mut();
            batches.par_iter().zip(slabs).for_each(body);
        }

        self.alpha.update_ghost_values_finish(comm, alpha_channel);

        let tau_max = comm.all_reduce_min(
            next_channel(),
            f64::from_bits(tau_max_bits.load(Ordering::Relaxed)),
        );
        assert!(
            !tau_max.is_nan() && !tau_max.is_infinite() && tau_max > 0.0,
            "failed to compute a positive maximal time-step size (tau_max = {})",
            tau_max
        );
        let tau = if tau == 0.0 { tau_max } else { tau };
        debug!(
            "computed tau_max = {:.6e}, stepping with tau = {:.6e}",
            tau_max, tau
        );

        /*
         * Pass 3: low-order update, limiter bounds and r_i.
         */

        let r_channel = next_channel();
        new_u.copy_from(old_u);
        {
            let alpha = &self.alpha;
            let limiter_precomputed = &self.limiter_precomputed;
            let dij_matrix = &self.dij_matrix;

            let body = batch_fn3(|(batch, ((new_u_slab, r_slab), bounds_slab))| {
                if batch.row_length == 1 {
                    return;
                }
                if batch.is_simd() {
                    low_order_body::<f64x4, S, DIM, N_COMP, STAGES>(
                        &refs,
                        old_u,
                        &stage_u,
                        &stage_weights,
                        alpha,
                        limiter_precomputed,
                        dij_matrix,
                        tau,
                        batch,
                        new_u_slab,
                        r_slab,
                        bounds_slab,
                    );
                } else {
                    low_order_body::<f64, S, DIM, N_COMP, STAGES>(
                        &refs,
                        old_u,
                        &stage_u,
                        &stage_weights,
                        alpha,
                        limiter_precomputed,
                        dij_matrix,
                        tau,
                        batch,
                        new_u_slab,
                        r_slab,
                        bounds_slab,
                    );
                }
            });

            let dispatch = SynchronizationDispatch::new();
            {
                let head_u = head(new_u.batch_values_mut(sparsity), n_export);
                let head_r = head(self.r.batch_values_mut(sparsity), n_export);
                let head_b = head(self.bounds.batch_values_mut(sparsity), n_export);
                batches[..n_export]
                    .par_iter()
                    .zip(head_u.into_par_iter().zip(head_r).zip(head_b))
                    .for_each(&body);
            }
            dispatch.dispatch(|| {
                if config.limiter_iterations != 0 {
                    self.r.update_ghost_values_start(comm, r_channel);
                }
            });
            {
                let tail_u = tail(new_u.batch_values_mut(sparsity), n_export);
                let tail_r = tail(self.r.batch_values_mut(sparsity), n_export);
                let tail_b = tail(self.bounds.batch_values_mut(sparsity), n_export);
                batches[n_export..]
                    .par_iter()
                    .zip(tail_u.into_par_iter().zip(tail_r).zip(tail_b))
                    .for_each(&body);
            }
        }

        if config.limiter_iterations != 0 {
            self.r.update_ghost_values_finish(comm, r_channel);
        }

        /*
         * Pass 4: limiter directions p_ij and first blend factors l_ij.
         */

        let lij_channel = next_channel();
        if config.limiter_iterations != 0 {
            let new_u_read: &MultiComponentVector<N_COMP> = new_u;
            let alpha = &self.alpha;
            let bounds = &self.bounds;
            let r_vector = &self.r;
            let dij_matrix = &self.dij_matrix;
            let restart = &restart_needed;

            let body = batch_fn2(|(batch, (pij_slab, lij_slab))| {
                if batch.row_length == 1 {
                    return;
                }
                if batch.is_simd() {
                    limiter_direction_body::<f64x4, S, DIM, N_COMP, STAGES>(
                        &refs,
                        old_u,
                        &stage_u,
                        &stage_weights,
                        new_u_read,
                        alpha,
                        r_vector,
                        bounds,
                        dij_matrix,
                        tau,
                        batch,
                        pij_slab,
                        lij_slab,
                        restart,
                    );
                } else {
                    limiter_direction_body::<f64, S, DIM, N_COMP, STAGES>(
                        &refs,
                        old_u,
                        &stage_u,
                        &stage_weights,
                        new_u_read,
                        alpha,
                        r_vector,
                        bounds,
                        dij_matrix,
                        tau,
                        batch,
                        pij_slab,
                        lij_slab,
                        restart,
                    );
                }
            });

            let dispatch = SynchronizationDispatch::new();
            {
                let head_p = head(self.pij_matrix.batch_values_mut(), n_export);
                let head_l = head(self.lij_matrix.batch_values_mut(), n_export);
                batches[..n_export]
                    .par_iter()
                    .zip(head_p.into_par_iter().zip(head_l))
                    .for_each(&body);
            }
            dispatch.dispatch(|| {
                self.lij_matrix.update_ghost_rows_start(comm, lij_channel);
            });
            {
                let tail_p = tail(self.pij_matrix.batch_values_mut(), n_export);
                let tail_l = tail(self.lij_matrix.batch_values_mut(), n_export);
                batches[n_export..]
                    .par_iter()
                    .zip(tail_p.into_par_iter().zip(tail_l))
                    .for_each(&body);
            }

            self.lij_matrix.update_ghost_rows_finish(comm, lij_channel);
        }

        /*
         * Passes 5 .. 4 + k: symmetrize l_ij and apply the high-order
         * update, recomputing the blend factors between sweeps.
         */

        for pass in 0..config.limiter_iterations {
            let last_round = pass + 1 == config.limiter_iterations;
            let next_lij_channel = next_channel();

            {
                let bounds = &self.bounds;
                let lij_matrix = &self.lij_matrix;
                let restart = &restart_needed;

                let body = batch_fn3(|(batch, ((new_u_slab, pij_slab), lij_next_slab))| {
                    if batch.row_length == 1 {
                        return;
                    }
                    if batch.is_simd() {
                        high_order_sweep_body::<f64x4, S, DIM, N_COMP>(
                            &refs,
                            bounds,
                            lij_matrix,
                            batch,
                            new_u_slab,
                            pij_slab,
                            lij_next_slab,
                            last_round,
                            restart,
                        );
                    } else {
                        high_order_sweep_body::<f64, S, DIM, N_COMP>(
                            &refs,
                            bounds,
                            lij_matrix,
                            batch,
                            new_u_slab,
                            pij_slab,
                            lij_next_slab,
                            last_round,
                            restart,
                        );
                    }
                });

                let dispatch = SynchronizationDispatch::new();
                {
                    let head_u = head(new_u.batch_values_mut(sparsity), n_export);
                    let head_p = head(self.pij_matrix.batch_values_mut(), n_export);
                    let head_l = head(self.lij_matrix_next.batch_values_mut(), n_export);
                    batches[..n_export]
                        .par_iter()
                        .zip(head_u.into_par_iter().zip(head_p).zip(head_l))
                        .for_each(&body);
                }
                dispatch.dispatch(|| {
                    if !last_round {
                        self.lij_matrix_next
                            .update_ghost_rows_start(comm, next_lij_channel);
                    }
                });
                {
                    let tail_u = tail(new_u.batch_values_mut(sparsity), n_export);
                    let tail_p = tail(self.pij_matrix.batch_values_mut(), n_export);
                    let tail_l = tail(self.lij_matrix_next.batch_values_mut(), n_export);
                    batches[n_export..]
                        .par_iter()
                        .zip(tail_u.into_par_iter().zip(tail_p).zip(tail_l))
                        .for_each(&body);
                }
            }

            if !last_round {
                self.lij_matrix_next
                    .update_ghost_rows_finish(comm, next_lij_channel);
                std::mem::swap(&mut self.lij_matrix, &mut self.lij_matrix_next);
            }
        }

        /* Do we have to restart? */

        let restart = comm.all_reduce_or(next_channel(), restart_needed.load(Ordering::Relaxed));
        if restart {
            match self.id_violation_strategy {
                IdViolationStrategy::Warn => {
                    self.n_warnings += 1;
                    if comm.rank() == 0 {
                        info!("insufficient CFL: invariant domain violation detected");
                    }
                }
                IdViolationStrategy::RaiseException => {
                    self.n_restarts += 1;
                    return Err(Restart);
                }
            }
        }

        Ok(tau_max)
    }
}

/// Item shapes of the zipped batch iterations.
type BatchItem1<'b> = (&'b Batch, &'b mut [f64]);
type BatchItem2<'b> = (&'b Batch, (&'b mut [f64], &'b mut [f64]));
type BatchItem3<'b> = (
    &'b Batch,
    ((&'b mut [f64], &'b mut [f64]), &'b mut [f64]),
);

/// Coerce a pass body to a lifetime-polymorphic signature, so the same
/// closure can drive the export phase and the bulk phase of a pass.
fn batch_fn1<F>(f: F) -> F
where
    F: for<'b> Fn(BatchItem1<'b>) + Sync + Send,
{
    f
}

fn batch_fn2<F>(f: F) -> F
where
    F: for<'b> Fn(BatchItem2<'b>) + Sync + Send,
{
    f
}

fn batch_fn3<F>(f: F) -> F
where
    F: for<'b> Fn(BatchItem3<'b>) + Sync + Send,
{
    f
}

/// Keep the first `n` batch slabs.
fn head(mut slabs: Vec<&mut [f64]>, n: usize) -> Vec<&mut [f64]> {
    slabs.truncate(n);
    slabs
}

/// Keep the batch slabs after the first `n`.
fn tail(mut slabs: Vec<&mut [f64]>, n: usize) -> Vec<&mut [f64]> {
    slabs.split_off(n)
}

/// Shared read-only references threaded through the pass bodies.
struct KernelRefs<'k, S, const DIM: usize, const N_COMP: usize> {
    system: &'k S,
    sparsity: &'k SparsityPattern,
    cij: &'k SparseMatrixSimd<DIM>,
    mass: &'k SparseMatrixSimd<1>,
    betaij: &'k SparseMatrixSimd<1>,
    lumped_mass: &'k [f64],
    lumped_mass_inverse: &'k [f64],
    measure_of_omega_inverse: f64,
    config: &'k KernelConfig,
}

/// Pass 0 for one batch.
fn precompute_body<T, S, const DIM: usize, const N_COMP: usize>(
    system: &S,
    old_u: &MultiComponentVector<N_COMP>,
    batch: &Batch,
    indicator_slab: &mut [f64],
    limiter_slab: &mut [f64],
) where
    T: Lane,
    S: HyperbolicSystem<DIM, N_COMP>,
{
    let u_i = old_u.get_tensor::<T>(batch.first_row);
    write_field_batch(indicator_slab, &system.precompute_values_indicator(&u_i));
    write_field_batch(limiter_slab, &system.precompute_values_limiter(&u_i));
}

/// Pass 1 for one batch: upper-triangular d_ij and α_i.
fn viscosity_body<T, S, const DIM: usize, const N_COMP: usize>(
    refs: &KernelRefs<'_, S, DIM, N_COMP>,
    old_u: &MultiComponentVector<N_COMP>,
    indicator_precomputed: &MultiComponentVector<N_PRECOMPUTED_INDICATOR>,
    batch: &Batch,
    dij_slab: &mut [f64],
    alpha_slab: &mut [f64],
) where
    T: Lane,
    S: HyperbolicSystem<DIM, N_COMP>,
{
    let i = batch.first_row;
    let columns = &refs.sparsity.column_storage()[batch.entries.clone()];
    let riemann = RiemannSolver::new(refs.system);
    let mut indicator: Indicator<'_, T, S, DIM, N_COMP> =
        Indicator::new(refs.system, indicator_precomputed);

    let u_i = old_u.get_tensor::<T>(i);
    indicator.reset(&u_i);

    for k in 1..batch.row_length {
        let js = &columns[k * T::WIDTH..k * T::WIDTH + T::WIDTH];
        let u_j = old_u.get_tensor_indexed::<T>(js);
        let c_ij = refs.cij.get_tensor::<T>(i, k);

        indicator.add(js, &u_j, &c_ij);

        // Only the upper triangle is computed here; pass 2 mirrors it.
        if all_below_diagonal::<T>(i, js) {
            continue;
        }

        let mut norm2 = T::splat(0.0);
        for d in 0..DIM {
            norm2 = norm2 + c_ij[d] * c_ij[d];
        }
        let norm = norm2.sqrt();
        let n_ij: [T; DIM] = std::array::from_fn(|d| c_ij[d] / norm);
        let lambda_max = riemann.compute(&u_i, &u_j, &n_ij);
        write_batch_entry::<T, 1>(dij_slab, k, 0, norm * lambda_max);
    }

    write_field_batch(alpha_slab, &[indicator.alpha()]);
}

/// Pass 3 for one batch: low-order update, bounds and r_i.
#[allow(clippy::too_many_arguments)]
fn low_order_body<T, S, const DIM: usize, const N_COMP: usize, const STAGES: usize>(
    refs: &KernelRefs<'_, S, DIM, N_COMP>,
    old_u: &MultiComponentVector<N_COMP>,
    stage_u: &[&MultiComponentVector<N_COMP>; STAGES],
    stage_weights: &[f64; STAGES],
    alpha: &ScalarVector,
    limiter_precomputed: &MultiComponentVector<N_PRECOMPUTED_LIMITER>,
    dij_matrix: &SparseMatrixSimd<1>,
    tau: f64,
    batch: &Batch,
    new_u_slab: &mut [f64],
    r_slab: &mut [f64],
    bounds_slab: &mut [f64],
) where
    T: Lane,
    S: HyperbolicSystem<DIM, N_COMP>,
{
    let system = refs.system;
    let i = batch.first_row;
    let columns = &refs.sparsity.column_storage()[batch.entries.clone()];
    let weight = 1.0 - stage_weights.iter().sum::<f64>();

    let u_i = old_u.get_tensor::<T>(i);
    let f_i = system.flux(&u_i);
    let f_i_stages: [[[T; DIM]; N_COMP]; STAGES] =
        std::array::from_fn(|s| system.flux(&stage_u[s].get_tensor::<T>(i)));

    let [alpha_i] = alpha.get_tensor::<T>(i);
    let m_i = T::load(&refs.lumped_mass[i..]);
    let m_i_inv = T::load(&refs.lumped_mass_inverse[i..]);
    let tau_t = T::splat(tau);

    let mut limiter: Limiter<'_, T, S, DIM, N_COMP> = Limiter::new(system, limiter_precomputed);
    limiter.reset(i);

    let mut u_i_new = u_i;
    let mut r_i = [T::splat(0.0); N_COMP];

    for k in 0..batch.row_length {
        let js = &columns[k * T::WIDTH..k * T::WIDTH + T::WIDTH];
        let u_j = old_u.get_tensor_indexed::<T>(js);
        let f_j = system.flux(&u_j);
        let f_j_stages: [[[T; DIM]; N_COMP]; STAGES] =
            std::array::from_fn(|s| system.flux(&stage_u[s].get_tensor_indexed::<T>(js)));

        let [alpha_j] = alpha.get_tensor_indexed::<T>(js);
        let d_ij = dij_matrix.get_entry::<T>(i, k);
        let d_ij_h = d_ij * (alpha_i + alpha_j) * T::splat(0.5);

        let c_ij = refs.cij.get_tensor::<T>(i, k);
        // Guard the division for edges with vanishing viscosity.
        let tiny = T::splat(f64::MIN_POSITIVE);
        let d_safe = T::select(d_ij.abs().le(tiny), tiny, d_ij);
        let d_ij_inv = T::splat(1.0) / d_safe;

        let mut u_ij_bar = [T::splat(0.0); N_COMP];
        for c in 0..N_COMP {
            let mut flux_jump = T::splat(0.0);
            for d in 0..DIM {
                flux_jump = flux_jump + (f_j[c][d] - f_i[c][d]) * c_ij[d];
            }
            r_i[c] = r_i[c] + T::splat(weight) * -flux_jump + d_ij_h * (u_j[c] - u_i[c]);
            u_ij_bar[c] = T::splat(0.5) * (u_i[c] + u_j[c] - flux_jump * d_ij_inv);
            u_i_new[c] = u_i_new[c] + tau_t * m_i_inv * T::splat(2.0) * d_ij * u_ij_bar[c];
        }

        for s in 0..STAGES {
            for c in 0..N_COMP {
                let mut flux_jump = T::splat(0.0);
                for d in 0..DIM {
                    flux_jump = flux_jump + (f_j_stages[s][c][d] - f_i_stages[s][c][d]) * c_ij[d];
                }
                r_i[c] = r_i[c] + T::splat(stage_weights[s]) * -flux_jump;
            }
        }

        let beta_ij = refs.betaij.get_entry::<T>(i, k);
        limiter.accumulate(js, &u_i, &u_j, &u_ij_bar, beta_ij);
    }

    write_field_batch(new_u_slab, &u_i_new);
    write_field_batch(r_slab, &r_i);

    let hd_i = m_i * T::splat(refs.measure_of_omega_inverse);
    limiter.apply_relaxation(hd_i, refs.config.limiter_relaxation_factor);
    write_field_batch(bounds_slab, &limiter.bounds());
}

/// Pass 4 for one batch: p_ij and the first l_ij.
#[allow(clippy::too_many_arguments)]
fn limiter_direction_body<T, S, const DIM: usize, const N_COMP: usize, const STAGES: usize>(
    refs: &KernelRefs<'_, S, DIM, N_COMP>,
    old_u: &MultiComponentVector<N_COMP>,
    stage_u: &[&MultiComponentVector<N_COMP>; STAGES],
    stage_weights: &[f64; STAGES],
    new_u: &MultiComponentVector<N_COMP>,
    alpha: &ScalarVector,
    r_vector: &MultiComponentVector<N_COMP>,
    bounds: &MultiComponentVector<N_BOUNDS>,
    dij_matrix: &SparseMatrixSimd<1>,
    tau: f64,
    batch: &Batch,
    pij_slab: &mut [f64],
    lij_slab: &mut [f64],
    restart_needed: &AtomicBool,
) where
    T: Lane,
    S: HyperbolicSystem<DIM, N_COMP>,
{
    let system = refs.system;
    let i = batch.first_row;
    let columns = &refs.sparsity.column_storage()[batch.entries.clone()];
    let weight = 1.0 - stage_weights.iter().sum::<f64>();

    let bounds_i = bounds.get_tensor::<T>(i);
    let m_i_inv = T::load(&refs.lumped_mass_inverse[i..]);
    let u_i_new = new_u.get_tensor::<T>(i);
    let u_i = old_u.get_tensor::<T>(i);
    let f_i = system.flux(&u_i);
    let f_i_stages: [[[T; DIM]; N_COMP]; STAGES] =
        std::array::from_fn(|s| system.flux(&stage_u[s].get_tensor::<T>(i)));

    let r_i = r_vector.get_tensor::<T>(i);
    let [alpha_i] = alpha.get_tensor::<T>(i);
    let lambda_inv = (batch.row_length - 1) as f64;
    let factor = T::splat(tau * lambda_inv) * m_i_inv;

    for k in 0..batch.row_length {
        let js = &columns[k * T::WIDTH..k * T::WIDTH + T::WIDTH];
        let u_j = old_u.get_tensor_indexed::<T>(js);

        let c_ij = refs.cij.get_tensor::<T>(i, k);
        let r_j = r_vector.get_tensor_indexed::<T>(js);

        let [alpha_j] = alpha.get_tensor_indexed::<T>(js);
        let m_j_inv = T::gather_indexed(refs.lumped_mass_inverse, js, 1, 0);

        let d_ij = dij_matrix.get_entry::<T>(i, k);
        let d_ij_h = d_ij * (alpha_i + alpha_j) * T::splat(0.5);

        let m_ij = refs.mass.get_entry::<T>(i, k);
        let delta = T::splat(if k == 0 { 1.0 } else { 0.0 });
        let b_ij = delta - m_ij * m_j_inv;
        let b_ji = delta - m_ij * m_i_inv;

        // Graph viscosity difference and mass-matrix correction.
        let mut p_ij: [T; N_COMP] = std::array::from_fn(|c| {
            (d_ij_h - d_ij) * (u_j[c] - u_i[c]) + b_ij * r_j[c] - b_ji * r_i[c]
        });

        if STAGES > 0 {
            let f_j = system.flux(&u_j);
            let f_j_stages: [[[T; DIM]; N_COMP]; STAGES] =
                std::array::from_fn(|s| system.flux(&stage_u[s].get_tensor_indexed::<T>(js)));

            for c in 0..N_COMP {
                let mut flux_sum = T::splat(0.0);
                for d in 0..DIM {
                    flux_sum = flux_sum + (f_j[c][d] + f_i[c][d]) * c_ij[d];
                }
                p_ij[c] = p_ij[c] + T::splat(weight - 1.0) * -flux_sum;
            }
            for s in 0..STAGES {
                for c in 0..N_COMP {
                    let mut flux_sum = T::splat(0.0);
                    for d in 0..DIM {
                        flux_sum = flux_sum + (f_j_stages[s][c][d] + f_i_stages[s][c][d]) * c_ij[d];
                    }
                    p_ij[c] = p_ij[c] + T::splat(stage_weights[s]) * -flux_sum;
                }
            }
        }

        for c in 0..N_COMP {
            p_ij[c] = p_ij[c] * factor;
        }
        write_batch_tensor::<T, N_COMP>(pij_slab, k, &p_ij);

        let (l_ij, success) = Limiter::<T, S, DIM, N_COMP>::limit(
            system,
            &bounds_i,
            &u_i_new,
            &p_ij,
            refs.config.limiter_newton_tolerance,
            refs.config.limiter_newton_max_iterations,
            0.0,
            1.0,
        );
        write_batch_entry::<T, 1>(lij_slab, k, 0, l_ij);

        // Unsuccessful with the current CFL, force a restart.
        if !success {
            restart_needed.store(true, Ordering::Relaxed);
        }
    }
}

/// One high-order limiter sweep for one batch.
#[allow(clippy::too_many_arguments)]
fn high_order_sweep_body<T, S, const DIM: usize, const N_COMP: usize>(
    refs: &KernelRefs<'_, S, DIM, N_COMP>,
    bounds: &MultiComponentVector<N_BOUNDS>,
    lij_matrix: &SparseMatrixSimd<1>,
    batch: &Batch,
    new_u_slab: &mut [f64],
    pij_slab: &mut [f64],
    lij_next_slab: &mut [f64],
    last_round: bool,
    restart_needed: &AtomicBool,
) where
    T: Lane,
    S: HyperbolicSystem<DIM, N_COMP>,
{
    let system = refs.system;
    let i = batch.first_row;
    let lambda = T::splat(1.0 / (batch.row_length - 1) as f64);
    let one = T::splat(1.0);

    let mut u_i_new = read_field_batch::<T, N_COMP>(new_u_slab);

    for k in 0..batch.row_length {
        let l_ij = lij_matrix
            .get_entry::<T>(i, k)
            .min(lij_matrix.get_transposed_entry::<T>(i, k));
        let p_ij = read_batch_tensor::<T, N_COMP>(pij_slab, k);
        for c in 0..N_COMP {
            u_i_new[c] = u_i_new[c] + l_ij * lambda * p_ij[c];
        }
    }

    #[cfg(debug_assertions)]
    if !system.is_admissible(&u_i_new) {
        restart_needed.store(true, Ordering::Relaxed);
    }

    write_field_batch(new_u_slab, &u_i_new);

    // The blend factors for the next sweep are not needed after the
    // last round.
    if last_round {
        return;
    }

    let bounds_i = bounds.get_tensor::<T>(i);
    for k in 0..batch.row_length {
        let old_l_ij = lij_matrix
            .get_entry::<T>(i, k)
            .min(lij_matrix.get_transposed_entry::<T>(i, k));

        let p_ij = read_batch_tensor::<T, N_COMP>(pij_slab, k);
        let new_p_ij: [T; N_COMP] = std::array::from_fn(|c| (one - old_l_ij) * p_ij[c]);

        let (new_l_ij, success) = Limiter::<T, S, DIM, N_COMP>::limit(
            system,
            &bounds_i,
            &u_i_new,
            &new_p_ij,
            refs.config.limiter_newton_tolerance,
            refs.config.limiter_newton_max_iterations,
            0.0,
            1.0,
        );
        if !success {
            restart_needed.store(true, Ordering::Relaxed);
        }

        if refs.config.limiter_iterations == 2 {
            // With exactly two sweeps the update of p_ij can be folded
            // into the stored factor: (1 - l^(1)) l^(2).
            write_batch_entry::<T, 1>(lij_next_slab, k, 0, (one - old_l_ij) * new_l_ij);
        } else {
            write_batch_entry::<T, 1>(lij_next_slab, k, 0, new_l_ij);
            write_batch_tensor::<T, N_COMP>(pij_slab, k, &new_p_ij);
        }
    }
}

/// True iff every lane's column lies strictly below its row.
#[inline(always)]
fn all_below_diagonal<T: Lane>(first_row: usize, js: &[u32]) -> bool {
    (0..T::WIDTH).all(|l| (js[l] as usize) < first_row + l)
}

/// Write one value tuple per row of a batch into its field slab.
#[inline(always)]
fn write_field_batch<T: Lane, const N: usize>(slab: &mut [f64], value: &[T; N]) {
    for (c, v) in value.iter().enumerate() {
        v.scatter_stride(slab, c, N);
    }
}

/// Read one value tuple per row of a batch from its field slab.
#[inline(always)]
fn read_field_batch<T: Lane, const N: usize>(slab: &[f64]) -> [T; N] {
    std::array::from_fn(|c| T::gather_stride(slab, c, N))
}

#[inline(always)]
fn norm_of<const DIM: usize>(v: &[f64; DIM]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Lock-free minimum of positive floats through their bit patterns.
fn atomic_min_f64(cell: &AtomicU64, value: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    while f64::from_bits(current) > value {
        match cell.compare_exchange_weak(
            current,
            value.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_min_converges_under_contention() {
        let cell = AtomicU64::new(f64::INFINITY.to_bits());
        std::thread::scope(|scope| {
            for t in 0..8 {
                let cell = &cell;
                scope.spawn(move || {
                    for k in 0..100 {
                        atomic_min_f64(cell, 1.0 + ((t * 100 + k) % 37) as f64);
                    }
                });
            }
        });
        assert_eq!(f64::from_bits(cell.load(Ordering::Relaxed)), 1.0);
    }

    #[test]
    fn below_diagonal_predicate() {
        // Scalar: single column against the row index.
        assert!(all_below_diagonal::<f64>(5, &[4]));
        assert!(!all_below_diagonal::<f64>(5, &[5]));
        // Vectorized: lane l sits on row first + l.
        assert!(all_below_diagonal::<f64x4>(4, &[0, 1, 2, 3]));
        assert!(!all_below_diagonal::<f64x4>(4, &[0, 1, 2, 7]));
    }

    #[test]
    fn config_defaults_match_documentation() {
        let config = KernelConfig::default();
        assert_eq!(config.cfl, 0.2);
        assert_eq!(config.limiter_iterations, 2);
        assert_eq!(config.limiter_newton_max_iterations, 2);
        assert!(!config.cfl_with_boundary_dofs);
    }
}
