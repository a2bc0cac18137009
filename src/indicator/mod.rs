//! Per-DOF smoothness indicator.
//!
//! An entropy-viscosity commutator: for every DOF the accumulated
//! residual between the divergence of the entropy flux and the entropy
//! derivative contracted with the divergence of the flux, normalized by
//! the sum of the magnitudes of both terms. The result `α_i ∈ [0, 1]`
//! is at round-off level where the solution is smooth and close to one
//! at shocks; it modulates the high-order graph viscosity as
//! `d_ij^H = ½ (α_i + α_j) d_ij`.
//!
//! The Harten entropy of every DOF is precomputed once per time step
//! (pass 0) and read back here; everything else is evaluated on the fly
//! from the neighbour state.

use crate::equations::{HyperbolicSystem, N_PRECOMPUTED_INDICATOR};
use crate::field::MultiComponentVector;
use crate::simd::Lane;

/// Stencil-accumulated entropy commutator for one row.
///
/// Intended usage, once per row:
/// ```text
/// indicator.reset(U_i);
/// for j in stencil(i) {
///     indicator.add(js, &U_j, &c_ij);
/// }
/// let alpha_i = indicator.alpha();
/// ```
pub struct Indicator<'a, T: Lane, S, const DIM: usize, const N_COMP: usize> {
    system: &'a S,
    precomputed: &'a MultiComponentVector<N_PRECOMPUTED_INDICATOR>,
    eta_derivative_i: [T; N_COMP],
    numerator: T,
    denominator: T,
}

impl<'a, T, S, const DIM: usize, const N_COMP: usize> Indicator<'a, T, S, DIM, N_COMP>
where
    T: Lane,
    S: HyperbolicSystem<DIM, N_COMP>,
{
    pub fn new(
        system: &'a S,
        precomputed: &'a MultiComponentVector<N_PRECOMPUTED_INDICATOR>,
    ) -> Self {
        Self {
            system,
            precomputed,
            eta_derivative_i: [T::splat(0.0); N_COMP],
            numerator: T::splat(0.0),
            denominator: T::splat(0.0),
        }
    }

    /// Start accumulation for a new row with state `u_i`.
    #[inline(always)]
    pub fn reset(&mut self, u_i: &[T; N_COMP]) {
        self.eta_derivative_i = self.system.harten_entropy_derivative(u_i);
        self.numerator = T::splat(0.0);
        self.denominator = T::splat(0.0);
    }

    /// Add the contribution of neighbour `js` with state `u_j` and
    /// stencil coefficient `c_ij`.
    #[inline(always)]
    pub fn add(&mut self, js: &[u32], u_j: &[T; N_COMP], c_ij: &[T; DIM]) {
        let [eta_j] = self.precomputed.get_tensor_indexed::<T>(js);

        let rho_j_inverse = T::splat(1.0) / self.system.density(u_j);
        let m_j = self.system.momentum(u_j);
        let f_j = self.system.flux(u_j);

        // Entropy flux through c_ij: (η_j / ρ_j) m_j · c_ij.
        let mut entropy_flux = T::splat(0.0);
        for d in 0..DIM {
            entropy_flux = entropy_flux + m_j[d] * c_ij[d];
        }
        entropy_flux = entropy_flux * eta_j * rho_j_inverse;

        // η'(U_i) contracted with f(U_j) · c_ij.
        let mut commuted = T::splat(0.0);
        for k in 0..N_COMP {
            let mut f_c = T::splat(0.0);
            for d in 0..DIM {
                f_c = f_c + f_j[k][d] * c_ij[d];
            }
            commuted = commuted + self.eta_derivative_i[k] * f_c;
        }

        self.numerator = self.numerator + (entropy_flux - commuted);
        self.denominator = self.denominator + entropy_flux.abs() + commuted.abs();
    }

    /// The accumulated indicator value, clamped to `[0, 1]`.
    #[inline(always)]
    pub fn alpha(&self) -> T {
        let eps = T::splat(f64::MIN_POSITIVE);
        let ratio = self.numerator.abs() / (self.denominator + eps);
        ratio.min(T::splat(1.0))
    }
}
