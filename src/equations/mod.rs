//! Hyperbolic system models.
//!
//! Provides a trait-based interface for first-order conservation laws
//!
//! ∂u/∂t + div f(u) = 0
//!
//! where u is the conserved state and f the flux. The kernel is generic
//! over this trait with static dispatch: one concrete model per
//! instantiation, so the hot loops inline through the model.
//!
//! Every capability is a pure function over states and exists for both
//! loop instantiations via the [`Lane`] parameter.

mod euler;

pub use euler::{Euler, Euler1D, Euler2D};

use crate::simd::Lane;

/// Components of the per-DOF indicator precompute tuple.
pub const N_PRECOMPUTED_INDICATOR: usize = 1;

/// Components of the per-DOF limiter precompute tuple:
/// `(p_i, γ_min_i, s_i, η_i)`.
pub const N_PRECOMPUTED_LIMITER: usize = 4;

/// Boundary condition selector attached to boundary DOFs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Boundary {
    /// Leave the state untouched.
    DoNothing,
    /// Reflect the momentum through the boundary normal.
    Slip,
    /// Zero the momentum.
    NoSlip,
    /// Replace the state with prescribed data.
    Dirichlet,
    /// Prescribe data on inflow, leave outflow untouched.
    Dynamic,
}

/// A hyperbolic system of `N_COMP` conserved quantities in `DIM` space
/// dimensions.
///
/// For the compressible Euler equations the state is
/// `[ρ, m_1, …, m_DIM, E]` and `N_COMP = DIM + 2`.
pub trait HyperbolicSystem<const DIM: usize, const N_COMP: usize>:
    Clone + Send + Sync + 'static
{
    /// Density ρ.
    fn density<T: Lane>(&self, u: &[T; N_COMP]) -> T;

    /// Momentum vector m.
    fn momentum<T: Lane>(&self, u: &[T; N_COMP]) -> [T; DIM];

    /// Total energy E.
    fn total_energy<T: Lane>(&self, u: &[T; N_COMP]) -> T;

    /// Internal energy ρe = E − |m|²/(2ρ).
    fn internal_energy<T: Lane>(&self, u: &[T; N_COMP]) -> T;

    /// Thermodynamic pressure.
    fn pressure<T: Lane>(&self, u: &[T; N_COMP]) -> T;

    /// Speed of sound.
    fn speed_of_sound<T: Lane>(&self, u: &[T; N_COMP]) -> T;

    /// Flux tensor f(u), shape `N_COMP × DIM`.
    fn flux<T: Lane>(&self, u: &[T; N_COMP]) -> [[T; DIM]; N_COMP];

    /// Entropy surrogate obeying a pointwise minimum principle, evaluated
    /// with the exponent `gamma_min`.
    fn surrogate_specific_entropy<T: Lane>(&self, u: &[T; N_COMP], gamma_min: T) -> T;

    /// Harten-type entropy `(ρ² e)^{1/(γ+1)}`.
    fn harten_entropy<T: Lane>(&self, u: &[T; N_COMP]) -> T;

    /// Derivative of the Harten entropy with respect to the state.
    fn harten_entropy_derivative<T: Lane>(&self, u: &[T; N_COMP]) -> [T; N_COMP];

    /// Whether every lane of `u` has positive density and positive
    /// internal energy.
    fn is_admissible<T: Lane>(&self, u: &[T; N_COMP]) -> bool;

    /// Ratio of specific heats γ.
    fn adiabatic_exponent(&self) -> f64;

    /// Covolume constant b of the equation-of-state interpolation; feeds
    /// the upper density cap of the limiter bounds.
    fn eos_interpolation_b(&self) -> f64;

    /// Per-DOF values precomputed for the smoothness indicator.
    fn precompute_values_indicator<T: Lane>(
        &self,
        u: &[T; N_COMP],
    ) -> [T; N_PRECOMPUTED_INDICATOR];

    /// Per-DOF values precomputed for the limiter:
    /// `(p_i, γ_min_i, s_i, η_i)`.
    fn precompute_values_limiter<T: Lane>(&self, u: &[T; N_COMP]) -> [T; N_PRECOMPUTED_LIMITER];

    /// Return the boundary-corrected state for a boundary DOF.
    ///
    /// `dirichlet` produces the prescribed data lazily; it is only
    /// invoked for the boundary ids that need it.
    fn apply_boundary_conditions(
        &self,
        id: Boundary,
        u: [f64; N_COMP],
        normal: &[f64; DIM],
        dirichlet: impl FnOnce() -> [f64; N_COMP],
    ) -> [f64; N_COMP];
}
