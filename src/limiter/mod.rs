//! Convex limiter enforcing the invariant-domain bounds.
//!
//! The high-order update is blended edge by edge against pointwise
//! bounds collected from the low-order bar states: a density interval
//! `[ρ_min, ρ_max]` and a minimum principle on the surrogate specific
//! entropy. Given a base state `U` and an update direction `P`,
//! [`Limiter::limit`] returns the largest `t ∈ [t_min, t_max]` such
//! that `U + t P` respects the bounds.
//!
//! The density constraint is affine and solved in closed form. The
//! entropy constraint is the root of
//!
//! Ψ(t) = ρ^{γ+1}(U + tP) · (s(U + tP) − s_min),
//!
//! a 3-convex function of `t`, bracketed by a quadratic Newton
//! iteration from both ends.
//!
//! # References
//! - Guermond, Nazarov, Popov, Tomas (2018), "Second-order invariant
//!   domain preserving approximation of the Euler equations using
//!   convex limiting"
//! - Clayton, Guermond, Popov (2022), "Invariant domain-preserving
//!   approximations for the Euler equations with tabulated equation of
//!   state"

use crate::equations::{HyperbolicSystem, N_PRECOMPUTED_LIMITER};
use crate::field::MultiComponentVector;
use crate::simd::Lane;

/// Number of stored entries in the bounds tuple:
/// `(ρ_min, ρ_max, s_min, γ_min)`.
pub const N_BOUNDS: usize = 4;

/// Stencil-accumulated bounds for one row.
///
/// Protocol per row `i`: [`reset`](Limiter::reset), one
/// [`accumulate`](Limiter::accumulate) per neighbour, then
/// [`apply_relaxation`](Limiter::apply_relaxation) and
/// [`bounds`](Limiter::bounds).
pub struct Limiter<'a, T: Lane, S, const DIM: usize, const N_COMP: usize> {
    system: &'a S,
    precomputed: &'a MultiComponentVector<N_PRECOMPUTED_LIMITER>,
    bounds: [T; N_BOUNDS],
    rho_relaxation_numerator: T,
    rho_relaxation_denominator: T,
    s_interp_max: T,
}

impl<'a, T, S, const DIM: usize, const N_COMP: usize> Limiter<'a, T, S, DIM, N_COMP>
where
    T: Lane,
    S: HyperbolicSystem<DIM, N_COMP>,
{
    pub fn new(
        system: &'a S,
        precomputed: &'a MultiComponentVector<N_PRECOMPUTED_LIMITER>,
    ) -> Self {
        Self {
            system,
            precomputed,
            bounds: [T::splat(0.0); N_BOUNDS],
            rho_relaxation_numerator: T::splat(0.0),
            rho_relaxation_denominator: T::splat(0.0),
            s_interp_max: T::splat(0.0),
        }
    }

    /// Initialize the bounds for row `i` from the precomputed tuple
    /// `(p_i, γ_min_i, s_i, η_i)`.
    #[inline(always)]
    pub fn reset(&mut self, i: usize) {
        let [_p_i, gamma_min_i, s_i, _eta_i] = self.precomputed.get_tensor::<T>(i);

        let [rho_min, rho_max, s_min, gamma_min] = &mut self.bounds;
        *rho_min = T::splat(f64::MAX);
        *rho_max = T::splat(0.0);
        *s_min = s_i;
        *gamma_min = gamma_min_i;

        self.rho_relaxation_numerator = T::splat(0.0);
        self.rho_relaxation_denominator = T::splat(0.0);
        self.s_interp_max = T::splat(0.0);
    }

    /// Add the contribution of the edge towards neighbour `js`.
    ///
    /// `u_ij_bar` is the bar state
    /// `½ (U_i + U_j) − ½ (f_j − f_i)·c_ij / d_ij` computed by the
    /// kernel; its density and entropy seed the bounds.
    #[inline(always)]
    pub fn accumulate(
        &mut self,
        js: &[u32],
        u_i: &[T; N_COMP],
        u_j: &[T; N_COMP],
        u_ij_bar: &[T; N_COMP],
        beta_ij: T,
    ) {
        let gamma_min = self.bounds[3];

        let rho_i = self.system.density(u_i);
        let rho_j = self.system.density(u_j);
        let rho_ij_bar = self.system.density(u_ij_bar);
        let s_bar_ij = self.system.surrogate_specific_entropy(u_ij_bar, gamma_min);

        let [rho_min, rho_max, s_min, _] = &mut self.bounds;
        *rho_min = rho_min.min(rho_ij_bar);
        *rho_max = rho_max.max(rho_ij_bar);

        #[cfg(feature = "precomputed-entropy")]
        let s_j = {
            // The neighbour's own tuple carries s_j evaluated with its
            // own adiabatic exponent rather than the row's minimum.
            let tuple = self.precomputed.get_tensor_indexed::<T>(js);
            tuple[2]
        };
        #[cfg(not(feature = "precomputed-entropy"))]
        let s_j = {
            let _ = js;
            self.system.surrogate_specific_entropy(u_j, gamma_min)
        };

        *s_min = s_min.min(s_j);
        *s_min = s_min.min(s_bar_ij);

        self.rho_relaxation_numerator =
            self.rho_relaxation_numerator + beta_ij * (rho_i + rho_j);
        self.rho_relaxation_denominator = self.rho_relaxation_denominator + beta_ij;

        let mid: [T; N_COMP] = std::array::from_fn(|c| T::splat(0.5) * (u_i[c] + u_j[c]));
        let s_interp = self.system.surrogate_specific_entropy(&mid, gamma_min);
        self.s_interp_max = self.s_interp_max.max(s_interp);
    }

    /// Widen the bounds by a mesh-size dependent amount
    /// `r_i = factor · hd_i^{1.5/d}` and apply the covolume cap on
    /// `ρ_max`.
    #[inline(always)]
    pub fn apply_relaxation(&mut self, hd_i: T, factor: f64) {
        let mut r_i = hd_i.sqrt();
        if DIM == 2 {
            let root = r_i.sqrt();
            r_i = root * root * root;
        } else if DIM == 1 {
            r_i = r_i * r_i * r_i;
        }
        r_i = r_i * T::splat(factor);

        let eps = T::splat(f64::EPSILON);
        let rho_relaxation = self.rho_relaxation_numerator.abs()
            / (self.rho_relaxation_denominator.abs() + eps);

        let one = T::splat(1.0);
        let [rho_min, rho_max, s_min, gamma_min] = &mut self.bounds;

        *rho_min = ((one - r_i) * *rho_min).max(*rho_min - rho_relaxation);
        *s_min = ((one - r_i) * *s_min).max(T::splat(2.0) * *s_min - self.s_interp_max);
        *rho_max = ((one + r_i) * *rho_max).min(*rho_max + rho_relaxation);

        // Covolume cap on the maximum density.
        let interpolation_b = T::splat(self.system.eos_interpolation_b());
        let numerator = (*gamma_min + one) * *rho_max;
        let denominator = *gamma_min - one + T::splat(2.0) * interpolation_b * *rho_max;
        *rho_max = rho_max.min(numerator / denominator);
    }

    /// The accumulated bounds `(ρ_min, ρ_max, s_min, γ_min)`.
    #[inline(always)]
    pub fn bounds(&self) -> [T; N_BOUNDS] {
        self.bounds
    }

    /// Largest `t ∈ [t_min, t_max]` such that `U + t P` respects
    /// `bounds`, together with a success flag.
    ///
    /// `success` is false iff the bounds cannot be initialised at the
    /// left endpoint — the caller's state already violates them beyond
    /// round-off, signalling that the step must be restarted with a
    /// smaller time-step size.
    #[allow(clippy::too_many_arguments)]
    pub fn limit(
        system: &S,
        bounds: &[T; N_BOUNDS],
        u: &[T; N_COMP],
        p: &[T; N_COMP],
        newton_tolerance: f64,
        newton_max_iter: usize,
        t_min: f64,
        t_max: f64,
    ) -> (T, bool) {
        let [rho_min, rho_max, s_min, gamma_min] = *bounds;
        let zero = T::splat(0.0);
        let one = T::splat(1.0);

        let rho_u = system.density(u);
        let rho_p = system.density(p);

        // Closed-form bracket from the affine density constraint.
        let small = T::splat(f64::EPSILON) * rho_max;
        let denominator = T::select(rho_p.abs().le(small), one, rho_p);
        let t_upper = (rho_max - rho_u) / denominator;
        let t_lower = (rho_min - rho_u) / denominator;
        let t_density = T::select(
            small.lt(rho_p),
            t_upper,
            T::select(rho_p.lt(-small), t_lower, T::splat(t_max)),
        );

        let t_min = T::splat(t_min);
        let mut t_l = t_min;
        let mut t_r = T::splat(t_max).min(t_density).max(t_min);

        let psi = PsiFunction::new(system, u, p, s_min, gamma_min);

        // Left endpoint must be admissible for the bracket to exist.
        let (psi_left, _) = psi.eval(t_l);
        let slack = T::splat(128.0 * f64::EPSILON);
        let rho_left = rho_u + t_l * rho_p;
        let feasible = psi_left.ge(-slack * psi.scale())
            & rho_left.ge(rho_min * (one - slack))
            & rho_left.le(rho_max * (one + slack));
        let success = T::mask_all(feasible);

        let (psi_right, _) = psi.eval(t_r);
        let entropy_satisfied = psi_right.ge(zero);
        if T::mask_all(entropy_satisfied) {
            return (t_r, success);
        }

        // Quadratic Newton from both ends, keeping Ψ(t_l) ≥ 0 ≥ Ψ(t_r).
        let tolerance = T::splat(newton_tolerance);
        for _ in 0..newton_max_iter {
            if T::mask_all((t_r - t_l).lt(tolerance)) {
                break;
            }
            let (psi_l, dpsi_l) = psi.eval(t_l);
            let (psi_r, dpsi_r) = psi.eval(t_r);

            let scaling = one / (t_r - t_l + T::splat(f64::EPSILON));
            let dd_12 = (psi_r - psi_l) * scaling;
            let dd_112 = (dd_12 - dpsi_l) * scaling;
            let dd_122 = (dpsi_r - dd_12) * scaling;

            let four = T::splat(4.0);
            let disc_l = (dpsi_l * dpsi_l - four * psi_l * dd_112).abs();
            let disc_r = (dpsi_r * dpsi_r - four * psi_r * dd_122).abs();

            let two = T::splat(2.0);
            let cand_1 = t_l + two * psi_l / (disc_l.sqrt() - dpsi_l + T::splat(f64::MIN_POSITIVE));
            let cand_2 = t_r + two * psi_r / (disc_r.sqrt() - dpsi_r + T::splat(f64::MIN_POSITIVE));

            let new_l = cand_1.min(cand_2).max(t_l).min(t_r);
            let new_r = cand_1.max(cand_2).min(t_r).max(new_l);

            // Keep the bracket invariant: only move an endpoint if the
            // sign of Ψ there still matches its side.
            let (psi_new_l, _) = psi.eval(new_l);
            t_l = T::select(psi_new_l.ge(zero), new_l, t_l);
            let (psi_new_r, _) = psi.eval(new_r);
            t_r = T::select(psi_new_r.le(zero), new_r, t_r);
        }

        // Lanes whose full step already satisfied the entropy bound take
        // it; all others take the left (guaranteed) end of the bracket.
        let t = T::select(entropy_satisfied, t_r, t_l).max(t_min);
        (t, success)
    }
}

/// Ψ(t) = ρ^{γ+1}(U + tP) (s(U + tP) − s_min) and its derivative,
/// expressed through the affine component paths
/// ρ(t), m(t), E(t).
///
/// With the entropy surrogate s = ρe (1/ρ − b)^γ this is
/// Ψ(t) = (ρ² e)(t) (1 − bρ(t))^γ − s_min ρ(t)^{γ+1},
/// where (ρ² e)(t) = ρ(t) E(t) − ½|m(t)|² is a plain quadratic.
struct PsiFunction<T: Lane, const DIM: usize> {
    rho_u: T,
    rho_p: T,
    energy_u: T,
    energy_p: T,
    m_u: [T; DIM],
    m_p: [T; DIM],
    s_min: T,
    gamma_min: T,
    covolume: f64,
    scale: T,
}

impl<T: Lane, const DIM: usize> PsiFunction<T, DIM> {
    fn new<S, const N_COMP: usize>(
        system: &S,
        u: &[T; N_COMP],
        p: &[T; N_COMP],
        s_min: T,
        gamma_min: T,
    ) -> Self
    where
        S: HyperbolicSystem<DIM, N_COMP>,
    {
        let rho_u = system.density(u);
        let q_u = rho_u * system.internal_energy(u);
        let scale = q_u.abs() + (s_min * rho_u.pow(gamma_min + T::splat(1.0))).abs();
        Self {
            rho_u,
            rho_p: system.density(p),
            energy_u: system.total_energy(u),
            energy_p: system.total_energy(p),
            m_u: system.momentum(u),
            m_p: system.momentum(p),
            s_min,
            gamma_min,
            covolume: system.eos_interpolation_b(),
            scale,
        }
    }

    /// Magnitude of Ψ at the base state, for relative tolerances.
    fn scale(&self) -> T {
        self.scale
    }

    /// Value and derivative of Ψ at `t`.
    #[inline(always)]
    fn eval(&self, t: T) -> (T, T) {
        let rho = self.rho_u + t * self.rho_p;
        let energy = self.energy_u + t * self.energy_p;

        let mut m2 = T::splat(0.0);
        let mut m_dot_mp = T::splat(0.0);
        for d in 0..DIM {
            let m_d = self.m_u[d] + t * self.m_p[d];
            m2 = m2 + m_d * m_d;
            m_dot_mp = m_dot_mp + m_d * self.m_p[d];
        }

        let half = T::splat(0.5);
        let q = rho * energy - half * m2;
        let dq = self.rho_p * energy + rho * self.energy_p - m_dot_mp;

        let one = T::splat(1.0);
        let rho_pow_gamma = rho.pow(self.gamma_min);
        let barrier = self.s_min * rho * rho_pow_gamma;
        let dbarrier = self.s_min * (self.gamma_min + one) * rho_pow_gamma * self.rho_p;

        if self.covolume == 0.0 {
            (q - barrier, dq - dbarrier)
        } else {
            let b = T::splat(self.covolume);
            let covolume_term = one - b * rho;
            let w = covolume_term.pow(self.gamma_min);
            let dw = -self.gamma_min * covolume_term.pow(self.gamma_min - one) * b * self.rho_p;
            (q * w - barrier, dq * w + q * dw - dbarrier)
        }
    }
}
