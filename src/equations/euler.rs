//! Compressible Euler equations with an ideal-gas equation of state.

use crate::simd::Lane;

use super::{Boundary, HyperbolicSystem, N_PRECOMPUTED_INDICATOR, N_PRECOMPUTED_LIMITER};

/// The compressible Euler equations for a polytropic ideal gas, with an
/// optional covolume constant b that tightens the upper density bound of
/// the limiter.
///
/// The state is `[ρ, m_1, …, m_d, E]`; one instantiation per spatial
/// dimension ([`Euler1D`], [`Euler2D`]).
#[derive(Clone, Debug)]
pub struct Euler {
    gamma: f64,
    covolume_b: f64,
}

/// Shorthand for the 1D instantiation (`N_COMP = 3`).
pub type Euler1D = Euler;

/// Shorthand for the 2D instantiation (`N_COMP = 4`).
pub type Euler2D = Euler;

impl Euler {
    /// Ideal gas with ratio of specific heats `gamma`.
    pub fn new(gamma: f64) -> Self {
        assert!(gamma > 1.0, "need gamma > 1");
        Self {
            gamma,
            covolume_b: 0.0,
        }
    }

    /// Ideal gas with a covolume constant for the density cap.
    pub fn with_covolume(gamma: f64, covolume_b: f64) -> Self {
        assert!(covolume_b >= 0.0);
        Self {
            gamma,
            covolume_b,
        }
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    #[inline(always)]
    fn internal_energy_impl<T: Lane, const N: usize>(u: &[T; N]) -> T {
        let rho_inverse = T::splat(1.0) / u[0];
        let mut m2 = T::splat(0.0);
        for d in 1..N - 1 {
            m2 = m2 + u[d] * u[d];
        }
        u[N - 1] - T::splat(0.5) * m2 * rho_inverse
    }

    #[inline(always)]
    fn pressure_impl<T: Lane, const N: usize>(&self, u: &[T; N]) -> T {
        T::splat(self.gamma - 1.0) * Self::internal_energy_impl(u)
    }

    #[inline(always)]
    fn flux_impl<T: Lane, const DIM: usize, const N: usize>(&self, u: &[T; N]) -> [[T; DIM]; N] {
        let rho_inverse = T::splat(1.0) / u[0];
        let p = self.pressure_impl(u);
        let mut f = [[T::splat(0.0); DIM]; N];
        for d in 0..DIM {
            let v_d = u[1 + d] * rho_inverse;
            f[0][d] = u[1 + d];
            for j in 0..DIM {
                f[1 + j][d] = u[1 + j] * v_d;
            }
            f[1 + d][d] = f[1 + d][d] + p;
            f[N - 1][d] = v_d * (u[N - 1] + p);
        }
        f
    }

    /// s(U, γ) = ρe · (1/ρ − b)^γ. For b = 0 this reduces to
    /// e ρ^{1−γ}, the classical surrogate for p/ρ^γ.
    #[inline(always)]
    fn surrogate_impl<T: Lane, const N: usize>(&self, u: &[T; N], gamma_min: T) -> T {
        let rho_inverse = T::splat(1.0) / u[0];
        let covolume = rho_inverse - T::splat(self.covolume_b);
        Self::internal_energy_impl(u) * covolume.pow(gamma_min)
    }

    #[inline(always)]
    fn harten_impl<T: Lane, const N: usize>(&self, u: &[T; N]) -> T {
        // ρ² e = ρ E − |m|²/2 is a polynomial in the state.
        let rho_e_rho = u[0] * Self::internal_energy_impl(u);
        rho_e_rho.powf(1.0 / (self.gamma + 1.0))
    }

    #[inline(always)]
    fn harten_derivative_impl<T: Lane, const N: usize>(&self, u: &[T; N]) -> [T; N] {
        let rho_e_rho = u[0] * Self::internal_energy_impl(u);
        let factor = T::splat(1.0 / (self.gamma + 1.0))
            * rho_e_rho.powf(-self.gamma / (self.gamma + 1.0));
        let mut d = [T::splat(0.0); N];
        d[0] = factor * u[N - 1];
        for j in 1..N - 1 {
            d[j] = -factor * u[j];
        }
        d[N - 1] = factor * u[0];
        d
    }

    #[inline(always)]
    fn is_admissible_impl<T: Lane, const N: usize>(u: &[T; N]) -> bool {
        let zero = T::splat(0.0);
        let positive = T::lt(zero, u[0]) & T::lt(zero, Self::internal_energy_impl(u));
        T::mask_all(positive)
    }

    fn boundary_impl<const DIM: usize, const N: usize>(
        &self,
        id: Boundary,
        mut u: [f64; N],
        normal: &[f64; DIM],
        dirichlet: impl FnOnce() -> [f64; N],
    ) -> [f64; N] {
        match id {
            Boundary::DoNothing => u,
            Boundary::Slip => {
                let mut vn = 0.0;
                for d in 0..DIM {
                    vn += u[1 + d] * normal[d];
                }
                for d in 0..DIM {
                    u[1 + d] -= vn * normal[d];
                }
                u
            }
            Boundary::NoSlip => {
                for d in 0..DIM {
                    u[1 + d] = 0.0;
                }
                u
            }
            Boundary::Dirichlet => dirichlet(),
            Boundary::Dynamic => {
                let mut vn = 0.0;
                for d in 0..DIM {
                    vn += u[1 + d] * normal[d];
                }
                vn /= u[0];
                // Inflow gets the prescribed state, outflow is left alone.
                if vn < 0.0 {
                    dirichlet()
                } else {
                    u
                }
            }
        }
    }
}

/// Instantiate [`HyperbolicSystem`] for one spatial dimension.
macro_rules! impl_euler_system {
    ($dim:literal, $n_comp:literal) => {
        impl HyperbolicSystem<$dim, $n_comp> for Euler {
            #[inline(always)]
            fn density<T: Lane>(&self, u: &[T; $n_comp]) -> T {
                u[0]
            }

            #[inline(always)]
            fn momentum<T: Lane>(&self, u: &[T; $n_comp]) -> [T; $dim] {
                std::array::from_fn(|d| u[1 + d])
            }

            #[inline(always)]
            fn total_energy<T: Lane>(&self, u: &[T; $n_comp]) -> T {
                u[$n_comp - 1]
            }

            #[inline(always)]
            fn internal_energy<T: Lane>(&self, u: &[T; $n_comp]) -> T {
                Self::internal_energy_impl(u)
            }

            #[inline(always)]
            fn pressure<T: Lane>(&self, u: &[T; $n_comp]) -> T {
                self.pressure_impl(u)
            }

            #[inline(always)]
            fn speed_of_sound<T: Lane>(&self, u: &[T; $n_comp]) -> T {
                (T::splat(self.gamma) * self.pressure_impl(u) / u[0]).sqrt()
            }

            #[inline(always)]
            fn flux<T: Lane>(&self, u: &[T; $n_comp]) -> [[T; $dim]; $n_comp] {
                self.flux_impl(u)
            }

            #[inline(always)]
            fn surrogate_specific_entropy<T: Lane>(&self, u: &[T; $n_comp], gamma_min: T) -> T {
                self.surrogate_impl(u, gamma_min)
            }

            #[inline(always)]
            fn harten_entropy<T: Lane>(&self, u: &[T; $n_comp]) -> T {
                self.harten_impl(u)
            }

            #[inline(always)]
            fn harten_entropy_derivative<T: Lane>(&self, u: &[T; $n_comp]) -> [T; $n_comp] {
                self.harten_derivative_impl(u)
            }

            #[inline(always)]
            fn is_admissible<T: Lane>(&self, u: &[T; $n_comp]) -> bool {
                Self::is_admissible_impl(u)
            }

            fn adiabatic_exponent(&self) -> f64 {
                self.gamma
            }

            fn eos_interpolation_b(&self) -> f64 {
                self.covolume_b
            }

            #[inline(always)]
            fn precompute_values_indicator<T: Lane>(
                &self,
                u: &[T; $n_comp],
            ) -> [T; N_PRECOMPUTED_INDICATOR] {
                [self.harten_impl(u)]
            }

            #[inline(always)]
            fn precompute_values_limiter<T: Lane>(
                &self,
                u: &[T; $n_comp],
            ) -> [T; N_PRECOMPUTED_LIMITER] {
                let gamma_min = T::splat(self.gamma);
                [
                    self.pressure_impl(u),
                    gamma_min,
                    self.surrogate_impl(u, gamma_min),
                    self.harten_impl(u),
                ]
            }

            fn apply_boundary_conditions(
                &self,
                id: Boundary,
                u: [f64; $n_comp],
                normal: &[f64; $dim],
                dirichlet: impl FnOnce() -> [f64; $n_comp],
            ) -> [f64; $n_comp] {
                self.boundary_impl(id, u, normal, dirichlet)
            }
        }
    };
}

impl_euler_system!(1, 3);
impl_euler_system!(2, 4);
