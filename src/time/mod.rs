//! Explicit Runge-Kutta composition of the hyperbolic kernel.
//!
//! The kernel performs one invariant-domain-preserving forward-Euler
//! update; higher-order time accuracy comes from composing such updates
//! into strong-stability-preserving and explicit Runge-Kutta schemes.
//! The ERK schemes use the kernel's stage-correction machinery: each
//! substep advances from the latest stage with weighted flux
//! contributions of the earlier ones, keeping every substep inside the
//! invariant domain.
//!
//! The integrator also owns the CFL recovery policy: under bang-bang
//! control a step that reports an invariant-domain violation is rolled
//! back and repeated once with the minimal CFL number.

use log::warn;

use crate::comm::Communicator;
use crate::equations::HyperbolicSystem;
use crate::field::MultiComponentVector;
use crate::kernel::{HyperbolicKernel, IdViolationStrategy, Restart};

/// Time-stepping scheme selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeSteppingScheme {
    /// Strong-stability-preserving RK(3,3; 1/3), the default.
    SspRk33,
    /// Explicit RK(3,3; 1) with stage corrections.
    Erk33,
    /// Explicit RK(4,3; 1) with stage corrections.
    Erk43,
}

/// Invariant-domain / CFL recovery policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CflRecoveryStrategy {
    /// Step with `cfl_max`; violations surface as [`Restart`] or a
    /// kernel warning depending on the kernel's strategy.
    None,
    /// Step with `cfl_max`; on a violation repeat the step once with
    /// `cfl_min`.
    BangBang,
}

/// Runtime options of the time integrator.
#[derive(Clone, Debug)]
pub struct TimeConfig {
    /// CFL number used when recovering from a violation.
    pub cfl_min: f64,
    /// CFL number used for regular steps.
    pub cfl_max: f64,
    pub scheme: TimeSteppingScheme,
    pub recovery: CflRecoveryStrategy,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            cfl_min: 0.45,
            cfl_max: 0.90,
            scheme: TimeSteppingScheme::SspRk33,
            recovery: CflRecoveryStrategy::None,
        }
    }
}

impl TimeConfig {
    pub fn with_scheme(mut self, scheme: TimeSteppingScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_recovery(mut self, recovery: CflRecoveryStrategy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_cfl(mut self, cfl_min: f64, cfl_max: f64) -> Self {
        self.cfl_min = cfl_min;
        self.cfl_max = cfl_max;
        self
    }
}

/// Drives the hyperbolic kernel through full Runge-Kutta steps.
pub struct TimeIntegrator<'a, 'k, S, C, const DIM: usize, const N_COMP: usize>
where
    S: HyperbolicSystem<DIM, N_COMP>,
    C: Communicator,
{
    kernel: &'k mut HyperbolicKernel<'a, S, C, DIM, N_COMP>,
    config: TimeConfig,
    temp: Vec<MultiComponentVector<N_COMP>>,
}

impl<'a, 'k, S, C, const DIM: usize, const N_COMP: usize>
    TimeIntegrator<'a, 'k, S, C, DIM, N_COMP>
where
    S: HyperbolicSystem<DIM, N_COMP>,
    C: Communicator,
{
    pub fn new(
        kernel: &'k mut HyperbolicKernel<'a, S, C, DIM, N_COMP>,
        config: TimeConfig,
    ) -> Self {
        Self {
            kernel,
            config,
            temp: Vec::new(),
        }
    }

    pub fn config(&self) -> &TimeConfig {
        &self.config
    }

    /// Allocate the stage storage. Idempotent; called implicitly by the
    /// first [`step`](Self::step).
    pub fn prepare(&mut self, template: &MultiComponentVector<N_COMP>) {
        let n_temp = match self.config.scheme {
            TimeSteppingScheme::SspRk33 => 2,
            TimeSteppingScheme::Erk33 => 3,
            TimeSteppingScheme::Erk43 => 4,
        };
        while self.temp.len() < n_temp {
            self.temp.push(template.clone());
        }
        self.kernel.prepare();
    }

    /// Advance `u` from time `t` by one full Runge-Kutta step and
    /// return the step size taken.
    ///
    /// Under bang-bang recovery an invariant-domain violation rolls the
    /// step back and retries once with `cfl_min`; a second violation
    /// propagates the [`Restart`]. `u` is untouched by a failed step.
    pub fn step(&mut self, u: &mut MultiComponentVector<N_COMP>, t: f64) -> Result<f64, Restart> {
        self.prepare(u);

        match self.config.recovery {
            CflRecoveryStrategy::None => {
                self.kernel.config_mut().cfl = self.config.cfl_max;
                self.single_step(u, t)
            }
            CflRecoveryStrategy::BangBang => {
                self.kernel.config_mut().cfl = self.config.cfl_max;
                self.kernel
                    .set_id_violation_strategy(IdViolationStrategy::RaiseException);
                match self.single_step(u, t) {
                    Ok(tau) => Ok(tau),
                    Err(Restart) => {
                        warn!(
                            "invariant domain violation at t = {}, retrying with cfl = {}",
                            t, self.config.cfl_min
                        );
                        self.kernel.config_mut().cfl = self.config.cfl_min;
                        let result = self.single_step(u, t);
                        self.kernel.config_mut().cfl = self.config.cfl_max;
                        result
                    }
                }
            }
        }
    }

    fn single_step(&mut self, u: &mut MultiComponentVector<N_COMP>, t: f64) -> Result<f64, Restart> {
        match self.config.scheme {
            TimeSteppingScheme::SspRk33 => self.step_ssprk_33(u, t),
            TimeSteppingScheme::Erk33 => self.step_erk_33(u, t),
            TimeSteppingScheme::Erk43 => self.step_erk_43(u, t),
        }
    }

    /// SSPRK(3,3): three forward-Euler updates combined by convex
    /// averaging, each followed by the boundary conditions at its stage
    /// time.
    fn step_ssprk_33(&mut self, u: &mut MultiComponentVector<N_COMP>, t: f64) -> Result<f64, Restart> {
        let kernel = &mut *self.kernel;
        let (stage0, rest) = self.temp.split_at_mut(1);
        let stage0 = &mut stage0[0];
        let stage1 = &mut rest[0];

        let tau = kernel.step::<0>(u, [], [], stage0, 0.0)?;
        kernel.apply_boundary_conditions(stage0, t + tau);

        kernel.step::<0>(stage0, [], [], stage1, tau)?;
        stage1.sadd(0.25, 0.75, u);
        kernel.apply_boundary_conditions(stage1, t + 0.5 * tau);

        kernel.step::<0>(stage1, [], [], stage0, tau)?;
        stage0.sadd(2.0 / 3.0, 1.0 / 3.0, u);
        kernel.apply_boundary_conditions(stage0, t + tau);

        u.copy_from(stage0);
        Ok(tau)
    }

    /// ERK(3,3; 1): three substeps of size τ with stage-corrected
    /// fluxes; the full step covers 3τ.
    fn step_erk_33(&mut self, u: &mut MultiComponentVector<N_COMP>, t: f64) -> Result<f64, Restart> {
        let kernel = &mut *self.kernel;
        let (stage0, rest) = self.temp.split_at_mut(1);
        let stage0 = &mut stage0[0];
        let (stage1, rest) = rest.split_at_mut(1);
        let stage1 = &mut stage1[0];
        let stage2 = &mut rest[0];

        let tau = kernel.step::<0>(u, [], [], stage0, 0.0)?;
        kernel.apply_boundary_conditions(stage0, t + tau);

        kernel.step::<1>(stage0, [u], [-1.0], stage1, tau)?;
        kernel.apply_boundary_conditions(stage1, t + 2.0 * tau);

        kernel.step::<2>(stage1, [u, stage0], [0.75, -2.0], stage2, tau)?;
        kernel.apply_boundary_conditions(stage2, t + 3.0 * tau);

        u.copy_from(stage2);
        Ok(3.0 * tau)
    }

    /// ERK(4,3; 1): four substeps of size τ with stage-corrected
    /// fluxes; the full step covers 4τ.
    fn step_erk_43(&mut self, u: &mut MultiComponentVector<N_COMP>, t: f64) -> Result<f64, Restart> {
        let kernel = &mut *self.kernel;
        let (stage0, rest) = self.temp.split_at_mut(1);
        let stage0 = &mut stage0[0];
        let (stage1, rest) = rest.split_at_mut(1);
        let stage1 = &mut stage1[0];
        let (stage2, rest) = rest.split_at_mut(1);
        let stage2 = &mut stage2[0];
        let stage3 = &mut rest[0];

        let tau = kernel.step::<0>(u, [], [], stage0, 0.0)?;
        kernel.apply_boundary_conditions(stage0, t + tau);

        kernel.step::<1>(stage0, [u], [-1.0], stage1, tau)?;
        kernel.apply_boundary_conditions(stage1, t + 2.0 * tau);

        kernel.step::<1>(stage1, [stage0], [-1.0], stage2, tau)?;
        kernel.apply_boundary_conditions(stage2, t + 3.0 * tau);

        kernel.step::<2>(stage2, [stage0, stage1], [5.0 / 3.0, -10.0 / 3.0], stage3, tau)?;
        kernel.apply_boundary_conditions(stage3, t + 4.0 * tau);

        u.copy_from(stage3);
        Ok(4.0 * tau)
    }
}
