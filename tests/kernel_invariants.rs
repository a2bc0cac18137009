//! Property tests of the hyperbolic update kernel.
//!
//! Verifies the structural invariants of the pass structure on exact
//! P1 line-mesh data: viscosity symmetry and zero row sums, discrete
//! conservation on a periodic mesh, the invariant-domain property of
//! the low-order update, bound enforcement of the limited high-order
//! update, and the equivalence of the scalar and vectorized loop
//! instantiations.

use cg_rs::offline::line::{periodic_line_mesh, periodic_line_mesh_scalar};
use cg_rs::{
    Euler1D, HyperbolicKernel, HyperbolicSystem, KernelConfig, MultiComponentVector,
    NullCommunicator, OfflineData,
};

fn state(rho: f64, u: f64, p: f64) -> [f64; 3] {
    [rho, rho * u, p / 0.4 + 0.5 * rho * u * u]
}

/// A smooth periodic field with nontrivial dynamics.
fn smooth_state(x: f64) -> [f64; 3] {
    state(1.0 + 0.2 * x.sin(), 0.3 * x.cos(), 1.0 + 0.1 * (2.0 * x).sin())
}

/// A Riemann-problem field with a strong jump.
fn jump_state(x: f64) -> [f64; 3] {
    if x < std::f64::consts::PI {
        state(1.0, 0.0, 1.0)
    } else {
        state(0.125, 0.0, 0.1)
    }
}

fn initialize(
    offline: &OfflineData<1>,
    positions: &[f64],
    f: impl Fn(f64) -> [f64; 3],
) -> MultiComponentVector<3> {
    let mut u = MultiComponentVector::<3>::new(offline.partitioner.clone());
    for (i, &x) in positions.iter().enumerate() {
        u.write_tensor(&f(x), i);
    }
    u
}

fn step_once(
    offline: &OfflineData<1>,
    u: &MultiComponentVector<3>,
    config: KernelConfig,
    tau: f64,
) -> (MultiComponentVector<3>, f64, Vec<[f64; 4]>, SparsityProbe) {
    let euler = Euler1D::new(1.4);
    let comm = NullCommunicator;
    let mut kernel =
        HyperbolicKernel::new(&euler, offline, &comm, |_, _| state(1.0, 0.0, 1.0))
            .with_config(config);
    let mut new_u = u.clone();
    let tau_max = kernel.step::<0>(u, [], [], &mut new_u, tau).expect("step");

    let n = offline.partitioner.n_owned();
    let bounds: Vec<[f64; 4]> = (0..n).map(|i| kernel.bounds().get_tensor(i)).collect();

    let sparsity = &offline.sparsity;
    let mut dij = Vec::new();
    let mut dij_transposed = Vec::new();
    for i in 0..n {
        for k in 0..sparsity.row_length(i) {
            dij.push(kernel.dij_matrix().get_entry::<f64>(i, k));
            dij_transposed.push(kernel.dij_matrix().get_transposed_entry::<f64>(i, k));
        }
    }
    (new_u, tau_max, bounds, SparsityProbe { dij, dij_transposed })
}

struct SparsityProbe {
    dij: Vec<f64>,
    dij_transposed: Vec<f64>,
}

#[test]
fn viscosity_is_symmetric_after_pass_two() {
    let (offline, positions) = periodic_line_mesh(32, 0.0, 2.0 * std::f64::consts::PI);
    let u = initialize(&offline, &positions, jump_state);
    let (_, _, _, probe) = step_once(&offline, &u, KernelConfig::default(), 0.0);

    for (d, d_t) in probe.dij.iter().zip(&probe.dij_transposed) {
        assert_eq!(d, d_t, "d_ij must equal d_ji");
    }
}

#[test]
fn viscosity_rows_sum_to_zero() {
    let (offline, positions) = periodic_line_mesh(32, 0.0, 2.0 * std::f64::consts::PI);
    let u = initialize(&offline, &positions, smooth_state);
    let (_, _, _, probe) = step_once(&offline, &u, KernelConfig::default(), 0.0);

    let mut offset = 0;
    for i in 0..offline.partitioner.n_owned() {
        let row_length = offline.sparsity.row_length(i);
        let row = &probe.dij[offset..offset + row_length];
        offset += row_length;
        let sum: f64 = row.iter().sum();
        let scale = row.iter().fold(0.0f64, |a, d| a.max(d.abs()));
        assert!(
            sum.abs() <= 1e-12 * scale,
            "row {} sums to {} (scale {})",
            i,
            sum,
            scale
        );
    }
}

#[test]
fn periodic_step_conserves_mass_momentum_energy() {
    let (offline, positions) = periodic_line_mesh(64, 0.0, 2.0 * std::f64::consts::PI);
    let u = initialize(&offline, &positions, smooth_state);

    let totals = |v: &MultiComponentVector<3>| -> [f64; 3] {
        let mut sums = [0.0; 3];
        for i in 0..offline.partitioner.n_owned() {
            let u_i: [f64; 3] = v.get_tensor(i);
            for c in 0..3 {
                sums[c] += offline.lumped_mass[i] * u_i[c];
            }
        }
        sums
    };

    let before = totals(&u);
    let (new_u, _, _, _) = step_once(&offline, &u, KernelConfig::default(), 0.0);
    let after = totals(&new_u);

    for c in 0..3 {
        assert!(
            (after[c] - before[c]).abs() <= 1e-10 * before[c].abs().max(1.0),
            "component {} drifted from {} to {}",
            c,
            before[c],
            after[c]
        );
    }
}

#[test]
fn low_order_update_preserves_the_invariant_domain() {
    let (offline, positions) = periodic_line_mesh(64, 0.0, 2.0 * std::f64::consts::PI);
    let u = initialize(&offline, &positions, jump_state);

    let config = KernelConfig::default().with_limiter_iterations(0);
    let (new_u, _, _, _) = step_once(&offline, &u, config, 0.0);

    let euler = Euler1D::new(1.4);
    for i in 0..offline.partitioner.n_owned() {
        let u_i: [f64; 3] = new_u.get_tensor(i);
        assert!(u_i[0] > 0.0, "negative density at {}", i);
        assert!(
            HyperbolicSystem::<1, 3>::is_admissible(&euler, &u_i),
            "inadmissible state at {}: {:?}",
            i,
            u_i
        );
    }
}

#[test]
fn high_order_update_respects_the_limiter_bounds() {
    let (offline, positions) = periodic_line_mesh(64, 0.0, 2.0 * std::f64::consts::PI);
    let u = initialize(&offline, &positions, jump_state);
    let (new_u, _, bounds, _) = step_once(&offline, &u, KernelConfig::default(), 0.0);

    let euler = Euler1D::new(1.4);
    for i in 0..offline.partitioner.n_owned() {
        let u_i: [f64; 3] = new_u.get_tensor(i);
        let [rho_min, rho_max, s_min, gamma_min] = bounds[i];

        let slack = 1e-10 * rho_max.max(1.0);
        assert!(
            u_i[0] >= rho_min - slack && u_i[0] <= rho_max + slack,
            "density {} outside [{}, {}] at {}",
            u_i[0],
            rho_min,
            rho_max,
            i
        );

        let s: f64 = euler.surrogate_specific_entropy(&u_i, gamma_min);
        assert!(
            s >= s_min - 1e-8 * s_min.abs().max(1.0),
            "entropy {} below bound {} at {}",
            s,
            s_min,
            i
        );
    }
}

#[test]
fn constant_state_is_a_fixed_point() {
    let (offline, positions) = periodic_line_mesh(32, 0.0, 1.0);
    let constant = state(1.3, 0.4, 0.9);
    let u = initialize(&offline, &positions, |_| constant);
    let (new_u, tau_max, _, _) = step_once(&offline, &u, KernelConfig::default(), 0.0);

    assert!(tau_max.is_finite() && tau_max > 0.0);
    for i in 0..offline.partitioner.n_owned() {
        let u_i: [f64; 3] = new_u.get_tensor(i);
        for c in 0..3 {
            assert!(
                (u_i[c] - constant[c]).abs() <= 1e-13 * constant[c].abs().max(1.0),
                "component {} moved from {} to {}",
                c,
                constant[c],
                u_i[c]
            );
        }
    }
}

#[test]
fn scalar_and_simd_instantiations_agree() {
    let n = 64;
    let (aligned, positions) = periodic_line_mesh(n, 0.0, 2.0 * std::f64::consts::PI);
    let (scalar, _) = periodic_line_mesh_scalar(n, 0.0, 2.0 * std::f64::consts::PI);
    assert!(aligned.sparsity.n_internal() > 0);
    assert_eq!(scalar.sparsity.n_internal(), 0);

    let u_aligned = initialize(&aligned, &positions, jump_state);
    let u_scalar = initialize(&scalar, &positions, jump_state);

    // Fix the step size so both runs take the identical tau.
    let (_, tau_max, _, _) = step_once(&aligned, &u_aligned, KernelConfig::default(), 0.0);
    let (new_aligned, _, _, _) =
        step_once(&aligned, &u_aligned, KernelConfig::default(), tau_max);
    let (new_scalar, _, _, _) = step_once(&scalar, &u_scalar, KernelConfig::default(), tau_max);

    for i in 0..n {
        let a: [f64; 3] = new_aligned.get_tensor(i);
        let s: [f64; 3] = new_scalar.get_tensor(i);
        for c in 0..3 {
            assert!(
                (a[c] - s[c]).abs() <= 1e-13 * a[c].abs().max(1.0),
                "lane mismatch at dof {} component {}: {} vs {}",
                i,
                c,
                a[c],
                s[c]
            );
        }
    }
}

#[test]
fn limiter_iterations_zero_and_two_bracket_each_other() {
    // The limited high-order solution must stay within the same bounds
    // as the low-order one while being less diffusive: on a smooth
    // profile the high-order step should deviate less from the initial
    // data than the low-order step does.
    let (offline, positions) = periodic_line_mesh(64, 0.0, 2.0 * std::f64::consts::PI);
    let u = initialize(&offline, &positions, smooth_state);

    let (_, tau_max, _, _) = step_once(&offline, &u, KernelConfig::default(), 0.0);
    let (low, _, _, _) = step_once(
        &offline,
        &u,
        KernelConfig::default().with_limiter_iterations(0),
        tau_max,
    );
    let (high, _, _, _) = step_once(&offline, &u, KernelConfig::default(), tau_max);

    let diffusion = |v: &MultiComponentVector<3>| -> f64 {
        // Change in the quadratic density variation across one step.
        let mut sum = 0.0;
        for i in 0..offline.partitioner.n_owned() {
            let before: [f64; 3] = u.get_tensor(i);
            let after: [f64; 3] = v.get_tensor(i);
            sum += (after[0] - before[0]).powi(2);
        }
        sum
    };

    assert!(
        diffusion(&high) < diffusion(&low),
        "high-order update should deviate less on smooth data: {} vs {}",
        diffusion(&high),
        diffusion(&low)
    );
}
