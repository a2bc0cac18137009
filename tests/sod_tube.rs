//! Sod shock tube, integrated end to end.
//!
//! The classical Riemann problem on [0, 1] with the diaphragm at
//! x = 0.5: (ρ, u, p) = (1, 0, 1) on the left, (0.125, 0, 0.1) on the
//! right, γ = 1.4. At t = 0.2 the exact solution has a rarefaction
//! head near x ≈ 0.26, a contact near x ≈ 0.68, a shock near x ≈ 0.85,
//! and a density plateau of ≈ 0.4263 between rarefaction and contact.

use cg_rs::offline::line::line_mesh;
use cg_rs::{
    Boundary, Euler1D, HyperbolicKernel, KernelConfig, MultiComponentVector, NullCommunicator,
    TimeConfig, TimeIntegrator,
};

const GAMMA: f64 = 1.4;

fn sod_state(x: f64) -> [f64; 3] {
    let (rho, u, p) = if x < 0.5 {
        (1.0, 0.0, 1.0)
    } else {
        (0.125, 0.0, 0.1)
    };
    [rho, rho * u, p / (GAMMA - 1.0) + 0.5 * rho * u * u]
}

/// Run the tube to `t_final` and return (positions, states) sorted by x.
fn run_sod(n_cells: usize, t_final: f64) -> Vec<(f64, [f64; 3])> {
    let (offline, positions) =
        line_mesh(n_cells, 0.0, 1.0, Boundary::Dirichlet, Boundary::Dirichlet);
    let euler = Euler1D::new(GAMMA);
    let comm = NullCommunicator;

    let mut kernel = HyperbolicKernel::new(&euler, &offline, &comm, |x, _| sod_state(x[0]))
        .with_config(KernelConfig::default());
    let mut u = MultiComponentVector::<3>::new(offline.partitioner.clone());
    for (i, &x) in positions.iter().enumerate() {
        u.write_tensor(&sod_state(x), i);
    }

    let config = TimeConfig::default().with_cfl(0.1, 0.2);
    let mut integrator = TimeIntegrator::new(&mut kernel, config);

    let mut t = 0.0;
    let mut steps = 0;
    while t < t_final {
        let tau = integrator.step(&mut u, t).expect("step failed");
        t += tau;
        steps += 1;
        assert!(steps < 10_000, "time stepping stalled at t = {}", t);
    }

    let mut profile: Vec<(f64, [f64; 3])> = positions
        .iter()
        .enumerate()
        .map(|(i, &x)| (x, u.get_tensor::<f64>(i)))
        .collect();
    profile.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    profile
}

fn pressure(u: &[f64; 3]) -> f64 {
    (GAMMA - 1.0) * (u[2] - 0.5 * u[1] * u[1] / u[0])
}

#[test]
fn sod_tube_wave_structure() {
    let profile = run_sod(200, 0.2);

    // Positivity everywhere.
    for (x, u) in &profile {
        assert!(u[0] > 0.0, "negative density at x = {}", x);
        assert!(pressure(u) > 0.0, "negative pressure at x = {}", x);
    }

    // Density plateau between rarefaction tail and contact.
    let peak_right = profile
        .iter()
        .filter(|(x, _)| *x > 0.5)
        .map(|(_, u)| u[0])
        .fold(0.0f64, f64::max);
    assert!(
        (peak_right - 0.4263).abs() < 0.015,
        "post-shock plateau at {}",
        peak_right
    );

    // Shock front: the last position where the density exceeds the
    // mid-plateau value.
    let shock = profile
        .iter()
        .filter(|(_, u)| u[0] > 0.2)
        .map(|(x, _)| *x)
        .fold(0.0f64, f64::max);
    assert!((0.80..=0.90).contains(&shock), "shock at {}", shock);

    // Contact: density falls through 0.35 between the two plateaus.
    let contact = profile
        .iter()
        .filter(|(_, u)| u[0] > 0.35)
        .map(|(x, _)| *x)
        .fold(0.0f64, f64::max);
    assert!((0.62..=0.74).contains(&contact), "contact at {}", contact);

    // Rarefaction head: first departure from the left state.
    let head = profile
        .iter()
        .find(|(_, u)| u[0] < 0.99)
        .map(|(x, _)| *x)
        .unwrap();
    assert!((0.20..=0.32).contains(&head), "rarefaction head at {}", head);
}

#[test]
fn dirichlet_data_is_preserved_at_the_boundary() {
    let profile = run_sod(100, 0.05);

    let (x_left, u_left) = profile.first().unwrap();
    let (x_right, u_right) = profile.last().unwrap();
    assert_eq!(*x_left, 0.0);
    assert_eq!(*x_right, 1.0);

    // Waves have not reached the ends at t = 0.05; the boundary values
    // are re-imposed after every stage and must match the prescribed
    // states to machine precision.
    let expected_left = sod_state(0.0);
    let expected_right = sod_state(1.0);
    for c in 0..3 {
        assert_eq!(u_left[c], expected_left[c]);
        assert_eq!(u_right[c], expected_right[c]);
    }
}

#[test]
fn smooth_wave_error_decreases_at_second_order() {
    // Density perturbation advected by a uniform flow: with constant
    // velocity and pressure, ρ is transported at u = 1.
    let two_pi = 2.0 * std::f64::consts::PI;
    let initial = |x: f64| -> [f64; 3] {
        let rho = 1.0 + 0.2 * (x).sin();
        [rho, rho, 1.0 / (GAMMA - 1.0) + 0.5 * rho]
    };

    let l2_error = |n: usize, t_final: f64| -> f64 {
        let (offline, positions) =
            cg_rs::offline::line::periodic_line_mesh(n, 0.0, two_pi);
        let euler = Euler1D::new(GAMMA);
        let comm = NullCommunicator;
        let mut kernel =
            HyperbolicKernel::new(&euler, &offline, &comm, |x, _| initial(x[0]));
        let mut u = MultiComponentVector::<3>::new(offline.partitioner.clone());
        for (i, &x) in positions.iter().enumerate() {
            u.write_tensor(&initial(x), i);
        }

        let config = TimeConfig::default().with_cfl(0.1, 0.2);
        let mut integrator = TimeIntegrator::new(&mut kernel, config);
        let mut t = 0.0;
        while t < t_final {
            let tau = integrator.step(&mut u, t).expect("step failed");
            t += tau;
        }

        let mut error2 = 0.0;
        for (i, &x) in positions.iter().enumerate() {
            let u_i: [f64; 3] = u.get_tensor(i);
            let exact = 1.0 + 0.2 * (x - t).sin();
            error2 += offline.lumped_mass[i] * (u_i[0] - exact).powi(2);
        }
        error2.sqrt()
    };

    let coarse = l2_error(32, 0.25);
    let fine = l2_error(64, 0.25);
    let ratio = coarse / fine;
    assert!(
        ratio > 2.0,
        "expected better than first-order decay, got ratio {} ({} -> {})",
        ratio,
        coarse,
        fine
    );
}

#[test]
fn warn_strategy_counts_violations_without_failing() {
    // Deliberately overdrive the CFL; under the default warn strategy
    // the step must still return and count the violations.
    let (offline, positions) =
        line_mesh(100, 0.0, 1.0, Boundary::Dirichlet, Boundary::Dirichlet);
    let euler = Euler1D::new(GAMMA);
    let comm = NullCommunicator;
    let mut kernel = HyperbolicKernel::new(&euler, &offline, &comm, |x, _| sod_state(x[0]))
        .with_config(KernelConfig::default().with_cfl(2.0));

    let mut u = MultiComponentVector::<3>::new(offline.partitioner.clone());
    for (i, &x) in positions.iter().enumerate() {
        u.write_tensor(&sod_state(x), i);
    }
    let mut new_u = u.clone();
    let result = kernel.step::<0>(&u, [], [], &mut new_u, 0.0);
    assert!(result.is_ok());
    assert_eq!(kernel.n_restarts(), 0);
    assert!(kernel.n_warnings() > 0, "overdriven step should warn");
}
