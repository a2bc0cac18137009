//! Exact P1 offline data for 1D interval meshes.
//!
//! Linear finite elements on a uniform subdivision of `[x_left,
//! x_right]` admit closed-form mass and gradient matrices:
//!
//! - lumped mass `m_i = dx` (half at the interval ends),
//! - consistent mass `m_ii = 2dx/3`, `m_{i,i±1} = dx/6`,
//! - discrete gradient `c_{i,i±1} = ±1/2` with the boundary terms
//!   `c_00 = −1/2`, `c_nn = +1/2` on a bounded interval.
//!
//! These assemblers exist so that tests, benches and demos have honest
//! kernel inputs; mesh generation proper is the business of the offline
//! collaborator.

use std::sync::Arc;

use crate::comm::Partitioner;
use crate::equations::Boundary;
use crate::simd::SIMD_WIDTH;
use crate::stencil::{RowExchangePlan, SparseMatrixSimd, SparsityPattern};

use super::{BoundaryDof, CouplingBoundaryPair, OfflineData};

/// Offline data for a bounded interval with `n_cells` cells and
/// prescribed boundary ids at both ends.
///
/// Interior nodes are numbered first (and lane-aligned); the two end
/// nodes follow in the scalar range. Returns the data and the position
/// of every local DOF.
pub fn line_mesh(
    n_cells: usize,
    x_left: f64,
    x_right: f64,
    left_id: Boundary,
    right_id: Boundary,
) -> (OfflineData<1>, Vec<f64>) {
    assert!(n_cells >= 3, "need at least three cells");
    let dx = (x_right - x_left) / n_cells as f64;
    let n_interior = n_cells - 1;
    let n_nodes = n_cells + 1;

    // Mesh node -> local DOF: interior nodes 1..n_cells-1 first, then
    // the two end nodes.
    let local_of = |g: usize| -> usize {
        if g == 0 {
            n_interior
        } else if g == n_cells {
            n_interior + 1
        } else {
            g - 1
        }
    };

    let mut rows: Vec<Vec<u32>> = Vec::with_capacity(n_nodes);
    for i in 0..n_interior {
        let g = i + 1;
        rows.push(vec![
            i as u32,
            local_of(g - 1) as u32,
            local_of(g + 1) as u32,
        ]);
    }
    rows.push(vec![n_interior as u32, local_of(1) as u32]);
    rows.push(vec![(n_interior + 1) as u32, local_of(n_cells - 1) as u32]);

    let n_internal = n_interior - n_interior % SIMD_WIDTH;
    let sparsity = Arc::new(SparsityPattern::new(
        n_internal,
        n_nodes,
        &rows,
        RowExchangePlan::default(),
    ));
    let partitioner = Arc::new(Partitioner::single_rank(n_nodes));

    let global_of = |local: usize| -> usize {
        if local < n_interior {
            local + 1
        } else if local == n_interior {
            0
        } else {
            n_cells
        }
    };

    let mut lumped_mass = vec![0.0; n_nodes];
    let mut positions = vec![0.0; n_nodes];
    for local in 0..n_nodes {
        let g = global_of(local);
        lumped_mass[local] = if g == 0 || g == n_cells { 0.5 * dx } else { dx };
        positions[local] = x_left + g as f64 * dx;
    }
    let lumped_mass_inverse: Vec<f64> = lumped_mass.iter().map(|m| 1.0 / m).collect();

    let mut mass_matrix = SparseMatrixSimd::<1>::new(sparsity.clone());
    let mut cij_matrix = SparseMatrixSimd::<1>::new(sparsity.clone());
    let mut betaij_matrix = SparseMatrixSimd::<1>::new(sparsity.clone());
    for local in 0..n_nodes {
        let gi = global_of(local);
        let at_end = gi == 0 || gi == n_cells;
        for k in 0..sparsity.row_length(local) {
            let gj = global_of(sparsity.column(local, k) as usize);
            let (m, c) = if gj == gi {
                let m = if at_end { dx / 3.0 } else { 2.0 * dx / 3.0 };
                let c = if gi == 0 {
                    -0.5
                } else if gi == n_cells {
                    0.5
                } else {
                    0.0
                };
                (m, c)
            } else if gj == gi + 1 {
                (dx / 6.0, 0.5)
            } else {
                (dx / 6.0, -0.5)
            };
            mass_matrix.write_entry(m, local, k);
            cij_matrix.write_entry(c, local, k);
            betaij_matrix.write_entry(if gj == gi { 0.0 } else { m }, local, k);
        }
    }

    let boundary_map = vec![
        BoundaryDof {
            index: n_interior,
            normal: [-1.0],
            normal_mass: 1.0,
            boundary_mass: 1.0,
            id: left_id,
            position: [x_left],
        },
        BoundaryDof {
            index: n_interior + 1,
            normal: [1.0],
            normal_mass: 1.0,
            boundary_mass: 1.0,
            id: right_id,
            position: [x_right],
        },
    ];

    let data = OfflineData {
        partitioner,
        sparsity,
        lumped_mass,
        lumped_mass_inverse,
        mass_matrix,
        cij_matrix,
        betaij_matrix,
        boundary_map,
        coupling_boundary_pairs: Vec::new(),
        measure_of_omega: x_right - x_left,
        n_export_indices: 0,
    };
    (data, positions)
}

/// Offline data for a periodic interval with `n_nodes` nodes.
///
/// Every row has the full three-point stencil; the aligned range covers
/// as many lane groups as fit.
pub fn periodic_line_mesh(n_nodes: usize, x_left: f64, x_right: f64) -> (OfflineData<1>, Vec<f64>) {
    periodic_line_with_alignment(n_nodes, x_left, x_right, true)
}

/// Periodic interval processed entirely in the scalar loop.
///
/// Produces the same stencil as [`periodic_line_mesh`] with an empty
/// aligned range, so a run over it exercises only the scalar
/// instantiation of every loop body. Comparing both runs checks that
/// the two instantiations agree.
pub fn periodic_line_mesh_scalar(
    n_nodes: usize,
    x_left: f64,
    x_right: f64,
) -> (OfflineData<1>, Vec<f64>) {
    periodic_line_with_alignment(n_nodes, x_left, x_right, false)
}

fn periodic_line_with_alignment(
    n_nodes: usize,
    x_left: f64,
    x_right: f64,
    aligned: bool,
) -> (OfflineData<1>, Vec<f64>) {
    assert!(n_nodes >= 4, "need at least four nodes");
    let dx = (x_right - x_left) / n_nodes as f64;

    let rows: Vec<Vec<u32>> = (0..n_nodes)
        .map(|i| {
            let left = (i + n_nodes - 1) % n_nodes;
            let right = (i + 1) % n_nodes;
            vec![i as u32, left as u32, right as u32]
        })
        .collect();

    let n_internal = if aligned {
        n_nodes - n_nodes % SIMD_WIDTH
    } else {
        0
    };
    let sparsity = Arc::new(SparsityPattern::new(
        n_internal,
        n_nodes,
        &rows,
        RowExchangePlan::default(),
    ));
    let partitioner = Arc::new(Partitioner::single_rank(n_nodes));

    let lumped_mass = vec![dx; n_nodes];
    let lumped_mass_inverse = vec![1.0 / dx; n_nodes];
    let positions: Vec<f64> = (0..n_nodes).map(|i| x_left + i as f64 * dx).collect();

    let mut mass_matrix = SparseMatrixSimd::<1>::new(sparsity.clone());
    let mut cij_matrix = SparseMatrixSimd::<1>::new(sparsity.clone());
    let mut betaij_matrix = SparseMatrixSimd::<1>::new(sparsity.clone());
    for i in 0..n_nodes {
        for k in 0..3 {
            let j = sparsity.column(i, k) as usize;
            let (m, c) = periodic_entries(i, j, n_nodes, dx);
            mass_matrix.write_entry(m, i, k);
            cij_matrix.write_entry(c, i, k);
            betaij_matrix.write_entry(if i == j { 0.0 } else { m }, i, k);
        }
    }

    let data = OfflineData {
        partitioner,
        sparsity,
        lumped_mass,
        lumped_mass_inverse,
        mass_matrix,
        cij_matrix,
        betaij_matrix,
        boundary_map: Vec::new(),
        coupling_boundary_pairs: Vec::new(),
        measure_of_omega: x_right - x_left,
        n_export_indices: 0,
    };
    (data, positions)
}

/// Distribute a periodic interval over `n_ranks` ranks.
///
/// Each rank owns a contiguous block of `n_nodes / n_ranks` nodes and
/// ghosts one node of each neighbour. Intended for multi-rank tests;
/// real runs consume the distribution produced offline.
pub fn partitioned_periodic_line_mesh(
    n_nodes: usize,
    x_left: f64,
    x_right: f64,
    n_ranks: usize,
) -> Vec<(OfflineData<1>, Vec<f64>)> {
    assert!(n_ranks >= 2);
    assert!(
        n_nodes % n_ranks == 0,
        "node count must divide evenly over the ranks"
    );
    let m = n_nodes / n_ranks;
    assert!(m >= 2, "each rank needs at least two nodes");
    let dx = (x_right - x_left) / n_nodes as f64;

    (0..n_ranks)
        .map(|rank| {
            let base = rank * m;
            // Local layout: owned 0..m, then left ghost m, right ghost m+1.
            let left_ghost_global = (base + n_nodes - 1) % n_nodes;
            let right_ghost_global = (base + m) % n_nodes;
            let global_of = move |local: usize| -> usize {
                match local {
                    l if l < m => base + l,
                    l if l == m => left_ghost_global,
                    _ => right_ghost_global,
                }
            };

            let mut rows: Vec<Vec<u32>> = Vec::with_capacity(m + 2);
            for i in 0..m {
                let left = if i == 0 { m } else { i - 1 };
                let right = if i == m - 1 { m + 1 } else { i + 1 };
                rows.push(vec![i as u32, left as u32, right as u32]);
            }
            // Ghost rows restricted to locally relevant columns.
            rows.push(vec![m as u32, 0]);
            rows.push(vec![(m + 1) as u32, (m - 1) as u32]);

            let left_rank = (rank + n_ranks - 1) % n_ranks;
            let right_rank = (rank + 1) % n_ranks;

            // Field exchange plans, ghosts in (left, right) order.
            let mut recv_plan: Vec<(usize, Vec<u32>)> = Vec::new();
            for (owner, ghost) in [(left_rank, m as u32), (right_rank, (m + 1) as u32)] {
                match recv_plan.iter_mut().find(|(r, _)| *r == owner) {
                    Some((_, indices)) => indices.push(ghost),
                    None => recv_plan.push((owner, vec![ghost])),
                }
            }
            let mut send_plan: Vec<(usize, Vec<u32>)> = Vec::new();
            for peer in [left_rank, right_rank] {
                if send_plan.iter().any(|(r, _)| *r == peer) {
                    continue;
                }
                let mut indices = Vec::new();
                // The peer's ghosts in the peer's own (left, right) order.
                let peer_left = (peer * m + n_nodes - 1) % n_nodes;
                let peer_right = ((peer + 1) * m) % n_nodes;
                for ghost_global in [peer_left, peer_right] {
                    if ghost_global / m == rank {
                        indices.push((ghost_global - base) as u32);
                    }
                }
                if !indices.is_empty() {
                    send_plan.push((peer, indices));
                }
            }

            let partitioner = Arc::new(Partitioner::new(rank, m, 2, send_plan, recv_plan));

            // Row exchange for the limiter matrices. Positions refer to
            // the local sparsity; ghost rows are (diagonal, neighbour).
            let sparsity_rows = rows.clone();
            let n_internal = m - m % SIMD_WIDTH;

            // Build the pattern twice: once to compute entry positions
            // for the exchange plans, once with the final plans.
            let probe = SparsityPattern::new(
                n_internal,
                m,
                &sparsity_rows,
                RowExchangePlan::default(),
            );

            let mut row_recv: Vec<(usize, Vec<u32>)> = Vec::new();
            for (owner, ghost_row) in [(left_rank, m), (right_rank, m + 1)] {
                let positions = vec![
                    probe.position(ghost_row, 0) as u32,
                    probe.position(ghost_row, 1) as u32,
                ];
                match row_recv.iter_mut().find(|(r, _)| *r == owner) {
                    Some((_, p)) => p.extend(positions),
                    None => row_recv.push((owner, positions)),
                }
            }
            let mut row_send: Vec<(usize, Vec<u32>)> = Vec::new();
            for peer in [left_rank, right_rank] {
                if row_send.iter().any(|(r, _)| *r == peer) {
                    continue;
                }
                let mut positions = Vec::new();
                let peer_left = (peer * m + n_nodes - 1) % n_nodes;
                let peer_right = ((peer + 1) * m) % n_nodes;
                // Peer's left ghost is our last node; its row there is
                // (diagonal, right neighbour). Peer's right ghost is our
                // first node; its row is (diagonal, left neighbour).
                if peer_left / m == rank {
                    positions.push(probe.position(m - 1, 0) as u32);
                    positions.push(probe.position(m - 1, 2) as u32);
                }
                if peer_right / m == rank {
                    positions.push(probe.position(0, 0) as u32);
                    positions.push(probe.position(0, 1) as u32);
                }
                if !positions.is_empty() {
                    row_send.push((peer, positions));
                }
            }

            let sparsity = Arc::new(SparsityPattern::new(
                n_internal,
                m,
                &sparsity_rows,
                RowExchangePlan {
                    send: row_send,
                    recv: row_recv,
                },
            ));

            let n_local = m + 2;
            let lumped_mass = vec![dx; n_local];
            let lumped_mass_inverse = vec![1.0 / dx; n_local];
            let positions: Vec<f64> = (0..n_local)
                .map(|l| x_left + global_of(l) as f64 * dx)
                .collect();

            let mut mass_matrix = SparseMatrixSimd::<1>::new(sparsity.clone());
            let mut cij_matrix = SparseMatrixSimd::<1>::new(sparsity.clone());
            let mut betaij_matrix = SparseMatrixSimd::<1>::new(sparsity.clone());
            for local in 0..n_local {
                let gi = global_of(local);
                for k in 0..sparsity.row_length(local) {
                    let gj = global_of(sparsity.column(local, k) as usize);
                    let (mass, c) = periodic_entries(gi, gj, n_nodes, dx);
                    mass_matrix.write_entry(mass, local, k);
                    cij_matrix.write_entry(c, local, k);
                    betaij_matrix.write_entry(if gi == gj { 0.0 } else { mass }, local, k);
                }
            }

            let coupling_boundary_pairs = vec![
                CouplingBoundaryPair {
                    row: 0,
                    col_index: 1,
                    ghost: m as u32,
                },
                CouplingBoundaryPair {
                    row: (m - 1) as u32,
                    col_index: 2,
                    ghost: (m + 1) as u32,
                },
            ];

            let data = OfflineData {
                partitioner,
                sparsity,
                lumped_mass,
                lumped_mass_inverse,
                mass_matrix,
                cij_matrix,
                betaij_matrix,
                boundary_map: Vec::new(),
                coupling_boundary_pairs,
                measure_of_omega: x_right - x_left,
                n_export_indices: m,
            };
            (data, positions)
        })
        .collect()
}

/// Consistent mass and gradient entry of a periodic uniform mesh.
fn periodic_entries(gi: usize, gj: usize, n_nodes: usize, dx: f64) -> (f64, f64) {
    if gi == gj {
        (2.0 * dx / 3.0, 0.0)
    } else if gj == (gi + 1) % n_nodes {
        (dx / 6.0, 0.5)
    } else {
        (dx / 6.0, -0.5)
    }
}
