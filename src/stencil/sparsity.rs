//! Lane-grouped sparsity pattern with transpose map.

use std::collections::HashMap;
use std::ops::Range;

use crate::simd::SIMD_WIDTH;

/// Exchange plan for matrix rows at the partition interface.
///
/// Positions are entry positions (see [`SparsityPattern::position`]) of
/// the local pattern: `send` lists owned-row entries whose values a
/// neighbour rank ghosts, `recv` lists the ghost-row entries the
/// neighbour's message fills, in the order the sender packs them. Built
/// by the offline collaborator together with the pattern itself.
#[derive(Clone, Debug, Default)]
pub struct RowExchangePlan {
    pub send: Vec<(usize, Vec<u32>)>,
    pub recv: Vec<(usize, Vec<u32>)>,
}

/// A contiguous run of rows processed by one loop iteration: either a
/// full lane group of `SIMD_WIDTH` aligned rows, or a single scalar row.
#[derive(Clone, Debug)]
pub struct Batch {
    /// First row of the batch.
    pub first_row: usize,
    /// `SIMD_WIDTH` for lane groups, 1 for scalar rows.
    pub n_rows: usize,
    /// Shared stencil size of the rows in this batch.
    pub row_length: usize,
    /// Entry positions covered by the batch.
    pub entries: Range<usize>,
}

impl Batch {
    /// Whether this batch runs the vectorized loop body.
    pub fn is_simd(&self) -> bool {
        self.n_rows == SIMD_WIDTH
    }
}

/// Fixed stencil connectivity in the row-grouped SIMD layout.
///
/// Rows `[0, n_internal)` (a multiple of the lane width, all with a
/// uniform stencil size per group) are interleaved lane-wise; rows
/// `[n_internal, n_rows)` — the scalar tail, the constrained rows and
/// the ghost rows — are stored contiguously. Column 0 of every row is
/// the diagonal. A `row_length` of one marks a constrained row that the
/// kernels skip.
pub struct SparsityPattern {
    n_internal: usize,
    n_owned: usize,
    n_rows: usize,
    row_lengths: Vec<u32>,
    /// Entry position of `(i, 0)` for every row. For an aligned row this
    /// already includes the lane offset within its group.
    entry_base: Vec<u32>,
    columns: Vec<u32>,
    n_internal_entries: usize,
    /// Position of the transposed entry, per entry.
    t_pos: Vec<u32>,
    /// Lane within its group, per entry (0 in the scalar region).
    lane: Vec<u8>,
    batches: Vec<Batch>,
    row_exchange: RowExchangePlan,
}

impl SparsityPattern {
    /// Build a pattern from per-row column lists.
    ///
    /// `rows` holds one column list per local row (owned rows first,
    /// ghost rows after), each starting with the diagonal. The pattern
    /// must be structurally symmetric. Within every aligned lane group
    /// all rows must share one stencil size.
    pub fn new(
        n_internal: usize,
        n_owned: usize,
        rows: &[Vec<u32>],
        row_exchange: RowExchangePlan,
    ) -> Self {
        let n_rows = rows.len();
        assert!(n_internal % SIMD_WIDTH == 0, "aligned range must be a multiple of the lane width");
        assert!(n_internal <= n_owned && n_owned <= n_rows);

        for (i, row) in rows.iter().enumerate() {
            assert!(!row.is_empty(), "row {} has no diagonal", i);
            assert_eq!(row[0] as usize, i, "column 0 of row {} is not the diagonal", i);
            assert!(row.iter().all(|&j| (j as usize) < n_rows));
        }

        let row_lengths: Vec<u32> = rows.iter().map(|r| r.len() as u32).collect();

        let mut entry_base = vec![0u32; n_rows];
        let mut columns = Vec::new();
        let mut lane = Vec::new();

        // Aligned region: interleave each group lane-wise.
        for g in 0..n_internal / SIMD_WIDTH {
            let first = g * SIMD_WIDTH;
            let row_length = rows[first].len();
            for l in 1..SIMD_WIDTH {
                assert_eq!(
                    rows[first + l].len(),
                    row_length,
                    "lane group starting at row {} has mixed stencil sizes",
                    first
                );
            }
            let group_base = columns.len() as u32;
            for l in 0..SIMD_WIDTH {
                entry_base[first + l] = group_base + l as u32;
            }
            for k in 0..row_length {
                for l in 0..SIMD_WIDTH {
                    columns.push(rows[first + l][k]);
                    lane.push(l as u8);
                }
            }
        }
        let n_internal_entries = columns.len();

        // Scalar tail and ghost rows.
        for i in n_internal..n_rows {
            entry_base[i] = columns.len() as u32;
            for &j in &rows[i] {
                columns.push(j);
                lane.push(0);
            }
        }

        // Transpose map: position of (j, i) for every (i, j).
        let mut position_of = HashMap::with_capacity(columns.len());
        for i in 0..n_rows {
            let stride = if i < n_internal { SIMD_WIDTH } else { 1 };
            for k in 0..rows[i].len() {
                let pos = entry_base[i] as usize + k * stride;
                position_of.insert((i as u32, rows[i][k]), pos as u32);
            }
        }
        let mut t_pos = vec![0u32; columns.len()];
        for i in 0..n_rows {
            let stride = if i < n_internal { SIMD_WIDTH } else { 1 };
            for (k, &j) in rows[i].iter().enumerate() {
                let pos = entry_base[i] as usize + k * stride;
                t_pos[pos] = *position_of
                    .get(&(j, i as u32))
                    .unwrap_or_else(|| panic!("pattern is not symmetric at ({}, {})", i, j));
            }
        }

        // Batches: lane groups, then one batch per scalar owned row.
        let mut batches = Vec::new();
        for g in 0..n_internal / SIMD_WIDTH {
            let first_row = g * SIMD_WIDTH;
            let row_length = rows[first_row].len();
            let start = (entry_base[first_row]) as usize;
            batches.push(Batch {
                first_row,
                n_rows: SIMD_WIDTH,
                row_length,
                entries: start..start + row_length * SIMD_WIDTH,
            });
        }
        for i in n_internal..n_owned {
            let start = entry_base[i] as usize;
            batches.push(Batch {
                first_row: i,
                n_rows: 1,
                row_length: rows[i].len(),
                entries: start..start + rows[i].len(),
            });
        }

        Self {
            n_internal,
            n_owned,
            n_rows,
            row_lengths,
            entry_base,
            columns,
            n_internal_entries,
            t_pos,
            lane,
            batches,
            row_exchange,
        }
    }

    /// Rows in the aligned, lane-grouped range.
    pub fn n_internal(&self) -> usize {
        self.n_internal
    }

    /// Locally owned rows.
    pub fn n_owned(&self) -> usize {
        self.n_owned
    }

    /// Owned plus ghost rows.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Total number of stored entries (owned and ghost rows).
    pub fn n_entries(&self) -> usize {
        self.columns.len()
    }

    pub(crate) fn n_internal_entries(&self) -> usize {
        self.n_internal_entries
    }

    /// Stencil size of row `i`.
    #[inline(always)]
    pub fn row_length(&self, i: usize) -> usize {
        self.row_lengths[i] as usize
    }

    /// Entry position of `(i, k)`.
    ///
    /// Positions enumerate stored entries in storage order; within a
    /// lane group the entries of the `SIMD_WIDTH` rows interleave.
    #[inline(always)]
    pub fn position(&self, i: usize, k: usize) -> usize {
        self.entry_base[i] as usize + k * self.col_stride(i)
    }

    /// Distance between consecutive stencil entries of row `i`.
    #[inline(always)]
    pub fn col_stride(&self, i: usize) -> usize {
        if i < self.n_internal {
            SIMD_WIDTH
        } else {
            1
        }
    }

    /// Column id stored at `(i, k)`.
    #[inline(always)]
    pub fn column(&self, i: usize, k: usize) -> u32 {
        self.columns[self.position(i, k)]
    }

    /// Column storage of the batch containing row `i`.
    ///
    /// For an aligned row this is the whole lane-interleaved slab of its
    /// group (entry `k` of lane `l` at `k * SIMD_WIDTH + l`); for a
    /// scalar row it is the row's contiguous column list.
    pub fn columns(&self, i: usize) -> &[u32] {
        let (start, len) = if i < self.n_internal {
            let group_first = i - i % SIMD_WIDTH;
            (
                self.entry_base[group_first] as usize,
                self.row_length(i) * SIMD_WIDTH,
            )
        } else {
            (self.entry_base[i] as usize, self.row_length(i))
        };
        &self.columns[start..start + len]
    }

    /// All stored columns in storage order.
    pub(crate) fn column_storage(&self) -> &[u32] {
        &self.columns
    }

    /// Position of the transposed entry of the entry at `pos`.
    #[inline(always)]
    pub(crate) fn transposed_position(&self, pos: usize) -> usize {
        self.t_pos[pos] as usize
    }

    /// Lane of the entry at `pos` within its group (0 in the scalar
    /// region).
    #[inline(always)]
    pub(crate) fn lane_of(&self, pos: usize) -> usize {
        self.lane[pos] as usize
    }

    /// The batches covering the owned rows.
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub(crate) fn row_exchange(&self) -> &RowExchangePlan {
        &self.row_exchange
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Periodic nearest-neighbour coupling on a ring of `n` rows.
    fn ring(n: usize, n_internal: usize) -> SparsityPattern {
        let rows: Vec<Vec<u32>> = (0..n)
            .map(|i| {
                let left = (i + n - 1) % n;
                let right = (i + 1) % n;
                vec![i as u32, left as u32, right as u32]
            })
            .collect();
        SparsityPattern::new(n_internal, n, &rows, RowExchangePlan::default())
    }

    #[test]
    fn scalar_layout_is_contiguous() {
        let p = ring(6, 0);
        assert_eq!(p.n_entries(), 18);
        for i in 0..6 {
            assert_eq!(p.column(i, 0) as usize, i);
            assert_eq!(p.position(i, 1), p.position(i, 0) + 1);
        }
    }

    #[test]
    fn simd_layout_interleaves_lanes() {
        let p = ring(8, 8);
        // Entry k of lane l lives at k*W + l within the group slab.
        let cols = p.columns(0);
        assert_eq!(cols.len(), 3 * SIMD_WIDTH);
        for l in 0..SIMD_WIDTH {
            assert_eq!(cols[l] as usize, l); // diagonals
        }
        assert_eq!(p.position(1, 2), p.position(0, 2) + 1);
        assert_eq!(p.position(0, 2), p.position(0, 1) + SIMD_WIDTH);
    }

    #[test]
    fn transpose_map_round_trips() {
        for p in [ring(6, 0), ring(8, 8), ring(12, 8)] {
            for i in 0..p.n_rows() {
                for k in 0..p.row_length(i) {
                    let pos = p.position(i, k);
                    let t = p.transposed_position(pos);
                    // The transpose of the transpose is the entry itself.
                    assert_eq!(p.transposed_position(t), pos);
                    // And it really is the (j, i) entry.
                    let j = p.column(i, k) as usize;
                    let k_t = (0..p.row_length(j))
                        .find(|&kk| p.position(j, kk) == t)
                        .expect("transposed position not in row j");
                    assert_eq!(p.column(j, k_t) as usize, i);
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "not the diagonal")]
    fn diagonal_must_come_first() {
        let rows = vec![vec![1u32, 0], vec![0, 1]];
        SparsityPattern::new(0, 2, &rows, RowExchangePlan::default());
    }

    #[test]
    fn batches_cover_owned_rows() {
        let p = ring(12, 8);
        let batches = p.batches();
        assert_eq!(batches.len(), 2 + 4);
        assert!(batches[0].is_simd());
        assert_eq!(batches[1].first_row, 4);
        assert_eq!(batches[2].n_rows, 1);
        let covered: usize = batches.iter().map(|b| b.n_rows).sum();
        assert_eq!(covered, 12);
    }
}
