//! Row-grouped sparse stencil storage.
//!
//! The finite-element stencil is stored in a compressed-row layout whose
//! aligned range is grouped into SIMD lanes: the columns (and matrix
//! values) of [`SIMD_WIDTH`](crate::simd::SIMD_WIDTH) consecutive rows
//! are interleaved lane-wise so that one vector load reads the same
//! stencil entry of all rows in the group. Rows past the aligned range
//! are stored contiguously and processed scalar.
//!
//! [`SparsityPattern`] owns the layout, the transpose index map and the
//! row-exchange plans; [`SparseMatrixSimd`] attaches `N_COMP` values per
//! nonzero to a shared pattern.

mod matrix;
mod sparsity;

pub use matrix::SparseMatrixSimd;
pub use sparsity::{Batch, RowExchangePlan, SparsityPattern};

pub(crate) use matrix::{
    read_batch_entry, read_batch_tensor, write_batch_entry, write_batch_tensor,
};

use std::ops::Range;

/// Split `data` into disjoint mutable slices covering `ranges`.
///
/// The ranges must be ascending and non-overlapping; gaps and a tail
/// after the last range are allowed and simply not handed out. This is
/// how each kernel pass obtains per-batch output slices for the worker
/// team: row ownership becomes a borrow-checked property instead of a
/// convention.
pub(crate) fn split_disjoint_mut<'a>(
    mut data: &'a mut [f64],
    ranges: impl Iterator<Item = Range<usize>>,
) -> Vec<&'a mut [f64]> {
    let mut out = Vec::new();
    let mut consumed = 0;
    for range in ranges {
        debug_assert!(range.start >= consumed, "ranges must be ascending");
        let (_, rest) = data.split_at_mut(range.start - consumed);
        let (slice, rest) = rest.split_at_mut(range.end - range.start);
        out.push(slice);
        data = rest;
        consumed = range.end;
    }
    out
}
