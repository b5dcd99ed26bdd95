//! Sparse Hessian storage.
//!
//! Every objective Hessian is stored as a fixed lower triangular pattern
//! `(rows, cols)` with a parallel vector of values. The pattern is computed once
//! from the lists of variables coupled by each element (face, vertex ring,
//! handle, ...), and each element keeps a mapping from its dense local block
//! entries to slots in the compressed value vector.

use ahash::AHashMap;
use sprs::{CsMat, TriMat};

/// Position of a local block entry in the compressed value vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct BlockEntry {
    local_row: usize,
    local_col: usize,
    slot: usize,
}

/// A symmetric sparsity pattern storing only entries with `row >= col`.
///
/// Entries are unique and sorted by row then column.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HessianPattern {
    size: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    /// Element `i` owns `entries[offsets[i]..offsets[i + 1]]`.
    offsets: Vec<usize>,
    entries: Vec<BlockEntry>,
}

impl HessianPattern {
    /// Build a pattern for a square matrix of the given size, where each
    /// element couples every pair of the variables it lists.
    ///
    /// Elements may list the same variable more than once; the corresponding
    /// block entries accumulate into the same slot.
    pub fn new<E: AsRef<[usize]>>(size: usize, elements: &[E]) -> Self {
        let mut raw = Vec::new();
        let mut offsets = Vec::with_capacity(elements.len() + 1);
        offsets.push(0);
        for element in elements.iter() {
            let element = element.as_ref();
            for (p, &gp) in element.iter().enumerate() {
                debug_assert!(gp < size);
                for (q, &gq) in element.iter().enumerate() {
                    if gp >= gq {
                        raw.push((p, q, gp, gq));
                    }
                }
            }
            offsets.push(raw.len());
        }

        let mut positions: Vec<(usize, usize)> = raw.iter().map(|&(_, _, r, c)| (r, c)).collect();
        positions.sort_unstable();
        positions.dedup();

        let slots: AHashMap<(usize, usize), usize> = positions
            .iter()
            .enumerate()
            .map(|(slot, &pos)| (pos, slot))
            .collect();

        let entries = raw
            .into_iter()
            .map(|(local_row, local_col, r, c)| BlockEntry {
                local_row,
                local_col,
                slot: slots[&(r, c)],
            })
            .collect();

        let (rows, cols) = positions.into_iter().unzip();
        HessianPattern {
            size,
            rows,
            cols,
            offsets,
            entries,
        }
    }

    /// Build an element-free pattern from arbitrary positions.
    ///
    /// Positions in the upper triangle are reflected into the lower triangle.
    pub fn from_positions(size: usize, positions: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let mut positions: Vec<(usize, usize)> = positions
            .into_iter()
            .map(|(r, c)| if r >= c { (r, c) } else { (c, r) })
            .collect();
        positions.sort_unstable();
        positions.dedup();
        let (rows, cols) = positions.into_iter().unzip();
        HessianPattern {
            size,
            rows,
            cols,
            offsets: vec![0],
            entries: Vec::new(),
        }
    }

    /// Dimension of the (square) matrix.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of stored (lower triangular) entries.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn num_elements(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    #[inline]
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    #[inline]
    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    /// Iterator over `(row, col)` pairs of the pattern.
    pub fn positions(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows.iter().copied().zip(self.cols.iter().copied())
    }

    /// The slot storing entry `(row, col)`, looked up in the lower triangle.
    pub fn slot(&self, row: usize, col: usize) -> Option<usize> {
        let key = if row >= col { (row, col) } else { (col, row) };
        let start = self.rows.partition_point(|&r| r < key.0);
        let end = self.rows.partition_point(|&r| r <= key.0);
        self.cols[start..end]
            .binary_search(&key.1)
            .ok()
            .map(|i| start + i)
    }

    /// Scatter-add a dense local block of the given element into `values`.
    ///
    /// Only the lower triangular part (in global indices) of the block is read.
    pub fn add_element_block<R, C, S>(
        &self,
        element: usize,
        block: &na::Matrix<f64, R, C, S>,
        scale: f64,
        values: &mut [f64],
    ) where
        R: na::Dim,
        C: na::Dim,
        S: na::RawStorage<f64, R, C>,
    {
        let entries = &self.entries[self.offsets[element]..self.offsets[element + 1]];
        for e in entries {
            values[e.slot] += scale * block[(e.local_row, e.local_col)];
        }
    }

    /// Lower triangular part of the matrix in compressed sparse row format.
    pub fn to_csr(&self, values: &[f64]) -> CsMat<f64> {
        self.lower_triangular_triplets(values).to_csr()
    }

    /// Lower triangular part of the matrix in compressed sparse column format.
    pub fn to_csc(&self, values: &[f64]) -> CsMat<f64> {
        self.lower_triangular_triplets(values).to_csc()
    }

    /// The full symmetric matrix in compressed sparse column format.
    pub fn to_symmetric_csc(&self, values: &[f64]) -> CsMat<f64> {
        let mut mtx = TriMat::with_capacity((self.size, self.size), 2 * values.len());
        for ((r, c), &v) in self.positions().zip(values.iter()) {
            mtx.add_triplet(r, c, v);
            if r != c {
                mtx.add_triplet(c, r, v);
            }
        }
        mtx.to_csc()
    }

    /// Dense symmetric matrix, useful for diagnostics on small problems.
    pub fn to_dense(&self, values: &[f64]) -> na::DMatrix<f64> {
        let mut mtx = na::DMatrix::zeros(self.size, self.size);
        for ((r, c), &v) in self.positions().zip(values.iter()) {
            mtx[(r, c)] += v;
            if r != c {
                mtx[(c, r)] += v;
            }
        }
        mtx
    }

    fn lower_triangular_triplets(&self, values: &[f64]) -> TriMat<f64> {
        assert_eq!(values.len(), self.nnz());
        TriMat::from_triplets(
            (self.size, self.size),
            self.rows.clone(),
            self.cols.clone(),
            values.to_vec(),
        )
    }
}

/// Project a dense symmetric matrix onto the cone of positive semi-definite
/// matrices by clamping negative eigenvalues to zero.
pub fn project_psd<R, C, S>(mtx: &mut na::Matrix<f64, R, C, S>)
where
    R: na::Dim,
    C: na::Dim,
    S: na::RawStorageMut<f64, R, C>,
{
    let (nrows, ncols) = mtx.shape();
    debug_assert_eq!(nrows, ncols);
    let dense = na::DMatrix::from_fn(nrows, ncols, |i, j| mtx[(i, j)]);
    let mut eigen = dense.symmetric_eigen();
    if eigen.eigenvalues.iter().all(|&l| l >= 0.0) {
        return;
    }
    eigen.eigenvalues.iter_mut().for_each(|l| *l = l.max(0.0));
    let projected = eigen.recompose();
    for j in 0..ncols {
        for i in 0..nrows {
            mtx[(i, j)] = projected[(i, j)];
        }
    }
}
