use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::io::{Read, Write};

use crate::dist::dot;
use crate::error::{MrptError, Result};
use crate::io::{read_f32, read_i32};

/////////////
// Storage //
/////////////

enum Storage {
    /// Row-major `rows × cols` values.
    Dense(Vec<f32>),
    /// Compressed sparse rows: `indptr` has `rows + 1` entries delimiting
    /// the column-index/value pairs of each row.
    Sparse {
        indptr: Vec<usize>,
        indices: Vec<u32>,
        values: Vec<f32>,
    },
}

/// Random projection matrix shared by all trees of an index
///
/// Holds `n_trees * depth` random vectors of dimension `cols`, one
/// contiguous block of `depth` rows per tree. Entries are drawn from N(0,1);
/// in the sparse variant each entry is kept independently with probability
/// `density` and the rows are stored compressed (CSR).
///
/// Every tree block is generated from its own RNG stream, seeded by a
/// sub-seed drawn from a master RNG. Invariant: the first `d` rows of tree
/// `i`'s block are identical for any tree count > `i` and any depth >= `d`,
/// so an index grown with fewer trees or a shallower depth from the same
/// seed reproduces the corresponding blocks exactly.
pub struct RandomMatrix {
    rows: usize,
    cols: usize,
    storage: Storage,
}

impl RandomMatrix {
    /// Generate the projection matrix for an index
    ///
    /// ### Params
    ///
    /// * `n_trees` - Number of tree blocks
    /// * `depth` - Rows per tree block
    /// * `cols` - Data dimensionality
    /// * `density` - Probability of keeping an entry; 1.0 selects the dense
    ///   variant
    /// * `seed` - Master seed; 0 draws entropy from the OS
    ///
    /// ### Returns
    ///
    /// The generated matrix with `n_trees * depth` rows
    pub fn new(n_trees: usize, depth: usize, cols: usize, density: f32, seed: u64) -> Self {
        let mut master = if seed == 0 {
            StdRng::from_os_rng()
        } else {
            StdRng::seed_from_u64(seed)
        };
        let tree_seeds: Vec<u64> = (0..n_trees).map(|_| master.random()).collect();

        let rows = n_trees * depth;

        if density < 1.0 {
            let mut indptr = Vec::with_capacity(rows + 1);
            let mut indices = Vec::new();
            let mut values = Vec::new();
            indptr.push(0);

            for tree_seed in tree_seeds {
                let mut rng = StdRng::seed_from_u64(tree_seed);
                for _ in 0..depth {
                    for col in 0..cols {
                        if rng.random::<f32>() <= density {
                            indices.push(col as u32);
                            values.push(rng.sample(StandardNormal));
                        }
                    }
                    indptr.push(values.len());
                }
            }

            Self {
                rows,
                cols,
                storage: Storage::Sparse {
                    indptr,
                    indices,
                    values,
                },
            }
        } else {
            let mut dense = Vec::with_capacity(rows * cols);
            for tree_seed in tree_seeds {
                let mut rng = StdRng::seed_from_u64(tree_seed);
                for _ in 0..depth * cols {
                    dense.push(rng.sample(StandardNormal));
                }
            }

            Self {
                rows,
                cols,
                storage: Storage::Dense(dense),
            }
        }
    }

    /// An empty placeholder matrix for an ungrown index
    pub fn empty() -> Self {
        Self {
            rows: 0,
            cols: 0,
            storage: Storage::Dense(Vec::new()),
        }
    }

    /// Number of rows (random vectors)
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Data dimensionality
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of stored non-zero entries
    pub fn nnz(&self) -> usize {
        match &self.storage {
            Storage::Dense(values) => values.len(),
            Storage::Sparse { values, .. } => values.len(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.storage, Storage::Sparse { .. })
    }

    /// Product of a single row with a vector
    ///
    /// ### Params
    ///
    /// * `row` - Row index in [0, rows)
    /// * `v` - Vector of length `cols`
    ///
    /// ### Returns
    ///
    /// The inner product of row `row` and `v`
    #[inline]
    pub fn row_dot(&self, row: usize, v: &[f32]) -> f32 {
        match &self.storage {
            Storage::Dense(values) => {
                let start = row * self.cols;
                dot(&values[start..start + self.cols], v)
            }
            Storage::Sparse {
                indptr,
                indices,
                values,
            } => {
                let mut sum = 0.0f32;
                for i in indptr[row]..indptr[row + 1] {
                    sum += values[i] * v[indices[i] as usize];
                }
                sum
            }
        }
    }

    /// Project a vector through the whole matrix
    ///
    /// ### Params
    ///
    /// * `q` - Query vector of length `cols`
    ///
    /// ### Returns
    ///
    /// Vector of `rows` projection values
    pub fn project(&self, q: &[f32]) -> Vec<f32> {
        (0..self.rows).map(|r| self.row_dot(r, q)).collect()
    }

    /////////////////
    // Persistence //
    /////////////////

    /// Write the blocks of the first `n_trees` trees, `depth` rows each
    ///
    /// Rows are read with the stride `depth_pool` the matrix was generated
    /// with and written re-packed with stride `depth`, so a pruned index
    /// persists exactly the rows its traversal uses. Sparse matrices are
    /// written as a triplet count followed by `(row, col, value)` records,
    /// dense ones as raw row-major values.
    pub(crate) fn write_rows<W: Write>(
        &self,
        w: &mut W,
        n_trees: usize,
        depth: usize,
        depth_pool: usize,
    ) -> std::io::Result<()> {
        match &self.storage {
            Storage::Sparse {
                indptr,
                indices,
                values,
            } => {
                let mut nnz = 0usize;
                for tree in 0..n_trees {
                    for l in 0..depth {
                        let row = tree * depth_pool + l;
                        nnz += indptr[row + 1] - indptr[row];
                    }
                }
                w.write_all(&(nnz as i32).to_ne_bytes())?;

                for tree in 0..n_trees {
                    for l in 0..depth {
                        let row = tree * depth_pool + l;
                        let out_row = (tree * depth + l) as i32;
                        for i in indptr[row]..indptr[row + 1] {
                            w.write_all(&out_row.to_ne_bytes())?;
                            w.write_all(&(indices[i] as i32).to_ne_bytes())?;
                            w.write_all(&values[i].to_ne_bytes())?;
                        }
                    }
                }
            }
            Storage::Dense(dense) => {
                for tree in 0..n_trees {
                    for l in 0..depth {
                        let row = tree * depth_pool + l;
                        let start = row * self.cols;
                        w.write_all(bytemuck::cast_slice(&dense[start..start + self.cols]))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Read a matrix of `rows × cols` back from a persisted index
    ///
    /// ### Params
    ///
    /// * `r` - Reader positioned at the random-matrix section
    /// * `rows` - Expected number of rows
    /// * `cols` - Expected number of columns
    /// * `sparse` - Whether the triplet format was written
    ///
    /// ### Returns
    ///
    /// The reconstructed matrix, or `CorruptIndex` when a triplet is out of
    /// range
    pub(crate) fn read_rows<R: Read>(
        r: &mut R,
        rows: usize,
        cols: usize,
        sparse: bool,
    ) -> Result<Self> {
        if sparse {
            let nnz = read_i32(r)?;
            if nnz < 0 {
                return Err(MrptError::CorruptIndex(format!(
                    "negative non-zero count {nnz}"
                )));
            }

            let mut triplets = Vec::with_capacity(nnz as usize);
            for _ in 0..nnz {
                let row = read_i32(r)?;
                let col = read_i32(r)?;
                let val = read_f32(r)?;
                if row < 0 || row as usize >= rows || col < 0 || col as usize >= cols {
                    return Err(MrptError::CorruptIndex(format!(
                        "triplet ({row}, {col}) outside a {rows}x{cols} matrix"
                    )));
                }
                triplets.push((row as usize, col as u32, val));
            }
            triplets.sort_by_key(|&(row, col, _)| (row, col));

            let mut indptr = Vec::with_capacity(rows + 1);
            let mut indices = Vec::with_capacity(triplets.len());
            let mut values = Vec::with_capacity(triplets.len());
            indptr.push(0);

            let mut current = 0usize;
            for (row, col, val) in triplets {
                while current < row {
                    indptr.push(values.len());
                    current += 1;
                }
                indices.push(col);
                values.push(val);
            }
            while current < rows {
                indptr.push(values.len());
                current += 1;
            }

            Ok(Self {
                rows,
                cols,
                storage: Storage::Sparse {
                    indptr,
                    indices,
                    values,
                },
            })
        } else {
            let mut dense = Vec::with_capacity(rows * cols);
            for _ in 0..rows * cols {
                dense.push(read_f32(r)?);
            }

            Ok(Self {
                rows,
                cols,
                storage: Storage::Dense(dense),
            })
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_dense_shape_and_reproducibility() {
        let a = RandomMatrix::new(4, 3, 8, 1.0, 42);
        let b = RandomMatrix::new(4, 3, 8, 1.0, 42);

        assert_eq!(a.rows(), 12);
        assert_eq!(a.cols(), 8);
        assert!(!a.is_sparse());

        let q: Vec<f32> = (0..8).map(|i| i as f32 * 0.5).collect();
        assert_eq!(a.project(&q), b.project(&q));
    }

    #[test]
    fn test_different_seeds_differ() {
        let a = RandomMatrix::new(2, 2, 16, 1.0, 1);
        let b = RandomMatrix::new(2, 2, 16, 1.0, 2);

        let q = vec![1.0f32; 16];
        assert_ne!(a.project(&q), b.project(&q));
    }

    #[test]
    fn test_tree_block_prefix_invariant() {
        // The first d rows of every tree block must not depend on the total
        // tree count or the depth the matrix was generated with.
        let big = RandomMatrix::new(5, 6, 10, 1.0, 7);
        let small = RandomMatrix::new(3, 4, 10, 1.0, 7);

        let q: Vec<f32> = (0..10).map(|i| (i as f32).sin()).collect();
        for tree in 0..3 {
            for l in 0..4 {
                let from_big = big.row_dot(tree * 6 + l, &q);
                let from_small = small.row_dot(tree * 4 + l, &q);
                assert_relative_eq!(from_big, from_small, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_sparse_block_prefix_invariant() {
        let big = RandomMatrix::new(4, 5, 12, 0.4, 99);
        let small = RandomMatrix::new(2, 3, 12, 0.4, 99);

        let q: Vec<f32> = (0..12).map(|i| (i as f32) * 0.25 - 1.0).collect();
        for tree in 0..2 {
            for l in 0..3 {
                let from_big = big.row_dot(tree * 5 + l, &q);
                let from_small = small.row_dot(tree * 3 + l, &q);
                assert_relative_eq!(from_big, from_small, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_sparse_density_bounds() {
        let m = RandomMatrix::new(2, 4, 100, 0.3, 5);

        assert!(m.is_sparse());
        assert_eq!(m.rows(), 8);
        // With 800 candidate entries at density 0.3 the kept count should
        // land well inside these loose bounds.
        assert!(m.nnz() > 120 && m.nnz() < 400, "nnz = {}", m.nnz());
    }

    #[test]
    fn test_project_matches_row_dot() {
        let m = RandomMatrix::new(3, 2, 6, 0.5, 11);
        let q: Vec<f32> = (0..6).map(|i| i as f32 - 2.5).collect();

        let projected = m.project(&q);
        assert_eq!(projected.len(), 6);
        for (r, &p) in projected.iter().enumerate() {
            assert_relative_eq!(p, m.row_dot(r, &q), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_write_read_round_trip_dense() {
        let m = RandomMatrix::new(3, 4, 5, 1.0, 21);

        let mut buf = Vec::new();
        m.write_rows(&mut buf, 3, 4, 4).unwrap();

        let back = RandomMatrix::read_rows(&mut buf.as_slice(), 12, 5, false).unwrap();
        let q = vec![0.5f32; 5];
        assert_eq!(m.project(&q), back.project(&q));
    }

    #[test]
    fn test_write_read_round_trip_sparse() {
        let m = RandomMatrix::new(3, 4, 5, 0.6, 21);

        let mut buf = Vec::new();
        m.write_rows(&mut buf, 3, 4, 4).unwrap();

        let back = RandomMatrix::read_rows(&mut buf.as_slice(), 12, 5, true).unwrap();
        let q: Vec<f32> = (0..5).map(|i| i as f32).collect();
        assert_eq!(m.project(&q), back.project(&q));
    }

    #[test]
    fn test_write_subset_of_trees() {
        // Writing the first 2 trees at depth 2 from a 3-tree depth-4 matrix
        // must reproduce those rows under the packed stride.
        let m = RandomMatrix::new(3, 4, 6, 1.0, 13);

        let mut buf = Vec::new();
        m.write_rows(&mut buf, 2, 2, 4).unwrap();

        let back = RandomMatrix::read_rows(&mut buf.as_slice(), 4, 6, false).unwrap();
        let q: Vec<f32> = (0..6).map(|i| (i as f32).cos()).collect();
        for tree in 0..2 {
            for l in 0..2 {
                assert_relative_eq!(
                    back.row_dot(tree * 2 + l, &q),
                    m.row_dot(tree * 4 + l, &q),
                    epsilon = 1e-6
                );
            }
        }
    }

    #[test]
    fn test_read_rejects_out_of_range_triplet() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1i32.to_ne_bytes());
        buf.extend_from_slice(&5i32.to_ne_bytes()); // row 5 of a 2-row matrix
        buf.extend_from_slice(&0i32.to_ne_bytes());
        buf.extend_from_slice(&1.0f32.to_ne_bytes());

        let res = RandomMatrix::read_rows(&mut buf.as_slice(), 2, 3, true);
        assert!(res.is_err());
    }
}
