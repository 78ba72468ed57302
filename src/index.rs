use faer::{MatRef, RowRef};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use crate::autotune::{Parameters, Tuning};
use crate::dist::squared_euclidean;
use crate::error::{MrptError, Result};
use crate::io::{read_f32, read_f32_vec, read_i32, read_i32_vec};
use crate::leaf_layout::count_first_leaf_indices_all;
use crate::random_matrix::RandomMatrix;
use crate::tree::grow_tree;
use crate::utils::matrix_to_flat;

/// Result of a single query
///
/// ### Fields
///
/// * `indices` - The k nearest neighbour indices; slots that could not be
///   filled (fewer candidates than k) hold `-1`
/// * `distances` - Euclidean distances matching `indices`; unfilled slots
///   hold `-1.0`
/// * `n_elected` - Size of the candidate set that went into the exact
///   search
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub indices: Vec<i32>,
    pub distances: Vec<f32>,
    pub n_elected: usize,
}

impl QueryResult {
    fn sentinel(k: usize) -> Self {
        Self {
            indices: vec![-1; k],
            distances: vec![-1.0; k],
            n_elected: 0,
        }
    }
}

////////////////
// Main index //
////////////////

/// Multiple random projection trees index for approximate nearest
/// neighbour search
///
/// The dataset is projected through one shared random matrix (a block of
/// rows per tree) and each tree recursively median-splits the points on the
/// projection values, down to a fixed depth. A query is projected once,
/// routed to one leaf per tree, and every data point appearing in at least
/// `votes_required` of those leaves becomes a candidate for the exact
/// distance comparison.
///
/// All heavyweight storage (data, random matrix, split points, leaf
/// permutations) sits behind `Arc`, so an index pruned to a cheaper
/// operating point by [`Mrpt::subset`] shares it instead of copying.
///
/// ### Fields
///
/// * `data` - Row-major flattened dataset, `n_samples x dim`
/// * `split_points` - Column-major split thresholds, one column of
///   `split_stride` entries per tree, heap-ordered within the column
/// * `tree_leaves` - Per-tree permutation of the dataset indices; leaf
///   segment boundaries come from `leaf_first_indices_all`
/// * `random_matrix` - Shared projection matrix, `depth_pool` rows per tree
/// * `depth_pool` - Row stride of a tree's block inside the random matrix;
///   fixed when the matrix is generated and deliberately left untouched by
///   `subset`, so traversal at a reduced depth reads the same rows a full
///   rebuild would
pub struct Mrpt {
    pub(crate) data: Arc<Vec<f32>>,
    pub(crate) n_samples: usize,
    pub(crate) dim: usize,

    pub(crate) n_trees: usize,
    pub(crate) depth: usize,
    pub(crate) depth_pool: usize,
    pub(crate) density: f32,
    pub(crate) n_array: usize,
    pub(crate) split_stride: usize,
    pub(crate) split_points: Arc<Vec<f32>>,
    pub(crate) tree_leaves: Arc<Vec<Vec<usize>>>,
    pub(crate) random_matrix: Arc<RandomMatrix>,
    pub(crate) leaf_first_indices_all: Arc<Vec<Vec<usize>>>,

    pub(crate) tuning: Option<Arc<Tuning>>,
    pub(crate) votes: usize,
    pub(crate) k_tuned: usize,
    pub(crate) recall_level: f64,
}

impl Mrpt {
    //////////////////////
    // Index generation //
    //////////////////////

    /// Create an ungrown index over a dataset
    ///
    /// The matrix is flattened into an internal row-major copy. Call
    /// [`Mrpt::grow`] or [`Mrpt::autotune`] before querying.
    ///
    /// ### Params
    ///
    /// * `data` - Data matrix (rows = samples, columns = dimensions)
    pub fn new(data: MatRef<f32>) -> Self {
        let (flat, n_samples, dim) = matrix_to_flat(data);

        Self {
            data: Arc::new(flat),
            n_samples,
            dim,
            n_trees: 0,
            depth: 0,
            depth_pool: 0,
            density: 1.0,
            n_array: 0,
            split_stride: 0,
            split_points: Arc::new(Vec::new()),
            tree_leaves: Arc::new(Vec::new()),
            random_matrix: Arc::new(RandomMatrix::empty()),
            leaf_first_indices_all: Arc::new(Vec::new()),
            tuning: None,
            votes: 0,
            k_tuned: 0,
            recall_level: -1.0,
        }
    }

    /// Build the index
    ///
    /// Generates the shared random matrix, projects the dataset once per
    /// tree, and grows all trees in parallel. Any previous tuning state is
    /// discarded.
    ///
    /// ### Params
    ///
    /// * `n_trees` - Number of trees (more trees = better recall, slower
    ///   queries)
    /// * `depth` - Tree depth; 2^depth must not exceed the sample count
    /// * `density` - Expected ratio of non-zero entries in the projection
    ///   matrix; 1.0 selects the dense variant
    /// * `seed` - Seed for the random matrix; 0 draws entropy from the OS
    ///
    /// ### Returns
    ///
    /// `Ok(())` once the index is ready for querying
    pub fn grow(&mut self, n_trees: usize, depth: usize, density: f32, seed: u64) -> Result<()> {
        if n_trees == 0 {
            return Err(MrptError::InvalidParameter(
                "n_trees must be positive".into(),
            ));
        }
        if depth == 0 || (1usize << depth) > self.n_samples {
            return Err(MrptError::InvalidParameter(format!(
                "depth must be in [1, log2(n)] = [1, {}]",
                (self.n_samples.max(1)).ilog2()
            )));
        }
        if !(density > 0.0 && density <= 1.0) {
            return Err(MrptError::InvalidParameter(
                "density must be in (0, 1]".into(),
            ));
        }

        let n = self.n_samples;
        let dim = self.dim;

        let random_matrix = Arc::new(RandomMatrix::new(n_trees, depth, dim, density, seed));

        let data = Arc::clone(&self.data);
        let rm = Arc::clone(&random_matrix);

        let trees: Vec<(Vec<f32>, Vec<usize>)> = (0..n_trees)
            .into_par_iter()
            .map(|n_tree| {
                let mut projections = vec![0.0f32; depth * n];
                for level in 0..depth {
                    let row = n_tree * depth + level;
                    for j in 0..n {
                        projections[level * n + j] = rm.row_dot(row, &data[j * dim..(j + 1) * dim]);
                    }
                }
                grow_tree(&projections, n, depth)
            })
            .collect();

        let n_array = 1 << (depth + 1);
        let mut split_points = Vec::with_capacity(n_array * n_trees);
        let mut tree_leaves = Vec::with_capacity(n_trees);
        for (splits, leaves) in trees {
            split_points.extend(splits);
            tree_leaves.push(leaves);
        }

        self.n_trees = n_trees;
        self.depth = depth;
        self.depth_pool = depth;
        self.density = density;
        self.n_array = n_array;
        self.split_stride = n_array;
        self.split_points = Arc::new(split_points);
        self.tree_leaves = Arc::new(tree_leaves);
        self.random_matrix = random_matrix;
        self.leaf_first_indices_all = Arc::new(count_first_leaf_indices_all(n, depth));
        self.tuning = None;
        self.votes = 0;
        self.k_tuned = 0;
        self.recall_level = -1.0;

        Ok(())
    }

    ///////////
    // Query //
    ///////////

    /// Query the index for the k approximate nearest neighbours
    ///
    /// Projects the query once, routes it to one leaf per tree, elects
    /// every data point seen in at least `votes_required` leaves, and runs
    /// the exact distance comparison over the elected set.
    ///
    /// ### Params
    ///
    /// * `q` - Query vector (must match the index dimensionality)
    /// * `k` - Number of neighbours to return
    /// * `votes_required` - Minimum number of trees that must route a point
    ///   next to the query for it to be considered
    ///
    /// ### Returns
    ///
    /// A [`QueryResult`]; when fewer than `k` points are elected the tail
    /// slots hold `-1`
    pub fn query(&self, q: &[f32], k: usize, votes_required: usize) -> QueryResult {
        if self.is_empty() {
            return QueryResult::sentinel(k);
        }
        assert!(
            q.len() == self.dim,
            "query vector has different dimensionality than the index"
        );

        let projected = self.project_for(q);
        let elected = self.vote_with(&projected, votes_required, self.n_trees, self.depth);
        let (indices, distances) = self.exact_knn_on(q, k, &elected);

        QueryResult {
            indices,
            distances,
            n_elected: elected.len(),
        }
    }

    /// Query using a matrix row reference
    ///
    /// Optimised path for contiguous memory (stride == 1), otherwise copies
    /// to a temporary vector.
    pub fn query_row(&self, query_row: RowRef<f32>, k: usize, votes_required: usize) -> QueryResult {
        if query_row.col_stride() == 1 {
            let slice =
                unsafe { std::slice::from_raw_parts(query_row.as_ptr(), query_row.ncols()) };
            return self.query(slice, k, votes_required);
        }

        let query_vec: Vec<f32> = query_row.iter().cloned().collect();
        self.query(&query_vec, k, votes_required)
    }

    /// Query with the parameters chosen by the autotuner
    ///
    /// Usable on an index produced by [`Mrpt::subset`] or pruned with
    /// [`Mrpt::delete_extra_trees`]. Returns sentinels when no operating
    /// point has been selected.
    pub fn query_tuned(&self, q: &[f32]) -> QueryResult {
        if self.recall_level < 0.0 || self.k_tuned == 0 {
            return QueryResult::sentinel(self.k_tuned);
        }
        self.query(q, self.k_tuned, self.votes)
    }

    /// Exact k nearest neighbours over the whole dataset
    ///
    /// Brute force; this is what the autotuner uses as ground truth and
    /// what validation compares against.
    pub fn exact_knn(&self, q: &[f32], k: usize) -> QueryResult {
        let all: Vec<usize> = (0..self.n_samples).collect();
        let (indices, distances) = self.exact_knn_on(q, k, &all);
        QueryResult {
            indices,
            distances,
            n_elected: all.len(),
        }
    }

    /// Project a query through the blocks of the active trees
    ///
    /// The output keeps the `depth_pool` stride, so entry
    /// `tree * depth_pool + d` is the projection onto the tree's level-`d`
    /// vector regardless of the effective depth.
    pub(crate) fn project_for(&self, q: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; self.n_trees * self.depth_pool];
        for n_tree in 0..self.n_trees {
            for d in 0..self.depth {
                let j = n_tree * self.depth_pool + d;
                out[j] = self.random_matrix.row_dot(j, q);
            }
        }
        out
    }

    /// Route a projected query to one leaf per tree and count votes
    ///
    /// Descent runs in parallel over trees (each writes one slot of the
    /// leaf array). Vote accumulation is sequential across trees: the order
    /// in which points first reach `votes_required` defines the election
    /// order, which downstream tie-breaking depends on.
    ///
    /// ### Params
    ///
    /// * `projected` - Projection values with `depth_pool` stride
    /// * `votes_required` - Election threshold
    /// * `n_trees` - Number of trees to use (a prefix of the stored trees)
    /// * `depth` - Depth to descend to
    ///
    /// ### Returns
    ///
    /// The elected data indices in election order
    pub(crate) fn vote_with(
        &self,
        projected: &[f32],
        votes_required: usize,
        n_trees: usize,
        depth: usize,
    ) -> Vec<usize> {
        let found_leaves: Vec<usize> = (0..n_trees)
            .into_par_iter()
            .map(|n_tree| {
                let col = n_tree * self.split_stride;
                let mut idx = 0usize;
                for d in 0..depth {
                    let j = n_tree * self.depth_pool + d;
                    idx = if projected[j] <= self.split_points[col + idx] {
                        2 * idx + 1
                    } else {
                        2 * idx + 2
                    };
                }
                idx + 1 - (1 << depth)
            })
            .collect();

        let leaf_first_indices = &self.leaf_first_indices_all[depth];
        let max_leaf_size = self.n_samples / (1 << depth) + 1;

        let mut votes = vec![0u32; self.n_samples];
        let mut elected = Vec::with_capacity(n_trees * max_leaf_size);

        for n_tree in 0..n_trees {
            let leaf = found_leaves[n_tree];
            let begin = leaf_first_indices[leaf];
            let end = leaf_first_indices[leaf + 1];
            for &idx in &self.tree_leaves[n_tree][begin..end] {
                votes[idx] += 1;
                if votes[idx] as usize == votes_required {
                    elected.push(idx);
                }
            }
        }

        elected
    }

    /// Exact search over a candidate set
    ///
    /// Computes squared distances to every candidate, takes the k smallest
    /// (single min-reduce for k == 1, stable distance sort otherwise so
    /// ties keep election order), and reports square-rooted distances.
    /// Unfilled slots hold `-1` / `-1.0`.
    pub(crate) fn exact_knn_on(
        &self,
        q: &[f32],
        k: usize,
        elected: &[usize],
    ) -> (Vec<i32>, Vec<f32>) {
        if elected.is_empty() {
            return (vec![-1; k], vec![-1.0; k]);
        }

        let dim = self.dim;
        let distances: Vec<f32> = elected
            .iter()
            .map(|&i| squared_euclidean(q, &self.data[i * dim..(i + 1) * dim]))
            .collect();

        if k == 1 {
            let mut best = 0usize;
            for i in 1..distances.len() {
                if distances[i] < distances[best] {
                    best = i;
                }
            }
            return (vec![elected[best] as i32], vec![distances[best].sqrt()]);
        }

        let mut order: Vec<usize> = (0..elected.len()).collect();
        order.sort_by(|&a, &b| {
            distances[a]
                .partial_cmp(&distances[b])
                .unwrap_or(Ordering::Equal)
        });

        let mut out = vec![-1i32; k];
        let mut out_distances = vec![-1.0f32; k];
        for i in 0..k.min(elected.len()) {
            out[i] = elected[order[i]] as i32;
            out_distances[i] = distances[order[i]].sqrt();
        }

        (out, out_distances)
    }

    ////////////////
    // Validation //
    ////////////////

    /// Measured recall@k over a random sample of dataset points
    ///
    /// The estimates coming out of the autotuner are predictions; this
    /// measures. A sample of the indexed points is queried against the
    /// index itself and scored against the exhaustive ground truth, the
    /// same comparison the autotuner performs on its held-out query set.
    /// Aggregated as total hits over `k * sample`, so every query weighs
    /// equally regardless of how many of its slots were filled.
    ///
    /// ### Params
    ///
    /// * `k` - Number of neighbours
    /// * `votes_required` - Election threshold to validate with
    /// * `seed` - Seed for the sample choice
    /// * `sample` - Optional sample size; defaults to `1000` or n,
    ///   whichever is smaller
    ///
    /// ### Returns
    ///
    /// Measured recall@k in [0, 1]
    pub fn validate(&self, k: usize, votes_required: usize, seed: u64, sample: Option<usize>) -> f64 {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let sample = sample.unwrap_or(1000).min(self.n_samples);
        if sample == 0 || k == 0 {
            return 0.0;
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let sampled: Vec<usize> = (0..sample)
            .map(|_| rng.random_range(0..self.n_samples))
            .collect();

        let hits: usize = sampled
            .into_par_iter()
            .map(|point| {
                let q = &self.data[point * self.dim..(point + 1) * self.dim];

                let truth: FxHashSet<i32> = self
                    .exact_knn(q, k)
                    .indices
                    .into_iter()
                    .filter(|&idx| idx >= 0)
                    .collect();

                self.query(q, k, votes_required)
                    .indices
                    .into_iter()
                    .filter(|idx| truth.contains(idx))
                    .count()
            })
            .sum();

        hits as f64 / (k * sample) as f64
    }

    ////////////////////////
    // Pruned projections //
    ////////////////////////

    /// The cheapest tuned operating point meeting a target recall
    ///
    /// Only available after [`Mrpt::autotune`].
    pub fn optimal_parameters(&self, target_recall: f64) -> Option<Parameters> {
        self.tuning
            .as_ref()
            .and_then(|t| t.optimal_parameters(target_recall))
    }

    /// The full Pareto frontier of tuned operating points
    pub fn optimal_parameter_list(&self) -> Vec<Parameters> {
        self.tuning
            .as_ref()
            .map(|t| t.pareto().to_vec())
            .unwrap_or_default()
    }

    /// Project the index onto the operating point for a target recall
    ///
    /// The returned index shares every large buffer with its parent - it
    /// only narrows the effective tree count, depth, and vote threshold.
    /// When the target cannot be met the returned index is empty and its
    /// queries yield sentinels.
    ///
    /// ### Params
    ///
    /// * `target_recall` - Desired recall in [0, 1]
    ///
    /// ### Returns
    ///
    /// The pruned index
    pub fn subset(&self, target_recall: f64) -> Mrpt {
        let mut out = Mrpt {
            data: Arc::clone(&self.data),
            n_samples: self.n_samples,
            dim: self.dim,
            n_trees: 0,
            depth: 0,
            depth_pool: self.depth_pool,
            density: self.density,
            n_array: 0,
            split_stride: self.split_stride,
            split_points: Arc::clone(&self.split_points),
            tree_leaves: Arc::clone(&self.tree_leaves),
            random_matrix: Arc::clone(&self.random_matrix),
            leaf_first_indices_all: Arc::clone(&self.leaf_first_indices_all),
            tuning: self.tuning.clone(),
            votes: 0,
            k_tuned: self.k_tuned,
            recall_level: target_recall,
        };

        if let Some(par) = self.optimal_parameters(target_recall) {
            out.n_trees = par.n_trees;
            out.depth = par.depth;
            out.votes = par.votes;
            out.n_array = 1 << (par.depth + 1);
        }

        out
    }

    /// Prune this index in place to the operating point for a target recall
    ///
    /// The in-place counterpart of [`Mrpt::subset`]. When the target cannot
    /// be met the index is left untouched apart from the recorded target.
    pub fn delete_extra_trees(&mut self, target_recall: f64) {
        self.recall_level = target_recall;

        let Some(par) = self.optimal_parameters(target_recall) else {
            return;
        };

        self.n_trees = par.n_trees;
        self.depth = par.depth;
        self.votes = par.votes;
        self.n_array = 1 << (par.depth + 1);
    }

    /////////////////
    // Persistence //
    /////////////////

    /// Save the index to a file
    ///
    /// Writes the header, the split-point columns of the active trees, the
    /// per-tree leaf permutations, and the random-matrix rows the traversal
    /// uses (re-packed when the index is a pruned projection). The file
    /// handle is scoped to the call.
    ///
    /// ### Params
    ///
    /// * `path` - Filepath of the output file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);

        w.write_all(&(self.n_trees as i32).to_ne_bytes())?;
        w.write_all(&(self.depth as i32).to_ne_bytes())?;
        w.write_all(&self.density.to_ne_bytes())?;

        for n_tree in 0..self.n_trees {
            let col = n_tree * self.split_stride;
            w.write_all(bytemuck::cast_slice(
                &self.split_points[col..col + self.n_array],
            ))?;
        }

        for n_tree in 0..self.n_trees {
            let leaves = &self.tree_leaves[n_tree];
            w.write_all(&(leaves.len() as i32).to_ne_bytes())?;
            let as_i32: Vec<i32> = leaves.iter().map(|&idx| idx as i32).collect();
            w.write_all(bytemuck::cast_slice(&as_i32))?;
        }

        self.random_matrix
            .write_rows(&mut w, self.n_trees, self.depth, self.depth_pool)?;

        w.flush()?;
        Ok(())
    }

    /// Load an index for a dataset from a file
    ///
    /// A constructor: nothing is mutated on failure. The dataset must be
    /// the one the saved index was grown on.
    ///
    /// ### Params
    ///
    /// * `data` - Data matrix (rows = samples, columns = dimensions)
    /// * `path` - Filepath of a file produced by [`Mrpt::save`]
    ///
    /// ### Returns
    ///
    /// The loaded index, or `Io` / `CorruptIndex` on failure
    pub fn load(data: MatRef<f32>, path: impl AsRef<Path>) -> Result<Mrpt> {
        let file = File::open(path)?;
        let mut r = BufReader::new(file);

        let n_trees = read_i32(&mut r)?;
        let depth = read_i32(&mut r)?;
        let density = read_f32(&mut r)?;

        if n_trees < 0 || depth < 0 || (n_trees > 0 && depth == 0) {
            return Err(MrptError::CorruptIndex(format!(
                "implausible header: n_trees = {n_trees}, depth = {depth}"
            )));
        }
        if !(density > 0.0 && density <= 1.0) {
            return Err(MrptError::CorruptIndex(format!(
                "density {density} outside (0, 1]"
            )));
        }

        let n_trees = n_trees as usize;
        let depth = depth as usize;

        let mut index = Mrpt::new(data);
        if n_trees == 0 {
            return Ok(index);
        }

        let n_array = 1usize << (depth + 1);
        let n_pool = n_trees * depth;

        let split_points = read_f32_vec(&mut r, n_array * n_trees)?;

        let mut tree_leaves = Vec::with_capacity(n_trees);
        for _ in 0..n_trees {
            let sz = read_i32(&mut r)?;
            if sz as usize != index.n_samples {
                return Err(MrptError::CorruptIndex(format!(
                    "tree holds {sz} leaf indices, dataset has {}",
                    index.n_samples
                )));
            }
            let raw = read_i32_vec(&mut r, sz as usize)?;
            let mut leaves = Vec::with_capacity(raw.len());
            for idx in raw {
                if idx < 0 || idx as usize >= index.n_samples {
                    return Err(MrptError::CorruptIndex(format!(
                        "leaf index {idx} out of range"
                    )));
                }
                leaves.push(idx as usize);
            }
            tree_leaves.push(leaves);
        }

        let random_matrix =
            RandomMatrix::read_rows(&mut r, n_pool, index.dim, density < 1.0)?;

        index.n_trees = n_trees;
        index.depth = depth;
        index.depth_pool = depth;
        index.density = density;
        index.n_array = n_array;
        index.split_stride = n_array;
        index.split_points = Arc::new(split_points);
        index.tree_leaves = Arc::new(tree_leaves);
        index.random_matrix = Arc::new(random_matrix);
        index.leaf_first_indices_all =
            Arc::new(count_first_leaf_indices_all(index.n_samples, depth));

        Ok(index)
    }

    ///////////////
    // Accessors //
    ///////////////

    /// Number of trees in the index
    pub fn n_trees(&self) -> usize {
        self.n_trees
    }

    /// Depth of the trees
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Vote threshold chosen by the autotuner (0 when none is set)
    pub fn votes(&self) -> usize {
        self.votes
    }

    /// Whether the index can serve queries
    pub fn is_empty(&self) -> bool {
        self.n_trees == 0
    }

    /// Number of points in the dataset
    pub fn n_points(&self) -> usize {
        self.n_samples
    }

    /// Dimensionality of the dataset
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Density the random matrix was generated with
    pub fn density(&self) -> f32 {
        self.density
    }

    /// Split threshold of a heap node (for testing purposes)
    pub fn split_point(&self, tree: usize, node: usize) -> f32 {
        self.split_points[tree * self.split_stride + node]
    }

    /// Number of points in a leaf of a tree (for testing purposes)
    pub fn leaf_size(&self, leaf: usize) -> usize {
        let firsts = &self.leaf_first_indices_all[self.depth];
        firsts[leaf + 1] - firsts[leaf]
    }

    /// A data point stored in a leaf of a tree (for testing purposes)
    pub fn leaf_point(&self, tree: usize, leaf: usize, i: usize) -> usize {
        let firsts = &self.leaf_first_indices_all[self.depth];
        self.tree_leaves[tree][firsts[leaf] + i]
    }
}

///////////
// Tests //
///////////
