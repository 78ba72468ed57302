//! Autotuning: estimated recall and query time for every feasible
//! operating point of a grown index.
//!
//! A single growth at the maximum tree count and depth is enough to derive,
//! for every triple `(n_trees, depth, votes)`, an estimated recall (by
//! replaying vote counting against exhaustive ground truth on a held-out
//! query set) and an estimated query time (from the fitted
//! [`QueryTimeModel`](crate::profiler::QueryTimeModel)). The triples are
//! sorted by estimated time and reduced to the Pareto frontier, from which
//! the cheapest configuration meeting a target recall is looked up.

use faer::MatRef;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{MrptError, Result};
use crate::index::Mrpt;
use crate::profiler::QueryTimeModel;
use crate::utils::matrix_to_flat;

/// One operating point of the index
///
/// ### Fields
///
/// * `n_trees` - Number of trees to use
/// * `depth` - Depth to descend to
/// * `votes` - Vote threshold for candidate election
/// * `estimated_qtime` - Predicted query time in seconds
/// * `estimated_recall` - Predicted recall@k
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Parameters {
    pub n_trees: usize,
    pub depth: usize,
    pub votes: usize,
    pub estimated_qtime: f64,
    pub estimated_recall: f64,
}

/// Tuning artefacts retained after [`Mrpt::autotune`]
///
/// Holds the aggregated recall and candidate-set-size estimates (one
/// `votes_max x trees_max` accumulator per considered depth), the fitted
/// query-time model, and the Pareto frontier of operating points.
pub struct Tuning {
    pub(crate) depth_min: usize,
    pub(crate) votes_max: usize,
    pub(crate) trees_max: usize,
    pub(crate) k: usize,
    recalls: Vec<Vec<f64>>,
    cs_sizes: Vec<Vec<f64>>,
    time_model: QueryTimeModel,
    pareto: Vec<Parameters>,
}

impl Tuning {
    /// Estimated recall for an operating point
    ///
    /// ### Params
    ///
    /// * `n_trees` - Tree count in [1, trees_max]
    /// * `depth` - Depth in [depth_min, depth_max]
    /// * `votes` - Vote threshold in [1, votes_max]
    pub fn recall(&self, n_trees: usize, depth: usize, votes: usize) -> f64 {
        self.recalls[depth - self.depth_min][(n_trees - 1) * self.votes_max + (votes - 1)]
    }

    /// Estimated candidate-set size for an operating point
    pub fn candidate_set_size(&self, n_trees: usize, depth: usize, votes: usize) -> f64 {
        self.cs_sizes[depth - self.depth_min][(n_trees - 1) * self.votes_max + (votes - 1)]
    }

    /// Estimated query time in seconds for an operating point
    pub fn query_time(&self, n_trees: usize, depth: usize, votes: usize) -> f64 {
        self.time_model.projection_time(n_trees, depth)
            + self.time_model.voting_time(n_trees, depth, votes)
            + self
                .time_model
                .exact_time(self.candidate_set_size(n_trees, depth, votes))
    }

    /// The Pareto frontier, sorted by estimated query time ascending
    pub fn pareto(&self) -> &[Parameters] {
        &self.pareto
    }

    /// Cheapest frontier entry whose estimated recall meets the target
    ///
    /// A small slack (1e-4) absorbs floating-point noise around the target.
    /// `None` means the target is unreachable with this index.
    pub fn optimal_parameters(&self, target_recall: f64) -> Option<Parameters> {
        let tr = target_recall - 0.0001;
        self.pareto
            .iter()
            .find(|par| par.estimated_recall > tr)
            .copied()
    }
}

impl Mrpt {
    /// Grow the index at its maximum size and derive the tuning artefacts
    ///
    /// Builds the index with `trees_max` trees at `depth_max`, computes the
    /// exhaustive k nearest neighbours of every test query as ground truth,
    /// replays vote counting at every considered depth to estimate recall
    /// and candidate-set sizes, fits the query-time model, and fills the
    /// Pareto frontier. Afterwards [`Mrpt::subset`],
    /// [`Mrpt::delete_extra_trees`], and [`Mrpt::optimal_parameters`]
    /// are available.
    ///
    /// ### Params
    ///
    /// * `queries` - Held-out test queries (rows = queries), not part of
    ///   the indexed data
    /// * `k` - Number of neighbours the tuning targets
    /// * `trees_max` - Largest tree count to consider
    /// * `depth_min` - Smallest depth to consider
    /// * `depth_max` - Largest depth to consider (the depth grown to)
    /// * `votes_max` - Largest vote threshold to consider
    /// * `density` - Random matrix density
    /// * `seed` - Random matrix seed; 0 draws entropy from the OS
    ///
    /// ### Returns
    ///
    /// `Ok(())` with the tuning retained on the index
    #[allow(clippy::too_many_arguments)]
    pub fn autotune(
        &mut self,
        queries: MatRef<f32>,
        k: usize,
        trees_max: usize,
        depth_min: usize,
        depth_max: usize,
        votes_max: usize,
        density: f32,
        seed: u64,
    ) -> Result<()> {
        if queries.ncols() != self.dim {
            return Err(MrptError::InvalidParameter(format!(
                "query dimensionality {} does not match data dimensionality {}",
                queries.ncols(),
                self.dim
            )));
        }
        if queries.nrows() == 0 {
            return Err(MrptError::InvalidParameter(
                "autotuning needs at least one test query".into(),
            ));
        }
        if k == 0 || k > self.n_samples {
            return Err(MrptError::InvalidParameter(format!(
                "k must be in [1, {}]",
                self.n_samples
            )));
        }
        if depth_min == 0 || depth_min > depth_max {
            return Err(MrptError::InvalidParameter(
                "depth_min must be in [1, depth_max]".into(),
            ));
        }
        if votes_max == 0 {
            return Err(MrptError::InvalidParameter(
                "votes_max must be positive".into(),
            ));
        }

        self.grow(trees_max, depth_max, density, seed)?;

        let (q_flat, n_test, dim) = matrix_to_flat(queries);
        let index: &Mrpt = self;

        // Exhaustive ground truth per test query
        let exact: Vec<FxHashSet<usize>> = (0..n_test)
            .into_par_iter()
            .map(|i| {
                let q = &q_flat[i * dim..(i + 1) * dim];
                index
                    .exact_knn(q, k)
                    .indices
                    .iter()
                    .filter(|&&idx| idx >= 0)
                    .map(|&idx| idx as usize)
                    .collect()
            })
            .collect();

        // Vote-count replays, aggregated over the test set
        let n_depths = depth_max - depth_min + 1;
        let cells = trees_max * votes_max;
        let zeros = || {
            (
                vec![vec![0.0f64; cells]; n_depths],
                vec![vec![0.0f64; cells]; n_depths],
            )
        };

        let (mut recalls, mut cs_sizes) = (0..n_test)
            .into_par_iter()
            .map(|i| {
                let q = &q_flat[i * dim..(i + 1) * dim];
                count_elected(index, q, &exact[i], depth_min, votes_max)
            })
            .reduce(zeros, |mut acc, item| {
                for d in 0..n_depths {
                    for (a, b) in acc.0[d].iter_mut().zip(&item.0[d]) {
                        *a += b;
                    }
                    for (a, b) in acc.1[d].iter_mut().zip(&item.1[d]) {
                        *a += b;
                    }
                }
                acc
            });

        for d in 0..n_depths {
            for value in recalls[d].iter_mut() {
                *value /= (k * n_test) as f64;
            }
            for value in cs_sizes[d].iter_mut() {
                *value /= n_test as f64;
            }
        }

        let time_model = QueryTimeModel::fit(index, &q_flat, n_test, k, depth_min, votes_max);

        let mut tuning = Tuning {
            depth_min,
            votes_max,
            trees_max,
            k,
            recalls,
            cs_sizes,
            time_model,
            pareto: Vec::new(),
        };
        tuning.pareto = pareto_frontier(&tuning);

        let tuning = Arc::new(tuning);
        self.k_tuned = tuning.k;
        self.tuning = Some(tuning);

        Ok(())
    }

    /// Autotune and immediately prune to a target recall
    ///
    /// Convenience wrapper combining [`Mrpt::autotune`] and
    /// [`Mrpt::delete_extra_trees`].
    #[allow(clippy::too_many_arguments)]
    pub fn autotune_to_recall(
        &mut self,
        target_recall: f64,
        queries: MatRef<f32>,
        k: usize,
        trees_max: usize,
        depth_min: usize,
        depth_max: usize,
        votes_max: usize,
        density: f32,
        seed: u64,
    ) -> Result<()> {
        self.autotune(
            queries, k, trees_max, depth_min, depth_max, votes_max, density, seed,
        )?;
        self.delete_extra_trees(target_recall);
        Ok(())
    }
}

/// Replay vote counting for one test query at every considered depth
///
/// Descends every tree once to full depth, remembering the leaf the query
/// would have landed in had each depth in `[depth_min, depth]` been final.
/// Then, per depth, walks the trees in order: after tree `t` the
/// accumulator column `t` holds, per vote threshold `v`, the number of
/// points that have reached `v` votes (and how many of them are true
/// neighbours). Columns are carried forward so the counts are cumulative in
/// the tree prefix. Vote accumulation is sequential by contract.
///
/// ### Returns
///
/// Per depth, `(recall_counts, candidate_counts)` accumulators indexed
/// `(n_tree * votes_max + v - 1)`
fn count_elected(
    index: &Mrpt,
    q: &[f32],
    exact: &FxHashSet<usize>,
    depth_min: usize,
    votes_max: usize,
) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
    let depth_max = index.depth;
    let n_trees = index.n_trees;

    let projected = index.project_for(q);

    let start_indices: Vec<Vec<usize>> = (0..n_trees)
        .into_par_iter()
        .map(|n_tree| {
            let col = n_tree * index.split_stride;
            let mut found = vec![0usize; depth_max - depth_min + 1];
            let mut idx = 0usize;
            for d in 0..depth_max {
                let j = n_tree * index.depth_pool + d;
                idx = if projected[j] <= index.split_points[col + idx] {
                    2 * idx + 1
                } else {
                    2 * idx + 2
                };
                let level = d + 1;
                if level >= depth_min {
                    found[level - depth_min] = idx + 1 - (1 << level);
                }
            }
            found
        })
        .collect();

    let n_depths = depth_max - depth_min + 1;
    let mut recalls = Vec::with_capacity(n_depths);
    let mut cs_sizes = Vec::with_capacity(n_depths);

    for depth_crnt in depth_min..=depth_max {
        let leaf_first_indices = &index.leaf_first_indices_all[depth_crnt];
        let mut votes = vec![0u32; index.n_samples];
        let mut recall = vec![0.0f64; n_trees * votes_max];
        let mut cs_size = vec![0.0f64; n_trees * votes_max];

        for n_tree in 0..n_trees {
            if n_tree > 0 {
                let (done, current) = recall.split_at_mut(n_tree * votes_max);
                current[..votes_max].copy_from_slice(&done[(n_tree - 1) * votes_max..]);
                let (done, current) = cs_size.split_at_mut(n_tree * votes_max);
                current[..votes_max].copy_from_slice(&done[(n_tree - 1) * votes_max..]);
            }

            let leaf = start_indices[n_tree][depth_crnt - depth_min];
            let begin = leaf_first_indices[leaf];
            let end = leaf_first_indices[leaf + 1];
            for &idx in &index.tree_leaves[n_tree][begin..end] {
                votes[idx] += 1;
                let v = votes[idx] as usize;
                if v <= votes_max {
                    cs_size[n_tree * votes_max + v - 1] += 1.0;
                    if exact.contains(&idx) {
                        recall[n_tree * votes_max + v - 1] += 1.0;
                    }
                }
            }
        }

        recalls.push(recall);
        cs_sizes.push(cs_size);
    }

    (recalls, cs_sizes)
}

/// All feasible operating points sorted by estimated query time, reduced to
/// the subsequence of strictly increasing estimated recall
fn pareto_frontier(tuning: &Tuning) -> Vec<Parameters> {
    let depth_min = tuning.depth_min;
    let depth_max = tuning.depth_min + tuning.recalls.len() - 1;
    let trees_max = tuning.trees_max;
    let votes_max = tuning.votes_max;

    let mut all = Vec::with_capacity((depth_max - depth_min + 1) * trees_max * votes_max);

    for depth in depth_min..=depth_max {
        for n_trees in 1..=trees_max {
            for votes in 1..=votes_max.min(n_trees) {
                all.push(Parameters {
                    n_trees,
                    depth,
                    votes,
                    estimated_qtime: tuning.query_time(n_trees, depth, votes),
                    estimated_recall: tuning.recall(n_trees, depth, votes),
                });
            }
        }
    }

    all.sort_by(|a, b| {
        a.estimated_qtime
            .partial_cmp(&b.estimated_qtime)
            .unwrap_or(Ordering::Equal)
    });

    let mut frontier = Vec::new();
    let mut best_recall = -1.0;
    for par in all {
        if par.estimated_recall > best_recall {
            best_recall = par.estimated_recall;
            frontier.push(par);
        }
    }

    frontier
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::generate_clustered_data;
    use approx::assert_relative_eq;
    use faer::Mat;

    fn tuned_index() -> (Mrpt, Mat<f32>, Mat<f32>) {
        let data: Mat<f32> = generate_clustered_data(500, 8, 6, 0.8, 42);
        let queries: Mat<f32> = generate_clustered_data(30, 8, 6, 0.8, 43);

        let mut index = Mrpt::new(data.as_ref());
        index
            .autotune(queries.as_ref(), 5, 8, 2, 5, 4, 1.0, 1234)
            .unwrap();

        (index, data, queries)
    }

    #[test]
    fn test_autotune_rejects_bad_parameters() {
        let data: Mat<f32> = generate_clustered_data(100, 4, 3, 1.0, 1);
        let queries: Mat<f32> = generate_clustered_data(10, 4, 3, 1.0, 2);
        let wrong_dim: Mat<f32> = generate_clustered_data(10, 5, 3, 1.0, 2);

        let mut index = Mrpt::new(data.as_ref());
        assert!(index
            .autotune(wrong_dim.as_ref(), 5, 4, 2, 4, 3, 1.0, 7)
            .is_err());
        assert!(index
            .autotune(queries.as_ref(), 0, 4, 2, 4, 3, 1.0, 7)
            .is_err());
        assert!(index
            .autotune(queries.as_ref(), 101, 4, 2, 4, 3, 1.0, 7)
            .is_err());
        assert!(index
            .autotune(queries.as_ref(), 5, 4, 5, 4, 3, 1.0, 7)
            .is_err());
        assert!(index
            .autotune(queries.as_ref(), 5, 4, 2, 4, 0, 1.0, 7)
            .is_err());
    }

    #[test]
    fn test_pareto_frontier_monotone() {
        let (index, _, _) = tuned_index();
        let frontier = index.optimal_parameter_list();

        assert!(!frontier.is_empty());
        for pair in frontier.windows(2) {
            assert!(pair[0].estimated_qtime <= pair[1].estimated_qtime);
            assert!(pair[0].estimated_recall < pair[1].estimated_recall);
        }
    }

    #[test]
    fn test_optimal_parameters_lookup() {
        let (index, _, _) = tuned_index();
        let frontier = index.optimal_parameter_list();

        // Target 0 always matches the first frontier entry
        let first = index.optimal_parameters(0.0).unwrap();
        assert_eq!(first, frontier[0]);

        // An impossible target yields no parameters
        assert!(index.optimal_parameters(1.01).is_none());

        // A cheaper target never costs more than a stricter one
        if let (Some(loose), Some(strict)) = (
            index.optimal_parameters(0.3),
            index.optimal_parameters(0.8),
        ) {
            assert!(loose.estimated_qtime <= strict.estimated_qtime);
            assert!(loose.estimated_recall <= strict.estimated_recall);
        }
    }

    #[test]
    fn test_recall_estimates_match_vote_replay() {
        // The aggregated estimates must agree exactly with running the vote
        // routine per query and intersecting with the ground truth.
        let (index, _, queries) = tuned_index();
        let tuning = index.tuning.as_ref().unwrap();
        let k = 5;
        let n_test = queries.nrows();

        for &(t, d, v) in &[(8usize, 5usize, 1usize), (4, 3, 2), (6, 4, 3)] {
            let mut recall_count = 0usize;
            let mut cs_count = 0usize;

            for i in 0..n_test {
                let q: Vec<f32> = (0..queries.ncols()).map(|j| queries[(i, j)]).collect();
                let exact: FxHashSet<usize> = index
                    .exact_knn(&q, k)
                    .indices
                    .iter()
                    .filter(|&&idx| idx >= 0)
                    .map(|&idx| idx as usize)
                    .collect();

                let projected = index.project_for(&q);
                let elected = index.vote_with(&projected, v, t, d);

                cs_count += elected.len();
                recall_count += elected.iter().filter(|&idx| exact.contains(idx)).count();
            }

            assert_relative_eq!(
                tuning.recall(t, d, v),
                recall_count as f64 / (k * n_test) as f64,
                epsilon = 1e-9
            );
            assert_relative_eq!(
                tuning.candidate_set_size(t, d, v),
                cs_count as f64 / n_test as f64,
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_subset_matches_fresh_grow() {
        // A pruned projection must answer queries identically to an index
        // freshly grown with the chosen parameters and the same seed.
        let (index, data, queries) = tuned_index();

        let par = index.optimal_parameters(0.2).unwrap();
        let pruned = index.subset(0.2);
        assert_eq!(pruned.n_trees(), par.n_trees);
        assert_eq!(pruned.depth(), par.depth);
        assert_eq!(pruned.votes(), par.votes);

        let mut fresh = Mrpt::new(data.as_ref());
        fresh.grow(par.n_trees, par.depth, 1.0, 1234).unwrap();

        for i in 0..queries.nrows() {
            let q: Vec<f32> = (0..queries.ncols()).map(|j| queries[(i, j)]).collect();
            let a = pruned.query(&q, 5, par.votes);
            let b = fresh.query(&q, 5, par.votes);
            assert_eq!(a.indices, b.indices);
            assert_eq!(a.distances, b.distances);
        }
    }

    #[test]
    fn test_subset_shares_storage() {
        let (index, _, _) = tuned_index();
        let pruned = index.subset(0.2);

        assert!(Arc::ptr_eq(&index.data, &pruned.data));
        assert!(Arc::ptr_eq(&index.split_points, &pruned.split_points));
        assert!(Arc::ptr_eq(&index.tree_leaves, &pruned.tree_leaves));
        assert!(Arc::ptr_eq(&index.random_matrix, &pruned.random_matrix));
    }

    #[test]
    fn test_delete_extra_trees_matches_subset() {
        let (index, _, _) = tuned_index();

        let pruned = index.subset(0.3);

        let mut in_place = index;
        in_place.delete_extra_trees(0.3);

        assert_eq!(in_place.n_trees(), pruned.n_trees());
        assert_eq!(in_place.depth(), pruned.depth());
        assert_eq!(in_place.votes(), pruned.votes());
    }

    #[test]
    fn test_query_tuned_after_subset() {
        let (index, _, queries) = tuned_index();
        let pruned = index.subset(0.2);

        let q: Vec<f32> = (0..queries.ncols()).map(|j| queries[(0, j)]).collect();
        let tuned = pruned.query_tuned(&q);
        let explicit = pruned.query(&q, 5, pruned.votes());
        assert_eq!(tuned, explicit);

        // The unpruned parent has no vote threshold selected
        let parent = index.query_tuned(&q);
        assert_eq!(parent.n_elected, 0);
    }

    #[test]
    fn test_unreachable_target_gives_empty_index() {
        let (index, _, queries) = tuned_index();
        let pruned = index.subset(1.01);

        assert!(pruned.is_empty());
        let q: Vec<f32> = (0..queries.ncols()).map(|j| queries[(0, j)]).collect();
        assert_eq!(pruned.query(&q, 3, 1).indices, vec![-1, -1, -1]);
    }

    #[test]
    fn test_recall_improves_with_more_trees() {
        let (index, _, _) = tuned_index();
        let tuning = index.tuning.as_ref().unwrap();

        // At fixed depth and vote threshold, more trees can only widen the
        // candidate set, so the estimated recall is non-decreasing.
        for t in 1..8 {
            assert!(tuning.recall(t + 1, 4, 1) + 1e-12 >= tuning.recall(t, 4, 1));
            assert!(
                tuning.candidate_set_size(t + 1, 4, 1) + 1e-12
                    >= tuning.candidate_set_size(t, 4, 1)
            );
        }
    }
}
