//! Query-time profiling and robust regression.
//!
//! The autotuner needs to predict, for every candidate operating point
//! `(n_trees, depth, votes)`, how long a query would take. Query time
//! decomposes into projection (linear in the number of random vectors),
//! voting (linear in the tree count, with the vote threshold bucketed), and
//! exact search (linear in the candidate-set size). Each component is timed
//! at representative grid points and fitted with a Theil-Sen regression,
//! which shrugs off the occasional scheduling spike that would wreck a
//! least-squares fit.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::hint::black_box;
use std::time::Instant;

use crate::index::Mrpt;
use crate::random_matrix::RandomMatrix;

/// Fit a line with the Theil-Sen estimator
///
/// The slope is the median of the pairwise slopes over all pairs with
/// distinct x values; the intercept is the median residual under that
/// slope. Degenerate inputs (no two distinct x values) fit a horizontal
/// line through the median y.
///
/// ### Params
///
/// * `x` - Sample x values
/// * `y` - Sample y values (same length)
///
/// ### Returns
///
/// Tuple of `(intercept, slope)`
pub fn fit_theil_sen(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len();
    if n == 0 {
        return (0.0, 0.0);
    }

    let mut slopes = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            if i != j && x[i] != x[j] {
                slopes.push((y[j] - y[i]) / (x[j] - x[i]));
            }
        }
    }

    let slope = if slopes.is_empty() {
        0.0
    } else {
        median(&mut slopes)
    };

    let mut residuals: Vec<f64> = (0..n).map(|i| y[i] - slope * x[i]).collect();
    let intercept = median(&mut residuals);

    (intercept, slope)
}

/// Evaluate a Theil-Sen fit at x
#[inline]
pub fn predict_theil_sen(x: f64, beta: (f64, f64)) -> f64 {
    beta.0 + beta.1 * x
}

fn median(values: &mut [f64]) -> f64 {
    let mid = values.len() / 2;
    values.select_nth_unstable_by(mid, |a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });
    values[mid]
}

//////////////////////
// Query time model //
//////////////////////

/// Fitted query-time model of a grown index
///
/// ### Fields
///
/// * `beta_projection` - Fit of projection time against the number of
///   random vectors `n_trees * depth`
/// * `beta_voting` - Per depth (offset by `depth_min`), a map from vote
///   threshold bucket to a fit of voting time against the tree count
/// * `beta_exact` - Fit of exact-search time against the candidate-set size
pub struct QueryTimeModel {
    pub(crate) beta_projection: (f64, f64),
    pub(crate) beta_voting: Vec<BTreeMap<usize, (f64, f64)>>,
    pub(crate) beta_exact: (f64, f64),
    pub(crate) depth_min: usize,
}

impl QueryTimeModel {
    /// Measure a grown index and fit the three component models
    ///
    /// Projection is timed on freshly generated matrices of `t * d` random
    /// vectors; voting on replays of the vote routine for tree prefixes and
    /// reduced depths; exact search on random candidate subsets of graded
    /// sizes, averaged over 100 repetitions each.
    ///
    /// ### Params
    ///
    /// * `index` - The grown index (at maximum tree count and depth)
    /// * `queries` - Flattened row-major test queries
    /// * `n_test` - Number of test queries
    /// * `k` - Neighbour count the tuning targets
    /// * `depth_min` - Smallest depth the autotuner will consider
    /// * `votes_max` - Largest vote threshold the autotuner will consider
    ///
    /// ### Returns
    ///
    /// The fitted model
    pub(crate) fn fit(
        index: &Mrpt,
        queries: &[f32],
        n_test: usize,
        k: usize,
        depth_min: usize,
        votes_max: usize,
    ) -> Self {
        let trees_max = index.n_trees;
        let depth_max = index.depth;
        let dim = index.dim;
        let n_samples = index.n_samples;

        let mut rng = StdRng::from_os_rng();

        let mut tested_trees: Vec<usize> = vec![1, 2, 3, 4, 5, 7, 10, 15, 20, 25, 30, 40, 50];
        let n_tested_trees = trees_max.min(10);
        let incr = (trees_max / n_tested_trees).max(1);
        for i in 1..=n_tested_trees {
            tested_trees.push(i * incr);
        }
        tested_trees.retain(|&t| t <= trees_max);
        tested_trees.sort_unstable();
        tested_trees.dedup();

        // Projection: fresh matrices of t * d random vectors
        let q0 = &queries[..dim];
        let mut projection_x = Vec::new();
        let mut projection_times = Vec::new();
        for d in depth_min..=depth_max {
            for &t in &tested_trees {
                let scratch = RandomMatrix::new(t, d, dim, index.density, 0);

                let start = Instant::now();
                let projected = scratch.project(q0);
                let elapsed = start.elapsed().as_secs_f64();
                black_box(projected);

                projection_x.push((t * d) as f64);
                projection_times.push(elapsed);
            }
        }
        let beta_projection = fit_theil_sen(&projection_x, &projection_times);

        // Voting thresholds: always the smallest few, then coarser steps
        let mut vote_thresholds: Vec<usize> = (1..=5).collect();
        let n_votes = votes_max.min(5);
        let inc = (votes_max / n_votes).max(1);
        for i in 1..=n_votes {
            if i * inc > 5 {
                vote_thresholds.push(i * inc);
            }
        }

        let mut beta_voting = Vec::with_capacity(depth_max - depth_min + 1);
        for d in depth_min..=depth_max {
            let mut beta = BTreeMap::new();
            for &v in &vote_thresholds {
                let mut voting_x = Vec::new();
                let mut voting_times = Vec::new();

                for &t in &tested_trees {
                    let ri = rng.random_range(0..n_test);
                    let q = &queries[ri * dim..(ri + 1) * dim];
                    let projected = index.project_for(q);

                    let start = Instant::now();
                    let elected = index.vote_with(&projected, v, t, d);
                    let elapsed = start.elapsed().as_secs_f64();
                    black_box(elected);

                    voting_x.push(t as f64);
                    voting_times.push(elapsed);
                }

                beta.insert(v, fit_theil_sen(&voting_x, &voting_times));
            }
            beta_voting.push(beta);
        }

        // Exact search: random candidate subsets of graded sizes
        let s_max = (n_samples / 20).max(1);
        let n_s_tested = 20;
        let increment = (s_max / n_s_tested).max(1);
        let mut s_tested: Vec<usize> = vec![1, 2, 5, 10, 20, 50, 100, 200, 300, 400, 500];
        for i in 1..=n_s_tested {
            s_tested.push(i * increment);
        }
        s_tested.retain(|&s| s <= n_samples);
        s_tested.sort_unstable();
        s_tested.dedup();

        let n_sim = 100;
        let mut exact_x = Vec::new();
        let mut exact_times = Vec::new();
        for &s in &s_tested {
            let mut mean_exact_time = 0.0;
            for _ in 0..n_sim {
                let ri = rng.random_range(0..n_test);
                let q = &queries[ri * dim..(ri + 1) * dim];
                let elected: Vec<usize> =
                    (0..s).map(|_| rng.random_range(0..n_samples)).collect();

                let start = Instant::now();
                let result = index.exact_knn_on(q, k, &elected);
                mean_exact_time += start.elapsed().as_secs_f64();
                black_box(result);
            }

            exact_x.push(s as f64);
            exact_times.push(mean_exact_time / n_sim as f64);
        }
        let beta_exact = fit_theil_sen(&exact_x, &exact_times);

        Self {
            beta_projection,
            beta_voting,
            beta_exact,
            depth_min,
        }
    }

    /// Predicted projection time for `n_trees * depth` random vectors
    pub fn projection_time(&self, n_trees: usize, depth: usize) -> f64 {
        predict_theil_sen((n_trees * depth) as f64, self.beta_projection)
    }

    /// Predicted voting time
    ///
    /// Piecewise constant in the vote threshold: uses the fit of the
    /// smallest measured bucket at least `v`, or the largest bucket when
    /// `v` exceeds them all.
    pub fn voting_time(&self, n_trees: usize, depth: usize, v: usize) -> f64 {
        let beta = &self.beta_voting[depth - self.depth_min];
        if v == 0 || beta.is_empty() {
            return 0.0;
        }

        match beta.range(v..).next().or_else(|| beta.iter().next_back()) {
            Some((_, b)) => predict_theil_sen(n_trees as f64, *b),
            None => 0.0,
        }
    }

    /// Predicted exact-search time for a candidate set of the given size
    pub fn exact_time(&self, candidate_set_size: f64) -> f64 {
        predict_theil_sen(candidate_set_size, self.beta_exact)
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
    fn test_theil_sen_exact_line() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();

        let (intercept, slope) = fit_theil_sen(&x, &y);
        assert_relative_eq!(slope, 2.0, epsilon = 1e-12);
        assert_relative_eq!(intercept, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_theil_sen_order_invariant() {
        let x = vec![5.0, 1.0, 3.0, 2.0, 4.0];
        let y: Vec<f64> = x.iter().map(|v| -0.5 * v + 3.0).collect();

        let permuted_x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let permuted_y: Vec<f64> = permuted_x.iter().map(|v| -0.5 * v + 3.0).collect();

        let a = fit_theil_sen(&x, &y);
        let b = fit_theil_sen(&permuted_x, &permuted_y);
        assert_relative_eq!(a.0, b.0, epsilon = 1e-12);
        assert_relative_eq!(a.1, b.1, epsilon = 1e-12);
    }

    #[test]
    fn test_theil_sen_robust_to_outliers() {
        // Two of ten responses corrupted by a factor of a thousand; the
        // median of pairwise slopes should not move.
        let x: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        let mut y: Vec<f64> = x.iter().map(|v| 3.0 * v).collect();
        y[2] = 9000.0;
        y[7] = -4000.0;

        let (_, slope) = fit_theil_sen(&x, &y);
        assert_relative_eq!(slope, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_theil_sen_constant_x() {
        // No two distinct x values: horizontal line through the median
        let x = vec![2.0, 2.0, 2.0];
        let y = vec![1.0, 5.0, 3.0];

        let (intercept, slope) = fit_theil_sen(&x, &y);
        assert_eq!(slope, 0.0);
        assert_relative_eq!(intercept, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_theil_sen_empty() {
        assert_eq!(fit_theil_sen(&[], &[]), (0.0, 0.0));
    }

    #[test]
    fn test_predict_affine() {
        let beta = (1.5, -2.0);
        assert_relative_eq!(predict_theil_sen(0.0, beta), 1.5);
        assert_relative_eq!(predict_theil_sen(2.0, beta), -2.5);
    }

    #[test]
    fn test_voting_time_bucket_selection() {
        let mut buckets = BTreeMap::new();
        buckets.insert(1, (0.0, 1.0));
        buckets.insert(5, (0.0, 10.0));

        let model = QueryTimeModel {
            beta_projection: (0.0, 0.0),
            beta_voting: vec![buckets],
            beta_exact: (0.0, 0.0),
            depth_min: 3,
        };

        // v = 1 hits the first bucket, v in 2..=5 the second, anything
        // larger falls back to the largest bucket
        assert_relative_eq!(model.voting_time(2, 3, 1), 2.0);
        assert_relative_eq!(model.voting_time(2, 3, 3), 20.0);
        assert_relative_eq!(model.voting_time(2, 3, 5), 20.0);
        assert_relative_eq!(model.voting_time(2, 3, 9), 20.0);
        assert_eq!(model.voting_time(2, 3, 0), 0.0);
    }
}
