#![allow(clippy::needless_range_loop)]

pub mod autotune;
pub mod dist;
pub mod error;
pub mod index;
pub mod io;
pub mod leaf_layout;
pub mod profiler;
pub mod random_matrix;
pub mod synthetic;
mod tree;
pub mod utils;

use faer::MatRef;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thousands::*;

pub use crate::autotune::{Parameters, Tuning};
pub use crate::error::{MrptError, Result};
pub use crate::index::{Mrpt, QueryResult};
pub use crate::random_matrix::RandomMatrix;

//////////
// MRPT //
//////////

/// Build an MRPT index
///
/// ### Params
///
/// * `mat` - The data matrix. Rows represent the samples, columns represent
///   the embedding dimensions
/// * `n_trees` - Number of trees to build
/// * `depth` - Depth of the trees
/// * `density` - Expected ratio of non-zero entries in the projection
///   matrix; 1.0 selects the dense variant
/// * `seed` - Random seed for reproducibility; 0 draws entropy from the OS
///
/// ### Returns
///
/// The grown `Mrpt` index
pub fn build_mrpt_index(
    mat: MatRef<f32>,
    n_trees: usize,
    depth: usize,
    density: f32,
    seed: u64,
) -> Result<Mrpt> {
    let mut index = Mrpt::new(mat);
    index.grow(n_trees, depth, density, seed)?;
    Ok(index)
}

/// Build an autotuned MRPT index
///
/// Grows the index at its maximum size and derives estimated recall and
/// query time for every feasible operating point. Use
/// [`Mrpt::subset`] or [`Mrpt::delete_extra_trees`] on the result to pick
/// an operating point for a target recall.
///
/// ### Params
///
/// * `mat` - The data matrix. Rows represent the samples, columns represent
///   the embedding dimensions
/// * `queries` - Held-out test queries for the tuning
/// * `k` - Number of neighbours the tuning targets
/// * `trees_max` - Largest tree count to consider
/// * `depth_min` - Smallest depth to consider
/// * `depth_max` - Largest depth to consider
/// * `votes_max` - Largest vote threshold to consider
/// * `density` - Expected ratio of non-zero entries in the projection matrix
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// The grown index with its tuning artefacts
#[allow(clippy::too_many_arguments)]
pub fn autotune_mrpt_index(
    mat: MatRef<f32>,
    queries: MatRef<f32>,
    k: usize,
    trees_max: usize,
    depth_min: usize,
    depth_max: usize,
    votes_max: usize,
    density: f32,
    seed: u64,
) -> Result<Mrpt> {
    let mut index = Mrpt::new(mat);
    index.autotune(
        queries, k, trees_max, depth_min, depth_max, votes_max, density, seed,
    )?;
    Ok(index)
}

/// Helper function to query a given MRPT index
///
/// Queries are processed in parallel over the rows of the query matrix.
///
/// ### Params
///
/// * `query_mat` - The query matrix containing the samples x features
/// * `index` - The `Mrpt` index to query
/// * `k` - Number of neighbours to return
/// * `votes_required` - Vote threshold for candidate election
/// * `return_dist` - Shall the distances between the different points be
///   returned
/// * `verbose` - Controls verbosity of the function
///
/// ### Returns
///
/// A tuple of `(knn_indices, optional distances)`; unfilled slots hold `-1`
pub fn query_mrpt_index(
    query_mat: MatRef<f32>,
    index: &Mrpt,
    k: usize,
    votes_required: usize,
    return_dist: bool,
    verbose: bool,
) -> (Vec<Vec<i32>>, Option<Vec<Vec<f32>>>) {
    let n_samples = query_mat.nrows();
    let counter = Arc::new(AtomicUsize::new(0));

    let results: Vec<QueryResult> = (0..n_samples)
        .into_par_iter()
        .map(|i| {
            let result = index.query_row(query_mat.row(i), k, votes_required);

            if verbose {
                let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                if count.is_multiple_of(100_000) {
                    println!(
                        "  Processed {} / {} samples.",
                        count.separate_with_underscores(),
                        n_samples.separate_with_underscores()
                    );
                }
            }

            result
        })
        .collect();

    if return_dist {
        let (indices, distances) = results
            .into_iter()
            .map(|r| (r.indices, r.distances))
            .unzip();
        (indices, Some(distances))
    } else {
        let indices = results.into_iter().map(|r| r.indices).collect();
        (indices, None)
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::generate_clustered_data;
    use faer::Mat;

    #[test]
    fn test_build_and_batch_query() {
        let data: Mat<f32> = generate_clustered_data(400, 6, 5, 0.7, 11);
        let index = build_mrpt_index(data.as_ref(), 6, 4, 1.0, 42).unwrap();

        let (indices, distances) = query_mrpt_index(data.as_ref(), &index, 3, 1, true, false);

        assert_eq!(indices.len(), 400);
        assert_eq!(distances.as_ref().unwrap().len(), 400);

        // Each point should find itself as its own nearest neighbour
        let mut self_hits = 0;
        for (i, knn) in indices.iter().enumerate() {
            assert_eq!(knn.len(), 3);
            if knn[0] == i as i32 {
                self_hits += 1;
            }
        }
        assert!(self_hits > 350, "only {self_hits} self hits");
    }

    #[test]
    fn test_autotune_wrapper() {
        let data: Mat<f32> = generate_clustered_data(300, 4, 4, 0.6, 21);
        let queries: Mat<f32> = generate_clustered_data(15, 4, 4, 0.6, 22);

        let index =
            autotune_mrpt_index(data.as_ref(), queries.as_ref(), 3, 5, 2, 4, 3, 1.0, 77).unwrap();

        assert!(!index.optimal_parameter_list().is_empty());
        let pruned = index.subset(0.0);
        assert!(!pruned.is_empty());
    }
}
