//! Construction of a single random projection tree.
//!
//! A tree is two flat arrays: split thresholds indexed by heap position
//! (root 0, children of `i` at `2i+1` and `2i+2`) and a permutation of the
//! dataset indices whose contiguous segments are the leaves. The segment
//! boundaries are implicit - `leaf_layout` reproduces them from `n` alone
//! because every split is a median split with the extra point going left.

use std::cmp::Ordering;

/// Build one tree from its precomputed projection block
///
/// ### Params
///
/// * `projections` - Row-major `depth × n` block; entry `[l * n + j]` is the
///   projection of data point `j` onto the tree's level-`l` random vector
/// * `n` - Number of data points
/// * `depth` - Tree depth
///
/// ### Returns
///
/// Tuple of `(split_points, leaf_indices)`: the heap-ordered thresholds
/// (sized `2^(depth+1)` to match the persisted layout) and the permutation
/// of `0..n` with leaves as contiguous segments
pub(crate) fn grow_tree(projections: &[f32], n: usize, depth: usize) -> (Vec<f32>, Vec<usize>) {
    let mut split_points = vec![0.0f32; 1 << (depth + 1)];
    let mut indices: Vec<usize> = (0..n).collect();

    grow_subtree(&mut indices, 0, 0, depth, projections, n, &mut split_points);

    (split_points, indices)
}

/// Recursively median-split a range of the index permutation
///
/// At level `l` the range is partitioned by the median of the level-`l`
/// projections; `⌈n/2⌉` points go left. The recorded threshold is the left
/// partition's maximum when the range size is odd, and the midpoint of the
/// left maximum and the right minimum when it is even, so traversal with
/// `value <= threshold` routes exactly the left partition leftwards.
fn grow_subtree(
    indices: &mut [usize],
    level: usize,
    node: usize,
    depth: usize,
    projections: &[f32],
    n_total: usize,
    split_points: &mut [f32],
) {
    if level == depth {
        return;
    }

    let n = indices.len();
    if n == 0 {
        return;
    }

    let row = level * n_total;
    let proj = |i: usize| projections[row + i];
    let cmp = |a: &usize, b: &usize| proj(*a).partial_cmp(&proj(*b)).unwrap_or(Ordering::Equal);

    indices.select_nth_unstable_by(n / 2, cmp);
    let mid = n - n / 2;

    if n % 2 == 1 {
        split_points[node] = proj(indices[mid - 1]);
    } else {
        let left_max = indices[..mid]
            .iter()
            .map(|&i| proj(i))
            .fold(f32::NEG_INFINITY, f32::max);
        split_points[node] = (proj(indices[mid]) + left_max) / 2.0;
    }

    let (left, right) = indices.split_at_mut(mid);
    grow_subtree(
        left,
        level + 1,
        2 * node + 1,
        depth,
        projections,
        n_total,
        split_points,
    );
    grow_subtree(
        right,
        level + 1,
        2 * node + 2,
        depth,
        projections,
        n_total,
        split_points,
    );
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaf_layout::count_first_leaf_indices;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_single_level_even_split() {
        // Projections 3, 1, 4, 2 -> left {1, 2}, right {3, 4},
        // threshold (2 + 3) / 2 = 2.5
        let projections = vec![3.0, 1.0, 4.0, 2.0];
        let (splits, indices) = grow_tree(&projections, 4, 1);

        assert_eq!(splits[0], 2.5);

        let mut left: Vec<usize> = indices[..2].to_vec();
        left.sort();
        assert_eq!(left, vec![1, 3]);

        let mut right: Vec<usize> = indices[2..].to_vec();
        right.sort();
        assert_eq!(right, vec![0, 2]);
    }

    #[test]
    fn test_single_level_odd_split() {
        // Projections 5, 1, 3 -> left {1, 3}, right {5}, threshold is the
        // left maximum 3
        let projections = vec![5.0, 1.0, 3.0];
        let (splits, indices) = grow_tree(&projections, 3, 1);

        assert_eq!(splits[0], 3.0);
        let mut left: Vec<usize> = indices[..2].to_vec();
        left.sort();
        assert_eq!(left, vec![1, 2]);
        assert_eq!(indices[2], 0);
    }

    #[test]
    fn test_leaf_segments_form_permutation() {
        let n = 100;
        let depth = 4;
        let mut rng = StdRng::seed_from_u64(3);
        let projections: Vec<f32> = (0..depth * n).map(|_| rng.random::<f32>()).collect();

        let (_, indices) = grow_tree(&projections, n, depth);

        let mut sorted = indices.clone();
        sorted.sort();
        assert_eq!(sorted, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_points_respect_split_thresholds() {
        // Every point must lie on the side of each ancestor split that its
        // leaf position implies.
        let n = 77;
        let depth = 3;
        let mut rng = StdRng::seed_from_u64(8);
        let projections: Vec<f32> = (0..depth * n).map(|_| rng.random::<f32>()).collect();

        let (splits, indices) = grow_tree(&projections, n, depth);
        let firsts = count_first_leaf_indices(n, depth);

        for leaf in 0..(1 << depth) {
            for &point in &indices[firsts[leaf]..firsts[leaf + 1]] {
                // Walk from the root to this leaf
                let mut node = 0usize;
                for level in 0..depth {
                    let go_right = (leaf >> (depth - level - 1)) & 1 == 1;
                    let value = projections[level * n + point];
                    if go_right {
                        assert!(value > splits[node], "leaf {leaf} point {point}");
                        node = 2 * node + 2;
                    } else {
                        assert!(value <= splits[node], "leaf {leaf} point {point}");
                        node = 2 * node + 1;
                    }
                }
            }
        }
    }

    #[test]
    fn test_split_array_length_matches_persisted_layout() {
        let projections = vec![0.0; 5 * 8];
        let (splits, _) = grow_tree(&projections, 8, 5);
        assert_eq!(splits.len(), 1 << 6);
    }

    #[test]
    fn test_deterministic_given_projections() {
        let n = 50;
        let depth = 3;
        let mut rng = StdRng::seed_from_u64(17);
        let projections: Vec<f32> = (0..depth * n).map(|_| rng.random::<f32>()).collect();

        let a = grow_tree(&projections, n, depth);
        let b = grow_tree(&projections, n, depth);
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }
}
