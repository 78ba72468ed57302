//! Leaf geometry of an implicit median-split tree.
//!
//! A tree of depth `d` built over `n` points by repeated median splits has
//! fully deterministic leaf sizes: every split sends the extra point of an
//! odd range to the left branch. These helpers compute the sizes and the
//! cumulative start offsets of each leaf inside the per-tree permutation,
//! for a single depth or for every depth up to a maximum.

/// Compute the leaf sizes of a median-split tree
///
/// Splits `n` into `⌈n/2⌉` left and `⌊n/2⌋` right at every level, so the
/// extra point of an odd range always goes left.
///
/// ### Params
///
/// * `n` - Number of data points
/// * `depth` - Depth of the tree (2^depth leaves)
///
/// ### Returns
///
/// Vector of 2^depth leaf sizes, in left-to-right leaf order
pub fn count_leaf_sizes(n: usize, depth: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(1 << depth);
    count_leaf_sizes_rec(n, 0, depth, &mut out);
    out
}

fn count_leaf_sizes_rec(n: usize, level: usize, depth: usize, out: &mut Vec<usize>) {
    if level == depth {
        out.push(n);
        return;
    }
    count_leaf_sizes_rec(n - n / 2, level + 1, depth, out);
    count_leaf_sizes_rec(n / 2, level + 1, depth, out);
}

/// Compute the first index of each leaf in the concatenated leaf array
///
/// ### Params
///
/// * `n` - Number of data points
/// * `depth` - Depth of the tree
///
/// ### Returns
///
/// Prefix sums of the leaf sizes: length 2^depth + 1, first entry 0,
/// last entry `n`
pub fn count_first_leaf_indices(n: usize, depth: usize) -> Vec<usize> {
    let sizes = count_leaf_sizes(n, depth);

    let mut indices = Vec::with_capacity(sizes.len() + 1);
    indices.push(0);
    let mut acc = 0;
    for sz in sizes {
        acc += sz;
        indices.push(acc);
    }
    indices
}

/// Leaf start offsets for every depth from 0 to `depth_max` inclusive
pub fn count_first_leaf_indices_all(n: usize, depth_max: usize) -> Vec<Vec<usize>> {
    (0..=depth_max)
        .map(|d| count_first_leaf_indices(n, d))
        .collect()
}

///////////
// Tests //
///////////
