use faer::MatRef;

/// Flatten a faer matrix into a row-major vector
///
/// Copies the matrix row by row so that sample `i` occupies
/// `[i * dim, (i + 1) * dim)` in the output. All index internals work on
/// this layout for cache locality.
///
/// ### Params
///
/// * `data` - Matrix with rows = samples, columns = dimensions
///
/// ### Returns
///
/// Tuple of `(flat_data, n_samples, dim)`
pub fn matrix_to_flat<T: Clone>(data: MatRef<T>) -> (Vec<T>, usize, usize) {
    let n = data.nrows();
    let dim = data.ncols();

    let mut flat = Vec::with_capacity(n * dim);
    for i in 0..n {
        flat.extend(data.row(i).iter().cloned());
    }

    (flat, n, dim)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    #[test]
    fn test_matrix_to_flat_row_major() {
        let mat = Mat::from_fn(2, 3, |i, j| (i * 3 + j) as f32);
        let (flat, n, dim) = matrix_to_flat(mat.as_ref());

        assert_eq!(n, 2);
        assert_eq!(dim, 3);
        assert_eq!(flat, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_matrix_to_flat_empty() {
        let mat = Mat::<f32>::zeros(0, 4);
        let (flat, n, dim) = matrix_to_flat(mat.as_ref());

        assert_eq!(n, 0);
        assert_eq!(dim, 4);
        assert!(flat.is_empty());
    }
}
