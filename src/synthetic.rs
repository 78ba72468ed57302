use faer::traits::ComplexField;
use faer::Mat;
use num_traits::{Float, FromPrimitive};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Generate Gaussian-cluster data for index tests and benchmarks
///
/// Each sample is a cluster centre plus isotropic N(0, cluster_std^2)
/// noise, with the centres spread wide enough relative to the noise that
/// median splits isolate clusters in the first few tree levels. Cluster
/// membership is drawn uniformly per sample.
///
/// ### Params
///
/// * `n_samples` - Number of samples
/// * `dim` - Embedding dimensionality
/// * `n_clusters` - Number of cluster centres
/// * `cluster_std` - Noise standard deviation around each centre
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// Matrix of shape (n_samples, dim)
pub fn generate_clustered_data<T>(
    n_samples: usize,
    dim: usize,
    n_clusters: usize,
    cluster_std: f64,
    seed: u64,
) -> Mat<T>
where
    T: Float + FromPrimitive + ComplexField,
{
    let mut rng = StdRng::seed_from_u64(seed);

    let centres: Vec<Vec<f64>> = (0..n_clusters)
        .map(|_| (0..dim).map(|_| rng.random_range(-4.0..4.0)).collect())
        .collect();

    let mut data = Mat::<T>::zeros(n_samples, dim);
    for i in 0..n_samples {
        let centre = &centres[rng.random_range(0..n_clusters)];
        for j in 0..dim {
            let noise: f64 = rng.sample(StandardNormal);
            data[(i, j)] = T::from_f64(centre[j] + cluster_std * noise).unwrap();
        }
    }

    data
}

/// Generate uniform random data in the unit cube
///
/// ### Params
///
/// * `n_samples` - Number of samples
/// * `dim` - Embedding dimensionality
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// Matrix of shape (n_samples, dim) with entries in [0, 1)
pub fn generate_uniform_data<T>(n_samples: usize, dim: usize, seed: u64) -> Mat<T>
where
    T: Float + FromPrimitive + ComplexField,
{
    let mut rng = StdRng::seed_from_u64(seed);

    let mut data = Mat::<T>::zeros(n_samples, dim);
    for i in 0..n_samples {
        for j in 0..dim {
            data[(i, j)] = T::from_f64(rng.random()).unwrap();
        }
    }

    data
}

///////////
// Tests //
///////////
