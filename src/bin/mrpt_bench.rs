use clap::Parser;
use faer::Mat;
use mrpt_rs::io::{read_matrix, MmapMatrix};
use mrpt_rs::synthetic::generate_clustered_data;
use mrpt_rs::autotune_mrpt_index;
use rustc_hash::FxHashSet;
use std::time::Instant;
use thousands::*;

/// Autotuning benchmark for the MRPT index
///
/// Loads raw f32 binary matrices (train.bin / test.bin in the data
/// directory) or generates clustered synthetic data, autotunes the index,
/// and sweeps target recalls reporting estimated against measured recall
/// and query time.
#[derive(Parser)]
#[command(name = "mrpt_bench")]
struct Cli {
    /// Number of training samples
    #[arg(long, default_value_t = 10_000)]
    n: usize,

    /// Number of test queries
    #[arg(long, default_value_t = 100)]
    n_test: usize,

    /// Dimensionality of the data
    #[arg(long, default_value_t = 32)]
    dim: usize,

    /// Number of neighbours to search
    #[arg(short, default_value_t = 10)]
    k: usize,

    /// Largest tree count to consider
    #[arg(long, default_value_t = 50)]
    trees_max: usize,

    /// Smallest depth to consider
    #[arg(long, default_value_t = 4)]
    depth_min: usize,

    /// Largest depth to consider
    #[arg(long, default_value_t = 8)]
    depth_max: usize,

    /// Largest vote threshold to consider
    #[arg(long, default_value_t = 10)]
    votes_max: usize,

    /// Density of the random projection matrix
    #[arg(long, default_value_t = 1.0)]
    density: f32,

    /// Random seed
    #[arg(long, default_value_t = 12345)]
    seed: u64,

    /// Directory holding train.bin and test.bin (raw f32, row-major);
    /// synthetic data is generated when omitted
    #[arg(long)]
    data_dir: Option<String>,

    /// Memory-map the training data instead of reading it
    #[arg(long, default_value_t = false)]
    mmap: bool,

    /// Number of clusters for synthetic data
    #[arg(long, default_value_t = 20)]
    n_clusters: usize,
}

fn load_data(cli: &Cli) -> mrpt_rs::Result<(Mat<f32>, Mat<f32>)> {
    match &cli.data_dir {
        Some(dir) => {
            let train_path = format!("{dir}/train.bin");
            let test_path = format!("{dir}/test.bin");

            let train = if cli.mmap {
                MmapMatrix::open(&train_path, cli.n, cli.dim)?.to_mat()
            } else {
                read_matrix(&train_path, cli.n, cli.dim)?
            };
            let test = read_matrix(&test_path, cli.n_test, cli.dim)?;

            Ok((train, test))
        }
        None => {
            println!(
                "Generating synthetic data: {} samples, {} dimensions, {} clusters.",
                cli.n.separate_with_underscores(),
                cli.dim,
                cli.n_clusters
            );
            let train = generate_clustered_data(cli.n, cli.dim, cli.n_clusters, 1.0, cli.seed);
            let test = generate_clustered_data(
                cli.n_test,
                cli.dim,
                cli.n_clusters,
                1.0,
                cli.seed.wrapping_add(1),
            );
            Ok((train, test))
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let (train, test) = match load_data(&cli) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("mrpt_bench: could not load data: {err}");
            std::process::exit(-1);
        }
    };

    println!("-----------------------------");
    println!(
        "Autotuning: {} samples, k = {}, trees <= {}, depth {}..={}, votes <= {}, density {}.",
        cli.n.separate_with_underscores(),
        cli.k,
        cli.trees_max,
        cli.depth_min,
        cli.depth_max,
        cli.votes_max,
        cli.density
    );

    let start = Instant::now();
    let index = match autotune_mrpt_index(
        train.as_ref(),
        test.as_ref(),
        cli.k,
        cli.trees_max,
        cli.depth_min,
        cli.depth_max,
        cli.votes_max,
        cli.density,
        cli.seed,
    ) {
        Ok(index) => index,
        Err(err) => {
            eprintln!("mrpt_bench: autotuning failed: {err}");
            std::process::exit(-1);
        }
    };
    println!("Autotuning took {:.2?}.", start.elapsed());

    // Exhaustive ground truth for the measured recall column
    let truth: Vec<FxHashSet<i32>> = (0..cli.n_test)
        .map(|i| {
            let q: Vec<f32> = (0..cli.dim).map(|j| test[(i, j)]).collect();
            index
                .exact_knn(&q, cli.k)
                .indices
                .into_iter()
                .filter(|&idx| idx >= 0)
                .collect()
        })
        .collect();

    println!("-----------------------------");
    println!("target | trees depth votes | est recall / measured | est qtime / measured");

    let targets: Vec<f64> = (1..20).map(|i| i as f64 * 0.05).collect();
    for target in targets {
        let pruned = index.subset(target);
        if pruned.is_empty() {
            continue;
        }

        let par = match index.optimal_parameters(target) {
            Some(par) => par,
            None => continue,
        };

        let mut matches = 0usize;
        let start = Instant::now();
        for i in 0..cli.n_test {
            let q: Vec<f32> = (0..cli.dim).map(|j| test[(i, j)]).collect();
            let result = pruned.query_tuned(&q);
            matches += result
                .indices
                .iter()
                .filter(|&&idx| idx >= 0 && truth[i].contains(&idx))
                .count();
        }
        let measured_qtime = start.elapsed().as_secs_f64() / cli.n_test as f64;
        let measured_recall = matches as f64 / (cli.k * cli.n_test) as f64;

        println!(
            "{:.2}   | {:>5} {:>5} {:>5} | {:.3} / {:.3}         | {:.2e} s / {:.2e} s",
            target,
            par.n_trees,
            par.depth,
            par.votes,
            par.estimated_recall,
            measured_recall,
            par.estimated_qtime,
            measured_qtime
        );
    }
}
