use std::collections::BTreeSet;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rmidb_engine::config::{LearnedIndexConfig, LogFormat};
use rmidb_engine::telemetry::init_tracing;
use rmidb_engine::trainer::PartitionKind;
use rmidb_engine::{Key, LearnedIndex, MemoryStore};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Distribution {
    Sequential,
    Uniform,
    Clustered,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PartitionArg {
    Greedy,
    Fixed,
}

impl From<PartitionArg> for PartitionKind {
    fn from(value: PartitionArg) -> Self {
        match value {
            PartitionArg::Greedy => PartitionKind::Greedy,
            PartitionArg::Fixed => PartitionKind::Fixed,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rmi_validate")]
#[command(about = "Build a learned index over a synthetic dataset and check every lookup", long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value = "uniform")]
    distribution: Distribution,

    #[arg(long, default_value_t = 1_000_000)]
    n: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, value_enum)]
    partition: Option<PartitionArg>,

    #[arg(long)]
    epsilon: Option<u64>,

    #[arg(long)]
    segments: Option<usize>,

    /// Random absent keys to look up for soundness
    #[arg(long, default_value_t = 100_000)]
    misses: usize,

    /// Optional YAML/TOML/JSON config file
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    distribution: String,
    keys: usize,
    segments: usize,
    avg_error_bound: f64,
    max_error_bound: u64,
    root_error_bound: u64,
    build_ms: f64,
    verify_ms: f64,
    lookup_ns_avg: f64,
    absent_lookups: usize,
}

fn generate(distribution: Distribution, n: usize, rng: &mut StdRng) -> Vec<Key> {
    match distribution {
        Distribution::Sequential => (0..n as Key).collect(),
        Distribution::Uniform => {
            let mut keys = BTreeSet::new();
            while keys.len() < n {
                keys.insert(rng.gen_range(0..Key::MAX / 2));
            }
            keys.into_iter().collect()
        }
        Distribution::Clustered => {
            let clusters = (n / 10_000).max(1);
            let mut keys = BTreeSet::new();
            while keys.len() < n {
                let center = rng.gen_range(0..clusters as Key) * 1_000_000_000;
                keys.insert(center + rng.gen_range(0..5_000_000));
            }
            keys.into_iter().collect()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = LearnedIndexConfig::load(args.config.as_deref())?;
    if let Some(partition) = args.partition {
        config.partition = partition.into();
    }
    if let Some(epsilon) = args.epsilon {
        config.epsilon = epsilon;
    }
    if let Some(segments) = args.segments {
        config.segment_count = segments;
    }
    if args.json {
        config.logging.format = LogFormat::Json;
    }
    config.validate()?;
    init_tracing(&config.logging)?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let keys = generate(args.distribution, args.n, &mut rng);
    info!(keys = keys.len(), distribution = ?args.distribution, "dataset generated");

    let mut shuffled: Vec<(Key, u64)> = keys.iter().enumerate().map(|(i, &k)| (k, i as u64)).collect();
    shuffled.shuffle(&mut rng);

    let started = Instant::now();
    let index = LearnedIndex::bulk_load(MemoryStore::new(), config, shuffled)
        .context("bulk load failed")?;
    let build_ms = started.elapsed().as_secs_f64() * 1_000.0;

    let started = Instant::now();
    index.snapshot().verify_error_bounds()?;
    let verify_ms = started.elapsed().as_secs_f64() * 1_000.0;

    let started = Instant::now();
    for (rank, &key) in keys.iter().enumerate() {
        match index.point_query(key)? {
            Some(position) if position == rank as u64 => {}
            other => bail!("key {} resolved to {:?}, expected {}", key, other, rank),
        }
    }
    let lookup_ns_avg = if keys.is_empty() {
        0.0
    } else {
        started.elapsed().as_nanos() as f64 / keys.len() as f64
    };

    let mut absent_lookups = 0usize;
    for _ in 0..args.misses {
        let candidate: Key = rng.gen();
        if keys.binary_search(&candidate).is_ok() {
            continue;
        }
        if let Some(position) = index.point_query(candidate)? {
            bail!("absent key {} resolved to position {}", candidate, position);
        }
        absent_lookups += 1;
    }

    let stats = index.stats();
    let report = Report {
        distribution: format!("{:?}", args.distribution).to_lowercase(),
        keys: stats.keys,
        segments: stats.segment_count,
        avg_error_bound: stats.avg_error_bound,
        max_error_bound: stats.max_error_bound,
        root_error_bound: stats.root_error_bound,
        build_ms,
        verify_ms,
        lookup_ns_avg,
        absent_lookups,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("distribution     {}", report.distribution);
        println!("keys             {}", report.keys);
        println!("segments         {}", report.segments);
        println!("avg error bound  {:.2}", report.avg_error_bound);
        println!("max error bound  {}", report.max_error_bound);
        println!("root error bound {}", report.root_error_bound);
        println!("build            {:.2} ms", report.build_ms);
        println!("verify           {:.2} ms", report.verify_ms);
        println!("lookup           {:.1} ns/op", report.lookup_ns_avg);
        println!("absent lookups   {} (all None)", report.absent_lookups);
    }
    Ok(())
}
