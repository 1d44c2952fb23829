//! SlimDB CSV harness.
//! Usage: slimdb build <tree-file> <data.csv> [config.toml]
//!        slimdb range <tree-file> <queries.csv> <radius> [config.toml]
//!        slimdb knn <tree-file> <queries.csv> <k> [config.toml]
//!
//! CSV rows are `features..., name`. Query commands print one JSON line
//! per query and log average page reads and distance computations.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use slimdb::{
    Config, DiskPageManager, QueryResult, SlimTree, VectorObject, WeightedEuclideanDistance,
};
use std::env;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.as_slice() {
        [cmd, tree, csv, rest @ ..] if cmd == "build" && rest.len() <= 1 => {
            let config = load_config(rest.first())?;
            build(tree, csv, &config)
        }
        [cmd, tree, csv, radius, rest @ ..] if cmd == "range" && rest.len() <= 1 => {
            let config = load_config(rest.first())?;
            let radius: f64 = radius.parse().context("radius must be a number")?;
            query(tree, csv, &config, QueryArgs::Range(radius))
        }
        [cmd, tree, csv, k, rest @ ..] if cmd == "knn" && rest.len() <= 1 => {
            let config = load_config(rest.first())?;
            let k: usize = k.parse().context("k must be an integer")?;
            query(tree, csv, &config, QueryArgs::Knn(k))
        }
        _ => {
            bail!(
                "usage: slimdb build <tree-file> <data.csv> [config.toml]\n       \
                 slimdb range <tree-file> <queries.csv> <radius> [config.toml]\n       \
                 slimdb knn <tree-file> <queries.csv> <k> [config.toml]"
            );
        }
    }
}

enum QueryArgs {
    Range(f64),
    Knn(usize),
}

#[derive(Serialize)]
struct Match<'a> {
    name: &'a str,
    distance: f64,
}

#[derive(Serialize)]
struct Report<'a> {
    query: &'a str,
    matches: Vec<Match<'a>>,
}

fn load_config(path: Option<&String>) -> Result<Config> {
    match path {
        Some(p) => Config::from_path(&PathBuf::from(p))
            .with_context(|| format!("loading config {}", p)),
        None => Ok(Config::default_config()),
    }
}

fn metric_for(config: &Config) -> Result<WeightedEuclideanDistance> {
    let mut metric = WeightedEuclideanDistance::new();
    if !config.weights.is_empty() {
        metric.set_weights(config.weights.clone())?;
    }
    Ok(metric)
}

fn build(tree_path: &str, csv: &str, config: &Config) -> Result<()> {
    let rows = load_csv(Path::new(csv))?;
    let pager = DiskPageManager::create(tree_path, config.page_size)?;
    let mut tree: SlimTree<VectorObject, _> =
        SlimTree::create(pager, metric_for(config)?, config.options())?;
    for row in &rows {
        tree.add(row)
            .with_context(|| format!("inserting {}", row.name()))?;
    }
    tree.flush()?;
    tracing::info!(
        objects = tree.object_count(),
        height = tree.height(),
        nodes = tree.node_count(),
        "built tree"
    );
    Ok(())
}

fn query(tree_path: &str, csv: &str, config: &Config, args: QueryArgs) -> Result<()> {
    let samples = load_csv(Path::new(csv))?;
    let pager = DiskPageManager::open(tree_path)?;
    let mut tree: SlimTree<VectorObject, _> = SlimTree::open(pager, metric_for(config)?)?;
    tree.reset_statistics();

    for sample in &samples {
        let result: QueryResult<VectorObject> = match args {
            QueryArgs::Range(radius) => tree.range_query(sample, radius)?,
            QueryArgs::Knn(k) => tree.nearest_query(sample, k, config.allow_ties)?,
        };
        let report = Report {
            query: sample.name(),
            matches: result
                .iter()
                .map(|p| Match {
                    name: p.object().name(),
                    distance: p.distance(),
                })
                .collect(),
        };
        println!("{}", serde_json::to_string(&report)?);
    }

    let n = samples.len().max(1) as f64;
    tracing::info!(
        queries = samples.len(),
        avg_page_reads = tree.pager().read_count() as f64 / n,
        avg_distances = tree.distance_count() as f64 / n,
        "query batch done"
    );
    Ok(())
}

fn load_csv(path: &Path) -> Result<Vec<VectorObject>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 2 {
            bail!("{}:{}: expected `features..., name`", path.display(), lineno + 1);
        }
        let name = fields[fields.len() - 1].trim().to_string();
        let features = fields[..fields.len() - 1]
            .iter()
            .map(|f| f.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
            .with_context(|| format!("{}:{}: bad feature value", path.display(), lineno + 1))?;
        rows.push(VectorObject::new(rows.len() as u32, name, features));
    }
    Ok(rows)
}
