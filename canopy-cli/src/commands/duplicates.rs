use std::path::PathBuf;

use clap::Args;

use canopy_core::config::CanopyConfig;
use canopy_core::similarity::SimilarityCalculator;

#[derive(Args, Debug)]
pub struct DuplicatesArgs {
    /// Catalog file: JSON array of raw node records
    pub catalog: PathBuf,

    /// Minimum overall similarity for a pair to count
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Output format: text, json
    #[arg(long, default_value = "text")]
    pub format: String,
}

pub async fn run(args: DuplicatesArgs, config: &CanopyConfig) -> anyhow::Result<()> {
    super::validate_format(&args.format)?;
    let threshold = args
        .threshold
        .unwrap_or(config.similarity.duplicate_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        anyhow::bail!("--threshold must be within [0, 1], got {threshold}");
    }

    let built = super::build_catalog(&args.catalog, config)?;
    let hierarchy = &built.hierarchy;
    let pairs = SimilarityCalculator::from(&config.similarity)
        .find_duplicates(hierarchy.nodes(), threshold);

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&pairs)?);
        return Ok(());
    }

    println!("{} duplicate pairs at >= {threshold:.2}", pairs.len());
    for pair in &pairs {
        let a = hierarchy.get(pair.node1_id).map_or("?", |n| n.normalized_url.as_str());
        let b = hierarchy.get(pair.node2_id).map_or("?", |n| n.normalized_url.as_str());
        println!("  {:.3}  {a}  <->  {b}", pair.overall);
    }
    Ok(())
}
