use std::path::PathBuf;

use clap::Args;

use canopy_core::config::CanopyConfig;
use canopy_core::similarity::SimilarityCalculator;

#[derive(Args, Debug)]
pub struct SimilarArgs {
    /// Catalog file: JSON array of raw node records
    pub catalog: PathBuf,

    /// URL of the node to compare against
    pub url: String,

    /// Show at most N matches
    #[arg(long)]
    pub limit: Option<usize>,

    /// Output format: text, json
    #[arg(long, default_value = "text")]
    pub format: String,
}

pub async fn run(args: SimilarArgs, config: &CanopyConfig) -> anyhow::Result<()> {
    super::validate_format(&args.format)?;
    let built = super::build_catalog(&args.catalog, config)?;
    let hierarchy = &built.hierarchy;

    let key = canopy_core::url::normalize(&args.url)?;
    let target = hierarchy
        .get_by_url(&key)
        .ok_or_else(|| anyhow::anyhow!("URL not in catalog: {}", args.url))?;

    let calculator = SimilarityCalculator::from(&config.similarity);
    let limit = args.limit.unwrap_or(config.similarity.find_similar_limit);
    let matches = calculator.find_similar(target, hierarchy.nodes(), limit);

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&matches)?);
        return Ok(());
    }

    println!("Similar to {}:", target.normalized_url);
    if matches.is_empty() {
        println!("  (none above {:.2})", config.similarity.min_similarity);
    }
    for m in &matches {
        let url = hierarchy
            .get(m.node2_id)
            .map_or("?", |n| n.normalized_url.as_str());
        println!(
            "  {:.3}  {url}  (url {:.2}, title {:.2}, structure {:.2}, content {:.2})",
            m.overall, m.url, m.title, m.structural, m.content
        );
    }
    Ok(())
}
