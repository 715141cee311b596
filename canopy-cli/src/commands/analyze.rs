use std::fmt::Write;
use std::path::PathBuf;

use clap::Args;

use canopy_core::analyze::{HierarchyAnalyzer, health};
use canopy_core::config::CanopyConfig;
use canopy_core::hierarchy::Hierarchy;
use canopy_core::types::{NodeId, RelationshipKind};

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Catalog file: JSON array of raw node records
    pub catalog: PathBuf,

    /// Restrict the health report to the subtree under this URL
    #[arg(long)]
    pub root: Option<String>,

    /// Output format: text, json
    #[arg(long, default_value = "text")]
    pub format: String,
}

pub async fn run(args: AnalyzeArgs, config: &CanopyConfig) -> anyhow::Result<()> {
    super::validate_format(&args.format)?;
    let built = super::build_catalog(&args.catalog, config)?;
    let hierarchy = &built.hierarchy;

    let root = match &args.root {
        Some(url) => {
            let key = canopy_core::url::normalize(url)?;
            let node = hierarchy
                .get_by_url(&key)
                .ok_or_else(|| anyhow::anyhow!("URL not in catalog: {url}"))?;
            Some(node.id)
        }
        None => None,
    };

    let analyzer = HierarchyAnalyzer::from(config);
    let analysis = analyzer.analyze(hierarchy);
    let clusters = analyzer.find_clusters(&analysis);
    let report = health::analyze_health_with(hierarchy, root, config.analysis.unbalanced_children);

    if args.format == "json" {
        let json = serde_json::json!({
            "relationships": analysis.relationships,
            "clusters": clusters,
            "health": report,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    let mut out = String::new();
    let _ = writeln!(out, "Relationships: {}", analysis.relationships.len());
    for kind in RelationshipKind::ALL {
        let _ = writeln!(out, "  {:<14} {:>6}", kind.as_str(), analysis.count(kind));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Sibling clusters: {}", clusters.len());
    for (i, cluster) in clusters.iter().enumerate() {
        let _ = writeln!(out, "  #{i}: {}", labels(hierarchy, cluster).join(", "));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Health score: {:.2}", report.score);
    let _ = writeln!(out, "  nodes:        {}", report.total_nodes);
    let _ = writeln!(out, "  max depth:    {}", report.max_depth);
    let _ = writeln!(out, "  avg children: {:.2}", report.avg_children);
    let _ = writeln!(out, "  orphans:      {}", report.orphan_count);
    let _ = writeln!(out, "  duplicates:   {}", report.duplicate_count);
    let _ = writeln!(out, "  unbalanced:   {}", report.unbalanced.len());
    let _ = writeln!(out, "  unreachable:  {}", report.unreachable.len());
    let _ = writeln!(out, "  cycles:       {}", report.cycles_detected);
    print!("{out}");
    Ok(())
}

fn labels(hierarchy: &Hierarchy, ids: &[NodeId]) -> Vec<String> {
    ids.iter()
        .filter_map(|id| hierarchy.get(*id))
        .map(|n| n.normalized_url.clone())
        .collect()
}
