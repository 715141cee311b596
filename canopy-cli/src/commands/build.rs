use std::collections::HashSet;
use std::fmt::Write;
use std::path::PathBuf;

use clap::Args;

use canopy_core::config::CanopyConfig;
use canopy_core::hierarchy::{Hierarchy, HierarchyResult};
use canopy_core::types::NodeId;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Catalog file: JSON array of `{ "url": ..., "title": ... }` records
    pub catalog: PathBuf,

    /// Fallback parent for nodes whose ancestors are all missing
    #[arg(long)]
    pub root_url: Option<String>,

    /// Skip cycle, orphan and depth validation
    #[arg(long)]
    pub no_validate: bool,

    /// Output format: text, json
    #[arg(long, default_value = "text")]
    pub format: String,
}

pub async fn run(args: BuildArgs, config: &CanopyConfig) -> anyhow::Result<()> {
    super::validate_format(&args.format)?;
    let mut config = config.clone();
    if args.root_url.is_some() {
        config.hierarchy.root_url = args.root_url;
    }
    if args.no_validate {
        config.hierarchy.validate = false;
    }
    let result = super::build_catalog(&args.catalog, &config)?;

    if args.format == "json" {
        let json = serde_json::json!({
            "root_ids": result.root_ids,
            "max_depth": result.max_depth,
            "stats": result.stats,
            "warnings": result.warnings,
            "nodes": result.nodes(),
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        print!("{}", render_text(&result));
    }
    Ok(())
}

fn render_text(result: &HierarchyResult) -> String {
    let mut out = String::new();
    for &root in &result.root_ids {
        render_subtree(&result.hierarchy, root, 0, &mut out);
    }

    let stats = &result.stats;
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{} nodes, {} roots, max depth {} ({} duplicates skipped, {} invalid URLs)",
        stats.nodes_created,
        stats.roots,
        stats.max_depth,
        stats.duplicates_skipped,
        stats.invalid_urls
    );
    if result.has_warnings() {
        let _ = writeln!(out, "Warnings ({}):", result.warnings.len());
        for warning in &result.warnings {
            let _ = writeln!(out, "  - {warning}");
        }
    }
    out
}

fn render_subtree(hierarchy: &Hierarchy, root: NodeId, indent: usize, out: &mut String) {
    let mut seen = HashSet::new();
    let mut stack = vec![(root, indent)];
    while let Some((id, level)) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(node) = hierarchy.get(id) else {
            continue;
        };
        let label = node.title.as_deref().unwrap_or(&node.slug);
        let _ = writeln!(out, "{}{label}  {}", "  ".repeat(level), node.normalized_url);
        for &child in hierarchy.children_of(id).iter().rev() {
            stack.push((child, level + 1));
        }
    }
}
