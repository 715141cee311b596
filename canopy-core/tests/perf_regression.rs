use std::time::{Duration, Instant};

use canopy_core::analyze::{HierarchyAnalyzer, analyze_health};
use canopy_core::hierarchy::{BuildOptions, HierarchyBuilder};
use canopy_core::similarity::SimilarityCalculator;
use canopy_core::types::RawNode;

fn threshold_ms(var: &str, default_ms: u64) -> Duration {
    let ms = std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

/// `departments × categories × products` leaf pages under one domain root.
fn synthetic_catalog(departments: usize, categories: usize, products: usize) -> Vec<RawNode> {
    let mut raw = vec![RawNode::new("https://shop.example/")];
    for d in 0..departments {
        raw.push(RawNode::new(format!("https://shop.example/d{d}")));
        for c in 0..categories {
            raw.push(
                RawNode::new(format!("https://shop.example/d{d}/c{c}"))
                    .with_title(format!("Category {c}")),
            );
            for p in 0..products {
                raw.push(
                    RawNode::new(format!("https://shop.example/d{d}/c{c}/p{p}"))
                        .with_title(format!("Product {p} in category {c}")),
                );
            }
        }
    }
    raw
}

#[test]
#[ignore = "performance gate; run explicitly in CI/dev workflows"]
fn perf_build_ten_thousand_nodes_under_threshold() {
    let raw = synthetic_catalog(10, 20, 50);
    assert!(raw.len() > 10_000);

    let t0 = Instant::now();
    let result = HierarchyBuilder::build(&raw, &BuildOptions::default());
    let elapsed = t0.elapsed();

    assert_eq!(result.nodes().len(), raw.len());
    assert_eq!(result.root_ids.len(), 1);
    assert!(
        elapsed <= threshold_ms("CANOPY_PERF_BUILD_MS", 5000),
        "hierarchy build exceeded threshold: {elapsed:?}"
    );
}

#[test]
#[ignore = "performance gate; run explicitly in CI/dev workflows"]
fn perf_analyze_and_health_under_threshold() {
    let raw = synthetic_catalog(5, 10, 20);
    let built = HierarchyBuilder::build(&raw, &BuildOptions::default());

    let t0 = Instant::now();
    let analysis = HierarchyAnalyzer::default().analyze(&built.hierarchy);
    let report = analyze_health(&built.hierarchy, None);
    let elapsed = t0.elapsed();

    assert!(!analysis.relationships.is_empty());
    assert_eq!(report.total_nodes, raw.len());
    assert!(
        elapsed <= threshold_ms("CANOPY_PERF_ANALYZE_MS", 10000),
        "relationship analysis exceeded threshold: {elapsed:?}"
    );
}

#[test]
#[ignore = "performance gate; run explicitly in CI/dev workflows"]
fn perf_all_pairs_duplicates_under_threshold() {
    let raw = synthetic_catalog(4, 10, 25);
    let built = HierarchyBuilder::build(&raw, &BuildOptions::default());

    let t0 = Instant::now();
    let duplicates = SimilarityCalculator::default().find_duplicates(built.nodes(), 0.85);
    let elapsed = t0.elapsed();

    assert!(duplicates.iter().all(|d| d.overall >= 0.85));
    assert!(
        elapsed <= threshold_ms("CANOPY_PERF_SIMILARITY_MS", 10000),
        "all-pairs duplicate detection exceeded threshold: {elapsed:?}"
    );
}
