// Integration test utilities and catalog fixtures for Canopy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use canopy_core::config::CanopyConfig;
use canopy_core::error::StageError;
use canopy_core::pipeline::{
    CatalogStages, NodeSource, PipelineOutput, PipelineSettings, ProcessingJob, ProcessingPipeline,
    ResultSink,
};
use canopy_core::types::{Node, NodeMetadata, RawNode};

/// The five-page store from the hierarchy walkthrough: `/`, `/shoes`,
/// `/shoes/running`, `/shoes/running/mens`, `/shirts`.
pub fn scenario_a() -> Vec<RawNode> {
    ["/", "/shoes", "/shoes/running", "/shoes/running/mens", "/shirts"]
        .into_iter()
        .map(RawNode::new)
        .collect()
}

/// Fixed timestamp for `lastmod` values so incremental tests are stable.
pub fn epoch(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// A three-level store: `departments × categories × products` leaves under
/// one domain root. Products are titled per category so siblings look alike,
/// and every page carries `lastmod` = January `1 + (product % 28)`.
pub fn synthetic_catalog(departments: usize, categories: usize, products: usize) -> Vec<RawNode> {
    let mut raw = vec![RawNode::new("https://shop.example/").with_title("Home")];
    for d in 0..departments {
        raw.push(
            RawNode::new(format!("https://shop.example/dept-{d}"))
                .with_title(format!("Department {d}")),
        );
        for c in 0..categories {
            raw.push(
                RawNode::new(format!("https://shop.example/dept-{d}/cat-{c}"))
                    .with_title(format!("Category {c}")),
            );
            for p in 0..products {
                let mut node = RawNode::new(format!("https://shop.example/dept-{d}/cat-{c}/p-{p}"))
                    .with_title(format!("Category {c} product {p}"))
                    .with_metadata(NodeMetadata {
                        sku_count: Some(10 + p as u64),
                        has_content: Some(true),
                        ..NodeMetadata::default()
                    });
                #[allow(clippy::cast_possible_truncation)]
                let day = 1 + (p % 28) as u32;
                node.lastmod = Some(epoch(day));
                raw.push(node);
            }
        }
    }
    raw
}

/// Two nodes whose parents point at each other.
pub fn cyclic_pair(a: &str, b: &str) -> Vec<Node> {
    let mut node_a = Node::new(a);
    let mut node_b = Node::new(b);
    node_a.parent_id = Some(node_b.id);
    node_b.parent_id = Some(node_a.id);
    vec![node_a, node_b]
}

// ── Collaborators ────────────────────────────────────────────────

/// Node source serving fixed catalogs by project scope, with an optional
/// delay per load to keep jobs in flight.
#[derive(Debug, Default)]
pub struct MemorySource {
    catalogs: HashMap<String, Vec<RawNode>>,
    delay: Duration,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_catalog(mut self, scope: &str, raw: Vec<RawNode>) -> Self {
        self.catalogs.insert(scope.to_string(), raw);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait::async_trait]
impl NodeSource for MemorySource {
    async fn load(&self, project_scope: &str) -> Result<Vec<RawNode>, StageError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.catalogs
            .get(project_scope)
            .cloned()
            .ok_or_else(|| StageError::Source(format!("unknown scope {project_scope:?}")))
    }
}

/// Result sink that keeps every published output.
#[derive(Debug, Default)]
pub struct MemorySink {
    outputs: Mutex<Vec<PipelineOutput>>,
}

impl MemorySink {
    pub fn outputs(&self) -> Vec<PipelineOutput> {
        self.outputs.lock().expect("sink mutex poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.outputs.lock().expect("sink mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ResultSink for MemorySink {
    async fn publish(&self, output: PipelineOutput) -> Result<(), StageError> {
        self.outputs
            .lock()
            .expect("sink mutex poisoned")
            .push(output);
        Ok(())
    }
}

/// A pipeline running [`CatalogStages`] over `source`, plus the sink it publishes to.
pub fn catalog_pipeline(
    source: MemorySource,
    config: &CanopyConfig,
) -> (ProcessingPipeline, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let stages = CatalogStages::new(Arc::new(source), sink.clone(), config.clone());
    let pipeline =
        ProcessingPipeline::new(Arc::new(stages), PipelineSettings::from(&config.pipeline));
    (pipeline, sink)
}

/// Submit one job against `raw` under scope `"test"` and wait for it.
pub async fn run_job(
    raw: Vec<RawNode>,
    job: ProcessingJob,
) -> (ProcessingJob, Option<PipelineOutput>) {
    let (pipeline, sink) = catalog_pipeline(
        MemorySource::new().with_catalog(&job.project_scope, raw),
        &CanopyConfig::default(),
    );
    let id = pipeline.submit(job).expect("submit job");
    let finished = pipeline.wait(id).await.expect("wait for job");
    pipeline.shutdown().await;
    (finished, sink.outputs().pop())
}
