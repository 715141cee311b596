// Stage execution seam and the default catalog stages.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::analyze::{Analysis, HealthReport, HierarchyAnalyzer, health};
use crate::config::CanopyConfig;
use crate::error::{PipelineError, StageError};
use crate::hierarchy::{BuildOptions, BuildStats, BuildWarning, HierarchyBuilder, HierarchyResult};
use crate::similarity::SimilarityCalculator;
use crate::types::{Node, NodeId, RawNode, Relationship, SimilarityResult};
use crate::url;

use super::batch::{BatchOutcome, ItemFailure};
use super::job::{JobId, JobType, ProcessingJob, Stage};
use super::ProcessingPipeline;

/// What a stage sees of its job, plus access to batch processing.
#[derive(Debug, Clone)]
pub struct StageContext {
    job: ProcessingJob,
    pipeline: ProcessingPipeline,
}

impl StageContext {
    pub fn new(job: ProcessingJob, pipeline: ProcessingPipeline) -> Self {
        Self { job, pipeline }
    }

    /// The job as it was when the stage started.
    pub fn job(&self) -> &ProcessingJob {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.pipeline.is_cancelled(self.job.id)
    }

    /// [`ProcessingPipeline::process_in_batches`] on behalf of this job.
    pub async fn process_in_batches<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        operation: F,
    ) -> Result<BatchOutcome<R>, PipelineError>
    where
        T: Send,
        R: Send,
        E: std::fmt::Display + Send,
        F: Fn(T) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<R, E>> + Send,
    {
        self.pipeline
            .process_in_batches(self.job.id, items, operation)
            .await
    }
}

/// Executes one pipeline stage for a job.
///
/// Returning an error fails the job at that stage; later stages do not run.
#[async_trait::async_trait]
pub trait StageExecutor: Send + Sync {
    async fn run_stage(&self, stage: Stage, ctx: &StageContext) -> Result<(), StageError>;

    /// Called once the job is terminal, whatever the outcome.
    async fn finish_job(&self, _job: &ProcessingJob) {}
}

/// Supplies the raw catalog for a project scope.
#[async_trait::async_trait]
pub trait NodeSource: Send + Sync {
    async fn load(&self, project_scope: &str) -> Result<Vec<RawNode>, StageError>;
}

/// Receives the finished results of a job.
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, output: PipelineOutput) -> Result<(), StageError>;
}

/// Everything one job produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub job_id: JobId,
    pub project_scope: String,
    pub job_type: JobType,
    pub nodes: Vec<Node>,
    pub root_ids: Vec<NodeId>,
    pub max_depth: u32,
    pub build_stats: BuildStats,
    pub warnings: Vec<BuildWarning>,
    pub relationships: Vec<Relationship>,
    pub health: HealthReport,
    /// Strong sibling groups from the relationship graph.
    pub sibling_clusters: Vec<Vec<NodeId>>,
    pub duplicates: Vec<SimilarityResult>,
    /// Greedy similarity clusters with more than one member.
    pub similarity_clusters: Vec<Vec<NodeId>>,
    /// Records whose URL failed to normalize during parsing.
    pub parse_failures: Vec<ItemFailure>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Default)]
struct RunState {
    raw: Vec<RawNode>,
    parse_failures: Vec<ItemFailure>,
    built: Option<HierarchyResult>,
    analysis: Option<Analysis>,
    health: Option<HealthReport>,
    sibling_clusters: Vec<Vec<NodeId>>,
    duplicates: Vec<SimilarityResult>,
    similarity_clusters: Vec<Vec<NodeId>>,
}

/// Default executor: source → normalize → build → analyze → health and
/// clusters → duplicates → sink.
pub struct CatalogStages {
    source: Arc<dyn NodeSource>,
    sink: Arc<dyn ResultSink>,
    config: CanopyConfig,
    analyzer: HierarchyAnalyzer,
    calculator: SimilarityCalculator,
    runs: Mutex<HashMap<JobId, RunState>>,
}

impl std::fmt::Debug for CatalogStages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStages")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CatalogStages {
    pub fn new(
        source: Arc<dyn NodeSource>,
        sink: Arc<dyn ResultSink>,
        config: CanopyConfig,
    ) -> Self {
        Self {
            source,
            sink,
            analyzer: HierarchyAnalyzer::from(&config),
            calculator: SimilarityCalculator::from(&config.similarity),
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<JobId, RunState>> {
        self.runs.lock().expect("catalog stage state mutex poisoned")
    }

    fn with_run<T>(&self, id: JobId, f: impl FnOnce(&mut RunState) -> T) -> T {
        f(self.runs().entry(id).or_default())
    }

    fn take_built(&self, id: JobId) -> Result<HierarchyResult, StageError> {
        self.with_run(id, |run| run.built.take())
            .ok_or_else(|| StageError::MissingInput("hierarchy".into()))
    }

    // ── Stages ─────────────────────────────────────────────────────

    async fn parse_urls(&self, ctx: &StageContext) -> Result<(), StageError> {
        let job = ctx.job();
        let raw = self.source.load(&job.project_scope).await?;
        let total = raw.len();
        let indices: Vec<usize> = (0..raw.len()).collect();
        let records = &raw;
        let outcome = ctx
            .process_in_batches(indices, |i| async move { url::normalize(&records[i].url) })
            .await
            .map_err(|e| StageError::Failed(e.to_string()))?;

        let kept: Vec<RawNode> = match &job.job_type {
            JobType::Single { target_url } => {
                let target = url::normalize(target_url).map_err(|e| {
                    StageError::Failed(format!("target URL {target_url:?}: {e}"))
                })?;
                let prefix = format!("{}/", target.trim_end_matches('/'));
                outcome
                    .results
                    .iter()
                    .filter(|(_, normalized)| {
                        *normalized == target || normalized.starts_with(&prefix)
                    })
                    .map(|(i, _)| raw[*i].clone())
                    .collect()
            }
            JobType::Full | JobType::Incremental { .. } => raw,
        };

        info!(
            job_id = %job.id,
            records = total,
            kept = kept.len(),
            unparseable = outcome.failures.len(),
            "URLs parsed"
        );
        self.with_run(job.id, |run| {
            run.raw = kept;
            run.parse_failures = outcome.failures;
        });
        Ok(())
    }

    async fn build_hierarchy(&self, ctx: &StageContext) -> Result<(), StageError> {
        let id = ctx.job_id();
        let raw = self.with_run(id, |run| std::mem::take(&mut run.raw));
        let options = BuildOptions::from(&self.config.hierarchy);
        let built =
            tokio::task::spawn_blocking(move || HierarchyBuilder::build(&raw, &options)).await?;
        self.with_run(id, |run| run.built = Some(built));
        Ok(())
    }

    async fn detect_relationships(&self, ctx: &StageContext) -> Result<(), StageError> {
        let id = ctx.job_id();
        let built = self.take_built(id)?;
        let analyzer = self.analyzer.clone();
        let (built, analysis) = tokio::task::spawn_blocking(move || {
            let analysis = analyzer.analyze(&built.hierarchy);
            (built, analysis)
        })
        .await?;
        self.with_run(id, |run| {
            run.built = Some(built);
            run.analysis = Some(analysis);
        });
        Ok(())
    }

    async fn analyze_gaps(&self, ctx: &StageContext) -> Result<(), StageError> {
        let id = ctx.job_id();
        let (built, analysis) = self.with_run(id, |run| (run.built.take(), run.analysis.take()));
        let built = built.ok_or_else(|| StageError::MissingInput("hierarchy".into()))?;
        let analysis = analysis.ok_or_else(|| StageError::MissingInput("relationships".into()))?;
        let analyzer = self.analyzer.clone();
        let limit = self.config.analysis.unbalanced_children;

        let (built, analysis, report, clusters) = tokio::task::spawn_blocking(move || {
            let report = health::analyze_health_with(&built.hierarchy, None, limit);
            let clusters = analyzer.find_clusters(&analysis);
            (built, analysis, report, clusters)
        })
        .await?;

        debug!(
            job_id = %id,
            score = report.score,
            clusters = clusters.len(),
            "Gap analysis done"
        );
        self.with_run(id, |run| {
            run.built = Some(built);
            run.analysis = Some(analysis);
            run.health = Some(report);
            run.sibling_clusters = clusters;
        });
        Ok(())
    }

    async fn calculate_similarity(&self, ctx: &StageContext) -> Result<(), StageError> {
        let id = ctx.job_id();
        let built = self.take_built(id)?;
        let since = match ctx.job().job_type {
            JobType::Incremental { since } => Some(since),
            _ => None,
        };
        let calculator = self.calculator.clone();
        let duplicate_threshold = self.config.similarity.duplicate_threshold;
        let cluster_threshold = self.config.similarity.cluster_threshold;

        let (built, duplicates, clusters) = tokio::task::spawn_blocking(move || {
            let nodes = built.nodes();
            let changed: HashSet<NodeId> = match since {
                Some(since) => nodes
                    .iter()
                    .filter(|n| n.metadata.last_modified.is_some_and(|t| t >= since))
                    .map(|n| n.id)
                    .collect(),
                None => nodes.iter().map(|n| n.id).collect(),
            };

            let duplicates: Vec<SimilarityResult> = calculator
                .find_duplicates(nodes, duplicate_threshold)
                .into_iter()
                .filter(|r| changed.contains(&r.node1_id) || changed.contains(&r.node2_id))
                .collect();
            let scope: Vec<Node> = nodes
                .iter()
                .filter(|n| changed.contains(&n.id))
                .cloned()
                .collect();
            let clusters: Vec<Vec<NodeId>> = calculator
                .cluster_by_similarity(&scope, cluster_threshold)
                .into_iter()
                .filter(|c| c.len() > 1)
                .collect();
            (built, duplicates, clusters)
        })
        .await?;

        info!(
            job_id = %id,
            duplicates = duplicates.len(),
            clusters = clusters.len(),
            incremental = since.is_some(),
            "Similarity calculated"
        );
        self.with_run(id, |run| {
            run.built = Some(built);
            run.duplicates = duplicates;
            run.similarity_clusters = clusters;
        });
        Ok(())
    }

    async fn refresh_views(&self, ctx: &StageContext) -> Result<(), StageError> {
        let job = ctx.job();
        let run = self.runs().remove(&job.id).unwrap_or_default();
        let built = run
            .built
            .ok_or_else(|| StageError::MissingInput("hierarchy".into()))?;
        let analysis = run
            .analysis
            .ok_or_else(|| StageError::MissingInput("relationships".into()))?;

        let output = PipelineOutput {
            job_id: job.id,
            project_scope: job.project_scope.clone(),
            job_type: job.job_type.clone(),
            nodes: built.hierarchy.nodes().to_vec(),
            root_ids: built.root_ids,
            max_depth: built.max_depth,
            build_stats: built.stats,
            warnings: built.warnings,
            relationships: analysis.relationships,
            health: run.health.unwrap_or_default(),
            sibling_clusters: run.sibling_clusters,
            duplicates: run.duplicates,
            similarity_clusters: run.similarity_clusters,
            parse_failures: run.parse_failures,
            generated_at: Utc::now(),
        };
        self.sink.publish(output).await
    }
}

#[async_trait::async_trait]
impl StageExecutor for CatalogStages {
    async fn run_stage(&self, stage: Stage, ctx: &StageContext) -> Result<(), StageError> {
        match stage {
            Stage::UrlParsing => self.parse_urls(ctx).await,
            Stage::HierarchyBuilding => self.build_hierarchy(ctx).await,
            Stage::RelationshipDetection => self.detect_relationships(ctx).await,
            Stage::GapAnalysis => self.analyze_gaps(ctx).await,
            Stage::SimilarityCalculation => self.calculate_similarity(ctx).await,
            Stage::ViewRefresh => self.refresh_views(ctx).await,
            Stage::Complete => Ok(()),
        }
    }

    async fn finish_job(&self, job: &ProcessingJob) {
        self.runs().remove(&job.id);
    }
}
