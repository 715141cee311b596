use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::error::StageError;
use crate::types::RawNode;

/// Executor whose behaviour per stage is set by the test.
#[derive(Default)]
struct Scripted {
    /// Items pushed through `process_in_batches` during url_parsing.
    items: usize,
    /// Every n-th item fails (0 = none).
    fail_every: usize,
    fail_at: Option<Stage>,
    hang_at: Option<Stage>,
    /// Delay before each stage returns.
    stage_delay: Duration,
    seen: Mutex<Vec<(JobId, Stage)>>,
    batches: Mutex<Vec<usize>>,
    finished: AtomicUsize,
}

impl std::fmt::Debug for Scripted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scripted").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl StageExecutor for Scripted {
    async fn run_stage(&self, stage: Stage, ctx: &StageContext) -> Result<(), StageError> {
        self.seen
            .lock()
            .expect("seen mutex poisoned")
            .push((ctx.job_id(), stage));
        if !self.stage_delay.is_zero() {
            tokio::time::sleep(self.stage_delay).await;
        }
        if self.hang_at == Some(stage) {
            std::future::pending::<()>().await;
        }
        if self.fail_at == Some(stage) {
            return Err(StageError::Failed(format!("{stage} exploded")));
        }
        if stage == Stage::UrlParsing && self.items > 0 {
            let every = self.fail_every;
            let outcome = ctx
                .process_in_batches((0..self.items).collect(), |i: usize| async move {
                    tokio::task::yield_now().await;
                    if every > 0 && i % every == every - 1 {
                        Err(format!("item {i} rejected"))
                    } else {
                        Ok(i * 2)
                    }
                })
                .await
                .map_err(|e| StageError::Failed(e.to_string()))?;
            *self.batches.lock().expect("batches mutex poisoned") = outcome.batch_sizes;
        }
        Ok(())
    }

    async fn finish_job(&self, _job: &ProcessingJob) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

fn settings(workers: usize) -> PipelineSettings {
    PipelineSettings {
        workers,
        batch_size: 100,
        concurrency: 5,
        stage_timeout: Duration::from_secs(30),
    }
}

fn pipeline(executor: Scripted, workers: usize) -> (ProcessingPipeline, Arc<Scripted>) {
    let executor = Arc::new(executor);
    let pipeline = ProcessingPipeline::new(executor.clone(), settings(workers));
    (pipeline, executor)
}

// ── Lifecycle ──────────────────────────────────────────────────

#[tokio::test]
async fn full_job_runs_every_stage_in_order() {
    let (pipeline, exec) = pipeline(Scripted::default(), 2);
    let id = pipeline.submit(ProcessingJob::full("catalog")).unwrap();
    let job = pipeline.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.stage, Stage::Complete);
    assert!((job.progress - 100.0).abs() < f64::EPSILON);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(job.error.is_none());

    let stages: Vec<Stage> = exec
        .seen
        .lock()
        .unwrap()
        .iter()
        .filter(|(j, _)| *j == id)
        .map(|(_, s)| *s)
        .collect();
    assert_eq!(stages, Stage::SEQUENCE.to_vec());
    assert_eq!(exec.finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_job_is_rejected_on_submit() {
    let (pipeline, _) = pipeline(Scripted::default(), 1);
    let err = pipeline.submit(ProcessingJob::full("")).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidJob(_)));
    assert!(pipeline.jobs().is_empty());
}

#[test]
fn submit_without_runtime_fails() {
    let (pipeline, _) = pipeline(Scripted::default(), 1);
    let err = pipeline.submit(ProcessingJob::full("catalog")).unwrap_err();
    assert!(matches!(err, PipelineError::NoRuntime));
    assert!(pipeline.jobs().is_empty());
}

#[tokio::test]
async fn unknown_job_operations_report_not_found() {
    let (pipeline, _) = pipeline(Scripted::default(), 1);
    let ghost = JobId::new();
    assert!(pipeline.get(ghost).is_none());
    assert!(matches!(pipeline.cancel(ghost), Err(PipelineError::JobNotFound(_))));
    assert!(matches!(pipeline.retry(ghost), Err(PipelineError::JobNotFound(_))));
    assert!(matches!(pipeline.wait(ghost).await, Err(PipelineError::JobNotFound(_))));
    assert!(pipeline.on_progress(ghost, |_| {}).is_err());
}

// ── Failure handling ───────────────────────────────────────────

#[tokio::test]
async fn stage_error_fails_job_and_stops_later_stages() {
    let (pipeline, exec) = pipeline(
        Scripted {
            fail_at: Some(Stage::GapAnalysis),
            ..Scripted::default()
        },
        1,
    );
    let id = pipeline.submit(ProcessingJob::full("catalog")).unwrap();
    let job = pipeline.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.stage, Stage::GapAnalysis);
    let error = job.error.expect("failed job records an error");
    assert_eq!(error.code, JobErrorCode::StageFailed);
    assert_eq!(error.stage, Stage::GapAnalysis);
    assert!(error.message.contains("exploded"));

    let seen: Vec<Stage> = exec.seen.lock().unwrap().iter().map(|(_, s)| *s).collect();
    assert!(!seen.contains(&Stage::SimilarityCalculation));
    assert!(!seen.contains(&Stage::ViewRefresh));
    assert_eq!(exec.finished.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_stage_times_out() {
    let exec = Arc::new(Scripted {
        hang_at: Some(Stage::RelationshipDetection),
        ..Scripted::default()
    });
    let pipeline = ProcessingPipeline::new(
        exec.clone(),
        PipelineSettings {
            stage_timeout: Duration::from_millis(250),
            ..settings(1)
        },
    );
    let id = pipeline.submit(ProcessingJob::full("catalog")).unwrap();
    let job = pipeline.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, JobErrorCode::StageTimeout);
    assert_eq!(error.code.as_str(), "STAGE_TIMEOUT");
    assert_eq!(error.stage, Stage::RelationshipDetection);
    assert_eq!(error.details["timeout_ms"], 250);
}

#[tokio::test]
async fn retry_only_from_failed() {
    let (pipeline, _) = pipeline(
        Scripted {
            fail_at: Some(Stage::UrlParsing),
            ..Scripted::default()
        },
        1,
    );
    let failed = pipeline.submit(ProcessingJob::single("catalog", "/shoes")).unwrap();
    pipeline.wait(failed).await.unwrap();

    let retry = pipeline.retry(failed).unwrap();
    assert_ne!(retry, failed);
    let retried = pipeline.wait(retry).await.unwrap();
    assert_eq!(retried.retry_of, Some(failed));
    assert_eq!(
        retried.job_type,
        JobType::Single {
            target_url: "/shoes".into()
        }
    );
    // The original failure record is untouched.
    assert_eq!(pipeline.get(failed).unwrap().status, JobStatus::Failed);

    let (ok_pipeline, _) = self::pipeline(Scripted::default(), 1);
    let done = ok_pipeline.submit(ProcessingJob::full("catalog")).unwrap();
    ok_pipeline.wait(done).await.unwrap();
    let err = ok_pipeline.retry(done).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::NotRetryable {
            status: JobStatus::Completed,
            ..
        }
    ));
}

// ── Cancellation ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancelled_pending_job_never_starts() {
    let (pipeline, exec) = pipeline(
        Scripted {
            stage_delay: Duration::from_millis(50),
            ..Scripted::default()
        },
        1,
    );
    let first = pipeline.submit(ProcessingJob::full("catalog")).unwrap();
    let second = pipeline.submit(ProcessingJob::full("catalog")).unwrap();

    assert_eq!(pipeline.cancel(second).unwrap(), JobStatus::Cancelled);
    pipeline.wait(first).await.unwrap();
    let cancelled = pipeline.wait(second).await.unwrap();

    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.started_at.is_none());
    assert!(exec.seen.lock().unwrap().iter().all(|(j, _)| *j != second));
}

#[tokio::test(start_paused = true)]
async fn running_job_stops_at_next_stage_boundary() {
    let (pipeline, exec) = pipeline(
        Scripted {
            stage_delay: Duration::from_millis(100),
            ..Scripted::default()
        },
        1,
    );
    let id = pipeline.submit(ProcessingJob::full("catalog")).unwrap();

    // Let the first stage start, then cancel while it sleeps.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pipeline.cancel(id).unwrap(), JobStatus::Cancelled);
    let job = pipeline.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Cancelled);
    assert_ne!(job.stage, Stage::Complete);
    let ran = exec.seen.lock().unwrap().len();
    assert!(ran < Stage::SEQUENCE.len(), "ran {ran} stages");

    // Cancelling a terminal job is a no-op.
    assert_eq!(pipeline.cancel(id).unwrap(), JobStatus::Cancelled);
}

// ── Batches ────────────────────────────────────────────────────

#[tokio::test]
async fn batches_split_at_batch_size() {
    let (pipeline, exec) = pipeline(
        Scripted {
            items: 250,
            ..Scripted::default()
        },
        1,
    );
    let id = pipeline.submit(ProcessingJob::full("catalog")).unwrap();
    let job = pipeline.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(*exec.batches.lock().unwrap(), vec![100, 100, 50]);
    assert_eq!(job.processed_items, 250);
    assert_eq!(job.total_items, 250);
    assert!((job.progress - 100.0).abs() < f64::EPSILON);
    assert!(job.checkpoint.is_none());
}

#[tokio::test]
async fn item_failures_are_collected_not_fatal() {
    let (pipeline, _) = pipeline(Scripted::default(), 1);
    let job = ProcessingJob::full("catalog");
    let id = job.id;
    // Register the job without running it so batches can be driven directly.
    pipeline.registry().jobs.insert(id, JobEntry { job, started: None });

    let outcome = pipeline
        .process_in_batches(id, (0..10).collect::<Vec<u32>>(), |i| async move {
            if i % 3 == 0 {
                Err(format!("bad {i}"))
            } else {
                Ok(i)
            }
        })
        .await
        .unwrap();

    assert_eq!(outcome.processed(), 10);
    assert_eq!(
        outcome.failures.iter().map(|f| f.index).collect::<Vec<_>>(),
        vec![0, 3, 6, 9]
    );
    assert_eq!(outcome.failures[1].message, "bad 3");
    assert_eq!(outcome.into_values(), vec![1, 2, 4, 5, 7, 8]);
    assert_eq!(pipeline.get(id).unwrap().processed_items, 10);
}

#[tokio::test]
async fn batches_resume_from_checkpoint() {
    let (pipeline, _) = pipeline(Scripted::default(), 1);
    let mut job = ProcessingJob::full("catalog");
    job.checkpoint = Some(200);
    let id = job.id;
    pipeline.registry().jobs.insert(id, JobEntry { job, started: None });

    let outcome = pipeline
        .process_in_batches(id, (0..250).collect::<Vec<usize>>(), |i| async move {
            Ok::<_, String>(i)
        })
        .await
        .unwrap();

    assert_eq!(outcome.resumed_from, 200);
    assert_eq!(outcome.batch_sizes, vec![50]);
    assert_eq!(outcome.results.first().map(|(i, _)| *i), Some(200));
    let job = pipeline.get(id).unwrap();
    assert_eq!(job.processed_items, 250);
    assert!(job.checkpoint.is_none());
}

#[tokio::test]
async fn in_flight_items_never_exceed_concurrency() {
    let (pipeline, _) = pipeline(Scripted::default(), 1);
    let job = ProcessingJob::full("catalog");
    let id = job.id;
    pipeline.registry().jobs.insert(id, JobEntry { job, started: None });

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    // In-flight count per batch of 100.
    let per_batch: Arc<[AtomicUsize; 3]> = Arc::new(Default::default());
    let overlapped = Arc::new(AtomicUsize::new(0));

    let outcome = pipeline
        .process_in_batches(id, (0..250).collect::<Vec<usize>>(), |i| {
            let (in_flight, peak) = (in_flight.clone(), peak.clone());
            let (per_batch, overlapped) = (per_batch.clone(), overlapped.clone());
            async move {
                let batch = i / 100;
                if per_batch[..batch].iter().any(|c| c.load(Ordering::SeqCst) > 0) {
                    overlapped.fetch_add(1, Ordering::SeqCst);
                }
                per_batch[batch].fetch_add(1, Ordering::SeqCst);
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                tokio::task::yield_now().await;

                in_flight.fetch_sub(1, Ordering::SeqCst);
                per_batch[batch].fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(i)
            }
        })
        .await
        .unwrap();

    assert_eq!(outcome.processed(), 250);
    assert_eq!(peak.load(Ordering::SeqCst), 5);
    assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancelled_job_stops_between_batches() {
    let (pipeline, _) = pipeline(Scripted::default(), 1);
    let mut job = ProcessingJob::full("catalog");
    job.status = JobStatus::InProgress;
    let id = job.id;
    pipeline.registry().jobs.insert(id, JobEntry { job, started: None });

    let handle = pipeline.clone();
    let outcome = pipeline
        .process_in_batches(id, (0..250).collect::<Vec<usize>>(), move |i| {
            let handle = handle.clone();
            async move {
                if i == 150 {
                    handle.cancel(id).map_err(|e| e.to_string())?;
                }
                Ok::<_, String>(i)
            }
        })
        .await
        .unwrap();

    assert!(outcome.cancelled);
    // The second batch finishes; the third never starts.
    assert_eq!(outcome.batch_sizes, vec![100, 100]);
    let job = pipeline.get(id).unwrap();
    assert_eq!(job.checkpoint, Some(200));
    assert_eq!(job.processed_items, 200);
}

// ── Progress and stats ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn progress_callback_sees_monotonic_progress() {
    let (pipeline, _) = pipeline(
        Scripted {
            items: 120,
            stage_delay: Duration::from_millis(10),
            ..Scripted::default()
        },
        1,
    );
    let job = ProcessingJob::full("catalog");
    let id = job.id;
    let snapshots: Arc<Mutex<Vec<f64>>> = Arc::default();
    let sink = snapshots.clone();

    // Hold the single worker so the callback is registered before the job runs.
    let blocker = pipeline.submit(ProcessingJob::full("catalog")).unwrap();
    pipeline.submit(job).unwrap();
    pipeline
        .on_progress(id, move |snap| sink.lock().unwrap().push(snap.progress))
        .unwrap();
    pipeline.wait(blocker).await.unwrap();
    pipeline.wait(id).await.unwrap();

    let seen = snapshots.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert!((seen.last().copied().unwrap() - 100.0).abs() < f64::EPSILON);

    let snap = pipeline.progress(id).unwrap();
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.processed_items, 120);
    assert!(pipeline.remove_progress_callback(id));
    assert!(!pipeline.remove_progress_callback(id));
}

#[tokio::test]
async fn completed_job_without_items_reports_full_progress() {
    let (pipeline, _) = pipeline(Scripted::default(), 1);
    let id = pipeline.submit(ProcessingJob::full("catalog")).unwrap();
    let job = pipeline.wait(id).await.unwrap();
    assert_eq!(job.total_items, 0);

    let snap = pipeline.progress(id).unwrap();
    assert_eq!(snap.status, JobStatus::Completed);
    assert!((snap.progress - 100.0).abs() < f64::EPSILON);
    assert!((snap.progress - job.progress).abs() < f64::EPSILON);
}

#[tokio::test]
async fn stats_count_jobs_by_status() {
    let (pipeline, _) = pipeline(
        Scripted {
            fail_at: Some(Stage::ViewRefresh),
            ..Scripted::default()
        },
        2,
    );
    let a = pipeline.submit(ProcessingJob::full("catalog")).unwrap();
    let b = pipeline.submit(ProcessingJob::full("catalog")).unwrap();
    pipeline.wait(a).await.unwrap();
    pipeline.wait(b).await.unwrap();

    let stats = pipeline.stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.pending + stats.active + stats.completed, 0);
    assert_eq!(pipeline.jobs().len(), 2);
}

#[tokio::test]
async fn shutdown_rejects_new_jobs() {
    let (pipeline, _) = pipeline(Scripted::default(), 2);
    let id = pipeline.submit(ProcessingJob::full("catalog")).unwrap();
    pipeline.wait(id).await.unwrap();
    pipeline.shutdown().await;

    let err = pipeline.submit(ProcessingJob::full("catalog")).unwrap_err();
    assert!(matches!(err, PipelineError::ShutDown));
}

// ── Catalog stages ─────────────────────────────────────────────

struct FixedSource(Vec<RawNode>);

#[async_trait::async_trait]
impl NodeSource for FixedSource {
    async fn load(&self, project_scope: &str) -> Result<Vec<RawNode>, StageError> {
        if project_scope == "missing" {
            return Err(StageError::Source("no such catalog".into()));
        }
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct CapturingSink(Mutex<Vec<PipelineOutput>>);

#[async_trait::async_trait]
impl ResultSink for CapturingSink {
    async fn publish(&self, output: PipelineOutput) -> Result<(), StageError> {
        self.0.lock().unwrap().push(output);
        Ok(())
    }
}

fn catalog() -> Vec<RawNode> {
    [
        "https://shop.example/",
        "https://shop.example/men",
        "https://shop.example/men/shoes",
        "https://shop.example/men/shirts",
        "https://shop.example/women",
        "https://shop.example/women/shoes",
        "not a url at all",
    ]
    .into_iter()
    .map(RawNode::new)
    .collect()
}

fn catalog_pipeline() -> (ProcessingPipeline, Arc<CapturingSink>) {
    let sink = Arc::new(CapturingSink::default());
    let stages = CatalogStages::new(
        Arc::new(FixedSource(catalog())),
        sink.clone(),
        crate::config::CanopyConfig::default(),
    );
    (ProcessingPipeline::new(Arc::new(stages), settings(1)), sink)
}

#[tokio::test]
async fn catalog_stages_publish_full_output() {
    let (pipeline, sink) = catalog_pipeline();
    let id = pipeline.submit(ProcessingJob::full("shop")).unwrap();
    let job = pipeline.wait(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(job.total_items, 7);

    let outputs = sink.0.lock().unwrap();
    assert_eq!(outputs.len(), 1);
    let output = &outputs[0];
    assert_eq!(output.job_id, id);
    assert_eq!(output.nodes.len(), 7);
    assert_eq!(output.parse_failures.len(), 1);
    assert_eq!(output.parse_failures[0].index, 6);
    assert_eq!(output.health.total_nodes, 7);
    assert!(
        output
            .relationships
            .iter()
            .any(|r| r.kind == crate::types::RelationshipKind::ParentChild)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_catalog_jobs_each_publish_health_and_clusters() {
    let sink = Arc::new(CapturingSink::default());
    let stages = CatalogStages::new(
        Arc::new(FixedSource(catalog())),
        sink.clone(),
        crate::config::CanopyConfig::default(),
    );
    let pipeline = ProcessingPipeline::new(Arc::new(stages), settings(2));
    let a = pipeline.submit(ProcessingJob::full("shop")).unwrap();
    let b = pipeline.submit(ProcessingJob::full("shop")).unwrap();
    for id in [a, b] {
        let job = pipeline.wait(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    }

    let outputs = sink.0.lock().unwrap();
    assert_eq!(outputs.len(), 2);
    for output in outputs.iter() {
        assert_eq!(output.health.total_nodes, 7);
        assert!(!output.relationships.is_empty());
    }
    let ids: HashSet<JobId> = outputs.iter().map(|o| o.job_id).collect();
    assert_eq!(ids, HashSet::from([a, b]));
}

#[tokio::test]
async fn single_job_keeps_only_the_subtree() {
    let (pipeline, sink) = catalog_pipeline();
    let id = pipeline
        .submit(ProcessingJob::single("shop", "https://shop.example/men"))
        .unwrap();
    let job = pipeline.wait(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);

    let outputs = sink.0.lock().unwrap();
    let mut urls: Vec<&str> = outputs[0].nodes.iter().map(|n| n.url.as_str()).collect();
    urls.sort_unstable();
    assert_eq!(
        urls,
        vec![
            "https://shop.example/men",
            "https://shop.example/men/shirts",
            "https://shop.example/men/shoes",
        ]
    );
}

#[tokio::test]
async fn source_failure_fails_the_first_stage() {
    let (pipeline, sink) = catalog_pipeline();
    let id = pipeline.submit(ProcessingJob::full("missing")).unwrap();
    let job = pipeline.wait(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.stage, Stage::UrlParsing);
    assert!(error.message.contains("no such catalog"));
    assert!(sink.0.lock().unwrap().is_empty());
}
