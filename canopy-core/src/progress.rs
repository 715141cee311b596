//! Progress reporting for pipeline jobs.
//!
//! The pipeline produces [`ProgressSnapshot`]s on demand and hands them to a
//! per-job callback. The CLI forwards them to an [`IndicatifReporter`];
//! library callers can use [`NoopReporter`] or provide their own.

// Throughput math over item counts.
#![allow(clippy::cast_precision_loss)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::pipeline::job::{JobId, JobStatus, Stage};

/// Point-in-time view of one job's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub stage: Stage,
    pub processed_items: u64,
    pub total_items: u64,
    /// Percentage in `[0, 100]`.
    pub progress: f64,
    pub elapsed: Duration,
    /// Items per second since the job started.
    pub throughput: f64,
    /// Remaining items divided by throughput; `None` until something completes.
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn compute(
        job_id: JobId,
        status: JobStatus,
        stage: Stage,
        processed_items: u64,
        total_items: u64,
        elapsed: Duration,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 {
            processed_items as f64 / secs
        } else {
            0.0
        };
        let remaining = total_items.saturating_sub(processed_items);
        let eta =
            (throughput > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / throughput));
        let progress = if status == JobStatus::Completed {
            100.0
        } else if total_items == 0 {
            0.0
        } else {
            (processed_items as f64 / total_items as f64 * 100.0).min(100.0)
        };
        Self {
            job_id,
            status,
            stage,
            processed_items,
            total_items,
            progress,
            elapsed,
            throughput,
            eta,
        }
    }
}

/// Trait for reporting progress of pipeline stages.
pub trait ProgressReporter: Send + Sync {
    /// Begin a new task with an optional total count.
    fn start(&self, task: &str, total: Option<u64>);

    /// Advance progress by the given amount.
    fn advance(&self, amount: u64);

    /// Jump to an absolute position.
    fn set_position(&self, position: u64);

    /// Mark the current task as finished.
    fn finish(&self);

    /// Display an informational message.
    fn message(&self, msg: &str);

    /// Mirror a pipeline snapshot: stage name as the message, counters as position.
    fn update(&self, snapshot: &ProgressSnapshot) {
        self.set_position(snapshot.processed_items);
        if snapshot.status.is_terminal() {
            self.finish();
        }
    }
}

/// No-op reporter for library callers that don't need progress output.
#[derive(Debug, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn start(&self, _task: &str, _total: Option<u64>) {}
    fn advance(&self, _amount: u64) {}
    fn set_position(&self, _position: u64) {}
    fn finish(&self) {}
    fn message(&self, _msg: &str) {}
}

/// Reporter backed by an `indicatif` progress bar for CLI use.
#[derive(Debug)]
pub struct IndicatifReporter {
    bar: ProgressBar,
    completed: AtomicU64,
}

impl Default for IndicatifReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatifReporter {
    /// A reporter that draws nothing (tests, `--quiet`).
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    /// A reporter drawing to stderr.
    pub fn visible() -> Self {
        Self::with_bar(ProgressBar::new(0))
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            completed: AtomicU64::new(0),
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

impl ProgressReporter for IndicatifReporter {
    fn start(&self, task: &str, total: Option<u64>) {
        self.completed.store(0, Ordering::Relaxed);
        let template = if total.is_some() {
            "{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} ({eta})"
        } else {
            "{spinner:.green} {msg} {pos} items"
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            self.bar.set_style(style.progress_chars("=> "));
        }
        self.bar.set_length(total.unwrap_or(0));
        self.bar.set_message(task.to_string());
        self.bar.reset();
    }

    fn advance(&self, amount: u64) {
        self.completed.fetch_add(amount, Ordering::Relaxed);
        self.bar.inc(amount);
    }

    fn set_position(&self, position: u64) {
        self.completed.store(position, Ordering::Relaxed);
        self.bar.set_position(position);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn message(&self, msg: &str) {
        self.bar.println(msg);
    }

    fn update(&self, snapshot: &ProgressSnapshot) {
        if self.bar.length() != Some(snapshot.total_items) {
            self.bar.set_length(snapshot.total_items);
        }
        self.bar.set_message(snapshot.stage.as_str());
        self.set_position(snapshot.processed_items);
        if snapshot.status.is_terminal() {
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_reporter_is_silent() {
        let reporter = NoopReporter;
        reporter.start("test", Some(100));
        reporter.advance(50);
        reporter.message("hello");
        reporter.finish();
    }

    #[test]
    fn indicatif_reporter_tracks_position() {
        let reporter = IndicatifReporter::new();
        reporter.start("url_parsing", Some(10));
        reporter.advance(5);
        reporter.advance(5);
        assert_eq!(reporter.completed(), 10);

        let snap = ProgressSnapshot::compute(
            JobId::new(),
            JobStatus::InProgress,
            Stage::HierarchyBuilding,
            3,
            10,
            Duration::from_secs(1),
        );
        reporter.update(&snap);
        assert_eq!(reporter.completed(), 3);
        reporter.finish();
    }

    #[test]
    fn snapshot_computes_throughput_and_eta() {
        let snap = ProgressSnapshot::compute(
            JobId::new(),
            JobStatus::InProgress,
            Stage::UrlParsing,
            50,
            200,
            Duration::from_secs(10),
        );
        assert!((snap.throughput - 5.0).abs() < 1e-9);
        assert_eq!(snap.eta, Some(Duration::from_secs(30)));
        assert!((snap.progress - 25.0).abs() < 1e-9);

        let idle = ProgressSnapshot::compute(
            JobId::new(),
            JobStatus::Pending,
            Stage::UrlParsing,
            0,
            200,
            Duration::ZERO,
        );
        assert!(idle.eta.is_none());
        assert!(idle.throughput.abs() < f64::EPSILON);
        assert!(idle.progress.abs() < f64::EPSILON);

        let done_without_items = ProgressSnapshot::compute(
            JobId::new(),
            JobStatus::Completed,
            Stage::Complete,
            0,
            0,
            Duration::from_secs(1),
        );
        assert!((done_without_items.progress - 100.0).abs() < f64::EPSILON);
    }
}
