use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a job processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobType {
    /// The whole catalog.
    Full,
    /// Only nodes modified since `since` are rescored.
    Incremental { since: DateTime<Utc> },
    /// The subtree under one URL.
    Single { target_url: String },
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental { .. } => "incremental",
            Self::Single { .. } => "single",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal moves: `pending → in_progress | cancelled`,
    /// `in_progress → completed | failed | cancelled`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress | Self::Cancelled)
                | (
                    Self::InProgress,
                    Self::Completed | Self::Failed | Self::Cancelled
                )
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    UrlParsing,
    HierarchyBuilding,
    RelationshipDetection,
    GapAnalysis,
    SimilarityCalculation,
    ViewRefresh,
    Complete,
}

impl Stage {
    /// Every stage that does work, in order. `Complete` is the terminal marker.
    pub const SEQUENCE: [Self; 6] = [
        Self::UrlParsing,
        Self::HierarchyBuilding,
        Self::RelationshipDetection,
        Self::GapAnalysis,
        Self::SimilarityCalculation,
        Self::ViewRefresh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UrlParsing => "url_parsing",
            Self::HierarchyBuilding => "hierarchy_building",
            Self::RelationshipDetection => "relationship_detection",
            Self::GapAnalysis => "gap_analysis",
            Self::SimilarityCalculation => "similarity_calculation",
            Self::ViewRefresh => "view_refresh",
            Self::Complete => "complete",
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::UrlParsing => Some(Self::HierarchyBuilding),
            Self::HierarchyBuilding => Some(Self::RelationshipDetection),
            Self::RelationshipDetection => Some(Self::GapAnalysis),
            Self::GapAnalysis => Some(Self::SimilarityCalculation),
            Self::SimilarityCalculation => Some(Self::ViewRefresh),
            Self::ViewRefresh => Some(Self::Complete),
            Self::Complete => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobErrorCode {
    StageFailed,
    StageTimeout,
}

impl JobErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageFailed => "STAGE_FAILED",
            Self::StageTimeout => "STAGE_TIMEOUT",
        }
    }
}

/// Why a job failed. Recorded once; the job runs no further stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub code: JobErrorCode,
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl JobError {
    pub fn new(code: JobErrorCode, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            stage,
            timestamp: Utc::now(),
            details: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// One unit of pipeline work and its live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: JobId,
    /// Catalog or tenant the job runs against; passed to the node source.
    pub project_scope: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub stage: Stage,
    /// Percentage in `[0, 100]`.
    pub progress: f64,
    pub processed_items: u64,
    pub total_items: u64,
    /// Items before this index are done; batch processing resumes here.
    pub checkpoint: Option<usize>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The failed job this one retries.
    pub retry_of: Option<JobId>,
}

impl ProcessingJob {
    pub fn new(project_scope: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id: JobId::new(),
            project_scope: project_scope.into(),
            job_type,
            status: JobStatus::Pending,
            stage: Stage::UrlParsing,
            progress: 0.0,
            processed_items: 0,
            total_items: 0,
            checkpoint: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_of: None,
        }
    }

    pub fn full(project_scope: impl Into<String>) -> Self {
        Self::new(project_scope, JobType::Full)
    }

    pub fn incremental(project_scope: impl Into<String>, since: DateTime<Utc>) -> Self {
        Self::new(project_scope, JobType::Incremental { since })
    }

    pub fn single(project_scope: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self::new(
            project_scope,
            JobType::Single {
                target_url: target_url.into(),
            },
        )
    }

    /// Shape check performed on submit.
    pub fn validate(&self) -> Result<(), String> {
        if self.status != JobStatus::Pending {
            return Err(format!("job must be pending, is {}", self.status));
        }
        if self.project_scope.trim().is_empty() {
            return Err("project scope is empty".into());
        }
        if let JobType::Single { target_url } = &self.job_type {
            if target_url.trim().is_empty() {
                return Err("single job needs a target URL".into());
            }
        }
        if !(0.0..=100.0).contains(&self.progress) {
            return Err(format!("progress {} out of range", self.progress));
        }
        Ok(())
    }

    /// A fresh pending job with the same configuration, counters and error cleared.
    pub fn retried(&self) -> Self {
        Self {
            retry_of: Some(self.id),
            ..Self::new(self.project_scope.clone(), self.job_type.clone())
        }
    }

    /// Refresh `progress` from the item counters.
    #[allow(clippy::cast_precision_loss)]
    pub fn recompute_progress(&mut self) {
        self.progress = if self.total_items == 0 {
            0.0
        } else {
            (self.processed_items as f64 / self.total_items as f64 * 100.0).min(100.0)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_run_in_fixed_order() {
        let mut seen = vec![Stage::UrlParsing];
        let mut stage = Stage::UrlParsing;
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        let mut expected = Stage::SEQUENCE.to_vec();
        expected.push(Stage::Complete);
        assert_eq!(seen, expected);
    }

    #[test]
    fn status_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Pending));
        assert!(Cancelled.is_terminal());
        assert!(!InProgress.is_terminal());
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        assert!(ProcessingJob::full("catalog").validate().is_ok());
        assert!(ProcessingJob::full("  ").validate().is_err());
        assert!(ProcessingJob::single("catalog", "").validate().is_err());

        let mut started = ProcessingJob::full("catalog");
        started.status = JobStatus::InProgress;
        assert!(started.validate().is_err());
    }

    #[test]
    fn retried_copies_configuration_only() {
        let mut failed = ProcessingJob::single("catalog", "/shoes");
        failed.status = JobStatus::Failed;
        failed.processed_items = 40;
        failed.progress = 40.0;
        failed.checkpoint = Some(40);
        failed.error = Some(JobError::new(
            JobErrorCode::StageTimeout,
            Stage::GapAnalysis,
            "timed out",
        ));

        let retry = failed.retried();
        assert_ne!(retry.id, failed.id);
        assert_eq!(retry.retry_of, Some(failed.id));
        assert_eq!(retry.job_type, failed.job_type);
        assert_eq!(retry.status, JobStatus::Pending);
        assert_eq!(retry.processed_items, 0);
        assert!(retry.error.is_none());
        assert!(retry.checkpoint.is_none());
    }

    #[test]
    fn job_serializes_with_snake_case_tags() {
        let job = ProcessingJob::single("catalog", "/shoes");
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["stage"], "url_parsing");
        assert_eq!(json["job_type"]["type"], "single");
        assert_eq!(json["job_type"]["target_url"], "/shoes");

        let err = JobError::new(JobErrorCode::StageFailed, Stage::ViewRefresh, "boom");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "STAGE_FAILED");
        assert!(json.get("details").is_none());
    }
}
