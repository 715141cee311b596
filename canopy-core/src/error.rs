use crate::pipeline::job::{JobId, JobStatus};

/// Top-level Canopy error type.
///
/// All fallible operations in `canopy-core` return [`Result<T, CanopyError>`](Result).
/// Each variant wraps a domain-specific error enum, allowing callers to
/// match on the error source without losing type information.
#[derive(thiserror::Error, Debug)]
pub enum CanopyError {
    /// A URL could not be parsed.
    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Job control failed (unknown job, illegal transition, no runtime).
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// A pipeline stage could not proceed.
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),
}

/// Errors from the URL normalizer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlError {
    /// The input was empty or whitespace only.
    #[error("empty URL")]
    Empty,

    /// The input could not be parsed as an absolute URL or an absolute path.
    #[error("cannot parse {input:?}: {reason}")]
    Malformed {
        /// The raw input as supplied.
        input: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// The URL parsed but has no host (e.g. `mailto:`, `data:`).
    #[error("URL has no host: {0}")]
    NoHost(String),
}

/// Errors in Canopy configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),

    /// Reading the configuration file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from job control operations on the processing pipeline.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// No job with this id is known to the pipeline.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// The submitted job failed shape validation.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Retry was requested for a job that has not failed.
    #[error("Job {id} cannot be retried from status {status}")]
    NotRetryable {
        /// The job that was asked to retry.
        id: JobId,
        /// Its current status.
        status: JobStatus,
    },

    /// Worker tasks need a Tokio runtime and none is running.
    #[error("No Tokio runtime available to start workers")]
    NoRuntime,

    /// The pipeline has been shut down and accepts no more jobs.
    #[error("Pipeline is shut down")]
    ShutDown,
}

/// Errors raised by a stage executor. Any of these fails the job.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    /// The node source collaborator could not supply the catalog.
    #[error("Source error: {0}")]
    Source(String),

    /// The result sink collaborator rejected the output.
    #[error("Sink error: {0}")]
    Sink(String),

    /// A stage needed output from an earlier stage that is not there.
    #[error("Missing input for stage: {0}")]
    MissingInput(String),

    /// The stage ran but cannot continue.
    #[error("Stage failed: {0}")]
    Failed(String),

    /// A spawned blocking computation panicked or was aborted.
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Convenience alias for `Result<T, CanopyError>`.
pub type Result<T> = std::result::Result<T, CanopyError>;
