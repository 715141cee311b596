pub mod analyze;
pub mod build;
pub mod duplicates;
pub mod run;
pub mod similar;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Subcommand;

use canopy_core::config::CanopyConfig;
use canopy_core::error::StageError;
use canopy_core::hierarchy::{BuildOptions, HierarchyBuilder, HierarchyResult};
use canopy_core::pipeline::{NodeSource, PipelineOutput, ResultSink};
use canopy_core::types::RawNode;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the category tree from a catalog and print it
    Build(build::BuildArgs),
    /// Detect relationships, clusters and structural health
    Analyze(analyze::AnalyzeArgs),
    /// Rank the nodes most similar to one URL
    Similar(similar::SimilarArgs),
    /// List likely duplicate pairs
    Duplicates(duplicates::DuplicatesArgs),
    /// Run the full processing pipeline as a job
    Run(run::RunArgs),
}

/// Options that apply to every command.
#[derive(Debug, Default)]
pub struct Globals {
    pub config: Option<PathBuf>,
    pub quiet: bool,
}

pub async fn run(cmd: Command, globals: &Globals) -> anyhow::Result<()> {
    let config = load_config(globals.config.as_deref())?;
    match cmd {
        Command::Build(args) => build::run(args, &config).await,
        Command::Analyze(args) => analyze::run(args, &config).await,
        Command::Similar(args) => similar::run(args, &config).await,
        Command::Duplicates(args) => duplicates::run(args, &config).await,
        Command::Run(args) => run::run(args, config, globals.quiet).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CanopyConfig> {
    match path {
        Some(path) => CanopyConfig::load(path)
            .with_context(|| format!("Cannot load config: {}", path.display())),
        None => Ok(CanopyConfig::default()),
    }
}

/// Read a catalog file: a JSON array of raw node records.
pub fn load_catalog(path: &Path) -> anyhow::Result<Vec<RawNode>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read catalog: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Cannot parse catalog: {}", path.display()))
}

/// Load and build in one step; the common prefix of most commands.
pub fn build_catalog(path: &Path, config: &CanopyConfig) -> anyhow::Result<HierarchyResult> {
    let raw = load_catalog(path)?;
    Ok(HierarchyBuilder::build(&raw, &BuildOptions::from(&config.hierarchy)))
}

pub fn validate_format(format: &str) -> anyhow::Result<()> {
    match format {
        "text" | "json" => Ok(()),
        other => anyhow::bail!("Unknown format: {other}. Use: text, json"),
    }
}

// ── Pipeline collaborators ───────────────────────────────────────────

/// Node source reading one JSON catalog file. The project scope is ignored.
#[derive(Debug)]
pub struct CatalogFileSource {
    path: PathBuf,
}

impl CatalogFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl NodeSource for CatalogFileSource {
    async fn load(&self, _project_scope: &str) -> Result<Vec<RawNode>, StageError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StageError::Source(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| StageError::Source(format!("{}: {e}", self.path.display())))
    }
}

/// Sink writing the pipeline output as pretty JSON to a file, or keeping it
/// for the caller when no file is given.
#[derive(Debug, Default)]
pub struct JsonSink {
    path: Option<PathBuf>,
    last: std::sync::Mutex<Option<PipelineOutput>>,
}

impl JsonSink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            last: std::sync::Mutex::default(),
        }
    }

    pub fn take(&self) -> Option<PipelineOutput> {
        self.last.lock().expect("sink mutex poisoned").take()
    }
}

#[async_trait::async_trait]
impl ResultSink for JsonSink {
    async fn publish(&self, output: PipelineOutput) -> Result<(), StageError> {
        if let Some(path) = &self.path {
            let json =
                serde_json::to_string_pretty(&output).map_err(|e| StageError::Sink(e.to_string()))?;
            tokio::fs::write(path, json)
                .await
                .map_err(|e| StageError::Sink(format!("{}: {e}", path.display())))?;
        }
        *self.last.lock().expect("sink mutex poisoned") = Some(output);
        Ok(())
    }
}
