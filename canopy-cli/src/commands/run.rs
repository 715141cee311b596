use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Args;
use tracing::{info, warn};

use canopy_core::config::CanopyConfig;
use canopy_core::pipeline::{
    CatalogStages, JobStatus, PipelineOutput, PipelineSettings, ProcessingJob, ProcessingPipeline,
};
use canopy_core::progress::{IndicatifReporter, ProgressReporter};

use super::{CatalogFileSource, JsonSink};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Catalog file: JSON array of raw node records
    pub catalog: PathBuf,

    /// Job type: full, incremental, single
    #[arg(long, default_value = "full", value_parser = ["full", "incremental", "single"])]
    pub mode: String,

    /// Incremental jobs: rescore nodes modified at or after this RFC 3339 time
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,

    /// Single jobs: URL whose subtree is processed
    #[arg(long)]
    pub target: Option<String>,

    /// Project scope recorded on the job
    #[arg(long, default_value = "default")]
    pub scope: String,

    /// Write the full pipeline output as JSON to this file
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Output format for stdout: text, json
    #[arg(long, default_value = "text")]
    pub format: String,
}

pub async fn run(args: RunArgs, config: CanopyConfig, quiet: bool) -> anyhow::Result<()> {
    super::validate_format(&args.format)?;
    let job = match args.mode.as_str() {
        "incremental" => {
            let since = args
                .since
                .context("--since is required for incremental jobs")?;
            ProcessingJob::incremental(&args.scope, since)
        }
        "single" => {
            let target = args
                .target
                .clone()
                .context("--target is required for single jobs")?;
            ProcessingJob::single(&args.scope, target)
        }
        _ => ProcessingJob::full(&args.scope),
    };

    let sink = Arc::new(JsonSink::new(args.output.clone()));
    let stages = CatalogStages::new(
        Arc::new(CatalogFileSource::new(&args.catalog)),
        sink.clone(),
        config.clone(),
    );
    let pipeline = ProcessingPipeline::new(
        Arc::new(stages),
        PipelineSettings::from(&config.pipeline),
    );

    let id = pipeline.submit(job).context("Cannot submit job")?;
    let reporter = Arc::new(if quiet || args.format == "json" {
        IndicatifReporter::new()
    } else {
        IndicatifReporter::visible()
    });
    reporter.start("url_parsing", Some(0));
    let bar = reporter.clone();
    pipeline.on_progress(id, move |snapshot| bar.update(snapshot))?;

    let job = tokio::select! {
        done = pipeline.wait(id) => done?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %id, "Interrupted, cancelling job");
            pipeline.cancel(id)?;
            pipeline.wait(id).await?
        }
    };
    reporter.finish();
    pipeline.remove_progress_callback(id);
    pipeline.shutdown().await;
    info!(job_id = %id, status = %job.status, "Pipeline run finished");

    match job.status {
        JobStatus::Completed => {}
        JobStatus::Cancelled => anyhow::bail!("Job {id} cancelled at {}", job.stage),
        _ => {
            let reason = job
                .error
                .map_or_else(|| "unknown error".to_string(), |e| e.message);
            anyhow::bail!("Job {id} failed at {}: {reason}", job.stage);
        }
    }

    let output = sink
        .take()
        .context("Pipeline completed without publishing output")?;
    if args.format == "json" {
        if args.output.is_none() {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        return Ok(());
    }
    print_summary(&output, args.output.as_deref());
    Ok(())
}

fn print_summary(output: &PipelineOutput, written_to: Option<&std::path::Path>) {
    println!("Job {} ({}) completed", output.job_id, output.job_type.as_str());
    println!();
    println!("  Nodes:               {}", output.nodes.len());
    println!("  Roots:               {}", output.root_ids.len());
    println!("  Max depth:           {}", output.max_depth);
    println!("  Relationships:       {}", output.relationships.len());
    println!("  Sibling clusters:    {}", output.sibling_clusters.len());
    println!("  Duplicate pairs:     {}", output.duplicates.len());
    println!("  Similarity clusters: {}", output.similarity_clusters.len());
    println!("  Health score:        {:.2}", output.health.score);

    if !output.parse_failures.is_empty() {
        println!();
        println!("  Unparseable URLs ({}):", output.parse_failures.len());
        for failure in &output.parse_failures {
            println!("    - #{}: {}", failure.index, failure.message);
        }
    }
    if !output.warnings.is_empty() {
        println!();
        println!("  Warnings ({}):", output.warnings.len());
        for warning in &output.warnings {
            println!("    - {warning}");
        }
    }
    if let Some(path) = written_to {
        println!();
        println!("  Output written to {}", path.display());
    }
}
