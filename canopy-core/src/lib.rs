//! Canopy core library: URL normalization, hierarchy building, similarity
//! scoring, relationship analysis, and the batch processing pipeline.
//!
//! The usual entry points are [`hierarchy::HierarchyBuilder::build`] for a
//! one-shot tree, [`analyze::HierarchyAnalyzer`] over the result, and
//! [`pipeline::ProcessingPipeline`] with [`pipeline::CatalogStages`] to run
//! the whole sequence as a cancellable job.

pub mod analyze;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod pipeline;
pub mod progress;
pub mod similarity;
pub mod types;
pub mod url;
