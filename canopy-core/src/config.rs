use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hierarchy::DEFAULT_MAX_DEPTH_WARNING;
use crate::similarity::SimilarityWeights;

/// Top-level Canopy configuration, matching `canopy.toml`.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanopyConfig {
    #[serde(default)]
    pub hierarchy: HierarchySection,
    #[serde(default)]
    pub similarity: SimilaritySection,
    #[serde(default)]
    pub analysis: AnalysisSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

impl CanopyConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.similarity.weights;
        let weights = [w.url, w.title, w.structural, w.content];
        if weights.iter().any(|x| !x.is_finite() || *x < 0.0) {
            return Err(ConfigError::Invalid(
                "similarity weights must be finite and non-negative".into(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::Invalid(
                "similarity weights must have a positive sum".into(),
            ));
        }

        let thresholds = [
            ("similarity.min_similarity", self.similarity.min_similarity),
            ("similarity.duplicate_threshold", self.similarity.duplicate_threshold),
            ("similarity.cluster_threshold", self.similarity.cluster_threshold),
            ("analysis.sibling_floor", self.analysis.sibling_floor),
            ("analysis.sibling_floor_below", self.analysis.sibling_floor_below),
            ("analysis.duplicate_strength", self.analysis.duplicate_strength),
            ("analysis.cross_link_strength", self.analysis.cross_link_strength),
            ("analysis.cluster_edge_threshold", self.analysis.cluster_edge_threshold),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }

        let counts = [
            ("pipeline.workers", self.pipeline.workers),
            ("pipeline.batch_size", self.pipeline.batch_size),
            ("pipeline.concurrency", self.pipeline.concurrency),
            ("analysis.cluster_min_size", self.analysis.cluster_min_size),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if let Some(root) = &self.hierarchy.root_url {
            match crate::url::parse(root) {
                Ok(parsed) if parsed.is_root() => {}
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "hierarchy.root_url must be a domain root, got {root}"
                    )));
                }
            }
        }
        if self.pipeline.stage_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.stage_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchySection {
    /// Run cycle, orphan and depth checks after building.
    pub validate: bool,
    /// Node that otherwise parentless nodes attach to.
    pub root_url: Option<String>,
    pub max_depth_warning: u32,
}

impl Default for HierarchySection {
    fn default() -> Self {
        Self {
            validate: true,
            root_url: None,
            max_depth_warning: DEFAULT_MAX_DEPTH_WARNING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilaritySection {
    pub weights: SimilarityWeights,
    /// Minimum overall score for `find_similar`.
    pub min_similarity: f64,
    pub duplicate_threshold: f64,
    pub cluster_threshold: f64,
    pub find_similar_limit: usize,
}

impl Default for SimilaritySection {
    fn default() -> Self {
        Self {
            weights: SimilarityWeights::default(),
            min_similarity: 0.3,
            duplicate_threshold: 0.85,
            cluster_threshold: 0.5,
            find_similar_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    /// Strength given to sibling pairs whose raw similarity is below `sibling_floor_below`.
    pub sibling_floor: f64,
    pub sibling_floor_below: f64,
    pub duplicate_strength: f64,
    pub cross_link_strength: f64,
    /// Minimum slug length for cross-link matching.
    pub cross_link_min_slug: usize,
    pub cluster_min_size: usize,
    /// Sibling edges must be strictly stronger than this to join a cluster.
    pub cluster_edge_threshold: f64,
    /// Nodes with more children than this are reported as unbalanced.
    pub unbalanced_children: usize,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            sibling_floor: 0.5,
            sibling_floor_below: 0.3,
            duplicate_strength: 0.9,
            cross_link_strength: 0.5,
            cross_link_min_slug: 3,
            cluster_min_size: 3,
            cluster_edge_threshold: 0.5,
            unbalanced_children: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub workers: usize,
    pub batch_size: usize,
    /// Items in flight at once within `process_in_batches`.
    pub concurrency: usize,
    pub stage_timeout_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            workers: 5,
            batch_size: 100,
            concurrency: 5,
            stage_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = CanopyConfig::from_toml_str("").unwrap();
        assert_eq!(config, CanopyConfig::default());
        assert_eq!(config.pipeline.workers, 5);
        assert_eq!(config.pipeline.batch_size, 100);
        assert!((config.similarity.duplicate_threshold - 0.85).abs() < f64::EPSILON);
        assert!(config.hierarchy.validate);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = CanopyConfig::from_toml_str(
            r#"
[hierarchy]
root_url = "https://shop.example/"

[similarity.weights]
url = 0.5
title = 0.5
structural = 0.0
content = 0.0

[pipeline]
workers = 2
"#,
        )
        .unwrap();
        assert_eq!(config.hierarchy.root_url.as_deref(), Some("https://shop.example/"));
        assert_eq!(config.hierarchy.max_depth_warning, 10);
        assert!((config.similarity.weights.url - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.pipeline.workers, 2);
        assert_eq!(config.pipeline.concurrency, 5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = CanopyConfig::from_toml_str("[pipeline]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = CanopyConfig::from_toml_str("[similarity]\nduplicate_threshold = 1.5\n")
            .unwrap_err();
        assert!(err.to_string().contains("duplicate_threshold"));

        let err = CanopyConfig::from_toml_str(
            "[similarity.weights]\nurl = 0.0\ntitle = 0.0\nstructural = 0.0\ncontent = 0.0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("positive sum"));

        let err = CanopyConfig::from_toml_str("[hierarchy]\nroot_url = \"/shoes\"\n").unwrap_err();
        assert!(err.to_string().contains("root_url"));
    }

    #[test]
    fn syntax_errors_are_parse_errors() {
        let err = CanopyConfig::from_toml_str("[pipeline\nworkers = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canopy.toml");
        std::fs::write(&path, "[analysis]\ncluster_min_size = 4\n").unwrap();

        let config = CanopyConfig::load(&path).unwrap();
        assert_eq!(config.analysis.cluster_min_size, 4);

        let missing = CanopyConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::NotFound(_)));
    }
}
