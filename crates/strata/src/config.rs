//! Search and cascade configuration.
//!
//! All types deserialize with defaults for every missing field, so a YAML
//! file only needs to name what it overrides:
//!
//! ```yaml
//! search:
//!   total_limit: 50
//! cascade:
//!   stage2_mode: realtime
//!   staged_lsp_depth: 1
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::clustering::ClusteringStrategy;
use crate::error::{Error, Result};
use crate::types::MAX_GRAPH_DEPTH;

/// Options for a single chain search call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// How many directory levels below the start to traverse (-1 = unlimited)
    pub depth: i32,
    /// Upper bound on worker threads used for fan-out
    pub max_workers: usize,
    /// Results taken from each directory store
    pub limit_per_dir: usize,
    /// Results returned after merging
    pub total_limit: usize,
    /// Also collect symbol hits
    pub include_symbols: bool,
    /// Return paths only, without excerpts
    pub files_only: bool,
    /// Skip documentation and configuration files
    pub code_only: bool,
    /// Answer symbol-shaped queries from the global symbol index
    pub enable_global_index_fast_path: bool,
    /// Fuse text and dense-vector results with RRF
    pub hybrid_mode: bool,
    /// Base RRF weights for hybrid mode
    pub hybrid_weights: HybridWeights,
    /// Add precomputed graph neighbors to plain searches
    pub enable_graph_expansion: bool,
    /// Hop bound for precomputed graph expansion
    pub graph_expansion_depth: u32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            depth: -1,
            max_workers: 8,
            limit_per_dir: 10,
            total_limit: 100,
            include_symbols: false,
            files_only: false,
            code_only: false,
            enable_global_index_fast_path: true,
            hybrid_mode: false,
            hybrid_weights: HybridWeights::default(),
            enable_graph_expansion: false,
            graph_expansion_depth: MAX_GRAPH_DEPTH,
        }
    }
}

impl SearchOptions {
    /// Traversal depth as an optional bound.
    #[must_use]
    pub fn max_depth(&self) -> Option<u32> {
        u32::try_from(self.depth).ok()
    }
}

/// Base weights for fusing text and vector rankings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridWeights {
    /// Weight of the full-text ranking
    pub fts: f64,
    /// Weight of the dense-vector ranking
    pub vector: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            fts: 0.5,
            vector: 0.5,
        }
    }
}

/// How cascade stage 2 finds related code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage2Mode {
    /// Precomputed `graph_neighbors` rows
    #[default]
    Precomputed,
    /// Live call hierarchy from a language server
    Realtime,
    /// Skip expansion
    None,
}

/// Coarse retrieval methods, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Dense embeddings with cosine similarity
    Dense,
    /// Packed binary embeddings with Hamming distance
    Binary,
    /// Full-text search
    Text,
}

/// Configuration for the cascade pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Candidates taken by the coarse stage
    pub coarse_k: usize,
    /// Results kept after clustering and returned
    pub target_count: usize,
    /// Stage 2 behaviour for `staged_cascade_search`
    pub stage2_mode: Stage2Mode,
    /// Hop bound for stage 2 in `staged_cascade_search`
    pub staged_lsp_depth: u32,
    /// Node budget for realtime expansion
    pub staged_max_nodes: usize,
    /// Base results expanded by the graph stage
    pub graph_max_expand: usize,
    /// Related results the graph stage may add
    pub graph_max_related: usize,
    /// Preferred clustering strategy
    pub clustering_strategy: ClusteringStrategy,
    /// Cosine similarity above which two results share a cluster
    pub cluster_similarity_threshold: f32,
    /// Run stage 4 when a reranker is configured
    pub enable_rerank: bool,
    /// Time budget for stages 1 and 2
    pub stage_timeout_ms: u64,
    /// Time budget for one reranker call
    pub rerank_timeout_ms: u64,
    /// Fallback order for coarse retrieval
    pub fallback_order: Vec<FallbackMode>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            coarse_k: 100,
            target_count: 10,
            stage2_mode: Stage2Mode::Precomputed,
            staged_lsp_depth: 1,
            staged_max_nodes: 50,
            graph_max_expand: 10,
            graph_max_related: 50,
            clustering_strategy: ClusteringStrategy::Embedding,
            cluster_similarity_threshold: 0.85,
            enable_rerank: true,
            stage_timeout_ms: 5_000,
            rerank_timeout_ms: 10_000,
            fallback_order: vec![FallbackMode::Dense, FallbackMode::Binary, FallbackMode::Text],
        }
    }
}

impl CascadeConfig {
    /// Fallback order starting at `preferred`.
    ///
    /// Modes listed before `preferred` are skipped. A mode missing from the
    /// configured order is tried alone. Text is always last.
    #[must_use]
    pub fn order_from(&self, preferred: FallbackMode) -> Vec<FallbackMode> {
        let mut order = match self.fallback_order.iter().position(|m| *m == preferred) {
            Some(start) => self.fallback_order[start..].to_vec(),
            None => vec![preferred],
        };
        if !order.contains(&FallbackMode::Text) {
            order.push(FallbackMode::Text);
        }
        order
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Defaults for chain searches
    pub search: SearchOptions,
    /// Cascade pipeline settings
    pub cascade: CascadeConfig,
}

impl EngineConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Write this configuration as YAML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| Error::Config(format!("YAML error: {e}")))?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Reject values the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.search.max_workers == 0 {
            return Err(Error::Config("search.max_workers must be at least 1".into()));
        }
        if self.search.graph_expansion_depth > MAX_GRAPH_DEPTH {
            return Err(Error::Config(format!(
                "search.graph_expansion_depth must be at most {MAX_GRAPH_DEPTH}"
            )));
        }
        let w = self.search.hybrid_weights;
        if w.fts < 0.0 || w.vector < 0.0 || w.fts + w.vector <= 0.0 {
            return Err(Error::Config(
                "search.hybrid_weights must be non-negative with a positive sum".into(),
            ));
        }
        if self.cascade.target_count == 0 {
            return Err(Error::Config("cascade.target_count must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.cascade.cluster_similarity_threshold) {
            return Err(Error::Config(
                "cascade.cluster_similarity_threshold must be within 0..=1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str(
            "search:\n  total_limit: 5\ncascade:\n  stage2_mode: realtime\n  staged_lsp_depth: 1\n",
        )
        .expect("valid yaml");

        assert_eq!(config.search.total_limit, 5);
        assert_eq!(config.search.limit_per_dir, SearchOptions::default().limit_per_dir);
        assert_eq!(config.cascade.stage2_mode, Stage2Mode::Realtime);
        assert_eq!(config.cascade.coarse_k, CascadeConfig::default().coarse_k);
    }

    #[test]
    fn invalid_yaml_is_a_config_error() {
        let err = EngineConfig::from_yaml_str("search: [").expect_err("malformed yaml");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validation_rejects_deep_graph_expansion() {
        let err = EngineConfig::from_yaml_str("search:\n  graph_expansion_depth: 3\n")
            .expect_err("depth above bound");
        assert!(err.to_string().contains("graph_expansion_depth"));
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("strata.yaml");
        let mut config = EngineConfig::default();
        config.cascade.fallback_order = vec![FallbackMode::Binary, FallbackMode::Text];
        config.save(&path).expect("save config");

        let loaded = EngineConfig::load(&path).expect("load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn order_from_starts_at_preferred_mode() {
        let config = CascadeConfig::default();
        assert_eq!(
            config.order_from(FallbackMode::Binary),
            vec![FallbackMode::Binary, FallbackMode::Text]
        );

        let custom = CascadeConfig {
            fallback_order: vec![FallbackMode::Binary, FallbackMode::Dense],
            ..CascadeConfig::default()
        };
        assert_eq!(
            custom.order_from(FallbackMode::Dense),
            vec![FallbackMode::Dense, FallbackMode::Text]
        );
        assert_eq!(custom.order_from(FallbackMode::Text), vec![FallbackMode::Text]);
    }
}
