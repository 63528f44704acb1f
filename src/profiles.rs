use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{RagError, Result};
use crate::models::Filters;

/// Knobs for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub retrieve_k: usize,
    pub context_k: usize,
    /// Restrict retrieval to chunks flagged `is_ai`.
    pub ai_only: bool,
    /// When false, only chunks classified as `note` are searched.
    pub include_moc: bool,
    pub dedupe: bool,
    pub mmr: bool,
    pub mmr_lambda: f32,
    pub rerank: bool,
    pub rerank_candidates: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            retrieve_k: 30,
            context_k: 5,
            ai_only: false,
            include_moc: false,
            dedupe: true,
            mmr: false,
            mmr_lambda: 0.7,
            rerank: false,
            rerank_candidates: 20,
        }
    }
}

impl RetrievalConfig {
    /// Exact-match metadata filters implied by the flag fields.
    pub fn filters(&self) -> Filters {
        let mut filters = Filters::new();
        if self.ai_only {
            filters.insert("is_ai".to_string(), Value::Bool(true));
        }
        if !self.include_moc {
            filters.insert("classification".to_string(), Value::from("note"));
        }
        filters
    }

    pub fn with_overrides(&self, overrides: &RetrievalOverrides) -> Self {
        overrides.apply(self)
    }
}

pub fn profile_path(profiles_dir: &Path, name: &str) -> PathBuf {
    profiles_dir.join(format!("{name}.json"))
}

/// Loads `<profiles_dir>/<name>.json` on top of the defaults.
///
/// Unknown keys are ignored; missing keys keep their default.
pub fn load_profile(profiles_dir: &Path, name: &str) -> Result<RetrievalConfig> {
    let path = profile_path(profiles_dir, name);
    let raw = std::fs::read_to_string(&path).map_err(|e| RagError::Profile {
        path: path.clone(),
        message: format!("cannot read profile: {e}"),
    })?;

    let config: RetrievalConfig = serde_json::from_str(&raw).map_err(|e| RagError::Profile {
        path: path.clone(),
        message: e.to_string(),
    })?;

    tracing::info!("Loaded retrieval profile '{}' from {}", name, path.display());
    Ok(config)
}

/// Caller-supplied values; `None` keeps the prior value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrievalOverrides {
    pub retrieve_k: Option<usize>,
    pub context_k: Option<usize>,
    pub ai_only: Option<bool>,
    pub include_moc: Option<bool>,
    pub dedupe: Option<bool>,
    pub mmr: Option<bool>,
    pub mmr_lambda: Option<f32>,
    pub rerank: Option<bool>,
    pub rerank_candidates: Option<usize>,
}

impl RetrievalOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, base: &RetrievalConfig) -> RetrievalConfig {
        RetrievalConfig {
            retrieve_k: self.retrieve_k.unwrap_or(base.retrieve_k),
            context_k: self.context_k.unwrap_or(base.context_k),
            ai_only: self.ai_only.unwrap_or(base.ai_only),
            include_moc: self.include_moc.unwrap_or(base.include_moc),
            dedupe: self.dedupe.unwrap_or(base.dedupe),
            mmr: self.mmr.unwrap_or(base.mmr),
            mmr_lambda: self.mmr_lambda.unwrap_or(base.mmr_lambda),
            rerank: self.rerank.unwrap_or(base.rerank),
            rerank_candidates: self.rerank_candidates.unwrap_or(base.rerank_candidates),
        }
    }
}

/// Defaults, then the named profile if any, then the overrides.
pub fn resolve_config(
    profiles_dir: &Path,
    profile: Option<&str>,
    overrides: &RetrievalOverrides,
) -> Result<RetrievalConfig> {
    let base = match profile {
        Some(name) => load_profile(profiles_dir, name)?,
        None => RetrievalConfig::default(),
    };
    Ok(overrides.apply(&base))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_profile(dir: &Path, name: &str, body: &str) {
        std::fs::write(profile_path(dir, name), body).expect("Failed to write profile");
    }

    #[test]
    fn test_defaults() {
        let cfg = RetrievalConfig::default();
        assert_eq!(cfg.retrieve_k, 30);
        assert_eq!(cfg.context_k, 5);
        assert!(cfg.dedupe);
        assert!(!cfg.mmr && !cfg.rerank);
        assert_eq!(cfg.rerank_candidates, 20);
    }

    #[test]
    fn test_load_profile_ignores_unknown_keys() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        write_profile(
            temp_dir.path(),
            "diverse",
            r#"{"mmr": true, "mmr_lambda": 0.5, "retrieve_k": 50, "comment": "experiment 3"}"#,
        );

        let cfg = load_profile(temp_dir.path(), "diverse").unwrap();
        assert!(cfg.mmr);
        assert_eq!(cfg.mmr_lambda, 0.5);
        assert_eq!(cfg.retrieve_k, 50);
        assert_eq!(cfg.context_k, 5, "Unset keys keep defaults");
    }

    #[test]
    fn test_load_missing_profile_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let err = load_profile(temp_dir.path(), "nope").unwrap_err();
        assert!(matches!(err, RagError::Profile { .. }));
        assert!(err.to_string().contains("nope.json"));
    }

    #[test]
    fn test_load_profile_rejects_wrong_types() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        write_profile(temp_dir.path(), "bad", r#"{"retrieve_k": "many"}"#);
        assert!(matches!(
            load_profile(temp_dir.path(), "bad"),
            Err(RagError::Profile { .. })
        ));
    }

    #[test]
    fn test_overrides_keep_prior_on_none() {
        let base = RetrievalConfig {
            rerank: true,
            context_k: 8,
            ..Default::default()
        };
        let overrides = RetrievalOverrides {
            context_k: Some(3),
            mmr: Some(true),
            ..Default::default()
        };
        let cfg = overrides.apply(&base);
        assert_eq!(cfg.context_k, 3);
        assert!(cfg.mmr);
        assert!(cfg.rerank, "None must keep the profile value");
        assert_eq!(base.context_k, 8, "Base config is not mutated");
        assert!(RetrievalOverrides::default().is_empty());
    }

    #[test]
    fn test_resolve_config_layers() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        write_profile(temp_dir.path(), "p", r#"{"rerank": true, "rerank_candidates": 10}"#);
        let overrides = RetrievalOverrides {
            rerank_candidates: Some(15),
            ..Default::default()
        };
        let cfg = resolve_config(temp_dir.path(), Some("p"), &overrides).unwrap();
        assert!(cfg.rerank);
        assert_eq!(cfg.rerank_candidates, 15);

        let plain = resolve_config(temp_dir.path(), None, &RetrievalOverrides::default()).unwrap();
        assert_eq!(plain, RetrievalConfig::default());
    }

    #[test]
    fn test_filters_from_flags() {
        let cfg = RetrievalConfig::default();
        let filters = cfg.filters();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters["classification"], Value::from("note"));

        let wide = RetrievalConfig {
            ai_only: true,
            include_moc: true,
            ..Default::default()
        };
        let filters = wide.filters();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters["is_ai"], Value::Bool(true));
    }
}
