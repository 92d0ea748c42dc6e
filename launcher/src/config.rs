use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::LauncherError;

/// Which serving framework hosts the embedding model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Backend {
    Vllm,
    Sglang,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vllm" => Ok(Backend::Vllm),
            "sglang" => Ok(Backend::Sglang),
            other => Err(format!("unknown backend `{other}`, expected vllm or sglang")),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Vllm => write!(f, "vllm"),
            Backend::Sglang => write!(f, "sglang"),
        }
    }
}

/// One model row of the YAML matrix.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ModelEntry {
    pub model_id: String,
    pub backend: Option<Backend>,
    pub port: Option<u16>,
    pub max_model_len: Option<u32>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    pub chunk_sizes: Option<Vec<u32>>,
}

/// Matrix-wide defaults, overridable per model.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Defaults {
    pub backend: Option<Backend>,
    pub port: Option<u16>,
    pub max_model_len: Option<u32>,
    pub chunk_sizes: Option<Vec<u32>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Matrix {
    #[serde(default)]
    pub defaults: Defaults,
    pub models: Vec<ModelEntry>,
}

/// A model entry with every optional field settled.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedModel {
    pub model_id: String,
    pub backend: Backend,
    pub port: u16,
    pub max_model_len: Option<u32>,
    pub extra_args: Vec<String>,
    pub chunk_sizes: Vec<u32>,
}

impl Matrix {
    pub(crate) fn load(path: &Path) -> Result<Self, LauncherError> {
        let body = fs::read_to_string(path)
            .map_err(|err| LauncherError::Config(format!("{}: {err}", path.display())))?;
        serde_yaml::from_str(&body)
            .map_err(|err| LauncherError::Config(format!("{}: {err}", path.display())))
    }

    /// Settle per-model fields against matrix defaults, then against the
    /// launcher's own flags.
    pub(crate) fn resolve(&self, fallback_chunk_sizes: &[u32]) -> Vec<ResolvedModel> {
        self.models
            .iter()
            .map(|entry| ResolvedModel {
                model_id: entry.model_id.clone(),
                backend: entry
                    .backend
                    .or(self.defaults.backend)
                    .unwrap_or(Backend::Vllm),
                port: entry.port.or(self.defaults.port).unwrap_or(8000),
                max_model_len: entry.max_model_len.or(self.defaults.max_model_len),
                extra_args: entry.extra_args.clone(),
                chunk_sizes: entry
                    .chunk_sizes
                    .clone()
                    .or_else(|| self.defaults.chunk_sizes.clone())
                    .unwrap_or_else(|| fallback_chunk_sizes.to_vec()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MATRIX: &str = r#"
defaults:
  backend: vllm
  port: 8000
  chunk_sizes: [128, 512]
models:
  - model_id: BAAI/bge-large-en-v1.5
  - model_id: Alibaba-NLP/gte-Qwen2-1.5B-instruct
    backend: sglang
    port: 30000
    max_model_len: 8192
    chunk_sizes: [512, 2048]
    extra_args: ["--mem-fraction-static", "0.8"]
"#;

    #[test]
    fn matrix_resolves_defaults_and_overrides() {
        let matrix: Matrix = serde_yaml::from_str(MATRIX).unwrap();
        let models = matrix.resolve(&[64]);
        assert_eq!(models.len(), 2);

        assert_eq!(models[0].model_id, "BAAI/bge-large-en-v1.5");
        assert_eq!(models[0].backend, Backend::Vllm);
        assert_eq!(models[0].port, 8000);
        assert_eq!(models[0].chunk_sizes, vec![128, 512]);
        assert!(models[0].extra_args.is_empty());

        assert_eq!(models[1].backend, Backend::Sglang);
        assert_eq!(models[1].port, 30000);
        assert_eq!(models[1].max_model_len, Some(8192));
        assert_eq!(models[1].chunk_sizes, vec![512, 2048]);
        assert_eq!(models[1].extra_args.len(), 2);
    }

    #[test]
    fn cli_chunk_sizes_are_the_last_fallback() {
        let matrix: Matrix = serde_yaml::from_str(
            "models:\n  - model_id: org/model\n",
        )
        .unwrap();
        let models = matrix.resolve(&[256, 1024]);
        assert_eq!(models[0].chunk_sizes, vec![256, 1024]);
        assert_eq!(models[0].backend, Backend::Vllm);
        assert_eq!(models[0].port, 8000);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Matrix, _> =
            serde_yaml::from_str("models:\n  - model_id: m\n    typo_field: 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn backend_round_trips_through_str() {
        assert_eq!("vllm".parse::<Backend>().unwrap(), Backend::Vllm);
        assert_eq!("sglang".parse::<Backend>().unwrap(), Backend::Sglang);
        assert!("triton".parse::<Backend>().is_err());
        assert_eq!(Backend::Sglang.to_string(), "sglang");
    }
}
