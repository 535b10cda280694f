use std::path::PathBuf;

use thiserror::Error;

use crate::process::CommandOutput;
use crate::toolchain::Repo;

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("failed to resolve head of '{branch}' at {url}: {detail}")]
    Resolution {
        url: String,
        branch: String,
        detail: String,
    },

    #[error("{repo} failed to clone {url} (branch {branch}): {output}")]
    Clone {
        repo: Repo,
        url: String,
        branch: String,
        output: CommandOutput,
    },

    #[error("cmdstan failed to build in {}: {output}", dir.display())]
    Build { dir: PathBuf, output: CommandOutput },

    /// Per-model failure; collected, never propagated out of a batch.
    #[error("model {name} failed for cmdstan {}: {detail}", cmdstan_dir.display())]
    Compile {
        name: String,
        cmdstan_dir: PathBuf,
        detail: String,
    },

    /// Per-invocation failure; collected, never propagated out of a batch.
    #[error("sampling failed: {name} -> cmdstan {}: {detail}", cmdstan_dir.display())]
    Sample {
        name: String,
        cmdstan_dir: PathBuf,
        detail: String,
    },

    #[error("{what} not found under {}; check the build directory or re-run the build phase", build_dir.display())]
    NotFound { what: String, build_dir: PathBuf },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog unavailable: {detail}")]
    Catalog { detail: String },

    /// A top-level failure that ended a phase after per-item failures had
    /// already been collected.
    #[error("{source} (after {} earlier model failure(s))", failures.len())]
    Aborted {
        #[source]
        source: Box<BenchError>,
        failures: Vec<BenchError>,
    },

    #[error("invalid configuration {}: {detail}", path.display())]
    Config { path: PathBuf, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

impl BenchError {
    /// Stable short code used by the CLI's JSON error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            BenchError::Resolution { .. } => "resolution_error",
            BenchError::Clone { .. } => "clone_error",
            BenchError::Build { .. } => "build_error",
            BenchError::Compile { .. } => "compile_error",
            BenchError::Sample { .. } => "sample_error",
            BenchError::NotFound { .. } => "not_found",
            BenchError::Spawn { .. } => "spawn_error",
            BenchError::Catalog { .. } => "catalog_error",
            BenchError::Aborted { source, .. } => source.code(),
            BenchError::Config { .. } => "config_error",
            BenchError::Io(_) => "io_error",
            BenchError::Json(_) | BenchError::Yaml(_) => "serialization_error",
            BenchError::Pattern(_) => "pattern_error",
        }
    }

    /// Per-item failures collected before a phase aborted.
    pub fn collected_failures(&self) -> &[BenchError] {
        match self {
            BenchError::Aborted { failures, .. } => failures,
            _ => &[],
        }
    }

    /// Name of the model or job a per-item failure refers to.
    pub fn item_name(&self) -> Option<&str> {
        match self {
            BenchError::Compile { name, .. } | BenchError::Sample { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_item_errors_name_model_and_toolchain() {
        let err = BenchError::Sample {
            name: "eight_schools".to_string(),
            cmdstan_dir: PathBuf::from("/tmp/build/cmdstan_x"),
            detail: "exit status 70".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("eight_schools"), "{}", text);
        assert!(text.contains("/tmp/build/cmdstan_x"), "{}", text);
        assert_eq!(err.code(), "sample_error");
        assert_eq!(err.item_name(), Some("eight_schools"));
    }

    #[test]
    fn top_level_errors_have_no_item_name() {
        let err = BenchError::NotFound {
            what: "cmdstan".to_string(),
            build_dir: PathBuf::from("/tmp/build"),
        };
        assert_eq!(err.item_name(), None);
        assert_eq!(err.code(), "not_found");
        assert!(err.collected_failures().is_empty());
    }

    #[test]
    fn aborted_phase_keeps_cause_code_and_earlier_failures() {
        let err = BenchError::Aborted {
            source: Box::new(BenchError::NotFound {
                what: "cmdstan".to_string(),
                build_dir: PathBuf::from("/tmp/build"),
            }),
            failures: vec![BenchError::Compile {
                name: "radon".to_string(),
                cmdstan_dir: PathBuf::from("/tmp/build/cmdstan_a"),
                detail: "syntax error".to_string(),
            }],
        };
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.collected_failures()[0].item_name(), Some("radon"));
        assert!(err.to_string().contains("1 earlier model failure"), "{}", err);
    }
}
