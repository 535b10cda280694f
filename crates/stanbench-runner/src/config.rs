use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};
use crate::toolchain::ToolchainSpec;

/// Experiment description: which models to benchmark against which
/// toolchain revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Requested model names; empty means every catalog model.
    #[serde(default)]
    pub posteriors: Vec<String>,
    pub cmdstans: Vec<ToolchainSpec>,
}

impl BenchConfig {
    pub fn validate(&self, path: &Path) -> Result<()> {
        if self.cmdstans.is_empty() {
            return Err(config_error(path, "no cmdstans configured"));
        }
        for (i, spec) in self.cmdstans.iter().enumerate() {
            let fields = [
                ("cmdstan_branch", &spec.cmdstan_branch),
                ("stan_branch", &spec.stan_branch),
                ("math_branch", &spec.math_branch),
                ("cmdstan_url", &spec.cmdstan_url),
                ("stan_url", &spec.stan_url),
                ("math_url", &spec.math_url),
            ];
            if let Some((field, _)) = fields.iter().find(|(_, value)| value.trim().is_empty()) {
                return Err(config_error(path, &format!("cmdstans[{}].{} is empty", i, field)));
            }
        }
        if let Some(name) = self.posteriors.iter().find(|n| n.trim().is_empty()) {
            return Err(config_error(path, &format!("blank posterior name {:?}", name)));
        }
        Ok(())
    }
}

fn config_error(path: &Path, detail: &str) -> BenchError {
    BenchError::Config {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

/// Reads a JSON or YAML (`.yaml`/`.yml`) experiment file.
pub fn load_config(path: &Path) -> Result<BenchConfig> {
    let text = fs::read_to_string(path).map_err(|err| config_error(path, &err.to_string()))?;
    let is_yaml = matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    );
    let config: BenchConfig = if is_yaml {
        serde_yaml::from_str(&text).map_err(|err| config_error(path, &err.to_string()))?
    } else {
        serde_json::from_str(&text).map_err(|err| config_error(path, &err.to_string()))?
    };
    config.validate(path)?;
    Ok(config)
}
