//! Model compilation against a built toolchain.
//!
//! Models already recorded for the toolchain are reused. The rest are
//! materialized from the catalog into a fresh `model_*` directory and
//! compiled one by one. A model that fails is logged and left out of the
//! batch manifest, so it is attempted again on the next run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::catalog::{Catalog, Posterior};
use crate::compiler::ModelCompiler;
use crate::error::{BenchError, Result};
use crate::layout::{fresh_dir, to_sorted_json_pretty, write_fresh_file};
use crate::manifest::{
    find_model, now_rfc3339, write_manifest, BuildIndexManifest, Manifest, ModelArtifact,
    ModelBatchManifest,
};

#[derive(Debug, Default)]
pub struct ModelBuildOutcome {
    /// Fresh model directory; `None` when every model was already built.
    pub model_dir: Option<PathBuf>,
    /// Usable artifacts, reused and newly compiled, keyed by model name.
    pub models: BTreeMap<String, ModelArtifact>,
    /// Newly compiled names, in build order.
    pub built: Vec<String>,
    /// One `BenchError::Compile` per model that failed.
    pub failures: Vec<BenchError>,
}

/// Rewrites the deprecated `<-` assignment operator to `=`.
pub fn normalize_model_code(code: &str) -> String {
    code.replace("<-", "=")
}

/// Names to build: `requested`, or every catalog entry when it is empty.
pub fn requested_names(requested: &[String], catalog: &dyn Catalog) -> Result<Vec<String>> {
    if !requested.is_empty() {
        return Ok(requested.to_vec());
    }
    catalog.posterior_names().map_err(|err| BenchError::Catalog {
        detail: format!("cannot list models: {:#}", err),
    })
}

pub fn setup_models(
    build_dir: &Path,
    cmdstan_dir: &Path,
    requested: &[String],
    catalog: &dyn Catalog,
    compiler: &dyn ModelCompiler,
) -> Result<ModelBuildOutcome> {
    let mut outcome = ModelBuildOutcome::default();

    let mut to_build = Vec::new();
    for name in requested_names(requested, catalog)? {
        match find_model(build_dir, cmdstan_dir, &name)? {
            Some(artifact) => {
                outcome.models.insert(name, artifact);
            }
            None => to_build.push(name),
        }
    }
    if to_build.is_empty() {
        return Ok(outcome);
    }

    let model_dir = fresh_dir(build_dir, "model_")?;
    info!(model_dir = %model_dir.display(), count = to_build.len(), "building models");

    let mut batch = ModelBatchManifest {
        models: BTreeMap::new(),
        created_at: now_rfc3339(),
    };
    let total = to_build.len();
    for (n, name) in to_build.into_iter().enumerate() {
        info!("building model ({}/{}): {}", n + 1, total, name);
        match build_one(cmdstan_dir, &model_dir, &name, catalog, compiler) {
            Ok(artifact) => {
                batch.models.insert(name.clone(), artifact.clone());
                outcome.models.insert(name.clone(), artifact);
                outcome.built.push(name);
            }
            Err(err) => {
                warn!(model = %name, cmdstan_dir = %cmdstan_dir.display(), error = %format!("{:#}", err), "model failed");
                outcome.failures.push(BenchError::Compile {
                    name,
                    cmdstan_dir: cmdstan_dir.to_path_buf(),
                    detail: format!("{:#}", err),
                });
            }
        }
    }

    write_manifest(&model_dir, &Manifest::ModelBatch(batch))?;
    write_manifest(
        build_dir,
        &Manifest::Index(BuildIndexManifest {
            cmdstan_dir: cmdstan_dir.to_path_buf(),
            model_dir: Some(model_dir.clone()),
        }),
    )?;
    outcome.model_dir = Some(model_dir);
    Ok(outcome)
}

fn build_one(
    cmdstan_dir: &Path,
    model_dir: &Path,
    name: &str,
    catalog: &dyn Catalog,
    compiler: &dyn ModelCompiler,
) -> anyhow::Result<ModelArtifact> {
    let Posterior {
        model_code, data, ..
    } = catalog.posterior(name)?;
    let prefix = format!("{}_", name);

    let mut source = normalize_model_code(&model_code);
    if !source.ends_with('\n') {
        source.push('\n');
    }
    let model_file = write_fresh_file(model_dir, &prefix, ".stan", source.as_bytes())?;
    let data_file = write_fresh_file(model_dir, &prefix, ".json", &to_sorted_json_pretty(&data)?)?;
    let exe_file = compiler.compile(cmdstan_dir, name, &model_file)?;

    Ok(ModelArtifact {
        name: name.to_string(),
        model_file,
        data_file,
        exe_file,
    })
}
