//! Artifact manifest store.
//!
//! A manifest is a small JSON document in a file named `manifest_*.json`
//! inside the directory it describes. Manifests are only ever added, never
//! rewritten, so several may coexist in one directory and every lookup is a
//! linear scan over all of them. Four shapes exist, told apart by their
//! fields:
//!
//! | shape      | lives in          | fields                                   |
//! |------------|-------------------|------------------------------------------|
//! | toolchain  | cmdstan directory | three commits, three branches, three URLs |
//! | model batch| model directory   | `models: {name: artifact}`               |
//! | run        | run directory     | `jobs: [record]`                         |
//! | index      | build directory   | `cmdstan_dir`, optional `model_dir`      |
//!
//! Lookups start from the index manifests of a build directory. Files that
//! fail to parse (for example, a write interrupted mid-way) are logged and
//! skipped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::layout::{to_sorted_json_pretty, write_fresh_file};
use crate::sampler::SampleArgs;

pub const MANIFEST_PREFIX: &str = "manifest_";
pub const MANIFEST_SUFFIX: &str = ".json";

/// The six fields that decide whether two toolchain builds are
/// interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainIdentity {
    pub cmdstan_commit: String,
    pub stan_commit: String,
    pub math_commit: String,
    pub cmdstan_url: String,
    pub stan_url: String,
    pub math_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainManifest {
    pub cmdstan_commit: String,
    pub stan_commit: String,
    pub math_commit: String,
    pub cmdstan_branch: String,
    pub stan_branch: String,
    pub math_branch: String,
    pub cmdstan_url: String,
    pub stan_url: String,
    pub math_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl ToolchainManifest {
    pub fn identity(&self) -> ToolchainIdentity {
        ToolchainIdentity {
            cmdstan_commit: self.cmdstan_commit.clone(),
            stan_commit: self.stan_commit.clone(),
            math_commit: self.math_commit.clone(),
            cmdstan_url: self.cmdstan_url.clone(),
            stan_url: self.stan_url.clone(),
            math_url: self.math_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub model_file: PathBuf,
    pub data_file: PathBuf,
    pub exe_file: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelBatchManifest {
    pub models: BTreeMap<String, ModelArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub cmdstan_dir: PathBuf,
    pub name: String,
    pub fit_files: Vec<PathBuf>,
    pub fit_dir: PathBuf,
    pub args: SampleArgs,
    pub cmdstan_info: ToolchainIdentity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub jobs: Vec<RunRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Links a toolchain directory (and, once models exist, a model directory)
/// to the build directory holding this index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIndexManifest {
    pub cmdstan_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Manifest {
    Toolchain(ToolchainManifest),
    ModelBatch(ModelBatchManifest),
    Run(RunManifest),
    Index(BuildIndexManifest),
}

impl Manifest {
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::Toolchain(_) => "toolchain",
            Manifest::ModelBatch(_) => "model_batch",
            Manifest::Run(_) => "run",
            Manifest::Index(_) => "index",
        }
    }
}

pub fn now_rfc3339() -> Option<String> {
    Some(Utc::now().to_rfc3339())
}

/// Serializes `manifest` (indented, keys sorted) into a new uniquely named
/// manifest file in `dir`. Never overwrites an existing file.
pub fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<PathBuf> {
    let value = serde_json::to_value(manifest)?;
    let bytes = to_sorted_json_pretty(&value)?;
    let path = write_fresh_file(dir, MANIFEST_PREFIX, MANIFEST_SUFFIX, &bytes)?;
    info!(kind = manifest.kind(), path = %path.display(), "wrote manifest");
    Ok(path)
}

pub fn read_manifest(path: &Path) -> Result<Manifest> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Every manifest file directly inside `dir`, in path order. A missing
/// directory has no manifests.
pub fn manifest_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/{}*{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        MANIFEST_PREFIX,
        MANIFEST_SUFFIX
    );
    let mut paths = Vec::new();
    for entry in glob::glob(&pattern)? {
        match entry {
            Ok(path) if path.is_file() => paths.push(path),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "unreadable manifest candidate"),
        }
    }
    Ok(paths)
}

/// Decodes every manifest in `dir`, skipping (and logging) corrupt ones.
pub fn scan_manifests(dir: &Path) -> Result<Vec<(PathBuf, Manifest)>> {
    let mut out = Vec::new();
    for path in manifest_paths(dir)? {
        match read_manifest(&path) {
            Ok(manifest) => out.push((path, manifest)),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping corrupt manifest"),
        }
    }
    Ok(out)
}

fn index_manifests(search_dir: &Path) -> Result<Vec<BuildIndexManifest>> {
    Ok(scan_manifests(search_dir)?
        .into_iter()
        .filter_map(|(_, manifest)| match manifest {
            Manifest::Index(index) => Some(index),
            _ => None,
        })
        .collect())
}

/// First toolchain directory referenced from `search_dir` whose recorded
/// identity equals `identity` on all six fields.
pub fn find_build(search_dir: &Path, identity: &ToolchainIdentity) -> Result<Option<PathBuf>> {
    for index in index_manifests(search_dir)? {
        for (path, manifest) in scan_manifests(&index.cmdstan_dir)? {
            if let Manifest::Toolchain(toolchain) = manifest {
                if toolchain.identity() == *identity {
                    info!(
                        cmdstan_dir = %index.cmdstan_dir.display(),
                        manifest = %path.display(),
                        "found existing cmdstan build"
                    );
                    return Ok(Some(index.cmdstan_dir));
                }
            }
        }
    }
    debug!(search_dir = %search_dir.display(), "no matching cmdstan build");
    Ok(None)
}

/// Compiled artifacts for `model` built against exactly `cmdstan_dir`.
///
/// The toolchain directory must match the recorded path string as is;
/// `a/cmdstan_x` and `a/cmdstan_x/` are different toolchains here.
pub fn find_model(
    search_dir: &Path,
    cmdstan_dir: &Path,
    model: &str,
) -> Result<Option<ModelArtifact>> {
    for index in index_manifests(search_dir)? {
        if index.cmdstan_dir.as_os_str() != cmdstan_dir.as_os_str() {
            continue;
        }
        let Some(model_dir) = index.model_dir else {
            continue;
        };
        for (_, manifest) in scan_manifests(&model_dir)? {
            if let Manifest::ModelBatch(mut batch) = manifest {
                if let Some(artifact) = batch.models.remove(model) {
                    info!(model, cmdstan_dir = %cmdstan_dir.display(), "found model");
                    return Ok(Some(artifact));
                }
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::fresh_dir;

    fn toolchain_manifest(tag: &str) -> ToolchainManifest {
        ToolchainManifest {
            cmdstan_commit: format!("{}-c", tag),
            stan_commit: format!("{}-s", tag),
            math_commit: format!("{}-m", tag),
            cmdstan_branch: "develop".to_string(),
            stan_branch: "develop".to_string(),
            math_branch: "develop".to_string(),
            cmdstan_url: "https://example.org/cmdstan.git".to_string(),
            stan_url: "https://example.org/stan.git".to_string(),
            math_url: "https://example.org/math.git".to_string(),
            created_at: None,
        }
    }

    fn register_toolchain(build_dir: &Path, manifest: &ToolchainManifest) -> PathBuf {
        let cmdstan_dir = fresh_dir(build_dir, "cmdstan_").expect("cmdstan dir");
        write_manifest(&cmdstan_dir, &Manifest::Toolchain(manifest.clone())).expect("toolchain");
        write_manifest(
            build_dir,
            &Manifest::Index(BuildIndexManifest {
                cmdstan_dir: cmdstan_dir.clone(),
                model_dir: None,
            }),
        )
        .expect("index");
        cmdstan_dir
    }

    #[test]
    fn find_build_matches_all_six_fields() {
        let tmp = tempfile::tempdir().expect("tmp");
        let manifest = toolchain_manifest("a");
        let cmdstan_dir = register_toolchain(tmp.path(), &manifest);

        let identity = manifest.identity();
        assert_eq!(
            find_build(tmp.path(), &identity).expect("scan"),
            Some(cmdstan_dir)
        );

        let alterations: [fn(&mut ToolchainIdentity); 6] = [
            |i| i.cmdstan_commit.push('x'),
            |i| i.stan_commit.push('x'),
            |i| i.math_commit.push('x'),
            |i| i.cmdstan_url.push('x'),
            |i| i.stan_url.push('x'),
            |i| i.math_url.push('x'),
        ];
        for alter in alterations {
            let mut other = identity.clone();
            alter(&mut other);
            assert_eq!(find_build(tmp.path(), &other).expect("scan"), None);
        }
    }

    #[test]
    fn find_build_rejects_manifest_missing_identity_fields() {
        let tmp = tempfile::tempdir().expect("tmp");
        let cmdstan_dir = fresh_dir(tmp.path(), "cmdstan_").expect("dir");
        fs::write(
            cmdstan_dir.join("manifest_partial.json"),
            r#"{"cmdstan_commit": "a-c", "stan_commit": "a-s", "math_commit": "a-m"}"#,
        )
        .expect("write");
        write_manifest(
            tmp.path(),
            &Manifest::Index(BuildIndexManifest {
                cmdstan_dir,
                model_dir: None,
            }),
        )
        .expect("index");
        let identity = toolchain_manifest("a").identity();
        assert_eq!(find_build(tmp.path(), &identity).expect("scan"), None);
    }

    #[test]
    fn scans_tolerate_truncated_manifests() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(tmp.path().join("manifest_broken.json"), b"{\"cmdstan_dir\": ").expect("write");
        let manifest = toolchain_manifest("b");
        let cmdstan_dir = register_toolchain(tmp.path(), &manifest);
        assert_eq!(
            find_build(tmp.path(), &manifest.identity()).expect("scan"),
            Some(cmdstan_dir)
        );
        assert_eq!(scan_manifests(tmp.path()).expect("scan").len(), 1);
    }

    #[test]
    fn missing_search_dir_finds_nothing() {
        let tmp = tempfile::tempdir().expect("tmp");
        let absent = tmp.path().join("nope");
        assert_eq!(
            find_build(&absent, &toolchain_manifest("a").identity()).expect("scan"),
            None
        );
        assert_eq!(find_model(&absent, &absent, "m").expect("scan"), None);
    }

    #[test]
    fn find_model_is_scoped_to_cmdstan_dir() {
        let tmp = tempfile::tempdir().expect("tmp");
        let cmdstan_a = fresh_dir(tmp.path(), "cmdstan_").expect("a");
        let cmdstan_b = fresh_dir(tmp.path(), "cmdstan_").expect("b");
        let model_dir = fresh_dir(tmp.path(), "model_").expect("models");

        let artifact = ModelArtifact {
            name: "eight_schools".to_string(),
            model_file: model_dir.join("eight_schools_1.stan"),
            data_file: model_dir.join("eight_schools_1.json"),
            exe_file: model_dir.join("eight_schools_1"),
        };
        let mut batch = ModelBatchManifest::default();
        batch.models.insert(artifact.name.clone(), artifact.clone());
        write_manifest(&model_dir, &Manifest::ModelBatch(batch)).expect("models");
        write_manifest(
            tmp.path(),
            &Manifest::Index(BuildIndexManifest {
                cmdstan_dir: cmdstan_a.clone(),
                model_dir: Some(model_dir),
            }),
        )
        .expect("index");

        assert_eq!(
            find_model(tmp.path(), &cmdstan_a, "eight_schools").expect("scan"),
            Some(artifact)
        );
        assert_eq!(find_model(tmp.path(), &cmdstan_b, "eight_schools").expect("scan"), None);
        assert_eq!(find_model(tmp.path(), &cmdstan_a, "radon").expect("scan"), None);

        let trailing = PathBuf::from(format!("{}/", cmdstan_a.display()));
        assert_eq!(find_model(tmp.path(), &trailing, "eight_schools").expect("scan"), None);
    }

    #[test]
    fn find_build_tolerates_equal_identity_duplicates() {
        let tmp = tempfile::tempdir().expect("tmp");
        let manifest = toolchain_manifest("a");
        let first = register_toolchain(tmp.path(), &manifest);
        let second = register_toolchain(tmp.path(), &manifest);
        assert_ne!(first, second);

        let found = find_build(tmp.path(), &manifest.identity())
            .expect("scan")
            .expect("one of the duplicates");
        assert!(found == first || found == second, "{}", found.display());
        assert_eq!(
            find_build(tmp.path(), &manifest.identity()).expect("rescan"),
            Some(found)
        );
    }

    #[test]
    fn manifests_decode_into_their_shape() {
        let tmp = tempfile::tempdir().expect("tmp");
        let toolchain = Manifest::Toolchain(ToolchainManifest {
            created_at: now_rfc3339(),
            ..toolchain_manifest("a")
        });
        let index = Manifest::Index(BuildIndexManifest {
            cmdstan_dir: PathBuf::from("/x/cmdstan_1"),
            model_dir: Some(PathBuf::from("/x/model_1")),
        });
        let run = Manifest::Run(RunManifest::default());
        let batch = Manifest::ModelBatch(ModelBatchManifest::default());
        for manifest in [toolchain, index, run, batch] {
            let path = write_manifest(tmp.path(), &manifest).expect("write");
            let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
            assert!(name.starts_with(MANIFEST_PREFIX) && name.ends_with(MANIFEST_SUFFIX));
            let decoded = read_manifest(&path).expect("read");
            assert_eq!(decoded.kind(), manifest.kind());
            assert_eq!(decoded, manifest);
        }
        assert_eq!(manifest_paths(tmp.path()).expect("paths").len(), 4);
    }

    #[test]
    fn toolchain_manifest_keys_are_sorted_on_disk() {
        let tmp = tempfile::tempdir().expect("tmp");
        let path = write_manifest(tmp.path(), &Manifest::Toolchain(toolchain_manifest("a")))
            .expect("write");
        let text = fs::read_to_string(path).expect("read");
        let keys: Vec<&str> = text
            .lines()
            .filter_map(|l| l.trim().strip_prefix('"'))
            .filter_map(|l| l.split('"').next())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 9);
    }
}
