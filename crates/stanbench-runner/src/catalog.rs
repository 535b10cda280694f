//! Benchmark model catalog.
//!
//! The orchestrators receive a [`Catalog`] explicitly. [`PosteriorDbCatalog`]
//! reads a local checkout of the posterior database:
//!
//! ```text
//! <root>/posteriors/<posterior>.json        {"model_name", "data_name", ...}
//! <root>/models/info/<model>.info.json      {"model_implementations": {"stan": {"model_code": "models/stan/<model>.stan"}}}
//! <root>/data/info/<data>.info.json         {"data_file": "data/data/<data>.json"}
//! <root>/data/data/<data>.json.zip          zipped data (a plain .json is also accepted)
//! ```
//!
//! `<root>` is either the `posterior_database` directory itself or a
//! repository checkout containing it.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq)]
pub struct Posterior {
    pub name: String,
    pub model_code: String,
    pub data: Value,
}

pub trait Catalog {
    /// Every posterior name the catalog knows, sorted.
    fn posterior_names(&self) -> anyhow::Result<Vec<String>>;

    fn posterior(&self, name: &str) -> anyhow::Result<Posterior>;
}

#[derive(Debug, Deserialize)]
struct PosteriorInfo {
    model_name: String,
    data_name: String,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    model_implementations: ModelImplementations,
}

#[derive(Debug, Deserialize)]
struct ModelImplementations {
    stan: StanImplementation,
}

#[derive(Debug, Deserialize)]
struct StanImplementation {
    model_code: String,
}

#[derive(Debug, Deserialize)]
struct DataInfo {
    data_file: String,
}

#[derive(Debug, Clone)]
pub struct PosteriorDbCatalog {
    root: PathBuf,
}

impl PosteriorDbCatalog {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let nested = path.join("posterior_database");
        let root = if nested.join("posteriors").is_dir() {
            nested
        } else {
            path.to_path_buf()
        };
        if !root.join("posteriors").is_dir() {
            return Err(anyhow!(
                "not a posterior database: {} has no posteriors/ directory",
                path.display()
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, rel: &str) -> anyhow::Result<T> {
        let path = self.root.join(rel);
        let text = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn read_data(&self, data_file: &str) -> anyhow::Result<Value> {
        let plain = self.root.join(data_file);
        if plain.is_file() {
            let text = fs::read_to_string(&plain)?;
            return Ok(serde_json::from_str(&text)?);
        }
        let zipped = self.root.join(format!("{}.zip", data_file));
        let file = fs::File::open(&zipped).with_context(|| format!("opening {}", zipped.display()))?;
        let mut archive = zip::ZipArchive::new(file)?;
        if archive.is_empty() {
            return Err(anyhow!("{} is an empty archive", zipped.display()));
        }
        let mut entry = archive.by_index(0)?;
        let mut text = String::new();
        entry.read_to_string(&mut text)?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", zipped.display()))
    }
}

impl Catalog for PosteriorDbCatalog {
    fn posterior_names(&self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(self.root.join("posteriors")).min_depth(1).max_depth(1) {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn posterior(&self, name: &str) -> anyhow::Result<Posterior> {
        let info: PosteriorInfo = self.read_json(&format!("posteriors/{}.json", name))?;
        let model: ModelInfo =
            self.read_json(&format!("models/info/{}.info.json", info.model_name))?;
        let code_path = self.root.join(&model.model_implementations.stan.model_code);
        let model_code = fs::read_to_string(&code_path)
            .with_context(|| format!("reading {}", code_path.display()))?;
        let data_info: DataInfo = self.read_json(&format!("data/info/{}.info.json", info.data_name))?;
        let data = self.read_data(&data_info.data_file)?;
        Ok(Posterior {
            name: name.to_string(),
            model_code,
            data,
        })
    }
}
