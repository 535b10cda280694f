//! In-memory stand-ins for the external collaborators, used by unit tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use serde_json::Value;

use crate::catalog::{Catalog, Posterior};
use crate::compiler::ModelCompiler;
use crate::process::{CommandOutput, CommandRunner, Invocation};
use crate::sampler::{SampleRequest, Sampler};
use crate::toolchain::ToolchainSpec;

type Handler = Box<dyn Fn(&Invocation) -> Option<CommandOutput>>;

/// Records every invocation; answers with the most recently registered
/// matching handler, or a bare success.
pub(crate) struct FakeRunner {
    handlers: RefCell<Vec<Handler>>,
    calls: RefCell<Vec<Invocation>>,
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RefCell::new(Vec::new()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn handle(&self, handler: impl Fn(&Invocation) -> Option<CommandOutput> + 'static) {
        self.handlers.borrow_mut().push(Box::new(handler));
    }

    /// Matches on the program name or the first argument.
    pub(crate) fn respond(&self, key: &str, code: i32, stdout: &str) {
        let key = key.to_string();
        let stdout = stdout.to_string();
        self.handle(move |inv| {
            let hit = inv.program == key || inv.args.first() == Some(&key);
            hit.then(|| output(code, &stdout))
        });
    }

    /// Scripts `git ls-remote` answers per repository URL.
    pub(crate) fn remote_heads(&self, heads: &[(&str, &str)]) {
        let heads: BTreeMap<String, String> = heads
            .iter()
            .map(|(url, commit)| (url.to_string(), commit.to_string()))
            .collect();
        self.handle(move |inv| {
            if inv.args.first().map(String::as_str) != Some("ls-remote") {
                return None;
            }
            let url = inv.args.get(2)?;
            let commit = heads.get(url)?;
            Some(output(0, &format!("{}\trefs/heads/x\n", commit)))
        });
    }

    pub(crate) fn calls(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    pub(crate) fn count(&self, key: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|inv| inv.program == key || inv.args.first().map(String::as_str) == Some(key))
            .count()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> crate::Result<CommandOutput> {
        self.calls.borrow_mut().push(invocation.clone());
        let handlers = self.handlers.borrow();
        for handler in handlers.iter().rev() {
            if let Some(out) = handler(invocation) {
                return Ok(out);
            }
        }
        Ok(output(0, ""))
    }
}

pub(crate) fn output(code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub(crate) fn spec(tag: &str) -> ToolchainSpec {
    ToolchainSpec {
        cmdstan_branch: "develop".to_string(),
        stan_branch: "develop".to_string(),
        math_branch: "develop".to_string(),
        cmdstan_url: format!("https://example.org/{}/cmdstan.git", tag),
        stan_url: format!("https://example.org/{}/stan.git", tag),
        math_url: format!("https://example.org/{}/math.git", tag),
    }
}

/// Scripts heads `<tag>-cmdstan`, `<tag>-stan`, `<tag>-math` for [`spec`].
pub(crate) fn remote_heads_for(runner: &FakeRunner, tag: &str) {
    let s = spec(tag);
    let cmdstan = format!("{}-cmdstan", tag);
    let stan = format!("{}-stan", tag);
    let math = format!("{}-math", tag);
    runner.remote_heads(&[
        (s.cmdstan_url.as_str(), cmdstan.as_str()),
        (s.stan_url.as_str(), stan.as_str()),
        (s.math_url.as_str(), math.as_str()),
    ]);
}

#[derive(Default)]
pub(crate) struct MemoryCatalog {
    posteriors: BTreeMap<String, Posterior>,
}

impl MemoryCatalog {
    pub(crate) fn with(names: &[&str]) -> Self {
        let mut catalog = Self::default();
        for name in names {
            catalog.posteriors.insert(
                name.to_string(),
                Posterior {
                    name: name.to_string(),
                    model_code: "parameters { real mu; }\nmodel { mu ~ normal(0, 1); }".to_string(),
                    data: serde_json::json!({ "N": 1 }),
                },
            );
        }
        catalog
    }

    pub(crate) fn insert(&mut self, posterior: Posterior) {
        self.posteriors.insert(posterior.name.clone(), posterior);
    }
}

impl Catalog for MemoryCatalog {
    fn posterior_names(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.posteriors.keys().cloned().collect())
    }

    fn posterior(&self, name: &str) -> anyhow::Result<Posterior> {
        self.posteriors
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("posterior '{}' not in catalog", name))
    }
}

/// Writes an empty executable next to the model source; fails for names in
/// `failing`.
#[derive(Default)]
pub(crate) struct FakeCompiler {
    pub(crate) failing: BTreeSet<String>,
    pub(crate) compiled: RefCell<Vec<String>>,
}

impl FakeCompiler {
    pub(crate) fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|s| s.to_string()).collect(),
            compiled: RefCell::new(Vec::new()),
        }
    }
}

impl ModelCompiler for FakeCompiler {
    fn compile(&self, _cmdstan_dir: &Path, name: &str, model_file: &Path) -> anyhow::Result<PathBuf> {
        if self.failing.contains(name) {
            return Err(anyhow!("syntax error in {}", model_file.display()));
        }
        self.compiled.borrow_mut().push(name.to_string());
        let exe = model_file.with_extension("");
        fs::write(&exe, b"")?;
        Ok(exe)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SampleCall {
    pub(crate) name: String,
    pub(crate) cmdstan_dir: PathBuf,
    pub(crate) output_dir: PathBuf,
    pub(crate) chain_ids: u64,
    pub(crate) chains: u64,
    pub(crate) args: Value,
}

/// Writes one CSV per chain; fails for names in `failing`.
#[derive(Default)]
pub(crate) struct FakeSampler {
    pub(crate) failing: BTreeSet<String>,
    pub(crate) calls: RefCell<Vec<SampleCall>>,
}

impl FakeSampler {
    pub(crate) fn failing(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|s| s.to_string()).collect(),
            calls: RefCell::new(Vec::new()),
        }
    }
}

impl Sampler for FakeSampler {
    fn sample(&self, request: &SampleRequest<'_>) -> anyhow::Result<Vec<PathBuf>> {
        let chain_ids = request.args.chain_ids.unwrap_or(1);
        let chains = request.args.chain_count();
        self.calls.borrow_mut().push(SampleCall {
            name: request.job.name.clone(),
            cmdstan_dir: request.job.cmdstan_dir.clone(),
            output_dir: request.output_dir.to_path_buf(),
            chain_ids,
            chains,
            args: serde_json::to_value(request.args)?,
        });
        if self.failing.contains(&request.job.name) {
            return Err(anyhow!("sampler crashed"));
        }
        let mut files = Vec::new();
        for id in chain_ids..chain_ids + chains {
            let path = request
                .output_dir
                .join(format!("{}_{}.csv", request.job.name, id));
            if path.exists() {
                return Err(anyhow!("output collision: {}", path.display()));
            }
            fs::write(&path, b"lp__\n0\n")?;
            files.push(path);
        }
        Ok(files)
    }
}
