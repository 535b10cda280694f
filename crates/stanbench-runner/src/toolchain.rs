//! CmdStan toolchain builds.
//!
//! A build is resolved to three commits, looked up in the build directory,
//! and only checked out and built when no manifest records the same
//! identity. Each phase is logged; the first failing phase aborts the build.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BenchError, Result};
use crate::layout::fresh_dir;
use crate::manifest::{
    find_build, now_rfc3339, write_manifest, BuildIndexManifest, Manifest, ToolchainIdentity,
    ToolchainManifest,
};
use crate::process::{CommandRunner, Invocation};
use crate::vcs::Git;

/// The three repositories that make up one toolchain checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repo {
    Cmdstan,
    Stan,
    Math,
}

impl Repo {
    pub const ALL: [Repo; 3] = [Repo::Cmdstan, Repo::Stan, Repo::Math];

    /// Checkout location relative to the toolchain directory.
    pub fn subpath(self) -> &'static str {
        match self {
            Repo::Cmdstan => "",
            Repo::Stan => "stan",
            Repo::Math => "stan/lib/stan_math",
        }
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Repo::Cmdstan => "cmdstan",
            Repo::Stan => "stan",
            Repo::Math => "math",
        })
    }
}

/// One entry of the configuration's `cmdstans` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainSpec {
    pub cmdstan_branch: String,
    pub stan_branch: String,
    pub math_branch: String,
    pub cmdstan_url: String,
    pub stan_url: String,
    pub math_url: String,
}

impl ToolchainSpec {
    pub fn url(&self, repo: Repo) -> &str {
        match repo {
            Repo::Cmdstan => &self.cmdstan_url,
            Repo::Stan => &self.stan_url,
            Repo::Math => &self.math_url,
        }
    }

    pub fn branch(&self, repo: Repo) -> &str {
        match repo {
            Repo::Cmdstan => &self.cmdstan_branch,
            Repo::Stan => &self.stan_branch,
            Repo::Math => &self.math_branch,
        }
    }
}

/// External build script, run as `[interpreter] script --cores=N <dir>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildScript {
    pub interpreter: Option<String>,
    pub script: PathBuf,
}

impl BuildScript {
    fn invocation(&self, cores: usize, cmdstan_dir: &Path) -> Invocation {
        let inv = match &self.interpreter {
            Some(interpreter) => Invocation::new(interpreter).path_arg(&self.script),
            None => Invocation::new(self.script.to_string_lossy().to_string()),
        };
        inv.arg(format!("--cores={}", cores)).path_arg(cmdstan_dir)
    }
}

impl Default for BuildScript {
    fn default() -> Self {
        Self {
            interpreter: Some("Rscript".to_string()),
            script: PathBuf::from("R/build_cmdstan.R"),
        }
    }
}

pub struct BuildEnv<'a> {
    pub runner: &'a dyn CommandRunner,
    pub git: String,
    pub build_script: BuildScript,
    pub cores: usize,
}

impl<'a> BuildEnv<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            git: "git".to_string(),
            build_script: BuildScript::default(),
            cores: 1,
        }
    }

    pub fn git(&self) -> Git<'a> {
        Git::new(self.runner, self.git.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainBuild {
    pub cmdstan_dir: PathBuf,
    pub identity: ToolchainIdentity,
    /// True when an existing build was found and nothing was cloned or built.
    pub reused: bool,
}

/// Resolves the current tip commit of each of the three branches.
pub fn resolve_identity(git: &Git<'_>, spec: &ToolchainSpec) -> Result<ToolchainIdentity> {
    let cmdstan_commit = git.resolve_head(&spec.cmdstan_url, &spec.cmdstan_branch)?;
    let stan_commit = git.resolve_head(&spec.stan_url, &spec.stan_branch)?;
    let math_commit = git.resolve_head(&spec.math_url, &spec.math_branch)?;
    Ok(ToolchainIdentity {
        cmdstan_commit,
        stan_commit,
        math_commit,
        cmdstan_url: spec.cmdstan_url.clone(),
        stan_url: spec.stan_url.clone(),
        math_url: spec.math_url.clone(),
    })
}

/// Returns a toolchain directory for `spec`, building one under `build_dir`
/// only when no recorded build has the same identity.
pub fn setup_toolchain(env: &BuildEnv<'_>, build_dir: &Path, spec: &ToolchainSpec) -> Result<ToolchainBuild> {
    let git = env.git();
    let identity = resolve_identity(&git, spec)?;

    if let Some(cmdstan_dir) = find_build(build_dir, &identity)? {
        return Ok(ToolchainBuild {
            cmdstan_dir,
            identity,
            reused: true,
        });
    }

    let cmdstan_dir = fresh_dir(build_dir, "cmdstan_")?;
    info!(cmdstan_dir = %cmdstan_dir.display(), "building cmdstan");

    for repo in Repo::ALL {
        let dest = if repo.subpath().is_empty() {
            cmdstan_dir.clone()
        } else {
            cmdstan_dir.join(repo.subpath())
        };
        let output = git.shallow_clone(spec.url(repo), spec.branch(repo), &dest)?;
        if !output.success() {
            return Err(BenchError::Clone {
                repo,
                url: spec.url(repo).to_string(),
                branch: spec.branch(repo).to_string(),
                output,
            });
        }
        info!(%repo, "clone successful");
    }

    let build = env.build_script.invocation(env.cores, &cmdstan_dir);
    info!(command = %build, "running build script");
    let output = env.runner.run(&build)?;
    if !output.success() {
        return Err(BenchError::Build {
            dir: cmdstan_dir,
            output,
        });
    }
    info!(cmdstan_dir = %cmdstan_dir.display(), "cmdstan built successfully");

    let manifest = ToolchainManifest {
        cmdstan_commit: identity.cmdstan_commit.clone(),
        stan_commit: identity.stan_commit.clone(),
        math_commit: identity.math_commit.clone(),
        cmdstan_branch: spec.cmdstan_branch.clone(),
        stan_branch: spec.stan_branch.clone(),
        math_branch: spec.math_branch.clone(),
        cmdstan_url: spec.cmdstan_url.clone(),
        stan_url: spec.stan_url.clone(),
        math_url: spec.math_url.clone(),
        created_at: now_rfc3339(),
    };
    write_manifest(&cmdstan_dir, &Manifest::Toolchain(manifest))?;
    write_manifest(
        build_dir,
        &Manifest::Index(BuildIndexManifest {
            cmdstan_dir: cmdstan_dir.clone(),
            model_dir: None,
        }),
    )?;

    Ok(ToolchainBuild {
        cmdstan_dir,
        identity,
        reused: false,
    })
}
