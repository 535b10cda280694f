//! The three phases a benchmark goes through: build, run, and both.

use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::compiler::ModelCompiler;
use crate::config::BenchConfig;
use crate::error::{BenchError, Result};
use crate::manifest::{find_build, find_model, ToolchainIdentity};
use crate::models::{requested_names, setup_models};
use crate::sampler::{SampleArgs, Sampler};
use crate::schedule::{run_schedule, SampleJob, ScheduleOutcome};
use crate::toolchain::{resolve_identity, setup_toolchain, BuildEnv, ToolchainSpec};
use crate::vcs::Git;

#[derive(Debug, Clone)]
pub struct ToolchainReport {
    pub cmdstan_dir: PathBuf,
    pub identity: ToolchainIdentity,
    pub reused: bool,
    pub model_dir: Option<PathBuf>,
    pub built_models: Vec<String>,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub toolchains: Vec<ToolchainReport>,
    /// One job per usable (toolchain, model) pair.
    pub jobs: Vec<SampleJob>,
    pub failures: Vec<BenchError>,
}

/// Builds every configured toolchain and its models under `build_dir`.
///
/// A toolchain that cannot be resolved, cloned, or built aborts the phase;
/// model failures collected up to that point travel with the error as
/// `BenchError::Aborted`. Otherwise model failures are collected in the
/// report.
pub fn build_phase(
    env: &BuildEnv<'_>,
    build_dir: &Path,
    config: &BenchConfig,
    catalog: &dyn Catalog,
    compiler: &dyn ModelCompiler,
) -> Result<BuildReport> {
    let mut report = BuildReport::default();
    for spec in &config.cmdstans {
        if let Err(err) = build_one(env, build_dir, config, spec, catalog, compiler, &mut report) {
            return Err(abort(err, report.failures));
        }
    }
    info!(
        toolchains = report.toolchains.len(),
        jobs = report.jobs.len(),
        failures = report.failures.len(),
        "build phase finished"
    );
    Ok(report)
}

fn build_one(
    env: &BuildEnv<'_>,
    build_dir: &Path,
    config: &BenchConfig,
    spec: &ToolchainSpec,
    catalog: &dyn Catalog,
    compiler: &dyn ModelCompiler,
    report: &mut BuildReport,
) -> Result<()> {
    let toolchain = setup_toolchain(env, build_dir, spec)?;
    let models = setup_models(
        build_dir,
        &toolchain.cmdstan_dir,
        &config.posteriors,
        catalog,
        compiler,
    )?;
    for artifact in models.models.values() {
        report
            .jobs
            .push(SampleJob::new(&toolchain.cmdstan_dir, &toolchain.identity, artifact));
    }
    report.failures.extend(models.failures);
    report.toolchains.push(ToolchainReport {
        cmdstan_dir: toolchain.cmdstan_dir,
        identity: toolchain.identity,
        reused: toolchain.reused,
        model_dir: models.model_dir,
        built_models: models.built,
    });
    Ok(())
}

fn abort(err: BenchError, failures: Vec<BenchError>) -> BenchError {
    if failures.is_empty() {
        return err;
    }
    for failure in &failures {
        warn!("{}", failure);
    }
    BenchError::Aborted {
        source: Box::new(err),
        failures,
    }
}

fn describe(spec: &ToolchainSpec) -> String {
    format!(
        "cmdstan build for {}@{} (stan {}@{}, math {}@{})",
        spec.cmdstan_url,
        spec.cmdstan_branch,
        spec.stan_url,
        spec.stan_branch,
        spec.math_url,
        spec.math_branch
    )
}

/// Finds the recorded artifacts for every configured (toolchain, model)
/// pair without building anything. Any missing toolchain or model is
/// `NotFound`, reported before a single job is returned.
pub fn locate_jobs(
    git: &Git<'_>,
    build_dir: &Path,
    config: &BenchConfig,
    catalog: &dyn Catalog,
) -> Result<Vec<SampleJob>> {
    let names = requested_names(&config.posteriors, catalog)?;
    let mut jobs = Vec::new();
    for spec in &config.cmdstans {
        let identity = resolve_identity(git, spec)?;
        let cmdstan_dir = find_build(build_dir, &identity)?.ok_or_else(|| BenchError::NotFound {
            what: describe(spec),
            build_dir: build_dir.to_path_buf(),
        })?;
        for name in &names {
            let artifact =
                find_model(build_dir, &cmdstan_dir, name)?.ok_or_else(|| BenchError::NotFound {
                    what: format!("model '{}' for cmdstan {}", name, cmdstan_dir.display()),
                    build_dir: build_dir.to_path_buf(),
                })?;
            jobs.push(SampleJob::new(&cmdstan_dir, &identity, &artifact));
        }
    }
    Ok(jobs)
}

/// Locates previously built jobs and samples them.
#[allow(clippy::too_many_arguments)]
pub fn run_phase<R: Rng + ?Sized>(
    git: &Git<'_>,
    build_dir: &Path,
    run_dir: &Path,
    config: &BenchConfig,
    catalog: &dyn Catalog,
    sampler: &dyn Sampler,
    args: &SampleArgs,
    nrounds: usize,
    rng: &mut R,
) -> Result<ScheduleOutcome> {
    let jobs = locate_jobs(git, build_dir, config, catalog)?;
    run_schedule(run_dir, &jobs, args, nrounds, sampler, rng)
}

/// Builds whatever is missing, then samples every usable job.
#[allow(clippy::too_many_arguments)]
pub fn benchmark<R: Rng + ?Sized>(
    env: &BuildEnv<'_>,
    build_dir: &Path,
    run_dir: &Path,
    config: &BenchConfig,
    catalog: &dyn Catalog,
    compiler: &dyn ModelCompiler,
    sampler: &dyn Sampler,
    args: &SampleArgs,
    nrounds: usize,
    rng: &mut R,
) -> Result<(BuildReport, ScheduleOutcome)> {
    let report = build_phase(env, build_dir, config, catalog, compiler)?;
    let outcome = run_schedule(run_dir, &report.jobs, args, nrounds, sampler, rng)?;
    Ok((report, outcome))
}
