//! Sampling job scheduler.
//!
//! Every job runs `nrounds` times. The full list of invocations is shuffled
//! once up front so that repetitions of one job are spread over the run
//! instead of executing back to back. Each repetition gets its own block of
//! chain ids, so all repetitions of a job can share one fit directory
//! without overwriting each other's outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{info, warn};

use crate::error::{BenchError, Result};
use crate::layout::{ensure_dir, fresh_dir};
use crate::manifest::{
    now_rfc3339, write_manifest, Manifest, ModelArtifact, RunManifest, RunRecord,
    ToolchainIdentity,
};
use crate::sampler::{SampleArgs, SampleRequest, Sampler};

/// One (toolchain, model) pair to benchmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleJob {
    pub cmdstan_dir: PathBuf,
    pub cmdstan_info: ToolchainIdentity,
    pub name: String,
    pub model_file: PathBuf,
    pub data_file: PathBuf,
    pub exe_file: PathBuf,
}

impl SampleJob {
    pub fn new(cmdstan_dir: &Path, cmdstan_info: &ToolchainIdentity, artifact: &ModelArtifact) -> Self {
        Self {
            cmdstan_dir: cmdstan_dir.to_path_buf(),
            cmdstan_info: cmdstan_info.clone(),
            name: artifact.name.clone(),
            model_file: artifact.model_file.clone(),
            data_file: artifact.data_file.clone(),
            exe_file: artifact.exe_file.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ScheduleOutcome {
    pub job_dir: PathBuf,
    pub manifest_path: PathBuf,
    /// Per model name, the outputs of every successful invocation in
    /// execution order.
    pub fits: BTreeMap<String, Vec<Vec<PathBuf>>>,
    pub invocations: usize,
    pub failures: Vec<BenchError>,
}

/// Each index in `0..n_jobs` exactly `nrounds` times, shuffled.
pub fn execution_order<R: Rng + ?Sized>(n_jobs: usize, nrounds: usize, rng: &mut R) -> Vec<usize> {
    let mut order: Vec<usize> = (0..nrounds).flat_map(|_| 0..n_jobs).collect();
    order.shuffle(rng);
    order
}

/// Runs every job `nrounds` times in shuffled order and records each
/// successful invocation in a run manifest in `run_dir`. Outputs go to
/// per-job `fit_*` directories inside a fresh `job_*` directory. Sampling
/// failures are logged and collected; only filesystem errors abort the run.
pub fn run_schedule<R: Rng + ?Sized>(
    run_dir: &Path,
    jobs: &[SampleJob],
    args: &SampleArgs,
    nrounds: usize,
    sampler: &dyn Sampler,
    rng: &mut R,
) -> Result<ScheduleOutcome> {
    ensure_dir(run_dir)?;
    let job_dir = fresh_dir(run_dir, "job_")?;
    let order = execution_order(jobs.len(), nrounds, rng);
    info!(
        job_dir = %job_dir.display(),
        jobs = jobs.len(),
        nrounds,
        invocations = order.len(),
        "starting sampling run"
    );

    let chains = args.chain_count();
    let mut next_chain = vec![0u64; jobs.len()];
    let mut fit_dirs: Vec<Option<PathBuf>> = vec![None; jobs.len()];
    let mut fits: BTreeMap<String, Vec<Vec<PathBuf>>> = BTreeMap::new();
    let mut manifest = RunManifest {
        jobs: Vec::new(),
        created_at: now_rfc3339(),
    };
    let mut failures = Vec::new();

    for (n, &i) in order.iter().enumerate() {
        let job = &jobs[i];
        let fit_dir = match &fit_dirs[i] {
            Some(dir) => dir.clone(),
            None => {
                let dir = fresh_dir(&job_dir, "fit_")?;
                fit_dirs[i] = Some(dir.clone());
                dir
            }
        };

        let mut call_args = args.clone();
        call_args.chain_ids = Some(next_chain[i] + 1);
        next_chain[i] += chains;

        info!(
            "sampling ({}/{}): {} -> cmdstan {} (chain ids from {})",
            n + 1,
            order.len(),
            job.name,
            job.cmdstan_dir.display(),
            next_chain[i] + 1 - chains
        );
        let request = SampleRequest {
            job,
            output_dir: &fit_dir,
            args: &call_args,
        };
        match sampler.sample(&request) {
            Ok(fit_files) => {
                fits.entry(job.name.clone())
                    .or_default()
                    .push(fit_files.clone());
                manifest.jobs.push(RunRecord {
                    cmdstan_dir: job.cmdstan_dir.clone(),
                    name: job.name.clone(),
                    fit_files,
                    fit_dir,
                    args: call_args,
                    cmdstan_info: job.cmdstan_info.clone(),
                });
            }
            Err(err) => {
                let failure = BenchError::Sample {
                    name: job.name.clone(),
                    cmdstan_dir: job.cmdstan_dir.clone(),
                    detail: format!("{:#}", err),
                };
                warn!("{}", failure);
                failures.push(failure);
            }
        }
    }

    let manifest_path = write_manifest(run_dir, &Manifest::Run(manifest))?;
    Ok(ScheduleOutcome {
        job_dir,
        manifest_path,
        fits,
        invocations: order.len(),
        failures,
    })
}
