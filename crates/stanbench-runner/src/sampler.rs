//! Sampling configuration and the sampler seam.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::process::{CommandRunner, Invocation};
use crate::schedule::SampleJob;

/// Sampler options, passed through unmodified except for `chain_ids`,
/// which the scheduler sets before every invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chains: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_chains: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads_per_chain: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_ids: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iter_warmup: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iter_sampling: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thin: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_treedepth: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapt_engaged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapt_delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapt_init_phase: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapt_metric_window: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapt_step_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_param: Option<bool>,
}

impl SampleArgs {
    pub fn chain_count(&self) -> u64 {
        self.chains.unwrap_or(1).max(1)
    }
}

pub struct SampleRequest<'a> {
    pub job: &'a SampleJob,
    /// Per-job directory; the sampler writes its outputs here.
    pub output_dir: &'a Path,
    pub args: &'a SampleArgs,
}

pub trait Sampler {
    /// Runs one sampling invocation and returns the produced output files.
    fn sample(&self, request: &SampleRequest<'_>) -> anyhow::Result<Vec<PathBuf>>;
}

/// Runs a compiled CmdStan model executable directly.
///
/// Outputs are `<output_dir>/<name>_<chain id>.csv`, one per chain, with
/// chain ids starting at `chain_ids`.
pub struct CmdStanSampler<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> CmdStanSampler<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl Sampler for CmdStanSampler<'_> {
    fn sample(&self, request: &SampleRequest<'_>) -> anyhow::Result<Vec<PathBuf>> {
        let (invocation, outputs) = cmdstan_invocation(request)?;
        info!(model = %request.job.name, command = %invocation, "sampling");
        let output = self.runner.run(&invocation)?;
        if !output.success() {
            bail!("{}", output);
        }
        let missing: Vec<String> = outputs
            .iter()
            .filter(|p| !p.is_file())
            .map(|p| p.display().to_string())
            .collect();
        if !missing.is_empty() {
            bail!("sampler exited cleanly but did not write: {}", missing.join(", "));
        }
        Ok(outputs)
    }
}

/// Builds the CmdStan argument tree and the list of expected CSV files.
fn cmdstan_invocation(request: &SampleRequest<'_>) -> anyhow::Result<(Invocation, Vec<PathBuf>)> {
    let args = request.args;
    let job = request.job;
    let first_id = args.chain_ids.unwrap_or(1);
    let chains = args.chain_count();

    // With num_chains > 1 CmdStan appends `_<id>` to the output stem itself.
    let output_file = if chains == 1 {
        request.output_dir.join(format!("{}_{}.csv", job.name, first_id))
    } else {
        request.output_dir.join(format!("{}.csv", job.name))
    };
    let outputs: Vec<PathBuf> = (first_id..first_id + chains)
        .map(|id| request.output_dir.join(format!("{}_{}.csv", job.name, id)))
        .collect();

    let mut inv = Invocation::new(job.exe_file.to_string_lossy().to_string())
        .current_dir(request.output_dir)
        .arg(format!("id={}", first_id));
    if let Some(seed) = args.seed {
        inv = inv.arg("random").arg(format!("seed={}", seed));
    }
    inv = inv
        .arg("data")
        .arg(format!("file={}", job.data_file.display()))
        .arg("output")
        .arg(format!("file={}", output_file.display()));
    if args.parallel_chains.is_some() || args.threads_per_chain.is_some() {
        let threads = args.parallel_chains.unwrap_or(1) * args.threads_per_chain.unwrap_or(1);
        inv = inv.arg(format!("num_threads={}", threads));
    }

    inv = inv.arg("method=sample");
    if let Some(n) = args.iter_sampling {
        inv = inv.arg(format!("num_samples={}", n));
    }
    if let Some(n) = args.iter_warmup {
        inv = inv.arg(format!("num_warmup={}", n));
    }
    if let Some(n) = args.thin {
        inv = inv.arg(format!("thin={}", n));
    }
    if chains > 1 {
        inv = inv.arg(format!("num_chains={}", chains));
    }

    if args.fixed_param == Some(true) {
        inv = inv.arg("algorithm=fixed_param");
    } else {
        inv = inv.arg("algorithm=hmc").arg("engine=nuts");
        if let Some(depth) = args.max_treedepth {
            inv = inv.arg(format!("max_depth={}", depth));
        }
        if let Some(metric) = &args.metric {
            inv = inv.arg(format!("metric={}", cmdstan_metric(metric)?));
        }
        if let Some(step) = args.step_size {
            inv = inv.arg(format!("stepsize={}", step));
        }

        inv = inv.arg("adapt");
        let engaged = args.adapt_engaged.unwrap_or(true);
        inv = inv.arg(format!("engaged={}", u8::from(engaged)));
        if let Some(delta) = args.adapt_delta {
            inv = inv.arg(format!("delta={}", delta));
        }
        if let Some(n) = args.adapt_init_phase {
            inv = inv.arg(format!("init_buffer={}", n));
        }
        if let Some(n) = args.adapt_metric_window {
            inv = inv.arg(format!("window={}", n));
        }
        if let Some(n) = args.adapt_step_size {
            inv = inv.arg(format!("term_buffer={}", n));
        }
    }

    Ok((inv, outputs))
}

fn cmdstan_metric(metric: &str) -> anyhow::Result<&'static str> {
    match metric {
        "diag" | "diag_e" => Ok("diag_e"),
        "dense" | "dense_e" => Ok("dense_e"),
        "unit" | "unit_e" => Ok("unit_e"),
        other => Err(anyhow!("unsupported metric '{}'", other)),
    }
}
