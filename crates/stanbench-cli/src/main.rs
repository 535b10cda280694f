use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stanbench_runner::{
    BenchConfig, BenchError, BuildEnv, BuildReport, BuildScript, CmdStanSampler, Git,
    MakeCompiler, PosteriorDbCatalog, SampleArgs, ScheduleOutcome, SystemCommandRunner,
};

#[derive(Parser)]
#[command(
    name = "stanbench",
    version = "0.3.0",
    about = "Build CmdStan revisions and benchmark posteriordb models against them"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Experiment file (.json, .yaml or .yml) listing posteriors and cmdstans.
    config: PathBuf,
    #[arg(long, default_value = "build")]
    build_dir: PathBuf,
    /// posteriordb checkout, or its posterior_database directory.
    #[arg(long, default_value = "posteriordb")]
    catalog: PathBuf,
    #[arg(long, default_value = "git")]
    git: String,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Clone)]
struct BuildArgs {
    #[arg(long, default_value_t = 1)]
    cores: usize,
    #[arg(long, default_value = "R/build_cmdstan.R")]
    build_script: PathBuf,
    /// Program that runs the build script; pass an empty string to execute
    /// the script directly.
    #[arg(long, default_value = "Rscript")]
    build_interpreter: String,
    #[arg(long, default_value = "make")]
    make: String,
}

#[derive(Args, Clone)]
struct SampleOpts {
    #[arg(long, default_value = "runs")]
    run_dir: PathBuf,
    #[arg(long, default_value_t = 1)]
    nrounds: usize,
    /// Seed for the execution order; random when omitted.
    #[arg(long)]
    order_seed: Option<u64>,
    #[arg(long)]
    chains: Option<u64>,
    #[arg(long)]
    parallel_chains: Option<u64>,
    #[arg(long)]
    threads_per_chain: Option<u64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    iter_warmup: Option<u64>,
    #[arg(long)]
    iter_sampling: Option<u64>,
    #[arg(long)]
    thin: Option<u64>,
    #[arg(long)]
    max_treedepth: Option<u64>,
    #[arg(long)]
    metric: Option<String>,
    #[arg(long)]
    step_size: Option<f64>,
    #[arg(long)]
    adapt_engaged: Option<bool>,
    #[arg(long)]
    adapt_delta: Option<f64>,
    #[arg(long)]
    adapt_init_phase: Option<u64>,
    #[arg(long)]
    adapt_metric_window: Option<u64>,
    #[arg(long)]
    adapt_step_size: Option<u64>,
    #[arg(long)]
    fixed_param: bool,
}

impl SampleOpts {
    fn sample_args(&self) -> SampleArgs {
        SampleArgs {
            chains: self.chains,
            parallel_chains: self.parallel_chains,
            threads_per_chain: self.threads_per_chain,
            chain_ids: None,
            seed: self.seed,
            iter_warmup: self.iter_warmup,
            iter_sampling: self.iter_sampling,
            thin: self.thin,
            max_treedepth: self.max_treedepth,
            metric: self.metric.clone(),
            step_size: self.step_size,
            adapt_engaged: self.adapt_engaged,
            adapt_delta: self.adapt_delta,
            adapt_init_phase: self.adapt_init_phase,
            adapt_metric_window: self.adapt_metric_window,
            adapt_step_size: self.adapt_step_size,
            fixed_param: self.fixed_param.then_some(true),
        }
    }

    fn rng(&self) -> StdRng {
        match self.order_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build every configured toolchain and compile the requested models.
    Build {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Sample previously built models; nothing is built.
    Run {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        sample: SampleOpts,
    },
    /// Build what is missing, then sample every usable job.
    Benchmark {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        build: BuildArgs,
        #[command(flatten)]
        sample: SampleOpts,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            let bench_err = err.downcast_ref::<BenchError>();
            let collected = bench_err.map(BenchError::collected_failures).unwrap_or(&[]);
            if json_mode {
                let code = bench_err.map(BenchError::code).unwrap_or("command_failed");
                emit_json(&json_error(
                    code,
                    format!("{:#}", err),
                    json!({ "failures": failures_to_json(collected) }),
                ));
                std::process::exit(1);
            }
            if !collected.is_empty() {
                print_failures(collected);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    let runner = SystemCommandRunner;
    match command {
        Commands::Build { common, build } => {
            let config = load(&common)?;
            let catalog = PosteriorDbCatalog::open(&common.catalog)?;
            let env = build_env(&runner, &common, &build);
            let compiler = MakeCompiler::new(&runner, build.make.clone());
            let report =
                stanbench_runner::build_phase(&env, &common.build_dir, &config, &catalog, &compiler)?;
            if common.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "build",
                    "build_dir": common.build_dir.display().to_string(),
                    "build": build_report_to_json(&report),
                    "failures": failures_to_json(&report.failures),
                })));
            }
            println!("build_dir: {}", common.build_dir.display());
            print_build_report(&report);
            print_failures(&report.failures);
        }
        Commands::Run { common, sample } => {
            let config = load(&common)?;
            let catalog = PosteriorDbCatalog::open(&common.catalog)?;
            let git = Git::new(&runner, common.git.clone());
            let sampler = CmdStanSampler::new(&runner);
            let outcome = stanbench_runner::run_phase(
                &git,
                &common.build_dir,
                &sample.run_dir,
                &config,
                &catalog,
                &sampler,
                &sample.sample_args(),
                sample.nrounds,
                &mut sample.rng(),
            )?;
            if common.json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "build_dir": common.build_dir.display().to_string(),
                    "run_dir": sample.run_dir.display().to_string(),
                    "run": schedule_to_json(&outcome),
                    "failures": failures_to_json(&outcome.failures),
                })));
            }
            println!("build_dir: {}", common.build_dir.display());
            println!("run_dir: {}", sample.run_dir.display());
            print_schedule(&outcome);
            print_failures(&outcome.failures);
        }
        Commands::Benchmark {
            common,
            build,
            sample,
        } => {
            let config = load(&common)?;
            let catalog = PosteriorDbCatalog::open(&common.catalog)?;
            let env = build_env(&runner, &common, &build);
            let compiler = MakeCompiler::new(&runner, build.make.clone());
            let sampler = CmdStanSampler::new(&runner);
            let (report, outcome) = stanbench_runner::benchmark(
                &env,
                &common.build_dir,
                &sample.run_dir,
                &config,
                &catalog,
                &compiler,
                &sampler,
                &sample.sample_args(),
                sample.nrounds,
                &mut sample.rng(),
            )?;
            if common.json {
                let failures: Vec<&BenchError> =
                    report.failures.iter().chain(outcome.failures.iter()).collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "benchmark",
                    "build_dir": common.build_dir.display().to_string(),
                    "run_dir": sample.run_dir.display().to_string(),
                    "build": build_report_to_json(&report),
                    "run": schedule_to_json(&outcome),
                    "failures": failures_to_json(failures),
                })));
            }
            println!("build_dir: {}", common.build_dir.display());
            println!("run_dir: {}", sample.run_dir.display());
            print_build_report(&report);
            print_schedule(&outcome);
            print_failures(report.failures.iter().chain(outcome.failures.iter()));
        }
    }
    Ok(None)
}

fn load(common: &CommonArgs) -> Result<BenchConfig> {
    let config = stanbench_runner::load_config(&common.config)
        .with_context(|| format!("loading {}", common.config.display()))?;
    info!(
        config = %common.config.display(),
        cmdstans = config.cmdstans.len(),
        posteriors = config.posteriors.len(),
        "loaded experiment"
    );
    Ok(config)
}

fn build_env<'a>(
    runner: &'a SystemCommandRunner,
    common: &CommonArgs,
    build: &BuildArgs,
) -> BuildEnv<'a> {
    let interpreter = Some(build.build_interpreter.clone()).filter(|s| !s.is_empty());
    BuildEnv {
        runner,
        git: common.git.clone(),
        build_script: BuildScript {
            interpreter,
            script: build.build_script.clone(),
        },
        cores: build.cores,
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Build { common, .. }
        | Commands::Run { common, .. }
        | Commands::Benchmark { common, .. } => common.json,
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn build_report_to_json(report: &BuildReport) -> Value {
    json!({
        "toolchains": report.toolchains.iter().map(|t| json!({
            "cmdstan_dir": display(&t.cmdstan_dir),
            "reused": t.reused,
            "model_dir": t.model_dir.as_deref().map(display),
            "built_models": t.built_models,
            "cmdstan_info": t.identity,
        })).collect::<Vec<_>>(),
        "job_count": report.jobs.len(),
    })
}

fn schedule_to_json(outcome: &ScheduleOutcome) -> Value {
    json!({
        "job_dir": display(&outcome.job_dir),
        "manifest": display(&outcome.manifest_path),
        "invocations": outcome.invocations,
        "fits": outcome.fits,
    })
}

fn failures_to_json<'a>(failures: impl IntoIterator<Item = &'a BenchError>) -> Value {
    Value::Array(
        failures
            .into_iter()
            .map(|err| {
                json!({
                    "code": err.code(),
                    "name": err.item_name(),
                    "message": err.to_string(),
                })
            })
            .collect(),
    )
}

fn print_build_report(report: &BuildReport) {
    for toolchain in &report.toolchains {
        println!(
            "cmdstan_dir: {} ({})",
            toolchain.cmdstan_dir.display(),
            if toolchain.reused { "reused" } else { "built" }
        );
        if let Some(model_dir) = &toolchain.model_dir {
            println!("model_dir: {}", model_dir.display());
        }
        if !toolchain.built_models.is_empty() {
            println!("built_models: {}", toolchain.built_models.join(", "));
        }
    }
    println!("jobs: {}", report.jobs.len());
}

fn print_schedule(outcome: &ScheduleOutcome) {
    println!("job_dir: {}", outcome.job_dir.display());
    println!("invocations: {}", outcome.invocations);
    println!("run_manifest: {}", outcome.manifest_path.display());
}

fn print_failures<'a>(failures: impl IntoIterator<Item = &'a BenchError>) {
    let failures: Vec<&BenchError> = failures.into_iter().collect();
    println!("failures: {}", failures.len());
    for err in failures {
        println!("  {}: {}", err.item_name().unwrap_or("-"), err);
    }
}
