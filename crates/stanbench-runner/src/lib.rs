//! Build CmdStan toolchains at chosen revisions, compile benchmark models
//! against them, and run repeated sampling jobs over the cross-product,
//! recording everything in JSON manifests so later runs can find it.

pub mod catalog;
pub mod compiler;
pub mod config;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod models;
pub mod pipeline;
pub mod process;
pub mod sampler;
pub mod schedule;
pub mod toolchain;
pub mod vcs;

#[cfg(test)]
mod testkit;

pub use catalog::{Catalog, Posterior, PosteriorDbCatalog};
pub use compiler::{MakeCompiler, ModelCompiler};
pub use config::{load_config, BenchConfig};
pub use error::{BenchError, Result};
pub use manifest::{
    find_build, find_model, scan_manifests, write_manifest, BuildIndexManifest, Manifest,
    ModelArtifact, ModelBatchManifest, RunManifest, RunRecord, ToolchainIdentity,
    ToolchainManifest,
};
pub use models::{setup_models, ModelBuildOutcome};
pub use pipeline::{benchmark, build_phase, locate_jobs, run_phase, BuildReport, ToolchainReport};
pub use process::{CommandOutput, CommandRunner, Invocation, SystemCommandRunner};
pub use sampler::{CmdStanSampler, SampleArgs, SampleRequest, Sampler};
pub use schedule::{execution_order, run_schedule, SampleJob, ScheduleOutcome};
pub use toolchain::{resolve_identity, setup_toolchain, BuildEnv, BuildScript, ToolchainBuild, ToolchainSpec};
pub use vcs::Git;
