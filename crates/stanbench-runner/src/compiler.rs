use std::path::{Path, PathBuf};

use anyhow::bail;
use tracing::info;

use crate::process::{CommandRunner, Invocation};

pub trait ModelCompiler {
    /// Compiles `model_file` against the toolchain in `cmdstan_dir` and
    /// returns the executable path.
    fn compile(&self, cmdstan_dir: &Path, name: &str, model_file: &Path) -> anyhow::Result<PathBuf>;
}

/// `make -C <cmdstan_dir> <model without extension>`, CmdStan's own model
/// build rule.
pub struct MakeCompiler<'a> {
    runner: &'a dyn CommandRunner,
    make: String,
}

impl<'a> MakeCompiler<'a> {
    pub fn new(runner: &'a dyn CommandRunner, make: impl Into<String>) -> Self {
        Self {
            runner,
            make: make.into(),
        }
    }
}

pub fn executable_path(model_file: &Path) -> PathBuf {
    let exe = model_file.with_extension("");
    if cfg!(windows) {
        exe.with_extension("exe")
    } else {
        exe
    }
}

impl ModelCompiler for MakeCompiler<'_> {
    fn compile(&self, cmdstan_dir: &Path, name: &str, model_file: &Path) -> anyhow::Result<PathBuf> {
        let exe = executable_path(model_file);
        let invocation = Invocation::new(&self.make)
            .arg("-C")
            .path_arg(cmdstan_dir)
            .path_arg(&exe);
        info!(model = name, command = %invocation, "compiling");
        let output = self.runner.run(&invocation)?;
        if !output.success() {
            bail!("{}", output);
        }
        if !exe.is_file() {
            bail!("make succeeded but {} does not exist", exe.display());
        }
        Ok(exe)
    }
}
