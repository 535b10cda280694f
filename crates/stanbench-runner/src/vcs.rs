//! Remote commit resolution and shallow checkouts.

use std::path::Path;

use tracing::{info, warn};

use crate::error::{BenchError, Result};
use crate::process::{CommandOutput, CommandRunner, Invocation};

pub struct Git<'a> {
    runner: &'a dyn CommandRunner,
    program: String,
}

impl<'a> Git<'a> {
    pub fn new(runner: &'a dyn CommandRunner, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    /// Tip commit of `branch` as advertised by the remote at `url`.
    ///
    /// A successful query with empty output is an error, not "branch absent".
    pub fn resolve_head(&self, url: &str, branch: &str) -> Result<String> {
        let invocation = Invocation::new(&self.program)
            .arg("ls-remote")
            .arg("--heads")
            .arg(url)
            .arg(branch);
        let output = self.runner.run(&invocation)?;
        if !output.success() {
            warn!(command = %invocation, "ls-remote failed");
            return Err(BenchError::Resolution {
                url: url.to_string(),
                branch: branch.to_string(),
                detail: output.to_string(),
            });
        }
        match output.stdout.split_whitespace().next() {
            Some(commit) => Ok(commit.to_string()),
            None => Err(BenchError::Resolution {
                url: url.to_string(),
                branch: branch.to_string(),
                detail: format!("expected a commit id, found nothing ({})", output),
            }),
        }
    }

    /// `git clone --depth=1 --single-branch --branch=<branch> <url> <dest>`.
    ///
    /// The exit status is left to the caller, which knows which of the
    /// nested checkouts failed.
    pub fn shallow_clone(&self, url: &str, branch: &str, dest: &Path) -> Result<CommandOutput> {
        let invocation = Invocation::new(&self.program)
            .arg("clone")
            .arg("--depth=1")
            .arg("--single-branch")
            .arg(format!("--branch={}", branch))
            .arg(url)
            .path_arg(dest);
        info!(command = %invocation, "cloning");
        self.runner.run(&invocation)
    }
}
