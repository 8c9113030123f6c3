use super::CommandResult;
use crate::config::Config;
use crate::runtime::{CommandRunner, CommandSpec};
use crate::util::truncate_output;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Read-only repository inspection for `/status`. Needs no deploy lock.
pub struct StatusReporter {
    runner: Arc<dyn CommandRunner>,
    repo_path: PathBuf,
    timeout: Duration,
    output_max_chars: usize,
}

impl StatusReporter {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        repo_path: PathBuf,
        timeout: Duration,
        output_max_chars: usize,
    ) -> Self {
        Self {
            runner,
            repo_path,
            timeout,
            output_max_chars,
        }
    }

    pub fn from_config(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(
            runner,
            config.repo_path(),
            Duration::from_secs(config.status.timeout_secs),
            config.reply.output_max_chars,
        )
    }

    /// Current branch and revision as a three-line summary.
    pub async fn report(&self) -> CommandResult {
        let branch = match self
            .inspect(CommandSpec::new("git").args(["rev-parse", "--abbrev-ref", "HEAD"]))
            .await
        {
            Ok(branch) => branch,
            Err(failure) => return failure,
        };
        let commit = match self
            .inspect(CommandSpec::new("git").args(["rev-parse", "HEAD"]))
            .await
        {
            Ok(commit) => commit,
            Err(failure) => return failure,
        };

        CommandResult::ok(format!(
            "Repo: {}\nBranch: {branch}\nCommit: {commit}",
            self.repo_path.display()
        ))
    }

    async fn inspect(&self, command: CommandSpec) -> Result<String, CommandResult> {
        match self.runner.run(&command, &self.repo_path, self.timeout).await {
            Ok(out) if out.success() => Ok(out.output),
            Ok(out) => {
                tracing::warn!("Status command `{command}` exited with {}", out.exit_code);
                Err(CommandResult::failed(format!(
                    "Status failed on: {command}\n{}",
                    truncate_output(&out.output, self.output_max_chars)
                )))
            }
            Err(e) => {
                tracing::warn!("Status command `{command}` failed: {e}");
                Err(CommandResult::failed(format!("Status failed: {e}")))
            }
        }
    }
}
