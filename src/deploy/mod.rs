//! Serialized deploy execution.
//!
//! A deploy attempt holds two locks for its whole execution: the
//! process-local [`DeployGate`] and a cross-process [`LockProvider`] hold.
//! The gate is taken first (by the dispatcher or by [`DeployCoordinator::attempt_deploy`]),
//! the requester is told the deploy is starting, and only then is the file
//! lock attempted. Contention on the file lock is reported as "already
//! running" without spawning anything. Both locks are released on every
//! exit path by scope, before the final notification goes out.

pub mod lock;

pub use lock::{DeployGate, DeployPermit, FileLockProvider, LockHold, LockProvider};

use crate::channels::Replier;
use crate::commands::CommandResult;
use crate::config::Config;
use crate::runtime::{CommandRunner, CommandSpec};
use crate::util::truncate_output;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEPLOY_ALREADY_RUNNING: &str = "Deploy is already running.";

/// What a deploy runs and where.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub repo_path: PathBuf,
    /// Checked for existence and executability before any lock is taken.
    pub script_path: PathBuf,
    /// Executed in order; the first failing step ends the deploy.
    pub steps: Vec<CommandSpec>,
    pub timeout: Duration,
    pub output_max_chars: usize,
}

impl DeployPlan {
    pub fn from_config(config: &Config) -> Self {
        let script_path = config.deploy_script_path();
        Self {
            repo_path: config.repo_path(),
            steps: vec![CommandSpec::new(script_path.to_string_lossy())],
            script_path,
            timeout: Duration::from_secs(config.deploy.timeout_secs),
            output_max_chars: config.reply.output_max_chars,
        }
    }
}

pub struct DeployCoordinator {
    gate: DeployGate,
    lock: Arc<dyn LockProvider>,
    runner: Arc<dyn CommandRunner>,
    replier: Replier,
    plan: DeployPlan,
}

impl DeployCoordinator {
    pub fn new(
        gate: DeployGate,
        lock: Arc<dyn LockProvider>,
        runner: Arc<dyn CommandRunner>,
        replier: Replier,
        plan: DeployPlan,
    ) -> Self {
        Self {
            gate,
            lock,
            runner,
            replier,
            plan,
        }
    }

    pub fn gate(&self) -> &DeployGate {
        &self.gate
    }

    pub fn plan(&self) -> &DeployPlan {
        &self.plan
    }

    /// Wait for the in-process gate, then deploy. Used by callers that did
    /// not claim the gate themselves.
    pub async fn attempt_deploy(&self, requester: &str) -> CommandResult {
        let permit = self.gate.begin().await;
        self.run_with_permit(permit, requester).await
    }

    /// Deploy under an already-claimed gate, notifying `requester` at start
    /// and completion.
    pub async fn run_with_permit(&self, permit: DeployPermit, requester: &str) -> CommandResult {
        let started_at = Utc::now().format("%Y-%m-%d %H:%M:%SZ");
        self.replier
            .reply(requester, &format!("Starting deploy at {started_at}"))
            .await;
        tracing::info!("Deploy requested by {requester} started");

        let result = self.execute().await;
        drop(permit);

        let headline = if result.success {
            tracing::info!("Deploy requested by {requester} completed successfully");
            "Deploy completed successfully."
        } else {
            tracing::warn!("Deploy requested by {requester} failed");
            "Deploy failed."
        };
        self.replier
            .reply(requester, &format!("{headline}\n{}", result.output))
            .await;

        result
    }

    async fn execute(&self) -> CommandResult {
        if let Err(reason) = preflight(&self.plan.script_path).await {
            return CommandResult::failed(reason);
        }

        let lock = Arc::clone(&self.lock);
        let hold = match tokio::task::spawn_blocking(move || lock.try_acquire()).await {
            Ok(Ok(Some(hold))) => hold,
            Ok(Ok(None)) => {
                tracing::info!(
                    "Deploy lock {} is held by another process",
                    self.lock.describe()
                );
                return CommandResult::failed(DEPLOY_ALREADY_RUNNING);
            }
            Ok(Err(e)) => {
                tracing::error!("Deploy lock {} unavailable: {e:#}", self.lock.describe());
                return CommandResult::failed(format!("Failed to acquire deploy lock: {e:#}"));
            }
            Err(e) => {
                return CommandResult::failed(format!("Failed to acquire deploy lock: {e}"));
            }
        };

        let result = self.run_steps().await;
        drop(hold);
        result
    }

    async fn run_steps(&self) -> CommandResult {
        let mut transcript = Vec::new();

        for step in &self.plan.steps {
            transcript.push(format!("$ {step}"));

            match self
                .runner
                .run(step, &self.plan.repo_path, self.plan.timeout)
                .await
            {
                Ok(out) => {
                    if !out.output.is_empty() {
                        transcript.push(truncate_output(&out.output, self.plan.output_max_chars));
                    }
                    transcript.push(format!("exit code: {}", out.exit_code));
                    if !out.success() {
                        return CommandResult::failed(transcript.join("\n"));
                    }
                }
                Err(e) => {
                    transcript.push(format!("Command failed with exception: {e}"));
                    return CommandResult::failed(transcript.join("\n"));
                }
            }
        }

        CommandResult::ok(transcript.join("\n"))
    }
}

async fn preflight(script: &Path) -> Result<(), String> {
    let Ok(metadata) = tokio::fs::metadata(script).await else {
        return Err(format!("Deploy script not found: {}", script.display()));
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.is_dir() || metadata.permissions().mode() & 0o111 == 0 {
            return Err(format!("Deploy script is not executable: {}", script.display()));
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::test_support::RecordingChannel;
    use crate::runtime::test_support::{output, ScriptedRunner};
    use crate::runtime::{NativeCommandRunner, ProcessError};

    enum FakeLock {
        Free,
        Contended,
        Broken,
    }

    impl LockProvider for FakeLock {
        fn try_acquire(&self) -> anyhow::Result<Option<LockHold>> {
            match self {
                Self::Free => Ok(Some(LockHold::new(()))),
                Self::Contended => Ok(None),
                Self::Broken => anyhow::bail!("read-only filesystem"),
            }
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Plan whose single step runs `script` through `sh`.
    fn plan_for(repo: &Path, script: &Path) -> DeployPlan {
        DeployPlan {
            repo_path: repo.to_path_buf(),
            script_path: script.to_path_buf(),
            steps: vec![CommandSpec::new("sh").arg(script.to_string_lossy())],
            timeout: Duration::from_secs(10),
            output_max_chars: 3500,
        }
    }

    fn coordinator(
        lock: Arc<dyn LockProvider>,
        runner: Arc<dyn CommandRunner>,
        plan: DeployPlan,
    ) -> (DeployCoordinator, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::default());
        let replier = Replier::new(channel.clone(), 3000);
        (
            DeployCoordinator::new(DeployGate::new(), lock, runner, replier, plan),
            channel,
        )
    }

    #[test]
    fn plan_from_config_runs_the_script_directly() {
        let config = Config::for_tests("/srv/app");
        let plan = DeployPlan::from_config(&config);
        assert_eq!(plan.repo_path, PathBuf::from("/srv/app"));
        assert_eq!(plan.script_path, PathBuf::from("/srv/app/release-bot/deploy.sh"));
        assert_eq!(plan.steps, vec![CommandSpec::new("/srv/app/release-bot/deploy.sh")]);
        assert_eq!(plan.timeout, Duration::from_secs(1800));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_deploy_notifies_start_and_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "deploy.sh", "echo deployed");
        let lock = Arc::new(FileLockProvider::new(tmp.path().join("deploy.lock")));
        let (coordinator, channel) = coordinator(
            lock,
            Arc::new(NativeCommandRunner::new()),
            plan_for(tmp.path(), &script),
        );

        let result = coordinator.attempt_deploy("ops@x.com").await;

        assert!(result.success);
        assert_eq!(
            result.output,
            format!("$ sh {}\ndeployed\nexit code: 0", script.display())
        );
        let sent = channel.contents();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].starts_with("Starting deploy at "));
        assert!(sent[0].ends_with('Z'));
        assert_eq!(sent[1], format!("Deploy completed successfully.\n{}", result.output));
        assert!(channel.recipients().iter().all(|r| r == "ops@x.com"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_script_reports_transcript_and_releases_both_locks() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "deploy.sh", "echo step failed\nexit 1");
        let lock_path = tmp.path().join("deploy.lock");
        let (coordinator, channel) = coordinator(
            Arc::new(FileLockProvider::new(&lock_path)),
            Arc::new(NativeCommandRunner::new()),
            plan_for(tmp.path(), &script),
        );

        let result = coordinator.attempt_deploy("ops@x.com").await;

        assert!(!result.success);
        assert!(result.output.contains("step failed"));
        assert!(result.output.contains("exit code: 1"));
        assert!(channel.contents()[1].starts_with("Deploy failed.\n"));

        assert!(!coordinator.gate().is_running());
        assert!(FileLockProvider::new(&lock_path).try_acquire().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn contended_file_lock_never_starts_the_script() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("ran");
        let script = write_script(
            tmp.path(),
            "deploy.sh",
            &format!("touch {}", marker.display()),
        );
        let lock_path = tmp.path().join("deploy.lock");
        let other_process = FileLockProvider::new(&lock_path).try_acquire().unwrap();
        assert!(other_process.is_some());

        let (coordinator, channel) = coordinator(
            Arc::new(FileLockProvider::new(&lock_path)),
            Arc::new(NativeCommandRunner::new()),
            plan_for(tmp.path(), &script),
        );
        let result = coordinator.attempt_deploy("ops@x.com").await;

        assert!(!result.success);
        assert_eq!(result.output, DEPLOY_ALREADY_RUNNING);
        assert!(!marker.exists());
        assert_eq!(channel.contents()[1], format!("Deploy failed.\n{DEPLOY_ALREADY_RUNNING}"));
        assert!(!coordinator.gate().is_running());
    }

    #[tokio::test]
    async fn missing_script_fails_before_locking() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let script = tmp.path().join("nope.sh");
        let (coordinator, _channel) =
            coordinator(Arc::new(FakeLock::Broken), runner.clone(), plan_for(tmp.path(), &script));

        let result = coordinator.attempt_deploy("ops@x.com").await;

        assert!(!result.success);
        assert_eq!(result.output, format!("Deploy script not found: {}", script.display()));
        assert!(runner.calls().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_executable_script_is_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "deploy.sh", "echo hi");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();
        let runner = Arc::new(ScriptedRunner::default());
        let (coordinator, _channel) =
            coordinator(Arc::new(FakeLock::Free), runner.clone(), plan_for(tmp.path(), &script));

        let result = coordinator.attempt_deploy("ops@x.com").await;

        assert!(!result.success);
        assert!(result.output.starts_with("Deploy script is not executable: "));
        assert!(runner.calls().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lock_failure_is_reported_without_running() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "deploy.sh", "true");
        let runner = Arc::new(ScriptedRunner::default());
        let (coordinator, _channel) =
            coordinator(Arc::new(FakeLock::Broken), runner.clone(), plan_for(tmp.path(), &script));

        let result = coordinator.attempt_deploy("ops@x.com").await;

        assert!(!result.success);
        assert_eq!(result.output, "Failed to acquire deploy lock: read-only filesystem");
        assert!(runner.calls().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fake_lock_contention_reports_already_running() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "deploy.sh", "true");
        let runner = Arc::new(ScriptedRunner::default());
        let (coordinator, _channel) = coordinator(
            Arc::new(FakeLock::Contended),
            runner.clone(),
            plan_for(tmp.path(), &script),
        );

        let result = coordinator.attempt_deploy("ops@x.com").await;

        assert_eq!(result, CommandResult::failed(DEPLOY_ALREADY_RUNNING));
        assert!(runner.calls().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execution_error_is_recorded_in_transcript() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "deploy.sh", "true");
        let runner = Arc::new(ScriptedRunner::with(vec![Err(ProcessError::Timeout {
            program: "sh".into(),
            timeout: Duration::from_secs(1800),
        })]));
        let (coordinator, _channel) =
            coordinator(Arc::new(FakeLock::Free), runner, plan_for(tmp.path(), &script));

        let result = coordinator.attempt_deploy("ops@x.com").await;

        assert!(!result.success);
        assert!(result
            .output
            .ends_with("Command failed with exception: sh timed out after 1800s and was killed"));
        assert!(!coordinator.gate().is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn multi_step_plan_stops_at_first_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "deploy.sh", "true");
        let runner = Arc::new(ScriptedRunner::with(vec![
            output(0, "pulled"),
            output(2, "build broke"),
            output(0, "never"),
        ]));
        let mut plan = plan_for(tmp.path(), &script);
        plan.steps = vec![
            CommandSpec::new("git").arg("pull"),
            CommandSpec::new("make").arg("build"),
            CommandSpec::new("make").arg("restart"),
        ];
        let (coordinator, _channel) = coordinator(Arc::new(FakeLock::Free), runner.clone(), plan);

        let result = coordinator.attempt_deploy("ops@x.com").await;

        assert!(!result.success);
        assert_eq!(
            result.output,
            "$ git pull\npulled\nexit code: 0\n$ make build\nbuild broke\nexit code: 2"
        );
        assert_eq!(runner.calls(), vec!["git pull", "make build"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn step_output_is_truncated_in_transcript() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "deploy.sh", "true");
        let long = format!("{}{}", "h".repeat(500), "t".repeat(500));
        let runner = Arc::new(ScriptedRunner::with(vec![output(0, &long)]));
        let mut plan = plan_for(tmp.path(), &script);
        plan.output_max_chars = 100;
        let (coordinator, _channel) = coordinator(Arc::new(FakeLock::Free), runner, plan);

        let result = coordinator.attempt_deploy("ops@x.com").await;

        assert!(result.success);
        assert!(result.output.contains(crate::util::TRUNCATION_MARKER));
        assert!(result.output.contains(&format!("{}\n", "h".repeat(50))));
        assert!(result.output.ends_with(&format!("{}\nexit code: 0", "t".repeat(50))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn blocking_attempts_are_serialized() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("log");
        let script = write_script(
            tmp.path(),
            "deploy.sh",
            &format!("echo start >> {log}\nsleep 0.2\necho end >> {log}", log = log.display()),
        );
        let (coordinator, _channel) = coordinator(
            Arc::new(FileLockProvider::new(tmp.path().join("deploy.lock"))),
            Arc::new(NativeCommandRunner::new()),
            plan_for(tmp.path(), &script),
        );

        let (first, second) = tokio::join!(
            coordinator.attempt_deploy("ops@x.com"),
            coordinator.attempt_deploy("dev@x.com")
        );

        assert!(first.success && second.success);
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "start\nend\nstart\nend\n"
        );
    }
}
