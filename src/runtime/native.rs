use super::traits::{CommandOutput, CommandRunner, CommandSpec, ProcessError};
use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

/// Environment variables never handed to child processes.
const SCRUBBED_ENV_VARS: &[&str] = &["RELEASE_BOT_BRIDGE_SECRET"];

/// Runs commands as local child processes via `tokio::process`.
///
/// The child is spawned with `kill_on_drop`, so a timeout drops the wait
/// future and the process is killed with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCommandRunner;

impl NativeCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Decode both streams permissively and join the non-empty ones, stdout first.
pub(crate) fn combine_streams(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    [stdout.trim(), stderr.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl CommandRunner for NativeCommandRunner {
    async fn run(
        &self,
        command: &CommandSpec,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, ProcessError> {
        let mut process = tokio::process::Command::new(&command.program);
        process
            .args(&command.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in SCRUBBED_ENV_VARS {
            process.env_remove(var);
        }

        let child = process.spawn().map_err(|source| ProcessError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: exit_code(output.status),
                output: combine_streams(&output.stdout, &output.stderr),
            }),
            Ok(Err(source)) => Err(ProcessError::Wait {
                program: command.program.clone(),
                source,
            }),
            Err(_) => {
                tracing::warn!(
                    "{} exceeded {}s timeout; killed",
                    command.program,
                    timeout.as_secs()
                );
                Err(ProcessError::Timeout {
                    program: command.program.clone(),
                    timeout,
                })
            }
        }
    }
}
