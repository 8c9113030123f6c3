use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// An argument vector to execute. No shell is involved unless the program
/// itself is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    /// Space-joined invocation line, as echoed into transcripts.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Outcome of a command that ran to completion (successfully or not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code; `-N` when killed by signal `N`.
    pub exit_code: i32,
    /// Trimmed stdout then trimmed stderr, newline-joined, empty streams omitted.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command that could not produce a [`CommandOutput`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {}s and was killed", timeout.as_secs())]
    Timeout { program: String, timeout: Duration },
    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Executes external commands on behalf of the status reporter and the
/// deploy coordinator.
///
/// Implementations must bound execution by `timeout` and must not block the
/// async executor. Every failure mode is a [`ProcessError`]; implementations
/// never panic on bad input or undecodable output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &CommandSpec,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, ProcessError>;
}
