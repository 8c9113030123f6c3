#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_literal_bound
)]

use clap::Subcommand;

pub mod channels;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod deploy;
pub mod gateway;
pub mod health;
pub mod runtime;
pub mod security;
pub mod util;

pub use config::Config;

/// Top-level subcommands. Lives in the library so the binary and the tests
/// share a single definition.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the agent: HTTP gateway, bridge channel and command dispatcher
    Run,
    /// Drive the dispatcher from stdin/stdout as the given sender identity
    Console {
        /// Identity the console messages are attributed to (must be allow-listed)
        #[arg(long = "as", value_name = "IDENTITY")]
        identity: String,
    },
    /// Print the repository status once and exit
    Status,
    /// Run a single serialized deploy and exit (non-zero on failure)
    Deploy,
    /// Validate and print the resolved configuration
    Config,
}
