//! Command-line parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tuide", version)]
#[command(about = "Language-server queries against the current directory")]
#[command(arg_required_else_help = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub(crate) enum Command {
    /// Print hover text at a 0-based position
    Hover {
        /// Source file to open
        file: PathBuf,
        /// 0-based line
        line: u32,
        /// 0-based character offset within the line
        character: u32,
    },
    /// Print diagnostics published for a file
    Diagnostics {
        /// Source file to open
        file: PathBuf,
        /// How long to collect diagnostics, in milliseconds
        #[arg(long = "wait-ms", default_value_t = 3000)]
        wait_ms: u64,
    },
    /// List configured language servers
    Servers,
}
