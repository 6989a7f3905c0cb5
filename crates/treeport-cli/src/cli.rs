use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "treeport", version, about = "Inspect and score compiled tree-ensemble models")]
pub struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print input and output metadata
    Inspect {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Score rows of a CSV file, one output line per row
    Predict {
        #[command(flatten)]
        model: ModelArgs,

        /// CSV file of feature rows; empty fields are missing values
        #[arg(long)]
        input: PathBuf,

        /// Print raw margins instead of transformed predictions
        #[arg(long)]
        margin: bool,

        /// Independently loaded model instances
        #[arg(long, default_value_t = 1)]
        workers: usize,

        /// Rows stacked into one run
        #[arg(long, default_value_t = 64)]
        max_batch: usize,

        /// Batching window in milliseconds
        #[arg(long, default_value_t = 2)]
        max_delay_ms: u64,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Engine that loads the artifacts
    #[arg(long, value_enum, default_value_t = BackendKind::Forest)]
    pub backend: BackendKind,

    /// Compute context (cpu, cpu:0, cuda_host:0, ...)
    #[arg(long, default_value = "cpu:0")]
    pub device: String,

    /// Model files, or directories holding them
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Forest,
    Linear,
}
