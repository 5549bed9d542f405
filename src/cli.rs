//! This file should remain minimal, containing only CLI argument struct
//! definitions — no parsing logic, no defaults resolution beyond what
//! `clap` derives directly.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Pretty,
    Jsonl,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to a JSONL dataset file.
    #[arg(long)]
    pub dataset: PathBuf,

    /// Name used for output-path/run-id derivation.
    #[arg(long)]
    pub task_name: String,

    /// Comma-separated metric names, looked up in the metric registry.
    #[arg(long, value_delimiter = ',')]
    pub metrics: Vec<String>,

    /// A single provider-prefixed model string.
    #[arg(long, conflicts_with = "models")]
    pub model: Option<String>,

    /// Multiple provider-prefixed model strings, triggering multi-run
    /// fan-out via the Multi-Run Runner.
    #[arg(long, value_delimiter = ',', conflicts_with = "model")]
    pub models: Vec<String>,

    #[arg(long)]
    pub run_name: Option<String>,

    #[arg(long)]
    pub resume_from: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    pub max_concurrency: usize,

    #[arg(long, default_value_t = 30.0)]
    pub timeout_seconds: f64,

    #[arg(long, default_value = "qym_results")]
    pub output_dir: PathBuf,

    #[arg(long, default_value_t = 5.0)]
    pub interrupt_grace_seconds: f64,

    #[arg(long)]
    pub checkpoint_fsync: bool,

    #[arg(long, env = "EVALRUN_PLATFORM_URL")]
    pub platform_url: Option<String>,

    #[arg(long, env = "EVALRUN_PLATFORM_API_KEY")]
    pub platform_api_key: Option<String>,

    #[arg(long)]
    pub resume_rerun_errors: bool,

    #[arg(long)]
    pub max_parallel_runs: Option<usize>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
    pub format: OutputFormat,
}
