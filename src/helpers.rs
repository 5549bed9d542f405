//! Logging setup: stderr-only output (stdout is reserved for
//! `--format jsonl` progress lines), `EnvFilter::from_default_env()` so
//! `RUST_LOG` still governs verbosity, and a JSON formatter switched on by
//! `--format jsonl` so a machine consumer sees uniformly-shaped lines on
//! both streams.

use tracing_subscriber::FmtSubscriber;

use crate::cli::{Args, OutputFormat};

pub fn setup_logging(args: &Args) -> anyhow::Result<()> {
    match args.format {
        OutputFormat::Jsonl => {
            let subscriber = FmtSubscriber::builder()
                .with_writer(std::io::stderr)
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .json()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        OutputFormat::Pretty => {
            let subscriber = FmtSubscriber::builder()
                .with_writer(std::io::stderr)
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}
