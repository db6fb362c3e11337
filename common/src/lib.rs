//! Shared runtime harness for the MFR tools
//!
//! Every binary builds an [`OutputConfig`] and a [`RuntimeConfig`] from its command line and hands
//! its async entry point to [`run`], which:
//!
//! - installs a `tracing` subscriber writing to stdout, filtered by the verbosity level (or the
//!   `RUST_LOG` environment variable when set),
//! - builds the tokio runtime,
//! - runs the entry point to completion,
//! - prints the error chain on failure (unless quiet) or the summary on success (if requested).
//!
//! Progress bars are drawn on stderr so they never interleave with log lines.

use anyhow::Result;

mod config;
mod progress;

pub use config::{OutputConfig, RuntimeConfig};
pub use progress::{ByteProgress, ProgressMode};

fn init_tracing(output: &OutputConfig) {
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(output.level_filter().into())
        .from_env_lossy();
    let result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stdout)
        .with_target(false)
        .try_init();
    if let Err(error) = result {
        eprintln!("failed to initialize logging: {error}");
    }
}

/// Runs `func` on a fresh tokio runtime. Returns `None` if anything failed.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary>>,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start tokio runtime: {error}");
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}

/// Asks a yes/no question on the terminal; anything but `y`/`yes` is a no.
pub fn confirm(prompt: &str) -> Result<bool> {
    use std::io::Write;
    print!("{prompt} (y/n) ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}
