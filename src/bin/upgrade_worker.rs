//! Entry point of the upgrade worker jobs
//!
//! Exits non-zero on any failure so the job records a failed pod; on success
//! the result line is the last thing written to stdout.

use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use patroni_operator::worker::{self, WorkerArgs};

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // stdout is reserved for the result line
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("patroni_operator=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = WorkerArgs::parse();

    let line = match worker::run(&args).await {
        Ok(line) => line,
        Err(e) => {
            error!(mode = args.mode.as_str(), error = %e, "upgrade worker failed");
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{}", line).and_then(|_| stdout.flush()) {
        error!(error = %e, "failed to write result");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
