use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use common::config::ProbeConfig;
use mcp_probe::{Completion, TracingObserver, run_probe};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mcp-probe")]
#[command(about = "Drive the MCP stdio handshake against a server and report how it exits")]
struct Cli {
    /// TOML config file; defaults apply when it does not exist.
    #[arg(long, default_value = "mcp-probe.toml")]
    config: PathBuf,
    /// Override the termination deadline, in milliseconds from launch.
    #[arg(long)]
    deadline_ms: Option<u64>,
    /// Server executable followed by its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ProbeConfig::load(&cli.config)?;
    if let Some(deadline_ms) = cli.deadline_ms {
        config.deadline_ms = deadline_ms;
        config.validate()?;
    }

    let (program, args) = cli
        .command
        .split_first()
        .context("missing server command")?;

    let (result, _observer) = run_probe(program, args, &config, TracingObserver).await;
    let report = result.with_context(|| format!("probe run against `{program}` failed"))?;

    match report.outcome.completion {
        Completion::ChildExited(_) => println!("server exited on its own"),
        Completion::DeadlineReached => println!(
            "terminated server after {}ms deadline{}",
            config.deadline_ms,
            if report.killed { " (SIGKILL)" } else { "" }
        ),
    }
    println!("steps sent: {}", report.outcome.steps_sent);
    println!("server {}", report.exit);
    Ok(())
}
