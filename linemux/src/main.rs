use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use linemux::{
    cli::{Cli, Command},
    exec::ExecError,
    merge::Merger,
    split::Splitter,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // Stdout carries data, so logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let code = match run(cli.command).await {
        Ok(()) => 0,
        Err(err) => exit_code(&err),
    };

    // Exiting here rather than returning skips the runtime's wait on the
    // blocking stdin reader, which may still be parked in a read.
    std::process::exit(code);
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Merge(args) => {
            let listen = args.listen_addr();
            let listener = TcpListener::bind(listen)
                .await
                .with_context(|| format!("failed to bind {listen}"))?;
            let merger = Merger::new(listener, args.options());
            let addr = merger.local_addr()?;
            info!("merge listening on {}", addr);
            let written = merger.run_until_ctrl_c(tokio::io::stdout()).await?;
            info!(written, "merge stopped");
        }
        Command::Split(args) => {
            let listen = args.listen_addr();
            let listener = TcpListener::bind(listen)
                .await
                .with_context(|| format!("failed to bind {listen}"))?;
            let splitter = Splitter::new(listener, args.options());
            let addr = splitter.local_addr()?;
            info!("split listening on {}", addr);
            let broadcast = splitter.run(tokio::io::stdin()).await?;
            info!(broadcast, "split stopped");
        }
        Command::Exec(args) => {
            let summary = args.supervisor()?.run(tokio::io::stdin()).await?;
            info!(
                generations = summary.generations,
                lines = summary.lines,
                "exec finished"
            );
        }
    }

    Ok(())
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ExecError>() {
        Some(exec_err @ ExecError::ChildExited { .. }) => {
            info!("{exec_err}");
            exec_err.exit_code()
        }
        _ => {
            error!("{err:#}");
            1
        }
    }
}
