use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{
    exec::{ChildCommand, Supervisor},
    hub::HubOptions,
    line::{DEFAULT_MAX_LINE_BYTES, ReaderOptions},
    merge::MergeOptions,
    split::SplitOptions,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept TCP peers and merge every line they send onto stdout.
    Merge(MergeArgs),
    /// Broadcast each stdin line to every connected TCP peer.
    Split(SplitArgs),
    /// Pipe stdin lines into a command, restarting it on a fixed interval.
    Exec(ExecArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LineArgs {
    /// Longest accepted line in bytes, terminator excluded.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,
}

impl LineArgs {
    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            max_line_bytes: self.max_line_bytes,
            ..ReaderOptions::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct MergeArgs {
    /// Address the listener binds to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Port to accept peers on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 8163)]
    pub port: u16,

    #[command(flatten)]
    pub lines: LineArgs,
}

impl MergeArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn options(&self) -> MergeOptions {
        MergeOptions {
            reader: self.lines.reader_options(),
            ..MergeOptions::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SplitArgs {
    /// Address the listener binds to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Port to accept peers on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 8164)]
    pub port: u16,

    /// Lines buffered per peer before a send has to wait on it.
    #[arg(long, default_value_t = 64)]
    pub queue_depth: usize,

    /// How long a peer that stopped reading may hold up a line before it is disconnected.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub send_timeout: Duration,

    /// How long peers get to flush queued lines after stdin ends.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub drain_timeout: Duration,

    #[command(flatten)]
    pub lines: LineArgs,
}

impl SplitArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn options(&self) -> SplitOptions {
        SplitOptions {
            hub: HubOptions {
                queue_depth: self.queue_depth,
                send_timeout: self.send_timeout,
            },
            reader: self.lines.reader_options(),
            drain_timeout: self.drain_timeout,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExecArgs {
    /// Restart the command this often, e.g. `500ms` or `1m`. Omit to never restart.
    #[arg(short = 't', long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    #[command(flatten)]
    pub lines: LineArgs,

    /// Command to run, followed by its arguments.
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

impl ExecArgs {
    pub fn supervisor(&self) -> Result<Supervisor> {
        let (program, args) = self
            .command
            .split_first()
            .context("exec needs a command to run")?;
        Ok(Supervisor::new(ChildCommand::new(program).args(args))
            .rotate_every(self.timeout)
            .reader_options(self.lines.reader_options()))
    }
}
