//! Line-oriented stream plumbing between stdio, TCP peers and subprocesses.
//!
//! The `linemux` binary exposes three topologies built from the modules below:
//!
//! - `merge` ([`merge`]): many TCP peers, one output. Each connection is drained
//!   by its own task and lines are serialised onto stdout.
//! - `split` ([`split`]): one input, many TCP peers. Stdin lines are published
//!   through a [`hub::Hub`] to every connected peer.
//! - `exec` ([`exec`]): stdin lines are piped into a command that is restarted
//!   on a fixed interval by a single supervising task.
//!
//! Supporting modules:
//!
//! - [`line`] turns byte streams into [`line::Line`]s and back.
//! - [`hub`] is the broadcast registry with explicit join/leave/send/close.
//! - [`cli`] parses the command line for the three subcommands.
//!
//! Integration tests drive the services over real sockets and processes.

pub mod cli;
pub mod exec;
pub mod hub;
pub mod line;
pub mod merge;
pub mod split;
