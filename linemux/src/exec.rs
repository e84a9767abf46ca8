//! Supervisor that feeds input lines to a command and periodically restarts it.
//!
//! The supervisor is a single task driving an explicit state machine:
//!
//! ```text
//! Starting -> Piping -> Rotating -> Starting -> ...
//!                    \-> Draining -> Terminated
//! ```
//!
//! Because that one task owns the current generation, forwarding a line and
//! closing the pipe can never overlap. A line taken from the reader is fully
//! written before a rotation tick is handled, and lines still queued in the
//! reader go to the next generation, so nothing is dropped or duplicated across
//! a rotation. Each generation gets a full period measured from its spawn.

use std::{
    ffi::OsString,
    io,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::AsyncRead,
    process::{Child, ChildStdin, Command},
    select,
    time::{Instant, Interval, MissedTickBehavior, interval_at},
};
use tracing::{debug, info, warn};

use crate::line::{Line, LineReader, ReaderOptions, write_line};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start generation {generation} of `{program}`")]
    Spawn {
        generation: u64,
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("generation {generation} was started without a stdin pipe")]
    MissingPipe { generation: u64 },
    #[error("failed to wait for generation {generation}")]
    Wait {
        generation: u64,
        #[source]
        source: io::Error,
    },
    #[error("generation {generation} exited with status {code}")]
    ChildExited { generation: u64, code: i32 },
    #[error("failed to read input lines")]
    Input(#[source] io::Error),
}

impl ExecError {
    /// Exit code the whole process should report for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecError::ChildExited { code, .. } => *code,
            _ => 1,
        }
    }
}

/// Where a child's stdout or stderr goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChildOutput {
    #[default]
    Inherit,
    Null,
}

impl ChildOutput {
    fn stdio(self) -> Stdio {
        match self {
            ChildOutput::Inherit => Stdio::inherit(),
            ChildOutput::Null => Stdio::null(),
        }
    }
}

/// The command every generation runs.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    program: OsString,
    args: Vec<OsString>,
    stdout: ChildOutput,
    stderr: ChildOutput,
}

impl ChildCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout: ChildOutput::Inherit,
            stderr: ChildOutput::Inherit,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdout(mut self, output: ChildOutput) -> Self {
        self.stdout = output;
        self
    }

    pub fn stderr(mut self, output: ChildOutput) -> Self {
        self.stderr = output;
        self
    }

    pub fn program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(self.stdout.stdio())
            .stderr(self.stderr.stdio())
            .kill_on_drop(true);
        cmd
    }
}

/// Outcome of a supervisor run that ended with every child exiting cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecSummary {
    pub generations: u64,
    pub lines: u64,
}

/// One running child and the write end of its stdin.
struct Generation {
    index: u64,
    child: Child,
    stdin: ChildStdin,
}

impl Generation {
    fn spawn(command: &ChildCommand, index: u64) -> Result<Self, ExecError> {
        let mut child = command
            .command()
            .spawn()
            .map_err(|source| ExecError::Spawn {
                generation: index,
                program: command.program(),
                source,
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or(ExecError::MissingPipe { generation: index })?;

        info!(generation = index, pid = child.id(), "child started");
        Ok(Self {
            index,
            child,
            stdin,
        })
    }

    async fn feed(&mut self, line: &Line) -> io::Result<()> {
        write_line(&mut self.stdin, line).await
    }

    /// Closes the pipe and waits for the child to exit.
    async fn finish(self) -> Result<(), ExecError> {
        let Generation {
            index,
            mut child,
            stdin,
        } = self;
        drop(stdin);

        let status = child.wait().await.map_err(|source| ExecError::Wait {
            generation: index,
            source,
        })?;
        if status.success() {
            info!(generation = index, "child exited");
            return Ok(());
        }

        let code = exit_code(status);
        warn!(generation = index, code, "child exited with failure");
        Err(ExecError::ChildExited {
            generation: index,
            code,
        })
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

enum State {
    Starting,
    Piping(Generation),
    Rotating(Generation),
    Draining(Generation),
    Terminated,
}

pub struct Supervisor {
    command: ChildCommand,
    rotate_every: Option<Duration>,
    reader: ReaderOptions,
}

impl Supervisor {
    pub fn new(command: ChildCommand) -> Self {
        Self {
            command,
            rotate_every: None,
            reader: ReaderOptions::default(),
        }
    }

    /// Restart the command on this interval. `None` or zero never rotates.
    pub fn rotate_every(mut self, period: Option<Duration>) -> Self {
        self.rotate_every = period.filter(|period| !period.is_zero());
        self
    }

    pub fn reader_options(mut self, reader: ReaderOptions) -> Self {
        self.reader = reader;
        self
    }

    /// Feeds `input` to successive generations of the command until the input
    /// ends or a child stops reading, then waits for the last child.
    ///
    /// Fails with [`ExecError::ChildExited`] as soon as any generation exits
    /// with a non-zero status.
    pub async fn run<R>(self, input: R) -> Result<ExecSummary, ExecError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut lines = LineReader::spawn(input, self.reader);
        let mut ticker = self.rotate_every.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let mut generations = 0;
        let mut forwarded = 0;
        let mut input_error = None;
        let mut state = State::Starting;

        loop {
            state = match state {
                State::Starting => {
                    let generation = Generation::spawn(&self.command, generations)?;
                    generations += 1;
                    // The period counts from the spawn, not from the previous
                    // tick, so a slow exit cannot leave a deadline already due.
                    if let Some(ticker) = ticker.as_mut() {
                        ticker.reset();
                    }
                    State::Piping(generation)
                }
                State::Piping(mut generation) => select! {
                    biased;
                    _ = next_tick(&mut ticker) => State::Rotating(generation),
                    item = lines.next() => match item {
                        Some(Ok(line)) => match generation.feed(&line).await {
                            Ok(()) => {
                                forwarded += 1;
                                State::Piping(generation)
                            }
                            Err(err) => {
                                debug!(
                                    generation = generation.index,
                                    error = %err,
                                    "child closed its input; no more lines will be read"
                                );
                                lines.close();
                                State::Draining(generation)
                            }
                        },
                        Some(Err(err)) => {
                            input_error = Some(err);
                            State::Draining(generation)
                        }
                        None => State::Draining(generation),
                    },
                },
                State::Rotating(generation) => {
                    debug!(generation = generation.index, "rotating");
                    generation.finish().await?;
                    State::Starting
                }
                State::Draining(generation) => {
                    debug!(generation = generation.index, "draining");
                    generation.finish().await?;
                    State::Terminated
                }
                State::Terminated => break,
            };
        }

        if let Some(err) = input_error {
            return Err(ExecError::Input(err));
        }
        info!(generations, lines = forwarded, "all input forwarded");
        Ok(ExecSummary {
            generations,
            lines: forwarded,
        })
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
