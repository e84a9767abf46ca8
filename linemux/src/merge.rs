use std::{future::Future, io, net::SocketAddr};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    task::{JoinError, JoinSet},
};
use tracing::{debug, info, warn};

use crate::line::{Line, ReaderOptions, read_line, write_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOptions {
    pub reader: ReaderOptions,
    /// Lines queued for the output writer across all peers.
    pub sink_capacity: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            reader: ReaderOptions::default(),
            sink_capacity: 256,
        }
    }
}

/// Fan-in service: every TCP peer's lines end up on one output sink.
///
/// Each connection is drained by its own task. Lines are funnelled through a
/// channel to a single writer task, so a line and its terminator are always
/// written as one unit no matter how many peers are talking at once.
pub struct Merger {
    listener: TcpListener,
    options: MergeOptions,
}

impl Merger {
    pub fn new(listener: TcpListener, options: MergeOptions) -> Self {
        Self { listener, options }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts peers until `shutdown` resolves, writing their lines to `sink`.
    /// Returns the number of lines written.
    pub async fn run_until<W, F>(self, sink: W, shutdown: F) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = ()> + Send,
    {
        let Merger { listener, options } = self;
        let (lines_tx, lines_rx) = mpsc::channel(options.sink_capacity.max(1));
        let mut writer = tokio::spawn(write_sink(sink, lines_rx));
        let mut peers = JoinSet::new();
        tokio::pin!(shutdown);

        let finished = loop {
            select! {
                _ = &mut shutdown => {
                    info!("merge shutting down");
                    break None;
                }
                result = &mut writer => break Some(result),
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &lines_tx, &mut peers, options.reader);
                }
                Some(result) = peers.join_next(), if !peers.is_empty() => {
                    reap_peer(result);
                }
            }
        };

        drop(listener);
        peers.shutdown().await;
        drop(lines_tx);

        let result = match finished {
            Some(result) => result,
            None => writer.await,
        };
        let written = result
            .context("output writer task failed")?
            .context("failed to write merged output")?;
        debug!(written, "merge finished");
        Ok(written)
    }

    pub async fn run_until_ctrl_c<W>(self, sink: W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.run_until(sink, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    sink: &mpsc::Sender<Line>,
    peers: &mut JoinSet<()>,
    options: ReaderOptions,
) {
    match result {
        Ok((stream, peer)) => {
            let sink = sink.clone();
            peers.spawn(async move {
                info!(%peer, "peer connected");
                match forward_peer_lines(stream, sink, options.max_line_bytes).await {
                    Ok(lines) => info!(%peer, lines, "peer disconnected"),
                    Err(err) => warn!(%peer, error = %err, "peer connection closed with error"),
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn reap_peer(result: Result<(), JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            warn!(error = ?err, "peer handler panicked");
        }
    }
}

async fn forward_peer_lines(
    stream: TcpStream,
    sink: mpsc::Sender<Line>,
    max_bytes: usize,
) -> io::Result<u64> {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut forwarded = 0;

    while let Some(line) = read_line(&mut reader, &mut buf, max_bytes).await? {
        if sink.send(line).await.is_err() {
            debug!("output writer gone; dropping peer");
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}

async fn write_sink<W>(mut sink: W, mut lines: mpsc::Receiver<Line>) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(line) = lines.recv().await {
        write_line(&mut sink, &line).await?;
        written += 1;
    }
    sink.flush().await?;
    Ok(written)
}
