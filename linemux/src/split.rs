use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    hub::{Hub, HubOptions},
    line::{Line, LineReader, ReaderOptions, write_line},
};

/// Identity of one accepted connection, unique for the life of a [`Splitter`].
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitOptions {
    pub hub: HubOptions,
    pub reader: ReaderOptions,
    /// How long peers get to flush queued lines once the input has ended.
    pub drain_timeout: Duration,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            hub: HubOptions::default(),
            reader: ReaderOptions::default(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Fan-out service: every line of the input goes to every connected peer.
pub struct Splitter {
    listener: TcpListener,
    hub: Arc<Hub<ConnectionId>>,
    options: SplitOptions,
}

impl Splitter {
    pub fn new(listener: TcpListener, options: SplitOptions) -> Self {
        Self {
            listener,
            hub: Arc::new(Hub::new(options.hub)),
            options,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<Hub<ConnectionId>> {
        Arc::clone(&self.hub)
    }

    /// Broadcasts `input` line by line until it ends, then stops accepting,
    /// closes the hub and gives peers a chance to flush. Returns the number of
    /// lines broadcast. A read error on `input` is returned after shutdown.
    pub async fn run<R>(self, input: R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Splitter {
            listener,
            hub,
            options,
        } = self;
        let mut lines = LineReader::spawn(input, options.reader);
        let mut peers = JoinSet::new();
        let mut next_id: ConnectionId = 0;
        let mut broadcast = 0;

        let outcome = loop {
            select! {
                item = lines.next() => match item {
                    Some(Ok(line)) => {
                        let delivered = hub.send(line).await?;
                        broadcast += 1;
                        debug!(delivered, "line broadcast");
                    }
                    Some(Err(err)) => break Err(err),
                    None => break Ok(()),
                },
                accept_result = listener.accept() => {
                    handle_accept_result(
                        accept_result,
                        &hub,
                        &mut peers,
                        &mut next_id,
                        options.hub.send_timeout,
                    )
                    .await?;
                }
                Some(result) = peers.join_next(), if !peers.is_empty() => {
                    if let Err(err) = result {
                        warn!(error = ?err, "peer handler failed");
                    }
                }
            }
        };

        drop(listener);
        let remaining = hub.close().await?;
        info!(broadcast, remaining, "input ended; closing peers");
        drain_peers(&mut peers, options.drain_timeout).await;

        outcome.context("failed to read input lines")?;
        Ok(broadcast)
    }
}

async fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    hub: &Arc<Hub<ConnectionId>>,
    peers: &mut JoinSet<()>,
    next_id: &mut ConnectionId,
    stall_timeout: Duration,
) -> Result<()> {
    let (stream, peer) = match result {
        Ok(accepted) => accepted,
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            return Ok(());
        }
    };

    let id = *next_id;
    *next_id += 1;
    // Joining before the handler is spawned means the peer gets every line
    // broadcast after its connection was accepted.
    let inbox = hub.join(id).await?;
    info!(%peer, id, "peer connected");

    let hub = Arc::clone(hub);
    peers.spawn(async move {
        if let Err(err) = serve_peer(stream, inbox, stall_timeout).await {
            debug!(%peer, error = %err, "peer connection closed with error");
        }
        if let Err(err) = hub.leave(&id).await {
            debug!(%peer, error = %err, "peer already removed from hub");
        }
        info!(%peer, id, "peer disconnected");
    });
    Ok(())
}

/// Copies the peer's inbox onto its socket until the inbox ends, a write
/// fails, or a single line stays unwritten for `stall_timeout`. Anything the
/// peer sends is discarded; a peer closing its write side keeps receiving.
async fn serve_peer(
    stream: TcpStream,
    mut inbox: mpsc::Receiver<Line>,
    stall_timeout: Duration,
) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut discard = [0u8; 1024];
    let mut reading = true;

    loop {
        select! {
            line = inbox.recv() => match line {
                Some(line) => write_line_within(&mut writer, &line, stall_timeout).await?,
                None => return writer.shutdown().await,
            },
            read = reader.read(&mut discard), if reading => match read {
                Ok(0) => reading = false,
                Ok(_) => {}
                Err(err) => return Err(err),
            },
        }
    }
}

async fn write_line_within<W>(writer: &mut W, line: &Line, limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match timeout(limit, write_line(writer, line)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "peer stopped reading",
        )),
    }
}

async fn drain_peers(peers: &mut JoinSet<()>, drain_timeout: Duration) {
    let drained = timeout(drain_timeout, async {
        while let Some(result) = peers.join_next().await {
            if let Err(err) = result {
                warn!(error = ?err, "peer handler failed");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            stuck = peers.len(),
            timeout = ?drain_timeout,
            "peers did not drain in time; dropping them"
        );
        peers.shutdown().await;
    }
}
