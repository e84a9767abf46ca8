use std::{borrow::Cow, fmt, io, sync::Arc};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, trace};

/// Record terminator on the wire.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Longest record accepted before the reader gives up on a stream.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// One record of a line-delimited stream, without its terminator.
///
/// Lines are byte-transparent: nothing checks that they hold UTF-8. Cloning is
/// cheap so a single line can be handed to many subscribers.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Line(Arc<[u8]>);

impl Line {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.to_string_lossy(), f)
    }
}

impl From<&[u8]> for Line {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<Vec<u8>> for Line {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }
}

impl From<&str> for Line {
    fn from(text: &str) -> Self {
        Self::from(text.as_bytes())
    }
}

impl From<String> for Line {
    fn from(text: String) -> Self {
        Self::from(text.into_bytes())
    }
}

/// Tuning for [`LineReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Longest accepted record, terminator excluded.
    pub max_line_bytes: usize,
    /// Lines buffered between the reader task and its consumer.
    pub capacity: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            capacity: 1,
        }
    }
}

/// Reads one record from `reader`.
///
/// Returns `Ok(None)` at end of input. The trailing `\n` is stripped, and so is a
/// `\r` right before it. A final record without a terminator is still returned.
/// A record longer than `max_bytes` fails with [`io::ErrorKind::InvalidData`].
/// `buf` is scratch space reused between calls.
pub async fn read_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> io::Result<Option<Line>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        match available.iter().position(|&b| b == LINE_TERMINATOR) {
            Some(pos) => {
                ensure_within_limit(buf.len() + pos, max_bytes)?;
                buf.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                break;
            }
            None => {
                let len = available.len();
                ensure_within_limit(buf.len() + len, max_bytes)?;
                buf.extend_from_slice(available);
                reader.consume(len);
            }
        }
    }

    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if buf.len() > max_bytes {
        return Err(line_too_long(max_bytes));
    }
    Ok(Some(Line::from(buf.as_slice())))
}

fn ensure_within_limit(len: usize, max_bytes: usize) -> io::Result<()> {
    // One spare byte for a `\r` that gets stripped once the record is complete.
    if len > max_bytes.saturating_add(1) {
        return Err(line_too_long(max_bytes));
    }
    Ok(())
}

fn line_too_long(max_bytes: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line exceeds {max_bytes} bytes"),
    )
}

/// Writes `line` followed by the terminator as a single buffer, then flushes.
pub async fn write_line<W>(writer: &mut W, line: &Line) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(LINE_TERMINATOR);
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// A lazy sequence of lines produced by a background task.
///
/// The task owns the byte stream and pushes each line into a bounded channel,
/// so the producer only runs ahead of the consumer by `capacity` lines. The
/// sequence ends at end of input; a read error is yielded as the final item.
pub struct LineReader {
    lines: mpsc::Receiver<io::Result<Line>>,
    task: JoinHandle<()>,
}

impl LineReader {
    pub fn spawn<R>(reader: R, options: ReaderOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, lines) = mpsc::channel(options.capacity.max(1));
        let task = tokio::spawn(pump_lines(
            BufReader::new(reader),
            tx,
            options.max_line_bytes,
        ));
        Self { lines, task }
    }

    /// Next line, `Some(Err(_))` once if the stream failed, then `None`.
    ///
    /// Cancel safe: a line is never lost when this future is dropped.
    pub async fn next(&mut self) -> Option<io::Result<Line>> {
        self.lines.recv().await
    }

    /// Stops the background task. Lines not yet taken are discarded.
    pub fn close(&mut self) {
        self.lines.close();
        self.task.abort();
    }
}

impl Drop for LineReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump_lines<R>(mut reader: R, tx: mpsc::Sender<io::Result<Line>>, max_bytes: usize)
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut count: u64 = 0;
    loop {
        let item = match read_line(&mut reader, &mut buf, max_bytes).await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => {
                debug!(lines = count, "line source reached end of input");
                return;
            }
            Err(err) => {
                debug!(lines = count, error = %err, "line source failed");
                Err(err)
            }
        };

        let failed = item.is_err();
        if tx.send(item).await.is_err() {
            trace!("line consumer went away");
            return;
        }
        if failed {
            return;
        }
        count += 1;
    }
}
