//! Stream relay between the caller and the sandboxed process
//!
//! Standard input goes in once through a [`StdinChannel`]. Output comes back
//! as a sequence of [`Frame`]s, each tagged with the logical stream it
//! belongs to, and is forwarded into an [`OutputSink`] in arrival order.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

/// Size of the multiplexed frame header
pub const FRAME_HEADER_LEN: usize = 8;

/// Logical stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamTag {
    /// Decode the stream byte of a frame header
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(StreamTag::Stdin),
            1 => Some(StreamTag::Stdout),
            2 => Some(StreamTag::Stderr),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            StreamTag::Stdin => 0,
            StreamTag::Stdout => 1,
            StreamTag::Stderr => 2,
        }
    }
}

/// One chunk of sandbox output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamTag,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream: StreamTag, payload: impl Into<Bytes>) -> Self {
        Frame {
            stream,
            payload: payload.into(),
        }
    }
}

/// Lazy, finite sequence of output frames
pub type FrameStream = BoxStream<'static, Result<Frame>>;

/// Reader for the multiplexed output format: a header of
/// `[stream, 0, 0, 0, len_be_u32]` followed by `len` payload bytes.
///
/// Only needed by runtimes that hand back the raw attach byte stream, such
/// as the in-memory runtime used in tests. [`DockerRuntime`] gets frames
/// already split by bollard and maps them with `frame_from_log`.
///
/// [`DockerRuntime`]: crate::sandbox::DockerRuntime
pub struct FrameReader<R> {
    reader: R,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        FrameReader { reader }
    }

    /// Read the next frame. `Ok(None)` means the channel closed cleanly on a
    /// frame boundary.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut filled = 0;
        while filled < FRAME_HEADER_LEN {
            let n = self
                .reader
                .read(&mut header[filled..])
                .await
                .map_err(|e| Error::Stream(format!("read frame header: {}", e)))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::Stream(format!(
                    "channel closed inside frame header ({} of {} bytes)",
                    filled, FRAME_HEADER_LEN
                )));
            }
            filled += n;
        }

        let stream = StreamTag::from_byte(header[0])
            .ok_or_else(|| Error::Stream(format!("unknown stream tag {}", header[0])))?;
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::Stream(format!("read {}-byte frame payload: {}", len, e)))?;

        Ok(Some(Frame::new(stream, payload)))
    }

    /// Turn the reader into a stream. The reader is consumed, so the
    /// sequence cannot be restarted; it ends after the first error.
    pub fn into_stream(self) -> FrameStream {
        stream::try_unfold(self, |mut reader| async move {
            let next = reader.next_frame().await?;
            Ok::<_, Error>(next.map(|frame| (frame, reader)))
        })
        .boxed()
    }
}

/// Write half of the sandbox's standard input.
///
/// [`StdinChannel::deliver`] consumes the channel, so input is written at
/// most once and the write side is always shut down afterwards.
pub struct StdinChannel {
    writer: Pin<Box<dyn AsyncWrite + Send>>,
}

impl StdinChannel {
    pub fn new(writer: impl AsyncWrite + Send + 'static) -> Self {
        StdinChannel {
            writer: Box::pin(writer),
        }
    }

    pub fn from_pinned(writer: Pin<Box<dyn AsyncWrite + Send>>) -> Self {
        StdinChannel { writer }
    }

    /// Write `input`, then signal end-of-input
    pub async fn deliver(mut self, input: &[u8]) -> Result<usize> {
        if !input.is_empty() {
            self.writer
                .write_all(input)
                .await
                .map_err(|e| Error::Stream(format!("write stdin: {}", e)))?;
        }
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Stream(format!("flush stdin: {}", e)))?;
        self.writer
            .shutdown()
            .await
            .map_err(|e| Error::Stream(format!("close stdin: {}", e)))?;
        debug!("delivered {} bytes of stdin", input.len());
        Ok(input.len())
    }
}

/// Destination for relayed output
#[async_trait]
pub trait OutputSink: Send {
    async fn write(&mut self, stream: StreamTag, payload: Bytes) -> Result<()>;
}

#[async_trait]
impl OutputSink for Vec<u8> {
    async fn write(&mut self, _stream: StreamTag, payload: Bytes) -> Result<()> {
        self.extend_from_slice(&payload);
        Ok(())
    }
}

/// Sink that forwards output chunks over a channel, e.g. into a response body
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        ChannelSink { tx }
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn write(&mut self, _stream: StreamTag, payload: Bytes) -> Result<()> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| Error::Stream("output receiver closed".to_string()))
    }
}

/// Byte and frame counts of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub frames: u64,
}

impl RelaySummary {
    pub fn total_bytes(&self) -> u64 {
        self.stdout_bytes + self.stderr_bytes
    }
}

/// Forward stdout and stderr frames into `sink` until the stream ends
pub async fn relay_output<S>(mut frames: FrameStream, sink: &mut S) -> Result<RelaySummary>
where
    S: OutputSink + ?Sized,
{
    let mut summary = RelaySummary::default();
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let len = frame.payload.len() as u64;
        match frame.stream {
            StreamTag::Stdin => continue,
            StreamTag::Stdout => summary.stdout_bytes += len,
            StreamTag::Stderr => summary.stderr_bytes += len,
        }
        summary.frames += 1;
        sink.write(frame.stream, frame.payload).await?;
    }
    Ok(summary)
}
