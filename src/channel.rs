//! Length-announced transfer of one bundle over a byte stream.
//!
//! A sender first writes the decimal length of the encoded bundle (or the
//! [`DISCONNECT_SENTINEL`] to say nothing follows), then the bundle bytes.
//! The receiver accumulates fixed-size chunks until the announced length
//! has arrived. Either message may be split or coalesced by the transport;
//! the announcement ends at the first non-digit byte.

use std::time::Duration;

use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{RegError, Result};

/// Sent in place of a size announcement to close the connection.
pub const DISCONNECT_SENTINEL: &str = "\nConnection closed";

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Largest number of decimal digits accepted in a size announcement.
const MAX_ANNOUNCEMENT_DIGITS: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Receive buffer size for payload reads.
    pub chunk_size: usize,
    /// Applied to payload reads and to writes. Waiting for the announcement
    /// or for an operator response is never timed out.
    pub io_timeout: Option<Duration>,
    /// Announcements above this are rejected.
    pub max_bundle_size: u64,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_timeout: Some(Duration::from_secs(60)),
            max_bundle_size: 64 * 1024 * 1024,
        }
    }
}

/// First message of a transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Announcement {
    /// `prefix` holds payload bytes that arrived in the same read as the
    /// announcement.
    Size { announced: u64, prefix: Vec<u8> },
    Disconnect,
}

/// Interprets the first message received on a connection.
///
/// The announcement is the leading run of ASCII digits; anything after it
/// is the start of the payload.
pub fn parse_announcement(message: &[u8], max_size: u64) -> Result<Announcement> {
    if message.starts_with(DISCONNECT_SENTINEL.as_bytes()) {
        return Ok(Announcement::Disconnect);
    }

    let invalid =
        || RegError::InvalidSizeHeader(preview(message).into_owned());

    let digits = message
        .iter()
        .take_while(|byte| byte.is_ascii_digit())
        .count();
    if digits == 0 || digits > MAX_ANNOUNCEMENT_DIGITS {
        return Err(invalid());
    }

    let announced: u64 = std::str::from_utf8(&message[..digits])
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(invalid)?;
    if announced > max_size {
        return Err(invalid());
    }

    let prefix = message[digits..].to_vec();
    if prefix.len() as u64 > announced {
        return Err(invalid());
    }

    Ok(Announcement::Size { announced, prefix })
}

fn preview(message: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(&message[..message.len().min(64)])
}

/// Progress of one payload transfer.
#[derive(Debug)]
pub struct Transfer {
    announced: u64,
    buffer: Vec<u8>,
}

impl Transfer {
    pub fn new(announced: u64) -> Self {
        Self {
            announced,
            // grows as bytes arrive
            buffer: Vec::with_capacity(announced.min(1024 * 1024) as usize),
        }
    }

    pub fn announced(&self) -> u64 {
        self.announced
    }

    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn remaining(&self) -> u64 {
        self.announced - self.received()
    }

    pub fn is_complete(&self) -> bool {
        self.announced > 0 && self.received() == self.announced
    }

    /// Appends a chunk. Chunks that would overshoot the announced size are
    /// refused.
    pub fn accept(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.len() as u64 > self.remaining() {
            return Err(RegError::ConnectionError(format!(
                "{} bytes would overshoot the announced {} by {}",
                chunk.len(),
                self.announced,
                chunk.len() as u64 - self.remaining()
            )));
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

fn transport(e: std::io::Error) -> RegError {
    RegError::ConnectionError(e.to_string())
}

/// A byte stream carrying exactly one bundle transfer.
pub struct FramedChannel<S> {
    stream: Option<S>,
    options: ChannelOptions,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, options: ChannelOptions) -> Self {
        Self {
            stream: Some(stream),
            options,
        }
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn stream(&mut self) -> Result<&mut S> {
        self.stream.as_mut().ok_or_else(|| {
            RegError::ConnectionError("channel is closed".to_owned())
        })
    }

    async fn timed<T, F>(timeout: Option<Duration>, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, operation)
                .await?
                .map_err(transport),
            None => operation.await.map_err(transport),
        }
    }

    /// Writes `bytes` in full. Nothing is retried.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let timeout = self.options.io_timeout;
        let stream = self.stream()?;
        Self::timed(timeout, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await?;
        trace!("sent {} bytes", bytes.len());
        Ok(())
    }

    pub async fn announce_size(&mut self, size: usize) -> Result<()> {
        debug!("announcing {size} bytes");
        self.send(size.to_string().as_bytes()).await
    }

    pub async fn send_disconnect(&mut self) -> Result<()> {
        debug!("sending disconnect sentinel");
        self.send(DISCONNECT_SENTINEL.as_bytes()).await
    }

    /// One read of at most `limit` bytes. An empty result means the peer
    /// closed its side.
    async fn read_chunk(
        &mut self,
        limit: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; limit];
        let stream = self.stream()?;
        let read = Self::timed(timeout, stream.read(&mut buffer)).await?;
        buffer.truncate(read);
        Ok(buffer)
    }

    /// Waits for the first message of a transfer.
    pub async fn read_announcement(&mut self) -> Result<Announcement> {
        let chunk_size = self.options.chunk_size;
        let mut message = self.read_chunk(chunk_size, None).await?;
        if message.is_empty() {
            return Err(RegError::ConnectionError(
                "peer closed before announcing a size".to_owned(),
            ));
        }

        // The sentinel may be split across reads.
        let sentinel = DISCONNECT_SENTINEL.as_bytes();
        while message.len() < sentinel.len() && sentinel.starts_with(&message)
        {
            let more = self
                .read_chunk(sentinel.len() - message.len(), None)
                .await?;
            if more.is_empty() {
                break;
            }
            message.extend_from_slice(&more);
        }

        // So may the digits. The payload always starts with a non-digit.
        let timeout = self.options.io_timeout;
        while message.len() < MAX_ANNOUNCEMENT_DIGITS
            && message.iter().all(u8::is_ascii_digit)
        {
            let more = self.read_chunk(chunk_size, timeout).await?;
            if more.is_empty() {
                break;
            }
            message.extend_from_slice(&more);
        }

        parse_announcement(&message, self.options.max_bundle_size)
    }

    /// Waits while the peer has nothing more to say. Returns once it sends
    /// the disconnect sentinel or closes its side; any other bytes are
    /// discarded.
    pub async fn await_peer_exit(&mut self) -> Result<()> {
        let sentinel = DISCONNECT_SENTINEL.as_bytes();
        let chunk_size = self.options.chunk_size;
        let mut pending = Vec::new();
        loop {
            let chunk = self.read_chunk(chunk_size, None).await?;
            if chunk.is_empty() {
                return Ok(());
            }
            pending.extend_from_slice(&chunk);
            if pending
                .windows(sentinel.len())
                .any(|window| window == sentinel)
            {
                return Ok(());
            }
            trace!("ignoring {} unexpected bytes", chunk.len());
            let keep = pending.len().min(sentinel.len() - 1);
            pending.drain(..pending.len() - keep);
        }
    }

    /// Reads chunks until `transfer` holds the announced number of bytes.
    ///
    /// `on_progress` is called with the running total after every chunk.
    pub async fn receive_payload<F>(
        &mut self,
        transfer: &mut Transfer,
        mut on_progress: F,
    ) -> Result<()>
    where
        F: FnMut(u64),
    {
        let chunk_size = self.options.chunk_size as u64;
        let timeout = self.options.io_timeout;
        while transfer.remaining() > 0 {
            let limit = transfer.remaining().min(chunk_size) as usize;
            let chunk = self.read_chunk(limit, timeout).await?;
            if chunk.is_empty() {
                return Err(RegError::TruncatedTransfer {
                    received: transfer.received(),
                    announced: transfer.announced(),
                });
            }
            transfer.accept(&chunk)?;
            trace!(
                "received {} of {} bytes",
                transfer.received(),
                transfer.announced()
            );
            on_progress(transfer.received());
        }
        Ok(())
    }

    /// Reads until the peer closes or `max` bytes have arrived.
    pub async fn receive_to_end(&mut self, max: usize) -> Result<Vec<u8>> {
        let chunk_size = self.options.chunk_size;
        let mut received = Vec::new();
        while received.len() < max {
            let limit = chunk_size.min(max - received.len());
            let chunk = self.read_chunk(limit, None).await?;
            if chunk.is_empty() {
                break;
            }
            received.extend_from_slice(&chunk);
        }
        Ok(received)
    }

    /// Shuts the stream down and releases it. Closing twice does nothing.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("shutdown on close failed: {e}");
            }
        }
    }
}
