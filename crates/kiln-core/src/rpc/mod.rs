//! Resource collection channel: newline-delimited JSON frames over TCP.
//!
//! Every connection carries exactly one call. The first line is a [`Call`];
//! declare and data-plane calls get a single [`Reply`] and the connection is
//! closed, while `serve` calls keep the connection open as a registration
//! stream of [`StreamMessage`]s.

pub mod client;
pub mod messages;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use client::{CollectionClient, RegistrationStream};
pub use messages::{
    ApiResource, ApiSecurityDefinitionResource, BlobEventType, BucketResource, Call, Code,
    DeclareRequest, HttpMethod, HttpProxyRegistration, KeyValueStoreResource,
    ListenerRegistration, PolicyResource, QueueResource, Registration, Reply, ResourceDeclaration,
    RouteOptions, RouteRegistration, ScheduleCadence, ScheduleRegistration, SecretResource,
    SecurityDefinition, Status, StreamKind, StreamMessage, SubscriptionRegistration,
    TopicResource, WebsocketEventType, WebsocketRegistration,
};

/// Errors raised while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connection closed before a reply was received")]
    Closed,

    #[error("call rejected: {0}")]
    Rejected(Status),

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

/// Longest line a [`FrameReader`] accepts by default.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Reads one JSON value per line.
pub struct FrameReader<R> {
    reader: R,
    line: Vec<u8>,
    max_len: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_len(reader, MAX_FRAME_LEN)
    }

    pub fn with_max_len(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            line: Vec::new(),
            max_len,
        }
    }

    /// Next frame, or `None` once the peer closed its side.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, RpcError> {
        // One extra byte leaves room for the newline of a frame at the limit.
        let limit = u64::try_from(self.max_len)
            .unwrap_or(u64::MAX)
            .saturating_add(1);
        loop {
            self.line.clear();
            let read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.line)
                .await?;
            if read == 0 {
                return Ok(None);
            }
            if self.line.last() == Some(&b'\n') {
                self.line.pop();
            } else if self.line.len() > self.max_len {
                return Err(RpcError::FrameTooLarge {
                    limit: self.max_len,
                });
            }
            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(serde_json::from_slice(&self.line)?));
        }
    }
}

/// Writes one JSON value per line.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send<T: Serialize>(&mut self, frame: &T) -> Result<(), RpcError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), RpcError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
