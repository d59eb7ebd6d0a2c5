//! Message framing over a streaming socket.
//!
//! A gateway message travels as one WebSocket message that may be split
//! into several fragments:
//!
//! ```text
//! send:    encode into pooled scratch ──► [≤1024 B] [≤1024 B] … [≤1024 B, FIN]
//! receive: fragment … fragment(FIN) ──► accumulate (≤ 512,000 B) ──► decode
//! ```
//!
//! The socket is reached through the [`FrameSink`] and [`FrameSource`]
//! seams; [`crate::ws`] implements them for the live connection.

// Rust guideline compliant 2026-02

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::WireMessage;
use crate::constants::{MAX_MESSAGE_SIZE, RECEIVE_SCRATCH_SIZE, SCRATCH_POOL_LIMIT, SEND_CHUNK_SIZE};
use crate::lock_unpoisoned as lock;

/// One unit read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Payload bytes of the current message.
    Data {
        /// Raw bytes.
        bytes: Vec<u8>,
        /// Whether this fragment completes the message.
        end_of_message: bool,
    },
    /// The peer sent a close frame.
    Close,
}

/// Outbound half of a socket, fragment granularity.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one fragment. `first` selects the data opcode, `last` sets FIN.
    async fn send_fragment(&mut self, chunk: &[u8], first: bool, last: bool) -> Result<()>;

    /// Send a close frame.
    async fn send_close(&mut self) -> Result<()>;
}

/// Inbound half of a socket, fragment granularity.
#[async_trait]
pub trait FrameSource: Send {
    /// Next fragment, or `None` once the stream has ended.
    async fn next_fragment(&mut self) -> Option<Result<Fragment>>;
}

/// Outcome of [`receive`] that the caller is expected to handle.
#[derive(Debug)]
pub enum Received<M> {
    /// A decoded message.
    Message(M),
    /// The message arrived whole but did not decode. Recoverable.
    DeserializeFailed {
        /// Decoder error.
        error: anyhow::Error,
        /// Short description of the raw message.
        description: String,
    },
    /// The peer closed the socket; the close was acknowledged.
    Closed,
}

/// Errors that end a framing operation.
#[derive(Debug)]
pub enum FramingError {
    /// Encoded or accumulated message exceeds [`MAX_MESSAGE_SIZE`].
    Oversize {
        /// Size that was attempted.
        size: usize,
    },
    /// The socket failed or ended mid-stream.
    Transport(anyhow::Error),
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oversize { size } => {
                write!(f, "Message too long: {size} bytes (max {MAX_MESSAGE_SIZE})")
            }
            Self::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for FramingError {}

// ============================================================================
// Scratch buffer pool
// ============================================================================

static SCRATCH_POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// A scratch buffer on loan from the pool; returned on drop.
#[derive(Debug)]
struct Scratch {
    buf: Vec<u8>,
}

impl Scratch {
    /// Borrow a buffer with at least `capacity` bytes reserved.
    fn rent(capacity: usize) -> Self {
        let pooled = lock(&SCRATCH_POOL).pop();
        let mut buf = pooled.unwrap_or_default();
        buf.clear();
        buf.reserve(capacity);
        Self { buf }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let mut pool = lock(&SCRATCH_POOL);
        if pool.len() < SCRATCH_POOL_LIMIT {
            pool.push(std::mem::take(&mut self.buf));
        }
    }
}

// ============================================================================
// Send / receive
// ============================================================================

/// Encode `message` and write it as fragments of at most
/// [`SEND_CHUNK_SIZE`] bytes, marking only the last one as end of message.
///
/// # Errors
///
/// [`FramingError::Oversize`] before anything is written if the encoding
/// can exceed [`MAX_MESSAGE_SIZE`]; [`FramingError::Transport`] if the
/// sink fails.
pub async fn send<M, S>(message: &M, sink: &mut S) -> Result<(), FramingError>
where
    M: WireMessage + Sync,
    S: FrameSink + ?Sized,
{
    let max_size = message.max_encoded_len();
    if max_size > MAX_MESSAGE_SIZE {
        return Err(FramingError::Oversize { size: max_size });
    }

    let mut scratch = Scratch::rent(max_size);
    scratch.buf.resize(max_size, 0);
    let written = message.encode_into(&mut scratch.buf);
    let bytes = &scratch.buf[..written];

    if bytes.is_empty() {
        return sink
            .send_fragment(&[], true, true)
            .await
            .map_err(FramingError::Transport);
    }

    let mut done = 0;
    while done < bytes.len() {
        let take = SEND_CHUNK_SIZE.min(bytes.len() - done);
        let first = done == 0;
        done += take;
        sink.send_fragment(&bytes[done - take..done], first, done >= bytes.len())
            .await
            .map_err(FramingError::Transport)?;
    }

    Ok(())
}

/// Read fragments until a full message has arrived and decode it.
///
/// A close frame from the peer is answered with a close through `sink`
/// and reported as [`Received::Closed`].
///
/// # Errors
///
/// [`FramingError::Oversize`] if the accumulated message would exceed
/// [`MAX_MESSAGE_SIZE`]; [`FramingError::Transport`] if the source fails
/// or ends.
pub async fn receive<M, R, S>(
    source: &mut R,
    sink: &tokio::sync::Mutex<S>,
) -> Result<Received<M>, FramingError>
where
    M: WireMessage,
    R: FrameSource + ?Sized,
    S: FrameSink,
{
    let mut scratch = Scratch::rent(RECEIVE_SCRATCH_SIZE);

    loop {
        match source.next_fragment().await {
            Some(Ok(Fragment::Data {
                bytes,
                end_of_message,
            })) => {
                let size = scratch.buf.len() + bytes.len();
                if size > MAX_MESSAGE_SIZE {
                    return Err(FramingError::Oversize { size });
                }
                scratch.buf.extend_from_slice(&bytes);
                if end_of_message {
                    break;
                }
            }
            Some(Ok(Fragment::Close)) => {
                if let Err(e) = sink.lock().await.send_close().await {
                    log::debug!("[Framing] Close acknowledgement failed: {e}");
                }
                return Ok(Received::Closed);
            }
            Some(Err(e)) => return Err(FramingError::Transport(e)),
            None => {
                return Err(FramingError::Transport(anyhow::anyhow!(
                    "socket stream ended"
                )));
            }
        }
    }

    Ok(match M::decode(&scratch.buf) {
        Ok(message) => Received::Message(message),
        Err(error) => Received::DeserializeFailed {
            error,
            description: format!("{}-byte binary message", scratch.buf.len()),
        },
    })
}
