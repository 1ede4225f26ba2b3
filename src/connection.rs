//! The transport session: one connection, one request, one terminal outcome.
//!
//! A [`Session`] connects through a [`Connect`] implementation, writes a single serialized
//! [`Envelope`], waits for the first inbound event, and closes the connection. Every path ends in
//! exactly one [`Outcome`].
use std::{fmt, io};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::{error::TransportError, message::Envelope};

/// Initial capacity of the reply buffer.
pub(crate) const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Default cap on an accumulated reply or a buffered request.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// The terminal result of an exchange.
#[derive(Debug)]
pub enum Outcome {
    /// The reply payload, returned verbatim.
    Reply(Bytes),
    /// The peer closed the connection before sending anything.
    Disconnected,
    /// A transport-layer fault ended the exchange.
    TransportError(TransportError),
}

impl Outcome {
    /// Returns the reply payload, if one was received.
    pub fn reply(&self) -> Option<&Bytes> {
        match self {
            Outcome::Reply(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Outcome::Reply(_))
    }
}

/// How much of the inbound stream makes up a reply.
///
/// The protocol has no message framing, so a reply split across several transport deliveries is
/// ambiguous.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// The first chunk delivered by the transport is the whole reply.
    #[default]
    FirstFrame,
    /// Accumulate everything until the peer closes its side.
    UntilClose,
}

/// Lifecycle of a [`Session`]. Each session walks this graph exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    AwaitingReply,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::AwaitingReply => "awaiting-reply",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Trait for targets a session can open a connection to.
#[async_trait]
pub trait Connect: Send + Sync {
    /// The stream type produced by connecting.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;
    /// Opens a new connection.
    async fn connect(&self) -> io::Result<Self::Stream>;
}

/// Owns one connection for the duration of one exchange.
#[derive(Debug)]
pub struct Session<S> {
    /// The open connection, once connected.
    stream: Option<S>,
    /// Current lifecycle state.
    state: SessionState,
    /// How the reply is delimited.
    reply_mode: ReplyMode,
    /// Largest reply accepted in [`ReplyMode::UntilClose`].
    max_reply_size: usize,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Creates an idle session.
    pub fn new(reply_mode: ReplyMode) -> Self {
        Self {
            stream: None,
            state: SessionState::Idle,
            reply_mode,
            max_reply_size: MAX_FRAME_SIZE,
        }
    }

    /// Caps the reply accumulated in [`ReplyMode::UntilClose`]. A longer reply fails the
    /// exchange with [`TransportError::Read`].
    pub fn with_max_reply_size(mut self, max_reply_size: usize) -> Self {
        self.max_reply_size = max_reply_size;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the full lifecycle: connect, write `envelope`, await one reply, close.
    ///
    /// The connection is shut down before this returns, whatever the outcome. If the returned
    /// future is dropped early, dropping the session closes the connection.
    ///
    /// A session runs once. Calling this again yields [`TransportError::Reused`] without
    /// connecting and leaves the state untouched.
    pub async fn run<C>(&mut self, connector: &C, envelope: &Envelope) -> Outcome
    where
        C: Connect<Stream = S>,
    {
        if self.state != SessionState::Idle {
            warn!(id = envelope.id(), "session already {}, not reconnecting", self.state);
            return Outcome::TransportError(TransportError::Reused(self.state));
        }
        self.transition(SessionState::Connecting);
        match connector.connect().await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.transition(SessionState::Connected);
            }
            Err(e) => return self.fail(TransportError::Connect(e)),
        }

        let outcome = match self.exchange(envelope).await {
            Ok(outcome) => {
                self.transition(SessionState::Completed);
                outcome
            }
            Err(e) => self.fail(e),
        };
        self.close().await;
        outcome
    }

    /// Writes the request, then waits for the reply.
    async fn exchange(&mut self, envelope: &Envelope) -> Result<Outcome, TransportError> {
        let buffer = envelope.encode().map_err(TransportError::Encode)?;
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::Write(io::ErrorKind::NotConnected.into()));
        };

        trace!(id = envelope.id(), bytes = buffer.len(), "writing request");
        stream
            .write_all(&buffer)
            .await
            .map_err(TransportError::Write)?;
        stream.flush().await.map_err(TransportError::Write)?;
        self.transition(SessionState::AwaitingReply);

        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::Read(io::ErrorKind::NotConnected.into()));
        };
        let payload = match self.reply_mode {
            ReplyMode::FirstFrame => read_first_frame(stream).await,
            ReplyMode::UntilClose => read_until_close(stream, self.max_reply_size).await,
        }
        .map_err(TransportError::Read)?;

        Ok(match payload {
            Some(payload) => {
                trace!(id = envelope.id(), bytes = payload.len(), "reply received");
                Outcome::Reply(payload)
            }
            None => {
                debug!(id = envelope.id(), "peer closed without replying");
                Outcome::Disconnected
            }
        })
    }

    /// Shuts the connection down. Failures are logged and otherwise ignored.
    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                warn!("error closing connection: {}", e);
            }
        }
    }

    fn fail(&mut self, error: TransportError) -> Outcome {
        warn!("exchange failed while {}: {}", self.state, error);
        self.transition(SessionState::Failed);
        Outcome::TransportError(error)
    }

    fn transition(&mut self, next: SessionState) {
        trace!("session {} -> {}", self.state, next);
        self.state = next;
    }
}

/// Reads one chunk. `None` means the peer closed first.
async fn read_first_frame<S>(stream: &mut S) -> io::Result<Option<Bytes>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let n = stream.read_buf(&mut buf).await?;
    Ok((n > 0).then(|| buf.freeze()))
}

/// Reads until end of stream. `None` means nothing arrived.
async fn read_until_close<S>(stream: &mut S, limit: usize) -> io::Result<Option<Bytes>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE.min(limit));
    while stream.read_buf(&mut buf).await? > 0 {
        if buf.len() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("reply exceeds {} bytes", limit),
            ));
        }
    }
    Ok((!buf.is_empty()).then(|| buf.freeze()))
}
