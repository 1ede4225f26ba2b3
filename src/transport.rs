//! Networking components for the exchange client and the reference server.
//!
//! Provides TCP and Unix domain socket connect targets, the [`Client`] that drives one
//! [`Session`] per exchange, and a small [`Server`] that answers envelopes with a [`Handler`].

use std::{
    fmt, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        TcpListener as TokioTcpListener, TcpStream, UnixListener as TokioUnixListener, UnixStream,
    },
    time::timeout,
};
use tracing::{debug, info, trace, warn};

use crate::{
    connection::{Connect, Outcome, ReplyMode, Session, MAX_FRAME_SIZE, READ_BUFFER_SIZE},
    error::*,
    message::Envelope,
};

/// Prefix that marks a Unix domain socket path in an address string.
const UNIX_PREFIX: &str = "unix:";

/// Where an exchange connects to.
///
/// Parsed from strings: a value starting with `unix:` or containing a `/` is a Unix domain socket
/// path, anything else is a TCP `host:port` resolved at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// TCP `host:port`.
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl FromStr for Address {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RpcError::Validation("server address is empty".into()));
        }
        if let Some(path) = s.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(RpcError::Validation("unix socket path is empty".into()));
            }
            return Ok(Address::Unix(path.into()));
        }
        if s.contains('/') {
            return Ok(Address::Unix(s.into()));
        }
        Ok(Address::Tcp(s.to_string()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => f.write_str(addr),
            Address::Unix(path) => write!(f, "{}{}", UNIX_PREFIX, path.display()),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Tcp(addr.to_string())
    }
}

/// Connects over TCP.
struct TcpConnector<'a> {
    addr: &'a str,
}

#[async_trait]
impl Connect for TcpConnector<'_> {
    type Stream = TcpStream;
    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(self.addr).await?;
        info!("Client: connected to server {}", self.addr);
        Ok(stream)
    }
}

/// Connects over a Unix domain socket.
struct UnixConnector<'a> {
    path: &'a Path,
}

#[async_trait]
impl Connect for UnixConnector<'_> {
    type Stream = UnixStream;
    async fn connect(&self) -> io::Result<UnixStream> {
        let stream = UnixStream::connect(self.path).await?;
        info!("Client: connected to server {}{}", UNIX_PREFIX, self.path.display());
        Ok(stream)
    }
}

/// Drives exchanges against one destination. Each call to [`Client::execute`] opens a fresh
/// connection, so no state carries over between exchanges.
#[derive(Debug, Clone)]
pub struct Client {
    /// Destination for every exchange.
    address: Address,
    /// Deadline for a whole exchange, if any.
    timeout: Option<Duration>,
    /// How replies are delimited.
    reply_mode: ReplyMode,
    /// Largest reply accepted in [`ReplyMode::UntilClose`].
    max_reply_size: usize,
}

impl Client {
    /// Creates a client with no deadline that treats the first inbound chunk as the reply.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            timeout: None,
            reply_mode: ReplyMode::default(),
            max_reply_size: MAX_FRAME_SIZE,
        }
    }

    /// Bounds each exchange. On expiry the outcome is [`TransportError::Timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_reply_mode(mut self, reply_mode: ReplyMode) -> Self {
        self.reply_mode = reply_mode;
        self
    }

    /// Caps a reply read in [`ReplyMode::UntilClose`]; longer replies end in
    /// [`TransportError::Read`].
    pub fn with_max_reply_size(mut self, max_reply_size: usize) -> Self {
        self.max_reply_size = max_reply_size;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Runs one exchange and returns its outcome. The connection is closed before this returns.
    pub async fn execute(&self, envelope: Envelope) -> Outcome {
        match &self.address {
            Address::Tcp(addr) => self.run_session(&TcpConnector { addr }, &envelope).await,
            Address::Unix(path) => self.run_session(&UnixConnector { path }, &envelope).await,
        }
    }

    /// Validates raw operator input, builds an envelope and executes it.
    ///
    /// Invalid input fails with [`RpcError::Validation`] before any connection is attempted.
    pub async fn call(
        &self,
        method: &str,
        raw_params: &str,
        raw_param_types: &str,
    ) -> Result<Outcome> {
        if method.is_empty() {
            return Err(RpcError::Validation("method must not be empty".into()));
        }
        let envelope = Envelope::build(method, raw_params, raw_param_types)?;
        Ok(self.execute(envelope).await)
    }

    async fn run_session<C: Connect>(&self, connector: &C, envelope: &Envelope) -> Outcome {
        let mut session = Session::new(self.reply_mode).with_max_reply_size(self.max_reply_size);
        let Some(limit) = self.timeout else {
            return session.run(connector, envelope).await;
        };
        match timeout(limit, session.run(connector, envelope)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(id = envelope.id(), "exchange timed out after {:?}", limit);
                // Dropping the session releases the connection.
                drop(session);
                Outcome::TransportError(TransportError::Timeout(limit))
            }
        }
    }
}

/// Runs one exchange against `address` with default settings.
pub async fn execute(address: &Address, envelope: Envelope) -> Outcome {
    Client::new(address.clone()).execute(envelope).await
}

/// Produces the reply for each envelope a [`Server`] receives.
///
/// Use the `#[async_trait]` attribute from the `async_trait` crate when implementing this trait.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<Bytes>;
}

/// Answers every request with the same message.
#[derive(Debug, Clone)]
pub struct FixedReply {
    message: Bytes,
}

impl FixedReply {
    pub fn new(message: impl Into<Bytes>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for FixedReply {
    fn default() -> Self {
        Self::new("Have a nice day!")
    }
}

#[async_trait]
impl Handler for FixedReply {
    async fn handle(&self, _envelope: Envelope) -> Result<Bytes> {
        Ok(self.message.clone())
    }
}

/// Source of inbound connections for a [`Server`].
#[async_trait]
trait Accept: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    async fn accept(&self) -> Result<Self::Stream>;
}

#[async_trait]
impl Accept for TokioTcpListener {
    type Stream = TcpStream;
    async fn accept(&self) -> Result<TcpStream> {
        let (stream, peer) = TokioTcpListener::accept(self).await?;
        trace!(%peer, "request connection opened");
        Ok(stream)
    }
}

#[async_trait]
impl Accept for TokioUnixListener {
    type Stream = UnixStream;
    async fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = TokioUnixListener::accept(self).await?;
        trace!("request connection opened on unix socket");
        Ok(stream)
    }
}

/// The socket a [`Server`] answers on.
enum Listener {
    Tcp(TokioTcpListener),
    Unix(TokioUnixListener),
}

/// Binds a Unix socket at `path`. A leftover file from an earlier server is removed first.
fn bind_unix(path: &Path) -> Result<TokioUnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("replaced leftover socket file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(TokioUnixListener::bind(path)?)
}

/// Reference server that decodes envelopes and writes back whatever its [`Handler`] returns.
/// Every accepted connection is served on its own task.
pub struct Server<H: Handler> {
    /// Produces replies.
    handler: Arc<H>,
    /// Set by [`Server::tcp`], [`Server::unix`] or [`Server::bind`].
    listener: Option<Listener>,
    /// Largest partial request buffered per connection.
    max_request_size: usize,
}

impl<H: Handler> Server<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            listener: None,
            max_request_size: MAX_FRAME_SIZE,
        }
    }

    /// Caps how many bytes of an incomplete request a connection may buffer. Past the cap the
    /// connection is dropped with [`RpcError::Protocol`].
    pub fn with_max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size;
        self
    }

    /// The TCP address requests are answered on, e.g. after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.listener {
            Some(Listener::Tcp(listener)) => Ok(listener.local_addr()?),
            Some(Listener::Unix(_)) => Err(RpcError::Protocol(
                "server is bound to a unix socket path, not a TCP address".into(),
            )),
            None => Err(RpcError::Protocol("server is not bound".into())),
        }
    }

    /// Answers on a TCP `host:port`.
    pub async fn tcp(mut self, addr: &str) -> Result<Self> {
        let listener = TokioTcpListener::bind(addr).await?;
        debug!("answering requests on {}", listener.local_addr()?);
        self.listener = Some(Listener::Tcp(listener));
        Ok(self)
    }

    /// Answers on a Unix domain socket path.
    pub fn unix<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let listener = bind_unix(path)?;
        debug!("answering requests on {}{}", UNIX_PREFIX, path.display());
        self.listener = Some(Listener::Unix(listener));
        Ok(self)
    }

    /// Answers on `address`, whichever kind it is.
    pub async fn bind(self, address: &Address) -> Result<Self> {
        match address {
            Address::Tcp(addr) => self.tcp(addr).await,
            Address::Unix(path) => self.unix(path),
        }
    }

    /// Accepts connections until accepting fails.
    pub async fn run(self) -> Result<()> {
        match &self.listener {
            Some(Listener::Tcp(listener)) => self.accept_loop(listener).await,
            Some(Listener::Unix(listener)) => self.accept_loop(listener).await,
            None => Err(RpcError::Protocol("server is not bound".into())),
        }
    }

    async fn accept_loop<L: Accept>(&self, listener: &L) -> Result<()> {
        loop {
            let stream = listener.accept().await?;
            let handler = Arc::clone(&self.handler);
            let limit = self.max_request_size;
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, handler, limit).await {
                    warn!("dropping request connection: {}", e);
                }
            });
        }
    }
}

/// Answers every envelope arriving on `stream` until the peer closes.
async fn serve_connection<S, H>(mut stream: S, handler: Arc<H>, limit: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Handler,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE.min(limit));
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            if !buf.is_empty() {
                debug!("peer left {} bytes of an unfinished request", buf.len());
            }
            trace!("request connection closed by peer");
            return Ok(());
        }
        let (envelopes, consumed) = Envelope::decode_stream(&buf)?;
        buf.advance(consumed);
        if buf.len() > limit {
            return Err(RpcError::Protocol(format!(
                "request exceeds {} bytes",
                limit
            )));
        }
        for envelope in envelopes {
            debug!(
                id = envelope.id(),
                method = envelope.method(),
                params = ?envelope.params(),
                param_types = ?envelope.param_types(),
                "answering request"
            );
            let reply = handler.handle(envelope).await?;
            stream.write_all(&reply).await?;
            stream.flush().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            "127.0.0.1:9000".parse::<Address>().unwrap(),
            Address::Tcp("127.0.0.1:9000".into())
        );
        assert_eq!(
            "localhost:80".parse::<Address>().unwrap(),
            Address::Tcp("localhost:80".into())
        );
        assert_eq!(
            "/tmp/socket_file".parse::<Address>().unwrap(),
            Address::Unix("/tmp/socket_file".into())
        );
        assert_eq!(
            "./socket_file".parse::<Address>().unwrap(),
            Address::Unix("./socket_file".into())
        );
        assert_eq!(
            "unix:socket_file".parse::<Address>().unwrap(),
            Address::Unix("socket_file".into())
        );
        assert!("".parse::<Address>().is_err());
        assert!("  ".parse::<Address>().is_err());
        assert!("unix:".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_display_round_trip() {
        for text in ["127.0.0.1:9000", "unix:/tmp/socket_file"] {
            let address: Address = text.parse().unwrap();
            assert_eq!(address.to_string(), text);
            assert_eq!(address.to_string().parse::<Address>().unwrap(), address);
        }
    }

    #[tokio::test]
    async fn test_empty_method_rejected() {
        // Nothing listens here; validation must fail before a connect is attempted.
        let client = Client::new(Address::Tcp("127.0.0.1:1".into()));
        let result = client.call("", "1", "int").await;
        assert!(matches!(result, Err(RpcError::Validation(_))));
        let result = client.call("add", "1 2", "int").await;
        assert!(matches!(result, Err(RpcError::Validation(_))));
    }

    #[tokio::test]
    async fn test_serve_connection_handles_split_and_batched_requests() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(
            server,
            Arc::new(FixedReply::new("pong")),
            MAX_FRAME_SIZE,
        ));

        let first = Envelope::build("ping", "", "").unwrap().encode().unwrap();
        let (head, tail) = first.split_at(first.len() / 2);
        client.write_all(head).await.unwrap();
        client.flush().await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(tail).await.unwrap();

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        let mut batch = Envelope::build("a", "", "").unwrap().encode().unwrap();
        batch.extend(Envelope::build("b", "", "").unwrap().encode().unwrap());
        client.write_all(&batch).await.unwrap();
        let mut replies = [0u8; 8];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies, b"pongpong");

        client.shutdown().await.unwrap();
        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_connection_rejects_garbage() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_connection(
            server,
            Arc::new(FixedReply::default()),
            MAX_FRAME_SIZE,
        ));
        client.write_all(b"not json").await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(RpcError::Json(_))));
    }

    #[tokio::test]
    async fn test_serve_connection_caps_incomplete_request() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(server, Arc::new(FixedReply::default()), 32));

        // An object that never closes keeps growing the buffer.
        client.write_all(b"{\"method\":\"").await.unwrap();
        client.write_all(&[b'a'; 64]).await.unwrap();
        match task.await.unwrap() {
            Err(RpcError::Protocol(msg)) => assert_eq!(msg, "request exceeds 32 bytes"),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_serve_connection_within_cap() {
        let request = Envelope::build("ping", "", "").unwrap().encode().unwrap();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_connection(
            server,
            Arc::new(FixedReply::new("pong")),
            request.len(),
        ));

        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        drop(client);
        task.await.unwrap().unwrap();
    }

    #[traced_test]
    #[tokio::test]
    async fn test_connect_is_logged() {
        let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let outcome = execute(&addr.into(), Envelope::build("ping", "", "").unwrap()).await;
        assert!(!matches!(
            outcome,
            Outcome::TransportError(TransportError::Connect(_))
        ));
        assert!(logs_contain(&format!("Client: connected to server {}", addr)));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_addr_errors() {
        let server = Server::new(FixedReply::default());
        match server.local_addr() {
            Err(RpcError::Protocol(msg)) => assert_eq!(msg, "server is not bound"),
            other => panic!("Expected Protocol error, got {:?}", other),
        }

        let dir = tempfile::tempdir().unwrap();
        let server = server.unix(dir.path().join("jrpc.sock")).unwrap();
        match server.local_addr() {
            Err(RpcError::Protocol(msg)) => {
                assert_eq!(msg, "server is bound to a unix socket path, not a TCP address")
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }
}
