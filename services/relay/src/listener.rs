//! Gated TCP listener for `axum::serve`.
//!
//! Every connection's request head is read before axum sees it. Upgrade
//! requests for any path other than [`REALTIME_PATH`] are dropped without a
//! single byte written back, so the server cannot be used to open WebSocket
//! tunnels to arbitrary routes. All other connections are handed to axum with
//! the bytes already read replayed in front of the stream, limited to a single
//! request so a later request on the same socket never bypasses the gate.

use bytes::{Buf, Bytes};
use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, error, warn};
use url::Url;

/// The only path that may be upgraded to a WebSocket.
pub const REALTIME_PATH: &str = "/realtime";

/// Request heads larger than this are dropped.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Connections that passed the gate, waiting for axum to accept them.
const ACCEPT_BACKLOG: usize = 128;

/// What the gate learned from a request head.
#[derive(Debug, PartialEq)]
pub struct RequestHead {
    pub path: String,
    pub upgrade: bool,
    /// Length of the head in bytes, including the terminating empty line.
    pub len: usize,
}

impl RequestHead {
    /// Parses the request line and headers. Returns `None` until the head is
    /// complete (terminated by an empty line, with or without carriage returns).
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let len = head_len(buf)?;
        let mut lines = head_lines(&buf[..len]);

        let request_line = String::from_utf8_lossy(lines.next().unwrap_or_default());
        let target = request_line.split(' ').nth(1).unwrap_or("");
        let upgrade = lines.any(|line| is_header(line, "upgrade"));

        Some(Self {
            path: request_path(target),
            upgrade,
            len,
        })
    }

    /// Whether the connection may continue to the HTTP server.
    pub fn is_allowed(&self) -> bool {
        !self.upgrade || self.path == REALTIME_PATH
    }
}

/// Finds the end of the head: the first empty line, as `\n\n` or `\n\r\n`.
fn head_len(buf: &[u8]) -> Option<usize> {
    buf.iter().enumerate().find_map(|(i, &b)| {
        if b != b'\n' {
            return None;
        }
        match &buf[i + 1..] {
            [b'\n', ..] => Some(i + 2),
            [b'\r', b'\n', ..] => Some(i + 3),
            _ => None,
        }
    })
}

/// Non-empty lines of a head, without their line endings.
fn head_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    head.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
}

fn is_header(line: &[u8], name: &str) -> bool {
    line.iter()
        .position(|&b| b == b':')
        .is_some_and(|i| line[..i].trim_ascii().eq_ignore_ascii_case(name.as_bytes()))
}

/// Rewrites a plain request head so the server answers it and then closes
/// the connection. Any further request on the socket is never read.
fn close_after_response(buf: &[u8], head_len: usize) -> Bytes {
    let mut out = Vec::with_capacity(buf.len() + 32);
    for line in head_lines(&buf[..head_len])
        .filter(|line| !is_header(line, "connection") && !is_header(line, "keep-alive"))
    {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(&buf[head_len..]);
    Bytes::from(out)
}

/// Resolves a request target the way a browser URL parser would, against a
/// placeholder origin, and returns only its path.
fn request_path(target: &str) -> String {
    Url::parse("http://localhost")
        .and_then(|base| base.join(target))
        .map(|url| url.path().to_string())
        .unwrap_or_default()
}

/// A stream that yields `head` before reading from `inner`.
///
/// For an upgrade request the first response written is watched. If it is
/// not `101 Switching Protocols` the stream reports end-of-file to the server
/// from then on, so the connection cannot carry a second request.
pub struct ReplayStream<S> {
    head: Bytes,
    inner: S,
    awaiting_upgrade: bool,
    refused: bool,
}

impl<S> ReplayStream<S> {
    pub fn new(head: Bytes, inner: S) -> Self {
        Self {
            head,
            inner,
            awaiting_upgrade: false,
            refused: false,
        }
    }

    /// Ends the stream after the first response unless it switches protocols.
    pub fn single_upgrade(mut self) -> Self {
        self.awaiting_upgrade = true;
        self
    }

    fn observe_response(&mut self, written: &[u8]) {
        if self.awaiting_upgrade && !written.is_empty() {
            self.awaiting_upgrade = false;
            self.refused = written.get(9..12) != Some(b"101".as_slice());
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.refused {
            return Poll::Ready(Ok(()));
        }
        if this.head.has_remaining() {
            let n = this.head.len().min(buf.remaining());
            buf.put_slice(&this.head[..n]);
            this.head.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.observe_response(&buf[..written]);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = ready!(Pin::new(&mut this.inner).poll_write_vectored(cx, bufs))?;
        if let Some(first) = bufs.iter().find(|b| !b.is_empty()) {
            this.observe_response(&first[..written.min(first.len())]);
        }
        Poll::Ready(Ok(written))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Reads from `stream` until a full request head is buffered.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<(Vec<u8>, RequestHead)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(head) = RequestHead::parse(&buf) {
            return Ok((buf, head));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
}

/// Inspects one connection. Returns the stream to serve, or `None` if it was dropped.
async fn admit<S: AsyncRead + Unpin>(
    mut stream: S,
    peer: SocketAddr,
    timeout: Duration,
) -> Option<ReplayStream<S>> {
    match tokio::time::timeout(timeout, read_head(&mut stream)).await {
        Ok(Ok((buf, head))) if head.is_allowed() => Some(if head.upgrade {
            ReplayStream::new(Bytes::from(buf), stream).single_upgrade()
        } else {
            ReplayStream::new(close_after_response(&buf, head.len), stream)
        }),
        Ok(Ok((_, head))) => {
            warn!(%peer, path = %head.path, "Upgrade to unknown path, destroying socket");
            None
        }
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "Dropping connection with unreadable request head");
            None
        }
        Err(_) => {
            debug!(%peer, "Timed out waiting for request head");
            None
        }
    }
}

/// A listener that only hands axum the connections that pass the gate.
pub struct GatedListener {
    local_addr: SocketAddr,
    admitted: mpsc::Receiver<(ReplayStream<TcpStream>, SocketAddr)>,
    accept_task: JoinHandle<()>,
}

impl GatedListener {
    pub async fn bind(addr: SocketAddr, handshake_timeout: Duration) -> io::Result<Self> {
        Self::from_tcp(TcpListener::bind(addr).await?, handshake_timeout)
    }

    /// Starts gating connections from an already bound listener.
    pub fn from_tcp(listener: TcpListener, handshake_timeout: Duration) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, admitted) = mpsc::channel(ACCEPT_BACKLOG);
        let accept_task = tokio::spawn(accept_loop(listener, tx, handshake_timeout));
        Ok(Self {
            local_addr,
            admitted,
            accept_task,
        })
    }
}

impl Drop for GatedListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Accepts connections and inspects each in its own task, so a client that
/// sends its head slowly never delays the others.
async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<(ReplayStream<TcpStream>, SocketAddr)>,
    timeout: Duration,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(stream) = admit(stream, peer, timeout).await {
                let _ = tx.send((stream, peer)).await;
            }
        });
    }
}

impl axum::serve::Listener for GatedListener {
    type Io = ReplayStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.admitted.recv().await {
            Some(conn) => conn,
            // The accept task only stops when this listener is dropped.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
