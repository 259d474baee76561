//! Upgrade request pre-check
//!
//! tungstenite drops the socket without a response when a request is not a
//! WebSocket upgrade at all. The gateway reads the request head first, answers
//! malformed upgrades with `400 Bad Request`, and replays the head into the
//! handshake through [`Preread`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Largest request head accepted before the upgrade is refused
const MAX_HEAD: usize = 16 * 1024;

/// Read from `stream` until the end of the HTTP request head, EOF, or
/// [`MAX_HEAD`] bytes. Bytes past the head are kept and replayed later.
pub(crate) async fn read_head<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while head_end(&head).is_none() && head.len() <= MAX_HEAD {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
    }
    Ok(head)
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Check that `head` is a well-formed WebSocket upgrade request
pub(crate) fn check_upgrade(head: &[u8]) -> Result<(), &'static str> {
    let end = head_end(head).ok_or("incomplete request head")?;
    let text = std::str::from_utf8(&head[..end]).map_err(|_| "request head is not UTF-8")?;

    let mut lines = text.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split(' ');
    if request_line.next() != Some("GET") {
        return Err("upgrade must be a GET request");
    }
    match request_line.nth(1) {
        Some("HTTP/1.0") | Some("HTTP/0.9") | None => return Err("upgrade requires HTTP/1.1"),
        Some(_) => {}
    }

    let mut upgrade = false;
    let mut connection = false;
    let mut key = false;
    let mut version = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "upgrade" => upgrade = has_token(value, "websocket"),
            "connection" => connection = has_token(value, "upgrade"),
            "sec-websocket-key" => key = !value.is_empty(),
            "sec-websocket-version" => version = value == "13",
            _ => {}
        }
    }

    if !upgrade {
        return Err("missing Upgrade: websocket");
    }
    if !connection {
        return Err("missing Connection: upgrade");
    }
    if !key {
        return Err("missing Sec-WebSocket-Key");
    }
    if !version {
        return Err("unsupported Sec-WebSocket-Version");
    }
    Ok(())
}

fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Write a plain-text HTTP error response and shut the stream down
pub(crate) async fn refuse<S>(stream: &mut S, status: StatusCode, reason: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        reason.len(),
        reason
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// A stream that yields `head` before reading from `inner`
pub(crate) struct Preread<S> {
    head: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Preread<S> {
    pub(crate) fn new(head: Vec<u8>, inner: S) -> Self {
        Self {
            head,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Preread<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.head.len() {
            let n = buf.remaining().min(this.head.len() - this.pos);
            buf.put_slice(&this.head[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.head.len() {
                this.head = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Preread<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
