use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::error::CodecError;

/// Wraps a socket so the bytes already peeked by the classifier (§4.2) are
/// re-delivered to the chosen codec before the live socket is read from.
/// This is the concrete mechanism satisfying "the classifier does not
/// consume them from the codec's view" — the codec's `AsyncRead` impl sees
/// exactly the same bytes the classifier peeked, followed by the rest of
/// the stream.
pub struct Prefixed<R> {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: R,
}

impl<R> Prefixed<R> {
    pub fn new(prefix: Vec<u8>, inner: R) -> Self {
        Self {
            prefix,
            prefix_pos: 0,
            inner,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prefixed<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = &self.prefix[self.prefix_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for Prefixed<R> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Read into `buf`, honoring `cancel`. Returns the number of bytes read
/// (`0` at EOF), or [`CodecError::Cancelled`] if cancellation fires first —
/// distinguishable from an I/O error, per §4.8/§5.
pub async fn read_cancellable<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<usize, CodecError> {
    use tokio::io::AsyncReadExt;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CodecError::Cancelled),
        result = reader.read(buf) => Ok(result?),
    }
}

/// Reads exactly `buf.len()` bytes, honoring `cancel`. Returns `Ok(false)`
/// only when EOF is observed with nothing yet read into `buf` — a clean
/// close at a frame boundary. An EOF after a partial read is a
/// [`CodecError::Transient`] (the peer hung up mid-frame), not a clean close.
pub async fn read_exact_or_eof<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<bool, CodecError> {
    let mut read = 0;
    while read < buf.len() {
        let n = read_cancellable(reader, &mut buf[read..], cancel).await?;
        if n == 0 {
            if read == 0 {
                return Ok(false);
            }
            return Err(CodecError::Transient(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )));
        }
        read += n;
    }
    Ok(true)
}

/// Write the whole buffer, honoring `cancel`. On cancellation, returns the
/// number of bytes already written (if any) bundled with `Cancelled` via
/// [`WriteOutcome`] — a cancelled write never silently loses track of a
/// partial write. `#[must_use]` because dropping the outcome without
/// inspecting it silently treats a cancelled, partial write as a success —
/// use [`write_all_or_cancel`] when the caller just wants a `Result`.
#[must_use]
pub enum WriteOutcome {
    Complete,
    Cancelled { written: usize },
}

pub async fn write_all_cancellable<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    buf: &[u8],
    cancel: &CancellationToken,
) -> Result<WriteOutcome, CodecError> {
    let mut written = 0;
    while written < buf.len() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(WriteOutcome::Cancelled { written }),
            result = writer.write(&buf[written..]) => {
                let n = result?;
                if n == 0 {
                    return Err(CodecError::Transient(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0 bytes",
                    )));
                }
                written += n;
            }
        }
    }
    Ok(WriteOutcome::Complete)
}

/// As [`write_all_cancellable`], but collapses [`WriteOutcome::Cancelled`]
/// into [`CodecError::Cancelled`] — every codec call site wants exactly this:
/// either the whole buffer made it out, or the connection is being torn down
/// and nothing downstream should act on a partial write.
pub async fn write_all_or_cancel<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    buf: &[u8],
    cancel: &CancellationToken,
) -> Result<(), CodecError> {
    match write_all_cancellable(writer, buf, cancel).await? {
        WriteOutcome::Complete => Ok(()),
        WriteOutcome::Cancelled { .. } => Err(CodecError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn prefixed_reader_yields_prefix_then_inner() {
        let inner = std::io::Cursor::new(b"world".to_vec());
        let mut prefixed = Prefixed::new(b"hello ".to_vec(), inner);
        let mut out = Vec::new();
        prefixed.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world".to_vec());
    }

    #[tokio::test]
    async fn read_cancellable_returns_cancelled_sentinel() {
        let (client, _server) = tokio::io::duplex(64);
        let (mut read_half, _write_half) = tokio::io::split(client);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut buf = [0u8; 16];
        let result = read_cancellable(&mut read_half, &mut buf, &cancel).await;
        assert!(matches!(result, Err(CodecError::Cancelled)));
    }

    #[tokio::test]
    async fn write_all_cancellable_completes_when_not_cancelled() {
        let (client, mut server) = tokio::io::duplex(64);
        let (_read_half, mut write_half) = tokio::io::split(client);
        let cancel = CancellationToken::new();
        let outcome = write_all_cancellable(&mut write_half, b"hi", &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Complete));
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn write_all_or_cancel_surfaces_cancellation_as_error() {
        let (client, _server) = tokio::io::duplex(64);
        let (_read_half, mut write_half) = tokio::io::split(client);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = write_all_or_cancel(&mut write_half, b"hi", &cancel).await;
        assert!(matches!(result, Err(CodecError::Cancelled)));
    }
}
