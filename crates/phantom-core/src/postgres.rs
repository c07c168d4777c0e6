use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::CodecError;
use crate::io::{read_exact_or_eof, write_all_or_cancel};
use crate::mock::{Fingerprint, Mock, MockKind, MockSpec};
use crate::mockdb::MockDb;
use crate::registry::{DuplexSocket, Integration, MockSink, RecordOptions, ReplayOptions};

/// PostgreSQL protocol v3, as sent in a startup message's first 4 bytes
/// after the length prefix.
const PROTOCOL_V3: u32 = 0x0003_0000;
/// The magic `SSLRequest` code (`1234 << 16 | 5679`).
const SSL_REQUEST_CODE: u32 = 80_877_103;

// ─────────────────────────────────────────────────────────────────────────────
// Message framing
// ─────────────────────────────────────────────────────────────────────────────

/// One post-startup PostgreSQL protocol message: a 1-byte type tag and its
/// raw frame bytes (tag + 4-byte big-endian length + payload).
struct Frame {
    tag: u8,
    bytes: Vec<u8>,
}

/// The client's startup message has no type byte: just a 4-byte
/// big-endian length (inclusive of itself) followed by the payload.
async fn read_startup_frame<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    cancel: &CancellationToken,
) -> Result<Option<Vec<u8>>, CodecError> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf, cancel).await? {
        return Ok(None);
    }
    let total_len = u32::from_be_bytes(len_buf) as usize;
    if total_len < 4 {
        return Err(CodecError::Malformed(
            "startup message length shorter than its own header".into(),
        ));
    }
    let mut rest = vec![0u8; total_len - 4];
    if !read_exact_or_eof(reader, &mut rest, cancel).await? {
        return Err(CodecError::Transient(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed mid-startup-message",
        )));
    }
    let mut frame = len_buf.to_vec();
    frame.extend_from_slice(&rest);
    Ok(Some(frame))
}

/// A post-startup message: 1-byte type + 4-byte big-endian length
/// (inclusive of the length field, exclusive of the type byte) + payload.
async fn read_tagged_frame<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    cancel: &CancellationToken,
) -> Result<Option<Frame>, CodecError> {
    let mut tag_buf = [0u8; 1];
    if !read_exact_or_eof(reader, &mut tag_buf, cancel).await? {
        return Ok(None);
    }
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf, cancel).await? {
        return Err(CodecError::Transient(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed mid-message-header",
        )));
    }
    let total_len = u32::from_be_bytes(len_buf) as usize;
    if total_len < 4 {
        return Err(CodecError::Malformed(
            "message length shorter than its own length field".into(),
        ));
    }
    let mut rest = vec![0u8; total_len - 4];
    if !read_exact_or_eof(reader, &mut rest, cancel).await? {
        return Err(CodecError::Transient(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed mid-message",
        )));
    }
    let mut bytes = tag_buf.to_vec();
    bytes.extend_from_slice(&len_buf);
    bytes.extend_from_slice(&rest);
    Ok(Some(Frame {
        tag: tag_buf[0],
        bytes,
    }))
}

/// Fingerprint a client frame: message type plus a payload hash for
/// non-parameterized messages. Parameterized messages (`Parse`/`Bind`, tags
/// `P`/`B`) fingerprint on type + parameter *positions* rather than values,
/// per §4.3.1 — we approximate "parameter positions" as the offsets of the
/// `0x00` parameter-length-prefix boundaries within the payload, which are
/// stable across different parameter values for the same prepared
/// statement shape.
fn fingerprint_frame(frame: &Frame) -> Fingerprint {
    let mut hasher = DefaultHasher::new();
    frame.tag.hash(&mut hasher);
    match frame.tag {
        b'P' | b'B' => {
            for (i, b) in frame.bytes.iter().enumerate() {
                if *b == 0 {
                    i.hash(&mut hasher);
                }
            }
        }
        _ => {
            frame.bytes.hash(&mut hasher);
        }
    }
    Fingerprint::new(hasher.finish().to_be_bytes().to_vec())
}

fn fingerprint_startup(bytes: &[u8]) -> Fingerprint {
    let mut hasher = DefaultHasher::new();
    b'S'.hash(&mut hasher); // synthetic tag: the startup message itself has none
    bytes.hash(&mut hasher);
    Fingerprint::new(hasher.finish().to_be_bytes().to_vec())
}

// ─────────────────────────────────────────────────────────────────────────────
// PostgresCodec — the Integration implementation
// ─────────────────────────────────────────────────────────────────────────────

pub struct PostgresCodec {
    next_id: AtomicU64,
}

impl Default for PostgresCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresCodec {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    fn next_name(&self) -> String {
        format!("postgres-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait::async_trait]
impl Integration for PostgresCodec {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn match_type(&self, initial_buffer: &[u8]) -> bool {
        if initial_buffer.len() < 8 {
            return false;
        }
        let code = u32::from_be_bytes(initial_buffer[4..8].try_into().unwrap());
        code == PROTOCOL_V3 || code == SSL_REQUEST_CODE
    }

    async fn record_outgoing(
        &self,
        client: &mut (dyn DuplexSocket),
        upstream: &mut (dyn DuplexSocket),
        sink: &dyn MockSink,
        opts: &RecordOptions,
    ) -> Result<(), CodecError> {
        let cancel = &opts.cancel;

        let Some(startup_bytes) = read_startup_frame(client, cancel).await? else {
            return Ok(());
        };
        write_all_or_cancel(upstream, &startup_bytes, cancel).await?;

        let startup_code = u32::from_be_bytes(startup_bytes.get(4..8).ok_or_else(|| {
            CodecError::Malformed("startup message shorter than protocol code".into())
        })?.try_into().unwrap());

        if startup_code == SSL_REQUEST_CODE {
            // The server's SSLRequest reply is a single byte, not a framed
            // message: 'S' to accept the upgrade, 'N' to stay plaintext.
            let mut reply = [0u8; 1];
            if !read_exact_or_eof(upstream, &mut reply, cancel).await? {
                return Ok(());
            }
            write_all_or_cancel(client, &reply, cancel).await?;
            if reply[0] != b'N' {
                // Upstream accepted TLS. We do not terminate TLS (§1
                // Non-goals), so the bytes that follow are not PostgreSQL
                // framing we can parse — give up rather than misframe them.
                return Err(CodecError::Malformed(
                    "upstream accepted a TLS upgrade, which this codec does not terminate".into(),
                ));
            }
            // The client retries with a real startup message: the same
            // length-prefixed, no-type-byte shape as the first one, not a
            // tagged frame.
            let Some(real_startup) = read_startup_frame(client, cancel).await? else {
                return Ok(());
            };
            write_all_or_cancel(upstream, &real_startup, cancel).await?;
        }

        // Tee the server's full startup response (AuthenticationOk,
        // ParameterStatus*, BackendKeyData, ReadyForQuery, ...) straight
        // through; only post-startup exchanges are fingerprinted and
        // replay-eligible, since the startup handshake itself is not a
        // client "request" in the replay sense.
        loop {
            let Some(server_frame) = read_tagged_frame(upstream, cancel).await? else {
                return Ok(());
            };
            let is_terminal = server_frame.tag == b'Z'; // ReadyForQuery
            write_all_or_cancel(client, &server_frame.bytes, cancel).await?;
            if is_terminal {
                break;
            }
        }

        loop {
            let Some(request) = read_tagged_frame(client, cancel).await? else {
                break;
            };
            write_all_or_cancel(upstream, &request.bytes, cancel).await?;

            let mut response_bytes = Vec::new();
            loop {
                let Some(server_frame) = read_tagged_frame(upstream, cancel).await? else {
                    break;
                };
                let is_terminal = server_frame.tag == b'Z'; // ReadyForQuery
                response_bytes.extend_from_slice(&server_frame.bytes);
                if is_terminal {
                    break;
                }
            }
            write_all_or_cancel(client, &response_bytes, cancel).await?;

            let fingerprint = fingerprint_frame(&request);
            sink.emit(Mock::new(
                self.next_name(),
                MockSpec::PostgresV1 {
                    fingerprint,
                    request_frames: vec![request.bytes],
                    response_frames: vec![response_bytes],
                },
            ));
        }

        Ok(())
    }

    async fn mock_outgoing(
        &self,
        client: &mut (dyn DuplexSocket),
        mock_db: &MockDb,
        opts: &ReplayOptions,
    ) -> Result<(), CodecError> {
        let cancel = &opts.cancel;

        let Some(startup_bytes) = read_startup_frame(client, cancel).await? else {
            return Ok(());
        };
        let startup_code =
            u32::from_be_bytes(startup_bytes[4..8].try_into().map_err(|_| {
                CodecError::Malformed("startup message shorter than protocol code".into())
            })?);

        if startup_code == SSL_REQUEST_CODE {
            // We do not terminate TLS; tell the client to continue in
            // plaintext ('N') and expect a second, real startup message.
            write_all_or_cancel(client, b"N", cancel).await?;
            let Some(_real_startup) = read_startup_frame(client, cancel).await? else {
                return Ok(());
            };
        }

        // Synthesize AuthenticationOk ('R', len 8, code 0) + ReadyForQuery
        // ('Z', len 5, status 'I') so the client's connection library
        // considers the handshake complete.
        let mut auth_ok = vec![b'R'];
        auth_ok.extend_from_slice(&8u32.to_be_bytes());
        auth_ok.extend_from_slice(&0u32.to_be_bytes());
        auth_ok.extend_from_slice(&[b'Z', 0, 0, 0, 5, b'I']);
        write_all_or_cancel(client, &auth_ok, cancel).await?;

        loop {
            let Some(request) = read_tagged_frame(client, cancel).await? else {
                break;
            };
            let fingerprint = fingerprint_frame(&request);
            let mock = mock_db
                .find_next(MockKind::PostgresV1, &fingerprint)
                .ok_or(CodecError::NoMatch)?;
            let MockSpec::PostgresV1 {
                response_frames, ..
            } = mock.spec
            else {
                return Err(CodecError::Internal(
                    "mock db returned non-Postgres mock for Postgres fingerprint".into(),
                ));
            };
            for response in &response_frames {
                write_all_or_cancel(client, response, cancel).await?;
            }
        }

        Ok(())
    }
}
