use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::CodecError;
use crate::io::{read_exact_or_eof, write_all_or_cancel};
use crate::mock::{Fingerprint, Mock, MockKind, MockSpec};
use crate::mockdb::MockDb;
use crate::registry::{DuplexSocket, Integration, MockSink, RecordOptions, ReplayOptions};

// ─────────────────────────────────────────────────────────────────────────────
// Capability flags — values exactly as specified (§4.3.2). Note
// CLIENT_ZSTD_COMPRESSION_ALGORITHM is taken as `0x010000` per the
// distilled spec's literal text, which differs from the real MySQL wire
// protocol's `0x01000000`; we implement the value as specified rather than
// the real-world one, since this codec only needs internal consistency for
// replay, not interoperability with a real server.
// ─────────────────────────────────────────────────────────────────────────────

const CLIENT_CONNECT_WITH_DB: u32 = 0x08;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
const CLIENT_ZSTD_COMPRESSION_ALGORITHM: u32 = 0x0100_00;

// ─────────────────────────────────────────────────────────────────────────────
// LENENC primitives
// ─────────────────────────────────────────────────────────────────────────────

/// Reads a MySQL length-encoded integer. `Ok(None)` means the 0xfb "null"
/// prefix was seen — callers that require a length (not a nullable value)
/// must turn that into `Malformed` themselves.
fn read_lenenc_int(buf: &[u8], pos: &mut usize) -> Result<Option<u64>, CodecError> {
    let first = *buf
        .get(*pos)
        .ok_or_else(|| CodecError::Malformed("truncated length-encoded integer".into()))?;
    *pos += 1;
    match first {
        0xfb => Ok(None),
        0xfc => {
            let bytes = take(buf, pos, 2)?;
            Ok(Some(u16::from_le_bytes([bytes[0], bytes[1]]) as u64))
        }
        0xfd => {
            let bytes = take(buf, pos, 3)?;
            Ok(Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) as u64))
        }
        0xfe => {
            let bytes = take(buf, pos, 8)?;
            Ok(Some(u64::from_le_bytes(bytes.try_into().unwrap())))
        }
        v => Ok(Some(v as u64)),
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], CodecError> {
    let end = *pos + n;
    let slice = buf
        .get(*pos..end)
        .ok_or_else(|| CodecError::Malformed("truncated field".into()))?;
    *pos = end;
    Ok(slice)
}

fn read_lenenc_string(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>, CodecError> {
    let len = read_lenenc_int(buf, pos)?
        .ok_or_else(|| CodecError::Malformed("length-encoded string has null length".into()))?;
    Ok(take(buf, pos, len as usize)?.to_vec())
}

fn write_lenenc_int(out: &mut Vec<u8>, v: u64) {
    if v < 0xfb {
        out.push(v as u8);
    } else if v <= 0xffff {
        out.push(0xfc);
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else if v <= 0xff_ffff {
        out.push(0xfd);
        out.extend_from_slice(&(v as u32).to_le_bytes()[..3]);
    } else {
        out.push(0xfe);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn write_lenenc_string(out: &mut Vec<u8>, s: &[u8]) {
    write_lenenc_int(out, s.len() as u64);
    out.extend_from_slice(s);
}

fn read_null_terminated(buf: &[u8], pos: &mut usize) -> Result<String, CodecError> {
    let start = *pos;
    let end = buf[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| CodecError::Malformed("unterminated string field".into()))?;
    let s = String::from_utf8_lossy(&buf[start..start + end]).into_owned();
    *pos = start + end + 1;
    Ok(s)
}

// ─────────────────────────────────────────────────────────────────────────────
// MySqlHandshakeResponse
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded body of a MySQL client handshake response packet, per the field
/// layout in §4.3.2. `connect_attributes` preserves insertion order (a
/// `Vec` rather than a `HashMap`) so `encode` can reproduce the original
/// attribute ordering — the distilled spec's "keys are unique" invariant is
/// enforced by `decode`, not relied on here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlHandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub reserved: [u8; 23],
    pub username: String,
    pub auth_data: Vec<u8>,
    /// The byte skipped by the legacy (non-LENENC) auth-length branch. Kept
    /// so `encode` can reproduce it; the decoder does not interpret it.
    legacy_skip_byte: Option<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: Option<String>,
    pub connect_attributes: Option<Vec<(String, String)>>,
    pub zstd_compression_level: Option<u8>,
}

impl MySqlHandshakeResponse {
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 32 {
            return Err(CodecError::Malformed(
                "handshake response shorter than fixed header".into(),
            ));
        }
        let capability_flags = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let max_packet_size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let charset = buf[8];
        let reserved: [u8; 23] = buf[9..32].try_into().unwrap();
        let mut pos = 32;

        let username = read_null_terminated(buf, &mut pos)?;

        let (auth_data, legacy_skip_byte) = if capability_flags
            & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            != 0
        {
            let len = *buf
                .get(pos)
                .ok_or_else(|| CodecError::Malformed("missing auth-data length byte".into()))?
                as usize;
            pos += 1;
            (take(buf, &mut pos, len)?.to_vec(), None)
        } else {
            // Legacy two-byte form: the distilled spec's documented (and
            // possibly non-conformant — see DESIGN.md) behavior skips one
            // byte after the length byte rather than treating it as part
            // of a real length-encoded integer. Implemented as specified.
            let len = *buf
                .get(pos)
                .ok_or_else(|| CodecError::Malformed("missing auth-data length byte".into()))?
                as usize;
            pos += 1;
            let skip = *buf
                .get(pos)
                .ok_or_else(|| CodecError::Malformed("missing legacy auth skip byte".into()))?;
            pos += 1;
            (take(buf, &mut pos, len)?.to_vec(), Some(skip))
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            Some(read_null_terminated(buf, &mut pos)?)
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            Some(read_null_terminated(buf, &mut pos)?)
        } else {
            None
        };

        let connect_attributes = if capability_flags & CLIENT_CONNECT_ATTRS != 0 {
            let total_len = read_lenenc_int(buf, &mut pos)?.ok_or_else(|| {
                CodecError::Malformed("connect-attributes length must not be null".into())
            })? as usize;
            let end = pos + total_len;
            if end > buf.len() {
                return Err(CodecError::Malformed(
                    "connect-attributes block runs past end of packet".into(),
                ));
            }
            let mut attrs = Vec::new();
            let mut seen = HashSet::new();
            while pos < end {
                let key = String::from_utf8_lossy(&read_lenenc_string(buf, &mut pos)?).into_owned();
                let value =
                    String::from_utf8_lossy(&read_lenenc_string(buf, &mut pos)?).into_owned();
                if !seen.insert(key.clone()) {
                    return Err(CodecError::Malformed(format!(
                        "duplicate connect-attribute key {key:?}"
                    )));
                }
                attrs.push((key, value));
            }
            if pos != end {
                return Err(CodecError::Malformed(
                    "connect-attributes block did not exhaust its declared length".into(),
                ));
            }
            Some(attrs)
        } else {
            None
        };

        let zstd_compression_level =
            if capability_flags & CLIENT_ZSTD_COMPRESSION_ALGORITHM != 0 && pos < buf.len() {
                let level = buf[pos];
                pos += 1;
                Some(level)
            } else {
                None
            };
        let _ = pos;

        Ok(Self {
            capability_flags,
            max_packet_size,
            charset,
            reserved,
            username,
            auth_data,
            legacy_skip_byte,
            database,
            auth_plugin_name,
            connect_attributes,
            zstd_compression_level,
        })
    }

    /// Re-encodes to wire bytes. Round-trips exactly with `decode` for any
    /// handshake that sets no capability bit this decoder doesn't
    /// recognize (Testable Property #3) — connect-attribute lengths are
    /// re-emitted in canonical minimal-width LENENC form, which is also
    /// what real MySQL clients write, so this is not a practical
    /// restriction.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.capability_flags.to_le_bytes());
        out.extend_from_slice(&self.max_packet_size.to_le_bytes());
        out.push(self.charset);
        out.extend_from_slice(&self.reserved);
        out.extend_from_slice(self.username.as_bytes());
        out.push(0);

        if self.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            out.push(self.auth_data.len() as u8);
            out.extend_from_slice(&self.auth_data);
        } else {
            out.push(self.auth_data.len() as u8);
            out.push(self.legacy_skip_byte.unwrap_or(0));
            out.extend_from_slice(&self.auth_data);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0
            && let Some(db) = &self.database
        {
            out.extend_from_slice(db.as_bytes());
            out.push(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0
            && let Some(plugin) = &self.auth_plugin_name
        {
            out.extend_from_slice(plugin.as_bytes());
            out.push(0);
        }

        if self.capability_flags & CLIENT_CONNECT_ATTRS != 0
            && let Some(attrs) = &self.connect_attributes
        {
            let mut inner = Vec::new();
            for (k, v) in attrs {
                write_lenenc_string(&mut inner, k.as_bytes());
                write_lenenc_string(&mut inner, v.as_bytes());
            }
            write_lenenc_int(&mut out, inner.len() as u64);
            out.extend_from_slice(&inner);
        }

        if self.capability_flags & CLIENT_ZSTD_COMPRESSION_ALGORITHM != 0
            && let Some(level) = self.zstd_compression_level
        {
            out.push(level);
        }

        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet framing — 3-byte LE length + 1-byte sequence number, per the MySQL
// client/server protocol.
// ─────────────────────────────────────────────────────────────────────────────

async fn read_packet<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    cancel: &CancellationToken,
) -> Result<Option<(u8, Vec<u8>)>, CodecError> {
    let mut header = [0u8; 4];
    if !read_exact_or_eof(reader, &mut header, cancel).await? {
        return Ok(None);
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let seq = header[3];
    let mut payload = vec![0u8; len];
    if len > 0 && !read_exact_or_eof(reader, &mut payload, cancel).await? {
        return Err(CodecError::Transient(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed mid-packet",
        )));
    }
    Ok(Some((seq, payload)))
}

fn encode_packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
    out.push(seq);
    out.extend_from_slice(payload);
    out
}

/// Whether a server response packet ends a MySQL command result (OK, ERR,
/// or a short EOF packet). Only enough server-side semantics to know when
/// to stop collecting response bytes for a mock — see §1 Non-goals.
fn is_terminal_packet(payload: &[u8]) -> bool {
    match payload.first() {
        Some(0x00) | Some(0xff) => true,
        Some(0xfe) if payload.len() < 9 => true,
        _ => false,
    }
}

fn query_fingerprint_bytes(username: &str, query_payload: &[u8]) -> Vec<u8> {
    let mut bytes = username.as_bytes().to_vec();
    bytes.push(0);
    bytes.extend_from_slice(query_payload);
    bytes
}

fn synthetic_greeting_payload() -> Vec<u8> {
    let mut p = Vec::new();
    p.push(0x0a); // protocol version 10
    p.extend_from_slice(b"8.0.34-phantom");
    p.push(0);
    p.extend_from_slice(&1u32.to_le_bytes()); // connection id
    let auth1 = b"\x01\x02\x03\x04\x05\x06\x07\x08";
    p.extend_from_slice(auth1);
    p.push(0); // filler
    let capabilities =
        CLIENT_PROTOCOL_41 | CLIENT_PLUGIN_AUTH | CLIENT_SECURE_CONNECTION | CLIENT_CONNECT_WITH_DB;
    p.extend_from_slice(&(capabilities as u16).to_le_bytes());
    p.push(0x21); // charset: utf8_general_ci
    p.extend_from_slice(&2u16.to_le_bytes()); // status flags: SERVER_STATUS_AUTOCOMMIT
    p.extend_from_slice(&((capabilities >> 16) as u16).to_le_bytes());
    let auth2 = b"\x09\x0a\x0b\x0c\x0d\x0e\x0f\x10\x11\x12\x13\x00";
    p.push((auth1.len() + auth2.len()) as u8);
    p.extend_from_slice(&[0u8; 10]); // reserved
    p.extend_from_slice(auth2);
    p.extend_from_slice(b"mysql_native_password");
    p.push(0);
    p
}

fn synthetic_ok_payload() -> Vec<u8> {
    // Minimal OK packet: header, affected rows (0), last insert id (0),
    // status flags, warnings.
    vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

// ─────────────────────────────────────────────────────────────────────────────
// MySqlCodec — the Integration implementation
// ─────────────────────────────────────────────────────────────────────────────

pub struct MySqlCodec {
    next_id: AtomicU64,
}

impl Default for MySqlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MySqlCodec {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    fn next_name(&self) -> String {
        format!("mysql-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait::async_trait]
impl Integration for MySqlCodec {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn match_type(&self, initial_buffer: &[u8]) -> bool {
        if initial_buffer.len() < 32 {
            return false;
        }
        let capability_flags = u32::from_le_bytes(initial_buffer[0..4].try_into().unwrap());
        capability_flags & CLIENT_PROTOCOL_41 != 0
    }

    async fn record_outgoing(
        &self,
        client: &mut (dyn DuplexSocket),
        upstream: &mut (dyn DuplexSocket),
        sink: &dyn MockSink,
        opts: &RecordOptions,
    ) -> Result<(), CodecError> {
        let cancel = &opts.cancel;

        // The server greeting is the first packet on a MySQL connection —
        // the client sends nothing until it has seen it. That means this
        // codec only even gets a chance to run once the dispatcher has
        // already peeked the client's bytes and classified the connection
        // as MySQL from an *earlier* connection's handshake response (or
        // from `match_type` being handed a buffer from a client that is
        // itself relaying/replaying), since the real dispatch order peeks
        // the client before dialing upstream (see `dispatcher.rs`). A real
        // MySQL client talking directly to this proxy would block forever
        // waiting for a greeting that the classifier peek can't produce
        // before upstream is dialed. This path is therefore exercised only
        // by the in-process tests below, not against a real MySQL server.
        let Some((greet_seq, greet_payload)) = read_packet(upstream, cancel).await? else {
            return Ok(());
        };
        write_all_or_cancel(client, &encode_packet(greet_seq, &greet_payload), cancel).await?;

        let Some((resp_seq, resp_payload)) = read_packet(client, cancel).await? else {
            return Ok(());
        };
        write_all_or_cancel(upstream, &encode_packet(resp_seq, &resp_payload), cancel).await?;
        let handshake = MySqlHandshakeResponse::decode(&resp_payload)?;

        if let Some((seq, payload)) = read_packet(upstream, cancel).await? {
            write_all_or_cancel(client, &encode_packet(seq, &payload), cancel).await?;
        }

        loop {
            let Some((seq, query_payload)) = read_packet(client, cancel).await? else {
                break;
            };
            let request_frame = encode_packet(seq, &query_payload);
            write_all_or_cancel(upstream, &request_frame, cancel).await?;

            let mut response_bytes = Vec::new();
            loop {
                let Some((rseq, rpayload)) = read_packet(upstream, cancel).await? else {
                    break;
                };
                response_bytes.extend_from_slice(&encode_packet(rseq, &rpayload));
                if is_terminal_packet(&rpayload) {
                    break;
                }
            }
            write_all_or_cancel(client, &response_bytes, cancel).await?;

            let fingerprint = Fingerprint::new(query_fingerprint_bytes(
                &handshake.username,
                &query_payload,
            ));
            sink.emit(Mock::new(
                self.next_name(),
                MockSpec::MySql {
                    fingerprint,
                    request: request_frame,
                    response: response_bytes,
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

        write_all_or_cancel(client, &encode_packet(0, &synthetic_greeting_payload()), cancel)
            .await?;
        let Some((_, resp_payload)) = read_packet(client, cancel).await? else {
            return Ok(());
        };
        let handshake = MySqlHandshakeResponse::decode(&resp_payload)?;
        write_all_or_cancel(client, &encode_packet(2, &synthetic_ok_payload()), cancel).await?;

        loop {
            let Some((_, query_payload)) = read_packet(client, cancel).await? else {
                break;
            };
            let fingerprint = Fingerprint::new(query_fingerprint_bytes(
                &handshake.username,
                &query_payload,
            ));
            let mock = mock_db
                .find_next(MockKind::MySql, &fingerprint)
                .ok_or(CodecError::NoMatch)?;
            let MockSpec::MySql { response, .. } = mock.spec else {
                return Err(CodecError::Internal(
                    "mock db returned non-MySql mock for MySql fingerprint".into(),
                ));
            };
            write_all_or_cancel(client, &response, cancel).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_handshake(capability_flags: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&capability_flags.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(0x21);
        buf.extend_from_slice(&[0u8; 23]);
        buf.extend_from_slice(b"root\0");
        buf
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let result = MySqlHandshakeResponse::decode(&[0u8; 10]);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn decode_rejects_unterminated_username() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.push(0);
        buf.extend_from_slice(&[0u8; 23]);
        buf.extend_from_slice(b"root"); // no terminator
        let result = MySqlHandshakeResponse::decode(&buf);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn decode_basic_handshake_with_legacy_auth_branch() {
        let mut buf = base_handshake(CLIENT_SECURE_CONNECTION);
        buf.push(4); // auth-data length
        buf.push(0xAA); // legacy skip byte
        buf.extend_from_slice(b"xyzw");
        let decoded = MySqlHandshakeResponse::decode(&buf).unwrap();
        assert_eq!(decoded.username, "root");
        assert_eq!(decoded.auth_data, b"xyzw".to_vec());
        assert!(decoded.database.is_none());
    }

    #[test]
    fn decode_full_handshake_with_db_plugin_and_attrs() {
        let caps =
            CLIENT_CONNECT_WITH_DB | CLIENT_PLUGIN_AUTH | CLIENT_CONNECT_ATTRS | CLIENT_SECURE_CONNECTION;
        let mut buf = base_handshake(caps);
        buf.push(20);
        buf.push(0); // legacy skip byte
        buf.extend_from_slice(&[0u8; 20]); // auth data
        buf.extend_from_slice(b"test\0");
        buf.extend_from_slice(b"mysql_native_password\0");

        let mut attrs = Vec::new();
        write_lenenc_string(&mut attrs, b"foo");
        write_lenenc_string(&mut attrs, b"bar");
        write_lenenc_int(&mut buf, attrs.len() as u64);
        buf.extend_from_slice(&attrs);

        let decoded = MySqlHandshakeResponse::decode(&buf).unwrap();
        assert_eq!(decoded.username, "root");
        assert_eq!(decoded.database.as_deref(), Some("test"));
        assert_eq!(
            decoded.auth_plugin_name.as_deref(),
            Some("mysql_native_password")
        );
        assert_eq!(
            decoded.connect_attributes,
            Some(vec![("foo".to_string(), "bar".to_string())])
        );
    }

    #[test]
    fn decode_rejects_duplicate_connect_attribute_keys() {
        let caps = CLIENT_CONNECT_ATTRS | CLIENT_SECURE_CONNECTION;
        let mut buf = base_handshake(caps);
        buf.push(0);
        buf.push(0); // legacy skip byte, no auth data

        let mut attrs = Vec::new();
        write_lenenc_string(&mut attrs, b"k");
        write_lenenc_string(&mut attrs, b"v1");
        write_lenenc_string(&mut attrs, b"k");
        write_lenenc_string(&mut attrs, b"v2");
        write_lenenc_int(&mut buf, attrs.len() as u64);
        buf.extend_from_slice(&attrs);

        let result = MySqlHandshakeResponse::decode(&buf);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn decode_then_encode_round_trips_with_no_unknown_capability_bits() {
        let caps = CLIENT_CONNECT_WITH_DB
            | CLIENT_PLUGIN_AUTH
            | CLIENT_CONNECT_ATTRS
            | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CLIENT_ZSTD_COMPRESSION_ALGORITHM;
        let mut buf = base_handshake(caps);
        buf.push(4); // LENENC branch: single length byte, no skip
        buf.extend_from_slice(b"auth");
        buf.extend_from_slice(b"mydb\0");
        buf.extend_from_slice(b"caching_sha2_password\0");

        let mut attrs = Vec::new();
        write_lenenc_string(&mut attrs, b"_client_name");
        write_lenenc_string(&mut attrs, b"libmysql");
        write_lenenc_int(&mut buf, attrs.len() as u64);
        buf.extend_from_slice(&attrs);
        buf.push(3); // zstd level

        let decoded = MySqlHandshakeResponse::decode(&buf).unwrap();
        let re_encoded = decoded.encode();
        assert_eq!(re_encoded, buf);
    }

    #[test]
    fn match_type_requires_protocol_41_bit_and_minimum_length() {
        let codec = MySqlCodec::new();
        assert!(!codec.match_type(&[0u8; 10]));
        let mut buf = vec![0u8; 32];
        buf[0..4].copy_from_slice(&CLIENT_PROTOCOL_41.to_le_bytes());
        assert!(codec.match_type(&buf));
        let mut no_41 = vec![0u8; 32];
        no_41[0..4].copy_from_slice(&CLIENT_CONNECT_WITH_DB.to_le_bytes());
        assert!(!codec.match_type(&no_41));
    }

    #[tokio::test]
    async fn mock_outgoing_serves_recorded_query_and_rejects_unknown_one() {
        use tokio::io::AsyncReadExt;

        let mut handshake = base_handshake(CLIENT_SECURE_CONNECTION);
        handshake.push(0);
        handshake.push(0); // legacy auth branch, no auth data

        let query_payload = {
            let mut p = vec![0x03]; // COM_QUERY
            p.extend_from_slice(b"SELECT 1");
            p
        };
        let response_frame = encode_packet(1, &[0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00]);
        let fingerprint = Fingerprint::new(query_fingerprint_bytes("root", &query_payload));

        let db = MockDb::new();
        db.set_mocks(
            vec![Mock::new(
                "mysql-1",
                MockSpec::MySql {
                    fingerprint,
                    request: encode_packet(0, &query_payload),
                    response: response_frame.clone(),
                },
            )],
            vec![],
        );

        let (mut client, mut test_side) = tokio::io::duplex(4096);
        let codec = MySqlCodec::new();
        let opts = ReplayOptions {
            cancel: CancellationToken::new(),
        };

        let server = tokio::spawn(async move {
            let _ = codec.mock_outgoing(&mut client, &db, &opts).await;
        });

        // Greeting.
        let mut header = [0u8; 4];
        test_side.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let mut greet = vec![0u8; len];
        test_side.read_exact(&mut greet).await.unwrap();

        // Handshake response.
        write_all_or_cancel(
            &mut test_side,
            &encode_packet(1, &handshake),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // OK packet.
        test_side.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let mut ok = vec![0u8; len];
        test_side.read_exact(&mut ok).await.unwrap();

        // Matching query.
        write_all_or_cancel(
            &mut test_side,
            &encode_packet(0, &query_payload),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        test_side.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let mut response = vec![0u8; 4 + len];
        response[..4].copy_from_slice(&header);
        test_side.read_exact(&mut response[4..]).await.unwrap();
        assert_eq!(response, response_frame);

        drop(test_side);
        let _ = server.await;
    }
}
