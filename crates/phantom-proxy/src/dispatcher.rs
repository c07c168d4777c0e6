//! Proxy dispatcher (§4.5): the TCP accept loop that ties the classifier,
//! the registry, and a codec's `record_outgoing`/`mock_outgoing` together
//! for one session.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use phantom_core::error::{CodecError, DispatchError};
use phantom_core::event::{ConnId, ConnIdAllocator};
use phantom_core::io::Prefixed;
use phantom_core::mock::{Mock, Session};
use phantom_core::mockdb::MockDb;
use phantom_core::registry::{IntegrationRegistry, MockSink, RecordOptions, ReplayOptions};
use phantom_core::resolve::DestinationResolver;
use phantom_core::storage::MockWriter;

/// How many bytes the classifier peeks off a freshly-accepted connection
/// before any codec is chosen. Large enough to cover every registered
/// integration's `match_type` window (PostgreSQL's 8-byte startup header,
/// MySQL's handshake probe, HTTP's request line) with headroom.
const CLASSIFY_PEEK_LEN: usize = 256;

/// A session is fixed to one mode for its whole lifetime (§4.5, §9) — there
/// is no runtime "switch to replay" path, so the type itself only ever
/// describes construction-time state, never something toggled later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Record,
    Replay,
}

/// Adapts a [`MockWriter`] to the per-connection [`MockSink`] codecs write
/// to, binding in the session identifier so codecs never see it themselves.
struct SessionMockSink {
    writer: Arc<dyn MockWriter>,
    session: Session,
}

impl MockSink for SessionMockSink {
    fn emit(&self, mock: Mock) {
        if let Err(err) = self.writer.write(&self.session, &mock) {
            error!(name = %mock.name, %err, "failed to persist recorded mock");
        }
    }
}

/// Where a record-mode dispatcher dials for each accepted connection.
pub struct RecordTarget {
    pub resolver: Arc<dyn DestinationResolver>,
    pub writer: Arc<dyn MockWriter>,
}

enum Backend {
    Record(RecordTarget),
    Replay(Arc<MockDb>),
}

/// Accepts connections on one listener and drives each through the
/// classifier and the matched codec for the dispatcher's fixed session mode.
///
/// Per-connection codec errors are isolated: `handle_connection` logs and
/// closes that connection's sockets but never propagates the error out of
/// the accept loop (§4.5 "one bad connection must not take down the proxy").
pub struct ProxyDispatcher {
    registry: &'static IntegrationRegistry,
    backend: Backend,
    session: Session,
    conn_ids: ConnIdAllocator,
}

impl ProxyDispatcher {
    pub fn record(registry: &'static IntegrationRegistry, session: Session, target: RecordTarget) -> Self {
        Self {
            registry,
            backend: Backend::Record(target),
            session,
            conn_ids: ConnIdAllocator::new(),
        }
    }

    pub fn replay(registry: &'static IntegrationRegistry, session: Session, mock_db: Arc<MockDb>) -> Self {
        Self {
            registry,
            backend: Backend::Replay(mock_db),
            session,
            conn_ids: ConnIdAllocator::new(),
        }
    }

    pub fn mode(&self) -> SessionMode {
        match &self.backend {
            Backend::Record(_) => SessionMode::Record,
            Backend::Replay(_) => SessionMode::Replay,
        }
    }

    /// Bind `listen_addr` and accept connections until `cancel` fires.
    pub async fn run(&self, listen_addr: SocketAddr, cancel: CancellationToken) -> Result<(), DispatchError> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| DispatchError::Codec(CodecError::Transient(e)))?;
        info!(%listen_addr, mode = ?self.mode(), session = %self.session, "dispatcher listening");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("dispatcher cancelled, no longer accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => {
                            let conn_id = self.conn_ids.next();
                            let cancel = cancel.clone();
                            let span = info_span!("conn", id = %conn_id, peer = %peer_addr);
                            self.spawn_connection(socket, peer_addr, conn_id, cancel, span);
                        }
                        Err(err) => {
                            warn!(%err, "accept failed, continuing to listen");
                        }
                    }
                }
            }
        }
    }

    fn spawn_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        conn_id: ConnId,
        cancel: CancellationToken,
        span: tracing::Span,
    ) {
        let registry = self.registry;
        let session = self.session.clone();
        match &self.backend {
            Backend::Record(target) => {
                let resolver = target.resolver.clone();
                let writer = target.writer.clone();
                tokio::spawn(
                    async move {
                        handle_record_connection(registry, resolver, writer, session, socket, peer_addr, conn_id, cancel)
                            .await;
                    }
                    .instrument(span),
                );
            }
            Backend::Replay(mock_db) => {
                let mock_db = mock_db.clone();
                tokio::spawn(
                    async move {
                        handle_replay_connection(registry, mock_db, socket, conn_id, cancel).await;
                    }
                    .instrument(span),
                );
            }
        }
    }
}

async fn peek_and_classify(
    registry: &'static IntegrationRegistry,
    socket: &mut TcpStream,
) -> std::io::Result<(&'static str, Vec<u8>)> {
    let mut buf = vec![0u8; CLASSIFY_PEEK_LEN];
    let n = socket.peek(&mut buf).await?;
    buf.truncate(n);
    let name = registry.classify(&buf);
    Ok((name, buf))
}

async fn handle_record_connection(
    registry: &'static IntegrationRegistry,
    resolver: Arc<dyn DestinationResolver>,
    writer: Arc<dyn MockWriter>,
    session: Session,
    mut client: TcpStream,
    peer_addr: SocketAddr,
    conn_id: ConnId,
    cancel: CancellationToken,
) {
    let (codec_name, peeked) = match peek_and_classify(registry, &mut client).await {
        Ok(v) => v,
        Err(err) => {
            warn!(%err, "failed to peek initial bytes, closing connection");
            return;
        }
    };

    let destination = match resolver.resolve(peer_addr) {
        Ok(dest) => dest,
        Err(err) => {
            error!(%err, "UpstreamUnreachable: could not resolve destination, no replay fallback in record mode");
            return;
        }
    };
    let mut upstream = match TcpStream::connect(destination).await {
        Ok(s) => s,
        Err(err) => {
            error!(%err, %destination, "UpstreamUnreachable: dial failed");
            return;
        }
    };

    let codec = registry
        .get_by_name(codec_name)
        .expect("classify() only ever returns a registered codec's name");

    let mut client = Prefixed::new(peeked, client);
    let sink = SessionMockSink { writer, session };
    let opts = RecordOptions { cancel };

    info!(codec = codec_name, %conn_id, "recording connection");
    if let Err(err) = codec
        .record_outgoing(&mut client, &mut upstream, &sink, &opts)
        .await
    {
        match err {
            CodecError::Cancelled => info!("recording cancelled"),
            other => error!(err = %other, "codec error, closing connection"),
        }
    }
}

async fn handle_replay_connection(
    registry: &'static IntegrationRegistry,
    mock_db: Arc<MockDb>,
    mut client: TcpStream,
    conn_id: ConnId,
    cancel: CancellationToken,
) {
    let (codec_name, peeked) = match peek_and_classify(registry, &mut client).await {
        Ok(v) => v,
        Err(err) => {
            warn!(%err, "failed to peek initial bytes, closing connection");
            return;
        }
    };

    let codec = registry
        .get_by_name(codec_name)
        .expect("classify() only ever returns a registered codec's name");

    let mut client = Prefixed::new(peeked, client);
    let opts = ReplayOptions { cancel };

    info!(codec = codec_name, %conn_id, "replaying connection");
    if let Err(err) = codec.mock_outgoing(&mut client, &mock_db, &opts).await {
        match err {
            CodecError::Cancelled => info!("replay cancelled"),
            other => error!(err = %other, "codec error, closing connection"),
        }
    }
}
