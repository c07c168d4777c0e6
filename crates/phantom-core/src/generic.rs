use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::AsyncReadExt as _;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::CodecError;
use crate::io::{read_cancellable, write_all_or_cancel};
use crate::mock::{Mock, MockKind, MockSpec};
use crate::mockdb::MockDb;
use crate::registry::{DuplexSocket, Integration, MockSink, RecordOptions, ReplayOptions};

/// How long to wait, after the last byte of an upstream response, before
/// treating the exchange as finished and emitting a mock even though the
/// client never sent another request on this connection.
const RESPONSE_SILENCE_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 16 * 1024;

/// Byte-faithful fallback codec for any traffic no registered integration
/// recognizes. Unlike the protocol-aware codecs, it never interprets the
/// bytes it relays — it only watches for the shape of a request/response
/// exchange (ingress bytes, then egress bytes, then either a flip back to
/// ingress or quiet) to decide where one mock ends and the next begins.
#[derive(Default)]
pub struct GenericCodec {
    next_id: AtomicU64,
}

impl GenericCodec {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    fn next_name(&self) -> String {
        format!("generic-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait::async_trait]
impl Integration for GenericCodec {
    fn name(&self) -> &'static str {
        crate::registry::GENERIC_CODEC_NAME
    }

    /// The fallback codec matches everything — it is only ever selected
    /// because every more specific integration declined first, and it must
    /// be registered last so registration-order tie-breaking never lets it
    /// shadow a real protocol match.
    fn match_type(&self, _initial_buffer: &[u8]) -> bool {
        true
    }

    async fn record_outgoing(
        &self,
        client: &mut (dyn DuplexSocket),
        upstream: &mut (dyn DuplexSocket),
        sink: &dyn MockSink,
        opts: &RecordOptions,
    ) -> Result<(), CodecError> {
        let cancel = &opts.cancel;

        let mut request: Vec<u8> = Vec::new();
        let mut response: Vec<u8> = Vec::new();
        let mut have_response = false;

        let emit = |request: &mut Vec<u8>, response: &mut Vec<u8>, have_response: &mut bool| {
            if request.is_empty() && response.is_empty() {
                return None;
            }
            let mock = Mock::new(
                self.next_name(),
                MockSpec::Generic {
                    request: std::mem::take(request),
                    response: std::mem::take(response),
                },
            );
            *have_response = false;
            Some(mock)
        };

        loop {
            let silence_timer = async {
                if have_response {
                    sleep(RESPONSE_SILENCE_TIMEOUT).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };

            let mut client_buf = [0u8; READ_CHUNK];
            let mut upstream_buf = [0u8; READ_CHUNK];

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Some(mock) = emit(&mut request, &mut response, &mut have_response) {
                        sink.emit(mock);
                    }
                    return Err(CodecError::Cancelled);
                }
                () = silence_timer => {
                    if let Some(mock) = emit(&mut request, &mut response, &mut have_response) {
                        sink.emit(mock);
                    }
                }
                result = client.read(&mut client_buf) => {
                    let n = result?;
                    if n == 0 {
                        if let Some(mock) = emit(&mut request, &mut response, &mut have_response) {
                            sink.emit(mock);
                        }
                        return Ok(());
                    }
                    if have_response {
                        // Ingress after egress: the previous exchange is done
                        // and a new one has begun.
                        if let Some(mock) = emit(&mut request, &mut response, &mut have_response) {
                            sink.emit(mock);
                        }
                    }
                    request.extend_from_slice(&client_buf[..n]);
                    write_all_or_cancel(upstream, &client_buf[..n], cancel).await?;
                }
                result = upstream.read(&mut upstream_buf) => {
                    let n = result?;
                    if n == 0 {
                        if let Some(mock) = emit(&mut request, &mut response, &mut have_response) {
                            sink.emit(mock);
                        }
                        return Ok(());
                    }
                    response.extend_from_slice(&upstream_buf[..n]);
                    have_response = true;
                    write_all_or_cancel(client, &upstream_buf[..n], cancel).await?;
                }
            }
        }
    }

    async fn mock_outgoing(
        &self,
        client: &mut (dyn DuplexSocket),
        mock_db: &MockDb,
        opts: &ReplayOptions,
    ) -> Result<(), CodecError> {
        let cancel = &opts.cancel;

        loop {
            let mut buf = [0u8; READ_CHUNK];
            let n = read_cancellable(client, &mut buf, cancel).await?;
            if n == 0 {
                return Ok(());
            }

            let mock = mock_db
                .find_next_unfingerprinted(MockKind::Generic)
                .ok_or(CodecError::NoMatch)?;
            let MockSpec::Generic { response, .. } = mock.spec else {
                return Err(CodecError::Internal(
                    "mock db returned non-generic mock for generic codec".into(),
                ));
            };
            write_all_or_cancel(client, &response, cancel).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct CollectingSink {
        mocks: Mutex<Vec<Mock>>,
    }

    impl MockSink for CollectingSink {
        fn emit(&self, mock: Mock) {
            self.mocks.lock().unwrap().push(mock);
        }
    }

    #[test]
    fn match_type_always_true() {
        let codec = GenericCodec::new();
        assert!(codec.match_type(b""));
        assert!(codec.match_type(b"anything at all"));
    }

    #[tokio::test]
    async fn record_emits_mock_on_request_response_then_close() {
        let (mut client_test, mut client_codec) = tokio::io::duplex(4096);
        let (mut upstream_codec, mut upstream_test) = tokio::io::duplex(4096);

        let sink = CollectingSink::default();
        let codec = GenericCodec::new();
        let opts = RecordOptions {
            cancel: CancellationToken::new(),
        };

        let recorder = tokio::spawn(async move {
            let _ = codec
                .record_outgoing(&mut client_codec, &mut upstream_codec, &sink, &opts)
                .await;
            sink
        });

        client_test.write_all(b"ping").await.unwrap();
        let mut relayed_request = [0u8; 4];
        upstream_test.read_exact(&mut relayed_request).await.unwrap();
        assert_eq!(&relayed_request, b"ping");

        upstream_test.write_all(b"pong").await.unwrap();
        let mut relayed_response = [0u8; 4];
        client_test.read_exact(&mut relayed_response).await.unwrap();
        assert_eq!(&relayed_response, b"pong");

        drop(client_test);
        drop(upstream_test);

        let sink = recorder.await.unwrap();
        let mocks = sink.mocks.lock().unwrap();
        assert_eq!(mocks.len(), 1);
        match &mocks[0].spec {
            MockSpec::Generic { request, response } => {
                assert_eq!(request, b"ping");
                assert_eq!(response, b"pong");
            }
            _ => panic!("wrong mock kind"),
        }
    }

    #[tokio::test]
    async fn record_splits_mocks_on_ingress_after_egress() {
        let (mut client_test, mut client_codec) = tokio::io::duplex(4096);
        let (mut upstream_codec, mut upstream_test) = tokio::io::duplex(4096);

        let sink = CollectingSink::default();
        let codec = GenericCodec::new();
        let opts = RecordOptions {
            cancel: CancellationToken::new(),
        };

        let recorder = tokio::spawn(async move {
            let _ = codec
                .record_outgoing(&mut client_codec, &mut upstream_codec, &sink, &opts)
                .await;
            sink
        });

        client_test.write_all(b"req1").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_test.read_exact(&mut buf).await.unwrap();
        upstream_test.write_all(b"res1").await.unwrap();
        client_test.read_exact(&mut buf).await.unwrap();

        // A second request before the silence timeout elapses must close
        // out the first mock rather than merging with it.
        client_test.write_all(b"req2").await.unwrap();
        upstream_test.read_exact(&mut buf).await.unwrap();
        upstream_test.write_all(b"res2").await.unwrap();
        client_test.read_exact(&mut buf).await.unwrap();

        drop(client_test);
        drop(upstream_test);

        let sink = recorder.await.unwrap();
        let mocks = sink.mocks.lock().unwrap();
        assert_eq!(mocks.len(), 2);
    }

    #[tokio::test]
    async fn replay_serves_mocks_in_order() {
        let db = MockDb::new();
        db.set_mocks(
            vec![
                Mock::new(
                    "generic-1",
                    MockSpec::Generic {
                        request: b"req1".to_vec(),
                        response: b"res1".to_vec(),
                    },
                ),
                Mock::new(
                    "generic-2",
                    MockSpec::Generic {
                        request: b"req2".to_vec(),
                        response: b"res2".to_vec(),
                    },
                ),
            ],
            vec![],
        );

        let (mut test_side, mut codec_side) = tokio::io::duplex(4096);
        let codec = GenericCodec::new();
        let opts = ReplayOptions {
            cancel: CancellationToken::new(),
        };

        let server = tokio::spawn(async move {
            let _ = codec.mock_outgoing(&mut codec_side, &db, &opts).await;
        });

        test_side.write_all(b"whatever1").await.unwrap();
        let mut buf = [0u8; 4];
        test_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"res1");

        test_side.write_all(b"whatever2").await.unwrap();
        test_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"res2");

        drop(test_side);
        let _ = server.await;
    }
}
