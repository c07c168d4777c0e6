//! Connection/event factory (§4.6): reassembles a stream of per-socket
//! kernel events into parsed HTTP request/response pairs.
//!
//! One worker task runs per live `ConnId`, fed by a bounded mailbox the
//! factory's dispatch loop never blocks on (full ⇒ drop with a warning, per
//! §4.6/§9 "never block the event producer").

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::event::{ConnId, Direction, SocketEvent};
use crate::mock::{HttpMethod, HttpMockRequest, HttpMockResponse};

/// How long to wait after the last `Egress` byte before emitting a pair even
/// though the connection never flipped back to `Ingress`.
const SILENCE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-`conn_id` mailbox capacity (§4.6, §5 resource bounds).
const QUEUE_CAPACITY: usize = 1000;

/// One reassembled HTTP exchange, ready to become an [`crate::mock::Mock`].
#[derive(Debug, Clone)]
pub struct HttpTestCase {
    pub conn_id: ConnId,
    pub request: HttpMockRequest,
    pub response: HttpMockResponse,
}

/// Turns a stream of [`SocketEvent`]s into [`HttpTestCase`]s.
///
/// `Open` spawns a worker task and records its mailbox; `Data` is routed to
/// the owning worker's mailbox (dropped with a warning if full, never
/// blocking); `Close` drops the mailbox's sender, which ends the worker's
/// `recv` loop. Workers own their accumulator state exclusively — there is
/// no shared lock for the reassembly itself, only for the conn_id → sender
/// map that routes events to them.
pub struct EventFactory {
    senders: Mutex<HashMap<ConnId, mpsc::Sender<SocketEvent>>>,
    emit_tx: mpsc::Sender<HttpTestCase>,
}

impl EventFactory {
    /// Returns the factory and the receiver of completed test cases.
    pub fn new(emit_capacity: usize) -> (Self, mpsc::Receiver<HttpTestCase>) {
        let (emit_tx, emit_rx) = mpsc::channel(emit_capacity);
        (
            Self {
                senders: Mutex::new(HashMap::new()),
                emit_tx,
            },
            emit_rx,
        )
    }

    /// Drains `events` until the source closes. Intended to run as its own
    /// spawned task for the lifetime of the process.
    pub async fn run(&self, mut events: mpsc::Receiver<SocketEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Open { conn_id } => self.open(conn_id),
                SocketEvent::Data { conn_id, .. } => self.dispatch_data(conn_id, event),
                SocketEvent::Close { conn_id } => self.close(conn_id),
            }
        }
    }

    fn open(&self, conn_id: ConnId) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut senders = self.senders.lock().expect("factory senders mutex poisoned");
        if senders.insert(conn_id, tx).is_some() {
            warn!(%conn_id, "duplicate open event for live connection, replacing worker");
        }
        let emit_tx = self.emit_tx.clone();
        tokio::spawn(worker(conn_id, rx, emit_tx));
    }

    fn dispatch_data(&self, conn_id: ConnId, event: SocketEvent) {
        let senders = self.senders.lock().expect("factory senders mutex poisoned");
        match senders.get(&conn_id) {
            Some(tx) => {
                if tx.try_send(event).is_err() {
                    warn!(%conn_id, "worker mailbox full or closed, dropping data event");
                }
            }
            None => warn!(%conn_id, "data event for connection with no open worker"),
        }
    }

    fn close(&self, conn_id: ConnId) {
        let mut senders = self.senders.lock().expect("factory senders mutex poisoned");
        if senders.remove(&conn_id).is_none() {
            warn!(%conn_id, "close event for connection with no open worker");
        }
    }
}

/// Per-connection worker: accumulates `req`/`res` bytes by direction and
/// emits a test case on an egress→ingress transition, a 2-second silence
/// after egress bytes, or channel close (draining any pending egress-ended
/// pair before exiting).
async fn worker(conn_id: ConnId, mut rx: mpsc::Receiver<SocketEvent>, emit_tx: mpsc::Sender<HttpTestCase>) {
    let mut req: Vec<u8> = Vec::new();
    let mut res: Vec<u8> = Vec::new();
    let mut last_direction: Option<Direction> = None;

    loop {
        let silence_timer = async {
            if last_direction == Some(Direction::Egress) {
                sleep(SILENCE_TIMEOUT).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            biased;
            event = rx.recv() => {
                match event {
                    None => {
                        emit(conn_id, &mut req, &mut res, &emit_tx).await;
                        return;
                    }
                    Some(SocketEvent::Data { direction, bytes, .. }) => {
                        if direction == Direction::Ingress && last_direction == Some(Direction::Egress) {
                            emit(conn_id, &mut req, &mut res, &emit_tx).await;
                        }
                        match direction {
                            Direction::Ingress => req.extend_from_slice(&bytes),
                            Direction::Egress => res.extend_from_slice(&bytes),
                        }
                        last_direction = Some(direction);
                    }
                    // Open/Close never reach a worker's own mailbox — the
                    // factory routes only Data events here.
                    Some(_) => {}
                }
            }
            () = silence_timer => {
                emit(conn_id, &mut req, &mut res, &emit_tx).await;
                last_direction = None;
            }
        }
    }
}

async fn emit(conn_id: ConnId, req: &mut Vec<u8>, res: &mut Vec<u8>, emit_tx: &mpsc::Sender<HttpTestCase>) {
    if req.is_empty() || res.is_empty() {
        req.clear();
        res.clear();
        return;
    }
    let request_bytes = std::mem::take(req);
    let response_bytes = std::mem::take(res);

    let (Some(request), Some(response)) = (
        parse_request(&request_bytes),
        parse_response(&response_bytes),
    ) else {
        warn!(%conn_id, "dropping test case: req/res did not parse as HTTP/1.1");
        return;
    };

    debug!(%conn_id, path = %request.path, status = response.status_code, "emitting http test case");
    if emit_tx
        .send(HttpTestCase {
            conn_id,
            request,
            response,
        })
        .await
        .is_err()
    {
        warn!(%conn_id, "test case emitted after receiver dropped");
    }
}

fn parse_method(method: &str) -> HttpMethod {
    match method.to_uppercase().as_str() {
        "GET" => HttpMethod::Get,
        "POST" => HttpMethod::Post,
        "PUT" => HttpMethod::Put,
        "DELETE" => HttpMethod::Delete,
        "PATCH" => HttpMethod::Patch,
        "HEAD" => HttpMethod::Head,
        "OPTIONS" => HttpMethod::Options,
        "TRACE" => HttpMethod::Trace,
        "CONNECT" => HttpMethod::Connect,
        _ => HttpMethod::Get,
    }
}

/// Parses an accumulated ingress buffer as an HTTP/1.1 request. Only takes
/// body bytes already present in the buffer — this factory reassembles from
/// whatever the kernel tracer has delivered so far, it does not block to
/// wait for more.
fn parse_request(buf: &[u8]) -> Option<HttpMockRequest> {
    let mut headers_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers_storage);
    let httparse::Status::Complete(headers_end) = parsed.parse(buf).ok()? else {
        return None;
    };

    let method = parse_method(parsed.method?);
    let path = parsed.path?.to_string();
    let mut headers = HashMap::new();
    let mut content_length = 0usize;
    for h in parsed.headers.iter() {
        let name = h.name.to_lowercase();
        let value = String::from_utf8_lossy(h.value).into_owned();
        if name == "content-length" {
            content_length = value.parse().unwrap_or(0);
        }
        headers.insert(name, value);
    }

    let body_end = (headers_end + content_length).min(buf.len());
    let body = if body_end > headers_end {
        Some(buf[headers_end..body_end].to_vec())
    } else {
        None
    };

    Some(HttpMockRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Parses an accumulated egress buffer as an HTTP/1.1 response.
fn parse_response(buf: &[u8]) -> Option<HttpMockResponse> {
    let mut headers_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers_storage);
    let httparse::Status::Complete(headers_end) = parsed.parse(buf).ok()? else {
        return None;
    };

    let status_code = parsed.code?;
    let mut headers = HashMap::new();
    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for h in parsed.headers.iter() {
        let name = h.name.to_lowercase();
        let value = String::from_utf8_lossy(h.value).into_owned();
        if name == "content-length" {
            content_length = value.parse().ok();
        }
        if name == "transfer-encoding" && value.to_lowercase().contains("chunked") {
            chunked = true;
        }
        headers.insert(name, value);
    }

    let body = if chunked {
        // We do not de-chunk; whatever followed the headers is stored
        // as-is (good enough to replay verbatim, see §1 Non-goals).
        let rest = &buf[headers_end..];
        if rest.is_empty() { None } else { Some(rest.to_vec()) }
    } else {
        let len = content_length.unwrap_or(buf.len().saturating_sub(headers_end));
        let body_end = (headers_end + len).min(buf.len());
        if body_end > headers_end {
            Some(buf[headers_end..body_end].to_vec())
        } else {
            None
        }
    };

    Some(HttpMockResponse {
        status_code,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ConnIdAllocator;
    use tokio::time::{Duration as TokioDuration, timeout};

    #[tokio::test]
    async fn factory_emits_one_pair_for_open_data_data_data() {
        let (factory, mut emit_rx) = EventFactory::new(8);
        let (tx, rx) = mpsc::channel(32);

        let factory_task = tokio::spawn(async move {
            factory.run(rx).await;
        });

        let conn_id = ConnIdAllocator::new().next();
        tx.send(SocketEvent::Open { conn_id }).await.unwrap();
        tx.send(SocketEvent::Data {
            conn_id,
            direction: Direction::Ingress,
            bytes: b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec(),
        })
        .await
        .unwrap();
        tx.send(SocketEvent::Data {
            conn_id,
            direction: Direction::Egress,
            bytes: b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec(),
        })
        .await
        .unwrap();
        tx.send(SocketEvent::Data {
            conn_id,
            direction: Direction::Ingress,
            bytes: b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n".to_vec(),
        })
        .await
        .unwrap();

        let case = timeout(TokioDuration::from_secs(1), emit_rx.recv())
            .await
            .expect("test case should be emitted on ingress-after-egress")
            .unwrap();
        assert_eq!(case.conn_id, conn_id);
        assert_eq!(case.response.status_code, 200);
        assert_eq!(case.response.body.as_deref(), Some(b"ok".as_slice()));

        drop(tx);
        factory_task.await.unwrap();
    }

    #[tokio::test]
    async fn factory_emits_pending_pair_on_close() {
        let (factory, mut emit_rx) = EventFactory::new(8);
        let (tx, rx) = mpsc::channel(32);
        let factory_task = tokio::spawn(async move {
            factory.run(rx).await;
        });

        let conn_id = ConnIdAllocator::new().next();
        tx.send(SocketEvent::Open { conn_id }).await.unwrap();
        tx.send(SocketEvent::Data {
            conn_id,
            direction: Direction::Ingress,
            bytes: b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        })
        .await
        .unwrap();
        tx.send(SocketEvent::Data {
            conn_id,
            direction: Direction::Egress,
            bytes: b"HTTP/1.1 204 No Content\r\n\r\n".to_vec(),
        })
        .await
        .unwrap();
        tx.send(SocketEvent::Close { conn_id }).await.unwrap();
        drop(tx);

        let case = timeout(TokioDuration::from_secs(1), emit_rx.recv())
            .await
            .expect("pending egress-ended pair should be emitted on close")
            .unwrap();
        assert_eq!(case.response.status_code, 204);

        factory_task.await.unwrap();
    }

    #[tokio::test]
    async fn no_emission_without_both_req_and_res() {
        let (factory, mut emit_rx) = EventFactory::new(8);
        let (tx, rx) = mpsc::channel(32);
        let factory_task = tokio::spawn(async move {
            factory.run(rx).await;
        });

        let conn_id = ConnIdAllocator::new().next();
        tx.send(SocketEvent::Open { conn_id }).await.unwrap();
        tx.send(SocketEvent::Data {
            conn_id,
            direction: Direction::Ingress,
            bytes: b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        })
        .await
        .unwrap();
        tx.send(SocketEvent::Close { conn_id }).await.unwrap();
        drop(tx);

        assert!(
            timeout(TokioDuration::from_millis(200), emit_rx.recv())
                .await
                .is_err(),
            "no response half ever arrived, nothing should be emitted"
        );

        factory_task.await.unwrap();
    }

    #[test]
    fn parse_request_rejects_non_http() {
        assert!(parse_request(b"not an http request at all").is_none());
    }

    #[test]
    fn parse_response_extracts_status_and_body() {
        let resp = parse_response(b"HTTP/1.1 404 Not Found\r\nContent-Length: 3\r\n\r\nnah").unwrap();
        assert_eq!(resp.status_code, 404);
        assert_eq!(resp.body.as_deref(), Some(b"nah".as_slice()));
    }
}
