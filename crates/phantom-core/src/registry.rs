use std::sync::OnceLock;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::CodecError;
use crate::mock::Mock;
use crate::mockdb::MockDb;

/// Either side of a proxied connection — client or upstream socket. Boxed as
/// a trait object so codecs can be driven against real `TcpStream`s in
/// production and in-memory duplex pipes in tests.
pub trait DuplexSocket: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexSocket for T {}

/// Sink a codec emits completed mocks to during record mode. A thin
/// abstraction over [`crate::storage::MockWriter`] scoped to one session so
/// codecs never see the session identifier themselves.
pub trait MockSink: Send + Sync {
    fn emit(&self, mock: Mock);
}

#[derive(Clone)]
pub struct RecordOptions {
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ReplayOptions {
    pub cancel: CancellationToken,
}

/// The codec contract every protocol integration implements. See §4.1.
#[async_trait::async_trait]
pub trait Integration: Send + Sync {
    /// Canonical, stable name used for registration order and logging.
    fn name(&self) -> &'static str;

    /// Pure, synchronous, no I/O. Tolerant of short buffers — returns
    /// `false` rather than erroring.
    fn match_type(&self, initial_buffer: &[u8]) -> bool;

    /// Drive both sockets until the client closes, the upstream closes, or
    /// `opts.cancel` fires. Emits zero or more mocks on `sink`.
    async fn record_outgoing(
        &self,
        client: &mut (dyn DuplexSocket),
        upstream: &mut (dyn DuplexSocket),
        sink: &dyn MockSink,
        opts: &RecordOptions,
    ) -> Result<(), CodecError>;

    /// Serve the client from `mock_db`; no upstream socket is opened.
    async fn mock_outgoing(
        &self,
        client: &mut (dyn DuplexSocket),
        mock_db: &MockDb,
        opts: &ReplayOptions,
    ) -> Result<(), CodecError>;
}

/// Canonical name of the byte-faithful fallback codec (§4.3.3). Exposed here
/// so the dispatcher can recognize it without importing the concrete codec
/// crate.
pub const GENERIC_CODEC_NAME: &str = "generic";

/// Process-wide, read-after-init registry: an ordered list of integrations.
///
/// A `Vec` rather than a `HashMap` is load-bearing: the distilled spec
/// requires a deterministic tie-break by registration order, and hash maps
/// do not preserve insertion order.
pub struct IntegrationRegistry {
    integrations: Vec<Box<dyn Integration>>,
}

static REGISTRY: OnceLock<IntegrationRegistry> = OnceLock::new();

impl IntegrationRegistry {
    fn new(integrations: Vec<Box<dyn Integration>>) -> Self {
        Self { integrations }
    }

    /// Initialize the process-wide registry. Idempotent: later calls are
    /// ignored (mirrors `OnceLock`'s own semantics) — registration happens
    /// once at process start per §4.1.
    pub fn init(integrations: Vec<Box<dyn Integration>>) -> &'static Self {
        REGISTRY.get_or_init(|| Self::new(integrations))
    }

    /// Access the registry. Panics if [`IntegrationRegistry::init`] has not
    /// been called yet — a programmer error, not a runtime condition.
    pub fn get() -> &'static Self {
        REGISTRY
            .get()
            .expect("IntegrationRegistry::init must run before IntegrationRegistry::get")
    }

    /// Peek up to `max(registered Ns)` bytes and return the name of the
    /// first integration (in registration order) whose `match_type`
    /// recognizes them, or [`GENERIC_CODEC_NAME`] if none do.
    pub fn classify(&self, initial_buffer: &[u8]) -> &'static str {
        for integration in &self.integrations {
            if integration.match_type(initial_buffer) {
                return integration.name();
            }
        }
        GENERIC_CODEC_NAME
    }

    pub fn get_by_name(&self, name: &str) -> Option<&dyn Integration> {
        self.integrations
            .iter()
            .find(|i| i.name() == name)
            .map(|b| b.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.integrations.iter().map(|i| i.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mockdb::MockDb;

    struct AlwaysFirst;
    struct AlwaysSecond;
    struct NeverMatches;

    #[async_trait::async_trait]
    impl Integration for AlwaysFirst {
        fn name(&self) -> &'static str {
            "first"
        }
        fn match_type(&self, _buf: &[u8]) -> bool {
            true
        }
        async fn record_outgoing(
            &self,
            _c: &mut (dyn DuplexSocket),
            _u: &mut (dyn DuplexSocket),
            _s: &dyn MockSink,
            _o: &RecordOptions,
        ) -> Result<(), CodecError> {
            Ok(())
        }
        async fn mock_outgoing(
            &self,
            _c: &mut (dyn DuplexSocket),
            _db: &MockDb,
            _o: &ReplayOptions,
        ) -> Result<(), CodecError> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Integration for AlwaysSecond {
        fn name(&self) -> &'static str {
            "second"
        }
        fn match_type(&self, _buf: &[u8]) -> bool {
            true
        }
        async fn record_outgoing(
            &self,
            _c: &mut (dyn DuplexSocket),
            _u: &mut (dyn DuplexSocket),
            _s: &dyn MockSink,
            _o: &RecordOptions,
        ) -> Result<(), CodecError> {
            Ok(())
        }
        async fn mock_outgoing(
            &self,
            _c: &mut (dyn DuplexSocket),
            _db: &MockDb,
            _o: &ReplayOptions,
        ) -> Result<(), CodecError> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Integration for NeverMatches {
        fn name(&self) -> &'static str {
            "never"
        }
        fn match_type(&self, _buf: &[u8]) -> bool {
            false
        }
        async fn record_outgoing(
            &self,
            _c: &mut (dyn DuplexSocket),
            _u: &mut (dyn DuplexSocket),
            _s: &dyn MockSink,
            _o: &RecordOptions,
        ) -> Result<(), CodecError> {
            Ok(())
        }
        async fn mock_outgoing(
            &self,
            _c: &mut (dyn DuplexSocket),
            _db: &MockDb,
            _o: &ReplayOptions,
        ) -> Result<(), CodecError> {
            Ok(())
        }
    }

    #[test]
    fn classify_picks_first_match_in_registration_order() {
        let registry = IntegrationRegistry::new(vec![
            Box::new(NeverMatches),
            Box::new(AlwaysFirst),
            Box::new(AlwaysSecond),
        ]);
        assert_eq!(registry.classify(b"whatever"), "first");
    }

    #[test]
    fn classify_falls_through_to_generic() {
        let registry = IntegrationRegistry::new(vec![Box::new(NeverMatches)]);
        assert_eq!(registry.classify(b"whatever"), GENERIC_CODEC_NAME);
    }
}
