use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// One record-run's collection of mocks. Mock names are unique within a
/// session; uniqueness is enforced by the mock DB (§4.4), not by this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock kind / spec
// ─────────────────────────────────────────────────────────────────────────────

/// Closed enumeration of protocol kinds a mock can be tagged with. Adding a
/// new codec means adding a new variant here and to [`MockSpec`] — there is
/// deliberately no catch-all arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MockKind {
    Http,
    PostgresV1,
    MySql,
    Generic,
}

impl fmt::Display for MockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Http => "http",
            Self::PostgresV1 => "postgres-v1",
            Self::MySql => "mysql",
            Self::Generic => "generic",
        };
        f.write_str(s)
    }
}

/// An HTTP method captured or replayed as part of an [`MockSpec::Http`] mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpMockRequest {
    pub method: HttpMethod,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpMockResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

/// A deterministic digest of a client frame used to index mocks for replay.
/// `Vec<u8>` rather than a fixed-width hash: PostgreSQL's "type + parameter
/// positions" fingerprint and MySQL's "username + query bytes" fingerprint
/// are naturally variable-length; callers that want a fixed digest can hash
/// this themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub Vec<u8>);

impl Fingerprint {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

/// Protocol-specific payload of a [`Mock`]. One variant per [`MockKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MockSpec {
    Http {
        request: HttpMockRequest,
        response: HttpMockResponse,
    },
    PostgresV1 {
        fingerprint: Fingerprint,
        request_frames: Vec<Vec<u8>>,
        response_frames: Vec<Vec<u8>>,
    },
    MySql {
        fingerprint: Fingerprint,
        request: Vec<u8>,
        response: Vec<u8>,
    },
    Generic {
        request: Vec<u8>,
        response: Vec<u8>,
    },
}

impl MockSpec {
    pub fn kind(&self) -> MockKind {
        match self {
            Self::Http { .. } => MockKind::Http,
            Self::PostgresV1 { .. } => MockKind::PostgresV1,
            Self::MySql { .. } => MockKind::MySql,
            Self::Generic { .. } => MockKind::Generic,
        }
    }

    /// The fingerprint used to index this mock for replay, if the kind
    /// defines one. `Http` mocks fingerprint on method+path (see
    /// [`Mock::http_fingerprint`]); `Generic` mocks have no fingerprint and
    /// are matched purely by arrival order (see §4.3.3).
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        match self {
            Self::PostgresV1 { fingerprint, .. } => Some(fingerprint.clone()),
            Self::MySql { fingerprint, .. } => Some(fingerprint.clone()),
            Self::Http { request, .. } => Some(Fingerprint::new(
                format!("{} {}", request.method, request.path).into_bytes(),
            )),
            Self::Generic { .. } => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable record produced by a codec in record mode and consumed by the
/// mock DB in replay. The `consumed` flag from the distilled spec's data
/// model lives on the mock DB's internal entry wrapper, not here — a `Mock`
/// handed out by `FindNext` or `Load` is always a plain, immutable value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mock {
    pub version: String,
    pub kind: MockKind,
    pub name: String,
    pub spec: MockSpec,
    pub curl: Option<String>,
    pub created_at: SystemTime,
}

impl Mock {
    pub fn new(name: impl Into<String>, spec: MockSpec) -> Self {
        Self {
            version: "v1".to_string(),
            kind: spec.kind(),
            name: name.into(),
            spec,
            curl: None,
            created_at: SystemTime::now(),
        }
    }

    pub fn with_curl(mut self, curl: impl Into<String>) -> Self {
        self.curl = Some(curl.into());
        self
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.spec.fingerprint()
    }
}
