use thiserror::Error;

/// Errors a storage backend (the concrete [`crate::storage::MockWriter`] /
/// [`crate::storage::MockReader`] implementation) can return.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open storage: {0}")]
    Open(String),
    #[error("failed to write: {0}")]
    Write(String),
    #[error("failed to read: {0}")]
    Read(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors a [`crate::resolve::DestinationResolver`] can return.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no destination found for source tuple")]
    NotFound,
    #[error("transient failure resolving destination: {0}")]
    Transient(String),
}

/// The full error taxonomy for a single connection's codec run.
///
/// `Cancelled` is modeled as a variant rather than a separate type so that
/// every fallible I/O path threads one `Result<_, CodecError>`; callers that
/// requested the cancellation do not treat it as a failure (see the
/// dispatcher's top-level match).
#[derive(Debug, Error)]
pub enum CodecError {
    /// Protocol decoding failed. Connection-fatal.
    #[error("malformed protocol data: {0}")]
    Malformed(String),
    /// Record-mode dial to the original destination failed. Connection-fatal.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    /// Replay found no mock for the client's next frame. Connection-fatal.
    #[error("no mock matched the client's request")]
    NoMatch,
    /// I/O error likely to recur. Close this connection, keep accepting.
    #[error("transient I/O error: {0}")]
    Transient(#[from] std::io::Error),
    /// Cancellation observed at a suspension point. Not a failure.
    #[error("cancelled")]
    Cancelled,
    /// Invariant violation.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Errors the protocol classifier itself can surface (as distinct from a
/// codec it dispatches to). In practice classification never fails — an
/// unrecognized buffer falls through to the generic codec — but the type
/// exists for the rare case a peek itself fails (socket error).
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("failed to peek initial bytes: {0}")]
    Peek(#[from] std::io::Error),
}

/// Errors the dispatcher's per-connection accept/resolve/classify path can
/// produce before a codec is even invoked.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("destination resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("record and replay modes cannot be mixed within one session")]
    ModeConflict,
}
