use crate::error::StorageError;
use crate::mock::{Mock, Session};

/// Sink for mocks produced during a record run. Narrow by design: a codec
/// (or anything upstream of it) depends only on `write`, never on the
/// storage format or the session's on-disk layout (§6).
pub trait MockWriter: Send + Sync {
    fn write(&self, session: &Session, mock: &Mock) -> Result<(), StorageError>;
}

/// Source of mocks for a replay run. `load` must return mocks in the same
/// order `write` produced them — the one contract requirement the distilled
/// spec imposes on any backend (§6).
pub trait MockReader: Send + Sync {
    fn load(&self, session: &Session) -> Result<Vec<Mock>, StorageError>;
}
