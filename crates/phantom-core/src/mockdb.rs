use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::warn;

use crate::mock::{Fingerprint, Mock, MockKind};

struct Entry {
    mock: Mock,
    consumed: bool,
}

/// Session-scoped store of mocks, matched for replay and no-longer-matched
/// once consumed.
///
/// Concurrency: a single internal mutex serializes readers and writers — the
/// hot path (`find_next`) does little work per call, so a single lock is
/// simpler and sufficiently fast. The consumed flag is set under the same
/// lock acquisition that reads it, so at most one caller ever consumes a
/// given mock.
pub struct MockDb {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Match-eligible mocks for this session, in insertion order.
    filtered: Vec<Entry>,
    /// Diagnostic carry-overs, available only by exact name lookup — never
    /// matched by `find_next`.
    unfiltered: Vec<Mock>,
}

impl Default for MockDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDb {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(State::default()),
        }
    }

    /// Replace the current set atomically. Mock names must be unique within
    /// `filtered`; a duplicate name is a last-one-wins overwrite with a
    /// warning, not a hard error — the distilled spec does not define an
    /// error for this case, and dropping a whole session's mocks over one
    /// duplicate would be worse than keeping the later recording.
    pub fn set_mocks(&self, filtered: Vec<Mock>, unfiltered: Vec<Mock>) {
        let mut seen = std::collections::HashSet::new();
        let mut deduped: Vec<Entry> = Vec::with_capacity(filtered.len());
        for mock in filtered {
            if !seen.insert(mock.name.clone()) {
                warn!(name = %mock.name, "duplicate mock name in session, keeping latest");
                if let Some(existing) = deduped.iter_mut().find(|e| e.mock.name == mock.name) {
                    existing.mock = mock;
                    existing.consumed = false;
                    continue;
                }
            }
            deduped.push(Entry {
                mock,
                consumed: false,
            });
        }

        let mut state = self.inner.lock().expect("mock db mutex poisoned");
        state.filtered = deduped;
        state.unfiltered = unfiltered;
    }

    /// Return the first non-consumed filtered mock whose kind and
    /// fingerprint match, marking it consumed. Ordering within equal
    /// fingerprints is session insertion order (FIFO).
    pub fn find_next(&self, kind: MockKind, fingerprint: &Fingerprint) -> Option<Mock> {
        let mut state = self.inner.lock().expect("mock db mutex poisoned");
        for entry in state.filtered.iter_mut() {
            if entry.consumed {
                continue;
            }
            if entry.mock.kind != kind {
                continue;
            }
            if entry.mock.fingerprint().as_ref() != Some(fingerprint) {
                continue;
            }
            entry.consumed = true;
            return Some(entry.mock.clone());
        }
        None
    }

    /// The generic codec has no fingerprint to match on (§4.3.3) — it
    /// consumes mocks purely by arrival order within its kind.
    pub fn find_next_unfingerprinted(&self, kind: MockKind) -> Option<Mock> {
        let mut state = self.inner.lock().expect("mock db mutex poisoned");
        for entry in state.filtered.iter_mut() {
            if entry.consumed || entry.mock.kind != kind {
                continue;
            }
            entry.consumed = true;
            return Some(entry.mock.clone());
        }
        None
    }

    /// Exact-name lookup against the diagnostic carry-over set. Never
    /// mutates consumed state — `unfiltered` mocks are not match-eligible.
    pub fn get_unfiltered(&self, name: &str) -> Option<Mock> {
        let state = self.inner.lock().expect("mock db mutex poisoned");
        state.unfiltered.iter().find(|m| m.name == name).cloned()
    }

    /// Names of all consumed mocks, for reporting.
    pub fn consumed_names(&self) -> Vec<String> {
        let state = self.inner.lock().expect("mock db mutex poisoned");
        state
            .filtered
            .iter()
            .filter(|e| e.consumed)
            .map(|e| e.mock.name.clone())
            .collect()
    }

    /// All mocks still unconsumed, for end-of-run reporting of unused mocks.
    pub fn unconsumed_names(&self) -> VecDeque<String> {
        let state = self.inner.lock().expect("mock db mutex poisoned");
        state
            .filtered
            .iter()
            .filter(|e| !e.consumed)
            .map(|e| e.mock.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSpec;

    fn generic_mock(name: &str, request: &[u8], response: &[u8]) -> Mock {
        Mock::new(
            name,
            MockSpec::Generic {
                request: request.to_vec(),
                response: response.to_vec(),
            },
        )
    }

    fn pg_mock(name: &str, fp: &[u8]) -> Mock {
        Mock::new(
            name,
            MockSpec::PostgresV1 {
                fingerprint: Fingerprint::new(fp.to_vec()),
                request_frames: vec![fp.to_vec()],
                response_frames: vec![vec![b'Z', 0, 0, 0, 5, b'I']],
            },
        )
    }

    #[test]
    fn find_next_consumes_exactly_once() {
        let db = MockDb::new();
        db.set_mocks(
            vec![pg_mock("m1", b"\x51"), pg_mock("m2", b"\x51")],
            vec![],
        );
        let fp = Fingerprint::new(b"\x51".to_vec());

        let first = db.find_next(MockKind::PostgresV1, &fp).unwrap();
        let second = db.find_next(MockKind::PostgresV1, &fp).unwrap();
        let third = db.find_next(MockKind::PostgresV1, &fp);

        assert_eq!(first.name, "m1");
        assert_eq!(second.name, "m2");
        assert!(third.is_none());
    }

    #[test]
    fn unfiltered_mocks_are_not_match_eligible() {
        let db = MockDb::new();
        db.set_mocks(vec![], vec![generic_mock("carry-over", b"x", b"y")]);

        assert!(
            db.find_next_unfingerprinted(MockKind::Generic).is_none(),
            "unfiltered mocks must not be returned by find_next"
        );
        assert!(db.get_unfiltered("carry-over").is_some());
    }

    #[test]
    fn duplicate_names_keep_latest() {
        let db = MockDb::new();
        db.set_mocks(
            vec![generic_mock("dup", b"old", b"old-resp"), generic_mock("dup", b"new", b"new-resp")],
            vec![],
        );
        let found = db.find_next_unfingerprinted(MockKind::Generic).unwrap();
        match found.spec {
            MockSpec::Generic { request, .. } => assert_eq!(request, b"new"),
            _ => panic!("wrong variant"),
        }
        assert!(db.find_next_unfingerprinted(MockKind::Generic).is_none());
    }

    #[test]
    fn consumed_names_reports_only_consumed() {
        let db = MockDb::new();
        db.set_mocks(
            vec![generic_mock("a", b"1", b"2"), generic_mock("b", b"3", b"4")],
            vec![],
        );
        db.find_next_unfingerprinted(MockKind::Generic);
        assert_eq!(db.consumed_names(), vec!["a".to_string()]);
        assert_eq!(db.unconsumed_names(), VecDeque::from(vec!["b".to_string()]));
    }
}
