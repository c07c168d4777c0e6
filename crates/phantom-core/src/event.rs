use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

/// Monotonically increasing connection identifier, minted by the dispatcher
/// and carried through logs for correlation across components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Issues monotonically increasing [`ConnId`]s. One instance lives on the
/// dispatcher for the process lifetime.
#[derive(Default)]
pub struct ConnIdAllocator {
    next: AtomicU64,
}

impl ConnIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> ConnId {
        ConnId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which side of the connection a chunk of bytes crossed: `Ingress` is
/// client→proxy, `Egress` is proxy→upstream-or-client-bound traffic read
/// from the server side. Naming follows the distilled spec exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

/// A kernel-tracer-delivered socket event. Ordering per `conn_id` is the
/// producer's responsibility; this type only models the payload.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Open { conn_id: ConnId },
    Data {
        conn_id: ConnId,
        direction: Direction,
        bytes: Vec<u8>,
    },
    Close { conn_id: ConnId },
}

impl SocketEvent {
    pub fn conn_id(&self) -> ConnId {
        match self {
            Self::Open { conn_id } | Self::Close { conn_id } => *conn_id,
            Self::Data { conn_id, .. } => *conn_id,
        }
    }
}

/// Producer side of the kernel event source: delivers [`SocketEvent`]s on a
/// single channel. The real producer (eBPF tracer or LD_PRELOAD agent) is
/// out of scope — this crate only consumes from the channel it returns.
pub trait SocketEventSource: Send {
    fn events(self: Box<Self>) -> mpsc::Receiver<SocketEvent>;
}

/// Test double: a source whose events are pushed in by the test itself via
/// the paired sender, rather than produced by a real tracer.
pub struct ChannelEventSource {
    rx: mpsc::Receiver<SocketEvent>,
}

impl ChannelEventSource {
    /// Returns the source half (to hand to the factory) and a sender half
    /// (for the test to push synthetic events through).
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<SocketEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { rx }, tx)
    }
}

impl SocketEventSource for ChannelEventSource {
    fn events(self: Box<Self>) -> mpsc::Receiver<SocketEvent> {
        self.rx
    }
}
