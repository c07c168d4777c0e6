pub mod dispatcher;

pub use dispatcher::{ProxyDispatcher, RecordTarget, SessionMode};
