//! Client model of the external coordination service.
//!
//! The service is a strongly-consistent hierarchical key/value store with
//! ephemeral nodes, sequential children, multi-op transactions and watch
//! notifications. This crate pins the subset of the protocol the write path
//! relies on:
//!
//! - [`Client`]: the operation surface, implemented in-memory by
//!   [`mem::MemCoordinator`] and wrapped for fault testing by
//!   [`fault::FaultInjecting`].
//! - [`Session`]: process-wide connection state with explicit
//!   init / reconnect / shutdown, passed by handle.
//! - [`retries`]: bounded exponential-backoff retrying around
//!   coordinator-touching phases.
//!
//! Errors split into *hardware* errors (connection loss and friends, worth
//! retrying against a fresh session) and *user* errors (the coordinator
//! answered; retrying will not change the answer).

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::{Condvar, Mutex};
use snafu::Snafu;
use std::{fmt::Debug, sync::Arc, time::Duration};

pub mod fault;
pub mod mem;
pub mod retries;
mod session;

pub use session::Session;

/// Why a coordinator call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The node (or its parent) does not exist.
    NoNode,
    /// The node already exists.
    NodeExists,
    /// A version check failed.
    BadVersion,
    /// The node still has children.
    NotEmpty,
    /// The connection dropped mid-call; the op may or may not have applied.
    ConnectionLoss,
    /// The session expired; ephemeral nodes are gone.
    SessionExpired,
    /// The call did not complete in time.
    OperationTimeout,
    /// No session has been initialized (or it was shut down).
    NoSession,
}

impl ErrorKind {
    /// Hardware errors are transient faults of the transport or session;
    /// retrying against a fresh session can succeed.
    pub fn is_hardware(self) -> bool {
        matches!(
            self,
            Self::ConnectionLoss | Self::SessionExpired | Self::OperationTimeout
        )
    }

    /// User errors are definite answers; retrying cannot change them.
    pub fn is_user(self) -> bool {
        !self.is_hardware()
    }
}

/// A failed coordinator call.
#[derive(Debug, Clone, Snafu)]
#[snafu(display("coordinator error {kind:?} at '{path}'"))]
pub struct Error {
    /// Failure classification.
    pub kind: ErrorKind,
    /// The path the failing call addressed.
    pub path: String,
}

impl Error {
    /// Build an error for `path`.
    pub fn new(kind: ErrorKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// See [`ErrorKind::is_hardware`].
    pub fn is_hardware(&self) -> bool {
        self.kind.is_hardware()
    }
}

/// A failed multi-op transaction.
///
/// User-level failures name the first failing op; hardware failures do not,
/// because the outcome of the whole transaction is unknown.
#[derive(Debug, Clone, Snafu)]
#[snafu(display("coordinator multi failed: {source}"))]
pub struct MultiError {
    /// The underlying failure.
    pub source: Error,
    /// Index of the failing op for user errors.
    pub failed_op_index: Option<usize>,
}

/// A specialized `Result` for coordinator errors.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Node metadata returned alongside reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Data version, bumped by every set-data.
    pub version: i32,
    /// Whether the node is tied to a session.
    pub ephemeral: bool,
}

/// Durability / naming mode of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Plain durable node.
    Persistent,
    /// Durable node whose name gets a 10-digit monotone suffix appended,
    /// scoped to the parent.
    PersistentSequential,
    /// Node removed when the creating session dies.
    Ephemeral,
}

/// One operation inside a [`Client::multi`] transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Create a node.
    Create {
        /// Full path, or the name prefix for sequential creation.
        path: String,
        /// Initial payload.
        data: Vec<u8>,
        /// Durability / naming mode.
        mode: CreateMode,
    },
    /// Delete a node.
    Delete {
        /// Full path.
        path: String,
        /// Expected version, or `None` for unconditional deletion.
        version: Option<i32>,
    },
    /// Fail the transaction unless the node is at the given version.
    CheckVersion {
        /// Full path.
        path: String,
        /// Expected version.
        version: i32,
    },
    /// Replace a node's payload.
    SetData {
        /// Full path.
        path: String,
        /// New payload.
        data: Vec<u8>,
        /// Expected version, or `None` for unconditional replacement.
        version: Option<i32>,
    },
}

impl Op {
    /// The path this op addresses.
    pub fn path(&self) -> &str {
        match self {
            Self::Create { path, .. }
            | Self::Delete { path, .. }
            | Self::CheckVersion { path, .. }
            | Self::SetData { path, .. } => path,
        }
    }
}

/// Per-op response of a successful [`Client::multi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResponse {
    /// The node was created under the returned (possibly sequential) path.
    Created {
        /// Full path of the new node.
        path: String,
    },
    /// The node was deleted.
    Deleted,
    /// The version check passed.
    Checked,
    /// The payload was replaced.
    DataSet {
        /// Stat after the write.
        stat: Stat,
    },
}

/// A one-shot, level-latched notification.
///
/// Watches registered with [`Client::try_get_watch`] fire their event when
/// the node's data changes, the node is deleted, or the session expires.
#[derive(Debug, Clone, Default)]
pub struct Event(Arc<EventInner>);

#[derive(Debug, Default)]
struct EventInner {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// A fresh, unsignalled event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, waking all waiters.
    pub fn notify(&self) {
        let mut set = self.0.set.lock();
        *set = true;
        self.0.cond.notify_all();
    }

    /// Whether the event has been signalled.
    pub fn is_set(&self) -> bool {
        *self.0.set.lock()
    }

    /// Block until the event is signalled or `timeout` elapses. Returns true
    /// if the event was signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.0.set.lock();
        if *set {
            return true;
        }
        self.0.cond.wait_for(&mut set, timeout);
        *set
    }
}

/// The coordination-service operation surface used by the write path.
pub trait Client: Debug + Send + Sync {
    /// Create a node, returning the full path it was created under (which
    /// differs from `path` for sequential creation).
    fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Stat a node if it exists.
    fn exists(&self, path: &str) -> Result<Option<Stat>>;

    /// Batched [`exists`](Self::exists) over several paths.
    fn exists_many(&self, paths: &[String]) -> Result<Vec<Option<Stat>>>;

    /// Read a node; `NoNode` if absent.
    fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)>;

    /// Read a node if it exists.
    fn try_get(&self, path: &str) -> Result<Option<(Vec<u8>, Stat)>>;

    /// Read a node if it exists and register `watch` for its next change or
    /// deletion. The watch is only registered when the node exists, so it
    /// cannot leak for absent nodes.
    fn try_get_watch(&self, path: &str, watch: &Event) -> Result<Option<(Vec<u8>, Stat)>>;

    /// Names (not paths) of the direct children of a node.
    fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Replace a node's payload.
    fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat>;

    /// Delete a node.
    fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// Atomically apply all of `ops` or none of them.
    fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResponse>, MultiError>;

    /// Whether the session behind this client has expired.
    fn expired(&self) -> bool;
}

/// Create every missing ancestor of `path` as a persistent node with an
/// empty payload. The node itself is not created.
pub fn create_ancestors(client: &dyn Client, path: &str) -> Result<()> {
    let mut prefix = String::new();
    let components: Vec<_> = path.split('/').filter(|c| !c.is_empty()).collect();
    let Some((_, ancestors)) = components.split_last() else {
        return Ok(());
    };
    for component in ancestors {
        prefix.push('/');
        prefix.push_str(component);
        match client.create(&prefix, vec![], CreateMode::Persistent) {
            Ok(_) => {}
            Err(e) if e.kind == ErrorKind::NodeExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ErrorKind::ConnectionLoss.is_hardware());
        assert!(ErrorKind::SessionExpired.is_hardware());
        assert!(ErrorKind::OperationTimeout.is_hardware());
        for kind in [
            ErrorKind::NoNode,
            ErrorKind::NodeExists,
            ErrorKind::BadVersion,
            ErrorKind::NotEmpty,
            ErrorKind::NoSession,
        ] {
            assert!(kind.is_user());
            assert!(!kind.is_hardware());
        }
    }

    #[test]
    fn test_event() {
        let event = Event::new();
        assert!(!event.is_set());
        assert!(!event.wait_timeout(Duration::from_millis(1)));

        let waiter = {
            let event = event.clone();
            std::thread::spawn(move || event.wait_timeout(Duration::from_secs(10)))
        };
        event.notify();
        assert!(waiter.join().unwrap());
        assert!(event.is_set());
    }
}
