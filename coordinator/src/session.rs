//! Process-wide coordinator session state.

use crate::{Client, Error, ErrorKind, Result};
use observability_deps::tracing::info;
use parking_lot::RwLock;
use std::sync::Arc;

/// A handle to the process's coordinator session.
///
/// The session is explicit state: it is initialized once at startup, swapped
/// on reconnect, and cleared at shutdown. Handles are cheap to clone and are
/// passed to whatever needs coordinator access; there is no ambient global.
#[derive(Debug, Clone, Default)]
pub struct Session {
    current: Arc<RwLock<Option<Arc<dyn Client>>>>,
}

impl Session {
    /// A handle with no connection yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle already connected through `client`.
    pub fn with_client(client: Arc<dyn Client>) -> Self {
        let session = Self::new();
        session.reconnect(client);
        session
    }

    /// Install (or replace) the connection.
    pub fn reconnect(&self, client: Arc<dyn Client>) {
        info!("installing coordinator session");
        *self.current.write() = Some(client);
    }

    /// Drop the connection; subsequent [`client`](Self::client) calls fail
    /// with `NoSession`.
    pub fn shutdown(&self) {
        info!("shutting down coordinator session");
        *self.current.write() = None;
    }

    /// The current connection, failing if none is installed.
    ///
    /// An expired connection is still returned; use
    /// [`live_client`](Self::live_client) to reject it.
    pub fn client(&self) -> Result<Arc<dyn Client>> {
        self.current
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::new(ErrorKind::NoSession, "/"))
    }

    /// The current connection, failing if none is installed or the session
    /// has expired.
    pub fn live_client(&self) -> Result<Arc<dyn Client>> {
        let client = self.client()?;
        if client.expired() {
            return Err(Error::new(ErrorKind::SessionExpired, "/"));
        }
        Ok(client)
    }
}
