//! Contract between the pool and the host application's API client

use async_trait::async_trait;

use crate::error::Result;

/// Creates authenticated API sessions and probes their health
///
/// The pool treats sessions as opaque: it never calls into them other than
/// through [`probe_health`](SessionManager::probe_health). A session that
/// fails its probes is dropped and replaced, never repaired in place.
#[async_trait]
pub trait SessionManager: Send + Sync + 'static {
    /// The pooled client handle
    type Session: Send + Sync + 'static;

    /// Establish a new authenticated session
    async fn create_session(&self) -> Result<Self::Session>;

    /// Cheap liveness call against the remote server
    async fn probe_health(&self, session: &Self::Session) -> bool;
}
