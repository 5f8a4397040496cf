//! External collaborator seams.
//!
//! The maintenance core never touches sockets or handshakes itself:
//! everything network-facing sits behind the traits here, implemented
//! by the transport layer in production and by scripted fakes in tests.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::registry::Peer;

/// Connects and authenticates against a remote peer.
///
/// Given the addresses a peer advertised, an implementation tries them
/// until one yields an authenticated connection, returning the peer
/// handle. The manager bounds every call with its configured dial
/// timeout and adopts the returned peer into the registry itself —
/// implementations register nothing.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addrs: &[String]) -> Result<Arc<Peer>>;
}
