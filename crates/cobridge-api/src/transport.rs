// ── Transport seams ──
//
// The cloud manager and the resource engine only talk to these traits.
// `udp` provides the reference implementation; tests substitute an
// in-memory scripted transport.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::message::{Request, Response};

// ── Outbound ─────────────────────────────────────────────────────────

/// A multiplexed connection to one remote endpoint.
///
/// Requests may be issued concurrently; the connection matches responses
/// to requests itself.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a request and wait for its response.
    async fn request(&self, request: Request) -> Result<Response, Error>;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Cancelled once the connection is closed, locally or by the peer.
    fn done(&self) -> CancellationToken;

    fn is_closed(&self) -> bool {
        self.done().is_cancelled()
    }
}

/// Opens connections. Inbound requests arriving over the new connection
/// are dispatched to `handler`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        url: &Url,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn Connection>, Error>;
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Push channel back to the remote that issued a request. Observe
/// notifications are delivered through it.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, response: Response) -> Result<(), Error>;

    /// Cancelled when the remote goes away.
    fn done(&self) -> CancellationToken;
}

/// The remote side of an inbound request.
#[derive(Clone)]
pub struct Peer {
    /// Stable identity of the remote, used to key subscriptions.
    pub addr: String,
    pub sink: Arc<dyn NotificationSink>,
}

impl Peer {
    pub fn new(addr: impl Into<String>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            addr: addr.into(),
            sink,
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer").field("addr", &self.addr).finish_non_exhaustive()
    }
}

/// Serves inbound requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, peer: Peer, request: Request) -> Response;
}
