// ── UDP transport ──
//
// Reference CoAP-over-UDP implementation of the transport seams. A single
// `UdpEndpoint` owns one socket and serves both roles: it dispatches
// inbound requests to a `RequestHandler` and multiplexes outbound
// requests from any number of `UdpConnection`s, matching responses by
// token. Observe notifications go out as non-confirmable messages that
// reuse the registering request's token.
//
// No retransmission and no block-wise transfer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::Error;
use crate::message::{Code, ContentFormat, Method, Request, Response};
use crate::transport::{Connection, Dialer, NotificationSink, Peer, RequestHandler};

/// Default CoAP port for the `coap` scheme.
pub const DEFAULT_PORT: u16 = 5683;

const MAX_DATAGRAM: usize = 65_535;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── UdpEndpoint ──────────────────────────────────────────────────────

/// A bound CoAP socket with its background receive loop.
///
/// Cheaply cloneable; all clones share the socket. The receive loop runs
/// until [`close`](Self::close).
#[derive(Clone)]
pub struct UdpEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    socket: UdpSocket,
    local_addr: SocketAddr,
    /// Serves requests from peers without a dialed connection.
    default_handler: Arc<dyn RequestHandler>,
    /// Per-remote handler of the most recent live dial.
    routes: DashMap<SocketAddr, Route>,
    /// Live dialed connections per remote.
    connections: DashMap<SocketAddr, usize>,
    /// Outbound requests awaiting a response, keyed by token.
    pending: DashMap<Vec<u8>, oneshot::Sender<Packet>>,
    /// Per-remote liveness; cancelled on RST, on closing the last
    /// connection to that remote, or on endpoint close.
    peers: DashMap<SocketAddr, CancellationToken>,
    next_message_id: AtomicU16,
    next_token: AtomicU64,
    next_connection: AtomicU64,
    cancel: CancellationToken,
}

struct Route {
    connection: u64,
    handler: Arc<dyn RequestHandler>,
}

impl UdpEndpoint {
    /// Bind `addr` and start serving inbound requests with `handler`.
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn RequestHandler>) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!(%local_addr, "CoAP endpoint bound");

        let inner = Arc::new(EndpointInner {
            socket,
            local_addr,
            default_handler: handler,
            routes: DashMap::new(),
            connections: DashMap::new(),
            pending: DashMap::new(),
            peers: DashMap::new(),
            next_message_id: AtomicU16::new(1),
            next_token: AtomicU64::new(1),
            next_connection: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        });

        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            recv_loop(task_inner).await;
        });

        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Stop the receive loop and signal every peer as gone.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.pending.clear();
        self.inner.routes.clear();
        self.inner.connections.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// A dialer that opens connections over this endpoint.
    pub fn dialer(&self) -> UdpDialer {
        UdpDialer {
            endpoint: self.clone(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl EndpointInner {
    fn message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn token(&self) -> Vec<u8> {
        self.next_token
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec()
    }

    fn peer_done(&self, addr: SocketAddr) -> CancellationToken {
        self.peers
            .entry(addr)
            .or_insert_with(|| self.cancel.child_token())
            .clone()
    }

    fn handler_for(&self, addr: SocketAddr) -> Arc<dyn RequestHandler> {
        self.routes.get(&addr).map_or_else(
            || Arc::clone(&self.default_handler),
            |route| Arc::clone(&route.handler),
        )
    }

    /// Register connection `id` to `addr`, making `handler` the route for
    /// inbound requests from it. Returns the connection's done token.
    fn attach(
        &self,
        addr: SocketAddr,
        id: u64,
        handler: Arc<dyn RequestHandler>,
    ) -> CancellationToken {
        let mut count = self.connections.entry(addr).or_insert(0);
        *count += 1;
        self.routes.insert(
            addr,
            Route {
                connection: id,
                handler,
            },
        );
        self.peer_done(addr).child_token()
    }

    /// Undo [`attach`](Self::attach). The route is dropped only if
    /// connection `id` still owns it; the peer goes with the last
    /// connection.
    fn detach(&self, addr: SocketAddr, id: u64) {
        self.routes.remove_if(&addr, |_, route| route.connection == id);
        if let Entry::Occupied(mut count) = self.connections.entry(addr) {
            let remaining = count.get().saturating_sub(1);
            *count.get_mut() = remaining;
            if remaining == 0 {
                if let Some((_, done)) = self.peers.remove(&addr) {
                    done.cancel();
                }
                count.remove();
            }
        }
    }

    fn try_send(&self, packet: &Packet, addr: SocketAddr) -> Result<(), Error> {
        let bytes = packet
            .to_bytes()
            .map_err(|e| Error::Malformed(e.to_string()))?;
        self.socket.try_send_to(&bytes, addr)?;
        Ok(())
    }

    async fn send(&self, packet: &Packet, addr: SocketAddr) -> Result<(), Error> {
        let bytes = packet
            .to_bytes()
            .map_err(|e| Error::Malformed(e.to_string()))?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }
}

// ── Receive loop ─────────────────────────────────────────────────────

async fn recv_loop(inner: Arc<EndpointInner>) {
    let mut buf = vec![0_u8; MAX_DATAGRAM];
    loop {
        let (len, addr) = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            result = inner.socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "CoAP receive failed");
                    continue;
                }
            },
        };

        let Some(datagram) = buf.get(..len) else {
            continue;
        };
        let packet = match Packet::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(%addr, error = %e, "dropping malformed datagram");
                continue;
            }
        };

        match packet.header.code {
            MessageClass::Request(_) => dispatch_request(&inner, packet, addr),
            MessageClass::Response(_) => complete_request(&inner, packet, addr).await,
            MessageClass::Empty => {
                if packet.header.get_type() == MessageType::Reset {
                    debug!(%addr, "peer reset");
                    if let Some((_, done)) = inner.peers.remove(&addr) {
                        done.cancel();
                    }
                }
            }
            _ => {}
        }
    }

    for entry in &inner.peers {
        entry.value().cancel();
    }
    inner.peers.clear();
    debug!(local_addr = %inner.local_addr, "CoAP endpoint stopped");
}

fn dispatch_request(inner: &Arc<EndpointInner>, packet: Packet, addr: SocketAddr) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let token = packet.get_token().to_vec();
        let confirmable = packet.header.get_type() == MessageType::Confirmable;
        let message_id = packet.header.message_id;

        let response = match packet_to_request(&packet) {
            Some(request) => {
                trace!(%addr, method = %request.method, path = %request.path, "inbound request");
                let sink = Arc::new(UdpSink {
                    inner: Arc::clone(&inner),
                    addr,
                    token: token.clone(),
                    done: inner.peer_done(addr),
                });
                let peer = Peer::new(addr.to_string(), sink);
                inner.handler_for(addr).handle(peer, request).await
            }
            None => Response::new(Code::METHOD_NOT_ALLOWED),
        };

        let mut reply = response_to_packet(&response, token);
        if confirmable {
            reply.header.set_type(MessageType::Acknowledgement);
            reply.header.message_id = message_id;
        } else {
            reply.header.set_type(MessageType::NonConfirmable);
            reply.header.message_id = inner.message_id();
        }
        if let Err(e) = inner.send(&reply, addr).await {
            warn!(%addr, error = %e, "failed to send response");
        }
    });
}

async fn complete_request(inner: &EndpointInner, packet: Packet, addr: SocketAddr) {
    let confirmable = packet.header.get_type() == MessageType::Confirmable;
    let message_id = packet.header.message_id;

    match inner.pending.remove(packet.get_token()) {
        Some((_, tx)) => {
            if confirmable {
                let mut ack = Packet::new();
                ack.header.set_type(MessageType::Acknowledgement);
                ack.header.message_id = message_id;
                if let Err(e) = inner.send(&ack, addr).await {
                    debug!(%addr, error = %e, "failed to acknowledge response");
                }
            }
            let _ = tx.send(packet);
        }
        None => {
            trace!(%addr, "response for unknown token");
            if confirmable {
                let mut rst = Packet::new();
                rst.header.set_type(MessageType::Reset);
                rst.header.message_id = message_id;
                if let Err(e) = inner.send(&rst, addr).await {
                    debug!(%addr, error = %e, "failed to reset stray response");
                }
            }
        }
    }
}

// ── Notification sink ────────────────────────────────────────────────

struct UdpSink {
    inner: Arc<EndpointInner>,
    addr: SocketAddr,
    token: Vec<u8>,
    done: CancellationToken,
}

impl NotificationSink for UdpSink {
    fn notify(&self, response: Response) -> Result<(), Error> {
        if self.done.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let mut packet = response_to_packet(&response, self.token.clone());
        packet.header.set_type(MessageType::NonConfirmable);
        packet.header.message_id = self.inner.message_id();
        self.inner.try_send(&packet, self.addr)
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

// ── Outbound connections ─────────────────────────────────────────────

/// Opens `coap://` connections over a shared [`UdpEndpoint`].
#[derive(Clone)]
pub struct UdpDialer {
    endpoint: UdpEndpoint,
    timeout: Duration,
}

impl UdpDialer {
    /// Per-request response timeout. Default: 10s.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Dialer for UdpDialer {
    async fn dial(
        &self,
        url: &Url,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn Connection>, Error> {
        if url.scheme() != "coap" {
            return Err(Error::UnsupportedScheme(url.scheme().to_owned()));
        }
        if self.endpoint.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let host = url.host_str().ok_or_else(|| Error::Dial {
            url: url.to_string(),
            reason: "missing host".into(),
        })?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let remote = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::Dial {
                url: url.to_string(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| Error::Dial {
                url: url.to_string(),
                reason: "host did not resolve".into(),
            })?;

        let inner = Arc::clone(&self.endpoint.inner);
        let id = inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let done = inner.attach(remote, id, handler);
        debug!(%url, %remote, connection = id, "dialed CoAP peer");

        Ok(Arc::new(UdpConnection {
            inner,
            id,
            remote,
            done,
            timeout: self.timeout,
        }))
    }
}

/// Client side of a dialed remote.
///
/// Several connections may share a remote. Inbound requests from it go to
/// the handler of the most recent one still open.
pub struct UdpConnection {
    inner: Arc<EndpointInner>,
    id: u64,
    remote: SocketAddr,
    done: CancellationToken,
    timeout: Duration,
}

#[async_trait]
impl Connection for UdpConnection {
    async fn request(&self, request: Request) -> Result<Response, Error> {
        if self.done.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let token = self.inner.token();
        let mut packet = request_to_packet(&request, token.clone());
        packet.header.set_type(MessageType::Confirmable);
        packet.header.message_id = self.inner.message_id();

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(token.clone(), tx);

        let result = async {
            self.inner.send(&packet, self.remote).await?;
            tokio::select! {
                biased;
                () = self.done.cancelled() => Err(Error::ConnectionClosed),
                reply = tokio::time::timeout(self.timeout, rx) => match reply {
                    Ok(Ok(packet)) => Ok(packet_to_response(&packet)),
                    Ok(Err(_)) => Err(Error::ConnectionClosed),
                    Err(_) => Err(Error::Timeout {
                        timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    }),
                },
            }
        }
        .await;

        self.inner.pending.remove(&token);
        result
    }

    fn close(&self) {
        if self.done.is_cancelled() {
            return;
        }
        self.done.cancel();
        self.inner.detach(self.remote, self.id);
        debug!(remote = %self.remote, connection = self.id, "CoAP connection closed");
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Packet conversion ────────────────────────────────────────────────

fn encode_uint(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes.get(skip..).map(<[u8]>::to_vec).unwrap_or_default()
}

fn decode_uint(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .fold(0_u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn first_option(packet: &Packet, option: CoapOption) -> Option<&Vec<u8>> {
    packet.get_option(option).and_then(|values| values.front())
}

fn content_format_of(packet: &Packet) -> Option<ContentFormat> {
    first_option(packet, CoapOption::ContentFormat)
        .and_then(|raw| u16::try_from(decode_uint(raw)).ok())
        .map(ContentFormat)
}

fn observe_of(packet: &Packet) -> Option<u32> {
    first_option(packet, CoapOption::Observe).and_then(|raw| u32::try_from(decode_uint(raw)).ok())
}

fn packet_to_request(packet: &Packet) -> Option<Request> {
    let method = Method::from_code(u8::from(packet.header.code))?;

    let path = packet
        .get_option(CoapOption::UriPath)
        .map(|segments| {
            segments
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();

    let queries = packet
        .get_option(CoapOption::UriQuery)
        .map(|values| {
            values
                .iter()
                .map(|q| String::from_utf8_lossy(q).into_owned())
                .collect()
        })
        .unwrap_or_default();

    Some(Request {
        queries,
        observe: observe_of(packet),
        content_format: content_format_of(packet),
        payload: packet.payload.clone(),
        ..Request::new(method, path)
    })
}

fn request_to_packet(request: &Request, token: Vec<u8>) -> Packet {
    let mut packet = Packet::new();
    packet.header.code = MessageClass::from(request.method.code());
    packet.set_token(token);
    if let Some(observe) = request.observe {
        packet.add_option(CoapOption::Observe, encode_uint(u64::from(observe)));
    }
    for segment in request.path.split('/').filter(|s| !s.is_empty()) {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
    if let Some(format) = request.content_format {
        packet.add_option(CoapOption::ContentFormat, encode_uint(u64::from(format.0)));
    }
    for query in &request.queries {
        packet.add_option(CoapOption::UriQuery, query.as_bytes().to_vec());
    }
    packet.payload.clone_from(&request.payload);
    packet
}

fn packet_to_response(packet: &Packet) -> Response {
    Response {
        code: Code::from_raw(u8::from(packet.header.code)),
        content_format: content_format_of(packet),
        payload: packet.payload.clone(),
        etag: first_option(packet, CoapOption::ETag).map(|raw| decode_uint(raw)),
        observe: observe_of(packet),
    }
}

fn response_to_packet(response: &Response, token: Vec<u8>) -> Packet {
    let mut packet = Packet::new();
    packet.header.code = MessageClass::from(response.code.raw());
    packet.set_token(token);
    if let Some(etag) = response.etag {
        packet.add_option(CoapOption::ETag, etag.to_be_bytes().to_vec());
    }
    if let Some(observe) = response.observe {
        packet.add_option(CoapOption::Observe, encode_uint(u64::from(observe)));
    }
    if let Some(format) = response.content_format {
        packet.add_option(CoapOption::ContentFormat, encode_uint(u64::from(format.0)));
    }
    packet.payload.clone_from(&response.payload);
    packet
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Silent;

    #[async_trait]
    impl RequestHandler for Silent {
        async fn handle(&self, _peer: Peer, _request: Request) -> Response {
            Response::new(Code::CONTENT)
        }
    }

    #[tokio::test]
    async fn remote_state_is_released_with_its_last_connection() {
        let endpoint = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap(), Arc::new(Silent))
            .await
            .unwrap();
        let url = Url::parse("coap://127.0.0.1:5999").unwrap();
        let dialer = endpoint.dialer();

        let first = dialer.dial(&url, Arc::new(Silent)).await.unwrap();
        let second = dialer.dial(&url, Arc::new(Silent)).await.unwrap();
        assert_eq!(endpoint.inner.peers.len(), 1);
        assert_eq!(endpoint.inner.routes.len(), 1);

        first.close();
        assert_eq!(endpoint.inner.peers.len(), 1);
        assert_eq!(endpoint.inner.routes.len(), 1);
        assert!(!second.done().is_cancelled());

        let remote: SocketAddr = "127.0.0.1:5999".parse().unwrap();
        let peer_done = endpoint.inner.peers.get(&remote).map(|d| d.clone()).unwrap();
        second.close();
        assert!(peer_done.is_cancelled());
        assert!(endpoint.inner.peers.is_empty());
        assert!(endpoint.inner.routes.is_empty());
        assert!(endpoint.inner.connections.is_empty());
        endpoint.close();
    }

    #[test]
    fn uint_options_use_minimal_length() {
        assert!(encode_uint(0).is_empty());
        assert_eq!(encode_uint(60), vec![60]);
        assert_eq!(encode_uint(10_000), vec![0x27, 0x10]);
        assert_eq!(decode_uint(&encode_uint(123_456)), 123_456);
    }

    #[test]
    fn request_packet_carries_path_and_queries() {
        let req = Request::get("/oic/res").with_query("rt", "oic.wk.d").with_observe(0);
        let packet = request_to_packet(&req, vec![1, 2]);
        let bytes = packet.to_bytes().unwrap();
        let parsed = Packet::from_bytes(&bytes).unwrap();

        let back = packet_to_request(&parsed).unwrap();
        assert_eq!(back.method, Method::Get);
        assert_eq!(back.path, "/oic/res");
        assert_eq!(back.queries, vec!["rt=oic.wk.d".to_owned()]);
        assert_eq!(back.observe, Some(0));
        assert_eq!(parsed.get_token(), &[1, 2]);
    }

    #[test]
    fn etag_travels_as_eight_bytes() {
        let resp = Response::new(Code::CONTENT).with_etag(0x0102_0304_0506_0708);
        let packet = response_to_packet(&resp, vec![9]);
        let raw = first_option(&packet, CoapOption::ETag).unwrap();
        assert_eq!(raw.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(packet_to_response(&packet).etag, Some(0x0102_0304_0506_0708));
    }
}
