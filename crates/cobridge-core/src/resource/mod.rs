// ── Resource ──
//
// A named endpoint with type/interface metadata, GET/POST handlers, an
// entity-tag, and an optional set of Observe subscriptions. Each resource
// runs one watcher task for the lifetime of the resource.

pub mod etag;
pub mod handler;
pub mod observe;
pub mod policy;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use cobridge_api::{Code, LinkPolicy, Method, Peer, Request, Response, ResourceLink};

pub use handler::{
    ChangeHook, GetHandler, HandlerError, HandlerResult, Observation, ObserveHandler,
    PostHandler,
};
pub use observe::{Notifier, PushOutcome};
pub use policy::Policy;

use observe::{Subscription, Subscriptions};

const OBSERVE_REGISTER: u32 = 0;
const OBSERVE_DEREGISTER: u32 = 1;

/// Anchor used for links of device `di`.
pub fn device_anchor(di: &Uuid) -> String {
    format!("ocf://{di}")
}

// ── ResourceBuilder ──────────────────────────────────────────────────

/// Builder for [`Resource`].
pub struct ResourceBuilder {
    href: String,
    resource_types: Vec<String>,
    interfaces: Vec<String>,
    policy: Policy,
    get: Option<GetHandler>,
    post: Option<PostHandler>,
    observe: Option<ObserveHandler>,
    on_change: Option<ChangeHook>,
}

fn push_unique(list: &mut Vec<String>, items: impl IntoIterator<Item = impl Into<String>>) {
    for item in items {
        let item = item.into();
        if !list.contains(&item) {
            list.push(item);
        }
    }
}

impl ResourceBuilder {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            resource_types: Vec::new(),
            interfaces: Vec::new(),
            policy: Policy::DISCOVERABLE | Policy::PUBLISH_TO_CLOUD,
            get: None,
            post: None,
            observe: None,
            on_change: None,
        }
    }

    /// Add resource types. Duplicates are dropped, order is kept.
    pub fn resource_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        push_unique(&mut self.resource_types, types);
        self
    }

    /// Add interfaces. Duplicates are dropped, order is kept.
    pub fn interfaces(mut self, interfaces: impl IntoIterator<Item = impl Into<String>>) -> Self {
        push_unique(&mut self.interfaces, interfaces);
        self
    }

    /// Replace the policy. `OBSERVABLE` is still derived from the
    /// presence of an observe handler.
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn get(mut self, handler: GetHandler) -> Self {
        self.get = Some(handler);
        self
    }

    pub fn post(mut self, handler: PostHandler) -> Self {
        self.post = Some(handler);
        self
    }

    pub fn observe(mut self, handler: ObserveHandler) -> Self {
        self.observe = Some(handler);
        self
    }

    /// Run `hook` after every successful POST, once the entity-tag has
    /// been regenerated.
    pub fn on_change(mut self, hook: ChangeHook) -> Self {
        self.on_change = Some(hook);
        self
    }

    /// Build the resource and spawn its watcher. Must be called inside a
    /// Tokio runtime.
    pub fn build(self) -> Resource {
        let policy = if self.observe.is_some() {
            self.policy | Policy::OBSERVABLE
        } else {
            self.policy.without(Policy::OBSERVABLE)
        };

        let subscriptions = Arc::new(Subscriptions::default());
        let (wake, wake_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        tokio::spawn(observe::watch_subscriptions(
            self.href.clone(),
            Arc::clone(&subscriptions),
            wake_rx,
            shutdown.clone(),
        ));

        Resource {
            inner: Arc::new(ResourceInner {
                href: self.href,
                resource_types: self.resource_types,
                interfaces: self.interfaces,
                policy,
                etag: Arc::new(AtomicU64::new(etag::next_etag())),
                get: self.get,
                post: self.post,
                observe: self.observe,
                on_change: self.on_change,
                subscriptions,
                wake,
                shutdown,
                closed: AtomicBool::new(false),
                next_subscription_id: AtomicU64::new(1),
            }),
        }
    }
}

// ── Resource ─────────────────────────────────────────────────────────

/// Cheaply cloneable handle to one resource.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

struct ResourceInner {
    href: String,
    resource_types: Vec<String>,
    interfaces: Vec<String>,
    policy: Policy,
    etag: Arc<AtomicU64>,
    get: Option<GetHandler>,
    post: Option<PostHandler>,
    observe: Option<ObserveHandler>,
    on_change: Option<ChangeHook>,
    subscriptions: Arc<Subscriptions>,
    wake: mpsc::Sender<()>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    next_subscription_id: AtomicU64,
}

impl Drop for ResourceInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Resource {
    pub fn builder(href: impl Into<String>) -> ResourceBuilder {
        ResourceBuilder::new(href)
    }

    /// A resource without an observe handler.
    pub fn new(
        href: impl Into<String>,
        get: Option<GetHandler>,
        post: Option<PostHandler>,
        resource_types: impl IntoIterator<Item = impl Into<String>>,
        interfaces: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut builder = ResourceBuilder::new(href)
            .resource_types(resource_types)
            .interfaces(interfaces);
        builder.get = get;
        builder.post = post;
        builder.build()
    }

    pub fn href(&self) -> &str {
        &self.inner.href
    }

    pub fn resource_types(&self) -> &[String] {
        &self.inner.resource_types
    }

    pub fn interfaces(&self) -> &[String] {
        &self.inner.interfaces
    }

    pub fn policy(&self) -> Policy {
        self.inner.policy
    }

    pub fn etag(&self) -> u64 {
        self.inner.etag.load(Ordering::Acquire)
    }

    /// Regenerate the entity-tag after a state change.
    pub fn refresh_etag(&self) -> u64 {
        let next = etag::next_etag();
        self.inner.etag.store(next, Ordering::Release);
        next
    }

    pub fn observer_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Link advertised for this resource on device `di`.
    pub fn link(&self, di: &Uuid) -> ResourceLink {
        ResourceLink {
            href: self.inner.href.clone(),
            rt: self.inner.resource_types.clone(),
            interfaces: self.inner.interfaces.clone(),
            p: LinkPolicy {
                bm: self.inner.policy.wire_bits(),
            },
            anchor: device_anchor(di),
            di: di.to_string(),
        }
    }

    /// Serve one request.
    pub fn handle(&self, peer: &Peer, request: &Request) -> Response {
        match request.method {
            Method::Get => match request.observe {
                Some(OBSERVE_REGISTER) if self.is_observable() => self.subscribe(peer, request),
                Some(OBSERVE_DEREGISTER) if self.is_observable() => {
                    self.unsubscribe(peer, request)
                }
                _ => self.plain_get(request),
            },
            Method::Post => self.post(request),
            Method::Put | Method::Delete => Response::new(Code::METHOD_NOT_ALLOWED),
        }
    }

    /// Cancel every subscription and stop the watcher. Idempotent.
    pub fn close(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        for sub in self.inner.subscriptions.drain() {
            sub.cancel();
        }
        self.inner.shutdown.cancel();
        debug!(href = %self.inner.href, "resource closed");
    }

    // ── Request paths ────────────────────────────────────────────────

    fn is_observable(&self) -> bool {
        self.inner.observe.is_some() && self.inner.policy.contains(Policy::OBSERVABLE)
    }

    fn plain_get(&self, request: &Request) -> Response {
        let Some(get) = &self.inner.get else {
            return Response::new(Code::METHOD_NOT_ALLOWED);
        };
        match get(request) {
            Ok(response) if response.is_success() => response.with_etag(self.etag()),
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    fn post(&self, request: &Request) -> Response {
        let Some(post) = &self.inner.post else {
            return Response::new(Code::METHOD_NOT_ALLOWED);
        };
        match post(request) {
            Ok(response) => {
                if response.is_success() {
                    self.refresh_etag();
                    if let Some(hook) = &self.inner.on_change {
                        hook();
                    }
                }
                response
            }
            Err(err) => err.into_response(),
        }
    }

    fn subscribe(&self, peer: &Peer, request: &Request) -> Response {
        let (Some(observe), Some(_)) = (&self.inner.observe, &self.inner.get) else {
            return Response::new(Code::METHOD_NOT_ALLOWED);
        };
        if self.is_closed() {
            return self.plain_get(request);
        }

        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let notifier = Notifier::new(
            Arc::clone(&peer.sink),
            Arc::clone(&self.inner.etag),
            Arc::downgrade(&self.inner.subscriptions),
            peer.addr.clone(),
            id,
        );

        let observation = match observe(request, notifier.clone()) {
            Ok(observation) => observation,
            Err(err) => {
                notifier.deactivate();
                return err.into_response();
            }
        };

        let response = self.plain_get(request);
        if !response.is_success() {
            notifier.deactivate();
            observation.cancel();
            return response;
        }

        let sub = Arc::new(Subscription::new(id, peer.sink.done(), notifier.clone()));
        sub.attach(observation);
        if let Some(previous) = self.inner.subscriptions.replace(peer.addr.clone(), sub) {
            previous.cancel();
        }
        // The handler may already have ended the subscription with an error.
        if !notifier.is_active() {
            if let Some(dead) = self.inner.subscriptions.remove_if_same(&peer.addr, id) {
                dead.cancel();
            }
            debug!(
                href = %self.inner.href,
                remote = %peer.addr,
                "observer ended during registration"
            );
            return response;
        }
        // A full slot already guarantees a rebuild.
        let _ = self.inner.wake.try_send(());
        debug!(href = %self.inner.href, remote = %peer.addr, "observer registered");

        response.with_observe(1)
    }

    fn unsubscribe(&self, peer: &Peer, request: &Request) -> Response {
        if let Some(sub) = self.inner.subscriptions.remove(&peer.addr) {
            sub.cancel();
            let _ = self.inner.wake.try_send(());
            debug!(href = %self.inner.href, remote = %peer.addr, "observer deregistered");
        }
        self.plain_get(request)
    }
}
