use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cobridge_api::{Code, Connection, Dialer, Peer, Request, RequestHandler, Response};

use super::routing::InboundRouter;
use super::runner;
use super::trigger::{Trigger, TriggerSlot};
use crate::config::{
    BASELINE_INTERFACE, CONFIGURATION_PATH, CloudConfiguration, CloudManagerConfig,
    ConfigurationRepresentation, ConfigurationUpdate, PersistedState, ProvisioningStatus,
};
use crate::credentials::Credentials;
use crate::device::Registry;
use crate::error::CoreError;
use crate::resource::{GetHandler, HandlerError, Policy, PostHandler, Resource};

/// Receives every state change worth persisting.
pub type SaveCallback = Arc<dyn Fn(&PersistedState) + Send + Sync>;

// ── CloudManager ─────────────────────────────────────────────────────

/// Owns one device's cloud registration.
///
/// Cheaply cloneable via `Arc<ManagerInner>`. Call [`init`](Self::init) to
/// start the runner and [`close`](Self::close) to stop it.
#[derive(Clone)]
pub struct CloudManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    pub(crate) device_id: Uuid,
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) settings: CloudManagerConfig,
    configuration: Mutex<CloudConfiguration>,
    status: watch::Sender<ProvisioningStatus>,
    pub(crate) credentials: ArcSwap<Credentials>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    pub(crate) resources_published: AtomicBool,
    pub(crate) triggers: TriggerSlot,
    save: SaveCallback,
    pub(crate) cancel: CancellationToken,
    runner: Mutex<Option<JoinHandle<()>>>,
    /// Serializes `connect`.
    pub(crate) single_flight: tokio::sync::Mutex<()>,
    config_resource: Resource,
    self_ref: Weak<ManagerInner>,
}

impl CloudManager {
    /// Create a manager for the device behind `registry`. Does NOT start
    /// anything; call [`init`](Self::init).
    ///
    /// `persisted` restores configuration and credentials from a previous
    /// run. Must be called inside a Tokio runtime.
    pub fn new(
        registry: Arc<dyn Registry>,
        dialer: Arc<dyn Dialer>,
        settings: CloudManagerConfig,
        persisted: Option<PersistedState>,
        save: SaveCallback,
    ) -> Self {
        let (configuration, credentials) = match persisted {
            Some(state) => {
                let mut configuration = state.configuration;
                configuration.reset_status();
                (configuration, Credentials::from(state.credentials))
            }
            None => (CloudConfiguration::default(), Credentials::default()),
        };
        let (status, _) = watch::channel(configuration.provisioning_status);
        let device_id = registry.device_id();

        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| ManagerInner {
            device_id,
            registry,
            dialer,
            settings,
            configuration: Mutex::new(configuration),
            status,
            credentials: ArcSwap::from_pointee(credentials),
            connection: Mutex::new(None),
            resources_published: AtomicBool::new(false),
            triggers: TriggerSlot::default(),
            save,
            cancel: CancellationToken::new(),
            runner: Mutex::new(None),
            single_flight: tokio::sync::Mutex::new(()),
            config_resource: configuration_resource(weak.clone()),
            self_ref: weak.clone(),
        });

        Self { inner }
    }

    pub fn device_id(&self) -> Uuid {
        self.inner.device_id
    }

    /// The resource serving GET/POST on the cloud configuration.
    pub fn configuration_resource(&self) -> Resource {
        self.inner.config_resource.clone()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the runner. Triggers a first attempt right away when a cloud
    /// URL is configured. Calling it again is a no-op.
    pub fn init(&self) {
        let Ok(mut slot) = self.inner.runner.lock() else {
            return;
        };
        if slot.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        *slot = Some(tokio::spawn(runner::run(Arc::clone(&self.inner))));
        drop(slot);

        if self.inner.configuration().is_enabled() {
            self.inner.triggers.fire(Trigger::RECONNECT);
        }
        debug!(device = %self.inner.device_id, "cloud manager started");
    }

    /// Stop the runner, wait for it, and close the transport connection.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.runner.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "cloud runner ended abnormally");
            }
        }
        self.inner.close_connection();
        self.inner.config_resource.close();
        debug!(device = %self.inner.device_id, "cloud manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    // ── Configuration ────────────────────────────────────────────────

    /// Copy of the current configuration.
    pub fn configuration(&self) -> CloudConfiguration {
        self.inner.configuration()
    }

    /// Apply a configuration update and schedule the matching reset.
    ///
    /// An empty URL clears the configuration and requests a local-only
    /// reset. A valid non-empty URL requests a reset with sign-off.
    pub fn update_configuration(
        &self,
        update: ConfigurationUpdate,
    ) -> Result<ConfigurationRepresentation, CoreError> {
        self.inner.update_configuration(update)
    }

    // ── State observation ────────────────────────────────────────────

    pub fn status(&self) -> ProvisioningStatus {
        *self.inner.status.borrow()
    }

    /// Subscribe to provisioning status changes.
    pub fn watch_status(&self) -> watch::Receiver<ProvisioningStatus> {
        self.inner.status.subscribe()
    }

    /// Lock-free credentials snapshot.
    pub fn credentials(&self) -> Arc<Credentials> {
        self.inner.credentials.load_full()
    }

    pub fn resources_published(&self) -> bool {
        self.inner.resources_published.load(Ordering::Acquire)
    }

    /// Request a reconnection attempt outside the timer.
    pub fn reconnect(&self) {
        self.inner.triggers.fire(Trigger::RECONNECT);
    }
}

#[async_trait::async_trait]
impl RequestHandler for CloudManager {
    async fn handle(&self, peer: Peer, request: Request) -> Response {
        InboundRouter::new(Arc::downgrade(&self.inner))
            .handle(peer, request)
            .await
    }
}

// ── ManagerInner: shared state ───────────────────────────────────────

impl ManagerInner {
    pub(crate) fn configuration(&self) -> CloudConfiguration {
        self.configuration
            .lock()
            .map(|cfg| cfg.clone())
            .unwrap_or_default()
    }

    /// Mutate the configuration under its lock and publish the status.
    pub(crate) fn modify_configuration<T>(
        &self,
        f: impl FnOnce(&mut CloudConfiguration) -> T,
    ) -> Option<T> {
        let (result, status) = {
            let mut cfg = self.configuration.lock().ok()?;
            let result = f(&mut cfg);
            (result, cfg.provisioning_status)
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        Some(result)
    }

    pub(crate) fn set_status(&self, status: ProvisioningStatus) {
        self.modify_configuration(|cfg| cfg.provisioning_status = status);
    }

    pub(crate) fn status(&self) -> ProvisioningStatus {
        *self.status.borrow()
    }

    pub(crate) fn persist(&self) {
        let state = PersistedState {
            configuration: self.configuration(),
            credentials: self.credentials.load().to_record(),
        };
        (self.save)(&state);
    }

    /// A handler that routes inbound requests back through this manager.
    pub(crate) fn inbound_handler(&self) -> Arc<dyn RequestHandler> {
        Arc::new(InboundRouter::new(self.self_ref.clone()))
    }

    // ── Connection slot ──────────────────────────────────────────────

    pub(crate) fn live_connection(&self) -> Option<Arc<dyn Connection>> {
        let slot = self.connection.lock().ok()?;
        slot.as_ref().filter(|c| !c.is_closed()).map(Arc::clone)
    }

    pub(crate) fn install_connection(&self, conn: Arc<dyn Connection>) {
        let previous = self
            .connection
            .lock()
            .ok()
            .and_then(|mut slot| slot.replace(conn));
        if let Some(previous) = previous {
            previous.close();
        }
    }

    pub(crate) fn close_connection(&self) {
        let previous = self.connection.lock().ok().and_then(|mut slot| slot.take());
        if let Some(conn) = previous {
            conn.close();
            debug!(device = %self.device_id, "cloud connection closed");
        }
    }

    // ── Configuration endpoint ───────────────────────────────────────

    fn update_configuration(
        &self,
        update: ConfigurationUpdate,
    ) -> Result<ConfigurationRepresentation, CoreError> {
        let (representation, cleared) = self
            .modify_configuration(|cfg| {
                let mut next = cfg.clone();
                next.apply(update)?;
                *cfg = next;
                Ok::<_, CoreError>((cfg.representation(), !cfg.is_enabled()))
            })
            .ok_or(CoreError::Closed)??;

        let trigger = if cleared {
            info!(device = %self.device_id, "cloud configuration cleared");
            Trigger {
                reset: true,
                sign_off: false,
            }
        } else {
            info!(device = %self.device_id, url = %representation.cis, "cloud configuration updated");
            Trigger {
                reset: true,
                sign_off: true,
            }
        };
        self.persist();
        self.triggers.fire(trigger);
        Ok(representation)
    }

    // ── Reset ────────────────────────────────────────────────────────

    /// Zero the credentials and close the transport, optionally signing
    /// off first over the live connection.
    pub(crate) async fn reset(&self, sign_off: bool) {
        if sign_off {
            self.sign_off().await;
        }
        self.credentials.store(Arc::new(Credentials::default()));
        self.resources_published.store(false, Ordering::Release);
        self.close_connection();
        self.modify_configuration(CloudConfiguration::reset_status);
        self.persist();
        debug!(device = %self.device_id, sign_off, "credentials reset");
    }

    /// Reset and drop the configuration after the cloud rejected the
    /// device.
    pub(crate) async fn cleanup(&self) {
        warn!(device = %self.device_id, "cloud rejected credentials, clearing configuration");
        self.reset(false).await;
        self.modify_configuration(CloudConfiguration::clear);
        self.persist();
    }
}

// ── Configuration resource ───────────────────────────────────────────

fn configuration_resource(manager: Weak<ManagerInner>) -> Resource {
    let get_manager = manager.clone();
    let get: GetHandler = Arc::new(move |_req: &Request| {
        let Some(inner) = get_manager.upgrade() else {
            return Ok(Response::new(Code::SERVICE_UNAVAILABLE));
        };
        Ok(Response::cbor(
            Code::CONTENT,
            &inner.configuration().representation(),
        )?)
    });

    let post: PostHandler = Arc::new(move |req: &Request| {
        let Some(inner) = manager.upgrade() else {
            return Ok(Response::new(Code::SERVICE_UNAVAILABLE));
        };
        let update: ConfigurationUpdate = req
            .decode()
            .map_err(|e| HandlerError::bad_request(e.to_string()))?;
        let representation = inner
            .update_configuration(update)
            .map_err(|e| HandlerError::bad_request(e.to_string()))?;
        Ok(Response::cbor(Code::CHANGED, &representation)?)
    });

    Resource::builder(CONFIGURATION_PATH)
        .resource_types([crate::config::CONFIGURATION_RESOURCE_TYPE])
        .interfaces([BASELINE_INTERFACE])
        .policy(Policy::DISCOVERABLE)
        .get(get)
        .post(post)
        .build()
}
