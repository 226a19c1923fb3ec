// ── Device & resource registry ──
//
// Maps hrefs to resources, owns the device resource (`/oic/d`) and the
// discovery resource (`/oic/res`), and composes a device with its
// optional cloud manager.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use cobridge_api::cloud::{DEVICE_PATH, DISCOVERY_PATH};
use cobridge_api::{Code, Dialer, Peer, Request, RequestHandler, ResourceLink, Response};

use crate::cloud::{CloudManager, SaveCallback};
use crate::config::{CloudManagerConfig, PersistedState};
use crate::error::CoreError;
use crate::resource::{GetHandler, HandlerError, Policy, Resource};

pub const DEVICE_RESOURCE_TYPE: &str = "oic.wk.d";
pub const DISCOVERY_RESOURCE_TYPE: &str = "oic.wk.res";
const READ_ONLY_INTERFACE: &str = "oic.if.r";
const BASELINE_INTERFACE: &str = "oic.if.baseline";
const LINK_LIST_INTERFACE: &str = "oic.if.ll";

// ── Registry seam ────────────────────────────────────────────────────

/// Which links to collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFilter {
    All,
    Discoverable,
    PublishToCloud,
}

impl LinkFilter {
    fn admits(self, policy: Policy) -> bool {
        match self {
            Self::All => true,
            Self::Discoverable => policy.contains(Policy::DISCOVERABLE),
            Self::PublishToCloud => policy.contains(Policy::PUBLISH_TO_CLOUD),
        }
    }
}

/// What the cloud manager needs from the device it registers.
pub trait Registry: Send + Sync {
    fn device_id(&self) -> Uuid;

    fn resource_links(&self, filter: LinkFilter) -> Vec<ResourceLink>;

    fn dispatch(&self, peer: &Peer, request: &Request) -> Response;
}

// ── Device resource body ─────────────────────────────────────────────

/// Body of a GET on `/oic/d`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRepresentation {
    pub di: String,
    pub n: String,
    pub rt: Vec<String>,
}

// ── ResourceTable ────────────────────────────────────────────────────

/// Concurrent href → resource map for one device.
pub struct ResourceTable {
    device_id: Uuid,
    name: String,
    resources: DashMap<String, Resource>,
}

impl ResourceTable {
    /// Create a table holding the device and discovery resources.
    pub fn new(
        device_id: Uuid,
        name: impl Into<String>,
        device_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Arc<Self> {
        let name = name.into();
        let mut types = vec![DEVICE_RESOURCE_TYPE.to_owned()];
        types.extend(device_types.into_iter().map(Into::into));

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let resources = DashMap::new();

            let device = device_resource(device_id, &name, types);
            resources.insert(device.href().to_owned(), device);

            let discovery = discovery_resource(weak.clone());
            resources.insert(discovery.href().to_owned(), discovery);

            Self {
                device_id,
                name,
                resources,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert `resource`. Fails if the href is taken.
    pub fn insert(&self, resource: Resource) -> Result<(), CoreError> {
        match self.resources.entry(resource.href().to_owned()) {
            Entry::Occupied(_) => Err(CoreError::validation(format!(
                "resource {} already exists",
                resource.href()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(resource);
                Ok(())
            }
        }
    }

    /// Remove and close the resource at `href`. The device and discovery
    /// resources cannot be removed.
    pub fn remove(&self, href: &str) -> Option<Resource> {
        if href == DEVICE_PATH || href == DISCOVERY_PATH {
            return None;
        }
        let (_, resource) = self.resources.remove(href)?;
        resource.close();
        Some(resource)
    }

    pub fn get(&self, href: &str) -> Option<Resource> {
        self.resources.get(href).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Close every resource.
    pub fn close(&self) {
        for entry in &self.resources {
            entry.value().close();
        }
    }

    fn discovery_links(&self, request: &Request) -> Result<Response, HandlerError> {
        if let Some(di) = request.query_value("di") {
            if di != self.device_id.to_string() {
                return Ok(Response::new(Code::NOT_FOUND));
            }
        }
        let rt = request.query_value("rt");
        let links: Vec<ResourceLink> = self
            .resource_links(LinkFilter::Discoverable)
            .into_iter()
            .filter(|link| rt.is_none_or(|rt| link.has_type(rt)))
            .collect();
        Ok(Response::cbor(Code::CONTENT, &links)?)
    }
}

impl Registry for ResourceTable {
    fn device_id(&self) -> Uuid {
        self.device_id
    }

    fn resource_links(&self, filter: LinkFilter) -> Vec<ResourceLink> {
        let mut links: Vec<ResourceLink> = self
            .resources
            .iter()
            .filter(|r| filter.admits(r.value().policy()))
            .map(|r| r.value().link(&self.device_id))
            .collect();
        links.sort_by(|a, b| a.href.cmp(&b.href));
        links
    }

    fn dispatch(&self, peer: &Peer, request: &Request) -> Response {
        match self.get(&request.path) {
            Some(resource) => resource.handle(peer, request),
            None => Response::new(Code::NOT_FOUND),
        }
    }
}

#[async_trait]
impl RequestHandler for ResourceTable {
    async fn handle(&self, peer: Peer, request: Request) -> Response {
        self.dispatch(&peer, &request)
    }
}

fn device_resource(device_id: Uuid, name: &str, types: Vec<String>) -> Resource {
    let body = DeviceRepresentation {
        di: device_id.to_string(),
        n: name.to_owned(),
        rt: types.clone(),
    };
    let get: GetHandler = Arc::new(move |_req: &Request| Ok(Response::cbor(Code::CONTENT, &body)?));
    Resource::builder(DEVICE_PATH)
        .resource_types(types)
        .interfaces([BASELINE_INTERFACE, READ_ONLY_INTERFACE])
        .get(get)
        .build()
}

fn discovery_resource(table: Weak<ResourceTable>) -> Resource {
    let get: GetHandler = Arc::new(move |req: &Request| match table.upgrade() {
        Some(table) => table.discovery_links(req),
        None => Ok(Response::new(Code::SERVICE_UNAVAILABLE)),
    });
    Resource::builder(DISCOVERY_PATH)
        .resource_types([DISCOVERY_RESOURCE_TYPE])
        .interfaces([BASELINE_INTERFACE, LINK_LIST_INTERFACE])
        .policy(Policy::DISCOVERABLE)
        .get(get)
        .build()
}

// ── Device ───────────────────────────────────────────────────────────

/// A device: its resource table plus an optional cloud manager.
pub struct Device {
    table: Arc<ResourceTable>,
    cloud: Mutex<Option<CloudManager>>,
}

impl Device {
    pub fn new(
        device_id: Uuid,
        name: impl Into<String>,
        device_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            table: ResourceTable::new(device_id, name, device_types),
            cloud: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.table.device_id
    }

    pub fn name(&self) -> &str {
        self.table.name()
    }

    pub fn table(&self) -> &Arc<ResourceTable> {
        &self.table
    }

    pub fn registry(&self) -> Arc<dyn Registry> {
        Arc::clone(&self.table) as Arc<dyn Registry>
    }

    pub fn add_resource(&self, resource: Resource) -> Result<(), CoreError> {
        debug!(device = %self.id(), href = %resource.href(), "adding resource");
        self.table.insert(resource)
    }

    pub fn remove_resource(&self, href: &str) -> Option<Resource> {
        self.table.remove(href)
    }

    pub fn resource(&self, href: &str) -> Option<Resource> {
        self.table.get(href)
    }

    /// Attach a cloud manager, expose its configuration resource, and
    /// start its runner.
    pub fn enable_cloud(
        &self,
        dialer: Arc<dyn Dialer>,
        settings: CloudManagerConfig,
        persisted: Option<PersistedState>,
        save: SaveCallback,
    ) -> Result<CloudManager, CoreError> {
        let mut slot = self
            .cloud
            .lock()
            .map_err(|_| CoreError::validation("device state poisoned"))?;
        if slot.is_some() {
            return Err(CoreError::validation("cloud already enabled"));
        }

        let manager = CloudManager::new(self.registry(), dialer, settings, persisted, save);
        self.table.insert(manager.configuration_resource())?;
        manager.init();
        *slot = Some(manager.clone());
        info!(device = %self.id(), "cloud manager enabled");
        Ok(manager)
    }

    pub fn cloud(&self) -> Option<CloudManager> {
        self.cloud.lock().ok().and_then(|slot| slot.clone())
    }

    /// Stop the cloud manager, then close every resource.
    pub async fn close(&self) {
        let manager = self.cloud.lock().ok().and_then(|mut slot| slot.take());
        if let Some(manager) = manager {
            manager.close().await;
        }
        self.table.close();
        debug!(device = %self.id(), "device closed");
    }
}

#[async_trait]
impl RequestHandler for Device {
    async fn handle(&self, peer: Peer, request: Request) -> Response {
        self.table.dispatch(&peer, &request)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cobridge_api::{NotificationSink, codec};
    use tokio_util::sync::CancellationToken;

    use super::*;

    struct NullSink;

    impl NotificationSink for NullSink {
        fn notify(&self, _response: Response) -> Result<(), cobridge_api::Error> {
            Ok(())
        }

        fn done(&self) -> CancellationToken {
            CancellationToken::new()
        }
    }

    fn peer() -> Peer {
        Peer::new("127.0.0.1:5683", Arc::new(NullSink))
    }

    fn light() -> Resource {
        let get: GetHandler = Arc::new(|_req: &Request| Ok(Response::text(Code::CONTENT, "on")));
        Resource::builder("/light")
            .resource_types(["oic.r.switch.binary"])
            .interfaces(["oic.if.a", BASELINE_INTERFACE])
            .get(get)
            .build()
    }

    #[tokio::test]
    async fn device_resource_reports_identity() {
        let id = Uuid::new_v4();
        let device = Device::new(id, "lamp", ["oic.d.light"]);

        let resp = device.table().dispatch(&peer(), &Request::get(DEVICE_PATH));
        assert_eq!(resp.code, Code::CONTENT);
        let body: DeviceRepresentation = resp.decode().unwrap();
        assert_eq!(body.di, id.to_string());
        assert_eq!(body.n, "lamp");
        assert_eq!(body.rt, vec!["oic.wk.d".to_owned(), "oic.d.light".to_owned()]);
    }

    #[tokio::test]
    async fn discovery_filters_by_resource_type() {
        let device = Device::new(Uuid::new_v4(), "lamp", Vec::<String>::new());
        device.add_resource(light()).unwrap();

        let all = device.table().dispatch(&peer(), &Request::get(DISCOVERY_PATH));
        let links: Vec<ResourceLink> = codec::decode(&all.payload).unwrap();
        let hrefs: Vec<&str> = links.iter().map(|l| l.href.as_str()).collect();
        assert_eq!(hrefs, vec!["/light", "/oic/d", "/oic/res"]);

        let filtered = device.table().dispatch(
            &peer(),
            &Request::get(DISCOVERY_PATH).with_query("rt", "oic.r.switch.binary"),
        );
        let links: Vec<ResourceLink> = codec::decode(&filtered.payload).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].href, "/light");
        assert_eq!(links[0].anchor, format!("ocf://{}", device.id()));
    }

    #[tokio::test]
    async fn discovery_for_other_device_is_not_found() {
        let device = Device::new(Uuid::new_v4(), "lamp", Vec::<String>::new());
        let resp = device.table().dispatch(
            &peer(),
            &Request::get(DISCOVERY_PATH).with_query("di", &Uuid::new_v4().to_string()),
        );
        assert_eq!(resp.code, Code::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_href_is_rejected_and_builtins_stay() {
        let device = Device::new(Uuid::new_v4(), "lamp", Vec::<String>::new());
        device.add_resource(light()).unwrap();
        assert!(device.add_resource(light()).is_err());

        assert!(device.remove_resource(DEVICE_PATH).is_none());
        let removed = device.remove_resource("/light").unwrap();
        assert!(removed.is_closed());
        assert_eq!(
            device.table().dispatch(&peer(), &Request::get("/light")).code,
            Code::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn publish_filter_skips_discovery_resource() {
        let device = Device::new(Uuid::new_v4(), "lamp", Vec::<String>::new());
        device.add_resource(light()).unwrap();
        let hrefs: Vec<String> = device
            .table()
            .resource_links(LinkFilter::PublishToCloud)
            .into_iter()
            .map(|l| l.href)
            .collect();
        assert_eq!(hrefs, vec!["/light".to_owned(), "/oic/d".to_owned()]);
    }
}
