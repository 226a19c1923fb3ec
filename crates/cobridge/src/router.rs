//! Routes inbound requests on the shared endpoint to the right device.
//!
//! A `di` query selects the device. Discovery without one merges every
//! device's links; anything else goes to the first device.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use cobridge_api::cloud::DISCOVERY_PATH;
use cobridge_api::{Code, Method, Peer, Request, RequestHandler, ResourceLink, Response, codec};
use cobridge_core::Device;

pub struct DeviceRouter {
    devices: Vec<Arc<Device>>,
}

impl DeviceRouter {
    pub fn new(devices: Vec<Arc<Device>>) -> Self {
        Self { devices }
    }

    fn by_id(&self, di: &str) -> Option<&Arc<Device>> {
        let id = Uuid::parse_str(di).ok()?;
        self.devices.iter().find(|d| d.id() == id)
    }

    async fn merged_discovery(&self, peer: Peer, request: Request) -> Response {
        let mut links: Vec<ResourceLink> = Vec::new();
        for device in &self.devices {
            let resp = device.handle(peer.clone(), request.clone()).await;
            if !resp.is_success() {
                continue;
            }
            match codec::decode::<Vec<ResourceLink>>(&resp.payload) {
                Ok(mut device_links) => links.append(&mut device_links),
                Err(e) => debug!(device = %device.id(), error = %e, "skipping discovery payload"),
            }
        }
        Response::cbor(Code::CONTENT, &links)
            .unwrap_or_else(|e| Response::text(Code::INTERNAL_SERVER_ERROR, e.to_string()))
    }
}

#[async_trait]
impl RequestHandler for DeviceRouter {
    async fn handle(&self, peer: Peer, request: Request) -> Response {
        if let Some(di) = request.query_value("di") {
            return match self.by_id(di) {
                Some(device) => device.handle(peer, request).await,
                None => Response::new(Code::NOT_FOUND),
            };
        }

        let discovery = request.method == Method::Get && request.path == DISCOVERY_PATH;
        if discovery && self.devices.len() > 1 {
            return self.merged_discovery(peer, request).await;
        }
        match self.devices.first() {
            Some(device) => device.handle(peer, request).await,
            None => Response::new(Code::SERVICE_UNAVAILABLE),
        }
    }
}
