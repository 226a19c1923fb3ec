// Inbound requests arriving over the cloud connection.
//
// Device and discovery requests gain the `di` query the registry expects;
// discovery responses get the canonical device link. Everything else is
// forwarded unchanged.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::debug;

use cobridge_api::cloud::{DEVICE_PATH, DISCOVERY_PATH};
use cobridge_api::{Code, Peer, Request, RequestHandler, ResourceLink, Response, codec};

use super::manager::ManagerInner;
use crate::device::DEVICE_RESOURCE_TYPE;
use crate::resource::device_anchor;

pub(crate) struct InboundRouter {
    manager: Weak<ManagerInner>,
}

impl InboundRouter {
    pub(crate) fn new(manager: Weak<ManagerInner>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl RequestHandler for InboundRouter {
    async fn handle(&self, peer: Peer, mut request: Request) -> Response {
        let Some(inner) = self.manager.upgrade() else {
            return Response::new(Code::SERVICE_UNAVAILABLE);
        };
        route(&inner, &peer, &mut request)
    }
}

fn route(inner: &Arc<ManagerInner>, peer: &Peer, request: &mut Request) -> Response {
    let di = inner.device_id.to_string();
    let is_device = request.path == DEVICE_PATH;
    let is_discovery = request.path == DISCOVERY_PATH;

    if (is_device || is_discovery) && request.query_value("di").is_none() {
        request.queries.push(format!("di={di}"));
    }

    let response = inner.registry.dispatch(peer, request);
    if !is_discovery || !response.is_success() {
        return response;
    }
    patch_discovery(response, &inner.device_id)
}

/// Rewrite the device link in a discovery payload to `/oic/d` anchored at
/// `ocf://<di>`.
fn patch_discovery(response: Response, device_id: &uuid::Uuid) -> Response {
    let Ok(mut links) = codec::decode::<Vec<ResourceLink>>(&response.payload) else {
        return response;
    };
    let anchor = device_anchor(device_id);
    for link in links.iter_mut().filter(|l| l.has_type(DEVICE_RESOURCE_TYPE)) {
        DEVICE_PATH.clone_into(&mut link.href);
        link.anchor.clone_from(&anchor);
    }
    match codec::encode(&links) {
        Ok(payload) => Response { payload, ..response },
        Err(e) => {
            debug!(error = %e, "discovery payload left unpatched");
            response
        }
    }
}
