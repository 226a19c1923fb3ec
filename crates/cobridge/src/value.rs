//! Configured resources: one JSON-shaped value served as CBOR.
//!
//! GET returns the value, POST merges an object body into it (any other
//! body replaces it). Once the resource has regenerated its entity-tag the
//! new value is pushed to every observer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use cobridge_api::{Code, Request, Response};
use cobridge_config::ResourceConfig;
use cobridge_core::resource::{
    ChangeHook, GetHandler, HandlerError, Notifier, Observation, ObserveHandler, PostHandler,
    PushOutcome,
};
use cobridge_core::{Policy, Resource};

#[derive(Default)]
struct ValueState {
    value: Mutex<Value>,
    observers: DashMap<u64, Notifier>,
    next_id: AtomicU64,
}

impl ValueState {
    fn snapshot(&self) -> Result<Value, HandlerError> {
        self.value
            .lock()
            .map(|v| v.clone())
            .map_err(|_| HandlerError::internal("value lock poisoned"))
    }

    fn render(&self) -> Result<Response, HandlerError> {
        Ok(Response::cbor(Code::CONTENT, &self.snapshot()?)?)
    }

    fn update(&self, body: Value) -> Result<Value, HandlerError> {
        let mut current = self
            .value
            .lock()
            .map_err(|_| HandlerError::internal("value lock poisoned"))?;
        merge(&mut current, body);
        Ok(current.clone())
    }

    fn broadcast(&self) {
        let notifiers: Vec<(u64, Notifier)> = self
            .observers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (id, notifier) in notifiers {
            match notifier.push(self.render()) {
                PushOutcome::Sent { sequence } => debug!(observer = id, sequence, "notified"),
                PushOutcome::Duplicate => {}
                PushOutcome::Terminated | PushOutcome::Inactive => {
                    self.observers.remove(&id);
                }
            }
        }
    }
}

fn merge(current: &mut Value, body: Value) {
    match (current, body) {
        (Value::Object(current), Value::Object(body)) => current.extend(body),
        (current, body) => *current = body,
    }
}

/// Build the resource described by `cfg`.
pub fn value_resource(cfg: &ResourceConfig) -> Resource {
    let state = Arc::new(ValueState {
        value: Mutex::new(cfg.value.clone()),
        ..ValueState::default()
    });

    let get_state = Arc::clone(&state);
    let get: GetHandler = Arc::new(move |_req: &Request| get_state.render());

    let post_state = Arc::clone(&state);
    let post: PostHandler = Arc::new(move |req: &Request| {
        let body: Value = req
            .decode()
            .map_err(|e| HandlerError::bad_request(e.to_string()))?;
        let value = post_state.update(body)?;
        Ok(Response::cbor(Code::CHANGED, &value)?)
    });

    let change_state = Arc::clone(&state);
    let on_change: ChangeHook = Arc::new(move || change_state.broadcast());

    let mut policy = Policy::DISCOVERABLE;
    if cfg.publish {
        policy |= Policy::PUBLISH_TO_CLOUD;
    }

    let mut builder = Resource::builder(cfg.href.clone())
        .resource_types(cfg.rt.iter().cloned())
        .interfaces(cfg.interfaces.iter().cloned())
        .policy(policy)
        .get(get)
        .post(post)
        .on_change(on_change);

    if cfg.observable {
        let observe_state = Arc::clone(&state);
        let observe: ObserveHandler = Arc::new(move |_req: &Request, notifier: Notifier| {
            let id = observe_state.next_id.fetch_add(1, Ordering::Relaxed);
            observe_state.observers.insert(id, notifier);
            let weak = Arc::downgrade(&observe_state);
            Ok(Observation::new(move || {
                if let Some(state) = weak.upgrade() {
                    state.observers.remove(&id);
                }
            }))
        });
        builder = builder.observe(observe);
    }

    builder.build()
}
