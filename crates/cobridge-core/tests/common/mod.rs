// Scripted in-memory transport shared by the integration tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use cobridge_api::{
    Code, Connection, Dialer, Error, Method, NotificationSink, Peer, Request, RequestHandler,
    Response,
};
use cobridge_core::{
    CloudManager, ConfigurationUpdate, PersistedState, ProvisioningStatus, SaveCallback,
};

// ── Script ──────────────────────────────────────────────────────────

type Route = (Method, String);

#[derive(Default)]
struct Script {
    once: Mutex<HashMap<Route, VecDeque<Response>>>,
    always: Mutex<HashMap<Route, Response>>,
    delays: Mutex<HashMap<Route, Duration>>,
    requests: Mutex<Vec<Request>>,
}

impl Script {
    fn delay(&self, request: &Request) -> Option<Duration> {
        let route = (request.method, request.path.clone());
        self.delays.lock().unwrap().get(&route).copied()
    }

    fn answer(&self, request: &Request) -> Response {
        self.requests.lock().unwrap().push(request.clone());
        let route = (request.method, request.path.clone());
        if let Some(resp) = self
            .once
            .lock()
            .unwrap()
            .get_mut(&route)
            .and_then(VecDeque::pop_front)
        {
            return resp;
        }
        self.always
            .lock()
            .unwrap()
            .get(&route)
            .cloned()
            .unwrap_or_else(|| Response::new(Code::NOT_FOUND))
    }
}

// ── MockDialer ──────────────────────────────────────────────────────

/// Records dials and requests, replays scripted responses per route.
#[derive(Default)]
pub struct MockDialer {
    script: Arc<Script>,
    dials: AtomicUsize,
    urls: Mutex<Vec<Url>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
}

impl MockDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every `method path` request with `resp`.
    pub fn respond(&self, method: Method, path: &str, resp: Response) {
        self.script
            .always
            .lock()
            .unwrap()
            .insert((method, path.to_owned()), resp);
    }

    /// Answer the next `method path` request with `resp`, before any
    /// standing response.
    pub fn respond_once(&self, method: Method, path: &str, resp: Response) {
        self.script
            .once
            .lock()
            .unwrap()
            .entry((method, path.to_owned()))
            .or_default()
            .push_back(resp);
    }

    /// Hold every `method path` answer back for `delay`.
    pub fn delay(&self, method: Method, path: &str, delay: Duration) {
        self.script
            .delays
            .lock()
            .unwrap()
            .insert((method, path.to_owned()), delay);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn dialed_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().iter().map(Url::to_string).collect()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.script.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.path).collect()
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }

    /// The inbound handler installed by the last dial.
    pub fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        url: &Url,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn Connection>, Error> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.clone());
        *self.handler.lock().unwrap() = Some(handler);
        let conn = Arc::new(MockConnection {
            script: Arc::clone(&self.script),
            done: CancellationToken::new(),
        });
        self.connections.lock().unwrap().push(Arc::clone(&conn));
        Ok(conn)
    }
}

pub struct MockConnection {
    script: Arc<Script>,
    done: CancellationToken,
}

impl MockConnection {
    pub fn done_cancelled(&self) -> bool {
        self.done.is_cancelled()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn request(&self, request: Request) -> Result<Response, Error> {
        if self.done.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        if let Some(delay) = self.script.delay(&request) {
            tokio::time::sleep(delay).await;
        }
        Ok(self.script.answer(&request))
    }

    fn close(&self) {
        self.done.cancel();
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

// ── Peers ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<Response>>,
    pub done: CancellationToken,
}

impl NotificationSink for RecordingSink {
    fn notify(&self, response: Response) -> Result<(), Error> {
        self.sent.lock().unwrap().push(response);
        Ok(())
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

pub fn peer(addr: &str) -> Peer {
    Peer::new(addr, Arc::new(RecordingSink::default()))
}

// ── Persistence ─────────────────────────────────────────────────────

pub fn recording_save() -> (SaveCallback, Arc<Mutex<Vec<PersistedState>>>) {
    let saved = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&saved);
    let save: SaveCallback = Arc::new(move |state: &PersistedState| {
        sink.lock().unwrap().push(state.clone());
    });
    (save, saved)
}

// ── Payload helpers ─────────────────────────────────────────────────

pub fn cbor<T: Serialize>(code: Code, body: &T) -> Response {
    Response::cbor(code, body).unwrap()
}

pub fn valid_update(url: &str) -> ConfigurationUpdate {
    ConfigurationUpdate {
        apn: Some("github".into()),
        sid: Some("cloud-1".into()),
        cis: Some(url.into()),
        at: Some("auth-code".into()),
    }
}

pub async fn wait_for_status(manager: &CloudManager, status: ProvisioningStatus) {
    let mut rx = manager.watch_status();
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == status))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {status}"))
        .unwrap();
}
