// ── Observation engine ──
//
// Per-remote subscriptions of one resource, the push path that turns
// handler output into Observe notifications, and the watcher task that
// drops subscriptions whose remote went away.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crc::{CRC_64_GO_ISO, Crc};
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use cobridge_api::{NotificationSink, Response};

use super::handler::{HandlerError, HandlerResult, Observation};

const CHECKSUM: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

// ── Notifier ─────────────────────────────────────────────────────────

/// Push handle given to an observe handler.
///
/// Cheap to clone. Pushes after the subscription ended are dropped.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    sink: Arc<dyn NotificationSink>,
    etag: Arc<AtomicU64>,
    sequence: AtomicU32,
    last_checksum: Mutex<Option<u64>>,
    active: AtomicBool,
    subscriptions: Weak<Subscriptions>,
    key: String,
    subscription_id: u64,
}

/// What a single push did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Sent { sequence: u32 },
    Duplicate,
    /// Final error notification was sent and the subscription ended.
    Terminated,
    Inactive,
}

impl Notifier {
    pub(crate) fn new(
        sink: Arc<dyn NotificationSink>,
        etag: Arc<AtomicU64>,
        subscriptions: Weak<Subscriptions>,
        key: String,
        subscription_id: u64,
    ) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                sink,
                etag,
                // The registration reply carries sequence 1.
                sequence: AtomicU32::new(1),
                last_checksum: Mutex::new(None),
                active: AtomicBool::new(true),
                subscriptions,
                key,
                subscription_id,
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Push a new state to the remote.
    ///
    /// An error ends the subscription after one final error notification.
    /// A body identical to the previous push is not transmitted and does
    /// not advance the sequence.
    pub fn push(&self, result: HandlerResult) -> PushOutcome {
        if !self.is_active() {
            return PushOutcome::Inactive;
        }
        match result {
            Ok(response) => self.push_response(response),
            Err(err) => {
                self.terminate(err);
                PushOutcome::Terminated
            }
        }
    }

    fn push_response(&self, response: Response) -> PushOutcome {
        let checksum = CHECKSUM.checksum(&response.payload);
        {
            let Ok(mut last) = self.inner.last_checksum.lock() else {
                return PushOutcome::Inactive;
            };
            if *last == Some(checksum) {
                trace!(key = %self.inner.key, "suppressing duplicate notification");
                return PushOutcome::Duplicate;
            }
            *last = Some(checksum);
        }

        let sequence = self.next_sequence();
        let etag = self.inner.etag.load(Ordering::Acquire);
        let notification = response.with_observe(sequence).with_etag(etag);
        if let Err(e) = self.inner.sink.notify(notification) {
            debug!(key = %self.inner.key, error = %e, "notification not delivered");
        }
        PushOutcome::Sent { sequence }
    }

    fn terminate(&self, err: HandlerError) {
        if let Some(subs) = self.inner.subscriptions.upgrade() {
            if let Some(sub) = subs.remove_if_same(&self.inner.key, self.inner.subscription_id) {
                sub.cancel();
            }
        }
        let sequence = self.next_sequence();
        let final_notification = err.into_response().with_observe(sequence);
        if let Err(e) = self.inner.sink.notify(final_notification) {
            debug!(key = %self.inner.key, error = %e, "final notification not delivered");
        }
        self.deactivate();
    }

    fn next_sequence(&self) -> u32 {
        self.inner
            .sequence
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    pub(crate) fn deactivate(&self) {
        self.inner.active.store(false, Ordering::Release);
    }
}

// ── Subscription ─────────────────────────────────────────────────────

pub(crate) struct Subscription {
    pub(crate) id: u64,
    pub(crate) done: CancellationToken,
    notifier: Notifier,
    observation: Mutex<Option<Observation>>,
}

impl Subscription {
    pub(crate) fn new(id: u64, done: CancellationToken, notifier: Notifier) -> Self {
        Self {
            id,
            done,
            notifier,
            observation: Mutex::new(None),
        }
    }

    pub(crate) fn attach(&self, observation: Observation) {
        if let Ok(mut slot) = self.observation.lock() {
            *slot = Some(observation);
        }
    }

    /// Stop notifications and run the observation teardown. Idempotent.
    pub(crate) fn cancel(&self) {
        self.notifier.deactivate();
        let observation = self.observation.lock().ok().and_then(|mut slot| slot.take());
        if let Some(observation) = observation {
            observation.cancel();
        }
    }
}

/// Active subscriptions of one resource, keyed by remote address.
#[derive(Default)]
pub(crate) struct Subscriptions {
    by_remote: DashMap<String, Arc<Subscription>>,
}

impl Subscriptions {
    /// Install `sub` for `key`, returning the one it displaced.
    pub(crate) fn replace(&self, key: String, sub: Arc<Subscription>) -> Option<Arc<Subscription>> {
        self.by_remote.insert(key, sub)
    }

    pub(crate) fn remove(&self, key: &str) -> Option<Arc<Subscription>> {
        self.by_remote.remove(key).map(|(_, sub)| sub)
    }

    /// Remove `key` only if it still maps to subscription `id`.
    pub(crate) fn remove_if_same(&self, key: &str, id: u64) -> Option<Arc<Subscription>> {
        self.by_remote
            .remove_if(key, |_, sub| sub.id == id)
            .map(|(_, sub)| sub)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Subscription>> {
        let keys: Vec<String> = self.by_remote.iter().map(|r| r.key().clone()).collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    fn snapshot(&self) -> Vec<(String, u64, CancellationToken)> {
        self.by_remote
            .iter()
            .map(|r| (r.key().clone(), r.value().id, r.value().done.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_remote.len()
    }
}

// ── Watcher ──────────────────────────────────────────────────────────

/// Drop subscriptions whose remote is gone until `shutdown` fires or the
/// owning resource is dropped.
pub(crate) async fn watch_subscriptions(
    href: String,
    subscriptions: Arc<Subscriptions>,
    mut wake: mpsc::Receiver<()>,
    shutdown: CancellationToken,
) {
    loop {
        let mut waits: FuturesUnordered<_> = subscriptions
            .snapshot()
            .into_iter()
            .map(|(key, id, done)| async move {
                done.cancelled_owned().await;
                (key, id)
            })
            .collect();

        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            woke = wake.recv() => {
                if woke.is_none() {
                    break;
                }
            }
            Some((key, id)) = waits.next(), if !waits.is_empty() => {
                if let Some(sub) = subscriptions.remove_if_same(&key, id) {
                    debug!(%href, remote = %key, "observer gone");
                    sub.cancel();
                }
            }
        }
    }

    for sub in subscriptions.drain() {
        sub.cancel();
    }
    trace!(%href, "subscription watcher stopped");
}
