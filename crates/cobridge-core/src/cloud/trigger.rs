// Coalescing reconnection trigger.
//
// Capacity one, never blocks the sender. Bursts collapse into a single
// pending trigger whose flags are OR-merged, so a requested reset is
// never lost.

use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Trigger {
    /// Reset credentials before reconnecting.
    pub reset: bool,
    /// Attempt a graceful sign-off as part of the reset.
    pub sign_off: bool,
}

impl Trigger {
    pub(crate) const RECONNECT: Self = Self {
        reset: false,
        sign_off: false,
    };

    fn merge(self, other: Self) -> Self {
        Self {
            reset: self.reset || other.reset,
            sign_off: self.sign_off || other.sign_off,
        }
    }
}

#[derive(Default)]
pub(crate) struct TriggerSlot {
    pending: Mutex<Option<Trigger>>,
    notify: Notify,
}

impl TriggerSlot {
    pub(crate) fn fire(&self, trigger: Trigger) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(pending.map_or(trigger, |p| p.merge(trigger)));
        }
        self.notify.notify_one();
    }

    pub(crate) fn take(&self) -> Option<Trigger> {
        self.pending.lock().ok().and_then(|mut pending| pending.take())
    }

    /// Wait for the next pending trigger.
    pub(crate) async fn wait(&self) -> Trigger {
        loop {
            if let Some(trigger) = self.take() {
                return trigger;
            }
            self.notify.notified().await;
        }
    }
}
