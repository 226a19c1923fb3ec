// Background reconnection runner.
//
// One task per manager. Waits for shutdown, a pending trigger, or the
// reconnect timer; a failed attempt waits for the next tick.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::manager::ManagerInner;
use crate::config::ProvisioningStatus;
use crate::error::{CoreError, clec};

pub(crate) async fn run(inner: Arc<ManagerInner>) {
    let cancel = inner.cancel.clone();
    let mut interval = tokio::time::interval(inner.settings.reconnect_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // consume the immediate first tick

    loop {
        let trigger = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            trigger = inner.triggers.wait() => Some(trigger),
            _ = interval.tick() => None,
        };

        if let Some(trigger) = trigger {
            debug!(device = %inner.device_id, ?trigger, "reconnect triggered");
            // A reset always completes so credentials are cleared and
            // persisted; sign-off is bounded by the step timeout.
            if trigger.reset {
                inner.reset(trigger.sign_off).await;
                if cancel.is_cancelled() {
                    break;
                }
            }
        }

        if !inner.configuration().is_enabled() {
            continue;
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = inner.connect() => result,
        };
        record_attempt(&inner, result);
    }

    inner.close_connection();
    debug!(device = %inner.device_id, "cloud runner stopped");
}

fn record_attempt(inner: &ManagerInner, result: Result<(), CoreError>) {
    match result {
        Ok(()) => {
            let newly_registered = inner.status() != ProvisioningStatus::Registered;
            inner.modify_configuration(|cfg| {
                cfg.provisioning_status = ProvisioningStatus::Registered;
                cfg.last_error_code = clec::NONE;
            });
            if newly_registered {
                info!(device = %inner.device_id, "registered with cloud");
                inner.persist();
            }
        }
        Err(e) => {
            warn!(device = %inner.device_id, error = %e, "cloud connection attempt failed");
            let code = e.last_error_code();
            inner.modify_configuration(|cfg| {
                cfg.last_error_code = code;
                if cfg.is_enabled()
                    && matches!(
                        cfg.provisioning_status,
                        ProvisioningStatus::Registering | ProvisioningStatus::Registered
                    )
                {
                    cfg.provisioning_status = ProvisioningStatus::ReadyToRegister;
                }
            });
            inner.persist();
        }
    }
}
