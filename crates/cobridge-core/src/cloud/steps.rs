// ── connect state machine ──
//
// The ordered protocol steps of one registration attempt. Each step runs
// under a fresh step timeout; a failing step closes the connection and is
// reported wrapped in its `Step`. Progress from earlier steps is kept.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use strum::Display;
use tracing::{debug, info, warn};
use url::Url;

use cobridge_api::cloud::CloudClient;
use cobridge_api::cloud::models::{PublishRequest, RefreshRequest, SignInRequest, SignUpRequest};
use cobridge_api::cloud::DEVICE_PATH;
use cobridge_api::{Connection, Error as ApiError};
use secrecy::ExposeSecret;

use super::manager::ManagerInner;
use crate::config::ProvisioningStatus;
use crate::credentials::Credentials;
use crate::device::{DEVICE_RESOURCE_TYPE, LinkFilter};
use crate::error::CoreError;
use crate::resource::device_anchor;

/// One named step of `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Step {
    #[strum(serialize = "dial")]
    Dial,
    #[strum(serialize = "sign up")]
    SignUp,
    #[strum(serialize = "refresh token")]
    RefreshToken,
    #[strum(serialize = "sign in")]
    SignIn,
    #[strum(serialize = "publish resources")]
    PublishResources,
}

impl ManagerInner {
    /// Run every step in order. Only the runner calls this.
    pub(crate) async fn connect(&self) -> Result<(), CoreError> {
        let _guard = self.single_flight.lock().await;

        let conn = self.step(Step::Dial, self.dial()).await?;
        let conn = self.step(Step::SignUp, self.sign_up(conn)).await?;
        self.step(Step::RefreshToken, self.refresh_token(&conn)).await?;
        self.step(Step::SignIn, self.sign_in(&conn)).await?;
        self.step(Step::PublishResources, self.publish(&conn)).await?;
        Ok(())
    }

    async fn step<T>(
        &self,
        step: Step,
        fut: impl Future<Output = Result<T, CoreError>>,
    ) -> Result<T, CoreError> {
        let timeout = self.settings.step_timeout;
        debug!(device = %self.device_id, %step, "running step");
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Api(ApiError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })),
        };
        result.map_err(|e| {
            self.close_connection();
            e.in_step(step)
        })
    }

    // ── Dial ─────────────────────────────────────────────────────────

    /// Reuse the live connection or open a new one.
    async fn dial(&self) -> Result<Arc<dyn Connection>, CoreError> {
        if let Some(conn) = self.live_connection() {
            return Ok(conn);
        }

        let url = self.configuration().url;
        if url.is_empty() {
            return Err(CoreError::validation("cloud URL is not configured"));
        }
        let url = Url::parse(&url).map_err(ApiError::from)?;
        let conn = self.dialer.dial(&url, self.inbound_handler()).await?;

        // Session state belongs to the previous connection.
        self.credentials
            .store(Arc::new(self.credentials.load().signed_out()));
        self.resources_published.store(false, Ordering::Release);
        self.install_connection(Arc::clone(&conn));
        info!(device = %self.device_id, %url, "connected to cloud");
        Ok(conn)
    }

    // ── Sign-up ──────────────────────────────────────────────────────

    async fn sign_up(&self, conn: Arc<dyn Connection>) -> Result<Arc<dyn Connection>, CoreError> {
        if self.credentials.load().has_access_token() {
            return Ok(conn);
        }

        let config = self.configuration();
        if self.device_id.is_nil() {
            return Err(CoreError::validation("device id must not be empty"));
        }
        if config.authorization_code.is_empty() {
            return Err(CoreError::validation("authorization code must not be empty"));
        }
        if config.authorization_provider.is_empty() {
            return Err(CoreError::validation(
                "authorization provider must not be empty",
            ));
        }

        self.set_status(ProvisioningStatus::Registering);
        let resp = CloudClient::new(Arc::clone(&conn))
            .sign_up(&SignUpRequest {
                di: self.device_id.to_string(),
                accesstoken: config.authorization_code.clone(),
                authprovider: config.authorization_provider.clone(),
            })
            .await?;

        self.credentials
            .store(Arc::new(Credentials::from_sign_up(&resp, Utc::now())));
        info!(device = %self.device_id, uid = %resp.uid, "signed up");

        let redirected = !resp.redirecturi.is_empty() && resp.redirecturi != config.url;
        if redirected {
            info!(device = %self.device_id, url = %resp.redirecturi, "cloud redirected device");
            self.modify_configuration(|cfg| cfg.url.clone_from(&resp.redirecturi));
        }
        self.persist();

        if !redirected {
            return Ok(conn);
        }
        self.close_connection();
        self.dial().await
    }

    // ── Token refresh ────────────────────────────────────────────────

    async fn refresh_token(&self, conn: &Arc<dyn Connection>) -> Result<(), CoreError> {
        let creds = self.credentials.load_full();
        let now = Utc::now();
        if !creds.needs_refresh(now, self.settings.refresh_margin) {
            return Ok(());
        }

        let result = CloudClient::new(Arc::clone(conn))
            .refresh_token(&RefreshRequest {
                di: self.device_id.to_string(),
                uid: creds.user_id.clone(),
                refreshtoken: creds.refresh_token.expose_secret().to_owned(),
            })
            .await;

        match result {
            Ok(resp) => {
                self.credentials
                    .store(Arc::new(creds.refreshed(&resp, Utc::now())));
                self.persist();
                debug!(device = %self.device_id, "token refreshed");
                Ok(())
            }
            Err(e) if e.is_unauthorized() => {
                self.cleanup().await;
                Err(CoreError::Unauthorized {
                    message: e.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Sign-in ──────────────────────────────────────────────────────

    async fn sign_in(&self, conn: &Arc<dyn Connection>) -> Result<(), CoreError> {
        let creds = self.credentials.load_full();
        if creds.signed_in {
            return Ok(());
        }
        if !creds.has_access_token() {
            return Err(CoreError::validation("access token must not be empty"));
        }

        let result = CloudClient::new(Arc::clone(conn))
            .sign_in(&SignInRequest {
                di: self.device_id.to_string(),
                uid: creds.user_id.clone(),
                accesstoken: creds.access_token.expose_secret().to_owned(),
                login: true,
            })
            .await;

        match result {
            Ok(resp) => {
                self.credentials
                    .store(Arc::new(creds.signed_in(resp.expiresin, Utc::now())));
                self.persist();
                info!(device = %self.device_id, "signed in");
                Ok(())
            }
            Err(e) if e.is_unauthorized() && !creds.has_refresh_token() => {
                self.cleanup().await;
                Err(CoreError::Unauthorized {
                    message: e.to_string(),
                })
            }
            Err(e) if e.is_unauthorized() => {
                warn!(device = %self.device_id, "sign-in rejected, refreshing token next attempt");
                self.credentials
                    .store(Arc::new(creds.refresh_due(Utc::now())));
                self.persist();
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ── Publish ──────────────────────────────────────────────────────

    async fn publish(&self, conn: &Arc<dyn Connection>) -> Result<(), CoreError> {
        if self.resources_published.load(Ordering::Acquire) {
            return Ok(());
        }

        let anchor = device_anchor(&self.device_id);
        let links = self
            .registry
            .resource_links(LinkFilter::PublishToCloud)
            .into_iter()
            .map(|mut link| {
                if link.has_type(DEVICE_RESOURCE_TYPE) {
                    DEVICE_PATH.clone_into(&mut link.href);
                    link.anchor.clone_from(&anchor);
                }
                link
            })
            .collect::<Vec<_>>();

        CloudClient::new(Arc::clone(conn))
            .publish(&PublishRequest {
                di: self.device_id.to_string(),
                links,
                ttl: 0,
            })
            .await?;

        self.resources_published.store(true, Ordering::Release);
        info!(device = %self.device_id, "resources published");
        Ok(())
    }

    // ── Sign-off ─────────────────────────────────────────────────────

    /// Best-effort deregistration over the live connection. Failures are
    /// logged only; the status always ends `Uninitialized`.
    pub(crate) async fn sign_off(&self) {
        let Some(conn) = self.live_connection() else {
            return;
        };
        let creds = self.credentials.load_full();
        if !creds.has_access_token() {
            return;
        }

        self.set_status(ProvisioningStatus::Deregistering);
        let client = CloudClient::new(conn);
        let device_id = self.device_id.to_string();
        match tokio::time::timeout(
            self.settings.step_timeout,
            client.sign_off(&device_id, &creds.user_id),
        )
        .await
        {
            Ok(Ok(())) => info!(device = %self.device_id, "signed off"),
            Ok(Err(e)) => warn!(device = %self.device_id, error = %e, "sign-off failed"),
            Err(_) => warn!(device = %self.device_id, "sign-off timed out"),
        }
        self.set_status(ProvisioningStatus::Uninitialized);
    }
}
