// Cloud client
//
// One method per registration exchange. Each method sends a single CBOR
// request over the shared connection and checks for the one response
// code the exchange accepts.

use std::sync::Arc;

use tracing::debug;

use super::models::{
    PublishRequest, RefreshRequest, RefreshResponse, SignInRequest, SignInResponse,
    SignUpRequest, SignUpResponse,
};
use super::{ACCOUNT_PATH, RESOURCE_DIRECTORY_PATH, SESSION_PATH, TOKEN_REFRESH_PATH};
use crate::error::Error;
use crate::message::{Code, Request};
use crate::transport::Connection;

/// Registration client bound to one live connection.
#[derive(Clone)]
pub struct CloudClient {
    connection: Arc<dyn Connection>,
}

impl CloudClient {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }

    /// Register the device with an authorization code.
    pub async fn sign_up(&self, body: &SignUpRequest) -> Result<SignUpResponse, Error> {
        debug!(di = %body.di, provider = %body.authprovider, "signing up");
        let req = Request::post(ACCOUNT_PATH).with_cbor(body)?;
        self.exchange(req, Code::CHANGED).await?.decode()
    }

    /// Open a session with the access token obtained at sign-up.
    pub async fn sign_in(&self, body: &SignInRequest) -> Result<SignInResponse, Error> {
        debug!(di = %body.di, uid = %body.uid, "signing in");
        let req = Request::post(SESSION_PATH).with_cbor(body)?;
        let resp = self.exchange(req, Code::CHANGED).await?;
        // Some services answer a bare 2.04 with no body.
        if resp.payload.is_empty() {
            return Ok(SignInResponse::default());
        }
        resp.decode()
    }

    /// Trade the refresh token for a fresh access token.
    pub async fn refresh_token(&self, body: &RefreshRequest) -> Result<RefreshResponse, Error> {
        debug!(di = %body.di, uid = %body.uid, "refreshing token");
        let req = Request::post(TOKEN_REFRESH_PATH).with_cbor(body)?;
        self.exchange(req, Code::CHANGED).await?.decode()
    }

    /// Publish resource links to the resource directory.
    pub async fn publish(&self, body: &PublishRequest) -> Result<(), Error> {
        debug!(di = %body.di, links = body.links.len(), "publishing resources");
        let req = Request::post(RESOURCE_DIRECTORY_PATH).with_cbor(body)?;
        self.exchange(req, Code::CHANGED).await?;
        Ok(())
    }

    /// Deregister the device.
    pub async fn sign_off(&self, device_id: &str, user_id: &str) -> Result<(), Error> {
        debug!(di = %device_id, uid = %user_id, "signing off");
        let req = Request::delete(ACCOUNT_PATH)
            .with_query("di", device_id)
            .with_query("uid", user_id);
        self.exchange(req, Code::DELETED).await?;
        Ok(())
    }

    async fn exchange(
        &self,
        request: Request,
        expected: Code,
    ) -> Result<crate::message::Response, Error> {
        let path = request.path.clone();
        let resp = self.connection.request(request).await?;
        debug!(path = %path, code = %resp.code, "cloud response");
        resp.expect_code(expected)
    }
}
