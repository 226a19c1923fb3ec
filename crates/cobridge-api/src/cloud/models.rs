// Wire payloads for the cloud registration exchanges.
//
// Field names follow the wire keys exactly; everything is CBOR-encoded.

use serde::{Deserialize, Serialize};

use crate::link::ResourceLink;

// ── Sign-up ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub di: String,
    pub accesstoken: String,
    pub authprovider: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpResponse {
    pub accesstoken: String,
    pub uid: String,
    #[serde(default)]
    pub refreshtoken: String,
    /// Alternate cloud endpoint the device must move to, if any.
    #[serde(default)]
    pub redirecturi: String,
    /// Seconds until the access token expires; `-1` never expires and a
    /// missing value counts as already expired.
    #[serde(default)]
    pub expiresin: i64,
}

// ── Sign-in ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInRequest {
    pub di: String,
    pub uid: String,
    pub accesstoken: String,
    pub login: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInResponse {
    /// Absent when the cloud keeps the sign-up lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiresin: Option<i64>,
}

// ── Token refresh ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub di: String,
    pub uid: String,
    pub refreshtoken: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub accesstoken: String,
    #[serde(default)]
    pub refreshtoken: String,
    #[serde(default)]
    pub expiresin: i64,
}

// ── Resource publication ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub di: String,
    pub links: Vec<ResourceLink>,
    pub ttl: u32,
}
