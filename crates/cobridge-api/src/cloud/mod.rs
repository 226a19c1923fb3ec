// Cloud registration wire client
//
// Request/response payloads and the thin client that performs one
// protocol exchange per call. Sequencing, retries, and credential
// bookkeeping live in `cobridge-core`.

pub mod client;
pub mod models;

pub use client::CloudClient;

// ── Well-known paths ─────────────────────────────────────────────────

pub const ACCOUNT_PATH: &str = "/oic/sec/account";
pub const SESSION_PATH: &str = "/oic/sec/session";
pub const TOKEN_REFRESH_PATH: &str = "/oic/sec/tokenrefresh";
pub const RESOURCE_DIRECTORY_PATH: &str = "/oic/rd";
pub const DEVICE_PATH: &str = "/oic/d";
pub const DISCOVERY_PATH: &str = "/oic/res";
