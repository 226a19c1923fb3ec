// ── Cloud credentials ──
//
// Tokens obtained from sign-up and refresh. Held behind `ArcSwap` by the
// manager: the runner publishes whole new values, readers take a snapshot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use cobridge_api::cloud::models::{RefreshResponse, SignUpResponse};

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_token: SecretString,
    pub user_id: String,
    pub refresh_token: SecretString,
    /// Lifetime reported by the cloud, in seconds. `-1` never expires.
    pub expires_in: i64,
    /// `None` when the token never expires.
    pub valid_until: Option<DateTime<Utc>>,
    /// Signed in on the current connection. Never persisted.
    pub signed_in: bool,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            access_token: SecretString::from(String::new()),
            user_id: String::new(),
            refresh_token: SecretString::from(String::new()),
            expires_in: 0,
            valid_until: None,
            signed_in: false,
        }
    }
}

/// `expires_in` value of a token that never expires.
pub const NEVER_EXPIRES: i64 = -1;

// Any other non-positive lifetime is already expired.
fn validity(expires_in: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if expires_in == NEVER_EXPIRES {
        return None;
    }
    Some(now + chrono::Duration::seconds(expires_in.max(0)))
}

impl Credentials {
    pub fn has_access_token(&self) -> bool {
        !self.access_token.expose_secret().is_empty()
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.expose_secret().is_empty()
    }

    /// Credentials issued by a successful sign-up.
    pub fn from_sign_up(resp: &SignUpResponse, now: DateTime<Utc>) -> Self {
        Self {
            access_token: SecretString::from(resp.accesstoken.clone()),
            user_id: resp.uid.clone(),
            refresh_token: SecretString::from(resp.refreshtoken.clone()),
            expires_in: resp.expiresin,
            valid_until: validity(resp.expiresin, now),
            signed_in: false,
        }
    }

    /// Mark signed in. Without a reported lifetime the current validity
    /// stands.
    pub fn signed_in(&self, expires_in: Option<i64>, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.signed_in = true;
        if let Some(expires_in) = expires_in {
            next.expires_in = expires_in;
            next.valid_until = validity(expires_in, now);
        }
        next
    }

    /// Apply a refresh result. The session must be re-established.
    pub fn refreshed(&self, resp: &RefreshResponse, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.access_token = SecretString::from(resp.accesstoken.clone());
        if !resp.refreshtoken.is_empty() {
            next.refresh_token = SecretString::from(resp.refreshtoken.clone());
        }
        next.expires_in = resp.expiresin;
        next.valid_until = validity(resp.expiresin, now);
        next.signed_in = false;
        next
    }

    /// Force a refresh before the next sign-in.
    pub fn refresh_due(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.valid_until = Some(now);
        next.signed_in = false;
        next
    }

    /// Copy with the per-connection session flag cleared.
    pub fn signed_out(&self) -> Self {
        let mut next = self.clone();
        next.signed_in = false;
        next
    }

    /// `true` once `now` is within `margin` of expiry and a refresh token
    /// is held.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        if !self.has_refresh_token() {
            return false;
        }
        let Some(valid_until) = self.valid_until else {
            return false;
        };
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        now >= valid_until - margin
    }

    pub fn to_record(&self) -> CredentialsRecord {
        CredentialsRecord {
            access_token: self.access_token.expose_secret().to_owned(),
            user_id: self.user_id.clone(),
            refresh_token: self.refresh_token.expose_secret().to_owned(),
            expires_in: self.expires_in,
            valid_until: self.valid_until,
        }
    }
}

// ── Persistence ──────────────────────────────────────────────────────

/// On-disk form of [`Credentials`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsRecord {
    pub access_token: String,
    pub user_id: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub valid_until: Option<DateTime<Utc>>,
}

impl From<CredentialsRecord> for Credentials {
    fn from(record: CredentialsRecord) -> Self {
        Self {
            access_token: SecretString::from(record.access_token),
            user_id: record.user_id,
            refresh_token: SecretString::from(record.refresh_token),
            expires_in: record.expires_in,
            valid_until: record.valid_until,
            signed_in: false,
        }
    }
}
