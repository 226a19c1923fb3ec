// ── Core error types ──
//
// Errors surfaced by the resource engine and the cloud manager. Wire
// failures from `cobridge-api` are wrapped as-is; protocol step failures
// carry the step that produced them.

use thiserror::Error;

use crate::cloud::Step;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Input errors ─────────────────────────────────────────────────
    /// Rejected input. Never retried.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    // ── Wire errors ──────────────────────────────────────────────────
    #[error(transparent)]
    Api(#[from] cobridge_api::Error),

    // ── Protocol errors ──────────────────────────────────────────────
    /// A named `connect` step failed.
    #[error("cannot {step}: {source}")]
    Step {
        step: Step,
        #[source]
        source: Box<CoreError>,
    },

    /// The cloud invalidated the session and the configuration was cleared.
    #[error("Credentials rejected by the cloud: {message}")]
    Unauthorized { message: String },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Cloud manager closed")]
    Closed,
}

// ── Last error codes ─────────────────────────────────────────────────

/// `clec` values exposed on the configuration resource.
pub mod clec {
    pub const NONE: i64 = 0;
    pub const UNEXPECTED_RESPONSE: i64 = 1;
    pub const NO_RESPONSE: i64 = 2;
    pub const INVALID_CREDENTIALS: i64 = 3;
    pub const OTHER: i64 = 4;
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Wrap `self` as a failure of `step`.
    pub fn in_step(self, step: Step) -> Self {
        Self::Step {
            step,
            source: Box::new(self),
        }
    }

    /// Returns `true` if the cloud answered `4.01` anywhere in the chain.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Api(e) => e.is_unauthorized(),
            Self::Step { source, .. } => source.is_unauthorized(),
            Self::Unauthorized { .. } => true,
            Self::Validation { .. } | Self::Closed => false,
        }
    }

    /// The step that failed, if this is a step error.
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Map to the `clec` value recorded after a failed attempt.
    pub fn last_error_code(&self) -> i64 {
        match self {
            Self::Step { source, .. } => source.last_error_code(),
            Self::Validation { .. } | Self::Unauthorized { .. } => clec::INVALID_CREDENTIALS,
            Self::Api(e) if e.is_unauthorized() => clec::INVALID_CREDENTIALS,
            Self::Api(e) if e.is_transient() => clec::NO_RESPONSE,
            Self::Api(cobridge_api::Error::UnexpectedCode { .. }) => clec::UNEXPECTED_RESPONSE,
            Self::Api(e) if e.is_codec() => clec::UNEXPECTED_RESPONSE,
            Self::Api(_) | Self::Closed => clec::OTHER,
        }
    }
}
