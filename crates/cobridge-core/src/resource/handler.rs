// Handler signatures for resource endpoints.

use std::fmt;
use std::sync::Arc;

use cobridge_api::{Code, Request, Response};

use super::observe::Notifier;
use crate::error::CoreError;

/// A handler failure, answered as `code` with `message` as plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: Code,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Code::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::INTERNAL_SERVER_ERROR, message)
    }

    pub fn into_response(self) -> Response {
        Response::text(self.code, self.message)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

impl From<cobridge_api::Error> for HandlerError {
    fn from(err: cobridge_api::Error) -> Self {
        if err.is_codec() {
            Self::bad_request(err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

impl From<CoreError> for HandlerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation { .. } => Self::bad_request(err.to_string()),
            CoreError::Api(e) => e.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

pub type HandlerResult = Result<Response, HandlerError>;

/// Serves plain GETs.
pub type GetHandler = Arc<dyn Fn(&Request) -> HandlerResult + Send + Sync>;

/// Serves POSTs.
pub type PostHandler = Arc<dyn Fn(&Request) -> HandlerResult + Send + Sync>;

/// Starts an observation. The `Notifier` pushes subsequent states; the
/// returned `Observation` is cancelled when the subscription ends.
pub type ObserveHandler =
    Arc<dyn Fn(&Request, Notifier) -> Result<Observation, HandlerError> + Send + Sync>;

/// Runs after a successful POST, once the entity-tag has been regenerated.
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

/// Teardown hook for one observation.
pub struct Observation {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Observation {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub(crate) fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
