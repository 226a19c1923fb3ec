use thiserror::Error;

use crate::message::Code;

/// Top-level error type for the `cobridge-api` crate.
///
/// Covers every failure mode of the wire layer: dialing, datagram I/O,
/// framing, CBOR codec, and response-code mismatches. `cobridge-core`
/// wraps these with the protocol step that produced them.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// Could not open a connection to the remote endpoint.
    #[error("Cannot dial {url}: {reason}")]
    Dial { url: String, reason: String },

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No response arrived in time.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The connection was closed locally or by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The URL scheme is not served by this transport.
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// A datagram could not be parsed as (or serialized to) a CoAP message.
    #[error("Malformed message: {0}")]
    Malformed(String),

    // ── Codec ───────────────────────────────────────────────────────
    /// Serializing a payload to CBOR failed.
    #[error("CBOR encode error: {0}")]
    Encode(String),

    /// A payload was not valid CBOR for the expected shape.
    #[error("CBOR decode error: {0}")]
    Decode(String),

    // ── Protocol ────────────────────────────────────────────────────
    /// The remote answered with a code other than the one the exchange
    /// requires. `message` carries the diagnostic payload, if any.
    #[error("Unexpected response code {got} (expected {expected}){}", format_message(.message))]
    UnexpectedCode {
        expected: Code,
        got: Code,
        message: String,
    },
}

fn format_message(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(": {message}")
    }
}

impl Error {
    /// Returns `true` if the remote rejected the session (`4.01`).
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::UnexpectedCode { got, .. } if *got == Code::UNAUTHORIZED)
    }

    /// Returns `true` if the failure is a transport hiccup worth retrying
    /// on the next attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Dial { .. } | Self::Io(_) | Self::Timeout { .. } | Self::ConnectionClosed
        )
    }

    /// Returns `true` for CBOR encode/decode failures.
    pub fn is_codec(&self) -> bool {
        matches!(self, Self::Encode(_) | Self::Decode(_))
    }
}
