// ── CoAP message model ──
//
// Transport-neutral request/response types. The UDP transport converts
// these to and from `coap_lite::Packet`; everything above the transport
// only ever sees `Request` and `Response`.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec;
use crate::error::Error;

// ── Method ───────────────────────────────────────────────────────────

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    /// The raw CoAP code byte (`0.0x`).
    pub fn code(self) -> u8 {
        match self {
            Self::Get => 0x01,
            Self::Post => 0x02,
            Self::Put => 0x03,
            Self::Delete => 0x04,
        }
    }

    /// Parse a CoAP request code byte. Returns `None` for methods this
    /// runtime does not serve (FETCH, PATCH, ...).
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Get),
            0x02 => Some(Self::Post),
            0x03 => Some(Self::Put),
            0x04 => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        })
    }
}

// ── Code ─────────────────────────────────────────────────────────────

/// Response code, stored as the raw `class.detail` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(u8);

impl Code {
    pub const CREATED: Self = Self(0x41);
    pub const DELETED: Self = Self(0x42);
    pub const VALID: Self = Self(0x43);
    pub const CHANGED: Self = Self(0x44);
    pub const CONTENT: Self = Self(0x45);
    pub const BAD_REQUEST: Self = Self(0x80);
    pub const UNAUTHORIZED: Self = Self(0x81);
    pub const BAD_OPTION: Self = Self(0x82);
    pub const FORBIDDEN: Self = Self(0x83);
    pub const NOT_FOUND: Self = Self(0x84);
    pub const METHOD_NOT_ALLOWED: Self = Self(0x85);
    pub const NOT_ACCEPTABLE: Self = Self(0x86);
    pub const UNSUPPORTED_CONTENT_FORMAT: Self = Self(0x8F);
    pub const INTERNAL_SERVER_ERROR: Self = Self(0xA0);
    pub const NOT_IMPLEMENTED: Self = Self(0xA1);
    pub const SERVICE_UNAVAILABLE: Self = Self(0xA3);
    pub const GATEWAY_TIMEOUT: Self = Self(0xA4);

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    pub const fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// `2.xx` codes.
    pub const fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

// ── ContentFormat ────────────────────────────────────────────────────

/// Content-Format option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    pub const TEXT_PLAIN: Self = Self(0);
    pub const LINK_FORMAT: Self = Self(40);
    pub const JSON: Self = Self(50);
    pub const CBOR: Self = Self(60);
    pub const VND_OCF_CBOR: Self = Self(10000);

    pub fn is_cbor(self) -> bool {
        self == Self::CBOR || self == Self::VND_OCF_CBOR
    }
}

// ── Request ──────────────────────────────────────────────────────────

/// A CoAP request, inbound or outbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Absolute path, always starting with `/`.
    pub path: String,
    /// Raw `Uri-Query` segments, e.g. `di=...`.
    pub queries: Vec<String>,
    /// Observe option: `0` registers, `1` deregisters.
    pub observe: Option<u32>,
    pub content_format: Option<ContentFormat>,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        Self {
            method,
            path,
            queries: Vec::new(),
            observe: None,
            content_format: None,
            payload: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Append a `key=value` query segment.
    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.queries.push(format!("{key}={value}"));
        self
    }

    pub fn with_observe(mut self, observe: u32) -> Self {
        self.observe = Some(observe);
        self
    }

    /// Encode `body` as CBOR and attach it as the payload.
    pub fn with_cbor<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, Error> {
        self.payload = codec::encode(body)?;
        self.content_format = Some(ContentFormat::CBOR);
        Ok(self)
    }

    /// Value of the first `key=value` query segment for `key`.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.queries.iter().find_map(|q| {
            let (k, v) = q.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Decode the CBOR payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        codec::decode(&self.payload)
    }
}

// ── Response ─────────────────────────────────────────────────────────

/// A CoAP response or observe notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: Code,
    pub content_format: Option<ContentFormat>,
    pub payload: Vec<u8>,
    /// Entity-tag, carried on the wire as 8 big-endian bytes.
    pub etag: Option<u64>,
    /// Observe sequence number (notifications and the registration reply).
    pub observe: Option<u32>,
}

impl Response {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            content_format: None,
            payload: Vec::new(),
            etag: None,
            observe: None,
        }
    }

    /// A response whose payload is `body` encoded as CBOR.
    pub fn cbor<T: Serialize + ?Sized>(code: Code, body: &T) -> Result<Self, Error> {
        Ok(Self {
            content_format: Some(ContentFormat::CBOR),
            payload: codec::encode(body)?,
            ..Self::new(code)
        })
    }

    /// A response carrying a plain-text diagnostic.
    pub fn text(code: Code, message: impl Into<String>) -> Self {
        Self {
            content_format: Some(ContentFormat::TEXT_PLAIN),
            payload: message.into().into_bytes(),
            ..Self::new(code)
        }
    }

    pub fn with_etag(mut self, etag: u64) -> Self {
        self.etag = Some(etag);
        self
    }

    pub fn with_observe(mut self, observe: u32) -> Self {
        self.observe = Some(observe);
        self
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Decode the CBOR payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        codec::decode(&self.payload)
    }

    /// Lossy UTF-8 rendering of the payload, for diagnostics.
    pub fn text_payload(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Fail with [`Error::UnexpectedCode`] unless the code is `expected`.
    pub fn expect_code(self, expected: Code) -> Result<Self, Error> {
        if self.code == expected {
            return Ok(self);
        }
        let message = if self.content_format.is_some_and(ContentFormat::is_cbor) {
            String::new()
        } else {
            self.text_payload()
        };
        Err(Error::UnexpectedCode {
            expected,
            got: self.code,
            message,
        })
    }
}
