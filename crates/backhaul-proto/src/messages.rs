//! Serializable HTTP exchange heads
//!
//! Only the fields a proxy needs survive serialization; bodies travel
//! separately as a single binary frame per direction.

use crate::UPSTREAM_ERROR_STATUS;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Serializable request line, headers and metadata of an HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Declared body length; -1 when unknown.
    pub content_length: i64,
}

impl RequestHead {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Serializable status line, headers and metadata of an HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Declared body length; -1 when unknown.
    pub content_length: i64,
}

impl ResponseHead {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Structured error response sent back through the tunnel when the
    /// executor could not run the request against its upstream.
    pub fn upstream_error(message: &str) -> (ResponseHead, Bytes) {
        let body = Bytes::copy_from_slice(message.as_bytes());
        let head = ResponseHead {
            status: UPSTREAM_ERROR_STATUS,
            headers: Vec::new(),
            content_length: body.len() as i64,
        };
        (head, body)
    }
}
