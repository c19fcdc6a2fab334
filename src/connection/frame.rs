//! Wire frames for the bidirectional protocol.
//!
//! Every frame is a JSON object:
//! `{ "type": ..., "id"?, "method"?, "data"?, "timestamp" }`.
//! Requests carry a caller-chosen unique `id`; responses echo it. Event
//! frames carry the event tag in `method`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::JsonMap;

/// Logical frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Request,
    Response,
    Event,
    Error,
    Handshake,
}

/// A single protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,

    /// Correlation id; present on requests and their responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Request method, or event tag on event frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Unix seconds at send time.
    pub timestamp: f64,
}

impl Frame {
    pub fn request(id: &str, method: &str, data: JsonMap) -> Self {
        Self {
            frame_type: FrameType::Request,
            id: Some(id.to_string()),
            method: Some(method.to_string()),
            data: Some(Value::Object(data)),
            timestamp: now_secs(),
        }
    }

    pub fn event(method: &str, data: JsonMap) -> Self {
        Self {
            frame_type: FrameType::Event,
            id: None,
            method: Some(method.to_string()),
            data: Some(Value::Object(data)),
            timestamp: now_secs(),
        }
    }

    /// Application-level handshake sent right after the socket opens.
    pub fn handshake(client_name: &str, auth_token: Option<&str>) -> Self {
        let mut data = JsonMap::new();
        data.insert("version".to_string(), Value::from("1.0"));
        data.insert("client".to_string(), Value::from(client_name));
        if let Some(token) = auth_token {
            data.insert("auth".to_string(), Value::from(token));
        }
        Self {
            frame_type: FrameType::Handshake,
            id: None,
            method: None,
            data: Some(Value::Object(data)),
            timestamp: now_secs(),
        }
    }

    /// The `data` object, or an empty map for absent/non-object data.
    pub fn data_object(&self) -> JsonMap {
        self.data
            .as_ref()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default()
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
