//! The envelope every message crosses the bus wrapped in, plus the minimum
//! control-payload registry every implementation must carry (SPEC_FULL.md
//! §4.B / §6).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sentinel request id meaning "do not treat this reply as matching any
/// request" — a reply constructed with this value is deliberately never
/// rewritten to carry the request's id, so the original caller's wait
/// correctly times out. See [`Envelope::stamp_reply`].
pub const IGNORE_REQUEST_ID: i64 = -1;

/// `request_id` value meaning "unset / not a request or reply".
pub const UNSET_REQUEST_ID: i64 = 0;

pub mod kind {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SUCCESS: &str = "success";
    pub const IGNORE: &str = "ignore";
    pub const STOP_REQUEST: &str = "stop_request";
    pub const START_COMPONENT_REQUEST: &str = "start_component_request";
    pub const COMPONENT_STARTED: &str = "component_started";
    pub const NOT_STARTED: &str = "not_started";
    pub const STOP_COMPONENT_REQUEST: &str = "stop_component_request";
    pub const LOG_MESSAGE: &str = "log_message";
    pub const CONF_MESSAGE: &str = "conf_message";
    pub const TEXT_MESSAGE: &str = "text_message";
    pub const TEXT_REQUEST: &str = "text_request";
    /// `Connector::connect` (SPEC_FULL.md §4.G): asks a running component to
    /// additionally subscribe its input handling to another channel,
    /// typically a peer component's output channel.
    pub const CONNECT_INPUT_REQUEST: &str = "connect_input_request";
}

/// The wire record: kind tag, origin timestamp, source-filtering metadata,
/// request correlation id, and an opaque JSON payload body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    #[serde(default)]
    pub timestamp_secs: f64,
    #[serde(default)]
    pub previous_component_name: String,
    #[serde(default)]
    pub request_id: i64,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp_secs: 0.0,
            previous_component_name: String::new(),
            request_id: UNSET_REQUEST_ID,
            payload,
        }
    }

    pub fn with_timestamp(mut self, timestamp_secs: f64) -> Self {
        self.timestamp_secs = timestamp_secs;
        self
    }

    pub fn with_previous_component(mut self, name: impl Into<String>) -> Self {
        self.previous_component_name = name.into();
        self
    }

    pub fn with_request_id(mut self, request_id: i64) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self.kind.as_str(),
            kind::PING
                | kind::STOP_REQUEST
                | kind::START_COMPONENT_REQUEST
                | kind::STOP_COMPONENT_REQUEST
                | kind::TEXT_REQUEST
                | kind::CONNECT_INPUT_REQUEST
        )
    }

    /// Assign `request_id` to a reply envelope unless it was explicitly
    /// built with the ignore sentinel — preserves the "-1 never gets
    /// rewritten" protocol rule exactly.
    pub fn stamp_reply(mut self, request_id: i64) -> Self {
        if self.request_id != IGNORE_REQUEST_ID {
            self.request_id = request_id;
        }
        self
    }

    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(Error::Serde)
    }
}

/// The required control-payload set, typed. Anything outside this set still
/// round-trips as an [`Envelope`] with a raw `serde_json::Value` payload;
/// callers decode domain kinds with their own schema (see [`KindRegistry`]
/// for the general extension mechanism).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlPayload {
    Ping,
    Pong,
    Success,
    Ignore,
    StopRequest,
    StartComponentRequest {
        component_name: String,
        input_channel: String,
        client_id: String,
        #[serde(default)]
        config: serde_json::Value,
    },
    ComponentStarted {
        output_channel: String,
        request_reply_channel: String,
    },
    NotStarted {
        reason: String,
    },
    StopComponentRequest {
        output_channel: String,
    },
    LogMessage {
        text: String,
    },
    ConfMessage {
        config: serde_json::Value,
    },
    TextMessage {
        text: String,
    },
    TextRequest {
        text: String,
    },
    ConnectInputRequest {
        channel: String,
    },
}

impl ControlPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlPayload::Ping => kind::PING,
            ControlPayload::Pong => kind::PONG,
            ControlPayload::Success => kind::SUCCESS,
            ControlPayload::Ignore => kind::IGNORE,
            ControlPayload::StopRequest => kind::STOP_REQUEST,
            ControlPayload::StartComponentRequest { .. } => kind::START_COMPONENT_REQUEST,
            ControlPayload::ComponentStarted { .. } => kind::COMPONENT_STARTED,
            ControlPayload::NotStarted { .. } => kind::NOT_STARTED,
            ControlPayload::StopComponentRequest { .. } => kind::STOP_COMPONENT_REQUEST,
            ControlPayload::LogMessage { .. } => kind::LOG_MESSAGE,
            ControlPayload::ConfMessage { .. } => kind::CONF_MESSAGE,
            ControlPayload::TextMessage { .. } => kind::TEXT_MESSAGE,
            ControlPayload::TextRequest { .. } => kind::TEXT_REQUEST,
            ControlPayload::ConnectInputRequest { .. } => kind::CONNECT_INPUT_REQUEST,
        }
    }

    pub fn into_envelope(self) -> Result<Envelope> {
        let kind = self.kind().to_string();
        let payload = serde_json::to_value(&self).map_err(Error::Serde)?;
        Ok(Envelope::new(kind, payload))
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let mut value = envelope.payload.clone();
        if let serde_json::Value::Object(ref mut map) = value {
            map.insert("kind".to_string(), serde_json::Value::String(envelope.kind.clone()));
        }
        serde_json::from_value(value).map_err(|_| Error::UnknownMessageKind {
            kind: envelope.kind.clone(),
        })
    }
}

type DecodeFn = Arc<dyn Fn(&serde_json::Value) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// Maps a payload-kind tag to a decoder, the Rust analogue of the
/// name-keyed message-type registry the upstream system this is compatible
/// with uses: extend it with domain kinds without touching this crate.
#[derive(Clone, Default)]
pub struct KindRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populated with the control-payload kinds every implementation must
    /// carry (SPEC_FULL.md §6).
    pub fn with_control_payloads() -> Self {
        let mut registry = Self::new();
        for k in [
            kind::PING,
            kind::PONG,
            kind::SUCCESS,
            kind::IGNORE,
            kind::STOP_REQUEST,
            kind::START_COMPONENT_REQUEST,
            kind::COMPONENT_STARTED,
            kind::NOT_STARTED,
            kind::STOP_COMPONENT_REQUEST,
            kind::LOG_MESSAGE,
            kind::CONF_MESSAGE,
            kind::TEXT_MESSAGE,
            kind::TEXT_REQUEST,
            kind::CONNECT_INPUT_REQUEST,
        ] {
            registry.register_raw(k, |value| {
                let payload: ControlPayload = serde_json::from_value(value.clone())
                    .map_err(|e| Error::Serde(e))?;
                Ok(Box::new(payload) as Box<dyn Any + Send + Sync>)
            });
        }
        registry
    }

    pub fn register<T>(&mut self, kind: impl Into<String>)
    where
        T: serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        self.register_raw(kind.into(), |value| {
            let payload: T = serde_json::from_value(value.clone()).map_err(Error::Serde)?;
            Ok(Box::new(payload) as Box<dyn Any + Send + Sync>)
        });
    }

    fn register_raw(
        &mut self,
        kind: impl Into<String>,
        decode: impl Fn(&serde_json::Value) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync + 'static,
    ) {
        self.decoders.insert(kind.into(), Arc::new(decode));
    }

    pub fn decode(&self, envelope: &Envelope) -> Result<Box<dyn Any + Send + Sync>> {
        let decoder = self
            .decoders
            .get(&envelope.kind)
            .ok_or_else(|| Error::UnknownMessageKind {
                kind: envelope.kind.clone(),
            })?;
        decoder(&envelope.payload)
    }

    pub fn decode_typed<T: 'static>(&self, envelope: &Envelope) -> Result<T> {
        let boxed = self.decode(envelope)?;
        boxed
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| Error::UnknownMessageKind {
                kind: envelope.kind.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip_preserves_fields() {
        let envelope = Envelope::new(kind::PING, serde_json::json!({}))
            .with_timestamp(10.5)
            .with_previous_component(String::from("Camera"))
            .with_request_id(42);
        let json = serde_json::to_string(&envelope).unwrap();
        let restored: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.kind, envelope.kind);
        assert_eq!(restored.timestamp_secs, envelope.timestamp_secs);
        assert_eq!(restored.previous_component_name, envelope.previous_component_name);
        assert_eq!(restored.request_id, envelope.request_id);
    }

    #[test]
    fn ignore_sentinel_is_never_rewritten() {
        let reply = Envelope::new(kind::IGNORE, serde_json::json!({})).with_request_id(IGNORE_REQUEST_ID);
        let stamped = reply.stamp_reply(999);
        assert_eq!(stamped.request_id, IGNORE_REQUEST_ID);
    }

    #[test]
    fn unstamped_reply_inherits_request_id() {
        let reply = Envelope::new(kind::PONG, serde_json::json!({}));
        let stamped = reply.stamp_reply(999);
        assert_eq!(stamped.request_id, 999);
    }

    #[test]
    fn control_payload_roundtrips_through_envelope() {
        let payload = ControlPayload::ComponentStarted {
            output_channel: "Echo:10.0.0.2".into(),
            request_reply_channel: "Echo:reqreply:10.0.0.2".into(),
        };
        let envelope = payload.clone().into_envelope().unwrap();
        assert_eq!(envelope.kind, kind::COMPONENT_STARTED);
        let decoded = ControlPayload::from_envelope(&envelope).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn registry_decodes_registered_kind() {
        let registry = KindRegistry::with_control_payloads();
        let envelope = ControlPayload::Pong.into_envelope().unwrap();
        let decoded: ControlPayload = registry.decode_typed(&envelope).unwrap();
        assert_eq!(decoded, ControlPayload::Pong);
    }

    #[test]
    fn registry_rejects_unknown_kind() {
        let registry = KindRegistry::with_control_payloads();
        let envelope = Envelope::new("totally_unknown_kind", serde_json::json!({}));
        let err = registry.decode(&envelope).unwrap_err();
        assert!(matches!(err, Error::UnknownMessageKind { .. }));
    }
}
