//! Websocket control protocol
//!
//! Inbound: `{"request": "SUBSCRIBE" | "UNSUBSCRIBE", "channel": "...", "params": {...}}`
//!
//! Outbound: `{"channel": "...", "message": <event payload | {"error": "..."}>}`

use serde::{Deserialize, Serialize};

use crate::resource::ResourceEvent;
use crate::subscription::SubscribeParams;

/// Decoded client control frame
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// Bind `channel` to a watch
    Subscribe {
        /// Client-chosen channel id
        channel: String,
        /// Watch parameters
        params: SubscribeParams,
    },
    /// Release `channel`
    Unsubscribe {
        /// Client-chosen channel id
        channel: String,
    },
    /// Well-formed envelope whose params could not be decoded
    Invalid {
        /// Channel the error is reported on
        channel: String,
        /// What was wrong
        reason: String,
    },
}

#[derive(Deserialize)]
struct RawClientFrame {
    #[serde(default)]
    request: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

/// Decode a text frame.
///
/// `Err` carries the reason the frame is ignored: invalid JSON, a missing
/// `request` or `channel`, or an unknown request.
pub fn decode_client_frame(text: &str) -> std::result::Result<ClientRequest, String> {
    let raw: RawClientFrame =
        serde_json::from_str(text).map_err(|e| format!("invalid JSON: {}", e))?;

    let request = raw.request.ok_or("missing request")?;
    let channel = raw
        .channel
        .filter(|c| !c.is_empty())
        .ok_or("missing channel")?;

    match request.as_str() {
        "SUBSCRIBE" => {
            let params = raw
                .params
                .filter(|p| !p.is_null())
                .unwrap_or_else(|| serde_json::json!({}));
            match serde_json::from_value(params) {
                Ok(params) => Ok(ClientRequest::Subscribe { channel, params }),
                Err(e) => Ok(ClientRequest::Invalid {
                    channel,
                    reason: format!("invalid params: {}", e),
                }),
            }
        }
        "UNSUBSCRIBE" => Ok(ClientRequest::Unsubscribe { channel }),
        other => Err(format!("unknown request '{}'", other)),
    }
}

/// Frame sent to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    /// Channel the message belongs to
    pub channel: String,
    /// Event payload or `{"error": ...}`
    pub message: serde_json::Value,
}

impl ServerMessage {
    /// Event delivered on `channel`
    pub fn event(channel: impl Into<String>, event: &ResourceEvent) -> Self {
        Self {
            channel: channel.into(),
            message: event.to_message(),
        }
    }

    /// Error delivered on `channel`
    pub fn error(channel: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message: serde_json::json!({ "error": error.into() }),
        }
    }

    /// Encode as a websocket text payload
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"channel":{:?},"message":{{"error":"encoding failed"}}}}"#, self.channel)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_subscribe() {
        let request = decode_client_frame(
            r#"{"request":"SUBSCRIBE","channel":"c1","params":{"token":"t","namespace":"ns1","resourceVersion":"12"}}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            ClientRequest::Subscribe {
                channel: "c1".into(),
                params: SubscribeParams {
                    token: "t".into(),
                    namespace: "ns1".into(),
                    resource_version: Some("12".into()),
                    kind: None,
                },
            }
        );
    }

    #[test]
    fn test_decode_subscribe_with_kind() {
        let request = decode_client_frame(
            r#"{"request":"SUBSCRIBE","channel":"c1","params":{"token":"t","namespace":"ns1","kind":"pods"}}"#,
        )
        .unwrap();
        match request {
            ClientRequest::Subscribe { params, .. } => {
                assert_eq!(params.kind.as_deref(), Some("pods"));
                assert_eq!(params.resource_version, None);
            }
            other => panic!("expected subscribe, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unsubscribe() {
        assert_eq!(
            decode_client_frame(r#"{"request":"UNSUBSCRIBE","channel":"c1"}"#).unwrap(),
            ClientRequest::Unsubscribe {
                channel: "c1".into()
            }
        );
    }

    #[test]
    fn test_decode_ignores_malformed_frames() {
        assert!(decode_client_frame("not json").is_err());
        assert!(decode_client_frame(r#"{"channel":"c1"}"#).is_err());
        assert!(decode_client_frame(r#"{"request":"SUBSCRIBE"}"#).is_err());
        assert!(decode_client_frame(r#"{"request":"SUBSCRIBE","channel":""}"#).is_err());
        assert!(decode_client_frame(r#"{"request":"PUBLISH","channel":"c1"}"#).is_err());
        assert!(decode_client_frame("[1,2]").is_err());
    }

    #[test]
    fn test_decode_bad_params_reported_on_channel() {
        let request =
            decode_client_frame(r#"{"request":"SUBSCRIBE","channel":"c1","params":"oops"}"#)
                .unwrap();
        assert!(matches!(request, ClientRequest::Invalid { ref channel, .. } if channel == "c1"));
    }

    #[test]
    fn test_server_message_encoding() {
        let text = ServerMessage::error("c1", "Unauthorized").to_text();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"channel": "c1", "message": {"error": "Unauthorized"}})
        );
    }
}
