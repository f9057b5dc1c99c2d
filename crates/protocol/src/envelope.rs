//! JSON envelope shared by every message on a persistent connection.

use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Error details carried inside an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
}

/// Envelope for all connection traffic.
///
/// The `payload` field uses `serde_json::value::RawValue` so dispatch can
/// route on `type` without decoding the payload twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Message {
    /// Creates a new message with the given type and payload.
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => {
                let json = serde_json::to_string(p)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: raw,
            error: None,
        })
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Creates an error message.
    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(WireError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Creates a response message for this request.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Message::new(&self.id, msg_type, payload)
    }

    /// Creates an error response for this request.
    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Message::error(&self.id, code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::UploadControlRequest;
    use crate::types::UploadAction;

    #[test]
    fn new_with_payload() {
        let req = UploadControlRequest {
            upload_id: "u-1".into(),
            action: UploadAction::Pause,
        };
        let msg = Message::new("m-1", MessageType::UploadControl, Some(&req)).unwrap();
        assert_eq!(msg.id, "m-1");
        assert_eq!(msg.msg_type, MessageType::UploadControl);
        assert!(msg.error.is_none());

        let parsed: UploadControlRequest = msg.parse_payload().unwrap().unwrap();
        assert_eq!(parsed.upload_id, "u-1");
        assert_eq!(parsed.action, UploadAction::Pause);
    }

    #[test]
    fn new_without_payload() {
        let msg = Message::new::<()>("m-2", MessageType::Ping, None).unwrap();
        assert!(msg.payload.is_none());
    }

    #[test]
    fn error_message() {
        let msg = Message::error("m-3", 4004, "Resource limit exceeded");
        assert_eq!(msg.msg_type, MessageType::Error);
        let err = msg.error.unwrap();
        assert_eq!(err.code, 4004);
        assert_eq!(err.message, "Resource limit exceeded");
    }

    #[test]
    fn json_roundtrip() {
        let msg = Message::error("e-1", 4002, "credential expired");
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "e-1");
        assert_eq!(parsed.msg_type, MessageType::Error);
        assert!(parsed.error.is_some());
        assert!(parsed.payload.is_none());
    }

    #[test]
    fn omits_null_fields() {
        let msg = Message::new::<()>("m-4", MessageType::Pong, None).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("payload"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn reply_preserves_request_id() {
        let req = Message::new::<()>("req-7", MessageType::Ping, None).unwrap();
        let resp = req
            .reply(MessageType::Pong, Some(&serde_json::json!({})))
            .unwrap();
        assert_eq!(resp.id, "req-7");
        assert_eq!(resp.msg_type, MessageType::Pong);

        let err = req.reply_error(4003, "auth backend down");
        assert_eq!(err.id, "req-7");
        assert_eq!(err.msg_type, MessageType::Error);
    }
}
