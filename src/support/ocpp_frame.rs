//! OCPP-J message framing
//!
//! The OCPP-J transport envelope is an ordered JSON array:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use serde_json::{json, Value};
use thiserror::Error;

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// A parsed OCPP-J frame.
#[derive(Debug, Clone)]
pub enum OcppFrame {
    /// `[2, uniqueId, action, payload]`
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    /// `[3, uniqueId, payload]`
    CallResult { unique_id: String, payload: Value },
    /// `[4, uniqueId, errorCode, errorDescription, errorDetails]`
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

/// Errors produced while parsing an OCPP-J frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame is not a JSON array")]
    NotAnArray,
    #[error("message type is missing or not a number")]
    InvalidMessageType,
    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),
    #[error("expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },
    #[error("field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),
}

impl OcppFrame {
    /// Parse raw JSON text into an [`OcppFrame`].
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let arr = value.as_array().ok_or(FrameError::NotAnArray)?;
        let msg_type = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or(FrameError::InvalidMessageType)?;

        let require = |n: usize| {
            if arr.len() < n {
                Err(FrameError::MissingFields {
                    expected: n,
                    got: arr.len(),
                })
            } else {
                Ok(())
            }
        };
        let string_at = |i: usize, what: &'static str| {
            arr.get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(FrameError::FieldTypeMismatch(what))
        };

        match msg_type {
            MSG_TYPE_CALL => {
                require(4)?;
                Ok(Self::Call {
                    unique_id: string_at(1, "uniqueId must be a string")?,
                    action: string_at(2, "action must be a string")?,
                    payload: arr[3].clone(),
                })
            }
            MSG_TYPE_CALL_RESULT => {
                require(3)?;
                Ok(Self::CallResult {
                    unique_id: string_at(1, "uniqueId must be a string")?,
                    payload: arr[2].clone(),
                })
            }
            MSG_TYPE_CALL_ERROR => {
                require(4)?;
                Ok(Self::CallError {
                    unique_id: string_at(1, "uniqueId must be a string")?,
                    error_code: arr[2].as_str().unwrap_or("InternalError").to_string(),
                    error_description: arr[3].as_str().unwrap_or("").to_string(),
                    error_details: arr.get(4).cloned().unwrap_or_else(|| json!({})),
                })
            }
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    /// The frame as a JSON array value (used for traffic logging).
    pub fn to_value(&self) -> Value {
        match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => json!([MSG_TYPE_CALL, unique_id, action, payload]),
            Self::CallResult { unique_id, payload } => {
                json!([MSG_TYPE_CALL_RESULT, unique_id, payload])
            }
            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => json!([
                MSG_TYPE_CALL_ERROR,
                unique_id,
                error_code,
                error_description,
                error_details
            ]),
        }
    }

    /// Serialize this frame to wire text.
    pub fn serialize(&self) -> String {
        // serde_json::to_string on a Value never fails
        serde_json::to_string(&self.to_value()).unwrap()
    }

    /// Build a server-originated Call frame with a fresh unique id.
    pub fn call(action: impl Into<String>, payload: Value) -> Self {
        Self::Call {
            unique_id: uuid::Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
        }
    }

    /// Build the CallResult answering `unique_id`.
    pub fn result(unique_id: impl Into<String>, payload: Value) -> Self {
        Self::CallResult {
            unique_id: unique_id.into(),
            payload,
        }
    }

    /// Build a CallError answering `unique_id`.
    pub fn error(
        unique_id: impl Into<String>,
        error_code: impl Into<String>,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error_code.into(),
            error_description: error_description.into(),
            error_details: json!({}),
        }
    }

    /// Get the unique message id.
    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_call() {
        let text = r#"[2,"abc123","BootNotification",{"chargePointVendor":"Vendor","chargePointModel":"Model"}]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(action, "BootNotification");
                assert_eq!(payload["chargePointVendor"], "Vendor");
            }
            other => panic!("expected Call, got {:?}", other),
        }
    }

    #[test]
    fn parse_call_result() {
        let text = r#"[3,"abc123",{"status":"Accepted","interval":300}]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "abc123");
                assert_eq!(payload["status"], "Accepted");
            }
            other => panic!("expected CallResult, got {:?}", other),
        }
    }

    #[test]
    fn parse_call_error_defaults_missing_details() {
        let text = r#"[4,"abc123","NotImplemented","Action not supported"]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::CallError {
                error_code,
                error_details,
                ..
            } => {
                assert_eq!(error_code, "NotImplemented");
                assert_eq!(error_details, json!({}));
            }
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_message_type() {
        assert!(matches!(
            OcppFrame::parse(r#"[9,"x","y",{}]"#),
            Err(FrameError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn rejects_non_array() {
        assert!(matches!(
            OcppFrame::parse(r#"{"type":2}"#),
            Err(FrameError::NotAnArray)
        ));
    }

    #[test]
    fn roundtrip_call() {
        let frame = OcppFrame::call("RemoteStartTransaction", json!({"idTag": "TAG1"}));
        let id = frame.unique_id().to_string();
        let parsed = OcppFrame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.unique_id(), id);
        assert!(matches!(parsed, OcppFrame::Call { .. }));
    }

    #[test]
    fn roundtrip_error() {
        let frame = OcppFrame::error("id3", "GenericError", "boom");
        let parsed = OcppFrame::parse(&frame.serialize()).unwrap();
        assert!(matches!(parsed, OcppFrame::CallError { .. }));
        assert_eq!(parsed.unique_id(), "id3");
    }
}
