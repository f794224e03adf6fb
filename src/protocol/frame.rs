//! OCPP-J frame codec.
//!
//! Every frame is a JSON array whose first element is the message type.
//!
//! | Type | Shape |
//! |------|-------|
//! | CALL (2) | `[2, "id", "Command", {payload}]` |
//! | CALL_RESULT (3) | `[3, "id", {payload}]` |
//! | CALL_ERROR (4) | `[4, "id", "ErrorCode", "description", {details}]` |

// ============================================================================
// Imports
// ============================================================================

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::identifiers::MessageId;

use super::ErrorCode;

// ============================================================================
// MessageType
// ============================================================================

/// Discriminator in the first array slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Request expecting a reply.
    Call,
    /// Successful reply.
    CallResult,
    /// Error reply.
    CallError,
}

impl MessageType {
    /// Returns the numeric wire value.
    #[inline]
    #[must_use]
    pub const fn code(&self) -> u64 {
        match self {
            Self::Call => 2,
            Self::CallResult => 3,
            Self::CallError => 4,
        }
    }

    /// Maps a numeric wire value to a message type.
    #[inline]
    #[must_use]
    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            2 => Some(Self::Call),
            3 => Some(Self::CallResult),
            4 => Some(Self::CallError),
            _ => None,
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Request from either side.
    Call {
        /// Correlation ID.
        id: MessageId,
        /// Command (action) name.
        command: String,
        /// Command payload.
        payload: Value,
    },
    /// Successful response.
    CallResult {
        /// Correlation ID of the CALL being answered.
        id: MessageId,
        /// Response payload.
        payload: Value,
    },
    /// Error response.
    CallError {
        /// Correlation ID of the CALL being answered.
        id: MessageId,
        /// Error code.
        code: ErrorCode,
        /// Human readable description.
        description: String,
        /// Free-form details.
        details: Value,
    },
}

impl Frame {
    /// Creates a CALL frame.
    #[inline]
    #[must_use]
    pub fn call(id: MessageId, command: impl Into<String>, payload: Value) -> Self {
        Self::Call {
            id,
            command: command.into(),
            payload,
        }
    }

    /// Creates a CALL_RESULT frame.
    #[inline]
    #[must_use]
    pub fn call_result(id: MessageId, payload: Value) -> Self {
        Self::CallResult { id, payload }
    }

    /// Creates a CALL_ERROR frame.
    #[inline]
    #[must_use]
    pub fn call_error(
        id: MessageId,
        code: ErrorCode,
        description: impl Into<String>,
        details: Value,
    ) -> Self {
        Self::CallError {
            id,
            code,
            description: description.into(),
            details,
        }
    }

    /// Returns the message type of this frame.
    #[inline]
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Call { .. } => MessageType::Call,
            Self::CallResult { .. } => MessageType::CallResult,
            Self::CallError { .. } => MessageType::CallError,
        }
    }

    /// Returns the correlation ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &MessageId {
        match self {
            Self::Call { id, .. } | Self::CallResult { id, .. } | Self::CallError { id, .. } => id,
        }
    }

    /// Decodes a frame from UTF-8 JSON text.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the text is not JSON
    /// - [`Error::UnknownMessageType`] if the type slot is not 2, 3 or 4
    /// - [`Error::Protocol`] if the array shape does not match the type
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Array(items) = value else {
            return Err(Error::protocol("frame is not a JSON array"));
        };

        let message_type = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::protocol("missing or non-numeric message type"))?;
        let message_type = MessageType::from_code(message_type)
            .ok_or(Error::UnknownMessageType { message_type })?;

        let id = match items.get(1) {
            Some(Value::String(id)) => MessageId::from(id.as_str()),
            _ => return Err(Error::protocol("missing or non-string message id")),
        };

        let mut fields = items.into_iter().skip(2);

        match message_type {
            MessageType::Call => {
                let command = match fields.next() {
                    Some(Value::String(command)) => command,
                    _ => return Err(Error::protocol(format!("CALL {id}: missing command"))),
                };
                let payload = fields.next().unwrap_or(Value::Object(Default::default()));
                Ok(Self::Call {
                    id,
                    command,
                    payload,
                })
            }
            MessageType::CallResult => {
                let payload = fields.next().unwrap_or(Value::Null);
                Ok(Self::CallResult { id, payload })
            }
            MessageType::CallError => {
                let code = match fields.next() {
                    Some(Value::String(code)) => ErrorCode::from_wire(&code),
                    _ => {
                        return Err(Error::protocol(format!(
                            "CALL_ERROR {id}: missing error code"
                        )));
                    }
                };
                let description = match fields.next() {
                    Some(Value::String(description)) => description,
                    None | Some(Value::Null) => String::new(),
                    Some(other) => other.to_string(),
                };
                let details = fields.next().unwrap_or(Value::Object(Default::default()));
                Ok(Self::CallError {
                    id,
                    code,
                    description,
                    details,
                })
            }
        }
    }

    /// Decodes a binary frame by interpreting it as UTF-8 text.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if the bytes are not UTF-8, otherwise as [`Frame::decode`].
    pub fn decode_binary(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::protocol(format!("binary frame is not UTF-8: {e}")))?;
        Self::decode(text)
    }

    /// Encodes the frame as JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String> {
        let value = match self {
            Self::Call {
                id,
                command,
                payload,
            } => json!([MessageType::Call.code(), id, command, payload]),
            Self::CallResult { id, payload } => {
                json!([MessageType::CallResult.code(), id, payload])
            }
            Self::CallError {
                id,
                code,
                description,
                details,
            } => json!([
                MessageType::CallError.code(),
                id,
                code,
                description,
                details
            ]),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
