//! OCPP-J error codes carried by CALL_ERROR frames.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ============================================================================
// ErrorCode
// ============================================================================

/// Error code of a CALL_ERROR frame.
///
/// Unknown codes received from a peer decode as [`ErrorCode::GenericError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Requested action is not known by the receiver.
    NotImplemented,
    /// Requested action is recognized but not supported.
    NotSupported,
    /// Internal error prevented the receiver from processing the action.
    InternalError,
    /// Payload is incomplete.
    ProtocolError,
    /// Security issue prevented the receiver from completing the action.
    SecurityError,
    /// Payload is syntactically incorrect.
    FormationViolation,
    /// A field contains an invalid value.
    PropertyConstraintViolation,
    /// A field violates occurrence constraints.
    OccurrenceConstraintViolation,
    /// A field violates data type constraints.
    TypeConstraintViolation,
    /// Any other error.
    GenericError,
}

impl ErrorCode {
    /// Returns the wire representation.
    ///
    /// `OccurenceConstraintViolation` keeps the misspelling mandated by OCPP 1.6.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurrenceConstraintViolation => "OccurenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
        }
    }

    /// Parses a wire code, falling back to [`ErrorCode::GenericError`].
    #[must_use]
    pub fn from_wire(code: &str) -> Self {
        match code {
            "NotImplemented" => Self::NotImplemented,
            "NotSupported" => Self::NotSupported,
            "InternalError" => Self::InternalError,
            "ProtocolError" => Self::ProtocolError,
            "SecurityError" => Self::SecurityError,
            "FormationViolation" | "FormatViolation" => Self::FormationViolation,
            "PropertyConstraintViolation" => Self::PropertyConstraintViolation,
            "OccurenceConstraintViolation" | "OccurrenceConstraintViolation" => {
                Self::OccurrenceConstraintViolation
            }
            "TypeConstraintViolation" => Self::TypeConstraintViolation,
            _ => Self::GenericError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&code))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_spelling() {
        assert_eq!(
            ErrorCode::OccurrenceConstraintViolation.as_str(),
            "OccurenceConstraintViolation"
        );
        assert_eq!(ErrorCode::NotImplemented.to_string(), "NotImplemented");
    }

    #[test]
    fn test_from_wire_known() {
        assert_eq!(
            ErrorCode::from_wire("SecurityError"),
            ErrorCode::SecurityError
        );
        assert_eq!(
            ErrorCode::from_wire("FormatViolation"),
            ErrorCode::FormationViolation
        );
    }

    #[test]
    fn test_from_wire_unknown_is_generic() {
        assert_eq!(ErrorCode::from_wire("Teapot"), ErrorCode::GenericError);
    }

    #[test]
    fn test_serde() {
        let json = serde_json::to_string(&ErrorCode::InternalError).unwrap();
        assert_eq!(json, "\"InternalError\"");
        let code: ErrorCode = serde_json::from_str("\"NotSupported\"").unwrap();
        assert_eq!(code, ErrorCode::NotSupported);
    }
}
