//! Upgrade request validation.
//!
//! Runs inside the WebSocket handshake callback, before any connection state
//! exists. It only parses the path and compares the sub-protocol header; no
//! directory lookup happens here, so reconnect storms never stall the accept
//! loop.
//!
//! # Path Grammar
//!
//! ```text
//! /{prefix}/{tenant}/{token}/{device-id}[?query]
//! ```
//!
//! Segments are percent-decoded. The query string is ignored. The raw path
//! without the query is kept as the Request-Lock key.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use tracing::warn;

use crate::config::GatewayConfig;
use crate::error::Error;
use crate::identifiers::ProtocolVariant;

// ============================================================================
// RejectKind
// ============================================================================

/// Why an upgrade was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// Path matches neither prefix.
    UnknownPath,
    /// Known prefix, malformed segments.
    BadPath,
    /// Sub-protocol header missing or not the one expected.
    ProtocolMismatch,
}

impl RejectKind {
    /// HTTP status answered instead of `101 Switching Protocols`.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::UnknownPath => 404,
            Self::BadPath | Self::ProtocolMismatch => 400,
        }
    }
}

// ============================================================================
// Rejection
// ============================================================================

/// Refused upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Category.
    pub kind: RejectKind,
    /// Log message, also used as the HTTP body.
    pub message: String,
}

impl Rejection {
    fn new(kind: RejectKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        Error::handshake(rejection.message)
    }
}

// ============================================================================
// UpgradeTarget
// ============================================================================

/// Accepted upgrade, carried into connection initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeTarget {
    /// Which table the session will live in.
    pub variant: ProtocolVariant,
    /// Path without query string; the Request-Lock key.
    pub raw_path: String,
    /// Decoded tenant segment.
    pub tenant: String,
    /// Decoded token segment.
    pub token: String,
    /// Decoded device segment.
    pub device_id: String,
    /// Sub-protocol to echo in the response.
    pub subprotocol: String,
}

// ============================================================================
// Validation
// ============================================================================

/// Validates an upgrade request's path and `Sec-WebSocket-Protocol` header.
///
/// The header may list several protocols; the expected one must appear as an
/// exact token.
///
/// # Errors
///
/// Returns a [`Rejection`] whose [`RejectKind::status_code`] answers the
/// upgrade.
pub fn validate_upgrade(
    path: &str,
    subprotocol_header: Option<&str>,
    config: &GatewayConfig,
) -> Result<UpgradeTarget, Rejection> {
    let result = parse(path, subprotocol_header, config);
    if let Err(rejection) = &result {
        warn!(path, kind = ?rejection.kind, reason = %rejection.message, "Upgrade rejected");
    }
    result
}

fn parse(
    path: &str,
    subprotocol_header: Option<&str>,
    config: &GatewayConfig,
) -> Result<UpgradeTarget, Rejection> {
    let raw_path = path.split_once('?').map_or(path, |(p, _)| p);

    let (variant, rest, expected) = [
        (
            ProtocolVariant::Device,
            config.device_path_prefix.as_str(),
            config.device_subprotocol.as_str(),
        ),
        (
            ProtocolVariant::Management,
            config.management_path_prefix.as_str(),
            config.management_subprotocol.as_str(),
        ),
    ]
    .into_iter()
    .find_map(|(variant, prefix, expected)| {
        let rest = raw_path.strip_prefix(prefix)?;
        (rest.is_empty() || rest.starts_with('/')).then_some((variant, rest, expected))
    })
    .ok_or_else(|| Rejection::new(RejectKind::UnknownPath, format!("Unknown path {raw_path:?}")))?;

    let segments: Vec<&str> = rest.strip_prefix('/').unwrap_or(rest).split('/').collect();
    let [tenant, token, device_id] = segments.as_slice() else {
        return Err(Rejection::new(
            RejectKind::BadPath,
            format!(
                "Expected {{tenant}}/{{token}}/{{device}} after prefix, got {} segment(s)",
                segments.len()
            ),
        ));
    };

    let tenant = decode_segment("tenant", tenant)?;
    let token = decode_segment("token", token)?;
    let device_id = decode_segment("device", device_id)?;

    let offered = subprotocol_header.unwrap_or_default();
    if !offered.split(',').map(str::trim).any(|p| p == expected) {
        return Err(Rejection::new(
            RejectKind::ProtocolMismatch,
            format!("Expected sub-protocol {expected:?}, client offered {offered:?}"),
        ));
    }

    Ok(UpgradeTarget {
        variant,
        raw_path: raw_path.to_string(),
        tenant,
        token,
        device_id,
        subprotocol: expected.to_string(),
    })
}

fn decode_segment(name: &str, segment: &str) -> Result<String, Rejection> {
    if segment.is_empty() {
        return Err(Rejection::new(
            RejectKind::BadPath,
            format!("Empty {name} segment"),
        ));
    }

    let decoded = urlencoding::decode(segment).map_err(|_| {
        Rejection::new(
            RejectKind::BadPath,
            format!("{name} segment is not valid UTF-8 after decoding"),
        )
    })?;

    if decoded.is_empty() {
        return Err(Rejection::new(
            RejectKind::BadPath,
            format!("Empty {name} segment"),
        ));
    }

    Ok(decoded.into_owned())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig::default()
    }

    #[test]
    fn test_device_path_accepted() {
        let target =
            validate_upgrade("/OCPP16/T1/TOK/D1", Some("ocpp1.6"), &config()).unwrap();

        assert_eq!(target.variant, ProtocolVariant::Device);
        assert_eq!(target.raw_path, "/OCPP16/T1/TOK/D1");
        assert_eq!(target.tenant, "T1");
        assert_eq!(target.token, "TOK");
        assert_eq!(target.device_id, "D1");
        assert_eq!(target.subprotocol, "ocpp1.6");
    }

    #[test]
    fn test_management_path_accepted() {
        let target = validate_upgrade("/REST/T1/TOK/admin", Some("rest"), &config()).unwrap();
        assert_eq!(target.variant, ProtocolVariant::Management);
        assert_eq!(target.device_id, "admin");
    }

    #[test]
    fn test_query_string_ignored() {
        let target =
            validate_upgrade("/OCPP16/T1/TOK/D1?foo=bar", Some("ocpp1.6"), &config()).unwrap();
        assert_eq!(target.raw_path, "/OCPP16/T1/TOK/D1");
        assert_eq!(target.device_id, "D1");
    }

    #[test]
    fn test_segments_percent_decoded() {
        let target =
            validate_upgrade("/OCPP16/T1/a%2Fb/CS%20001", Some("ocpp1.6"), &config()).unwrap();
        assert_eq!(target.token, "a/b");
        assert_eq!(target.device_id, "CS 001");
    }

    #[test]
    fn test_protocol_list_contains_expected() {
        let target =
            validate_upgrade("/OCPP16/T1/TOK/D1", Some("ocpp2.0.1, ocpp1.6"), &config()).unwrap();
        assert_eq!(target.subprotocol, "ocpp1.6");
    }

    #[test]
    fn test_unknown_prefix() {
        let err = validate_upgrade("/OCPP20/T1/TOK/D1", Some("ocpp1.6"), &config()).unwrap_err();
        assert_eq!(err.kind, RejectKind::UnknownPath);
        assert_eq!(err.kind.status_code(), 404);
    }

    #[test]
    fn test_prefix_must_end_at_segment_boundary() {
        let err = validate_upgrade("/OCPP16X/T1/TOK/D1", Some("ocpp1.6"), &config()).unwrap_err();
        assert_eq!(err.kind, RejectKind::UnknownPath);
    }

    #[test]
    fn test_wrong_segment_count() {
        for path in ["/OCPP16", "/OCPP16/T1/TOK", "/OCPP16/T1/TOK/D1/extra"] {
            let err = validate_upgrade(path, Some("ocpp1.6"), &config()).unwrap_err();
            assert_eq!(err.kind, RejectKind::BadPath, "{path}");
        }
    }

    #[test]
    fn test_empty_segment() {
        let err = validate_upgrade("/OCPP16/T1//D1", Some("ocpp1.6"), &config()).unwrap_err();
        assert_eq!(err.kind, RejectKind::BadPath);
        assert_eq!(err.kind.status_code(), 400);
    }

    #[test]
    fn test_protocol_mismatch() {
        let err = validate_upgrade("/OCPP16/T1/TOK/D1", Some("rest"), &config()).unwrap_err();
        assert_eq!(err.kind, RejectKind::ProtocolMismatch);

        let err = validate_upgrade("/OCPP16/T1/TOK/D1", None, &config()).unwrap_err();
        assert_eq!(err.kind, RejectKind::ProtocolMismatch);
    }

    #[test]
    fn test_protocol_match_is_exact() {
        let err = validate_upgrade("/OCPP16/T1/TOK/D1", Some("OCPP1.6"), &config()).unwrap_err();
        assert_eq!(err.kind, RejectKind::ProtocolMismatch);
    }

    #[test]
    fn test_rejection_into_error() {
        let err: Error = Rejection::new(RejectKind::BadPath, "bad").into();
        assert!(matches!(err, Error::Handshake { .. }));
    }
}
