//! Error codes and the session service error type.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};
use thiserror::Error;

/// Machine-readable error code carried by every failed operation.
///
/// The first three are local precondition failures detected without a
/// network call. The rest come from the session service and are passed
/// through untouched.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
)]
pub enum ErrorCode {
    NotInSession,
    AlreadyInSession,
    NotHost,
    NotFound,
    Forbidden,
    RateLimited,
    VersionConflict,
    NetworkUnavailable,
    /// A pending create/join was abandoned by a leave before it completed.
    Abandoned,
    Unknown,
}

impl ErrorCode {
    /// Parse a code string coming off the wire. Unrecognized codes map to
    /// [`ErrorCode::Unknown`]; use [`ServiceError::from_wire`] to keep the
    /// original string.
    pub fn parse_lossy(code: &str) -> Self {
        code.parse().unwrap_or(Self::Unknown)
    }

    /// True for codes produced locally without touching the service.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::NotInSession | Self::AlreadyInSession | Self::NotHost | Self::Abandoned
        )
    }
}

/// Error returned by a [`SessionService`](crate::service::SessionService).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}: {message}", display_code(.code, .raw_code))]
pub struct ServiceError {
    pub code: ErrorCode,
    /// The service's own code when it has no [`ErrorCode`] counterpart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_code: Option<String>,
    pub message: String,
}

fn display_code<'a>(code: &'a ErrorCode, raw_code: &'a Option<String>) -> &'a str {
    raw_code.as_deref().unwrap_or(code.as_ref())
}

impl ServiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            raw_code: None,
            message: message.into(),
        }
    }

    /// Build an error from a raw code string, e.g. one decoded from a
    /// service response body. Codes outside [`ErrorCode`] become
    /// [`ErrorCode::Unknown`] and are kept in `raw_code`.
    pub fn from_wire(code: &str, message: impl Into<String>) -> Self {
        match code.parse() {
            Ok(known) => Self::new(known, message),
            Err(_) => Self {
                code: ErrorCode::Unknown,
                raw_code: Some(code.to_string()),
                message: message.into(),
            },
        }
    }

    /// The code as the service sent it.
    pub fn wire_code(&self) -> &str {
        display_code(&self.code, &self.raw_code)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkUnavailable, message)
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
