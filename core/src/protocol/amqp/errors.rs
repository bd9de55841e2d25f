//! Reply codes and framing failures.
//!
//! Every protocol-level failure carries a numeric [`ReplyCode`] (what goes on the
//! wire in `connection.close` / `channel.close`) and a symbolic
//! [`ErrorCondition`] (what gets logged and matched on internally).

use std::fmt;
use thiserror::Error;

/// AMQP 0-9-1 reply codes used by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ReplyCode {
    ReplySuccess = 200,
    ContentTooLarge = 311,
    NoRoute = 312,
    NoConsumers = 313,
    ConnectionForced = 320,
    InvalidPath = 402,
    AccessRefused = 403,
    NotFound = 404,
    ResourceLocked = 405,
    PreconditionFailed = 406,
    FrameError = 501,
    SyntaxError = 502,
    CommandInvalid = 503,
    ChannelError = 504,
    UnexpectedFrame = 505,
    ResourceError = 506,
    NotAllowed = 530,
    NotImplemented = 540,
    InternalError = 541,
}

impl ReplyCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            200 => Self::ReplySuccess,
            311 => Self::ContentTooLarge,
            312 => Self::NoRoute,
            313 => Self::NoConsumers,
            320 => Self::ConnectionForced,
            402 => Self::InvalidPath,
            403 => Self::AccessRefused,
            404 => Self::NotFound,
            405 => Self::ResourceLocked,
            406 => Self::PreconditionFailed,
            501 => Self::FrameError,
            502 => Self::SyntaxError,
            503 => Self::CommandInvalid,
            504 => Self::ChannelError,
            505 => Self::UnexpectedFrame,
            506 => Self::ResourceError,
            530 => Self::NotAllowed,
            540 => Self::NotImplemented,
            541 => Self::InternalError,
            _ => return None,
        })
    }

    /// Hard errors close the whole connection rather than a single channel.
    pub fn is_connection_error(self) -> bool {
        matches!(
            self,
            Self::ConnectionForced
                | Self::InvalidPath
                | Self::FrameError
                | Self::SyntaxError
                | Self::CommandInvalid
                | Self::ChannelError
                | Self::UnexpectedFrame
                | Self::ResourceError
                | Self::NotAllowed
                | Self::NotImplemented
                | Self::InternalError
        )
    }

    pub fn condition(self) -> ErrorCondition {
        match self {
            Self::ReplySuccess => ErrorCondition::Ok,
            Self::ContentTooLarge | Self::ResourceError => ErrorCondition::ResourceLimitExceeded,
            Self::NoRoute | Self::NoConsumers => ErrorCondition::NotDeliverable,
            Self::ConnectionForced => ErrorCondition::ConnectionForced,
            Self::InvalidPath | Self::NotFound => ErrorCondition::NotFound,
            Self::AccessRefused => ErrorCondition::UnauthorizedAccess,
            Self::ResourceLocked => ErrorCondition::ResourceLocked,
            Self::PreconditionFailed => ErrorCondition::PreconditionFailed,
            Self::FrameError | Self::UnexpectedFrame => ErrorCondition::FramingError,
            Self::SyntaxError => ErrorCondition::DecodeError,
            Self::CommandInvalid | Self::ChannelError => ErrorCondition::IllegalState,
            Self::NotAllowed => ErrorCondition::NotAllowed,
            Self::NotImplemented => ErrorCondition::NotImplemented,
            Self::InternalError => ErrorCondition::InternalError,
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Symbolic error condition names, independent of the numeric reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    Ok,
    FramingError,
    DecodeError,
    NotImplemented,
    NotFound,
    NotAllowed,
    NotDeliverable,
    UnauthorizedAccess,
    ConnectionForced,
    ResourceLocked,
    ResourceLimitExceeded,
    PreconditionFailed,
    IllegalState,
    InternalError,
}

impl ErrorCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "amqp:ok",
            Self::FramingError => "amqp:connection:framing-error",
            Self::DecodeError => "amqp:decode-error",
            Self::NotImplemented => "amqp:not-implemented",
            Self::NotFound => "amqp:not-found",
            Self::NotAllowed => "amqp:not-allowed",
            Self::NotDeliverable => "amqp:not-deliverable",
            Self::UnauthorizedAccess => "amqp:unauthorized-access",
            Self::ConnectionForced => "amqp:connection:forced",
            Self::ResourceLocked => "amqp:resource-locked",
            Self::ResourceLimitExceeded => "amqp:resource-limit-exceeded",
            Self::PreconditionFailed => "amqp:precondition-failed",
            Self::IllegalState => "amqp:illegal-state",
            Self::InternalError => "amqp:internal-error",
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures raised while decoding bytes into frames, methods or values.
///
/// Decoding never returns a partially populated value: any of these aborts the
/// whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("insufficient input data: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("invalid frame-end octet {0:#04x}")]
    InvalidFrameEnd(u8),

    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("frame of {size} bytes exceeds the negotiated maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unknown method {class_id}.{method_id}")]
    UnknownMethod { class_id: u16, method_id: u16 },

    #[error("unknown field value type {0:?}")]
    UnknownFieldType(char),

    #[error("malformed {field}: {reason}")]
    Malformed { field: &'static str, reason: String },

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("unsupported protocol header {0:?}")]
    ProtocolHeader([u8; 8]),
}

impl FramingError {
    pub(crate) fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            field,
            reason: reason.into(),
        }
    }

    pub fn condition(&self) -> ErrorCondition {
        match self {
            Self::Truncated { .. }
            | Self::InvalidFrameEnd(_)
            | Self::UnknownFrameType(_)
            | Self::FrameTooLarge { .. }
            | Self::ProtocolHeader(_) => ErrorCondition::FramingError,
            Self::UnknownMethod { .. } => ErrorCondition::NotImplemented,
            Self::UnknownFieldType(_) | Self::Malformed { .. } | Self::TrailingBytes(_) => {
                ErrorCondition::DecodeError
            }
        }
    }

    pub fn reply_code(&self) -> ReplyCode {
        match self.condition() {
            ErrorCondition::NotImplemented => ReplyCode::NotImplemented,
            ErrorCondition::DecodeError => ReplyCode::SyntaxError,
            _ => ReplyCode::FrameError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_code_round_trips_through_u16() {
        for code in [200u16, 311, 312, 313, 320, 403, 404, 406, 501, 504, 530, 541] {
            assert_eq!(ReplyCode::from_u16(code).map(ReplyCode::as_u16), Some(code));
        }
        assert_eq!(ReplyCode::from_u16(999), None);
    }

    #[test]
    fn channel_and_connection_scopes() {
        assert!(!ReplyCode::NotFound.is_connection_error());
        assert!(!ReplyCode::AccessRefused.is_connection_error());
        assert!(ReplyCode::NotAllowed.is_connection_error());
        assert!(ReplyCode::UnexpectedFrame.is_connection_error());
    }

    #[test]
    fn truncation_is_a_framing_condition() {
        let err = FramingError::Truncated {
            needed: 1,
            available: 0,
        };
        assert_eq!(err.condition(), ErrorCondition::FramingError);
        assert_eq!(err.condition().as_str(), "amqp:connection:framing-error");
        assert_eq!(err.reply_code(), ReplyCode::FrameError);
        assert!(err.to_string().contains("insufficient input data"));
    }
}
