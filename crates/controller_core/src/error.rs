//! Error types for the controller core.
//!
//! Failures are grouped by where they are recovered:
//!
//! * [`ServerError`] - listener and configuration problems surfaced to the binary
//! * [`LinkError`] - session, handshake and ingress failures handled by the registry
//! * [`RouteError`] - user-facing routing failures turned into `responseError`s
//! * [`RequestError`] - the wire-level error carried by a `responseError`
//! * [`HandlerError`] - what request handlers return

use crate::address::Address;
use crate::token::TokenError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// WebSocket close codes used by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    ShuttingDown,
    HandshakeTimeout,
    SessionTimeout,
    InvalidMessage,
    AuthenticationFailed,
    Replaced,
    ControllerFull,
    CredentialsRevoked,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::ShuttingDown => 1001,
            CloseCode::HandshakeTimeout => 4001,
            CloseCode::SessionTimeout => 4002,
            CloseCode::InvalidMessage => 4003,
            CloseCode::AuthenticationFailed => 4004,
            CloseCode::Replaced => 4005,
            CloseCode::ControllerFull => 4006,
            CloseCode::CredentialsRevoked => 4007,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Errors raised while running the network server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Binding, listening or accepting failed
    #[error("Network error: {0}")]
    Network(String),
    /// The supplied configuration cannot be used
    #[error("Configuration error: {0}")]
    Config(String),
    /// Anything else that went wrong inside the controller
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by sessions, links and the handshake.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),
    #[error("message from {link} claims source {claimed}")]
    InvalidSource { link: Address, claimed: Address },
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("no handshake received in time")]
    HandshakeTimeout,
    #[error("connection closed during handshake")]
    Disconnected,
    #[error("session {0} is closed")]
    SessionClosed(u64),
    #[error("controller is not accepting new sessions")]
    NotAccepting,
    #[error("registered again from another connection")]
    Replaced,
    #[error("handler registration conflict: {0}")]
    HandlerConflict(String),
    #[error(transparent)]
    Route(#[from] RouteError),
}

impl LinkError {
    /// Close code and reason sent to a peer whose handshake failed with this error.
    pub fn close_code(&self) -> (CloseCode, &'static str) {
        match self {
            LinkError::HandshakeTimeout => (CloseCode::HandshakeTimeout, "Handshake timeout"),
            LinkError::Authentication(_) | LinkError::Token(_) => {
                (CloseCode::AuthenticationFailed, "Authentication failed")
            }
            LinkError::NotAccepting => (CloseCode::ShuttingDown, "Controller shutting down"),
            LinkError::Replaced => (CloseCode::Replaced, "Registered from another connection"),
            _ => (CloseCode::InvalidMessage, "Invalid message"),
        }
    }
}

/// Why a message could not be delivered to its destination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Host {0} is not connected")]
    HostNotConnected(u32),
    #[error("Instance {0} is not assigned to a host")]
    InstanceNotAssigned(u32),
    #[error("Host {host} of instance {instance} is not connected")]
    InstanceHostNotConnected { instance: u32, host: u32 },
    #[error("Control {0} is not connected")]
    ControlNotConnected(u32),
    #[error("Messages cannot be routed to the controller")]
    ControllerDestination,
    #[error("Message to {0} would be routed back to its origin")]
    Boomerang(Address),
    #[error("Only events can be broadcast")]
    BroadcastNonEvent,
    #[error("Unknown broadcast target {0}")]
    InvalidBroadcast(u32),
}

/// Machine-readable code of a `responseError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PermissionDenied,
    Unroutable,
    SessionLost,
    Timeout,
    UnknownRequest,
    InvalidData,
    Failed,
    InternalError,
}

/// A failed request, as seen by whoever sent it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

impl RequestError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn session_lost() -> Self {
        Self::new(ErrorCode::SessionLost, "Session was lost before a response arrived")
    }

    pub fn timeout() -> Self {
        Self::new(ErrorCode::Timeout, "Request timed out")
    }

    /// Whether the caller may reasonably retry once the peer is back.
    pub fn is_session_lost(&self) -> bool {
        self.code == ErrorCode::SessionLost
    }
}

impl From<RouteError> for RequestError {
    fn from(error: RouteError) -> Self {
        RequestError::new(ErrorCode::Unroutable, error.to_string())
    }
}

/// Error returned by request handlers.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Shown to the requester as is
    #[error("{0}")]
    Failed(String),
    /// The payload did not match the message class
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// Logged in full, reported to the requester as a generic failure
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// What the requester gets to see. Internal details stay in the log.
    pub fn to_request_error(&self) -> RequestError {
        match self {
            HandlerError::Failed(message) => RequestError::new(ErrorCode::Failed, message.clone()),
            HandlerError::InvalidData(message) => {
                RequestError::new(ErrorCode::InvalidData, message.clone())
            }
            HandlerError::Internal(_) => {
                RequestError::new(ErrorCode::InternalError, "Internal error")
            }
        }
    }
}
