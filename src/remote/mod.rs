//! Remote state access
//!
//! Maps the [`State`](crate::state::State) contract onto a request/response
//! plus streaming transport. The transport itself is abstract: anything that
//! can carry the [`wire`] envelope and preserve per-stream ordering works.
//! [`LoopbackTransport`] is the in-process implementation used by tests and
//! by embedders that want to swap in a networked transport later.

mod adapter;
mod loopback;
pub mod wire;

pub use adapter::Adapter;
pub use loopback::LoopbackTransport;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Status Codes
// =============================================================================

/// Transport-level status codes carried by error responses.
///
/// Deliberately coarse: conflict subkinds (version vs. pending finalizers)
/// collapse onto `FailedPrecondition` and are disambiguated by the caller's
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCode {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    InvalidArgument,
    FailedPrecondition,
    Unavailable,
    Cancelled,
    Internal,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::NotFound => write!(f, "not-found"),
            StatusCode::AlreadyExists => write!(f, "already-exists"),
            StatusCode::PermissionDenied => write!(f, "permission-denied"),
            StatusCode::InvalidArgument => write!(f, "invalid-argument"),
            StatusCode::FailedPrecondition => write!(f, "failed-precondition"),
            StatusCode::Unavailable => write!(f, "unavailable"),
            StatusCode::Cancelled => write!(f, "cancelled"),
            StatusCode::Internal => write!(f, "internal"),
        }
    }
}

/// Error surfaced by a transport call.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct TransportError {
    pub code: StatusCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Ordered stream of watch frames from the server.
pub type FrameStream = BoxStream<'static, Result<wire::Frame, TransportError>>;

// =============================================================================
// Transport
// =============================================================================

/// Request/response plus streaming transport carrying the wire envelope.
///
/// Implementations must preserve per-stream frame order and fail the stream
/// (rather than silently dropping frames) when they cannot keep up.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn unary(&self, request: wire::Request) -> Result<wire::Response, TransportError>;

    async fn stream(&self, request: wire::Request) -> Result<FrameStream, TransportError>;
}
