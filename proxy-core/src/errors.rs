//! Error taxonomy and HTTP surfacing for the proxy.
//!
//! Mirrors the propagation policy: `Transport`, `RemoteFault`, `Envelope`
//! and a failed `QueueOp::Send` surface as a 500 with an empty body,
//! `UpstreamDial` surfaces as 520, `RendezvousMiss` as 404, and
//! `ClientGone` is not surfaced at all (graceful termination).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use derive_more::{Display, Error, From};
use std::fmt;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Display, Error, From)]
pub enum ProxyError {
    /// The function invoker failed to complete the call, or it returned
    /// something other than a successful status.
    #[display(fmt = "transport error: {}", _0)]
    #[error(ignore)]
    #[from(ignore)]
    Transport(String),

    /// The worker completed but reported a `functionError`.
    #[display(fmt = "remote fault: {}", _0)]
    #[error(ignore)]
    #[from(ignore)]
    RemoteFault(String),

    /// Envelope decode, decrypt, or size-limit failure.
    Envelope(EnvelopeError),

    /// A queue send/receive/delete failed.
    #[display(fmt = "queue {} error: {}", op, message)]
    #[error(ignore)]
    #[from(ignore)]
    QueueOp { op: QueueOpKind, message: String },

    /// `socket_id` was not present (or not yet registered) at the rendezvous server.
    RendezvousMiss,

    /// Malformed request inside the MITM tunnel.
    #[display(fmt = "tunnel parse error: {}", _0)]
    #[error(ignore)]
    #[from(ignore)]
    TunnelParse(String),

    /// Could not open the upstream TCP connection for a CONNECT tunnel.
    #[display(fmt = "upstream dial failed: {}", _0)]
    #[error(ignore)]
    #[from(ignore)]
    UpstreamDial(String),

    /// A Future (or a rendezvous wait) expired before completion.
    Timeout,

    /// The client disconnected mid-stream; not a real error.
    ClientGone,

    Io(std::io::Error),

    Json(serde_json::Error),

    #[error(ignore)]
    Anyhow(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOpKind {
    Send,
    Receive,
    Delete,
}

impl fmt::Display for QueueOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueOpKind::Send => write!(f, "send"),
            QueueOpKind::Receive => write!(f, "receive"),
            QueueOpKind::Delete => write!(f, "delete"),
        }
    }
}

impl ProxyError {
    pub fn queue_op(op: QueueOpKind, message: impl Into<String>) -> Self {
        ProxyError::QueueOp {
            op,
            message: message.into(),
        }
    }
}

#[derive(Debug, Display, Error)]
pub enum EnvelopeError {
    #[display(fmt = "body exceeds inline limit and no object-store sink is configured")]
    TooLarge,
    #[display(fmt = "GCM tag mismatch")]
    Decrypt,
    #[display(fmt = "malformed JSON: {}", _0)]
    #[error(ignore)]
    Malformed(String),
}

impl ProxyError {
    /// Status-code mapping used by the raw `hyper` listener, which
    /// doesn't go through axum's `IntoResponse` machinery.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Transport(_) => 500,
            ProxyError::RemoteFault(_) => 500,
            ProxyError::Envelope(_) => 500,
            ProxyError::QueueOp { .. } => 500,
            ProxyError::RendezvousMiss => 404,
            ProxyError::TunnelParse(_) => 500,
            ProxyError::UpstreamDial(_) => 520,
            ProxyError::Timeout => 500,
            ProxyError::ClientGone => 200,
            ProxyError::Io(_) => 500,
            ProxyError::Json(_) => 500,
            ProxyError::Anyhow(_) => 500,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            ProxyError::Transport(msg) => {
                tracing::warn!(%msg, "transport error");
                (StatusCode::INTERNAL_SERVER_ERROR, "").into_response()
            }
            ProxyError::RemoteFault(msg) => {
                tracing::warn!(%msg, "remote fault");
                (StatusCode::INTERNAL_SERVER_ERROR, "").into_response()
            }
            ProxyError::Envelope(err) => {
                tracing::warn!(%err, "envelope error");
                (StatusCode::INTERNAL_SERVER_ERROR, "").into_response()
            }
            ProxyError::QueueOp { op, message } => {
                // send failures surface; receive/delete are logged and
                // swallowed by the caller before construction of this
                // error ever reaches here (visibility timeout is the
                // recovery path for those).
                tracing::warn!(?op, err = %message, "queue op failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "").into_response()
            }
            ProxyError::RendezvousMiss => StatusCode::NOT_FOUND.into_response(),
            ProxyError::TunnelParse(msg) => {
                tracing::warn!(%msg, "tunnel parse error");
                (StatusCode::INTERNAL_SERVER_ERROR, "").into_response()
            }
            ProxyError::UpstreamDial(msg) => {
                tracing::warn!(%msg, "upstream dial failed");
                (StatusCode::from_u16(520).unwrap(), "").into_response()
            }
            ProxyError::Timeout => (StatusCode::INTERNAL_SERVER_ERROR, "").into_response(),
            ProxyError::ClientGone => StatusCode::OK.into_response(),
            ProxyError::Io(err) => {
                tracing::error!(%err, "io error");
                (StatusCode::INTERNAL_SERVER_ERROR, "").into_response()
            }
            ProxyError::Json(err) => {
                tracing::warn!(%err, "json error");
                (StatusCode::INTERNAL_SERVER_ERROR, "").into_response()
            }
            ProxyError::Anyhow(err) => {
                tracing::warn!(?err, "anyhow");
                (StatusCode::INTERNAL_SERVER_ERROR, "").into_response()
            }
        }
    }
}
