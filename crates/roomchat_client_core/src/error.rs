use std::time::Duration;

use roomchat_protocol::{FramingError, PayloadError};

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// Invalid or incomplete configuration.
	#[error("invalid configuration: {0}")]
	Config(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Established connection failed or dropped.
	#[error("transport error: {0}")]
	Transport(String),

	/// Frame could not be encoded or decoded.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Inbound payload failed shape validation.
	#[error("malformed payload: {0}")]
	Payload(#[from] PayloadError),

	/// Nothing to send.
	#[error("message is empty")]
	EmptyMessage,

	/// The session has been closed.
	#[error("session closed")]
	Closed,

	/// Other error.
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// Why a room join did not produce a room.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
	/// The backend explicitly refused the join.
	#[error("join rejected: {0}")]
	Rejected(String),

	/// No response within the join window. The connection is kept.
	#[error("join timed out after {0:?}")]
	Timeout(Duration),

	/// A newer `join` replaced this one before it resolved.
	#[error("join superseded by a newer join request")]
	Superseded,

	/// The session closed before the join resolved.
	#[error("session closed before the join completed")]
	Closed,
}
