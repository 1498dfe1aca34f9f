#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default maximum text frame size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("frame has an empty event name")]
	EmptyEvent,

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// One event-named frame on the wire.
///
/// `ack` on a client frame asks the server for a response; the server answers with an `ack` event carrying
/// the same number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	pub event: String,
	#[serde(default)]
	pub data: serde_json::Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ack: Option<u64>,
}

impl Envelope {
	pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
		Self {
			event: event.into(),
			data,
			ack: None,
		}
	}

	pub fn with_ack(mut self, ack: u64) -> Self {
		self.ack = Some(ack);
		self
	}
}

/// Encode an envelope into a text frame.
pub fn encode_frame(env: &Envelope, max_frame_size: usize) -> Result<String, FramingError> {
	if env.event.trim().is_empty() {
		return Err(FramingError::EmptyEvent);
	}

	let text = serde_json::to_string(env)?;
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default(env: &Envelope) -> Result<String, FramingError> {
	encode_frame(env, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode a single text frame. The size check runs before any parsing.
pub fn decode_frame(src: &str, max_frame_size: usize) -> Result<Envelope, FramingError> {
	if src.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: src.len(),
			max: max_frame_size,
		});
	}

	let env: Envelope = serde_json::from_str(src)?;
	if env.event.trim().is_empty() {
		return Err(FramingError::EmptyEvent);
	}
	Ok(env)
}
