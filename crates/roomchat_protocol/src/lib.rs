#![forbid(unsafe_code)]

pub mod events;
pub mod framing;
pub mod payloads;

pub use events::{Inbound, classify};
pub use framing::{DEFAULT_MAX_FRAME_SIZE, Envelope, FramingError, decode_frame, encode_frame, encode_frame_default};
pub use payloads::{JoinAck, JoinResponse, JoinRoomRequest, PayloadError, SendMessagePayload, WireMessage};

/// Protocol version constants.
pub mod version {
	/// Wire envelope major version.
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Wire envelope minor version (`localId` echo support).
	pub const PROTOCOL_MINOR: u32 = 1;

	/// Compact representation useful for logs.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}
