#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty identifier.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}
			pub fn as_str(&self) -> &str {
				&self.0
			}
			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id! {
	/// Stable backend room identifier.
	RoomId
}

string_id! {
	/// Server-assigned message identifier, unique within a room.
	MessageId
}

string_id! {
	/// Client-assigned identifier of a locally originated message.
	///
	/// Generated as a UUID v4 but kept as an opaque string, since the server echoes it back verbatim.
	LocalId
}

impl LocalId {
	/// Create a new random local id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}
}

/// Room identity returned by a successful join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomDetails {
	/// Human-readable room label.
	pub room: String,
	pub room_id: RoomId,
}

impl RoomDetails {
	pub fn new(room: impl Into<String>, room_id: RoomId) -> Self {
		Self {
			room: room.into(),
			room_id,
		}
	}
}

impl fmt::Display for RoomDetails {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} ({})", self.room, self.room_id)
	}
}

/// Sender or receiver of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Identity {
	pub name: String,
	pub email: String,
}

impl Identity {
	pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			email: email.into(),
		}
	}
}

/// Member of a room join request.
///
/// Only `id` and `email` are interpreted; any other profile fields are carried to the backend untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Participant {
	pub id: String,
	pub email: String,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Participant {
	pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			email: email.into(),
			name: None,
			extra: serde_json::Map::new(),
		}
	}
}

/// A request to join one room.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoomRequest {
	/// Room label to join or create.
	pub room: String,
	pub participants: Vec<Participant>,
}

impl RoomRequest {
	pub fn new(room: impl Into<String>, participants: Vec<Participant>) -> Self {
		Self {
			room: room.into(),
			participants,
		}
	}
}

/// Delivery state of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
	/// Server-confirmed.
	#[default]
	Confirmed,
	/// Optimistic, awaiting server confirmation.
	Pending,
	/// Optimistic, gave up after the retry ceiling.
	Failed,
}

/// A chat message as seen by the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	/// Server id; `None` only for optimistic entries.
	pub id: Option<MessageId>,
	/// Client id of a locally originated message.
	pub local_id: Option<LocalId>,
	pub room: String,
	pub room_id: String,
	pub sender: Identity,
	pub receiver: Identity,
	pub body: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: Option<DateTime<Utc>>,
	/// Secondary server-side identifier, when the backend provides one.
	pub message_id: Option<String>,
	pub attachments: Vec<String>,
	pub delivery: Delivery,
}

impl Message {
	/// Whether this entry is an unconfirmed local send.
	pub fn is_optimistic(&self) -> bool {
		self.id.is_none()
	}

	/// Timeline ordering key: `created_at`, then the id (local id for optimistic entries).
	pub fn order_key(&self) -> (DateTime<Utc>, &str) {
		let tie = match (&self.id, &self.local_id) {
			(Some(id), _) => id.as_str(),
			(None, Some(local)) => local.as_str(),
			(None, None) => "",
		};
		(self.created_at, tie)
	}
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone;

	use super::*;

	fn msg(id: Option<&str>, local: Option<&str>, ms: i64) -> Message {
		Message {
			id: id.map(|s| MessageId::new(s).unwrap()),
			local_id: local.map(|s| LocalId::new(s).unwrap()),
			room: "general".to_string(),
			room_id: "r1".to_string(),
			sender: Identity::new("a", "a@example.com"),
			receiver: Identity::new("b", "b@example.com"),
			body: "hi".to_string(),
			created_at: Utc.timestamp_millis_opt(ms).unwrap(),
			updated_at: None,
			message_id: None,
			attachments: Vec::new(),
			delivery: Delivery::Confirmed,
		}
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(RoomId::new("").is_err());
		assert!(MessageId::new("   ").is_err());
		assert!("".parse::<LocalId>().is_err());
	}

	#[test]
	fn local_ids_are_unique() {
		assert_ne!(LocalId::new_v4(), LocalId::new_v4());
	}

	#[test]
	fn order_key_prefers_server_id() {
		let m = msg(Some("m1"), Some("l1"), 5);
		assert_eq!(m.order_key().1, "m1");
		assert!(!m.is_optimistic());

		let o = msg(None, Some("l1"), 5);
		assert_eq!(o.order_key().1, "l1");
		assert!(o.is_optimistic());
	}

	#[test]
	fn participant_keeps_extra_fields() {
		let p: Participant =
			serde_json::from_str(r#"{"id":"u1","email":"u1@example.com","role":"customer","name":null}"#).unwrap();
		assert_eq!(p.id, "u1");
		assert_eq!(p.name, None);
		assert_eq!(p.extra.get("role").and_then(|v| v.as_str()), Some("customer"));

		let back = serde_json::to_value(&p).unwrap();
		assert_eq!(back["role"], "customer");
	}
}
