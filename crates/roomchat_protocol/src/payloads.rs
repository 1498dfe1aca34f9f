#![forbid(unsafe_code)]

//! Wire payloads and their validation into the domain model.
//!
//! Everything arriving from the server is untrusted: payloads are deserialized into loosely typed wire
//! structs first, then checked field by field before a domain value is produced.

use chrono::{DateTime, TimeZone, Utc};
use roomchat_domain::{Delivery, Identity, LocalId, Message, MessageId, Participant, RoomDetails, RoomId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inbound data that failed shape validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
	#[error("malformed json: {0}")]
	Json(String),

	#[error("missing field `{0}`")]
	MissingField(&'static str),

	#[error("invalid field `{field}`: {detail}")]
	InvalidField {
		field: &'static str,
		detail: String,
	},
}

impl From<serde_json::Error> for PayloadError {
	fn from(e: serde_json::Error) -> Self {
		PayloadError::Json(e.to_string())
	}
}

/// A message as sent by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
	pub id: Option<String>,
	pub local_id: Option<String>,
	pub room: Option<String>,
	pub room_id: Option<String>,
	pub sender: Option<String>,
	pub receiver: Option<String>,
	pub sender_email: Option<String>,
	pub receiver_email: Option<String>,
	pub message: Option<String>,
	pub created_at: Option<serde_json::Value>,
	pub updated_at: Option<serde_json::Value>,
	pub message_id: Option<String>,
	pub files: Option<Vec<String>>,
}

impl WireMessage {
	pub fn from_value(value: serde_json::Value) -> Result<Self, PayloadError> {
		if !value.is_object() {
			return Err(PayloadError::InvalidField {
				field: "message",
				detail: "expected an object".to_string(),
			});
		}
		Ok(serde_json::from_value(value)?)
	}

	/// Validate into a confirmed [`Message`].
	///
	/// `room` fills in the room label / id when the backend omits them (backlog entries usually do).
	pub fn into_message(self, room: Option<&RoomDetails>) -> Result<Message, PayloadError> {
		let id = match self.id {
			Some(id) => MessageId::new(id).map_err(|e| PayloadError::InvalidField {
				field: "id",
				detail: e.to_string(),
			})?,
			None => return Err(PayloadError::MissingField("id")),
		};

		let local_id = self.local_id.and_then(|s| LocalId::new(s).ok());

		let body = self.message.ok_or(PayloadError::MissingField("message"))?;

		let created_at = match self.created_at {
			Some(v) => parse_timestamp("createdAt", &v)?,
			None => return Err(PayloadError::MissingField("createdAt")),
		};

		let updated_at = match self.updated_at {
			Some(serde_json::Value::Null) | None => None,
			Some(v) => Some(parse_timestamp("updatedAt", &v)?),
		};

		let room_label = non_empty(self.room).or_else(|| room.map(|r| r.room.clone()));
		let room_id = non_empty(self.room_id).or_else(|| room.map(|r| r.room_id.as_str().to_string()));
		let room_id = room_id.ok_or(PayloadError::MissingField("roomId"))?;

		Ok(Message {
			id: Some(id),
			local_id,
			room: room_label.unwrap_or_default(),
			room_id,
			sender: Identity::new(self.sender.unwrap_or_default(), self.sender_email.unwrap_or_default()),
			receiver: Identity::new(self.receiver.unwrap_or_default(), self.receiver_email.unwrap_or_default()),
			body,
			created_at,
			updated_at,
			message_id: non_empty(self.message_id),
			attachments: self.files.unwrap_or_default(),
			delivery: Delivery::Confirmed,
		})
	}
}

fn non_empty(s: Option<String>) -> Option<String> {
	s.filter(|s| !s.trim().is_empty())
}

/// Accepts RFC 3339 strings or unix milliseconds.
pub fn parse_timestamp(field: &'static str, v: &serde_json::Value) -> Result<DateTime<Utc>, PayloadError> {
	let invalid = |detail: String| PayloadError::InvalidField { field, detail };

	match v {
		serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
			.map(|dt| dt.with_timezone(&Utc))
			.map_err(|e| invalid(format!("{s:?}: {e}"))),
		serde_json::Value::Number(n) => {
			let ms = n
				.as_i64()
				.ok_or_else(|| invalid(format!("{n} is not an integer millisecond timestamp")))?;
			Utc.timestamp_millis_opt(ms)
				.single()
				.ok_or_else(|| invalid(format!("{ms} is out of range")))
		}
		other => Err(invalid(format!("expected string or number, got {other}"))),
	}
}

/// Client → server `room` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinRoomRequest {
	pub room: String,
	pub users: Vec<Participant>,
}

/// A validated join response: room identity plus the message backlog.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinResponse {
	pub details: RoomDetails,
	pub backlog: Vec<Message>,
	/// Backlog entries that failed validation and were left out.
	pub dropped: Vec<PayloadError>,
}

/// Outcome of the `room` acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinAck {
	Accepted(JoinResponse),
	Rejected(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJoin {
	room_name: Option<String>,
	room: Option<String>,
	room_id: Option<String>,
	#[serde(default)]
	messages: Option<Vec<serde_json::Value>>,
	error: Option<serde_json::Value>,
}

impl JoinAck {
	/// Parse the `room` ack data (`{roomName, roomId, messages}` or `{error}`).
	pub fn parse(data: serde_json::Value) -> Result<Self, PayloadError> {
		let wire = parse_join_object(data)?;
		if let Some(err) = wire.error {
			let reason = match err {
				serde_json::Value::String(s) => s,
				other => other.to_string(),
			};
			return Ok(JoinAck::Rejected(reason));
		}
		Ok(JoinAck::Accepted(wire.into_response()?))
	}
}

impl JoinResponse {
	/// Parse a server-pushed `joinedRoom` payload (`{room, roomId, messages}`).
	pub fn parse_joined_room(data: serde_json::Value) -> Result<Self, PayloadError> {
		parse_join_object(data)?.into_response()
	}
}

fn parse_join_object(data: serde_json::Value) -> Result<WireJoin, PayloadError> {
	if !data.is_object() {
		return Err(PayloadError::InvalidField {
			field: "data",
			detail: "expected an object".to_string(),
		});
	}
	Ok(serde_json::from_value(data)?)
}

impl WireJoin {
	fn into_response(self) -> Result<JoinResponse, PayloadError> {
		let room = non_empty(self.room_name)
			.or_else(|| non_empty(self.room))
			.ok_or(PayloadError::MissingField("roomName"))?;
		let room_id = self.room_id.ok_or(PayloadError::MissingField("roomId"))?;
		let room_id = RoomId::new(room_id).map_err(|e| PayloadError::InvalidField {
			field: "roomId",
			detail: e.to_string(),
		})?;
		let details = RoomDetails::new(room, room_id);

		let mut backlog = Vec::new();
		let mut dropped = Vec::new();
		for raw in self.messages.unwrap_or_default() {
			match WireMessage::from_value(raw).and_then(|m| m.into_message(Some(&details))) {
				Ok(m) => backlog.push(m),
				Err(e) => dropped.push(e),
			}
		}

		Ok(JoinResponse {
			details,
			backlog,
			dropped,
		})
	}
}

/// Parse a `receiveMessage` payload (`{data: message}`).
pub fn parse_receive_message(data: serde_json::Value, room: Option<&RoomDetails>) -> Result<Message, PayloadError> {
	let serde_json::Value::Object(mut obj) = data else {
		return Err(PayloadError::InvalidField {
			field: "data",
			detail: "expected an object".to_string(),
		});
	};
	let inner = obj.remove("data").ok_or(PayloadError::MissingField("data"))?;
	WireMessage::from_value(inner)?.into_message(room)
}

/// Parse a `sendMessage` acknowledgment. Backends that acknowledge without echoing the stored message
/// yield `Ok(None)`.
pub fn parse_send_ack(data: serde_json::Value, room: Option<&RoomDetails>) -> Result<Option<Message>, PayloadError> {
	match data {
		serde_json::Value::Null => Ok(None),
		serde_json::Value::Object(mut obj) => {
			let inner = match obj.remove("data") {
				Some(inner) => inner,
				None if obj.contains_key("id") => serde_json::Value::Object(obj),
				None => return Ok(None),
			};
			WireMessage::from_value(inner)?.into_message(room).map(Some)
		}
		_ => Ok(None),
	}
}

/// Client → server `sendMessage` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
	pub room: String,
	pub room_id: String,
	pub message: String,
	pub sender: String,
	pub receiver: String,
	pub sender_email: String,
	pub receiver_email: String,
	pub local_id: String,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub files: Vec<String>,
}

impl SendMessagePayload {
	pub fn new(
		room: &RoomDetails,
		local_id: &LocalId,
		body: &str,
		sender: &Identity,
		receiver: &Identity,
		files: &[String],
	) -> Self {
		Self {
			room: room.room.clone(),
			room_id: room.room_id.as_str().to_string(),
			message: body.to_string(),
			sender: sender.name.clone(),
			receiver: receiver.name.clone(),
			sender_email: sender.email.clone(),
			receiver_email: receiver.email.clone(),
			local_id: local_id.as_str().to_string(),
			files: files.to_vec(),
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn details() -> RoomDetails {
		RoomDetails::new("testing", RoomId::new("r-1").unwrap())
	}

	#[test]
	fn wire_message_maps_all_fields() {
		let wire = WireMessage::from_value(json!({
			"id": "m1",
			"localId": "l1",
			"room": "testing",
			"roomId": "r-1",
			"sender": "Ada",
			"receiver": "Bob",
			"senderEmail": "ada@example.com",
			"receiverEmail": "bob@example.com",
			"message": "hello",
			"createdAt": "2023-04-06T13:24:24.000Z",
			"updatedAt": null,
			"messageId": "abc",
			"files": ["f1", "f2"],
		}))
		.unwrap();

		let m = wire.into_message(None).unwrap();
		assert_eq!(m.id.as_ref().map(|i| i.as_str()), Some("m1"));
		assert_eq!(m.local_id.as_ref().map(|i| i.as_str()), Some("l1"));
		assert_eq!(m.sender, Identity::new("Ada", "ada@example.com"));
		assert_eq!(m.receiver.email, "bob@example.com");
		assert_eq!(m.body, "hello");
		assert_eq!(m.updated_at, None);
		assert_eq!(m.message_id.as_deref(), Some("abc"));
		assert_eq!(m.attachments, vec!["f1".to_string(), "f2".to_string()]);
		assert_eq!(m.delivery, Delivery::Confirmed);
	}

	#[test]
	fn timestamps_accept_millis_and_reject_garbage() {
		let t = parse_timestamp("createdAt", &json!(1_680_787_064_000i64)).unwrap();
		assert_eq!(t.timestamp_millis(), 1_680_787_064_000);

		assert!(parse_timestamp("createdAt", &json!("yesterday")).is_err());
		assert!(parse_timestamp("createdAt", &json!(true)).is_err());
		assert!(parse_timestamp("createdAt", &json!(1.5)).is_err());
	}

	#[test]
	fn missing_required_fields_are_reported() {
		let err = WireMessage::from_value(json!({"message": "x", "createdAt": 1}))
			.unwrap()
			.into_message(Some(&details()))
			.unwrap_err();
		assert_eq!(err, PayloadError::MissingField("id"));

		let err = WireMessage::from_value(json!({"id": "m", "createdAt": 1}))
			.unwrap()
			.into_message(Some(&details()))
			.unwrap_err();
		assert_eq!(err, PayloadError::MissingField("message"));

		let err = WireMessage::from_value(json!({"id": "m", "message": "x", "createdAt": 1}))
			.unwrap()
			.into_message(None)
			.unwrap_err();
		assert_eq!(err, PayloadError::MissingField("roomId"));
	}

	#[test]
	fn wrong_types_are_malformed() {
		assert!(WireMessage::from_value(json!({"id": 5})).is_err());
		assert!(WireMessage::from_value(json!("nope")).is_err());
	}

	#[test]
	fn join_ack_keeps_valid_backlog_entries() {
		let ack = JoinAck::parse(json!({
			"roomName": "testing",
			"roomId": "r-1",
			"messages": [
				{"id": "a", "message": "one", "createdAt": 1},
				{"id": "b", "createdAt": 2},
				42,
			],
		}))
		.unwrap();

		let JoinAck::Accepted(resp) = ack else {
			panic!("expected accepted join");
		};
		assert_eq!(resp.details, details());
		assert_eq!(resp.backlog.len(), 1);
		assert_eq!(resp.backlog[0].room_id, "r-1");
		assert_eq!(resp.backlog[0].room, "testing");
		assert_eq!(resp.dropped.len(), 2);
	}

	#[test]
	fn join_ack_rejection() {
		let ack = JoinAck::parse(json!({"error": "not a participant"})).unwrap();
		assert_eq!(ack, JoinAck::Rejected("not a participant".to_string()));
	}

	#[test]
	fn join_ack_requires_room_id() {
		assert_eq!(
			JoinAck::parse(json!({"roomName": "testing"})).unwrap_err(),
			PayloadError::MissingField("roomId")
		);
		assert!(JoinAck::parse(json!([1, 2])).is_err());
	}

	#[test]
	fn joined_room_uses_room_field() {
		let resp = JoinResponse::parse_joined_room(json!({"room": "testing", "roomId": "r-1", "messages": []})).unwrap();
		assert_eq!(resp.details, details());
		assert!(resp.backlog.is_empty());
	}

	#[test]
	fn receive_message_unwraps_data() {
		let m = parse_receive_message(
			json!({"data": {"id": "m9", "message": "yo", "createdAt": 9, "roomId": "r-1"}}),
			None,
		)
		.unwrap();
		assert_eq!(m.body, "yo");
		assert_eq!(
			parse_receive_message(json!({"id": "m9"}), None).unwrap_err(),
			PayloadError::MissingField("data")
		);
	}

	#[test]
	fn send_ack_variants() {
		let d = details();
		assert_eq!(parse_send_ack(json!(null), Some(&d)).unwrap(), None);
		assert_eq!(parse_send_ack(json!({"ok": true}), Some(&d)).unwrap(), None);

		let flat = parse_send_ack(json!({"id": "m1", "message": "hi", "createdAt": 3}), Some(&d))
			.unwrap()
			.unwrap();
		assert_eq!(flat.room_id, "r-1");

		let wrapped = parse_send_ack(json!({"data": {"id": "m1", "message": "hi", "createdAt": 3}}), Some(&d))
			.unwrap()
			.unwrap();
		assert_eq!(wrapped, flat);
	}

	#[test]
	fn send_payload_uses_wire_names() {
		let local = LocalId::new("l-1").unwrap();
		let p = SendMessagePayload::new(
			&details(),
			&local,
			"hi",
			&Identity::new("Ada", "ada@example.com"),
			&Identity::new("Bob", "bob@example.com"),
			&[],
		);
		let v = serde_json::to_value(&p).unwrap();
		assert_eq!(v["roomId"], "r-1");
		assert_eq!(v["senderEmail"], "ada@example.com");
		assert_eq!(v["receiverEmail"], "bob@example.com");
		assert_eq!(v["localId"], "l-1");
		assert!(v.get("files").is_none());
	}
}
