#![forbid(unsafe_code)]

use crate::framing::Envelope;

/// Client → server: join a room (acknowledged).
pub const ROOM: &str = "room";
/// Client → server: send a chat message (acknowledged).
pub const SEND_MESSAGE: &str = "sendMessage";

/// Server → client: connection established.
pub const CONNECT: &str = "connect";
/// Server → client: server-initiated disconnect.
pub const DISCONNECT: &str = "disconnect";
/// Server → client: room joined, with backlog.
pub const JOINED_ROOM: &str = "joinedRoom";
/// Server → client: a single new message under `data`.
pub const RECEIVE_MESSAGE: &str = "receiveMessage";
/// Server → client: response to an acknowledged client event.
pub const ACK: &str = "ack";

/// Inbound frame, routed by event name. Payloads are still raw; validation happens in [`crate::payloads`].
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
	Connect,
	Disconnect { reason: Option<String> },
	JoinedRoom(serde_json::Value),
	ReceiveMessage(serde_json::Value),
	Ack { ack: u64, data: serde_json::Value },
	Other { event: String, data: serde_json::Value },
}

impl Inbound {
	pub fn event_name(&self) -> &str {
		match self {
			Inbound::Connect => CONNECT,
			Inbound::Disconnect { .. } => DISCONNECT,
			Inbound::JoinedRoom(_) => JOINED_ROOM,
			Inbound::ReceiveMessage(_) => RECEIVE_MESSAGE,
			Inbound::Ack { .. } => ACK,
			Inbound::Other { event, .. } => event,
		}
	}
}

/// Route an envelope by its event name.
///
/// An `ack` frame without an ack number cannot be correlated and is returned as [`Inbound::Other`].
pub fn classify(env: Envelope) -> Inbound {
	match (env.event.as_str(), env.ack) {
		(CONNECT, _) => Inbound::Connect,
		(DISCONNECT, _) => Inbound::Disconnect {
			reason: match env.data {
				serde_json::Value::String(s) => Some(s),
				serde_json::Value::Object(ref o) => o.get("reason").and_then(|r| r.as_str()).map(str::to_string),
				_ => None,
			},
		},
		(JOINED_ROOM, _) => Inbound::JoinedRoom(env.data),
		(RECEIVE_MESSAGE, _) => Inbound::ReceiveMessage(env.data),
		(ACK, Some(ack)) => Inbound::Ack { ack, data: env.data },
		_ => Inbound::Other {
			event: env.event,
			data: env.data,
		},
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn routes_known_events() {
		assert_eq!(classify(Envelope::new(CONNECT, json!(null))), Inbound::Connect);
		assert_eq!(
			classify(Envelope::new(DISCONNECT, json!("io server disconnect"))),
			Inbound::Disconnect {
				reason: Some("io server disconnect".to_string())
			}
		);
		assert_eq!(
			classify(Envelope::new(ACK, json!({"ok": true})).with_ack(7)),
			Inbound::Ack {
				ack: 7,
				data: json!({"ok": true})
			}
		);
		assert!(matches!(
			classify(Envelope::new(RECEIVE_MESSAGE, json!({}))),
			Inbound::ReceiveMessage(_)
		));
	}

	#[test]
	fn ack_without_number_is_other() {
		let inbound = classify(Envelope::new(ACK, json!({})));
		assert_eq!(inbound.event_name(), ACK);
		assert!(matches!(inbound, Inbound::Other { .. }));
	}
}
