use std::time::Duration;

use chrono::{DateTime, Utc};
use roomchat_domain::{Delivery, Identity, LocalId, Message, RoomDetails};
use roomchat_protocol::payloads::parse_send_ack;
use roomchat_protocol::{PayloadError, SendMessagePayload};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::AckSeq;

/// Send retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
	pub ack_timeout: Duration,
	/// Total emissions of one send, the first included.
	pub max_attempts: u32,
	pub sender: Identity,
	pub receiver: Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
	/// Waiting for a connected, joined room.
	Queued,
	InFlight { ack: u64, deadline: Instant },
	/// Acknowledged without the stored message; waiting for the echo.
	Acked,
	Failed,
}

/// A locally originated message not yet reconciled with the server.
#[derive(Debug, Clone)]
pub struct PendingSend {
	pub local_id: LocalId,
	pub message: Message,
	pub sent_at: DateTime<Utc>,
	pub attempt: u32,
	state: SendState,
}

impl PendingSend {
	pub fn is_failed(&self) -> bool {
		self.state == SendState::Failed
	}
}

/// A send that ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSend {
	pub local_id: LocalId,
	pub body: String,
	pub attempts: u32,
}

/// A `sendMessage` frame to put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingSend {
	pub ack: u64,
	pub payload: SendMessagePayload,
}

/// Result of routing an `ack` frame to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
	/// Not one of ours.
	Unknown,
	/// The ack carried the stored message.
	Confirmed { local_id: LocalId, message: Message },
	/// Acknowledged without the stored message; retries stop, the echo will reconcile it.
	Acked { local_id: LocalId },
	/// Acknowledged, but the attached message failed validation.
	Malformed { local_id: LocalId, error: PayloadError },
}

/// Due-timer work reported by [`OutboundDispatcher::poll`].
#[derive(Debug, Default)]
pub struct DispatchPoll {
	pub resend: Vec<OutgoingSend>,
	pub failed: Vec<FailedSend>,
}

/// Outgoing messages: optimistic rendering, emission, ack-driven retry and reconciliation.
#[derive(Debug)]
pub struct OutboundDispatcher {
	cfg: DispatchConfig,
	pending: Vec<PendingSend>,
	room: Option<RoomDetails>,
}

impl OutboundDispatcher {
	pub fn new(cfg: DispatchConfig) -> Self {
		Self {
			cfg,
			pending: Vec::new(),
			room: None,
		}
	}

	/// Create a pending send and its optimistic timeline entry. Nothing is emitted until
	/// [`OutboundDispatcher::flush`].
	pub fn send(&mut self, body: String, attachments: Vec<String>) -> Message {
		let local_id = LocalId::new_v4();
		let now = Utc::now();
		let (room, room_id) = match &self.room {
			Some(r) => (r.room.clone(), r.room_id.as_str().to_string()),
			None => (String::new(), String::new()),
		};

		let message = Message {
			id: None,
			local_id: Some(local_id.clone()),
			room,
			room_id,
			sender: self.cfg.sender.clone(),
			receiver: self.cfg.receiver.clone(),
			body,
			created_at: now,
			updated_at: None,
			message_id: None,
			attachments,
			delivery: Delivery::Pending,
		};

		debug!(local_id = %local_id, "send queued");
		self.pending.push(PendingSend {
			local_id,
			message: message.clone(),
			sent_at: now,
			attempt: 0,
			state: SendState::Queued,
		});
		message
	}

	/// Emit every queued send when a room is ready.
	pub fn flush(&mut self, now: Instant, acks: &mut AckSeq) -> Vec<OutgoingSend> {
		let Some(room) = self.room.clone() else {
			return Vec::new();
		};
		let ack_timeout = self.cfg.ack_timeout;

		self.pending
			.iter_mut()
			.filter(|p| p.state == SendState::Queued)
			.map(|p| emit(p, &room, now, ack_timeout, acks))
			.collect()
	}

	/// Connected and joined: bind room-less sends to `room` and resume from attempt 1.
	pub fn on_room_ready(&mut self, room: RoomDetails, now: Instant, acks: &mut AckSeq) -> Vec<OutgoingSend> {
		for p in self.pending.iter_mut() {
			if p.message.room_id.is_empty() {
				p.message.room = room.room.clone();
				p.message.room_id = room.room_id.as_str().to_string();
			}
			if let SendState::InFlight { .. } = p.state {
				p.state = SendState::Queued;
			}
			if p.state == SendState::Queued {
				p.attempt = 0;
			}
		}
		self.room = Some(room);
		self.flush(now, acks)
	}

	/// A join resolved to `room`: sends written for any other room are abandoned, never re-targeted.
	///
	/// Unacknowledged ones are reported as failed; acked or already failed ones are dropped quietly.
	pub fn release_other_rooms(&mut self, room: &RoomDetails) -> Vec<FailedSend> {
		let room_id = room.room_id.as_str();
		let mut failed = Vec::new();
		self.pending.retain(|p| {
			if p.message.room_id.is_empty() || p.message.room_id == room_id {
				return true;
			}
			debug!(local_id = %p.local_id, from = %p.message.room_id, to = room_id, "send left behind by room switch");
			if matches!(p.state, SendState::Queued | SendState::InFlight { .. }) {
				failed.push(FailedSend {
					local_id: p.local_id.clone(),
					body: p.message.body.clone(),
					attempts: p.attempt,
				});
			}
			false
		});
		failed
	}

	/// The room could not be (re)joined in time: everything waiting for it fails instead of waiting silently.
	pub fn fail_queued(&mut self) -> Vec<FailedSend> {
		self.pending
			.iter_mut()
			.filter(|p| p.state == SendState::Queued)
			.map(|p| {
				warn!(local_id = %p.local_id, "send failed: room not joined");
				p.state = SendState::Failed;
				p.message.delivery = Delivery::Failed;
				FailedSend {
					local_id: p.local_id.clone(),
					body: p.message.body.clone(),
					attempts: p.attempt,
				}
			})
			.collect()
	}

	/// Connection dropped or a re-join started: retries are suspended until the room is ready again.
	pub fn suspend(&mut self) {
		self.room = None;
		for p in self.pending.iter_mut() {
			if let SendState::InFlight { .. } = p.state {
				p.state = SendState::Queued;
				p.attempt = 0;
			}
		}
	}

	pub fn owns_ack(&self, ack: u64) -> bool {
		self.pending
			.iter()
			.any(|p| matches!(p.state, SendState::InFlight { ack: a, .. } if a == ack))
	}

	pub fn on_ack(&mut self, ack: u64, data: serde_json::Value) -> AckOutcome {
		let Some(idx) = self
			.pending
			.iter()
			.position(|p| matches!(p.state, SendState::InFlight { ack: a, .. } if a == ack))
		else {
			return AckOutcome::Unknown;
		};

		match parse_send_ack(data, self.room.as_ref()) {
			Ok(Some(message)) => {
				let p = self.pending.remove(idx);
				debug!(local_id = %p.local_id, ack, "send confirmed by ack");
				AckOutcome::Confirmed {
					local_id: p.local_id,
					message,
				}
			}
			Ok(None) => {
				let p = &mut self.pending[idx];
				p.state = SendState::Acked;
				debug!(local_id = %p.local_id, ack, "send acked; awaiting echo");
				AckOutcome::Acked {
					local_id: p.local_id.clone(),
				}
			}
			Err(error) => {
				let p = &mut self.pending[idx];
				p.state = SendState::Acked;
				AckOutcome::Malformed {
					local_id: p.local_id.clone(),
					error,
				}
			}
		}
	}

	/// Match a confirmed server message against pending sends. Returns the reconciled local id.
	///
	/// An echoed `local_id` is authoritative. Without one, the best candidate is a pending send in the same
	/// room, from the same sender, with the same body, sent nearest to the server timestamp.
	pub fn reconcile(&mut self, message: &Message) -> Option<LocalId> {
		let idx = match &message.local_id {
			Some(local_id) => self.pending.iter().position(|p| &p.local_id == local_id)?,
			None => self.best_effort_match(message)?,
		};
		let p = self.pending.remove(idx);
		if p.is_failed() {
			info!(local_id = %p.local_id, "late echo reconciled a failed send");
		}
		Some(p.local_id)
	}

	fn best_effort_match(&self, message: &Message) -> Option<usize> {
		self.pending
			.iter()
			.enumerate()
			.filter(|(_, p)| p.message.room_id == message.room_id || p.message.room_id.is_empty())
			.filter(|(_, p)| same_sender(&p.message.sender, &message.sender))
			.filter(|(_, p)| p.message.body == message.body)
			.min_by_key(|(_, p)| (p.sent_at - message.created_at).num_milliseconds().unsigned_abs())
			.map(|(idx, _)| idx)
	}

	/// Fire ack timeouts: re-emit, or fail once the attempt ceiling is reached.
	pub fn poll(&mut self, now: Instant, acks: &mut AckSeq) -> DispatchPoll {
		let mut out = DispatchPoll::default();
		let Some(room) = self.room.clone() else {
			return out;
		};
		let ack_timeout = self.cfg.ack_timeout;
		let max_attempts = self.cfg.max_attempts.max(1);

		for p in self.pending.iter_mut() {
			let SendState::InFlight { deadline, .. } = p.state else {
				continue;
			};
			if deadline > now {
				continue;
			}

			if p.attempt >= max_attempts {
				warn!(local_id = %p.local_id, attempts = p.attempt, "send failed: no acknowledgment");
				p.state = SendState::Failed;
				p.message.delivery = Delivery::Failed;
				out.failed.push(FailedSend {
					local_id: p.local_id.clone(),
					body: p.message.body.clone(),
					attempts: p.attempt,
				});
			} else {
				debug!(local_id = %p.local_id, attempt = p.attempt + 1, "ack timeout; re-emitting");
				out.resend.push(emit(p, &room, now, ack_timeout, acks));
			}
		}

		out
	}

	/// Re-queue a failed send from attempt 1. Returns `false` if `local_id` is not a failed send.
	pub fn resend(&mut self, local_id: &LocalId) -> bool {
		let Some(p) = self.pending.iter_mut().find(|p| &p.local_id == local_id && p.is_failed()) else {
			return false;
		};
		p.state = SendState::Queued;
		p.attempt = 0;
		p.message.delivery = Delivery::Pending;
		true
	}

	pub fn next_deadline(&self) -> Option<Instant> {
		if self.room.is_none() {
			return None;
		}
		self.pending
			.iter()
			.filter_map(|p| match p.state {
				SendState::InFlight { deadline, .. } => Some(deadline),
				_ => None,
			})
			.min()
	}

	/// Optimistic entries that are still unreconciled, for re-applying on top of a new baseline.
	pub fn pending_messages(&self) -> impl Iterator<Item = &Message> {
		self.pending.iter().map(|p| &p.message)
	}

	pub fn pending(&self) -> &[PendingSend] {
		&self.pending
	}

	pub fn close(&mut self) {
		self.pending.clear();
		self.room = None;
	}
}

fn same_sender(a: &Identity, b: &Identity) -> bool {
	if !a.email.is_empty() || !b.email.is_empty() {
		a.email.eq_ignore_ascii_case(&b.email)
	} else {
		a.name == b.name
	}
}

fn emit(
	p: &mut PendingSend,
	room: &RoomDetails,
	now: Instant,
	ack_timeout: Duration,
	acks: &mut AckSeq,
) -> OutgoingSend {
	let ack = acks.next_id();
	p.attempt = p.attempt.saturating_add(1);
	p.state = SendState::InFlight {
		ack,
		deadline: now + ack_timeout,
	};
	p.message.delivery = Delivery::Pending;
	p.sent_at = Utc::now();

	OutgoingSend {
		ack,
		payload: SendMessagePayload::new(
			room,
			&p.local_id,
			&p.message.body,
			&p.message.sender,
			&p.message.receiver,
			&p.message.attachments,
		),
	}
}
