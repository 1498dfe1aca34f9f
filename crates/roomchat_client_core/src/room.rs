use std::time::Duration;

use roomchat_domain::{Message, RoomDetails, RoomRequest};
use roomchat_protocol::{JoinAck, JoinResponse, JoinRoomRequest, PayloadError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::AckSeq;
use crate::error::JoinError;
use crate::reconnect::{BackoffConfig, reconnect_delay};

/// A successful join: the room identity plus the backlog that became the timeline baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
	pub details: RoomDetails,
	pub backlog: Vec<Message>,
}

pub type JoinWaiter = oneshot::Sender<Result<JoinOutcome, JoinError>>;

/// A `room` frame to put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingJoin {
	pub ack: u64,
	pub payload: JoinRoomRequest,
}

/// What a join response did to the room session.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomUpdate {
	/// The room is (re)joined; the backlog is the new baseline.
	Joined(JoinResponse),
	Rejected(String),
	/// The response failed validation. An in-flight join is left to time out.
	Malformed(PayloadError),
	/// A `joinedRoom` push for a room that is neither joined nor being joined.
	Ignored,
}

/// Due join-timer work reported by [`RoomSession::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum RoomTimer {
	/// The in-flight join got no response. It is re-issued after `retry_in` while the connection holds.
	TimedOut { error: JoinError, retry_in: Duration },
	/// The retry delay elapsed; put this join on the wire.
	Retry(OutgoingJoin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinPhase {
	Idle,
	/// Waiting for a connection.
	Queued,
	InFlight { ack: u64, deadline: Instant },
	/// Connected, waiting to re-issue a timed-out join.
	RetryAt(Instant),
	Joined,
}

/// Join handshake and room identity for a single room.
#[derive(Debug)]
pub struct RoomSession {
	join_timeout: Duration,
	backoff: BackoffConfig,
	timeouts: u32,
	requested: Option<RoomRequest>,
	details: Option<RoomDetails>,
	phase: JoinPhase,
	waiter: Option<JoinWaiter>,
}

impl RoomSession {
	pub fn new(join_timeout: Duration, backoff: BackoffConfig) -> Self {
		Self {
			join_timeout,
			backoff,
			timeouts: 0,
			requested: None,
			details: None,
			phase: JoinPhase::Idle,
			waiter: None,
		}
	}

	pub fn details(&self) -> Option<&RoomDetails> {
		self.details.as_ref()
	}

	pub fn is_joined(&self) -> bool {
		self.phase == JoinPhase::Joined
	}

	pub fn requested(&self) -> Option<&RoomRequest> {
		self.requested.as_ref()
	}

	/// Request a join. Emitted right away when connected, otherwise queued until [`RoomSession::on_connected`].
	/// An unresolved earlier join is failed with [`JoinError::Superseded`].
	pub fn join(
		&mut self,
		request: RoomRequest,
		waiter: Option<JoinWaiter>,
		connected: bool,
		now: Instant,
		acks: &mut AckSeq,
	) -> Option<OutgoingJoin> {
		if let Some(previous) = self.waiter.take() {
			debug!("join superseded");
			let _ = previous.send(Err(JoinError::Superseded));
		}

		info!(room = %request.room, participants = request.participants.len(), "join requested");
		self.requested = Some(request);
		self.waiter = waiter;
		self.timeouts = 0;

		if connected {
			Some(self.issue(now, acks))
		} else {
			self.phase = JoinPhase::Queued;
			None
		}
	}

	/// Replay a queued join, or re-join the previously joined room, after (re)connecting.
	pub fn on_connected(&mut self, now: Instant, acks: &mut AckSeq) -> Option<OutgoingJoin> {
		if self.phase != JoinPhase::Queued || self.requested.is_none() {
			return None;
		}
		Some(self.issue(now, acks))
	}

	/// A join in flight is re-queued, not failed; a joined room is re-joined on reconnect.
	pub fn on_disconnected(&mut self) {
		match self.phase {
			JoinPhase::InFlight { .. } | JoinPhase::RetryAt(_) | JoinPhase::Joined => self.phase = JoinPhase::Queued,
			JoinPhase::Idle | JoinPhase::Queued => {}
		}
	}

	pub fn owns_ack(&self, ack: u64) -> bool {
		matches!(self.phase, JoinPhase::InFlight { ack: a, .. } if a == ack)
	}

	/// Handle the acknowledgment of the in-flight `room` event.
	pub fn on_ack(&mut self, data: serde_json::Value) -> RoomUpdate {
		match JoinAck::parse(data) {
			Ok(JoinAck::Accepted(response)) => self.apply_joined(response),
			Ok(JoinAck::Rejected(reason)) => {
				warn!(reason = %reason, "join rejected");
				self.requested = None;
				self.details = None;
				self.phase = JoinPhase::Idle;
				if let Some(waiter) = self.waiter.take() {
					let _ = waiter.send(Err(JoinError::Rejected(reason.clone())));
				}
				RoomUpdate::Rejected(reason)
			}
			Err(e) => RoomUpdate::Malformed(e),
		}
	}

	/// Handle a server-pushed `joinedRoom`.
	pub fn on_joined_room(&mut self, data: serde_json::Value) -> RoomUpdate {
		let response = match JoinResponse::parse_joined_room(data) {
			Ok(r) => r,
			Err(e) => return RoomUpdate::Malformed(e),
		};

		match self.phase {
			JoinPhase::InFlight { .. } => self.apply_joined(response),
			JoinPhase::Joined if self.details.as_ref().map(|d| &d.room_id) == Some(&response.details.room_id) => {
				self.apply_joined(response)
			}
			_ => {
				debug!(room_id = %response.details.room_id, "joinedRoom for an inactive room ignored");
				RoomUpdate::Ignored
			}
		}
	}

	/// Fire the join timeout, or re-issue a timed-out join once its retry delay has elapsed.
	///
	/// A timeout keeps the connection and the request, but the room is no longer considered joined.
	pub fn poll(&mut self, now: Instant, acks: &mut AckSeq) -> Option<RoomTimer> {
		match self.phase {
			JoinPhase::InFlight { deadline, .. } if deadline <= now => {
				self.timeouts = self.timeouts.saturating_add(1);
				let retry_in = reconnect_delay(self.timeouts, &self.backoff);
				warn!(timeout = ?self.join_timeout, retry_in_ms = retry_in.as_millis() as u64, "join timed out");

				self.phase = JoinPhase::RetryAt(now + retry_in);
				self.details = None;
				let error = JoinError::Timeout(self.join_timeout);
				if let Some(waiter) = self.waiter.take() {
					let _ = waiter.send(Err(error.clone()));
				}
				Some(RoomTimer::TimedOut { error, retry_in })
			}
			JoinPhase::RetryAt(at) if at <= now => {
				debug!(attempt = self.timeouts + 1, "re-issuing timed-out join");
				Some(RoomTimer::Retry(self.issue(now, acks)))
			}
			_ => None,
		}
	}

	pub fn next_deadline(&self) -> Option<Instant> {
		match self.phase {
			JoinPhase::InFlight { deadline, .. } => Some(deadline),
			JoinPhase::RetryAt(at) => Some(at),
			_ => None,
		}
	}

	/// Drops any join waiter unresolved.
	pub fn close(&mut self) {
		self.waiter = None;
		self.requested = None;
		self.details = None;
		self.phase = JoinPhase::Idle;
	}

	fn issue(&mut self, now: Instant, acks: &mut AckSeq) -> OutgoingJoin {
		let ack = acks.next_id();
		self.phase = JoinPhase::InFlight {
			ack,
			deadline: now + self.join_timeout,
		};

		let (room, users) = match &self.requested {
			Some(r) => (r.room.clone(), r.participants.clone()),
			None => (String::new(), Vec::new()),
		};
		debug!(room = %room, ack, "join emitted");

		OutgoingJoin {
			ack,
			payload: JoinRoomRequest { room, users },
		}
	}

	fn apply_joined(&mut self, response: JoinResponse) -> RoomUpdate {
		info!(room = %response.details, backlog = response.backlog.len(), "joined room");
		self.details = Some(response.details.clone());
		self.phase = JoinPhase::Joined;
		self.timeouts = 0;
		if let Some(waiter) = self.waiter.take() {
			let _ = waiter.send(Ok(JoinOutcome {
				details: response.details.clone(),
				backlog: response.backlog.clone(),
			}));
		}
		RoomUpdate::Joined(response)
	}
}

#[cfg(test)]
mod tests {
	use roomchat_domain::Participant;
	use serde_json::json;

	use super::*;

	fn request() -> RoomRequest {
		RoomRequest::new("testing", vec![Participant::new("u1", "ada@example.com")])
	}

	fn accepted() -> serde_json::Value {
		json!({
			"roomName": "testing",
			"roomId": "r-1",
			"messages": [
				{"id": "m1", "message": "hello", "createdAt": "2023-04-06T13:24:24.000Z"}
			]
		})
	}

	#[test]
	fn queued_join_is_replayed_on_connect() {
		let now = Instant::now();
		let mut acks = AckSeq::new();
		let mut room = RoomSession::new(Duration::from_secs(10), BackoffConfig::default());

		let (tx, mut rx) = oneshot::channel();
		assert!(room.join(request(), Some(tx), false, now, &mut acks).is_none());
		assert_eq!(room.next_deadline(), None);

		let out = room.on_connected(now, &mut acks).unwrap();
		assert_eq!(out.payload.room, "testing");
		assert_eq!(out.payload.users.len(), 1);
		assert!(room.owns_ack(out.ack));

		match room.on_ack(accepted()) {
			RoomUpdate::Joined(resp) => assert_eq!(resp.backlog.len(), 1),
			other => panic!("unexpected update: {other:?}"),
		}
		let outcome = rx.try_recv().unwrap().unwrap();
		assert_eq!(outcome.details.room_id.as_str(), "r-1");
		assert!(room.is_joined());
		assert_eq!(room.next_deadline(), None);
	}

	#[test]
	fn rejection_fails_the_waiter() {
		let now = Instant::now();
		let mut acks = AckSeq::new();
		let mut room = RoomSession::new(Duration::from_secs(10), BackoffConfig::default());

		let (tx, mut rx) = oneshot::channel();
		room.join(request(), Some(tx), true, now, &mut acks).unwrap();

		assert_eq!(
			room.on_ack(json!({"error": "room is full"})),
			RoomUpdate::Rejected("room is full".to_string())
		);
		assert_eq!(rx.try_recv().unwrap(), Err(JoinError::Rejected("room is full".to_string())));
		assert!(room.details().is_none());
		assert!(room.on_connected(now, &mut acks).is_none());
	}

	#[test]
	fn timeout_keeps_request_for_reconnect() {
		let now = Instant::now();
		let mut acks = AckSeq::new();
		let mut room = RoomSession::new(Duration::from_secs(10), BackoffConfig::default());

		let (tx, mut rx) = oneshot::channel();
		let first = room.join(request(), Some(tx), true, now, &mut acks).unwrap();

		assert_eq!(room.poll(now + Duration::from_secs(9), &mut acks), None);
		assert!(matches!(
			room.poll(now + Duration::from_secs(10), &mut acks),
			Some(RoomTimer::TimedOut { error: JoinError::Timeout(_), .. })
		));
		assert_eq!(rx.try_recv().unwrap(), Err(JoinError::Timeout(Duration::from_secs(10))));
		assert!(!room.owns_ack(first.ack));

		room.on_disconnected();
		let again = room.on_connected(now, &mut acks).unwrap();
		assert_ne!(again.ack, first.ack);
	}

	#[test]
	fn timed_out_rejoin_is_retried_while_connected() {
		let mut now = Instant::now();
		let mut acks = AckSeq::new();
		let mut room = RoomSession::new(Duration::from_secs(10), BackoffConfig::default());
		room.join(request(), None, true, now, &mut acks).unwrap();
		room.on_ack(accepted());

		room.on_disconnected();
		room.on_connected(now, &mut acks).unwrap();

		now += Duration::from_secs(10);
		let Some(RoomTimer::TimedOut { retry_in, .. }) = room.poll(now, &mut acks) else {
			panic!("expected a join timeout");
		};
		assert!(room.details().is_none());
		assert!(!room.is_joined());
		assert_eq!(room.next_deadline(), Some(now + retry_in));
		assert_eq!(room.on_connected(now, &mut acks), None);

		now += retry_in;
		let Some(RoomTimer::Retry(rejoin)) = room.poll(now, &mut acks) else {
			panic!("expected the join to be re-issued");
		};
		assert_eq!(rejoin.payload.room, "testing");
		assert!(room.owns_ack(rejoin.ack));

		room.on_ack(accepted());
		assert!(room.is_joined());
		assert_eq!(room.details().map(|d| d.room_id.as_str()), Some("r-1"));
	}

	#[test]
	fn later_join_supersedes() {
		let now = Instant::now();
		let mut acks = AckSeq::new();
		let mut room = RoomSession::new(Duration::from_secs(10), BackoffConfig::default());

		let (tx1, mut rx1) = oneshot::channel();
		let (tx2, _rx2) = oneshot::channel();
		room.join(request(), Some(tx1), false, now, &mut acks);
		room.join(RoomRequest::new("other", Vec::new()), Some(tx2), false, now, &mut acks);

		assert_eq!(rx1.try_recv().unwrap(), Err(JoinError::Superseded));
		assert_eq!(room.requested().map(|r| r.room.as_str()), Some("other"));
	}

	#[test]
	fn in_flight_join_is_requeued_on_drop() {
		let now = Instant::now();
		let mut acks = AckSeq::new();
		let mut room = RoomSession::new(Duration::from_secs(10), BackoffConfig::default());

		let (tx, mut rx) = oneshot::channel();
		room.join(request(), Some(tx), true, now, &mut acks).unwrap();
		room.on_disconnected();
		assert_eq!(room.next_deadline(), None);
		assert!(rx.try_recv().is_err());

		let replay = room.on_connected(now, &mut acks).unwrap();
		room.on_ack(accepted());
		assert!(rx.try_recv().unwrap().is_ok());
		assert!(!room.owns_ack(replay.ack));
	}

	#[test]
	fn joined_room_is_rejoined_after_reconnect() {
		let now = Instant::now();
		let mut acks = AckSeq::new();
		let mut room = RoomSession::new(Duration::from_secs(10), BackoffConfig::default());
		room.join(request(), None, true, now, &mut acks).unwrap();
		room.on_ack(accepted());

		room.on_disconnected();
		let rejoin = room.on_connected(now, &mut acks).unwrap();
		assert_eq!(rejoin.payload.room, "testing");
		assert_eq!(room.details().map(|d| d.room_id.as_str()), Some("r-1"));
	}

	#[test]
	fn malformed_ack_is_left_to_time_out() {
		let now = Instant::now();
		let mut acks = AckSeq::new();
		let mut room = RoomSession::new(Duration::from_secs(10), BackoffConfig::default());
		let out = room.join(request(), None, true, now, &mut acks).unwrap();

		assert!(matches!(room.on_ack(json!({"roomName": "testing"})), RoomUpdate::Malformed(_)));
		assert!(room.owns_ack(out.ack));
	}

	#[test]
	fn joined_room_push_resolves_or_reseeds() {
		let now = Instant::now();
		let mut acks = AckSeq::new();
		let mut room = RoomSession::new(Duration::from_secs(10), BackoffConfig::default());

		assert_eq!(room.on_joined_room(json!({"room": "testing", "roomId": "r-1"})), RoomUpdate::Ignored);

		let (tx, mut rx) = oneshot::channel();
		room.join(request(), Some(tx), true, now, &mut acks).unwrap();
		assert!(matches!(
			room.on_joined_room(json!({"room": "testing", "roomId": "r-1", "messages": []})),
			RoomUpdate::Joined(_)
		));
		assert!(rx.try_recv().unwrap().is_ok());

		assert!(matches!(
			room.on_joined_room(json!({"room": "testing", "roomId": "r-1", "messages": []})),
			RoomUpdate::Joined(_)
		));
		assert_eq!(
			room.on_joined_room(json!({"room": "elsewhere", "roomId": "r-9"})),
			RoomUpdate::Ignored
		);
	}

	#[test]
	fn close_drops_waiter_unresolved() {
		let now = Instant::now();
		let mut acks = AckSeq::new();
		let mut room = RoomSession::new(Duration::from_secs(10), BackoffConfig::default());
		let (tx, mut rx) = oneshot::channel();
		room.join(request(), Some(tx), true, now, &mut acks);
		room.close();
		assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
	}
}
