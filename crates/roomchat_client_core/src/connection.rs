use std::fmt;
use std::time::Duration;

use roomchat_util::endpoint::WsEndpoint;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SecretString;
use crate::reconnect::{BackoffConfig, reconnect_delay};

/// Transport connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
	#[default]
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
			ConnectionState::Reconnecting => "reconnecting",
		};
		f.write_str(s)
	}
}

pub type StateListener = Box<dyn FnMut(ConnectionState) + Send>;
pub type EventListener = Box<dyn FnMut(&serde_json::Value) + Send>;

/// Where to connect.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
	pub endpoint: WsEndpoint,
	pub credential: SecretString,
}

/// Timer outcome reported by [`ConnectionManager::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTimer {
	/// Backoff elapsed; start a new connect attempt.
	Reconnect,
	/// The in-flight attempt exceeded the connect timeout; drop it. The next retry is already scheduled.
	ConnectTimedOut { retry_in: Duration },
}

/// Per-session monotonic acknowledgment id source. Never reset, so an ack from a previous connection
/// can never be mistaken for a current one.
#[derive(Debug)]
pub struct AckSeq {
	next: u64,
}

impl AckSeq {
	pub fn new() -> Self {
		Self { next: 1 }
	}

	pub fn next_id(&mut self) -> u64 {
		let id = self.next;
		self.next = self.next.wrapping_add(1).max(1);
		id
	}
}

impl Default for AckSeq {
	fn default() -> Self {
		Self::new()
	}
}

/// Connection lifecycle state machine.
///
/// `Disconnected →(open)→ Connecting →(success)→ Connected`, `Connected →(drop)→ Reconnecting →(backoff)→
/// Connecting`, `Connecting →(failure)→ Reconnecting`, and any state `→(close)→ Disconnected`.
///
/// The manager holds no I/O. The session driver performs the connect attempts it asks for and reports their
/// outcome back; timers are exposed as deadlines via [`ConnectionManager::next_deadline`].
pub struct ConnectionManager {
	state: ConnectionState,
	target: Option<ConnectTarget>,
	backoff: BackoffConfig,
	connect_timeout: Duration,
	attempt: u32,
	retry_deadline: Option<Instant>,
	connect_deadline: Option<Instant>,
	state_listeners: Vec<StateListener>,
	event_listeners: Vec<(String, EventListener)>,
}

impl ConnectionManager {
	pub fn new(backoff: BackoffConfig, connect_timeout: Duration) -> Self {
		Self {
			state: ConnectionState::Disconnected,
			target: None,
			backoff,
			connect_timeout,
			attempt: 0,
			retry_deadline: None,
			connect_deadline: None,
			state_listeners: Vec::new(),
			event_listeners: Vec::new(),
		}
	}

	pub fn state(&self) -> ConnectionState {
		self.state
	}

	pub fn is_connected(&self) -> bool {
		self.state == ConnectionState::Connected
	}

	/// Consecutive failed attempts since the last successful connect.
	pub fn attempt(&self) -> u32 {
		self.attempt
	}

	pub fn target(&self) -> Option<&ConnectTarget> {
		self.target.as_ref()
	}

	/// Begin connecting. Returns `false` when the manager is already open.
	pub fn open(&mut self, endpoint: WsEndpoint, credential: SecretString, now: Instant) -> bool {
		if self.state != ConnectionState::Disconnected {
			debug!(state = %self.state, "open ignored: connection already open");
			return false;
		}

		info!(endpoint = %endpoint, "opening connection");
		self.target = Some(ConnectTarget { endpoint, credential });
		self.attempt = 0;
		self.retry_deadline = None;
		self.connect_deadline = Some(now + self.connect_timeout);
		self.transition(ConnectionState::Connecting);
		true
	}

	pub fn on_connected(&mut self) {
		if self.state != ConnectionState::Connecting {
			return;
		}
		self.attempt = 0;
		self.connect_deadline = None;
		self.retry_deadline = None;
		self.transition(ConnectionState::Connected);
	}

	/// A connect attempt failed. Returns the backoff before the next attempt, or `None` when closed.
	pub fn on_connect_failed(&mut self, now: Instant) -> Option<Duration> {
		if self.state != ConnectionState::Connecting {
			return None;
		}
		Some(self.schedule_retry(now))
	}

	/// The established connection dropped. Returns the backoff before the next attempt, or `None` when
	/// there was no live connection.
	pub fn on_dropped(&mut self, now: Instant) -> Option<Duration> {
		if self.state != ConnectionState::Connected {
			return None;
		}
		Some(self.schedule_retry(now))
	}

	/// Fire due timers.
	pub fn poll(&mut self, now: Instant) -> Option<ConnectionTimer> {
		match self.state {
			ConnectionState::Reconnecting => {
				let due = self.retry_deadline.is_some_and(|d| d <= now);
				if !due {
					return None;
				}
				self.retry_deadline = None;
				self.connect_deadline = Some(now + self.connect_timeout);
				self.transition(ConnectionState::Connecting);
				Some(ConnectionTimer::Reconnect)
			}
			ConnectionState::Connecting => {
				let due = self.connect_deadline.is_some_and(|d| d <= now);
				if !due {
					return None;
				}
				let retry_in = self.schedule_retry(now);
				Some(ConnectionTimer::ConnectTimedOut { retry_in })
			}
			_ => None,
		}
	}

	pub fn next_deadline(&self) -> Option<Instant> {
		match self.state {
			ConnectionState::Reconnecting => self.retry_deadline,
			ConnectionState::Connecting => self.connect_deadline,
			_ => None,
		}
	}

	/// Terminal teardown. No reconnect happens from `Disconnected`.
	pub fn close(&mut self) {
		self.target = None;
		self.attempt = 0;
		self.retry_deadline = None;
		self.connect_deadline = None;
		self.transition(ConnectionState::Disconnected);
	}

	pub fn on_state_change(&mut self, listener: StateListener) {
		self.state_listeners.push(listener);
	}

	pub fn on_event(&mut self, name: impl Into<String>, listener: EventListener) {
		self.event_listeners.push((name.into(), listener));
	}

	/// Deliver a raw inbound event to listeners registered for `name`, in registration order.
	pub fn emit_event(&mut self, name: &str, data: &serde_json::Value) {
		for (event, listener) in self.event_listeners.iter_mut() {
			if event == name {
				listener(data);
			}
		}
	}

	fn schedule_retry(&mut self, now: Instant) -> Duration {
		self.attempt = self.attempt.saturating_add(1).max(1);
		let delay = reconnect_delay(self.attempt, &self.backoff);
		self.retry_deadline = Some(now + delay);
		self.connect_deadline = None;
		self.transition(ConnectionState::Reconnecting);
		delay
	}

	fn transition(&mut self, to: ConnectionState) {
		if self.state == to {
			return;
		}
		debug!(from = %self.state, to = %to, "connection state change");
		self.state = to;
		for listener in self.state_listeners.iter_mut() {
			listener(to);
		}
	}
}

impl fmt::Debug for ConnectionManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionManager")
			.field("state", &self.state)
			.field("target", &self.target)
			.field("attempt", &self.attempt)
			.field("retry_deadline", &self.retry_deadline)
			.field("connect_deadline", &self.connect_deadline)
			.field("state_listeners", &self.state_listeners.len())
			.field("event_listeners", &self.event_listeners.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use super::*;

	fn manager() -> ConnectionManager {
		ConnectionManager::new(BackoffConfig::default(), Duration::from_secs(15))
	}

	fn endpoint() -> WsEndpoint {
		WsEndpoint::parse("ws://localhost:3000").unwrap()
	}

	#[test]
	fn open_connect_drop_reconnect() {
		let now = Instant::now();
		let mut m = manager();
		assert_eq!(m.state(), ConnectionState::Disconnected);

		assert!(m.open(endpoint(), SecretString::new("t"), now));
		assert_eq!(m.state(), ConnectionState::Connecting);
		assert!(!m.open(endpoint(), SecretString::new("t"), now));

		m.on_connected();
		assert_eq!(m.state(), ConnectionState::Connected);
		assert_eq!(m.next_deadline(), None);

		let delay = m.on_dropped(now).unwrap();
		assert_eq!(m.state(), ConnectionState::Reconnecting);
		assert_eq!(m.attempt(), 1);
		assert!(delay >= Duration::from_millis(450) && delay <= Duration::from_millis(550));

		assert_eq!(m.poll(now), None);
		assert_eq!(m.poll(now + delay), Some(ConnectionTimer::Reconnect));
		assert_eq!(m.state(), ConnectionState::Connecting);
	}

	#[test]
	fn failures_grow_backoff_and_success_resets() {
		let mut now = Instant::now();
		let mut m = manager();
		m.open(endpoint(), SecretString::default(), now);

		let mut last = Duration::ZERO;
		for expected in 1..=4u32 {
			let delay = m.on_connect_failed(now).unwrap();
			assert_eq!(m.attempt(), expected);
			assert!(delay > last);
			last = delay;
			now += delay;
			assert_eq!(m.poll(now), Some(ConnectionTimer::Reconnect));
		}

		m.on_connected();
		assert_eq!(m.attempt(), 0);
	}

	#[test]
	fn connect_timeout_counts_as_failure() {
		let now = Instant::now();
		let mut m = manager();
		m.open(endpoint(), SecretString::default(), now);
		assert_eq!(m.next_deadline(), Some(now + Duration::from_secs(15)));

		let fired = m.poll(now + Duration::from_secs(15));
		assert!(matches!(fired, Some(ConnectionTimer::ConnectTimedOut { .. })));
		assert_eq!(m.state(), ConnectionState::Reconnecting);
		assert_eq!(m.attempt(), 1);
	}

	#[test]
	fn no_reconnect_from_disconnected() {
		let now = Instant::now();
		let mut m = manager();
		m.open(endpoint(), SecretString::default(), now);
		m.on_connected();
		m.close();

		assert_eq!(m.state(), ConnectionState::Disconnected);
		assert_eq!(m.on_dropped(now), None);
		assert_eq!(m.on_connect_failed(now), None);
		assert_eq!(m.poll(now + Duration::from_secs(3600)), None);
		assert_eq!(m.next_deadline(), None);
		assert!(m.target().is_none());
	}

	#[test]
	fn close_mid_connect_cancels_timers() {
		let now = Instant::now();
		let mut m = manager();
		m.open(endpoint(), SecretString::default(), now);
		m.close();
		assert_eq!(m.poll(now + Duration::from_secs(60)), None);
		assert_eq!(m.state(), ConnectionState::Disconnected);
	}

	#[test]
	fn listeners_fire_in_registration_order() {
		let log = Arc::new(Mutex::new(Vec::new()));
		let now = Instant::now();
		let mut m = manager();

		let l1 = Arc::clone(&log);
		m.on_state_change(Box::new(move |s| l1.lock().unwrap().push(format!("a:{s}"))));
		let l2 = Arc::clone(&log);
		m.on_state_change(Box::new(move |s| l2.lock().unwrap().push(format!("b:{s}"))));

		m.open(endpoint(), SecretString::default(), now);
		m.on_connected();

		assert_eq!(
			*log.lock().unwrap(),
			vec!["a:connecting", "b:connecting", "a:connected", "b:connected"]
		);
	}

	#[test]
	fn event_listeners_filter_by_name() {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let mut m = manager();

		let s1 = Arc::clone(&seen);
		m.on_event("receiveMessage", Box::new(move |v| s1.lock().unwrap().push(v.clone())));

		m.emit_event("joinedRoom", &serde_json::json!(1));
		m.emit_event("receiveMessage", &serde_json::json!(2));

		assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!(2)]);
	}

	#[test]
	fn ack_ids_are_monotonic() {
		let mut seq = AckSeq::new();
		assert_eq!(seq.next_id(), 1);
		assert_eq!(seq.next_id(), 2);
		assert_eq!(seq.next_id(), 3);
	}
}
