use std::sync::Arc;
use std::time::Duration;

use roomchat_domain::{LocalId, Message, RoomDetails, RoomRequest};
use roomchat_protocol::events::{JOINED_ROOM, ROOM, SEND_MESSAGE};
use roomchat_protocol::payloads::parse_receive_message;
use roomchat_protocol::{Envelope, FramingError, Inbound, PayloadError, classify, decode_frame, encode_frame};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{AckSeq, ConnectionManager, ConnectionState, ConnectionTimer, EventListener, StateListener};
use crate::dispatcher::{AckOutcome, DispatchConfig, FailedSend, OutboundDispatcher, OutgoingSend};
use crate::error::{ClientCoreError, JoinError};
use crate::room::{JoinWaiter, OutgoingJoin, RoomSession, RoomTimer, RoomUpdate};
use crate::store::MessageStore;
use crate::transport::{BoxFuture, ConnectRequest, Connector, TransportEvent, TransportLink};

/// Consistent read model published after every change.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
	pub connection: ConnectionState,
	pub room: Option<RoomDetails>,
	pub messages: Arc<[Message]>,
}

impl Default for SessionSnapshot {
	fn default() -> Self {
		Self {
			connection: ConnectionState::Disconnected,
			room: None,
			messages: Arc::from(Vec::new()),
		}
	}
}

impl SessionSnapshot {
	fn differs(&self, other: &SessionSnapshot) -> bool {
		self.connection != other.connection || self.room != other.room || !Arc::ptr_eq(&self.messages, &other.messages)
	}
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
	Connecting,
	Connected,
	Reconnecting { attempt: u32, next_retry_in_ms: u64 },
	Disconnected { reason: String },
	Joined { details: RoomDetails, backlog_len: usize },
	JoinFailed(JoinError),
	SendFailed(FailedSend),
	MalformedPayload { event: String, detail: String },
}

pub(crate) enum SessionCommand {
	Join {
		request: RoomRequest,
		reply: JoinWaiter,
	},
	Send {
		body: String,
		attachments: Vec<String>,
		reply: oneshot::Sender<LocalId>,
	},
	Resend {
		local_id: LocalId,
		reply: oneshot::Sender<bool>,
	},
	OnStateChange(StateListener),
	OnEvent {
		name: String,
		listener: EventListener,
	},
	Close {
		reply: oneshot::Sender<()>,
	},
}

type ConnectFuture = BoxFuture<'static, Result<TransportLink, ClientCoreError>>;

/// Owns the four session components and applies commands, frames and timers to them in arrival order.
pub(crate) struct SessionDriver {
	max_frame_bytes: usize,
	connector: Connector,
	conn: ConnectionManager,
	room: RoomSession,
	store: MessageStore,
	dispatcher: OutboundDispatcher,
	acks: AckSeq,
	connecting: Option<ConnectFuture>,
	link: Option<TransportLink>,
	events_tx: mpsc::UnboundedSender<SessionEvent>,
	snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionDriver {
	pub(crate) fn new(
		cfg: &ClientConfig,
		connector: Connector,
		events_tx: mpsc::UnboundedSender<SessionEvent>,
	) -> (Self, watch::Receiver<SessionSnapshot>) {
		let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
		let driver = Self {
			max_frame_bytes: cfg.max_frame_bytes,
			connector,
			conn: ConnectionManager::new(cfg.backoff.clone(), cfg.connect_timeout),
			room: RoomSession::new(cfg.join_timeout, cfg.backoff.clone()),
			store: MessageStore::new(),
			dispatcher: OutboundDispatcher::new(DispatchConfig {
				ack_timeout: cfg.ack_timeout,
				max_attempts: cfg.max_send_attempts,
				sender: cfg.sender.clone(),
				receiver: cfg.receiver.clone(),
			}),
			acks: AckSeq::new(),
			connecting: None,
			link: None,
			events_tx,
			snapshot_tx,
		};
		(driver, snapshot_rx)
	}

	pub(crate) fn open(&mut self, cfg: &ClientConfig) {
		if self
			.conn
			.open(cfg.endpoint.clone(), cfg.credential.clone(), Instant::now())
		{
			self.start_connect();
		}
		self.publish();
	}

	fn next_deadline(&self) -> Option<Instant> {
		[
			self.conn.next_deadline(),
			self.room.next_deadline(),
			self.dispatcher.next_deadline(),
		]
		.into_iter()
		.flatten()
		.min()
	}

	fn emit(&self, event: SessionEvent) {
		let _ = self.events_tx.send(event);
	}

	fn publish(&self) {
		let next = SessionSnapshot {
			connection: self.conn.state(),
			room: self.room.details().cloned(),
			messages: self.store.snapshot(),
		};
		self.snapshot_tx.send_if_modified(|current| {
			if current.differs(&next) {
				*current = next;
				true
			} else {
				false
			}
		});
	}

	fn start_connect(&mut self) {
		let Some(target) = self.conn.target() else {
			return;
		};
		let request = ConnectRequest {
			endpoint: target.endpoint.clone(),
			credential: target.credential.clone(),
		};
		debug!(endpoint = %request.endpoint, attempt = self.conn.attempt(), "starting connect attempt");
		self.link = None;
		self.connecting = Some((self.connector)(request));
		self.emit(SessionEvent::Connecting);
	}

	fn on_connect_result(&mut self, res: Result<TransportLink, ClientCoreError>) {
		let now = Instant::now();
		match res {
			Ok(link) => {
				if self.conn.state() != ConnectionState::Connecting {
					return;
				}
				self.link = Some(link);
				self.conn.on_connected();
				info!(endpoint = ?self.conn.target().map(|t| t.endpoint.to_string()), "connected");
				self.emit(SessionEvent::Connected);

				if let Some(join) = self.room.on_connected(now, &mut self.acks) {
					self.transmit_join(join);
				}
			}
			Err(e) => {
				warn!(error = %e, "connect attempt failed");
				if let Some(delay) = self.conn.on_connect_failed(now) {
					self.emit_reconnecting(delay);
				}
			}
		}
	}

	fn emit_reconnecting(&self, delay: Duration) {
		let next_retry_in_ms = delay.as_millis().min(u64::MAX as u128) as u64;
		info!(attempt = self.conn.attempt(), next_retry_in_ms, "reconnect scheduled");
		self.emit(SessionEvent::Reconnecting {
			attempt: self.conn.attempt(),
			next_retry_in_ms,
		});
	}

	fn on_link_lost(&mut self, reason: String) {
		if self.link.take().is_none() {
			return;
		}
		warn!(%reason, "connection lost");
		self.room.on_disconnected();
		self.dispatcher.suspend();
		self.emit(SessionEvent::Disconnected { reason });
		if let Some(delay) = self.conn.on_dropped(Instant::now()) {
			self.emit_reconnecting(delay);
		}
	}

	fn on_transport_event(&mut self, ev: Option<TransportEvent>) {
		match ev {
			Some(TransportEvent::Frame(text)) => self.on_frame(&text),
			Some(TransportEvent::Closed { reason }) => self.on_link_lost(reason),
			None => self.on_link_lost("transport task ended".to_string()),
		}
	}

	fn on_frame(&mut self, text: &str) {
		let env = match decode_frame(text, self.max_frame_bytes) {
			Ok(env) => env,
			Err(e) => {
				warn!(error = %e, len = text.len(), "dropping malformed frame");
				self.emit(SessionEvent::MalformedPayload {
					event: "frame".to_string(),
					detail: e.to_string(),
				});
				return;
			}
		};

		let ack = env.ack;
		self.conn.emit_event(&env.event, &env.data);

		let inbound = classify(env);
		debug!(event = inbound.event_name(), ?ack, "frame received");
		match inbound {
			Inbound::Connect => debug!("server confirmed connection"),
			Inbound::Disconnect { reason } => {
				self.on_link_lost(reason.unwrap_or_else(|| "server disconnect".to_string()));
			}
			Inbound::JoinedRoom(data) => {
				let update = self.room.on_joined_room(data);
				self.apply_room_update(JOINED_ROOM, update);
			}
			Inbound::ReceiveMessage(data) => self.on_receive_message(data),
			Inbound::Ack { ack, data } => self.on_ack(ack, data),
			Inbound::Other { .. } => debug!("ignoring unhandled event"),
		}
	}

	fn on_receive_message(&mut self, data: serde_json::Value) {
		let Some(details) = self.room.details().cloned() else {
			debug!("message received before any room was joined; dropped");
			return;
		};
		let message = match parse_receive_message(data, Some(&details)) {
			Ok(m) => m,
			Err(e) => {
				self.malformed("receiveMessage", &e);
				return;
			}
		};
		if message.room_id != details.room_id.as_str() {
			debug!(room_id = %message.room_id, active = %details.room_id, "message for another room dropped");
			return;
		}

		match self.dispatcher.reconcile(&message) {
			Some(local_id) => {
				debug!(%local_id, "echo reconciled local send");
				self.store.confirm_local(&local_id, message);
			}
			None => {
				self.store.ingest_inbound(message);
			}
		}
	}

	fn on_ack(&mut self, ack: u64, data: serde_json::Value) {
		if self.room.owns_ack(ack) {
			let update = self.room.on_ack(data);
			self.apply_room_update(ROOM, update);
			return;
		}

		match self.dispatcher.on_ack(ack, data) {
			AckOutcome::Unknown => debug!(ack, "ack for nothing pending; ignored"),
			AckOutcome::Confirmed { local_id, message } => {
				self.store.confirm_local(&local_id, message);
			}
			AckOutcome::Acked { .. } => {}
			AckOutcome::Malformed { local_id, error } => {
				debug!(%local_id, "send ack carried an invalid message");
				self.malformed(SEND_MESSAGE, &error);
			}
		}
	}

	fn apply_room_update(&mut self, event: &str, update: RoomUpdate) {
		match update {
			RoomUpdate::Joined(response) => {
				for e in &response.dropped {
					self.malformed(event, e);
				}
				for m in &response.backlog {
					if let Some(local_id) = self.dispatcher.reconcile(m) {
						debug!(%local_id, "backlog reconciled local send");
					}
				}

				let details = response.details;
				let backlog_len = response.backlog.len();
				for failed in self.dispatcher.release_other_rooms(&details) {
					self.emit(SessionEvent::SendFailed(failed));
				}
				self.store.seed(response.backlog);

				let outgoing = self
					.dispatcher
					.on_room_ready(details.clone(), Instant::now(), &mut self.acks);
				for m in self.dispatcher.pending_messages() {
					self.store.insert_optimistic(m.clone());
				}
				for send in outgoing {
					self.transmit_send(send);
				}

				self.emit(SessionEvent::Joined { details, backlog_len });
			}
			RoomUpdate::Rejected(reason) => {
				self.dispatcher.suspend();
				self.emit(SessionEvent::JoinFailed(JoinError::Rejected(reason)));
			}
			RoomUpdate::Malformed(e) => self.malformed(event, &e),
			RoomUpdate::Ignored => {}
		}
	}

	fn malformed(&self, event: &str, e: &PayloadError) {
		warn!(%event, error = %e, "dropping malformed payload");
		self.emit(SessionEvent::MalformedPayload {
			event: event.to_string(),
			detail: e.to_string(),
		});
	}

	fn on_timers(&mut self, now: Instant) {
		match self.conn.poll(now) {
			Some(ConnectionTimer::Reconnect) => self.start_connect(),
			Some(ConnectionTimer::ConnectTimedOut { retry_in }) => {
				warn!("connect attempt timed out");
				self.connecting = None;
				self.emit_reconnecting(retry_in);
			}
			None => {}
		}

		match self.room.poll(now, &mut self.acks) {
			Some(RoomTimer::TimedOut { error, retry_in }) => {
				debug!(retry_in_ms = retry_in.as_millis() as u64, "join will be re-issued");
				self.emit(SessionEvent::JoinFailed(error));
				for failed in self.dispatcher.fail_queued() {
					self.store.mark_failed(&failed.local_id);
					self.emit(SessionEvent::SendFailed(failed));
				}
			}
			Some(RoomTimer::Retry(join)) => self.transmit_join(join),
			None => {}
		}

		let polled = self.dispatcher.poll(now, &mut self.acks);
		for send in polled.resend {
			self.transmit_send(send);
		}
		for failed in polled.failed {
			self.store.mark_failed(&failed.local_id);
			self.emit(SessionEvent::SendFailed(failed));
		}
	}

	/// Returns `false` once the session is closed.
	fn on_command(&mut self, cmd: SessionCommand) -> bool {
		let now = Instant::now();
		match cmd {
			SessionCommand::Join { request, reply } => {
				self.dispatcher.suspend();
				let connected = self.conn.is_connected();
				if let Some(join) = self.room.join(request, Some(reply), connected, now, &mut self.acks) {
					self.transmit_join(join);
				}
			}
			SessionCommand::Send {
				body,
				attachments,
				reply,
			} => {
				let message = self.dispatcher.send(body, attachments);
				let local_id = message.local_id.clone();
				self.store.insert_optimistic(message);
				for send in self.dispatcher.flush(now, &mut self.acks) {
					self.transmit_send(send);
				}
				if let Some(local_id) = local_id {
					let _ = reply.send(local_id);
				}
			}
			SessionCommand::Resend { local_id, reply } => {
				let requeued = self.dispatcher.resend(&local_id);
				if requeued {
					self.store.mark_pending(&local_id);
					for send in self.dispatcher.flush(now, &mut self.acks) {
						self.transmit_send(send);
					}
				}
				let _ = reply.send(requeued);
			}
			SessionCommand::OnStateChange(listener) => self.conn.on_state_change(listener),
			SessionCommand::OnEvent { name, listener } => self.conn.on_event(name, listener),
			SessionCommand::Close { reply } => {
				self.close("closed by client");
				let _ = reply.send(());
				return false;
			}
		}
		true
	}

	/// Terminal. Drops the in-flight connect, the link and unresolved join waiters.
	fn close(&mut self, reason: &str) {
		info!(%reason, "closing session");
		self.connecting = None;
		self.link = None;
		self.room.close();
		self.dispatcher.close();
		self.conn.close();
		self.emit(SessionEvent::Disconnected {
			reason: reason.to_string(),
		});
	}

	fn transmit_join(&self, join: OutgoingJoin) {
		self.transmit(ROOM, join.ack, &join.payload);
	}

	fn transmit_send(&self, send: OutgoingSend) {
		self.transmit(SEND_MESSAGE, send.ack, &send.payload);
	}

	fn transmit<T: Serialize>(&self, event: &str, ack: u64, payload: &T) {
		let Some(link) = self.link.as_ref() else {
			debug!(%event, ack, "no link; frame not sent");
			return;
		};

		let text = match encode_outgoing(event, ack, payload, self.max_frame_bytes) {
			Ok(text) => text,
			Err(e) => {
				warn!(%event, ack, error = %e, "failed to encode outgoing frame");
				return;
			}
		};

		if let Err(e) = link.send(text) {
			debug!(%event, ack, error = %e, "link closed while sending");
		}
	}
}

pub(crate) async fn run_session_task(mut driver: SessionDriver, mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>) {
	loop {
		let deadline = driver.next_deadline();

		tokio::select! {
			cmd = cmd_rx.recv() => {
				let Some(cmd) = cmd else {
					driver.close("session handle dropped");
					driver.publish();
					break;
				};
				if !driver.on_command(cmd) {
					driver.publish();
					break;
				}
			}

			res = poll_connecting(&mut driver.connecting), if driver.connecting.is_some() => {
				driver.connecting = None;
				driver.on_connect_result(res);
			}

			ev = recv_link(&mut driver.link), if driver.link.is_some() => {
				driver.on_transport_event(ev);
			}

			_ = async {
				if let Some(deadline) = deadline {
					tokio::time::sleep_until(deadline).await;
				}
			}, if deadline.is_some() => {
				driver.on_timers(Instant::now());
			}
		}

		driver.publish();
	}

	debug!("session task finished");
}

fn encode_outgoing<T: Serialize>(event: &str, ack: u64, payload: &T, max: usize) -> Result<String, FramingError> {
	let data = serde_json::to_value(payload)?;
	encode_frame(&Envelope::new(event, data).with_ack(ack), max)
}

async fn poll_connecting(connecting: &mut Option<ConnectFuture>) -> Result<TransportLink, ClientCoreError> {
	match connecting.as_mut() {
		Some(fut) => fut.await,
		None => std::future::pending().await,
	}
}

async fn recv_link(link: &mut Option<TransportLink>) -> Option<TransportEvent> {
	match link.as_mut() {
		Some(link) => link.recv().await,
		None => std::future::pending().await,
	}
}
