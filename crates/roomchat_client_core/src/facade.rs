use std::sync::Arc;

use roomchat_domain::{LocalId, Message, Participant, RoomDetails, RoomRequest};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::ConnectionState;
use crate::error::{ClientCoreError, JoinError};
use crate::room::JoinOutcome;
use crate::session::{SessionCommand, SessionDriver, SessionEvent, SessionSnapshot, run_session_task};
use crate::transport::{Connector, websocket_connector};

/// The object a UI consumes: a read model kept current by the session task, plus the write entry points.
///
/// All state lives in one spawned task; this handle only sends commands to it and reads the published
/// [`SessionSnapshot`]. Dropping the last handle closes the session.
#[derive(Debug, Clone)]
pub struct ChatSessionFacade {
	cmd_tx: mpsc::UnboundedSender<SessionCommand>,
	snapshot_rx: watch::Receiver<SessionSnapshot>,
	participants: Arc<[Participant]>,
}

impl ChatSessionFacade {
	/// Start a session over WebSocket and begin connecting. Must be called within a tokio runtime.
	pub fn start(cfg: ClientConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
		Self::start_with_connector(cfg, websocket_connector())
	}

	/// Same as [`ChatSessionFacade::start`] with a caller-provided transport.
	pub fn start_with_connector(
		cfg: ClientConfig,
		connector: Connector,
	) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
		let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
		let (events_tx, events_rx) = mpsc::unbounded_channel();

		let (mut driver, snapshot_rx) = SessionDriver::new(&cfg, connector, events_tx);
		driver.open(&cfg);
		tokio::spawn(run_session_task(driver, cmd_rx));

		let facade = Self {
			cmd_tx,
			snapshot_rx,
			participants: Arc::from(cfg.participants),
		};
		(facade, events_rx)
	}

	pub fn snapshot(&self) -> SessionSnapshot {
		self.snapshot_rx.borrow().clone()
	}

	/// A receiver notified on every snapshot change.
	pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
		self.snapshot_rx.clone()
	}

	pub fn connection_state(&self) -> ConnectionState {
		self.snapshot_rx.borrow().connection
	}

	pub fn room_details(&self) -> Option<RoomDetails> {
		self.snapshot_rx.borrow().room.clone()
	}

	pub fn messages(&self) -> Arc<[Message]> {
		Arc::clone(&self.snapshot_rx.borrow().messages)
	}

	/// Join a room. Queued until connected; resolves with the room identity and backlog.
	pub async fn join(&self, request: RoomRequest) -> Result<JoinOutcome, JoinError> {
		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(SessionCommand::Join { request, reply })
			.map_err(|_| JoinError::Closed)?;
		rx.await.map_err(|_| JoinError::Closed)?
	}

	/// Join `room` with the configured participant list.
	pub async fn join_room(&self, room: impl Into<String>) -> Result<JoinOutcome, JoinError> {
		self.join(RoomRequest::new(room, self.participants.to_vec())).await
	}

	/// Send a text message. It appears in the timeline immediately, flagged pending until confirmed.
	pub async fn send(&self, text: impl Into<String>) -> Result<LocalId, ClientCoreError> {
		self.send_with_attachments(text, Vec::new()).await
	}

	pub async fn send_with_attachments(
		&self,
		text: impl Into<String>,
		attachments: Vec<String>,
	) -> Result<LocalId, ClientCoreError> {
		let body = text.into();
		if body.trim().is_empty() && attachments.is_empty() {
			return Err(ClientCoreError::EmptyMessage);
		}

		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(SessionCommand::Send {
				body,
				attachments,
				reply,
			})
			.map_err(|_| ClientCoreError::Closed)?;
		rx.await.map_err(|_| ClientCoreError::Closed)
	}

	/// Retry a failed send from its first attempt. Returns `false` if `local_id` is not a failed send.
	pub async fn resend(&self, local_id: LocalId) -> Result<bool, ClientCoreError> {
		let (reply, rx) = oneshot::channel();
		self.cmd_tx
			.send(SessionCommand::Resend { local_id, reply })
			.map_err(|_| ClientCoreError::Closed)?;
		rx.await.map_err(|_| ClientCoreError::Closed)
	}

	/// Register a connection state listener. Listeners run on the session task, in registration order.
	pub fn on_state_change<F>(&self, listener: F) -> Result<(), ClientCoreError>
	where
		F: FnMut(ConnectionState) + Send + 'static,
	{
		self.cmd_tx
			.send(SessionCommand::OnStateChange(Box::new(listener)))
			.map_err(|_| ClientCoreError::Closed)
	}

	/// Register a listener for raw inbound events named `name`.
	pub fn on_event<F>(&self, name: impl Into<String>, listener: F) -> Result<(), ClientCoreError>
	where
		F: FnMut(&serde_json::Value) + Send + 'static,
	{
		self.cmd_tx
			.send(SessionCommand::OnEvent {
				name: name.into(),
				listener: Box::new(listener),
			})
			.map_err(|_| ClientCoreError::Closed)
	}

	/// Tear the session down. Pending joins observe [`JoinError::Closed`]. Idempotent.
	pub async fn close(&self) {
		let (reply, rx) = oneshot::channel();
		if self.cmd_tx.send(SessionCommand::Close { reply }).is_err() {
			debug!("close: session already finished");
			return;
		}
		let _ = rx.await;
	}
}
