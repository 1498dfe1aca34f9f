use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use roomchat_util::endpoint::WsEndpoint;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::config::SecretString;
use crate::error::ClientCoreError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens a transport link. Injectable so the session can be driven without a network.
pub type Connector =
	Arc<dyn Fn(ConnectRequest) -> BoxFuture<'static, Result<TransportLink, ClientCoreError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConnectRequest {
	pub endpoint: WsEndpoint,
	pub credential: SecretString,
}

/// Something that happened on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
	/// One text frame.
	Frame(String),
	/// The link is gone. No further events follow.
	Closed { reason: String },
}

/// An open, message-oriented link: text frames out, [`TransportEvent`]s in.
///
/// Dropping the link releases the underlying transport.
#[derive(Debug)]
pub struct TransportLink {
	outbound: mpsc::UnboundedSender<String>,
	inbound: mpsc::UnboundedReceiver<TransportEvent>,
	task: Option<JoinHandle<()>>,
}

impl TransportLink {
	pub fn new(
		outbound: mpsc::UnboundedSender<String>,
		inbound: mpsc::UnboundedReceiver<TransportEvent>,
		task: Option<JoinHandle<()>>,
	) -> Self {
		Self { outbound, inbound, task }
	}

	/// A link backed by channels only, with the far end returned as a [`LoopbackPeer`].
	pub fn loopback() -> (Self, LoopbackPeer) {
		let (out_tx, out_rx) = mpsc::unbounded_channel();
		let (in_tx, in_rx) = mpsc::unbounded_channel();
		(
			Self::new(out_tx, in_rx, None),
			LoopbackPeer {
				outbound: out_rx,
				inbound: in_tx,
			},
		)
	}

	pub fn send(&self, text: String) -> Result<(), ClientCoreError> {
		self.outbound
			.send(text)
			.map_err(|_| ClientCoreError::Transport("link closed".to_string()))
	}

	/// Next event; `None` once the link's producer is gone.
	pub async fn recv(&mut self) -> Option<TransportEvent> {
		self.inbound.recv().await
	}
}

impl Drop for TransportLink {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

/// The server side of a [`TransportLink::loopback`] link.
#[derive(Debug)]
pub struct LoopbackPeer {
	outbound: mpsc::UnboundedReceiver<String>,
	inbound: mpsc::UnboundedSender<TransportEvent>,
}

impl LoopbackPeer {
	/// Deliver a text frame to the client.
	pub fn push_frame(&self, text: impl Into<String>) -> bool {
		self.inbound.send(TransportEvent::Frame(text.into())).is_ok()
	}

	/// Drop the link from the server side.
	pub fn push_closed(&self, reason: impl Into<String>) -> bool {
		self.inbound.send(TransportEvent::Closed { reason: reason.into() }).is_ok()
	}

	/// Next frame written by the client; `None` once the client released the link.
	pub async fn next_sent(&mut self) -> Option<String> {
		self.outbound.recv().await
	}

	/// A frame already written by the client, without waiting.
	pub fn try_next_sent(&mut self) -> Option<String> {
		self.outbound.try_recv().ok()
	}

	/// Whether the client has released its end.
	pub fn is_released(&self) -> bool {
		self.inbound.is_closed()
	}
}

/// Connector over WebSocket (tokio-tungstenite), with the credential sent as a bearer token.
pub fn websocket_connector() -> Connector {
	Arc::new(|req: ConnectRequest| -> BoxFuture<'static, Result<TransportLink, ClientCoreError>> {
		Box::pin(connect_websocket(req))
	})
}

async fn connect_websocket(req: ConnectRequest) -> Result<TransportLink, ClientCoreError> {
	let mut request = req
		.endpoint
		.as_str()
		.into_client_request()
		.map_err(|e| ClientCoreError::Connect(format!("invalid request for {}: {e}", req.endpoint)))?;

	if !req.credential.is_empty() {
		let value = HeaderValue::from_str(&format!("Bearer {}", req.credential.expose()))
			.map_err(|_| ClientCoreError::Config("credential is not a valid header value".to_string()))?;
		request.headers_mut().insert(AUTHORIZATION, value);
	}

	info!(endpoint = %req.endpoint, "websocket connecting");
	let (ws, _resp) = tokio_tungstenite::connect_async(request)
		.await
		.map_err(|e| ClientCoreError::Connect(format!("{}: {e}", req.endpoint)))?;
	info!(endpoint = %req.endpoint, "websocket connected");

	let (mut sink, mut stream) = ws.split();
	let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
	let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

	let task = tokio::spawn(async move {
		let reason = loop {
			tokio::select! {
				out = out_rx.recv() => {
					let Some(text) = out else {
						let _ = sink.send(Message::Close(None)).await;
						break "closed by client".to_string();
					};
					if let Err(e) = sink.send(Message::Text(text.into())).await {
						break format!("send failed: {e}");
					}
				}

				next = stream.next() => {
					match next {
						Some(Ok(Message::Text(t))) => {
							if in_tx.send(TransportEvent::Frame(t.to_string())).is_err() {
								break "receiver dropped".to_string();
							}
						}
						Some(Ok(Message::Ping(p))) => {
							if let Err(e) = sink.send(Message::Pong(p)).await {
								break format!("pong failed: {e}");
							}
						}
						Some(Ok(Message::Close(frame))) => {
							break frame
								.map(|f| format!("closed by server ({}): {}", f.code, f.reason))
								.unwrap_or_else(|| "closed by server".to_string());
						}
						Some(Ok(Message::Binary(b))) => {
							debug!(len = b.len(), "ignoring binary frame");
						}
						Some(Ok(_)) => {}
						Some(Err(e)) => {
							warn!(error = %e, "websocket read failed");
							break e.to_string();
						}
						None => break "stream ended".to_string(),
					}
				}
			}
		};

		debug!(%reason, "websocket pump finished");
		let _ = in_tx.send(TransportEvent::Closed { reason });
	});

	Ok(TransportLink::new(out_tx, in_rx, Some(task)))
}
