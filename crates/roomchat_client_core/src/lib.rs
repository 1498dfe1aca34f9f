#![forbid(unsafe_code)]

//! Realtime chat session core.
//!
//! A [`ChatSessionFacade`] owns one session: a connection with reconnect backoff, a single joined room, an
//! ordered message timeline, and an outbound dispatcher with optimistic rendering and ack-driven retries.
//! All state is driven by one tokio task; the facade exposes a [`SessionSnapshot`] read model and a stream
//! of [`SessionEvent`]s.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod facade;
pub mod reconnect;
pub mod room;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{ClientConfig, SecretString, load_client_config, load_client_config_from_path};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::{FailedSend, OutboundDispatcher};
pub use error::{ClientCoreError, JoinError};
pub use facade::ChatSessionFacade;
pub use reconnect::BackoffConfig;
pub use room::{JoinOutcome, RoomSession};
pub use session::{SessionEvent, SessionSnapshot};
pub use store::MessageStore;
pub use transport::{ConnectRequest, Connector, LoopbackPeer, TransportEvent, TransportLink, websocket_connector};

/// Wire protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = roomchat_protocol::version::PROTOCOL_VERSION_U32;
