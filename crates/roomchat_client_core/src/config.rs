use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use roomchat_domain::{Identity, Participant};
use roomchat_protocol::DEFAULT_MAX_FRAME_SIZE;
use roomchat_util::endpoint::WsEndpoint;
use serde::Deserialize;
use tracing::info;

use crate::error::ClientCoreError;
use crate::reconnect::BackoffConfig;

/// Local dev endpoint.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:3000";

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Chat session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Chat backend endpoint.
	pub endpoint: WsEndpoint,

	/// Opaque bearer credential, sent as `Authorization: Bearer <token>`.
	pub credential: SecretString,

	/// Identity stamped on outgoing messages.
	pub sender: Identity,

	/// Recipient stamped on outgoing messages.
	pub receiver: Identity,

	/// Participants sent with the join request.
	pub participants: Vec<Participant>,

	/// Room label to join at startup (CLI only).
	pub room: Option<String>,

	/// Timeout for a single connect attempt.
	pub connect_timeout: Duration,

	/// Time allowed for a join response.
	pub join_timeout: Duration,

	/// Time allowed for a send acknowledgment before re-emitting.
	pub ack_timeout: Duration,

	/// Total emissions of one send before it is reported failed.
	pub max_send_attempts: u32,

	/// Reconnect backoff.
	pub backoff: BackoffConfig,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,
}

impl ClientConfig {
	/// Convenience: create a config from `ws[s]://host:port`.
	pub fn from_ws_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let endpoint = WsEndpoint::parse(endpoint).map_err(ClientCoreError::Config)?;
		Ok(Self {
			endpoint,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			endpoint: WsEndpoint::parse(DEFAULT_ENDPOINT).expect("valid default endpoint"),
			credential: SecretString::default(),
			sender: Identity::default(),
			receiver: Identity::default(),
			participants: Vec::new(),
			room: None,
			connect_timeout: Duration::from_secs(15),
			join_timeout: Duration::from_secs(10),
			ack_timeout: Duration::from_secs(5),
			max_send_attempts: 3,
			backoff: BackoffConfig::default(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Default config path: `~/.roomchat/client.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".roomchat").join("client.toml"))
}

/// Load the client config from TOML and env overrides.
pub fn load_client_config() -> anyhow::Result<ClientConfig> {
	let path = default_config_path()?;
	load_client_config_from_path(&path)
}

/// Same as `load_client_config` but with an explicit config path.
pub fn load_client_config_from_path(path: &Path) -> anyhow::Result<ClientConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ClientConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok())?;

	Ok(cfg)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	endpoint: Option<String>,
	token: Option<String>,
	room: Option<String>,

	#[serde(default)]
	sender: Option<FileIdentity>,

	#[serde(default)]
	receiver: Option<FileIdentity>,

	#[serde(default)]
	participants: Vec<Participant>,

	#[serde(default)]
	timeouts: FileTimeouts,

	#[serde(default)]
	reconnect: FileReconnect,

	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileIdentity {
	name: Option<String>,
	email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTimeouts {
	connect_ms: Option<u64>,
	join_ms: Option<u64>,
	ack_ms: Option<u64>,
	max_send_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileReconnect {
	base_delay_ms: Option<u64>,
	max_delay_ms: Option<u64>,
}

impl FileIdentity {
	fn into_identity(self) -> Identity {
		Identity::new(self.name.unwrap_or_default(), self.email.unwrap_or_default())
	}
}

impl ClientConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ClientConfig::default();

		let endpoint = match file.endpoint.filter(|s| !s.trim().is_empty()) {
			Some(s) => WsEndpoint::parse(&s).map_err(|e| anyhow!(e)).context("endpoint")?,
			None => defaults.endpoint,
		};

		let backoff = BackoffConfig {
			base: file
				.reconnect
				.base_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.backoff.base),
			max: file
				.reconnect
				.max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.backoff.max),
		};

		if backoff.base.is_zero() || backoff.max < backoff.base {
			return Err(anyhow!(
				"reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms (got {:?}..{:?})",
				backoff.base,
				backoff.max
			));
		}

		let max_send_attempts = file
			.timeouts
			.max_send_attempts
			.unwrap_or(defaults.max_send_attempts)
			.max(1);

		Ok(Self {
			endpoint,
			credential: file
				.token
				.filter(|s| !s.trim().is_empty())
				.map(SecretString::new)
				.unwrap_or_default(),
			sender: file.sender.map(FileIdentity::into_identity).unwrap_or_default(),
			receiver: file.receiver.map(FileIdentity::into_identity).unwrap_or_default(),
			participants: file.participants,
			room: file.room.filter(|s| !s.trim().is_empty()),
			connect_timeout: file
				.timeouts
				.connect_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.connect_timeout),
			join_timeout: file
				.timeouts
				.join_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.join_timeout),
			ack_timeout: file
				.timeouts
				.ack_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.ack_timeout),
			max_send_attempts,
			backoff,
			max_frame_bytes: file.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
		})
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides<F>(cfg: &mut ClientConfig, lookup: F) -> anyhow::Result<()>
where
	F: Fn(&str) -> Option<String>,
{
	let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = get("ROOMCHAT_ENDPOINT") {
		cfg.endpoint = WsEndpoint::parse(&v)
			.map_err(|e| anyhow!(e))
			.context("ROOMCHAT_ENDPOINT")?;
		info!(endpoint = %cfg.endpoint, "client config: endpoint overridden by env");
	}

	if let Some(v) = get("ROOMCHAT_TOKEN") {
		cfg.credential = SecretString::new(v);
		info!("client config: credential overridden by env");
	}

	if let Some(v) = get("ROOMCHAT_ROOM") {
		info!(room = %v, "client config: room overridden by env");
		cfg.room = Some(v);
	}

	if let Some(v) = get("ROOMCHAT_SENDER_NAME") {
		cfg.sender.name = v;
	}
	if let Some(v) = get("ROOMCHAT_SENDER_EMAIL") {
		cfg.sender.email = v;
	}
	if let Some(v) = get("ROOMCHAT_RECEIVER_NAME") {
		cfg.receiver.name = v;
	}
	if let Some(v) = get("ROOMCHAT_RECEIVER_EMAIL") {
		cfg.receiver.email = v;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(s: &str) -> anyhow::Result<ClientConfig> {
		let file: FileConfig = toml::from_str(s)?;
		ClientConfig::from_file(file)
	}

	#[test]
	fn default_config_is_sane() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.endpoint.host(), "localhost");
		assert_eq!(cfg.endpoint.port(), 3000);
		assert!(cfg.max_frame_bytes > 0);
		assert_eq!(cfg.max_send_attempts, 3);
		assert_eq!(cfg.backoff.base, Duration::from_millis(500));
		assert_eq!(cfg.backoff.max, Duration::from_secs(30));
	}

	#[test]
	fn secret_is_redacted() {
		let s = SecretString::new("eyJhbGciOi");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.to_string(), "<redacted>");
		assert_eq!(s.expose(), "eyJhbGciOi");
	}

	#[test]
	fn parses_full_file() {
		let cfg = parse(
			r#"
			endpoint = "wss://chat.example.com/socket"
			token = "abc"
			room = "testing"

			[sender]
			name = "Ada"
			email = "ada@example.com"

			[receiver]
			name = "Bob"
			email = "bob@example.com"

			[[participants]]
			id = "u1"
			email = "ada@example.com"
			role = "customer"

			[timeouts]
			join_ms = 2500
			ack_ms = 1000
			max_send_attempts = 5

			[reconnect]
			base_delay_ms = 250
			max_delay_ms = 10000
			"#,
		)
		.unwrap();

		assert!(cfg.endpoint.is_secure());
		assert_eq!(cfg.credential.expose(), "abc");
		assert_eq!(cfg.room.as_deref(), Some("testing"));
		assert_eq!(cfg.sender, Identity::new("Ada", "ada@example.com"));
		assert_eq!(cfg.receiver.name, "Bob");
		assert_eq!(cfg.participants.len(), 1);
		assert_eq!(cfg.participants[0].extra.get("role").and_then(|v| v.as_str()), Some("customer"));
		assert_eq!(cfg.join_timeout, Duration::from_millis(2500));
		assert_eq!(cfg.ack_timeout, Duration::from_secs(1));
		assert_eq!(cfg.connect_timeout, Duration::from_secs(15));
		assert_eq!(cfg.max_send_attempts, 5);
		assert_eq!(cfg.backoff.base, Duration::from_millis(250));
		assert_eq!(cfg.backoff.max, Duration::from_secs(10));
	}

	#[test]
	fn rejects_bad_endpoint_and_backoff() {
		assert!(parse(r#"endpoint = "http://nope""#).is_err());
		assert!(
			parse(
				r#"
				[reconnect]
				base_delay_ms = 1000
				max_delay_ms = 10
				"#
			)
			.is_err()
		);
	}

	#[test]
	fn env_overrides_win() {
		let env: HashMap<&str, &str> = HashMap::from([
			("ROOMCHAT_ENDPOINT", "ws://10.0.0.1:4000"),
			("ROOMCHAT_TOKEN", " t0k "),
			("ROOMCHAT_SENDER_EMAIL", "me@example.com"),
			("ROOMCHAT_ROOM", ""),
		]);

		let mut cfg = ClientConfig::default();
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string())).unwrap();

		assert_eq!(cfg.endpoint.hostport(), "10.0.0.1:4000");
		assert_eq!(cfg.credential.expose(), "t0k");
		assert_eq!(cfg.sender.email, "me@example.com");
		assert_eq!(cfg.room, None);
	}

	#[test]
	fn missing_file_yields_defaults() {
		let path = std::env::temp_dir().join("roomchat-missing-config-for-tests.toml");
		let cfg = ClientConfig::from_file(read_toml_if_exists(&path).unwrap().unwrap_or_default()).unwrap();
		assert_eq!(cfg.endpoint.as_str(), ClientConfig::default().endpoint.as_str());
	}
}
