#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Context as _;
use roomchat_client_core::{ChatSessionFacade, ClientConfig, SessionEvent, load_client_config_from_path};
use roomchat_client_core::config::default_config_path;
use roomchat_domain::Delivery;
use roomchat_util::endpoint::WsEndpoint;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: roomchat_client [--connect ws://host:port] [--room name] [--config path]\n\
\n\
Options:\n\
	--connect   Chat backend endpoint (alias: --endpoint) (default: from config, else ws://localhost:3000)\n\
	            Format: ws://host:port[/path] or wss://host:port[/path]\n\
	--endpoint  Alias for --connect\n\
	--room      Room to join (default: `room` from config)\n\
	--config    Config file (default: ~/.roomchat/client.toml)\n\
	--help      Show this help\n\
\n\
Notes:\n\
	Each line read from stdin is sent as a message. `/resend <localId>` retries a failed send.\n\
	The bearer credential comes from `token` in the config file or ROOMCHAT_TOKEN.\n\
\n\
Examples:\n\
	roomchat_client --connect ws://127.0.0.1:3000 --room testing\n\
	ROOMCHAT_TOKEN=... roomchat_client --connect wss://chat.example.com/socket --room support\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,roomchat_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	endpoint: Option<WsEndpoint>,
	room: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		endpoint: None,
		room: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed = WsEndpoint::parse(&v).unwrap_or_else(|e| {
					eprintln!("Invalid --connect value: {v}\n{e}");
					usage_and_exit()
				});
				args.endpoint = Some(parsed);
			}
			"--room" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--room must be non-empty");
					usage_and_exit();
				}
				args.room = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
	let path = match &args.config {
		Some(p) => p.clone(),
		None => default_config_path()?,
	};
	let mut cfg = load_client_config_from_path(&path).with_context(|| format!("load {}", path.display()))?;

	if let Some(endpoint) = &args.endpoint {
		cfg.endpoint = endpoint.clone();
	}
	if let Some(room) = &args.room {
		cfg.room = Some(room.clone());
	}
	Ok(cfg)
}

fn print_event(ev: &SessionEvent) {
	match ev {
		SessionEvent::Connecting => println!("* connecting"),
		SessionEvent::Connected => println!("* connected"),
		SessionEvent::Reconnecting {
			attempt,
			next_retry_in_ms,
		} => println!("* reconnecting (attempt {attempt}, in {next_retry_in_ms} ms)"),
		SessionEvent::Disconnected { reason } => println!("* disconnected: {reason}"),
		SessionEvent::Joined { details, backlog_len } => {
			println!("* joined {details} ({backlog_len} messages)")
		}
		SessionEvent::JoinFailed(e) => println!("! {e}"),
		SessionEvent::SendFailed(failed) => {
			println!(
				"! not delivered after {} attempts: {:?} (/resend {})",
				failed.attempts, failed.body, failed.local_id
			)
		}
		SessionEvent::MalformedPayload { event, detail } => println!("! dropped malformed {event}: {detail}"),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();
	let cfg = load_config(&args)?;

	info!(
		endpoint = %cfg.endpoint,
		room = ?cfg.room,
		protocol = roomchat_client_core::PROTOCOL_VERSION,
		"starting"
	);

	let room = cfg.room.clone();
	let (session, mut events) = ChatSessionFacade::start(cfg);

	if let Some(room) = room {
		let joiner = session.clone();
		tokio::spawn(async move {
			if let Err(e) = joiner.join_room(room).await {
				warn!(error = %e, "initial join failed");
			}
		});
	} else {
		warn!("no room configured; pass --room to join one");
	}

	let mut timeline = session.watch();
	let mut printed: HashSet<(String, Delivery)> = HashSet::new();
	let mut stdin = BufReader::new(tokio::io::stdin()).lines();

	loop {
		tokio::select! {
			ev = events.recv() => {
				let Some(ev) = ev else { break };
				print_event(&ev);
			}

			changed = timeline.changed() => {
				if changed.is_err() {
					break;
				}
				let snapshot = timeline.borrow_and_update().clone();
				for m in snapshot.messages.iter() {
					let key = match (&m.id, &m.local_id) {
						(Some(id), _) => id.to_string(),
						(None, Some(local_id)) => format!("local:{local_id}"),
						(None, None) => continue,
					};
					if !printed.insert((key, m.delivery)) {
						continue;
					}
					let marker = match m.delivery {
						Delivery::Confirmed => "",
						Delivery::Pending => " (sending)",
						Delivery::Failed => " (failed)",
					};
					println!("[{}] {}: {}{marker}", m.created_at.format("%H:%M:%S"), m.sender.name, m.body);
				}
			}

			line = stdin.next_line() => {
				let Some(line) = line.context("read stdin")? else { break };
				let line = line.trim();
				if line.is_empty() {
					continue;
				}
				if let Some(local_id) = line.strip_prefix("/resend ") {
					match local_id.trim().parse() {
						Ok(local_id) => {
							if !session.resend(local_id).await? {
								println!("! nothing to resend for {line}");
							}
						}
						Err(e) => println!("! invalid local id: {e}"),
					}
					continue;
				}
				if let Err(e) = session.send(line).await {
					println!("! {e}");
				}
			}
		}
	}

	session.close().await;
	Ok(())
}
