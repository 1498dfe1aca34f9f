#![forbid(unsafe_code)]

pub mod endpoint {
	use url::Url;

	/// Parsed `ws://` or `wss://` chat endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		url: Url,
	}

	impl WsEndpoint {
		/// Parse an endpoint string in the form `ws[s]://host[:port][/path]`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let url = Url::parse(s).map_err(|e| format!("invalid endpoint (expected ws://host:port): {s}: {e}"))?;

			match url.scheme() {
				"ws" | "wss" => {}
				other => {
					return Err(format!("invalid endpoint scheme {other:?} (expected ws or wss): {s}"));
				}
			}

			if url.host_str().is_none_or(|h| h.is_empty()) {
				return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
			}

			if url.fragment().is_some() {
				return Err(format!("invalid endpoint (fragments are not allowed): {s}"));
			}

			if url.port() == Some(0) {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self { url })
		}

		/// Whether the endpoint uses TLS.
		pub fn is_secure(&self) -> bool {
			self.url.scheme() == "wss"
		}

		pub fn host(&self) -> &str {
			self.url.host_str().unwrap_or_default()
		}

		/// Explicit port, or the scheme default (80 / 443).
		pub fn port(&self) -> u16 {
			self.url.port_or_known_default().unwrap_or(if self.is_secure() { 443 } else { 80 })
		}

		/// Returns `host:port` (IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host(), self.port())
		}

		pub fn as_str(&self) -> &str {
			self.url.as_str()
		}

		pub fn url(&self) -> &Url {
			&self.url
		}
	}

	impl std::fmt::Display for WsEndpoint {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.write_str(self.url.as_str())
		}
	}

	/// Validate `ws[s]://host[:port]`.
	pub fn validate_ws_endpoint(s: &str) -> Result<(), String> {
		let _ = WsEndpoint::parse(s)?;
		Ok(())
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_dns_hostname() {
			let e = WsEndpoint::parse("wss://chat.example.com").unwrap();
			assert_eq!(e.host(), "chat.example.com");
			assert_eq!(e.port(), 443);
			assert!(e.is_secure());
			assert_eq!(e.hostport(), "chat.example.com:443");
		}

		#[test]
		fn parses_ipv4_with_port_and_path() {
			let e = WsEndpoint::parse("ws://127.0.0.1:3000/socket").unwrap();
			assert_eq!(e.host(), "127.0.0.1");
			assert_eq!(e.port(), 3000);
			assert!(!e.is_secure());
			assert_eq!(e.url().path(), "/socket");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = WsEndpoint::parse("ws://[::1]:3000").unwrap();
			assert_eq!(e.hostport(), "[::1]:3000");
		}

		#[test]
		fn rejects_other_schemes() {
			let err = WsEndpoint::parse("http://localhost:3000").unwrap_err();
			assert!(err.contains("scheme"));
			assert!(WsEndpoint::parse("quic://localhost:3000").is_err());
		}

		#[test]
		fn rejects_fragment_empty_and_port_zero() {
			assert!(WsEndpoint::parse("ws://localhost:3000/#frag").is_err());
			assert!(WsEndpoint::parse("   ").is_err());
			assert!(WsEndpoint::parse("ws://localhost:0").is_err());
		}

		#[test]
		fn validate_accepts_default_dev_endpoint() {
			assert!(validate_ws_endpoint("ws://localhost:3000").is_ok());
		}
	}
}
