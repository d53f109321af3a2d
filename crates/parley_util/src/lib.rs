#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	use thiserror::Error;

	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum EndpointParseError {
		#[error("endpoint must be non-empty (expected quic://host:port)")]
		Empty,
		#[error("invalid endpoint (expected quic://host:port): {0}")]
		BadScheme(String),
		#[error("invalid endpoint (expected quic://host:port without path/query/fragment): {0}")]
		TrailingComponents(String),
		#[error("invalid endpoint host (expected quic://host:port): {0}")]
		BadHost(String),
		#[error("invalid endpoint host (IPv6 must be bracketed like quic://[::1]:18500): {0}")]
		UnbracketedIpv6(String),
		#[error("invalid endpoint port (expected 1..=65535): {0}")]
		BadPort(String),
		#[error("host must be an IP literal (DNS names not supported here): {0}")]
		NotIpLiteral(String),
	}

	/// Parsed `quic://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct QuicEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl QuicEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, EndpointParseError> {
			self.hostport()
				.parse()
				.map_err(|_| EndpointParseError::NotIpLiteral(self.host.clone()))
		}

		/// Parse a QUIC endpoint string in the form `quic://host:port`.
		pub fn parse(s: &str) -> Result<Self, EndpointParseError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointParseError::Empty);
			}

			let rest = s
				.strip_prefix("quic://")
				.ok_or_else(|| EndpointParseError::BadScheme(s.to_string()))?;

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(EndpointParseError::TrailingComponents(s.to_string()));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| EndpointParseError::BadPort(s.to_string()))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(EndpointParseError::BadHost(s.to_string()));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(EndpointParseError::UnbracketedIpv6(s.to_string()));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| EndpointParseError::BadPort(s.to_string()))?;

			if port == 0 {
				return Err(EndpointParseError::BadPort(s.to_string()));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_ipv4_and_dns() {
			let e = QuicEndpoint::parse("quic://127.0.0.1:18500").unwrap();
			assert_eq!(e.hostport(), "127.0.0.1:18500");
			assert!(e.to_socket_addr_if_ip_literal().is_ok());

			let e = QuicEndpoint::parse("quic://parley.example.com:443").unwrap();
			assert_eq!(e.host, "parley.example.com");
			assert!(matches!(
				e.to_socket_addr_if_ip_literal(),
				Err(EndpointParseError::NotIpLiteral(_))
			));
		}

		#[test]
		fn parses_bracketed_ipv6_only() {
			let e = QuicEndpoint::parse("quic://[::1]:18500").unwrap();
			assert_eq!(e.host, "[::1]");
			assert!(matches!(
				QuicEndpoint::parse("quic://::1:18500"),
				Err(EndpointParseError::UnbracketedIpv6(_))
			));
		}

		#[test]
		fn rejects_malformed_endpoints() {
			assert_eq!(QuicEndpoint::parse("  "), Err(EndpointParseError::Empty));
			assert!(matches!(
				QuicEndpoint::parse("tcp://127.0.0.1:1"),
				Err(EndpointParseError::BadScheme(_))
			));
			assert!(matches!(
				QuicEndpoint::parse("quic://127.0.0.1:18500/path"),
				Err(EndpointParseError::TrailingComponents(_))
			));
			assert!(matches!(
				QuicEndpoint::parse("quic://127.0.0.1:0"),
				Err(EndpointParseError::BadPort(_))
			));
			assert!(matches!(
				QuicEndpoint::parse("quic://127.0.0.1"),
				Err(EndpointParseError::BadPort(_))
			));
		}
	}
}

pub mod secret {
	use core::fmt;

	/// A string whose value never appears in logs or serialized output.
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

	impl serde::Serialize for SecretString {
		fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
		where
			S: serde::Serializer,
		{
			serializer.serialize_str("")
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn debug_and_display_redact() {
			let s = SecretString::new("hunter2");
			assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
			assert_eq!(s.to_string(), "<redacted>");
			assert_eq!(s.expose(), "hunter2");
		}
	}
}

pub use endpoint::QuicEndpoint;
pub use secret::SecretString;
