#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_util::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub moderation: ModerationSettings,
	pub persistence: PersistenceSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Optional request API HTTP bind address (host:port).
	pub api_bind: Option<String>,
	/// HMAC secret for stateless access tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Grace period for the hello frame on a new connection.
	pub handshake_timeout: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			api_bind: None,
			auth_hmac_secret: None,
			handshake_timeout: Duration::from_secs(5),
		}
	}
}

/// Moderation settings loaded by the server.
#[derive(Debug, Clone)]
pub struct ModerationSettings {
	/// Override for the built-in profanity word list.
	pub profanity_words: Option<Vec<String>>,
	/// Duplicate-send suppression window.
	pub dedupe_window: Duration,
	/// Ceiling on tracked dedupe entries.
	pub dedupe_max_entries: usize,
}

impl Default for ModerationSettings {
	fn default() -> Self {
		Self {
			profanity_words: None,
			dedupe_window: Duration::from_secs(10),
			dedupe_max_entries: 4096,
		}
	}
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the SQLite-backed store.
	pub enabled: bool,
	/// Database URL (sqlite:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	moderation: FileModerationSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	api_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	handshake_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileModerationSettings {
	profanity_words: Option<Vec<String>>,
	dedupe_window_secs: Option<u64>,
	dedupe_max_entries: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				api_bind: file.server.api_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				handshake_timeout: file
					.server
					.handshake_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(ServerSettings::default().handshake_timeout),
			},
			moderation: ModerationSettings {
				profanity_words: file.moderation.profanity_words,
				dedupe_window: file
					.moderation
					.dedupe_window_secs
					.map(Duration::from_secs)
					.unwrap_or(ModerationSettings::default().dedupe_window),
				dedupe_max_entries: file
					.moderation
					.dedupe_max_entries
					.unwrap_or(ModerationSettings::default().dedupe_max_entries),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
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

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PARLEY_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_API_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.api_bind = Some(v);
			info!("server config: api_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_HANDSHAKE_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.server.handshake_timeout = Duration::from_secs(secs);
		info!(secs, "server config: handshake_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_PROFANITY_WORDS") {
		let words: Vec<String> = v
			.split(',')
			.map(|w| w.trim().to_string())
			.filter(|w| !w.is_empty())
			.collect();
		if !words.is_empty() {
			cfg.moderation.profanity_words = Some(words);
			info!("moderation: profanity_words overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_DEDUPE_WINDOW_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.moderation.dedupe_window = Duration::from_secs(secs);
		info!(secs, "moderation: dedupe_window overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_DEDUPE_MAX_ENTRIES")
		&& let Ok(entries) = v.trim().parse::<usize>()
	{
		cfg.moderation.dedupe_max_entries = entries;
		info!(entries, "moderation: dedupe_max_entries overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}
