#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use parley_domain::{Room, User, UserId};
use thiserror::Error;
use tracing::debug;

/// Words rejected by default when the operator configures no list.
const DEFAULT_PROFANITY_WORDS: &[&str] = &[
	"arse", "asshole", "bastard", "bitch", "bollocks", "crap", "cunt", "dick", "fuck", "piss", "prick", "shit", "slut",
	"twat", "wanker",
];

/// Moderation gate settings.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
	/// Lowercase words rejected by the profanity filter.
	pub profanity_words: Vec<String>,
	/// Duplicate-send suppression window.
	pub dedupe_window_ms: i64,
	/// Ceiling on tracked (sender, target) dedupe entries.
	pub dedupe_max_entries: usize,
}

impl Default for ModerationConfig {
	fn default() -> Self {
		Self {
			profanity_words: DEFAULT_PROFANITY_WORDS.iter().map(|w| w.to_string()).collect(),
			dedupe_window_ms: 10_000,
			dedupe_max_entries: 4096,
		}
	}
}

/// Why a send was refused. Ordered checks: block, then profanity, then spam.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendRejection {
	#[error("sender and recipient block each other")]
	Blocked,
	#[error("message rejected by profanity filter")]
	Profane,
	#[error("duplicate message suppressed")]
	Throttled,
}

#[derive(Debug)]
struct DedupeEntry {
	content: String,
	at_unix_ms: i64,
}

/// Pre-persistence gate shared by every ingress path.
#[derive(Debug)]
pub struct ModerationGate {
	words: HashSet<String>,
	window_ms: i64,
	max_entries: usize,
	recent: Mutex<HashMap<(UserId, Room), DedupeEntry>>,
}

impl ModerationGate {
	pub fn new(cfg: ModerationConfig) -> Self {
		Self {
			words: cfg.profanity_words.iter().map(|w| w.trim().to_lowercase()).collect(),
			window_ms: cfg.dedupe_window_ms,
			max_entries: cfg.dedupe_max_entries.max(1),
			recent: Mutex::new(HashMap::new()),
		}
	}

	/// Admit or refuse a new message before anything is persisted.
	///
	/// `recipient` is set for direct messages only; group sends skip the block
	/// check because blocks are a pairwise relation.
	pub fn admit_send(
		&self,
		sender: &User,
		recipient: Option<&User>,
		target: Room,
		content: &str,
		now_unix_ms: i64,
	) -> Result<(), SendRejection> {
		if let Some(recipient) = recipient
			&& (sender.has_blocked(recipient.id) || recipient.has_blocked(sender.id))
		{
			metrics::counter!("parley_server_sends_blocked_total").increment(1);
			return Err(SendRejection::Blocked);
		}

		if self.contains_profanity(content) {
			metrics::counter!("parley_server_sends_profane_total").increment(1);
			return Err(SendRejection::Profane);
		}

		let mut recent = self.recent.lock().expect("dedupe lock");

		let key = (sender.id, target);
		if let Some(entry) = recent.get(&key)
			&& entry.content == content
			&& now_unix_ms - entry.at_unix_ms < self.window_ms
		{
			metrics::counter!("parley_server_sends_throttled_total").increment(1);
			return Err(SendRejection::Throttled);
		}

		if recent.len() >= self.max_entries {
			let window = self.window_ms;
			recent.retain(|_, e| now_unix_ms - e.at_unix_ms < window);
			if recent.len() >= self.max_entries {
				debug!(entries = recent.len(), "dedupe table full, resetting");
				recent.clear();
			}
		}

		recent.insert(
			key,
			DedupeEntry {
				content: content.to_string(),
				at_unix_ms: now_unix_ms,
			},
		);

		Ok(())
	}

	/// Admit or refuse replacement content for an edit. Edits are not subject
	/// to block or duplicate checks, only the profanity filter.
	pub fn admit_edit(&self, content: &str) -> Result<(), SendRejection> {
		if self.contains_profanity(content) {
			metrics::counter!("parley_server_sends_profane_total").increment(1);
			return Err(SendRejection::Profane);
		}
		Ok(())
	}

	fn contains_profanity(&self, content: &str) -> bool {
		if self.words.is_empty() {
			return false;
		}

		content
			.split(|c: char| !c.is_alphanumeric())
			.filter(|w| !w.is_empty())
			.any(|w| self.words.contains(&w.to_lowercase()))
	}
}
