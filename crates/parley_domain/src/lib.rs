#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid id: {0}")]
	InvalidId(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! uuid_id {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub uuid::Uuid);

		impl $name {
			/// Create a new random id.
			pub fn new_v4() -> Self {
				Self(uuid::Uuid::new_v4())
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				uuid::Uuid::parse_str(s)
					.map(Self)
					.map_err(|_| ParseIdError::InvalidId(s.to_string()))
			}
		}
	};
}

uuid_id!(
	/// User identity.
	UserId
);
uuid_id!(
	/// Group identity.
	GroupId
);
uuid_id!(
	/// Message identity.
	MessageId
);

/// Addressable fan-out target: one user's identity room or one group's room.
///
/// A direct-addressed event targets exactly the recipient's identity room; a
/// group-addressed event targets exactly the group's room. The enum makes the
/// "exactly one of recipient/group" invariant unrepresentable as anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Room {
	User(UserId),
	Group(GroupId),
}

impl Room {
	/// Stable string form: `user:<uuid>` or `group:<uuid>`.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (kind, id) = s
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected user:<id> or group:<id>".into()))?;

		match kind {
			"user" => Ok(Room::User(id.parse()?)),
			"group" => Ok(Room::Group(id.parse()?)),
			other => Err(ParseIdError::InvalidFormat(format!("unknown room kind: {other}"))),
		}
	}
}

impl fmt::Display for Room {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Room::User(id) => write!(f, "user:{id}"),
			Room::Group(id) => write!(f, "group:{id}"),
		}
	}
}

impl FromStr for Room {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Room::parse(s)
	}
}

/// Group membership role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	#[default]
	Member,
	Admin,
}

impl Role {
	pub const fn as_str(self) -> &'static str {
		match self {
			Role::Member => "member",
			Role::Admin => "admin",
		}
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"member" => Ok(Role::Member),
			"admin" => Ok(Role::Admin),
			other => Err(ParseIdError::InvalidFormat(format!("unknown role: {other}"))),
		}
	}
}

/// A user record as the dispatch engine sees it.
///
/// Presence is intentionally absent: it is derived from live connection
/// counts, never stored. Block enforcement is symmetric at the moderation
/// gate even though each record only stores its own outgoing block set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub id: UserId,
	pub username: String,
	#[serde(default)]
	pub avatar: String,
	#[serde(default)]
	pub blocked: HashSet<UserId>,
	#[serde(default)]
	pub friends: HashSet<UserId>,
	#[serde(default)]
	pub is_admin: bool,
}

impl User {
	pub fn new(username: impl Into<String>) -> Self {
		Self {
			id: UserId::new_v4(),
			username: username.into(),
			avatar: String::new(),
			blocked: HashSet::new(),
			friends: HashSet::new(),
			is_admin: false,
		}
	}

	pub fn has_blocked(&self, other: UserId) -> bool {
		self.blocked.contains(&other)
	}
}

/// A group record: member set plus a typed per-member role relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
	pub id: GroupId,
	pub name: String,
	pub members: HashSet<UserId>,
	pub roles: HashMap<UserId, Role>,
	#[serde(default)]
	pub muted: HashSet<UserId>,
	#[serde(default)]
	pub pinned: Vec<MessageId>,
	#[serde(default)]
	pub announcements: Vec<MessageId>,
}

impl Group {
	/// Create a group. The creator becomes a member and the initial admin;
	/// every other listed member starts with the `member` role.
	pub fn new(name: impl Into<String>, creator: UserId, members: impl IntoIterator<Item = UserId>) -> Self {
		let mut member_set: HashSet<UserId> = members.into_iter().collect();
		member_set.insert(creator);

		let mut roles: HashMap<UserId, Role> = member_set.iter().map(|id| (*id, Role::Member)).collect();
		roles.insert(creator, Role::Admin);

		Self {
			id: GroupId::new_v4(),
			name: name.into(),
			members: member_set,
			roles,
			muted: HashSet::new(),
			pinned: Vec::new(),
			announcements: Vec::new(),
		}
	}

	pub fn is_member(&self, user: UserId) -> bool {
		self.members.contains(&user)
	}

	/// Role of a member; non-members have no role.
	pub fn role_of(&self, user: UserId) -> Option<Role> {
		if !self.is_member(user) {
			return None;
		}
		Some(self.roles.get(&user).copied().unwrap_or_default())
	}

	pub fn is_group_admin(&self, user: UserId) -> bool {
		self.role_of(user) == Some(Role::Admin)
	}
}

/// A message record.
///
/// Addressing lives in `room`, so a message always targets exactly one of a
/// recipient user or a group. A soft-deleted message keeps its record (and
/// stays visible to history/export) but is excluded from further edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub sender: UserId,
	pub room: Room,
	pub content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub attachment: Option<String>,
	#[serde(default)]
	pub read: bool,
	#[serde(default)]
	pub edited: bool,
	#[serde(default)]
	pub deleted: bool,
	#[serde(default)]
	pub reactions: BTreeMap<String, BTreeSet<UserId>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent: Option<MessageId>,
	pub created_at_unix_ms: i64,
	pub updated_at_unix_ms: i64,
}

impl Message {
	pub fn new(sender: UserId, room: Room, content: impl Into<String>, now_unix_ms: i64) -> Self {
		Self {
			id: MessageId::new_v4(),
			sender,
			room,
			content: content.into(),
			attachment: None,
			read: false,
			edited: false,
			deleted: false,
			reactions: BTreeMap::new(),
			parent: None,
			created_at_unix_ms: now_unix_ms,
			updated_at_unix_ms: now_unix_ms,
		}
	}

	/// Record a reaction; returns false if the reactor already reacted with
	/// this emoji.
	pub fn add_reaction(&mut self, emoji: impl Into<String>, reactor: UserId) -> bool {
		self.reactions.entry(emoji.into()).or_default().insert(reactor)
	}

	/// Remove a reaction, dropping the emoji key once no reactors remain.
	pub fn remove_reaction(&mut self, emoji: &str, reactor: UserId) -> bool {
		let Some(reactors) = self.reactions.get_mut(emoji) else {
			return false;
		};
		let removed = reactors.remove(&reactor);
		if reactors.is_empty() {
			self.reactions.remove(emoji);
		}
		removed
	}
}
