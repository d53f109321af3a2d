#![forbid(unsafe_code)]

use parley_domain::{GroupId, Message, MessageId, Room, UserId};
use serde::{Deserialize, Serialize};

/// v1 protocol version written into every frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Moderation/authorization rejection codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
	Unauthenticated,
	Unauthorized,
	NotFound,
	Blocked,
	Profane,
	Throttled,
	ValidationFailed,
	Internal,
}

/// Direct-or-group addressing carried by client events.
///
/// Well-formed payloads set exactly one of the two fields; `room()` returns
/// `None` for the neither and both cases so callers can reject them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub recipient: Option<UserId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub group: Option<GroupId>,
}

impl Address {
	pub fn user(recipient: UserId) -> Self {
		Self {
			recipient: Some(recipient),
			group: None,
		}
	}

	pub fn group(group: GroupId) -> Self {
		Self {
			recipient: None,
			group: Some(group),
		}
	}

	/// Resolve to a room if exactly one target is set.
	pub fn room(&self) -> Option<Room> {
		match (self.recipient, self.group) {
			(Some(user), None) => Some(Room::User(user)),
			(None, Some(group)) => Some(Room::Group(group)),
			_ => None,
		}
	}
}

/// Events a client may emit over its persistent connection.
///
/// `Hello` is the handshake; everything else is discarded by the server until
/// the handshake has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
	#[serde(rename = "hello")]
	Hello { token: String },

	#[serde(rename = "message:send")]
	MessageSend {
		#[serde(flatten)]
		to: Address,
		content: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		attachment: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		parent: Option<MessageId>,
	},

	#[serde(rename = "message:edit")]
	MessageEdit {
		message_id: MessageId,
		content: String,
		#[serde(flatten)]
		to: Address,
	},

	#[serde(rename = "message:delete")]
	MessageDelete {
		message_id: MessageId,
		#[serde(flatten)]
		to: Address,
	},

	#[serde(rename = "message:read")]
	MessageRead {
		message_id: MessageId,
		#[serde(flatten)]
		to: Address,
	},

	#[serde(rename = "typing")]
	Typing {
		#[serde(flatten)]
		to: Address,
	},

	#[serde(rename = "call:initiate")]
	CallInitiate {
		recipient: UserId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		signal_data: Option<serde_json::Value>,
	},

	#[serde(rename = "call:signal")]
	CallSignal {
		recipient: UserId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		signal_data: Option<serde_json::Value>,
	},

	#[serde(rename = "call:end")]
	CallEnd { recipient: UserId },
}

/// Events the server pushes to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
	#[serde(rename = "welcome")]
	Welcome {
		user_id: UserId,
		server_time_unix_ms: i64,
		max_frame_bytes: u32,
	},

	#[serde(rename = "message:receive")]
	MessageReceive(Message),

	#[serde(rename = "message:edit")]
	MessageEdit(Message),

	#[serde(rename = "message:delete")]
	MessageDelete { message_id: MessageId },

	#[serde(rename = "message:read")]
	MessageRead { message_id: MessageId, by: UserId },

	#[serde(rename = "message:reaction")]
	MessageReaction {
		message_id: MessageId,
		emoji: String,
		by: UserId,
		added: bool,
	},

	#[serde(rename = "message:pin")]
	MessagePin { message_id: MessageId, by: UserId },

	#[serde(rename = "message:unpin")]
	MessageUnpin { message_id: MessageId, by: UserId },

	#[serde(rename = "typing")]
	Typing { from: UserId },

	#[serde(rename = "call:incoming")]
	CallIncoming {
		from: UserId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		signal_data: Option<serde_json::Value>,
	},

	#[serde(rename = "call:signal")]
	CallSignal {
		from: UserId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		signal_data: Option<serde_json::Value>,
	},

	#[serde(rename = "call:end")]
	CallEnd { from: UserId },

	#[serde(rename = "user:online")]
	UserOnline { user_id: UserId },

	#[serde(rename = "user:offline")]
	UserOffline { user_id: UserId },

	#[serde(rename = "error")]
	Error { code: ErrorCode, message: String },
}

/// Client-to-server frame: version plus event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
	pub v: u32,
	#[serde(flatten)]
	pub event: ClientEvent,
}

impl ClientFrame {
	pub fn new(event: ClientEvent) -> Self {
		Self {
			v: PROTOCOL_VERSION,
			event,
		}
	}
}

/// Server-to-client frame: version plus event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
	pub v: u32,
	#[serde(flatten)]
	pub event: ServerEvent,
}

impl ServerFrame {
	pub fn new(event: ServerEvent) -> Self {
		Self {
			v: PROTOCOL_VERSION,
			event,
		}
	}
}
