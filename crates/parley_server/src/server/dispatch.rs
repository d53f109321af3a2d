#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{Group, GroupId, Message, MessageId, Room, User, UserId};
use parley_protocol::{ErrorCode, ServerEvent};
use thiserror::Error;
use tracing::info;

use crate::server::moderation::{ModerationGate, SendRejection};
use crate::server::room_hub::RoomHub;
use crate::server::store::MessageStore;
use crate::util::time::unix_ms_now;

/// Default and maximum history page sizes.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 500;

#[derive(Debug, Error)]
pub enum DispatchError {
	#[error("unauthenticated")]
	Unauthenticated,
	#[error("unauthorized: {0}")]
	Unauthorized(&'static str),
	#[error("not found: {0}")]
	NotFound(&'static str),
	#[error("sender and recipient block each other")]
	Blocked,
	#[error("message rejected by profanity filter")]
	Profane,
	#[error("duplicate message suppressed")]
	Throttled,
	#[error("invalid request: {0}")]
	ValidationFailed(&'static str),
	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

impl DispatchError {
	/// Wire-level rejection code.
	pub fn code(&self) -> ErrorCode {
		match self {
			DispatchError::Unauthenticated => ErrorCode::Unauthenticated,
			DispatchError::Unauthorized(_) => ErrorCode::Unauthorized,
			DispatchError::NotFound(_) => ErrorCode::NotFound,
			DispatchError::Blocked => ErrorCode::Blocked,
			DispatchError::Profane => ErrorCode::Profane,
			DispatchError::Throttled => ErrorCode::Throttled,
			DispatchError::ValidationFailed(_) => ErrorCode::ValidationFailed,
			DispatchError::Internal(_) => ErrorCode::Internal,
		}
	}
}

impl From<SendRejection> for DispatchError {
	fn from(rejection: SendRejection) -> Self {
		match rejection {
			SendRejection::Blocked => DispatchError::Blocked,
			SendRejection::Profane => DispatchError::Profane,
			SendRejection::Throttled => DispatchError::Throttled,
		}
	}
}

/// Applies moderation, persists, then fans out. Both the socket path and the
/// HTTP path route message operations through here so the checks cannot
/// drift apart.
#[derive(Clone)]
pub struct Dispatcher {
	store: Arc<dyn MessageStore>,
	gate: Arc<ModerationGate>,
	hub: RoomHub,
}

impl Dispatcher {
	pub fn new(store: Arc<dyn MessageStore>, gate: Arc<ModerationGate>, hub: RoomHub) -> Self {
		Self { store, gate, hub }
	}

	pub fn store(&self) -> &Arc<dyn MessageStore> {
		&self.store
	}

	pub fn hub(&self) -> &RoomHub {
		&self.hub
	}

	/// Moderate, persist, and fan out a new message.
	pub async fn send_message(
		&self,
		sender: UserId,
		to: Room,
		content: &str,
		attachment: Option<String>,
		parent: Option<MessageId>,
	) -> Result<Message, DispatchError> {
		if content.trim().is_empty() && attachment.is_none() {
			return Err(DispatchError::ValidationFailed("empty message"));
		}

		let sender_user = self.require_user(sender).await?;
		let now = unix_ms_now();

		match to {
			Room::User(recipient) => {
				let recipient_user = self
					.store
					.get_user(recipient)
					.await?
					.ok_or(DispatchError::NotFound("recipient"))?;
				self.gate.admit_send(&sender_user, Some(&recipient_user), to, content, now)?;
			}
			Room::Group(group_id) => {
				let group = self.require_group(group_id).await?;
				if !group.is_member(sender) {
					return Err(DispatchError::Unauthorized("not a group member"));
				}
				if group.muted.contains(&sender) {
					return Err(DispatchError::Unauthorized("muted in this group"));
				}
				self.gate.admit_send(&sender_user, None, to, content, now)?;
			}
		}

		let mut msg = Message::new(sender, to, content, now);
		msg.attachment = attachment;
		msg.parent = parent;

		self.store.insert_message(&msg).await?;
		metrics::counter!("parley_server_messages_sent_total").increment(1);

		self.fanout(&msg, ServerEvent::MessageReceive(msg.clone())).await;
		Ok(msg)
	}

	/// Replace a message's content. Only the sender may edit, and deleted
	/// messages are immutable.
	pub async fn edit_message(
		&self,
		editor: UserId,
		message_id: MessageId,
		content: &str,
	) -> Result<Message, DispatchError> {
		if content.trim().is_empty() {
			return Err(DispatchError::ValidationFailed("empty message"));
		}

		let mut msg = self.require_message(message_id).await?;
		if msg.sender != editor {
			return Err(DispatchError::Unauthorized("only the sender may edit"));
		}
		if msg.deleted {
			return Err(DispatchError::ValidationFailed("message is deleted"));
		}

		self.gate.admit_edit(content)?;

		msg.content = content.to_string();
		msg.edited = true;
		msg.updated_at_unix_ms = unix_ms_now();
		self.store.update_message(&msg).await?;

		self.fanout(&msg, ServerEvent::MessageEdit(msg.clone())).await;
		Ok(msg)
	}

	/// Soft-delete a message. Only the sender may delete; repeating the
	/// delete is a no-op.
	pub async fn delete_message(&self, requester: UserId, message_id: MessageId) -> Result<Message, DispatchError> {
		let mut msg = self.require_message(message_id).await?;
		if msg.sender != requester {
			return Err(DispatchError::Unauthorized("only the sender may delete"));
		}
		if msg.deleted {
			return Ok(msg);
		}

		msg.deleted = true;
		msg.updated_at_unix_ms = unix_ms_now();
		self.store.update_message(&msg).await?;
		info!(message_id = %msg.id, "message soft-deleted");

		self.fanout(&msg, ServerEvent::MessageDelete { message_id: msg.id }).await;
		Ok(msg)
	}

	/// Mark a message read on behalf of its audience and notify the sender.
	pub async fn mark_read(&self, reader: UserId, message_id: MessageId) -> Result<Message, DispatchError> {
		let mut msg = self.require_message(message_id).await?;
		if msg.sender == reader {
			return Err(DispatchError::ValidationFailed("sender cannot mark own message read"));
		}

		match msg.room {
			Room::User(recipient) => {
				if recipient != reader {
					return Err(DispatchError::Unauthorized("not the recipient"));
				}
			}
			Room::Group(group_id) => {
				let group = self.require_group(group_id).await?;
				if !group.is_member(reader) {
					return Err(DispatchError::Unauthorized("not a group member"));
				}
			}
		}

		if !msg.read {
			msg.read = true;
			msg.updated_at_unix_ms = unix_ms_now();
			self.store.update_message(&msg).await?;
		}

		self.hub
			.publish(Room::User(msg.sender), ServerEvent::MessageRead {
				message_id: msg.id,
				by: reader,
			})
			.await;
		Ok(msg)
	}

	/// Conversation history between the requester and another user.
	///
	/// A requester who blocked the counterpart gets nothing; a counterpart who
	/// blocked the requester stays hidden from the result.
	pub async fn direct_history(
		&self,
		requester: UserId,
		other: UserId,
		limit: Option<u32>,
	) -> Result<Vec<Message>, DispatchError> {
		let requester_user = self.require_user(requester).await?;
		let other_user = self.require_user(other).await?;
		if requester_user.has_blocked(other) {
			return Err(DispatchError::Blocked);
		}

		let limit = clamp_limit(limit);
		let mut history = self.store.direct_history(requester, other, limit).await?;
		if other_user.has_blocked(requester) {
			history.retain(|m| m.sender != other);
		}
		Ok(history)
	}

	/// Record a reaction from someone in the message's audience.
	///
	/// Reacting twice with the same emoji is a no-op and fans out nothing.
	pub async fn add_reaction(
		&self,
		reactor: UserId,
		message_id: MessageId,
		emoji: &str,
	) -> Result<Message, DispatchError> {
		let emoji = emoji.trim();
		if emoji.is_empty() {
			return Err(DispatchError::ValidationFailed("empty emoji"));
		}

		let mut msg = self.require_message(message_id).await?;
		if msg.deleted {
			return Err(DispatchError::ValidationFailed("message is deleted"));
		}
		self.require_audience(reactor, &msg).await?;

		if !msg.add_reaction(emoji, reactor) {
			return Ok(msg);
		}
		msg.updated_at_unix_ms = unix_ms_now();
		self.store.update_message(&msg).await?;

		self.fanout(&msg, ServerEvent::MessageReaction {
			message_id: msg.id,
			emoji: emoji.to_string(),
			by: reactor,
			added: true,
		})
		.await;
		Ok(msg)
	}

	/// Withdraw a previously recorded reaction. Removing a reaction that was
	/// never recorded is a no-op.
	pub async fn remove_reaction(
		&self,
		reactor: UserId,
		message_id: MessageId,
		emoji: &str,
	) -> Result<Message, DispatchError> {
		let mut msg = self.require_message(message_id).await?;
		self.require_audience(reactor, &msg).await?;

		if !msg.remove_reaction(emoji.trim(), reactor) {
			return Ok(msg);
		}
		msg.updated_at_unix_ms = unix_ms_now();
		self.store.update_message(&msg).await?;

		self.fanout(&msg, ServerEvent::MessageReaction {
			message_id: msg.id,
			emoji: emoji.trim().to_string(),
			by: reactor,
			added: false,
		})
		.await;
		Ok(msg)
	}

	/// Pin a group message. Requires a group admin role or a server-wide
	/// admin account; pinning an already-pinned message is a no-op.
	pub async fn pin_message(&self, requester: UserId, message_id: MessageId) -> Result<Message, DispatchError> {
		let msg = self.require_message(message_id).await?;
		let Room::Group(group_id) = msg.room else {
			return Err(DispatchError::ValidationFailed("only group messages can be pinned"));
		};

		let requester_user = self.require_user(requester).await?;
		let mut group = self.require_group(group_id).await?;
		if !group.is_group_admin(requester) && !requester_user.is_admin {
			return Err(DispatchError::Unauthorized("pinning requires admin role"));
		}

		if group.pinned.contains(&msg.id) {
			return Ok(msg);
		}
		group.pinned.push(msg.id);
		self.store.put_group(&group).await?;

		self.hub
			.publish(msg.room, ServerEvent::MessagePin {
				message_id: msg.id,
				by: requester,
			})
			.await;
		Ok(msg)
	}

	/// Unpin a group message, with the same authority rules as pinning.
	pub async fn unpin_message(&self, requester: UserId, message_id: MessageId) -> Result<Message, DispatchError> {
		let msg = self.require_message(message_id).await?;
		let Room::Group(group_id) = msg.room else {
			return Err(DispatchError::ValidationFailed("only group messages can be pinned"));
		};

		let requester_user = self.require_user(requester).await?;
		let mut group = self.require_group(group_id).await?;
		if !group.is_group_admin(requester) && !requester_user.is_admin {
			return Err(DispatchError::Unauthorized("pinning requires admin role"));
		}

		let before = group.pinned.len();
		group.pinned.retain(|id| *id != msg.id);
		if group.pinned.len() == before {
			return Ok(msg);
		}
		self.store.put_group(&group).await?;

		self.hub
			.publish(msg.room, ServerEvent::MessageUnpin {
				message_id: msg.id,
				by: requester,
			})
			.await;
		Ok(msg)
	}

	/// Group history, members only.
	pub async fn group_history(
		&self,
		requester: UserId,
		group_id: GroupId,
		limit: Option<u32>,
	) -> Result<Vec<Message>, DispatchError> {
		let group = self.require_group(group_id).await?;
		if !group.is_member(requester) {
			return Err(DispatchError::Unauthorized("not a group member"));
		}

		let limit = clamp_limit(limit);
		Ok(self.store.group_history(group_id, limit).await?)
	}

	/// Post a group announcement. Requires a group admin role or a
	/// server-wide admin account.
	pub async fn post_announcement(
		&self,
		sender: UserId,
		group_id: GroupId,
		content: &str,
	) -> Result<Message, DispatchError> {
		if content.trim().is_empty() {
			return Err(DispatchError::ValidationFailed("empty announcement"));
		}

		let sender_user = self.require_user(sender).await?;
		let mut group = self.require_group(group_id).await?;
		if !group.is_group_admin(sender) && !sender_user.is_admin {
			return Err(DispatchError::Unauthorized("announcements require admin role"));
		}

		let now = unix_ms_now();
		let room = Room::Group(group_id);
		self.gate.admit_send(&sender_user, None, room, content, now)?;

		let msg = Message::new(sender, room, content, now);
		self.store.insert_message(&msg).await?;

		group.announcements.push(msg.id);
		self.store.put_group(&group).await?;
		metrics::counter!("parley_server_announcements_total").increment(1);

		self.hub.publish(room, ServerEvent::MessageReceive(msg.clone())).await;
		Ok(msg)
	}

	async fn require_user(&self, id: UserId) -> Result<User, DispatchError> {
		self.store.get_user(id).await?.ok_or(DispatchError::NotFound("user"))
	}

	async fn require_group(&self, id: GroupId) -> Result<Group, DispatchError> {
		self.store.get_group(id).await?.ok_or(DispatchError::NotFound("group"))
	}

	async fn require_message(&self, id: MessageId) -> Result<Message, DispatchError> {
		self.store
			.get_message(id)
			.await?
			.ok_or(DispatchError::NotFound("message"))
	}

	/// The sender, the direct recipient, or any group member.
	async fn require_audience(&self, user: UserId, msg: &Message) -> Result<(), DispatchError> {
		if msg.sender == user {
			return Ok(());
		}
		match msg.room {
			Room::User(recipient) if recipient == user => Ok(()),
			Room::User(_) => Err(DispatchError::Unauthorized("not a conversation participant")),
			Room::Group(group_id) => {
				let group = self.require_group(group_id).await?;
				if group.is_member(user) {
					Ok(())
				} else {
					Err(DispatchError::Unauthorized("not a group member"))
				}
			}
		}
	}

	/// Publish to the message's room, and for direct messages echo to the
	/// sender's identity room so their other devices stay in sync.
	async fn fanout(&self, msg: &Message, event: ServerEvent) {
		self.hub.publish(msg.room, event.clone()).await;

		if let Room::User(recipient) = msg.room
			&& recipient != msg.sender
		{
			self.hub.publish(Room::User(msg.sender), event).await;
		}
	}
}

fn clamp_limit(limit: Option<u32>) -> u32 {
	limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT)
}
