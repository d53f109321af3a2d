#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parley_domain::{Group, GroupId, Message, MessageId, Room, User, UserId};
use sqlx::Row as _;
use tokio::sync::RwLock;

/// Storage boundary for users, groups, and messages.
///
/// The engine owns delivery and moderation; everything durable goes through
/// this trait so the in-memory backend can stand in for tests and for
/// persistence-disabled deployments.
#[async_trait]
pub trait MessageStore: Send + Sync {
	async fn put_user(&self, user: &User) -> anyhow::Result<()>;
	async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>>;

	async fn put_group(&self, group: &Group) -> anyhow::Result<()>;
	async fn get_group(&self, id: GroupId) -> anyhow::Result<Option<Group>>;
	async fn groups_for_user(&self, user: UserId) -> anyhow::Result<Vec<GroupId>>;

	async fn insert_message(&self, msg: &Message) -> anyhow::Result<()>;
	async fn get_message(&self, id: MessageId) -> anyhow::Result<Option<Message>>;
	/// Overwrite an existing message record (edit, soft delete, read, reactions).
	async fn update_message(&self, msg: &Message) -> anyhow::Result<()>;

	/// Conversation between two users, both directions, oldest first.
	async fn direct_history(&self, a: UserId, b: UserId, limit: u32) -> anyhow::Result<Vec<Message>>;
	/// Group room history, oldest first.
	async fn group_history(&self, group: GroupId, limit: u32) -> anyhow::Result<Vec<Message>>;
}

/// In-memory backend. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
	inner: RwLock<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
	users: HashMap<UserId, User>,
	groups: HashMap<GroupId, Group>,
	messages: HashMap<MessageId, Message>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl MessageStore for MemoryStore {
	async fn put_user(&self, user: &User) -> anyhow::Result<()> {
		self.inner.write().await.users.insert(user.id, user.clone());
		Ok(())
	}

	async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>> {
		Ok(self.inner.read().await.users.get(&id).cloned())
	}

	async fn put_group(&self, group: &Group) -> anyhow::Result<()> {
		self.inner.write().await.groups.insert(group.id, group.clone());
		Ok(())
	}

	async fn get_group(&self, id: GroupId) -> anyhow::Result<Option<Group>> {
		Ok(self.inner.read().await.groups.get(&id).cloned())
	}

	async fn groups_for_user(&self, user: UserId) -> anyhow::Result<Vec<GroupId>> {
		let inner = self.inner.read().await;
		let mut out: Vec<GroupId> = inner
			.groups
			.values()
			.filter(|g| g.is_member(user))
			.map(|g| g.id)
			.collect();
		out.sort();
		Ok(out)
	}

	async fn insert_message(&self, msg: &Message) -> anyhow::Result<()> {
		self.inner.write().await.messages.insert(msg.id, msg.clone());
		Ok(())
	}

	async fn get_message(&self, id: MessageId) -> anyhow::Result<Option<Message>> {
		Ok(self.inner.read().await.messages.get(&id).cloned())
	}

	async fn update_message(&self, msg: &Message) -> anyhow::Result<()> {
		let mut inner = self.inner.write().await;
		if !inner.messages.contains_key(&msg.id) {
			return Err(anyhow!("unknown message: {}", msg.id));
		}
		inner.messages.insert(msg.id, msg.clone());
		Ok(())
	}

	async fn direct_history(&self, a: UserId, b: UserId, limit: u32) -> anyhow::Result<Vec<Message>> {
		let inner = self.inner.read().await;
		let matches = |m: &Message| {
			(m.sender == a && m.room == Room::User(b)) || (m.sender == b && m.room == Room::User(a))
		};
		Ok(collect_history(inner.messages.values().filter(|m| matches(m)), limit))
	}

	async fn group_history(&self, group: GroupId, limit: u32) -> anyhow::Result<Vec<Message>> {
		let inner = self.inner.read().await;
		let room = Room::Group(group);
		Ok(collect_history(inner.messages.values().filter(|m| m.room == room), limit))
	}
}

fn collect_history<'a>(iter: impl Iterator<Item = &'a Message>, limit: u32) -> Vec<Message> {
	let mut out: Vec<Message> = iter.cloned().collect();
	out.sort_by_key(|m| (m.created_at_unix_ms, m.id));
	if out.len() > limit as usize {
		out.drain(..out.len() - limit as usize);
	}
	out
}

/// SQLite-backed store. Records are kept as JSON payloads next to the columns
/// the queries need.
#[derive(Debug, Clone)]
pub struct SqliteStore {
	pool: sqlx::SqlitePool,
}

impl SqliteStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (expected sqlite:): {database_url}"));
		}

		// An in-memory database exists per connection, so the pool must not
		// grow past one.
		let pool = if database_url.contains(":memory:") {
			sqlx::sqlite::SqlitePoolOptions::new()
				.max_connections(1)
				.connect(database_url)
				.await
				.context("connect sqlite")?
		} else {
			sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?
		};
		sqlx::migrate!("./migrations").run(&pool).await.context("run migrations")?;
		Ok(Self { pool })
	}

	fn decode_messages(rows: Vec<sqlx::sqlite::SqliteRow>) -> anyhow::Result<Vec<Message>> {
		let mut out = Vec::with_capacity(rows.len());
		for row in rows {
			let payload: String = row.get("payload");
			out.push(serde_json::from_str(&payload).context("decode message payload")?);
		}
		out.reverse();
		Ok(out)
	}
}

#[async_trait]
impl MessageStore for SqliteStore {
	async fn put_user(&self, user: &User) -> anyhow::Result<()> {
		let payload = serde_json::to_string(user).context("encode user")?;
		sqlx::query("INSERT INTO users (id, payload) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET payload = excluded.payload")
			.bind(user.id.to_string())
			.bind(payload)
			.execute(&self.pool)
			.await
			.context("upsert user")?;
		Ok(())
	}

	async fn get_user(&self, id: UserId) -> anyhow::Result<Option<User>> {
		let row = sqlx::query("SELECT payload FROM users WHERE id = ?")
			.bind(id.to_string())
			.fetch_optional(&self.pool)
			.await
			.context("select user")?;

		match row {
			Some(row) => {
				let payload: String = row.get("payload");
				Ok(Some(serde_json::from_str(&payload).context("decode user payload")?))
			}
			None => Ok(None),
		}
	}

	async fn put_group(&self, group: &Group) -> anyhow::Result<()> {
		let payload = serde_json::to_string(group).context("encode group")?;

		let mut tx = self.pool.begin().await.context("begin group upsert")?;
		sqlx::query("INSERT INTO groups (id, payload) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET payload = excluded.payload")
			.bind(group.id.to_string())
			.bind(payload)
			.execute(&mut *tx)
			.await
			.context("upsert group")?;

		sqlx::query("DELETE FROM group_members WHERE group_id = ?")
			.bind(group.id.to_string())
			.execute(&mut *tx)
			.await
			.context("clear group members")?;

		for member in &group.members {
			sqlx::query("INSERT INTO group_members (group_id, user_id) VALUES (?, ?)")
				.bind(group.id.to_string())
				.bind(member.to_string())
				.execute(&mut *tx)
				.await
				.context("insert group member")?;
		}

		tx.commit().await.context("commit group upsert")?;
		Ok(())
	}

	async fn get_group(&self, id: GroupId) -> anyhow::Result<Option<Group>> {
		let row = sqlx::query("SELECT payload FROM groups WHERE id = ?")
			.bind(id.to_string())
			.fetch_optional(&self.pool)
			.await
			.context("select group")?;

		match row {
			Some(row) => {
				let payload: String = row.get("payload");
				Ok(Some(serde_json::from_str(&payload).context("decode group payload")?))
			}
			None => Ok(None),
		}
	}

	async fn groups_for_user(&self, user: UserId) -> anyhow::Result<Vec<GroupId>> {
		let rows = sqlx::query("SELECT group_id FROM group_members WHERE user_id = ? ORDER BY group_id")
			.bind(user.to_string())
			.fetch_all(&self.pool)
			.await
			.context("select group memberships")?;

		let mut out = Vec::with_capacity(rows.len());
		for row in rows {
			let id: String = row.get("group_id");
			out.push(id.parse().map_err(|e| anyhow!("bad group id in store: {e}"))?);
		}
		Ok(out)
	}

	async fn insert_message(&self, msg: &Message) -> anyhow::Result<()> {
		let payload = serde_json::to_string(msg).context("encode message")?;
		sqlx::query(
			"INSERT INTO messages (id, room, sender, created_at_unix_ms, payload) VALUES (?, ?, ?, ?, ?)",
		)
		.bind(msg.id.to_string())
		.bind(msg.room.to_string())
		.bind(msg.sender.to_string())
		.bind(msg.created_at_unix_ms)
		.bind(payload)
		.execute(&self.pool)
		.await
		.context("insert message")?;
		Ok(())
	}

	async fn get_message(&self, id: MessageId) -> anyhow::Result<Option<Message>> {
		let row = sqlx::query("SELECT payload FROM messages WHERE id = ?")
			.bind(id.to_string())
			.fetch_optional(&self.pool)
			.await
			.context("select message")?;

		match row {
			Some(row) => {
				let payload: String = row.get("payload");
				Ok(Some(serde_json::from_str(&payload).context("decode message payload")?))
			}
			None => Ok(None),
		}
	}

	async fn update_message(&self, msg: &Message) -> anyhow::Result<()> {
		let payload = serde_json::to_string(msg).context("encode message")?;
		let result = sqlx::query("UPDATE messages SET payload = ? WHERE id = ?")
			.bind(payload)
			.bind(msg.id.to_string())
			.execute(&self.pool)
			.await
			.context("update message")?;

		if result.rows_affected() == 0 {
			return Err(anyhow!("unknown message: {}", msg.id));
		}
		Ok(())
	}

	async fn direct_history(&self, a: UserId, b: UserId, limit: u32) -> anyhow::Result<Vec<Message>> {
		let rows = sqlx::query(
			"SELECT payload FROM messages \
			WHERE (sender = ? AND room = ?) OR (sender = ? AND room = ?) \
			ORDER BY created_at_unix_ms DESC, id DESC LIMIT ?",
		)
		.bind(a.to_string())
		.bind(Room::User(b).to_string())
		.bind(b.to_string())
		.bind(Room::User(a).to_string())
		.bind(i64::from(limit))
		.fetch_all(&self.pool)
		.await
		.context("select direct history")?;

		Self::decode_messages(rows)
	}

	async fn group_history(&self, group: GroupId, limit: u32) -> anyhow::Result<Vec<Message>> {
		let rows = sqlx::query(
			"SELECT payload FROM messages WHERE room = ? ORDER BY created_at_unix_ms DESC, id DESC LIMIT ?",
		)
		.bind(Room::Group(group).to_string())
		.bind(i64::from(limit))
		.fetch_all(&self.pool)
		.await
		.context("select group history")?;

		Self::decode_messages(rows)
	}
}
