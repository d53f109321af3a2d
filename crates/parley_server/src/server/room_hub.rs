#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::Room;
use parley_protocol::{ServerEvent, ServerFrame};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Per-room hub that fans server events out to connection subscribers.
///
/// Every session subscribes to its own identity room plus one room per group
/// membership, so a user-room publish reaches each of that user's devices
/// exactly once.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued frames per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum HubItem {
	Frame(Box<ServerFrame>),

	/// Indicates the subscriber is lagging and frames were dropped.
	Lagged { dropped: u64 },
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe to a room.
	pub async fn subscribe_room(&self, room: Room) -> mpsc::Receiver<HubItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(room).or_default();

		entry.prune_closed();
		entry.subscribers.push(Subscriber { tx, pending_lag: 0 });

		if self.cfg.debug_logs {
			debug!(room = %room, subs = entry.subscribers.len(), "room hub: subscribed");
		}

		rx
	}

	/// Publish a server event to subscribers of a room.
	pub async fn publish(&self, room: Room, event: ServerEvent) {
		let item = HubItem::Frame(Box::new(ServerFrame::new(event)));

		let mut inner = self.inner.lock().await;
		let dropped = inner.deliver(room, &item);

		if self.cfg.debug_logs && dropped > 0 {
			debug!(room = %room, dropped, "room hub: dropped due to full subscriber queues");
		}
	}

	/// Publish a server event to every user identity room except `except`.
	///
	/// Presence announcements go here: each live session holds exactly one
	/// identity-room subscription, so each connection sees one copy. The
	/// transitioning user's own room is excluded because their sessions
	/// already know.
	pub async fn broadcast_users(&self, event: ServerEvent, except: Option<parley_domain::UserId>) {
		let item = HubItem::Frame(Box::new(ServerFrame::new(event)));

		let mut inner = self.inner.lock().await;
		let user_rooms: Vec<Room> = inner
			.rooms
			.keys()
			.filter(|room| match room {
				Room::User(user) => Some(*user) != except,
				Room::Group(_) => false,
			})
			.copied()
			.collect();

		let mut dropped_total = 0u64;
		for room in user_rooms {
			dropped_total += inner.deliver(room, &item);
		}

		if self.cfg.debug_logs && dropped_total > 0 {
			debug!(dropped = dropped_total, "room hub: broadcast dropped frames");
		}
	}

	/// Number of live subscribers in a room.
	pub async fn subscriber_count(&self, room: Room) -> usize {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.get(&room)
			.map(|e| e.subscribers.iter().filter(|s| !s.tx.is_closed()).count())
			.unwrap_or(0)
	}
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<Room, RoomEntry>,
}

impl Inner {
	/// Deliver one item to a room, returning the number of frames dropped on
	/// full queues. Empty rooms are removed.
	fn deliver(&mut self, room: Room, item: &HubItem) -> u64 {
		let Some(entry) = self.rooms.get_mut(&room) else {
			return 0;
		};

		entry.prune_closed();
		if entry.subscribers.is_empty() {
			self.rooms.remove(&room);
			return 0;
		}

		let mut dropped_total = 0u64;

		for sub in entry.subscribers.iter_mut() {
			match sub.tx.try_send(item.clone()) {
				Ok(()) => {
					if sub.pending_lag > 0
						&& sub
							.tx
							.try_send(HubItem::Lagged {
								dropped: sub.pending_lag,
							})
							.is_ok()
					{
						sub.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					sub.pending_lag = sub.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		entry.prune_closed();
		if entry.subscribers.is_empty() {
			self.rooms.remove(&room);
		}

		dropped_total
	}
}

#[derive(Debug)]
struct Subscriber {
	tx: mpsc::Sender<HubItem>,

	/// Frames dropped since this subscriber last kept up.
	pending_lag: u64,
}

#[derive(Debug, Default)]
struct RoomEntry {
	subscribers: Vec<Subscriber>,
}

impl RoomEntry {
	fn prune_closed(&mut self) {
		self.subscribers.retain(|s| !s.tx.is_closed());
	}
}
