#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use parley_domain::{Room, UserId};

/// One authenticated connection.
#[derive(Debug, Clone)]
pub struct SessionInfo {
	pub user: UserId,
	pub rooms: HashSet<Room>,
}

/// Shared registry of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
	sessions: HashMap<u64, SessionInfo>,
}

impl SessionRegistry {
	/// Register an authenticated connection with its room subscriptions.
	pub fn register(&mut self, conn_id: u64, user: UserId, rooms: HashSet<Room>) {
		self.sessions.insert(conn_id, SessionInfo { user, rooms });
	}

	/// Remove a connection, returning what it was registered as.
	pub fn remove_conn(&mut self, conn_id: u64) -> Option<SessionInfo> {
		self.sessions.remove(&conn_id)
	}

	pub fn active_count(&self) -> usize {
		self.sessions.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn register_and_remove() {
		let mut reg = SessionRegistry::default();
		let user = UserId::new_v4();
		let rooms: HashSet<Room> = [Room::User(user)].into_iter().collect();

		reg.register(7, user, rooms.clone());
		assert_eq!(reg.active_count(), 1);

		let info = reg.remove_conn(7).expect("session");
		assert_eq!(info.user, user);
		assert_eq!(info.rooms, rooms);
		assert!(reg.remove_conn(7).is_none());
		assert_eq!(reg.active_count(), 0);
	}

	#[test]
	fn counts_every_live_session() {
		let mut reg = SessionRegistry::default();
		let user = UserId::new_v4();

		reg.register(1, user, HashSet::new());
		reg.register(2, user, HashSet::new());
		assert_eq!(reg.active_count(), 2);
	}
}
