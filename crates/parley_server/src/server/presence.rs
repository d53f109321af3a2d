#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parley_domain::UserId;
use tokio::sync::Mutex;
use tracing::debug;

/// Connection-count presence registry.
///
/// A user is online while at least one live connection holds a reference.
/// Presence is derived state only; it is never persisted.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
	inner: Arc<Mutex<HashMap<UserId, u32>>>,
}

impl PresenceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a new connection. Returns true when this is the user's first
	/// live connection, i.e. the offline -> online transition.
	pub async fn connected(&self, user: UserId) -> bool {
		let mut inner = self.inner.lock().await;
		let count = inner.entry(user).or_insert(0);
		*count += 1;

		let transitioned = *count == 1;
		if transitioned {
			debug!(%user, "presence: online");
			metrics::gauge!("parley_server_online_users").increment(1.0);
		}
		transitioned
	}

	/// Record a connection teardown. Returns true when the user's last
	/// connection went away, i.e. the online -> offline transition.
	pub async fn disconnected(&self, user: UserId) -> bool {
		let mut inner = self.inner.lock().await;
		let Some(count) = inner.get_mut(&user) else {
			return false;
		};

		*count = count.saturating_sub(1);
		if *count > 0 {
			return false;
		}

		inner.remove(&user);
		debug!(%user, "presence: offline");
		metrics::gauge!("parley_server_online_users").decrement(1.0);
		true
	}

	pub async fn is_online(&self, user: UserId) -> bool {
		self.inner.lock().await.contains_key(&user)
	}

	/// Number of distinct online users.
	pub async fn online_count(&self) -> usize {
		self.inner.lock().await.len()
	}
}
