use parley_domain::UserId;

use crate::server::presence::PresenceRegistry;

#[tokio::test]
async fn first_connection_transitions_online() {
	let presence = PresenceRegistry::new();
	let user = UserId::new_v4();

	assert!(!presence.is_online(user).await);
	assert!(presence.connected(user).await);
	assert!(presence.is_online(user).await);

	// A second tab does not re-announce.
	assert!(!presence.connected(user).await);
}

#[tokio::test]
async fn offline_only_after_last_connection_drops() {
	let presence = PresenceRegistry::new();
	let user = UserId::new_v4();

	presence.connected(user).await;
	presence.connected(user).await;

	assert!(!presence.disconnected(user).await);
	assert!(presence.is_online(user).await);

	assert!(presence.disconnected(user).await);
	assert!(!presence.is_online(user).await);
	assert_eq!(presence.online_count().await, 0);
}

#[tokio::test]
async fn disconnect_without_connect_is_a_noop() {
	let presence = PresenceRegistry::new();
	assert!(!presence.disconnected(UserId::new_v4()).await);
	assert_eq!(presence.online_count().await, 0);
}
