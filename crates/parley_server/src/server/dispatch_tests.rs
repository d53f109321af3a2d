use std::sync::Arc;

use parley_domain::{Group, Room, User, UserId};
use parley_protocol::ServerEvent;
use tokio::sync::mpsc;

use crate::server::dispatch::{DispatchError, Dispatcher};
use crate::server::moderation::{ModerationConfig, ModerationGate};
use crate::server::room_hub::{HubItem, RoomHub, RoomHubConfig};
use crate::server::store::{MemoryStore, MessageStore};

struct Harness {
	dispatcher: Dispatcher,
	hub: RoomHub,
	store: Arc<MemoryStore>,
}

fn harness() -> Harness {
	let store = Arc::new(MemoryStore::new());
	let gate = Arc::new(ModerationGate::new(ModerationConfig {
		profanity_words: vec!["zonk".to_string()],
		dedupe_window_ms: 10_000,
		dedupe_max_entries: 1024,
	}));
	let hub = RoomHub::new(RoomHubConfig::default());

	Harness {
		dispatcher: Dispatcher::new(store.clone(), gate, hub.clone()),
		hub,
		store,
	}
}

async fn new_user(store: &MemoryStore, name: &str) -> User {
	let user = User::new(name);
	store.put_user(&user).await.unwrap();
	user
}

fn recv_event(rx: &mut mpsc::Receiver<HubItem>) -> ServerEvent {
	match rx.try_recv().expect("expected a queued frame") {
		HubItem::Frame(frame) => frame.event,
		HubItem::Lagged { dropped } => panic!("unexpected lag marker (dropped={dropped})"),
	}
}

#[tokio::test]
async fn direct_send_reaches_recipient_and_echoes_to_sender() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;
	let bob = new_user(&h.store, "bob").await;

	let mut bob_rx = h.hub.subscribe_room(Room::User(bob.id)).await;
	let mut alice_rx = h.hub.subscribe_room(Room::User(alice.id)).await;

	let msg = h
		.dispatcher
		.send_message(alice.id, Room::User(bob.id), "hi bob", None, None)
		.await
		.unwrap();

	assert_eq!(recv_event(&mut bob_rx), ServerEvent::MessageReceive(msg.clone()));
	assert_eq!(recv_event(&mut alice_rx), ServerEvent::MessageReceive(msg));
}

#[tokio::test]
async fn resend_is_throttled_and_block_wins_afterwards() {
	let h = harness();
	let mut alice = new_user(&h.store, "alice").await;
	let bob = new_user(&h.store, "bob").await;
	let room = Room::User(bob.id);

	h.dispatcher
		.send_message(alice.id, room, "hello", None, None)
		.await
		.unwrap();

	// Byte-identical resend inside the window.
	let err = h
		.dispatcher
		.send_message(alice.id, room, "hello", None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, DispatchError::Throttled));

	// Once either side blocks, the block outranks every other check.
	alice.blocked.insert(bob.id);
	h.store.put_user(&alice).await.unwrap();
	let err = h
		.dispatcher
		.send_message(alice.id, room, "hello again", None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, DispatchError::Blocked));
}

#[tokio::test]
async fn group_send_requires_membership() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;
	let mallory = new_user(&h.store, "mallory").await;
	let group = Group::new("team", alice.id, []);
	h.store.put_group(&group).await.unwrap();

	let err = h
		.dispatcher
		.send_message(mallory.id, Room::Group(group.id), "let me in", None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));

	let msg = h
		.dispatcher
		.send_message(alice.id, Room::Group(group.id), "standup in 5", None, None)
		.await
		.unwrap();
	assert_eq!(msg.room, Room::Group(group.id));
}

#[tokio::test]
async fn rejected_messages_are_never_persisted() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;
	let bob = new_user(&h.store, "bob").await;

	let err = h
		.dispatcher
		.send_message(alice.id, Room::User(bob.id), "zonk", None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, DispatchError::Profane));

	let err = h
		.dispatcher
		.send_message(alice.id, Room::User(bob.id), "   ", None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, DispatchError::ValidationFailed(_)));

	assert!(h.dispatcher.direct_history(alice.id, bob.id, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn send_to_unknown_recipient_is_not_found() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;

	let err = h
		.dispatcher
		.send_message(alice.id, Room::User(UserId::new_v4()), "anyone there?", None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, DispatchError::NotFound("recipient")));
}

#[tokio::test]
async fn only_the_sender_may_edit_and_deleted_is_immutable() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;
	let bob = new_user(&h.store, "bob").await;

	let msg = h
		.dispatcher
		.send_message(alice.id, Room::User(bob.id), "draft", None, None)
		.await
		.unwrap();

	let err = h.dispatcher.edit_message(bob.id, msg.id, "hijacked").await.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));

	let edited = h.dispatcher.edit_message(alice.id, msg.id, "final").await.unwrap();
	assert!(edited.edited);
	assert_eq!(edited.content, "final");

	h.dispatcher.delete_message(alice.id, msg.id).await.unwrap();
	let err = h.dispatcher.edit_message(alice.id, msg.id, "too late").await.unwrap_err();
	assert!(matches!(err, DispatchError::ValidationFailed(_)));
}

#[tokio::test]
async fn delete_is_sender_only_and_idempotent() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;
	let bob = new_user(&h.store, "bob").await;

	let msg = h
		.dispatcher
		.send_message(alice.id, Room::User(bob.id), "oops", None, None)
		.await
		.unwrap();

	let err = h.dispatcher.delete_message(bob.id, msg.id).await.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));

	let deleted = h.dispatcher.delete_message(alice.id, msg.id).await.unwrap();
	assert!(deleted.deleted);

	// Repeating the delete succeeds without another fan-out.
	let mut alice_rx = h.hub.subscribe_room(Room::User(alice.id)).await;
	let again = h.dispatcher.delete_message(alice.id, msg.id).await.unwrap();
	assert!(again.deleted);
	assert!(alice_rx.try_recv().is_err());

	// The record survives as a tombstone in history.
	let history = h.dispatcher.direct_history(alice.id, bob.id, None).await.unwrap();
	assert_eq!(history.len(), 1);
	assert!(history[0].deleted);
}

#[tokio::test]
async fn mark_read_notifies_the_sender() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;
	let bob = new_user(&h.store, "bob").await;
	let carol = new_user(&h.store, "carol").await;

	let msg = h
		.dispatcher
		.send_message(alice.id, Room::User(bob.id), "read me", None, None)
		.await
		.unwrap();

	let err = h.dispatcher.mark_read(carol.id, msg.id).await.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));

	let err = h.dispatcher.mark_read(alice.id, msg.id).await.unwrap_err();
	assert!(matches!(err, DispatchError::ValidationFailed(_)));

	let mut alice_rx = h.hub.subscribe_room(Room::User(alice.id)).await;
	let read = h.dispatcher.mark_read(bob.id, msg.id).await.unwrap();
	assert!(read.read);
	assert_eq!(recv_event(&mut alice_rx), ServerEvent::MessageRead {
		message_id: msg.id,
		by: bob.id
	});
}

#[tokio::test]
async fn reactions_fan_out_to_the_conversation() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;
	let bob = new_user(&h.store, "bob").await;
	let carol = new_user(&h.store, "carol").await;

	let msg = h
		.dispatcher
		.send_message(alice.id, Room::User(bob.id), "react to this", None, None)
		.await
		.unwrap();

	let err = h.dispatcher.add_reaction(carol.id, msg.id, "👍").await.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));

	let mut alice_rx = h.hub.subscribe_room(Room::User(alice.id)).await;
	let reacted = h.dispatcher.add_reaction(bob.id, msg.id, "👍").await.unwrap();
	assert!(reacted.reactions["👍"].contains(&bob.id));
	assert_eq!(recv_event(&mut alice_rx), ServerEvent::MessageReaction {
		message_id: msg.id,
		emoji: "👍".to_string(),
		by: bob.id,
		added: true
	});

	// Repeating the reaction changes nothing and fans out nothing.
	h.dispatcher.add_reaction(bob.id, msg.id, "👍").await.unwrap();
	assert!(alice_rx.try_recv().is_err());

	let cleared = h.dispatcher.remove_reaction(bob.id, msg.id, "👍").await.unwrap();
	assert!(cleared.reactions.is_empty());
	assert_eq!(recv_event(&mut alice_rx), ServerEvent::MessageReaction {
		message_id: msg.id,
		emoji: "👍".to_string(),
		by: bob.id,
		added: false
	});

	// Withdrawing a reaction that was never recorded is a no-op.
	h.dispatcher.remove_reaction(bob.id, msg.id, "👍").await.unwrap();
	assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn pinning_requires_admin_and_a_group_room() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;
	let bob = new_user(&h.store, "bob").await;
	let group = Group::new("team", alice.id, [bob.id]);
	h.store.put_group(&group).await.unwrap();

	let msg = h
		.dispatcher
		.send_message(bob.id, Room::Group(group.id), "pin me", None, None)
		.await
		.unwrap();

	let err = h.dispatcher.pin_message(bob.id, msg.id).await.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));

	let direct = h
		.dispatcher
		.send_message(alice.id, Room::User(bob.id), "not pinnable", None, None)
		.await
		.unwrap();
	let err = h.dispatcher.pin_message(alice.id, direct.id).await.unwrap_err();
	assert!(matches!(err, DispatchError::ValidationFailed(_)));

	let mut group_rx = h.hub.subscribe_room(Room::Group(group.id)).await;
	h.dispatcher.pin_message(alice.id, msg.id).await.unwrap();
	assert_eq!(recv_event(&mut group_rx), ServerEvent::MessagePin {
		message_id: msg.id,
		by: alice.id
	});
	let stored = h.store.get_group(group.id).await.unwrap().unwrap();
	assert_eq!(stored.pinned, vec![msg.id]);

	// Pinning twice records one entry and fans out once.
	h.dispatcher.pin_message(alice.id, msg.id).await.unwrap();
	assert!(group_rx.try_recv().is_err());

	h.dispatcher.unpin_message(alice.id, msg.id).await.unwrap();
	assert_eq!(recv_event(&mut group_rx), ServerEvent::MessageUnpin {
		message_id: msg.id,
		by: alice.id
	});
	let stored = h.store.get_group(group.id).await.unwrap().unwrap();
	assert!(stored.pinned.is_empty());
}

#[tokio::test]
async fn muted_members_cannot_send_to_the_group() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;
	let bob = new_user(&h.store, "bob").await;
	let mut group = Group::new("team", alice.id, [bob.id]);
	group.muted.insert(bob.id);
	h.store.put_group(&group).await.unwrap();

	let err = h
		.dispatcher
		.send_message(bob.id, Room::Group(group.id), "hear me out", None, None)
		.await
		.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));

	h.dispatcher
		.send_message(alice.id, Room::Group(group.id), "carry on", None, None)
		.await
		.unwrap();
}

#[tokio::test]
async fn direct_history_honors_blocks() {
	let h = harness();
	let mut alice = new_user(&h.store, "alice").await;
	let mut bob = new_user(&h.store, "bob").await;

	h.dispatcher
		.send_message(alice.id, Room::User(bob.id), "one", None, None)
		.await
		.unwrap();
	h.dispatcher
		.send_message(bob.id, Room::User(alice.id), "two", None, None)
		.await
		.unwrap();

	// A requester who blocked the counterpart gets nothing back.
	alice.blocked.insert(bob.id);
	h.store.put_user(&alice).await.unwrap();
	let err = h.dispatcher.direct_history(alice.id, bob.id, None).await.unwrap_err();
	assert!(matches!(err, DispatchError::Blocked));

	alice.blocked.clear();
	h.store.put_user(&alice).await.unwrap();

	// A counterpart who blocked the requester stays hidden from the result.
	bob.blocked.insert(alice.id);
	h.store.put_user(&bob).await.unwrap();
	let history = h.dispatcher.direct_history(alice.id, bob.id, None).await.unwrap();
	assert_eq!(
		history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
		vec!["one"]
	);
}

#[tokio::test]
async fn group_history_is_members_only() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;
	let mallory = new_user(&h.store, "mallory").await;
	let group = Group::new("team", alice.id, []);
	h.store.put_group(&group).await.unwrap();

	h.dispatcher
		.send_message(alice.id, Room::Group(group.id), "minutes", None, None)
		.await
		.unwrap();

	let err = h.dispatcher.group_history(mallory.id, group.id, None).await.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));

	let history = h.dispatcher.group_history(alice.id, group.id, None).await.unwrap();
	assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn announcements_require_admin_role() {
	let h = harness();
	let alice = new_user(&h.store, "alice").await;
	let bob = new_user(&h.store, "bob").await;
	let mut root = User::new("root");
	root.is_admin = true;
	h.store.put_user(&root).await.unwrap();

	let group = Group::new("team", alice.id, [bob.id, root.id]);
	h.store.put_group(&group).await.unwrap();

	let err = h
		.dispatcher
		.post_announcement(bob.id, group.id, "listen up")
		.await
		.unwrap_err();
	assert!(matches!(err, DispatchError::Unauthorized(_)));

	let mut group_rx = h.hub.subscribe_room(Room::Group(group.id)).await;

	// Group creator holds the admin role.
	let msg = h
		.dispatcher
		.post_announcement(alice.id, group.id, "release friday")
		.await
		.unwrap();
	assert_eq!(recv_event(&mut group_rx), ServerEvent::MessageReceive(msg.clone()));

	// A server-wide admin may announce regardless of group role.
	h.dispatcher
		.post_announcement(root.id, group.id, "maintenance window")
		.await
		.unwrap();

	let stored = h.store.get_group(group.id).await.unwrap().unwrap();
	assert_eq!(stored.announcements.len(), 2);
	assert_eq!(stored.announcements[0], msg.id);
}
