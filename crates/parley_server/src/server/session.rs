#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_domain::{Room, UserId};
use parley_protocol::framing::DEFAULT_MAX_FRAME_SIZE;
use parley_protocol::{ClientEvent, ClientFrame, ErrorCode, ServerEvent, ServerFrame, encode_frame};
use parley_util::SecretString;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::server::auth::verify_hmac_token;
use crate::server::dispatch::Dispatcher;
use crate::server::presence::PresenceRegistry;
use crate::server::room_hub::HubItem;
use crate::server::state::SessionRegistry;
use crate::util::time::unix_ms_now;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub max_frame_bytes: u32,

	pub fan_in_channel_capacity: usize,

	/// How long an accepted connection may sit unauthenticated.
	pub handshake_timeout: Duration,

	pub auth_hmac_secret: Option<SecretString>,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			fan_in_channel_capacity: 1024,
			handshake_timeout: Duration::from_secs(5),
			auth_hmac_secret: None,
		}
	}
}

pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	registry: Arc<RwLock<SessionRegistry>>,
	presence: PresenceRegistry,
	dispatcher: Dispatcher,
	settings: SessionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parley_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let max_frame = settings.max_frame_bytes as usize;
	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<ClientFrame>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("stream read failed")),
			};

			metrics::counter!("parley_server_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match parley_protocol::decode_frame::<ClientFrame>(&buf, max_frame) {
					Ok((frame, used)) => {
						buf.drain(0..used);
						metrics::counter!("parley_server_frames_in_total").increment(1);

						if ctrl_tx.send(frame).is_err() {
							return Ok(());
						}
					}
					Err(parley_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("parley_server_frame_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode client frame"));
					}
				}
			}
		}
	});

	// Handshake: the first hello within the timeout wins, everything else
	// before it is discarded.
	let token = match tokio::time::timeout(settings.handshake_timeout, wait_for_hello(&mut ctrl_rx)).await {
		Ok(Some(token)) => token,
		Ok(None) => {
			debug!(conn_id, "connection closed before hello");
			reader_task.abort();
			return Ok(());
		}
		Err(_) => {
			warn!(conn_id, "handshake timeout");
			let _ = send_event(&mut send, max_frame, ServerEvent::Error {
				code: ErrorCode::Unauthenticated,
				message: "handshake timeout".to_string(),
			})
			.await;
			reader_task.abort();
			return Ok(());
		}
	};

	let user_id = match authenticate(&token, settings.auth_hmac_secret.as_ref(), &dispatcher).await {
		Ok(user_id) => user_id,
		Err(e) => {
			warn!(conn_id, error = %e, "authentication failed");
			metrics::counter!("parley_server_auth_failures_total").increment(1);
			let _ = send_event(&mut send, max_frame, ServerEvent::Error {
				code: ErrorCode::Unauthenticated,
				message: "invalid auth token".to_string(),
			})
			.await;
			reader_task.abort();
			return Ok(());
		}
	};

	info!(conn_id, user = %user_id, "session authenticated");
	metrics::counter!("parley_server_sessions_total").increment(1);

	send_event(&mut send, max_frame, ServerEvent::Welcome {
		user_id,
		server_time_unix_ms: unix_ms_now(),
		max_frame_bytes: settings.max_frame_bytes,
	})
	.await
	.context("send welcome")?;

	// One subscription per room: the identity room plus each group room.
	let mut rooms: HashSet<Room> = HashSet::new();
	rooms.insert(Room::User(user_id));
	match dispatcher.store().groups_for_user(user_id).await {
		Ok(groups) => {
			for group in groups {
				rooms.insert(Room::Group(group));
			}
		}
		Err(e) => warn!(conn_id, error = %e, "failed to load group memberships"),
	}

	let (fan_in_tx, mut fan_in_rx) = mpsc::channel::<HubItem>(settings.fan_in_channel_capacity);
	let mut room_tasks = Vec::with_capacity(rooms.len());
	for room in rooms.iter().copied() {
		let mut rx = dispatcher.hub().subscribe_room(room).await;
		let tx = fan_in_tx.clone();
		room_tasks.push(tokio::spawn(async move {
			while let Some(item) = rx.recv().await {
				if tx.send(item).await.is_err() {
					break;
				}
			}
		}));
	}
	drop(fan_in_tx);

	{
		let mut reg = registry.write().await;
		reg.register(conn_id, user_id, rooms);
		debug!(conn_id, active = reg.active_count(), "session registered");
	}

	if presence.connected(user_id).await {
		dispatcher
			.hub()
			.broadcast_users(ServerEvent::UserOnline { user_id }, Some(user_id))
			.await;
	}

	let result = session_loop(
		conn_id,
		user_id,
		&mut send,
		max_frame,
		&mut ctrl_rx,
		&mut fan_in_rx,
		&dispatcher,
	)
	.await;

	for task in room_tasks {
		task.abort();
	}
	reader_task.abort();

	if let Some(info) = registry.write().await.remove_conn(conn_id) {
		debug!(conn_id, rooms = info.rooms.len(), "session deregistered");
	}
	if presence.disconnected(user_id).await {
		dispatcher
			.hub()
			.broadcast_users(ServerEvent::UserOffline { user_id }, Some(user_id))
			.await;
	}

	info!(conn_id, user = %user_id, "session closed");
	result
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<ClientFrame>) -> Option<String> {
	while let Some(frame) = ctrl_rx.recv().await {
		match frame.event {
			ClientEvent::Hello { token } => return Some(token),
			other => {
				debug!(event = ?other, "discarding pre-hello frame");
			}
		}
	}
	None
}

/// Resolve a bearer token to a live user record. Every failure collapses to
/// one opaque rejection.
async fn authenticate(
	token: &str,
	secret: Option<&SecretString>,
	dispatcher: &Dispatcher,
) -> anyhow::Result<UserId> {
	let secret = secret.ok_or_else(|| anyhow!("no auth secret configured"))?;
	let claims = verify_hmac_token(token.trim(), secret.expose())?;
	let user_id = claims.user_id()?;

	let user = dispatcher
		.store()
		.get_user(user_id)
		.await?
		.ok_or_else(|| anyhow!("unknown user: {user_id}"))?;
	Ok(user.id)
}

async fn session_loop(
	conn_id: u64,
	user_id: UserId,
	send: &mut quinn::SendStream,
	max_frame: usize,
	ctrl_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
	fan_in_rx: &mut mpsc::Receiver<HubItem>,
	dispatcher: &Dispatcher,
) -> anyhow::Result<()> {
	loop {
		tokio::select! {
			item = fan_in_rx.recv() => {
				let Some(item) = item else {
					return Ok(());
				};
				match item {
					HubItem::Frame(frame) => {
						let bytes = encode_frame(frame.as_ref(), max_frame).context("encode outbound frame")?;
						metrics::counter!("parley_server_frames_out_total").increment(1);
						send.write_all(&bytes).await.context("stream write failed")?;
					}
					HubItem::Lagged { dropped } => {
						warn!(conn_id, user = %user_id, dropped, "subscriber lagged, frames dropped");
						metrics::counter!("parley_server_frames_dropped_total").increment(dropped);
					}
				}
			}
			frame = ctrl_rx.recv() => {
				let Some(frame) = frame else {
					return Ok(());
				};
				if let Some(reply) = handle_client_event(conn_id, user_id, frame.event, dispatcher).await {
					let bytes = encode_frame(&ServerFrame::new(reply), max_frame).context("encode error frame")?;
					send.write_all(&bytes).await.context("stream write failed")?;
				}
			}
		}
	}
}

/// Apply one client event. Rejections come back as an `error` event for the
/// issuing connection only; accepted operations answer through room fan-out.
async fn handle_client_event(
	conn_id: u64,
	user_id: UserId,
	event: ClientEvent,
	dispatcher: &Dispatcher,
) -> Option<ServerEvent> {
	let addressing_error = || {
		Some(ServerEvent::Error {
			code: ErrorCode::ValidationFailed,
			message: "exactly one of recipient or group required".to_string(),
		})
	};

	match event {
		ClientEvent::Hello { .. } => {
			debug!(conn_id, "ignoring repeated hello");
			None
		}

		ClientEvent::MessageSend {
			to,
			content,
			attachment,
			parent,
		} => {
			let Some(room) = to.room() else {
				return addressing_error();
			};
			match dispatcher.send_message(user_id, room, &content, attachment, parent).await {
				Ok(_) => None,
				Err(e) => Some(reject(conn_id, e)),
			}
		}

		ClientEvent::MessageEdit { message_id, content, .. } => {
			match dispatcher.edit_message(user_id, message_id, &content).await {
				Ok(_) => None,
				Err(e) => Some(reject(conn_id, e)),
			}
		}

		ClientEvent::MessageDelete { message_id, .. } => {
			match dispatcher.delete_message(user_id, message_id).await {
				Ok(_) => None,
				Err(e) => Some(reject(conn_id, e)),
			}
		}

		// Read receipts on the socket path are relays; durable read state
		// goes through the request API.
		ClientEvent::MessageRead { message_id, to } => {
			let Some(room) = to.room() else {
				return addressing_error();
			};
			dispatcher
				.hub()
				.publish(room, ServerEvent::MessageRead {
					message_id,
					by: user_id,
				})
				.await;
			None
		}

		ClientEvent::Typing { to } => {
			let Some(room) = to.room() else {
				return addressing_error();
			};
			dispatcher.hub().publish(room, ServerEvent::Typing { from: user_id }).await;
			None
		}

		ClientEvent::CallInitiate { recipient, signal_data } => {
			dispatcher
				.hub()
				.publish(Room::User(recipient), ServerEvent::CallIncoming {
					from: user_id,
					signal_data,
				})
				.await;
			None
		}

		ClientEvent::CallSignal { recipient, signal_data } => {
			dispatcher
				.hub()
				.publish(Room::User(recipient), ServerEvent::CallSignal {
					from: user_id,
					signal_data,
				})
				.await;
			None
		}

		ClientEvent::CallEnd { recipient } => {
			dispatcher
				.hub()
				.publish(Room::User(recipient), ServerEvent::CallEnd { from: user_id })
				.await;
			None
		}
	}
}

fn reject(conn_id: u64, err: crate::server::dispatch::DispatchError) -> ServerEvent {
	debug!(conn_id, error = %err, "client event rejected");
	metrics::counter!("parley_server_events_rejected_total").increment(1);
	ServerEvent::Error {
		code: err.code(),
		message: err.to_string(),
	}
}

async fn send_event(send: &mut quinn::SendStream, max_frame: usize, event: ServerEvent) -> anyhow::Result<()> {
	let bytes = encode_frame(&ServerFrame::new(event), max_frame).context("encode frame")?;
	send.write_all(&bytes).await.context("stream write failed")?;
	Ok(())
}
