#![forbid(unsafe_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parley_domain::{GroupId, MessageId, Room, UserId};
use parley_protocol::{Address, ErrorCode};
use parley_util::SecretString;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::auth::verify_hmac_token;
use crate::server::dispatch::{DispatchError, Dispatcher};

/// Shared context for the request/response API.
#[derive(Clone)]
pub struct ApiContext {
	pub dispatcher: Dispatcher,
	pub auth_hmac_secret: Option<SecretString>,
}

pub fn spawn_api_server(bind: SocketAddr, ctx: ApiContext) {
	tokio::spawn(async move {
		if let Err(err) = run_api_server(bind, ctx).await {
			warn!(error = %err, "api server stopped");
		}
	});
}

async fn run_api_server(bind: SocketAddr, ctx: ApiContext) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let ctx = ctx.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, ctx.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "api connection error");
			}
		});
	}
}

#[derive(Debug, Deserialize)]
struct SendBody {
	#[serde(flatten)]
	to: Address,
	content: String,
	#[serde(default)]
	attachment: Option<String>,
	#[serde(default)]
	parent: Option<MessageId>,
}

#[derive(Debug, Deserialize)]
struct ContentBody {
	content: String,
}

#[derive(Debug, Deserialize)]
struct EmojiBody {
	emoji: String,
}

async fn handle_request(req: Request<Incoming>, ctx: ApiContext) -> Result<Response<Full<Bytes>>, hyper::Error> {
	metrics::counter!("parley_server_api_requests_total").increment(1);

	let user = match bearer_user(&req, ctx.auth_hmac_secret.as_ref()) {
		Ok(user) => user,
		Err(resp) => return Ok(resp),
	};

	let method = req.method().clone();
	let path = req.uri().path().trim_matches('/').to_string();
	let segments: Vec<&str> = path.split('/').collect();
	let query = req.uri().query().map(str::to_string);

	match segments.as_slice() {
		["api", "messages"] if method == Method::POST => {
			let body: SendBody = match read_json(req).await? {
				Ok(body) => body,
				Err(resp) => return Ok(resp),
			};
			let Some(room) = body.to.room() else {
				return Ok(error_response(
					StatusCode::BAD_REQUEST,
					ErrorCode::ValidationFailed,
					"exactly one of recipient or group required",
				));
			};

			let result = ctx
				.dispatcher
				.send_message(user, room, &body.content, body.attachment, body.parent)
				.await;
			Ok(dispatch_response(result))
		}

		["api", "messages", id, "edit"] if method == Method::POST => {
			let Some(message_id) = parse_id::<MessageId>(id) else {
				return Ok(bad_id());
			};
			let body: ContentBody = match read_json(req).await? {
				Ok(body) => body,
				Err(resp) => return Ok(resp),
			};
			Ok(dispatch_response(
				ctx.dispatcher.edit_message(user, message_id, &body.content).await,
			))
		}

		["api", "messages", id, "delete"] if method == Method::POST => {
			let Some(message_id) = parse_id::<MessageId>(id) else {
				return Ok(bad_id());
			};
			Ok(dispatch_response(ctx.dispatcher.delete_message(user, message_id).await))
		}

		["api", "messages", id, "read"] if method == Method::POST => {
			let Some(message_id) = parse_id::<MessageId>(id) else {
				return Ok(bad_id());
			};
			Ok(dispatch_response(ctx.dispatcher.mark_read(user, message_id).await))
		}

		["api", "messages", id, "react"] if method == Method::POST => {
			let Some(message_id) = parse_id::<MessageId>(id) else {
				return Ok(bad_id());
			};
			let body: EmojiBody = match read_json(req).await? {
				Ok(body) => body,
				Err(resp) => return Ok(resp),
			};
			Ok(dispatch_response(
				ctx.dispatcher.add_reaction(user, message_id, &body.emoji).await,
			))
		}

		["api", "messages", id, "unreact"] if method == Method::POST => {
			let Some(message_id) = parse_id::<MessageId>(id) else {
				return Ok(bad_id());
			};
			let body: EmojiBody = match read_json(req).await? {
				Ok(body) => body,
				Err(resp) => return Ok(resp),
			};
			Ok(dispatch_response(
				ctx.dispatcher.remove_reaction(user, message_id, &body.emoji).await,
			))
		}

		["api", "messages", id, "pin"] if method == Method::POST => {
			let Some(message_id) = parse_id::<MessageId>(id) else {
				return Ok(bad_id());
			};
			Ok(dispatch_response(ctx.dispatcher.pin_message(user, message_id).await))
		}

		["api", "messages", id, "unpin"] if method == Method::POST => {
			let Some(message_id) = parse_id::<MessageId>(id) else {
				return Ok(bad_id());
			};
			Ok(dispatch_response(ctx.dispatcher.unpin_message(user, message_id).await))
		}

		["api", "history"] if method == Method::GET => {
			let params = QueryParams::parse(query.as_deref());
			let limit = params.limit;

			let result = match (params.user, params.group) {
				(Some(other), None) => ctx.dispatcher.direct_history(user, other, limit).await,
				(None, Some(group)) => ctx.dispatcher.group_history(user, group, limit).await,
				_ => {
					return Ok(error_response(
						StatusCode::BAD_REQUEST,
						ErrorCode::ValidationFailed,
						"exactly one of user or group required",
					));
				}
			};
			Ok(dispatch_response(result))
		}

		["api", "groups", id, "announcements"] if method == Method::POST => {
			let Some(group_id) = parse_id::<GroupId>(id) else {
				return Ok(bad_id());
			};
			let body: ContentBody = match read_json(req).await? {
				Ok(body) => body,
				Err(resp) => return Ok(resp),
			};
			Ok(dispatch_response(
				ctx.dispatcher.post_announcement(user, group_id, &body.content).await,
			))
		}

		_ => Ok(error_response(StatusCode::NOT_FOUND, ErrorCode::NotFound, "no such route")),
	}
}

#[derive(Debug, Default)]
struct QueryParams {
	user: Option<UserId>,
	group: Option<GroupId>,
	limit: Option<u32>,
}

impl QueryParams {
	fn parse(query: Option<&str>) -> Self {
		let mut out = Self::default();
		let Some(query) = query else {
			return out;
		};

		for pair in query.split('&') {
			let Some((key, value)) = pair.split_once('=') else {
				continue;
			};
			match key {
				"user" => out.user = value.parse().ok(),
				"group" => out.group = value.parse().ok(),
				"limit" => out.limit = value.parse().ok(),
				_ => {}
			}
		}
		out
	}
}

fn parse_id<T: std::str::FromStr>(raw: &str) -> Option<T> {
	raw.parse().ok()
}

fn bad_id() -> Response<Full<Bytes>> {
	error_response(StatusCode::BAD_REQUEST, ErrorCode::ValidationFailed, "invalid id")
}

fn bearer_user(req: &Request<Incoming>, secret: Option<&SecretString>) -> Result<UserId, Response<Full<Bytes>>> {
	let unauthenticated =
		|| error_response(StatusCode::UNAUTHORIZED, ErrorCode::Unauthenticated, "invalid auth token");

	let Some(secret) = secret else {
		return Err(unauthenticated());
	};

	let token = req
		.headers()
		.get(hyper::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.map(str::trim)
		.unwrap_or_default();

	if token.is_empty() {
		return Err(unauthenticated());
	}

	let claims = verify_hmac_token(token, secret.expose()).map_err(|_| unauthenticated())?;
	claims.user_id().map_err(|_| unauthenticated())
}

async fn read_json<T: for<'de> Deserialize<'de>>(
	req: Request<Incoming>,
) -> Result<Result<T, Response<Full<Bytes>>>, hyper::Error> {
	let bytes = req.into_body().collect().await?.to_bytes();
	match serde_json::from_slice(&bytes) {
		Ok(body) => Ok(Ok(body)),
		Err(e) => Ok(Err(error_response(
			StatusCode::BAD_REQUEST,
			ErrorCode::ValidationFailed,
			&format!("invalid request body: {e}"),
		))),
	}
}

fn dispatch_response<T: serde::Serialize>(result: Result<T, DispatchError>) -> Response<Full<Bytes>> {
	match result {
		Ok(value) => json_response(StatusCode::OK, &value),
		Err(err) => {
			metrics::counter!("parley_server_api_rejections_total").increment(1);
			error_response(status_for(&err), err.code(), &err.to_string())
		}
	}
}

fn status_for(err: &DispatchError) -> StatusCode {
	match err {
		DispatchError::Unauthenticated => StatusCode::UNAUTHORIZED,
		DispatchError::Unauthorized(_) | DispatchError::Blocked => StatusCode::FORBIDDEN,
		DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
		DispatchError::Throttled => StatusCode::TOO_MANY_REQUESTS,
		DispatchError::Profane | DispatchError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
		DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
	}
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
	let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
	Response::builder()
		.status(status)
		.header(hyper::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body)))
		.unwrap()
}

fn error_response(status: StatusCode, code: ErrorCode, message: &str) -> Response<Full<Bytes>> {
	let body = serde_json::json!({ "error": code, "message": message });
	json_response(status, &body)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn query_params_parse_ids_and_limit() {
		let user = UserId::new_v4();
		let q = format!("user={user}&limit=25");
		let params = QueryParams::parse(Some(&q));
		assert_eq!(params.user, Some(user));
		assert_eq!(params.group, None);
		assert_eq!(params.limit, Some(25));

		let params = QueryParams::parse(Some("group=not-a-uuid&limit=x"));
		assert_eq!(params.group, None);
		assert_eq!(params.limit, None);

		let params = QueryParams::parse(None);
		assert!(params.user.is_none() && params.group.is_none());
	}

	#[test]
	fn rejection_status_mapping() {
		assert_eq!(status_for(&DispatchError::Unauthenticated), StatusCode::UNAUTHORIZED);
		assert_eq!(status_for(&DispatchError::Unauthorized("x")), StatusCode::FORBIDDEN);
		assert_eq!(status_for(&DispatchError::Blocked), StatusCode::FORBIDDEN);
		assert_eq!(status_for(&DispatchError::NotFound("x")), StatusCode::NOT_FOUND);
		assert_eq!(status_for(&DispatchError::Throttled), StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(status_for(&DispatchError::Profane), StatusCode::BAD_REQUEST);
		assert_eq!(status_for(&DispatchError::ValidationFailed("x")), StatusCode::BAD_REQUEST);
	}
}
