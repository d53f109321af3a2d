#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::UserId;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Claims carried by a `v1.<payload>.<sig>` access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

impl AuthClaims {
	pub fn user_id(&self) -> anyhow::Result<UserId> {
		self.sub.parse().map_err(|e| anyhow!("invalid subject: {e}"))
	}
}

/// Verify a stateless HMAC token and return its claims.
///
/// Any malformed, mis-signed, or expired token is an error; callers collapse
/// all failures into a single unauthenticated rejection.
pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a token for the given subject. Used by provisioning tooling and tests.
#[allow(dead_code)]
pub fn issue_hmac_token(user: UserId, exp: u64, secret: &str) -> anyhow::Result<String> {
	let claims = AuthClaims {
		sub: user.to_string(),
		exp,
	};
	let payload = serde_json::to_vec(&claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn far_future() -> u64 {
		SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 3600
	}

	#[test]
	fn issued_token_verifies_and_yields_subject() {
		let user = UserId::new_v4();
		let token = issue_hmac_token(user, far_future(), "s3cret").unwrap();

		let claims = verify_hmac_token(&token, "s3cret").unwrap();
		assert_eq!(claims.user_id().unwrap(), user);
	}

	#[test]
	fn wrong_secret_is_rejected() {
		let token = issue_hmac_token(UserId::new_v4(), far_future(), "s3cret").unwrap();
		assert!(verify_hmac_token(&token, "other").is_err());
	}

	#[test]
	fn expired_token_is_rejected() {
		let token = issue_hmac_token(UserId::new_v4(), 1, "s3cret").unwrap();
		assert!(verify_hmac_token(&token, "s3cret").is_err());
	}

	#[test]
	fn malformed_tokens_are_rejected() {
		assert!(verify_hmac_token("", "s3cret").is_err());
		assert!(verify_hmac_token("v1.onlytwo", "s3cret").is_err());
		assert!(verify_hmac_token("v2.a.b", "s3cret").is_err());
		assert!(verify_hmac_token("v1.!!!.???", "s3cret").is_err());
	}
}
