#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::SecretString;

/// Tokens closer than this to expiry are refreshed before use.
pub(crate) const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct TokenValidation {
	pub client_id: String,
	pub login: String,
	pub user_id: String,
	pub expires_in: u64,
	#[serde(default)]
	pub scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenRefreshResponse {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	expires_in: u64,
}

#[derive(Debug)]
struct Credentials {
	access_token: Option<SecretString>,
	refresh_token: SecretString,
	expires_at: Option<Instant>,
}

impl Credentials {
	fn usable(&self, margin: Duration) -> Option<&SecretString> {
		let token = self.access_token.as_ref()?;
		let expires_at = self.expires_at?;
		(expires_at.saturating_duration_since(Instant::now()) > margin).then_some(token)
	}
}

/// Owns the bot's OAuth access token and keeps it fresh.
///
/// Only the long-lived refresh token is supplied up front; the first call to
/// [`TokenManager::get_valid_token`] performs a refresh. All callers share one
/// lock, so concurrent requests for an expired token trigger a single refresh.
#[derive(Debug)]
pub struct TokenManager {
	http: reqwest::Client,
	oauth_base_url: Url,
	client_id: String,
	client_secret: SecretString,
	margin: Duration,
	state: Mutex<Credentials>,
}

impl TokenManager {
	pub fn new(
		oauth_base_url: Url,
		client_id: impl Into<String>,
		client_secret: SecretString,
		refresh_token: SecretString,
		request_timeout: Duration,
	) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("mobibot/0.x (oauth)")
			.timeout(request_timeout)
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			oauth_base_url,
			client_id: client_id.into(),
			client_secret,
			margin: DEFAULT_REFRESH_MARGIN,
			state: Mutex::new(Credentials {
				access_token: None,
				refresh_token,
				expires_at: None,
			}),
		})
	}

	pub fn with_margin(mut self, margin: Duration) -> Self {
		self.margin = margin;
		self
	}

	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	fn endpoint(&self, name: &str) -> anyhow::Result<Url> {
		let base = self.oauth_base_url.as_str().trim_end_matches('/');
		Url::parse(&format!("{base}/{name}")).with_context(|| format!("build oauth {name} url"))
	}

	/// Return a token that stays valid for longer than the refresh margin.
	pub async fn get_valid_token(&self) -> anyhow::Result<SecretString> {
		let mut creds = self.state.lock().await;
		if let Some(token) = creds.usable(self.margin) {
			return Ok(token.clone());
		}

		debug!("access token missing or near expiry; refreshing");
		self.refresh_locked(&mut creds).await
	}

	/// Force a refresh regardless of the cached expiry.
	pub async fn refresh(&self) -> anyhow::Result<SecretString> {
		let mut creds = self.state.lock().await;
		self.refresh_locked(&mut creds).await
	}

	/// Drop the cached access token so the next caller refreshes.
	pub async fn invalidate(&self) {
		let mut creds = self.state.lock().await;
		if creds.access_token.is_some() {
			info!("access token invalidated");
		}
		creds.expires_at = None;
	}

	async fn refresh_locked(&self, creds: &mut Credentials) -> anyhow::Result<SecretString> {
		metrics::counter!("mobibot_eventsub_token_refresh_total").increment(1);

		let url = self.endpoint("token")?;
		let resp = self
			.http
			.post(url)
			.form(&[
				("grant_type", "refresh_token"),
				("client_id", self.client_id.as_str()),
				("client_secret", self.client_secret.expose()),
				("refresh_token", creds.refresh_token.expose()),
			])
			.send()
			.await
			.context("twitch refresh token request")?;

		let status = resp.status();
		let body = resp.text().await.context("twitch refresh token read body")?;

		if !status.is_success() {
			metrics::counter!("mobibot_eventsub_token_refresh_failed_total").increment(1);
			anyhow::bail!("twitch refresh token failed: status={status} body={body}");
		}

		let parsed: TokenRefreshResponse = serde_json::from_str(&body).context("twitch refresh token parse json")?;

		let access = SecretString::new(parsed.access_token);
		creds.access_token = Some(access.clone());
		if let Some(rotated) = parsed.refresh_token.filter(|t| !t.trim().is_empty()) {
			creds.refresh_token = SecretString::new(rotated);
		}
		creds.expires_at = Some(Instant::now() + Duration::from_secs(parsed.expires_in));

		info!(expires_in = parsed.expires_in, "access token refreshed");
		Ok(access)
	}

	/// Check the current token against the identity provider.
	///
	/// Failures are logged and reported as `Ok(None)`; a token that fails
	/// validation is still usable until the control API rejects it.
	pub async fn validate(&self) -> anyhow::Result<Option<TokenValidation>> {
		let token = self.get_valid_token().await?;
		let url = self.endpoint("validate")?;

		let resp = match self
			.http
			.get(url)
			.header("Authorization", format!("OAuth {}", token.expose()))
			.send()
			.await
		{
			Ok(resp) => resp,
			Err(e) => {
				warn!(error = ?e, "twitch validate token request failed");
				return Ok(None);
			}
		};

		let status = resp.status();
		let body = resp.text().await.unwrap_or_default();
		if !status.is_success() {
			warn!(%status, %body, "twitch validate token failed");
			return Ok(None);
		}

		match serde_json::from_str::<TokenValidation>(&body) {
			Ok(v) => {
				debug!(login = %v.login, user_id = %v.user_id, expires_in = v.expires_in, "token validated");
				Ok(Some(v))
			}
			Err(e) => {
				warn!(error = ?e, "twitch validate token parse json");
				Ok(None)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use serde_json::json;
	use wiremock::matchers::{body_string_contains, header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	fn manager(server: &MockServer) -> TokenManager {
		TokenManager::new(
			Url::parse(&server.uri()).expect("mock url"),
			"cid",
			SecretString::new("secret"),
			SecretString::new("refresh-1"),
			Duration::from_secs(5),
		)
		.expect("token manager")
	}

	#[tokio::test]
	async fn concurrent_callers_share_one_refresh() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.and(body_string_contains("grant_type=refresh_token"))
			.and(body_string_contains("refresh_token=refresh-1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"access_token": "access-1",
				"refresh_token": "refresh-2",
				"expires_in": 3600,
				"scope": ["user:read:chat"],
				"token_type": "bearer"
			})))
			.expect(1)
			.mount(&server)
			.await;

		let tokens = Arc::new(manager(&server));
		let (a, b) = tokio::join!(tokens.get_valid_token(), tokens.get_valid_token());
		assert_eq!(a.expect("first token").expose(), "access-1");
		assert_eq!(b.expect("second token").expose(), "access-1");
	}

	#[tokio::test]
	async fn token_inside_margin_is_refreshed() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"access_token": "short-lived",
				"expires_in": 3
			})))
			.expect(2)
			.mount(&server)
			.await;

		let tokens = manager(&server);
		tokens.get_valid_token().await.expect("first refresh");
		tokens.get_valid_token().await.expect("second refresh");
	}

	#[tokio::test]
	async fn failed_refresh_keeps_previous_credentials() {
		let server = MockServer::start().await;
		let tokens = manager(&server);

		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(ResponseTemplate::new(400).set_body_string("invalid refresh token"))
			.up_to_n_times(1)
			.mount(&server)
			.await;

		let err = tokens.get_valid_token().await.expect_err("refresh must fail");
		assert!(format!("{err:#}").contains("status=400"));

		Mock::given(method("POST"))
			.and(path("/token"))
			.and(body_string_contains("refresh_token=refresh-1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"access_token": "access-after-retry",
				"expires_in": 3600
			})))
			.mount(&server)
			.await;

		let token = tokens.get_valid_token().await.expect("second attempt");
		assert_eq!(token.expose(), "access-after-retry");
	}

	#[tokio::test]
	async fn invalidate_forces_refresh() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"access_token": "access",
				"expires_in": 3600
			})))
			.expect(2)
			.mount(&server)
			.await;

		let tokens = manager(&server);
		tokens.get_valid_token().await.expect("first");
		tokens.invalidate().await;
		tokens.get_valid_token().await.expect("after invalidate");
	}

	#[tokio::test]
	async fn validate_is_not_fatal() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"access_token": "access",
				"expires_in": 3600
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/validate"))
			.and(header("Authorization", "OAuth access"))
			.respond_with(ResponseTemplate::new(401).set_body_string("invalid access token"))
			.expect(1)
			.mount(&server)
			.await;

		let tokens = manager(&server);
		assert!(tokens.validate().await.expect("validate never errors on status").is_none());
	}
}
