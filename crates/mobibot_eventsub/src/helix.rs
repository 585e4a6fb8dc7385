#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use mobibot_domain::ChannelLogin;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::auth::TokenManager;
use crate::CHAT_MESSAGE_SUBSCRIPTION;

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const CHAT_MESSAGES_PATH: &str = "/helix/chat/messages";
const USERS_PATH: &str = "/helix/users";

/// REST control plane used by the session controller.
///
/// Implementations attach a fresh access token to every request.
#[async_trait::async_trait]
pub trait ControlApi: Send + Sync {
	/// Make sure a usable access token exists before a socket is opened.
	async fn prepare_auth(&self) -> anyhow::Result<()>;

	/// Map a login to its user id. `Ok(None)` when no such user exists.
	async fn resolve_user_id(&self, login: &ChannelLogin) -> anyhow::Result<Option<String>>;

	/// Create a `channel.chat.message` v1 subscription bound to `session_id`.
	async fn create_chat_message_subscription(
		&self,
		session_id: &str,
		broadcaster_user_id: &str,
	) -> anyhow::Result<StatusCode>;

	/// Every enabled subscription held by the application, across all pages.
	async fn list_enabled_subscriptions(&self) -> anyhow::Result<Vec<RemoteSubscription>>;

	async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<StatusCode>;

	async fn send_chat_message(&self, broadcaster_id: &str, message: &str) -> anyhow::Result<()>;
}

/// A subscription as reported by the list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSubscription {
	pub id: String,
	pub status: String,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub condition: serde_json::Value,
	#[serde(default)]
	pub transport: Option<serde_json::Value>,
}

impl RemoteSubscription {
	pub fn broadcaster_user_id(&self) -> Option<&str> {
		self.condition.get("broadcaster_user_id").and_then(|v| v.as_str())
	}

	pub fn session_id(&self) -> Option<&str> {
		self.transport
			.as_ref()
			.and_then(|t| t.get("session_id"))
			.and_then(|v| v.as_str())
	}

	pub fn is_chat_message_for(&self, broadcaster_user_id: &str) -> bool {
		self.kind == CHAT_MESSAGE_SUBSCRIPTION && self.broadcaster_user_id() == Some(broadcaster_user_id)
	}
}

/// Marker for 401 responses so callers can tell auth failures apart.
#[derive(Debug, thiserror::Error)]
#[error("helix auth failed (status={status}) body={body}")]
pub(crate) struct HelixAuthError {
	pub(crate) status: StatusCode,
	pub(crate) body: String,
}

/// Context attached when no access token could be obtained.
#[derive(Debug, thiserror::Error)]
#[error("obtain access token")]
pub(crate) struct TokenUnavailable;

/// True for failures a token refresh could fix (or already failed to).
pub(crate) fn is_auth_error(err: &anyhow::Error) -> bool {
	err.downcast_ref::<HelixAuthError>().is_some() || err.downcast_ref::<TokenUnavailable>().is_some()
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

/// Send once, retrying a single time on 429 or 5xx.
///
/// A 429 whose advertised wait exceeds `max_wait` is returned as is.
async fn send_with_retry(
	req: reqwest::RequestBuilder,
	label: &'static str,
	max_wait: Duration,
) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED {
		let body = resp.text().await.unwrap_or_default();
		return Err(HelixAuthError { status, body }.into());
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		if delay > max_wait {
			warn!(
				%label,
				delay_secs = delay.as_secs(),
				max_wait_secs = max_wait.as_secs(),
				"helix rate limit reset too far out; not retrying"
			);
			return Ok(resp);
		}
		metrics::counter!("mobibot_eventsub_helix_retries_total").increment(1);
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		metrics::counter!("mobibot_eventsub_helix_retries_total").increment(1);
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a, TCondition> {
	#[serde(rename = "type")]
	r#type: &'static str,
	version: &'static str,
	condition: TCondition,
	transport: HelixWebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
struct HelixChatMessageCondition<'a> {
	broadcaster_user_id: &'a str,
	user_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixWebsocketTransport<'a> {
	method: &'static str,
	session_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixSendChatMessage<'a> {
	broadcaster_id: &'a str,
	sender_id: &'a str,
	message: &'a str,
}

#[derive(Debug, Deserialize)]
struct HelixUsersResponse {
	data: Vec<HelixUser>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
	id: String,
}

#[derive(Debug, Deserialize)]
struct HelixListSubscriptionsResponse {
	data: Vec<RemoteSubscription>,
	#[serde(default)]
	pagination: Option<HelixPagination>,
}

#[derive(Debug, Deserialize)]
struct HelixPagination {
	#[serde(default)]
	cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixSendChatResponse {
	#[serde(default)]
	data: Vec<HelixSendChatResult>,
}

#[derive(Debug, Deserialize)]
struct HelixSendChatResult {
	#[serde(default)]
	is_sent: bool,
	#[serde(default)]
	drop_reason: Option<serde_json::Value>,
}

/// Helix-backed [`ControlApi`].
#[derive(Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	tokens: Arc<TokenManager>,
	bot_user_id: String,
	max_retry_wait: Duration,
	user_ids: Mutex<HashMap<ChannelLogin, String>>,
}

impl HelixClient {
	pub fn new(
		base_url: Url,
		tokens: Arc<TokenManager>,
		bot_user_id: impl Into<String>,
		request_timeout: Duration,
	) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("mobibot/0.x (eventsub-ws)")
			.timeout(request_timeout)
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			tokens,
			bot_user_id: bot_user_id.into(),
			max_retry_wait: request_timeout,
			user_ids: Mutex::new(HashMap::new()),
		})
	}

	/// Pre-seed login → user id mappings (skips the lookup for those channels).
	pub fn with_user_id_overrides(self, overrides: impl IntoIterator<Item = (ChannelLogin, String)>) -> Self {
		self.user_ids.lock().extend(overrides);
		self
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	async fn authed(&self, req: reqwest::RequestBuilder) -> anyhow::Result<reqwest::RequestBuilder> {
		let token = self.tokens.get_valid_token().await.context(TokenUnavailable)?;
		Ok(req
			.header("Client-Id", self.tokens.client_id())
			.header("Authorization", format!("Bearer {}", token.expose())))
	}

	/// Send with a fresh token. A 401 invalidates the token and retries once.
	async fn execute<F>(&self, build: F, label: &'static str) -> anyhow::Result<reqwest::Response>
	where
		F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
	{
		metrics::counter!("mobibot_eventsub_helix_requests_total").increment(1);

		let first = send_with_retry(self.authed(build(&self.http)).await?, label, self.max_retry_wait).await;
		match first {
			Err(e) if is_auth_error(&e) => {
				warn!(%label, error = %e, "helix rejected token; refreshing and retrying");
				self.tokens.invalidate().await;
				send_with_retry(self.authed(build(&self.http)).await?, label, self.max_retry_wait).await
			}
			other => other,
		}
	}
}

#[async_trait::async_trait]
impl ControlApi for HelixClient {
	async fn prepare_auth(&self) -> anyhow::Result<()> {
		self.tokens.get_valid_token().await.context(TokenUnavailable)?;
		if let Some(v) = self.tokens.validate().await?
			&& v.user_id != self.bot_user_id
		{
			warn!(token_user = %v.user_id, bot_user = %self.bot_user_id, "token belongs to a different user than the configured bot id");
		}
		Ok(())
	}

	async fn resolve_user_id(&self, login: &ChannelLogin) -> anyhow::Result<Option<String>> {
		let cached = self.user_ids.lock().get(login).cloned();
		if cached.is_some() {
			return Ok(cached);
		}

		let url = self.url(&format!("{USERS_PATH}?login={}", urlencoding::encode(login.as_str())))?;
		let resp = self
			.execute(|http| http.get(url.clone()), "GET /helix/users")
			.await
			.context("helix GET /helix/users send")?;

		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/users read body")?;

		if !status.is_success() {
			anyhow::bail!("helix GET /helix/users failed: status={status} body={body}");
		}

		let parsed: HelixUsersResponse = serde_json::from_str(&body).context("helix users parse json")?;
		let Some(user) = parsed.data.into_iter().next() else {
			return Ok(None);
		};

		debug!(%login, user_id = %user.id, "resolved broadcaster id");
		self.user_ids.lock().insert(login.clone(), user.id.clone());
		Ok(Some(user.id))
	}

	async fn create_chat_message_subscription(
		&self,
		session_id: &str,
		broadcaster_user_id: &str,
	) -> anyhow::Result<StatusCode> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		let req = HelixCreateSubscriptionRequest {
			r#type: CHAT_MESSAGE_SUBSCRIPTION,
			version: "1",
			condition: HelixChatMessageCondition {
				broadcaster_user_id,
				user_id: &self.bot_user_id,
			},
			transport: HelixWebsocketTransport {
				method: "websocket",
				session_id,
			},
		};

		let resp = self
			.execute(|http| http.post(url.clone()).json(&req), "POST /helix/eventsub/subscriptions")
			.await
			.with_context(|| format!("helix POST {EVENTSUB_SUBSCRIPTIONS_PATH} send (type={CHAT_MESSAGE_SUBSCRIPTION})"))?;

		let status = resp.status();
		if status != StatusCode::ACCEPTED {
			let body = resp.text().await.unwrap_or_default();
			debug!(%status, %body, %broadcaster_user_id, "helix create subscription not accepted");
		}
		Ok(status)
	}

	async fn list_enabled_subscriptions(&self) -> anyhow::Result<Vec<RemoteSubscription>> {
		let mut out: Vec<RemoteSubscription> = Vec::new();
		let mut after: Option<String> = None;

		loop {
			let mut path = format!("{EVENTSUB_SUBSCRIPTIONS_PATH}?status=enabled");
			if let Some(after) = &after {
				path.push_str("&after=");
				path.push_str(&urlencoding::encode(after));
			}
			let url = self.url(&path)?;

			let resp = self
				.execute(|http| http.get(url.clone()), "GET /helix/eventsub/subscriptions")
				.await
				.context("helix GET /helix/eventsub/subscriptions send")?;

			let status = resp.status();
			let body = resp
				.text()
				.await
				.context("helix GET /helix/eventsub/subscriptions read body")?;

			if !status.is_success() {
				anyhow::bail!("helix list subscriptions failed: status={status} body={body}");
			}

			let page: HelixListSubscriptionsResponse =
				serde_json::from_str(&body).context("helix list subscriptions parse json")?;
			out.extend(page.data);

			let next = page.pagination.and_then(|p| p.cursor).filter(|c| !c.is_empty());
			if next.is_none() {
				break;
			}
			after = next;
		}

		Ok(out)
	}

	async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<StatusCode> {
		let url = self.url(&format!(
			"{EVENTSUB_SUBSCRIPTIONS_PATH}?id={}",
			urlencoding::encode(subscription_id)
		))?;

		let resp = self
			.execute(|http| http.delete(url.clone()), "DELETE /helix/eventsub/subscriptions")
			.await
			.context("helix DELETE /helix/eventsub/subscriptions send")?;

		let status = resp.status();
		if status != StatusCode::NO_CONTENT {
			let body = resp.text().await.unwrap_or_default();
			debug!(%status, %body, %subscription_id, "helix delete subscription returned non-204");
		}
		Ok(status)
	}

	async fn send_chat_message(&self, broadcaster_id: &str, message: &str) -> anyhow::Result<()> {
		let url = self.url(CHAT_MESSAGES_PATH)?;
		let req = HelixSendChatMessage {
			broadcaster_id,
			sender_id: &self.bot_user_id,
			message,
		};

		let resp = self
			.execute(|http| http.post(url.clone()).json(&req), "POST /helix/chat/messages")
			.await
			.context("helix POST /helix/chat/messages send")?;

		let status = resp.status();
		let body = resp.text().await.unwrap_or_default();
		if !status.is_success() {
			anyhow::bail!("helix send chat failed: status={status} body={body}");
		}

		if let Ok(parsed) = serde_json::from_str::<HelixSendChatResponse>(&body)
			&& let Some(result) = parsed.data.first()
			&& !result.is_sent
		{
			warn!(%broadcaster_id, drop_reason = ?result.drop_reason, "chat message was dropped");
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use wiremock::matchers::{body_json, header, method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;
	use crate::SecretString;

	async fn client(server: &MockServer) -> HelixClient {
		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"access_token": "access",
				"expires_in": 3600
			})))
			.mount(server)
			.await;

		let base = Url::parse(&server.uri()).expect("mock url");
		let tokens = TokenManager::new(
			base.clone(),
			"cid",
			SecretString::new("secret"),
			SecretString::new("refresh"),
			Duration::from_secs(5),
		)
		.expect("token manager");

		HelixClient::new(base, Arc::new(tokens), "bot-1", Duration::from_secs(5)).expect("helix client")
	}

	fn login(s: &str) -> ChannelLogin {
		ChannelLogin::new(s).expect("valid login")
	}

	#[tokio::test]
	async fn create_subscription_posts_websocket_transport() {
		let server = MockServer::start().await;
		let helix = client(&server).await;

		Mock::given(method("POST"))
			.and(path(EVENTSUB_SUBSCRIPTIONS_PATH))
			.and(header("Client-Id", "cid"))
			.and(header("Authorization", "Bearer access"))
			.and(body_json(json!({
				"type": "channel.chat.message",
				"version": "1",
				"condition": { "broadcaster_user_id": "42", "user_id": "bot-1" },
				"transport": { "method": "websocket", "session_id": "sess-1" }
			})))
			.respond_with(ResponseTemplate::new(202).set_body_json(json!({ "data": [] })))
			.expect(1)
			.mount(&server)
			.await;

		let status = helix
			.create_chat_message_subscription("sess-1", "42")
			.await
			.expect("create subscription");
		assert_eq!(status, StatusCode::ACCEPTED);
	}

	#[tokio::test]
	async fn resolve_user_id_is_cached() {
		let server = MockServer::start().await;
		let helix = client(&server).await;

		Mock::given(method("GET"))
			.and(path(USERS_PATH))
			.and(query_param("login", "foo"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"data": [{ "id": "1001", "login": "foo", "display_name": "Foo" }]
			})))
			.expect(1)
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path(USERS_PATH))
			.and(query_param("login", "ghost"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
			.mount(&server)
			.await;

		assert_eq!(helix.resolve_user_id(&login("foo")).await.expect("lookup").as_deref(), Some("1001"));
		assert_eq!(helix.resolve_user_id(&login("#FOO")).await.expect("cached").as_deref(), Some("1001"));
		assert!(helix.resolve_user_id(&login("ghost")).await.expect("lookup").is_none());
	}

	#[tokio::test]
	async fn list_follows_pagination() {
		let server = MockServer::start().await;
		let helix = client(&server).await;

		Mock::given(method("GET"))
			.and(path(EVENTSUB_SUBSCRIPTIONS_PATH))
			.and(query_param("after", "page-2"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"data": [{
					"id": "sub-b", "status": "enabled", "type": "channel.chat.message", "version": "1",
					"condition": { "broadcaster_user_id": "2", "user_id": "bot-1" },
					"transport": { "method": "websocket", "session_id": "sess" }
				}],
				"pagination": {}
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path(EVENTSUB_SUBSCRIPTIONS_PATH))
			.and(query_param("status", "enabled"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"data": [{
					"id": "sub-a", "status": "enabled", "type": "channel.chat.message", "version": "1",
					"condition": { "broadcaster_user_id": "1", "user_id": "bot-1" },
					"transport": { "method": "websocket", "session_id": "sess" }
				}],
				"pagination": { "cursor": "page-2" }
			})))
			.mount(&server)
			.await;

		let subs = helix.list_enabled_subscriptions().await.expect("list");
		let ids: Vec<_> = subs.iter().map(|s| s.id.as_str()).collect();
		assert_eq!(ids, vec!["sub-a", "sub-b"]);
		assert!(subs[1].is_chat_message_for("2"));
		assert_eq!(subs[0].session_id(), Some("sess"));
	}

	#[tokio::test]
	async fn unauthorized_refreshes_and_retries_once() {
		let server = MockServer::start().await;
		let helix = client(&server).await;

		Mock::given(method("DELETE"))
			.and(path(EVENTSUB_SUBSCRIPTIONS_PATH))
			.and(query_param("id", "sub-1"))
			.respond_with(ResponseTemplate::new(401).set_body_string("invalid oauth token"))
			.up_to_n_times(1)
			.mount(&server)
			.await;
		Mock::given(method("DELETE"))
			.and(path(EVENTSUB_SUBSCRIPTIONS_PATH))
			.and(query_param("id", "sub-1"))
			.respond_with(ResponseTemplate::new(204))
			.mount(&server)
			.await;

		let status = helix.delete_subscription("sub-1").await.expect("delete");
		assert_eq!(status, StatusCode::NO_CONTENT);
	}

	#[tokio::test]
	async fn send_chat_uses_bot_as_sender() {
		let server = MockServer::start().await;
		let helix = client(&server).await;

		Mock::given(method("POST"))
			.and(path(CHAT_MESSAGES_PATH))
			.and(body_json(json!({ "broadcaster_id": "42", "sender_id": "bot-1", "message": "pong!" })))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"data": [{ "message_id": "m1", "is_sent": true }]
			})))
			.expect(1)
			.mount(&server)
			.await;

		helix.send_chat_message("42", "pong!").await.expect("send chat");
	}

	#[tokio::test]
	async fn server_errors_are_retried_once() {
		let server = MockServer::start().await;
		let helix = client(&server).await;

		Mock::given(method("POST"))
			.and(path(CHAT_MESSAGES_PATH))
			.respond_with(ResponseTemplate::new(503))
			.expect(2)
			.mount(&server)
			.await;

		let err = helix.send_chat_message("42", "hi").await.expect_err("still failing");
		assert!(format!("{err:#}").contains("status=503"));
	}

	#[tokio::test]
	async fn distant_rate_limit_reset_is_not_waited_out() {
		let server = MockServer::start().await;
		let base = Url::parse(&server.uri()).expect("mock url");
		Mock::given(method("POST"))
			.and(path("/token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"access_token": "access",
				"expires_in": 3600
			})))
			.mount(&server)
			.await;
		let tokens = TokenManager::new(
			base.clone(),
			"cid",
			SecretString::new("secret"),
			SecretString::new("refresh"),
			Duration::from_secs(1),
		)
		.expect("token manager");
		let helix = HelixClient::new(base, Arc::new(tokens), "bot-1", Duration::from_secs(1)).expect("helix client");

		Mock::given(method("POST"))
			.and(path(EVENTSUB_SUBSCRIPTIONS_PATH))
			.respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3600"))
			.expect(1)
			.mount(&server)
			.await;

		let status = tokio::time::timeout(
			Duration::from_secs(10),
			helix.create_chat_message_subscription("sess-1", "42"),
		)
		.await
		.expect("returns without sleeping an hour")
		.expect("response");
		assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
	}

	#[tokio::test]
	async fn short_rate_limit_reset_is_retried() {
		let server = MockServer::start().await;
		let helix = client(&server).await;

		Mock::given(method("POST"))
			.and(path(EVENTSUB_SUBSCRIPTIONS_PATH))
			.respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
			.up_to_n_times(1)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path(EVENTSUB_SUBSCRIPTIONS_PATH))
			.respond_with(ResponseTemplate::new(202).set_body_json(json!({ "data": [] })))
			.expect(1)
			.mount(&server)
			.await;

		let status = helix
			.create_chat_message_subscription("sess-1", "42")
			.await
			.expect("create subscription");
		assert_eq!(status, StatusCode::ACCEPTED);
	}
}
