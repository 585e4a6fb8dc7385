#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mobibot_domain::ChannelLogin;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};
use url::Url;

use crate::auth::TokenManager;
use crate::helix::{ControlApi, HelixClient};
use crate::reconnect::ReconnectPolicy;
use crate::registry::control_error;
use crate::session::{HandlerSlot, SessionControl, SessionController, SessionState};
use crate::transport::{Transport, TungsteniteTransport, WsConnector};
use crate::{ChatTags, EventSubError, FatalError, SecretString};

pub const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";
pub const DEFAULT_OAUTH_BASE_URL: &str = "https://id.twitch.tv/oauth2";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to run an EventSub session for one bot account.
#[derive(Clone)]
pub struct EventSubConfig {
	pub client_id: String,
	pub client_secret: SecretString,
	pub refresh_token: SecretString,
	/// Twitch user id of the bot account (`user_id` in subscription conditions).
	pub bot_user_id: String,

	pub eventsub_ws_url: String,
	pub helix_base_url: String,
	pub oauth_base_url: String,

	pub request_timeout: Duration,
	/// Limit on silence before the first welcome.
	pub welcome_timeout: Duration,
	/// Added to the negotiated keepalive before the watchdog fires.
	pub keepalive_grace: Duration,
	pub reconnect: ReconnectPolicy,

	/// Known login → broadcaster id pairs; skips the user lookup.
	pub broadcaster_id_overrides: Vec<(ChannelLogin, String)>,
	/// Dial sockets through this instead of plain `connect_async`.
	pub ws_connector: Option<WsConnector>,

	pub control_channel_capacity: usize,
	pub error_channel_capacity: usize,
}

impl EventSubConfig {
	pub fn new(
		client_id: impl Into<String>,
		client_secret: SecretString,
		refresh_token: SecretString,
		bot_user_id: impl Into<String>,
	) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret,
			refresh_token,
			bot_user_id: bot_user_id.into(),
			eventsub_ws_url: DEFAULT_EVENTSUB_WS_URL.to_string(),
			helix_base_url: DEFAULT_HELIX_BASE_URL.to_string(),
			oauth_base_url: DEFAULT_OAUTH_BASE_URL.to_string(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			welcome_timeout: DEFAULT_WELCOME_TIMEOUT,
			keepalive_grace: DEFAULT_KEEPALIVE_GRACE,
			reconnect: ReconnectPolicy::default(),
			broadcaster_id_overrides: Vec::new(),
			ws_connector: None,
			control_channel_capacity: 64,
			error_channel_capacity: 16,
		}
	}
}

impl std::fmt::Debug for EventSubConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventSubConfig")
			.field("client_id", &self.client_id)
			.field("client_secret", &self.client_secret)
			.field("refresh_token", &self.refresh_token)
			.field("bot_user_id", &self.bot_user_id)
			.field("eventsub_ws_url", &self.eventsub_ws_url)
			.field("reconnect", &self.reconnect)
			.finish_non_exhaustive()
	}
}

/// Handle to a running EventSub session. Cheap to clone; the session stops
/// when the last handle is dropped or [`EventSubClient::shutdown`] is called.
#[derive(Clone)]
pub struct EventSubClient {
	control: mpsc::Sender<SessionControl>,
	api: Arc<dyn ControlApi>,
	handler: HandlerSlot,
	fatal_tx: broadcast::Sender<FatalError>,
}

impl std::fmt::Debug for EventSubClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventSubClient")
			.field("closed", &self.control.is_closed())
			.finish_non_exhaustive()
	}
}

impl EventSubClient {
	/// Build the Helix client and WebSocket transport from `cfg` and spawn the
	/// session task. Must be called inside a tokio runtime.
	pub fn new(cfg: EventSubConfig) -> anyhow::Result<Self> {
		let oauth_base_url = Url::parse(&cfg.oauth_base_url).context("parse oauth base url")?;
		let helix_base_url = Url::parse(&cfg.helix_base_url).context("parse helix base url")?;

		let tokens = Arc::new(TokenManager::new(
			oauth_base_url,
			cfg.client_id.clone(),
			cfg.client_secret.clone(),
			cfg.refresh_token.clone(),
			cfg.request_timeout,
		)?);
		let helix = HelixClient::new(helix_base_url, tokens, cfg.bot_user_id.clone(), cfg.request_timeout)?
			.with_user_id_overrides(cfg.broadcaster_id_overrides.iter().cloned());

		let mut transport = TungsteniteTransport::new(cfg.welcome_timeout, cfg.keepalive_grace);
		if let Some(connector) = cfg.ws_connector.clone() {
			transport = transport.with_connector(connector);
		}

		Self::with_parts(&cfg, Arc::new(helix), Arc::new(transport))
	}

	/// Spawn a session over caller-supplied control plane and transport.
	pub fn with_parts(
		cfg: &EventSubConfig,
		api: Arc<dyn ControlApi>,
		transport: Arc<dyn Transport>,
	) -> anyhow::Result<Self> {
		let primary_url = Url::parse(&cfg.eventsub_ws_url).context("parse eventsub ws url")?;

		let handler = HandlerSlot::default();
		let (fatal_tx, _) = broadcast::channel(cfg.error_channel_capacity.max(1));
		let (control, control_rx) = mpsc::channel(cfg.control_channel_capacity.max(1));

		let controller = SessionController::new(
			api.clone(),
			transport,
			primary_url,
			cfg.reconnect,
			handler.clone(),
			fatal_tx.clone(),
		);
		tokio::spawn(controller.run(control_rx));
		debug!(ws_url = %cfg.eventsub_ws_url, "eventsub session task spawned");

		Ok(Self {
			control,
			api,
			handler,
			fatal_tx,
		})
	}

	async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SessionControl) -> Result<T, EventSubError> {
		let (resp, rx) = oneshot::channel();
		self.control
			.send(make(resp))
			.await
			.map_err(|_| EventSubError::Closed)?;
		rx.await.map_err(|_| EventSubError::Closed)
	}

	/// Open the session. Resolves once the first `session_welcome` arrives.
	pub async fn connect(&self) -> Result<(), EventSubError> {
		self.request(|resp| SessionControl::Connect { resp }).await?
	}

	/// Subscribe to chat in `channel`. Requires a live session.
	pub async fn subscribe(&self, channel: &ChannelLogin) -> Result<(), EventSubError> {
		let channel = channel.clone();
		self.request(|resp| SessionControl::Subscribe { channel, resp }).await?
	}

	pub async fn unsubscribe(&self, channel: &ChannelLogin) -> Result<(), EventSubError> {
		let channel = channel.clone();
		self.request(|resp| SessionControl::Unsubscribe { channel, resp }).await?
	}

	/// Send a chat message as the bot. Does not go through the session task.
	pub async fn send(&self, channel: &ChannelLogin, message: &str) -> Result<(), EventSubError> {
		let broadcaster_id = self
			.api
			.resolve_user_id(channel)
			.await
			.map_err(control_error)?
			.ok_or_else(|| EventSubError::UnknownChannel(channel.clone()))?;

		self.api
			.send_chat_message(&broadcaster_id, message)
			.await
			.map_err(control_error)?;
		metrics::counter!("mobibot_eventsub_chat_messages_sent_total").increment(1);
		Ok(())
	}

	/// Register the chat callback, replacing any previous one.
	pub fn on_chat_message<F>(&self, callback: F)
	where
		F: Fn(&str, &ChatTags, &str) + Send + Sync + 'static,
	{
		*self.handler.write() = Some(Arc::new(callback));
	}

	/// Fatal errors. Each receiver sees every error sent after it subscribed.
	pub fn errors(&self) -> broadcast::Receiver<FatalError> {
		self.fatal_tx.subscribe()
	}

	pub async fn active_channels(&self) -> Result<Vec<ChannelLogin>, EventSubError> {
		self.request(|resp| SessionControl::ActiveChannels { resp }).await
	}

	pub async fn state(&self) -> Result<SessionState, EventSubError> {
		self.request(|resp| SessionControl::State { resp }).await
	}

	/// Close every socket and stop the session task. Idempotent.
	pub async fn shutdown(&self) {
		if self.request(|resp| SessionControl::Shutdown { resp }).await.is_ok() {
			info!("eventsub client shut down");
		}
	}
}

#[cfg(test)]
mod tests {
	use parking_lot::Mutex;
	use tokio::time::{sleep, timeout};

	use super::*;
	use crate::eventsub::fixtures;
	use crate::session::testing::{FakeApi, FakeSocket, FakeTransport};

	fn login(s: &str) -> ChannelLogin {
		ChannelLogin::new(s).expect("valid login")
	}

	fn config() -> EventSubConfig {
		EventSubConfig::new(
			"cid",
			SecretString::new("secret"),
			SecretString::new("refresh"),
			"bot-1",
		)
	}

	fn client() -> (
		EventSubClient,
		Arc<FakeApi>,
		mpsc::UnboundedReceiver<FakeSocket>,
	) {
		let api = Arc::new(FakeApi::default());
		let (transport, sockets) = FakeTransport::new();
		let client = EventSubClient::with_parts(&config(), api.clone(), transport).expect("client");
		(client, api, sockets)
	}

	async fn connect(client: &EventSubClient, sockets: &mut mpsc::UnboundedReceiver<FakeSocket>) -> FakeSocket {
		let pending = tokio::spawn({
			let client = client.clone();
			async move { client.connect().await }
		});
		let socket = timeout(Duration::from_secs(5), sockets.recv())
			.await
			.expect("socket in time")
			.expect("socket");
		socket.send_text(fixtures::welcome("sess-1", 10)).await;
		pending.await.expect("join").expect("connected");
		socket
	}

	#[test]
	fn config_defaults_and_redaction() {
		let cfg = config();
		assert_eq!(cfg.eventsub_ws_url, DEFAULT_EVENTSUB_WS_URL);
		assert_eq!(cfg.reconnect, ReconnectPolicy::default());
		assert_eq!(cfg.request_timeout, Duration::from_secs(10));

		let dbg = format!("{cfg:?}");
		assert!(!dbg.contains("secret\""), "{dbg}");
		assert!(!dbg.contains("refresh\""), "{dbg}");
	}

	#[tokio::test]
	async fn bad_ws_url_is_rejected() {
		let mut cfg = config();
		cfg.eventsub_ws_url = "not a url".to_string();
		let (transport, _sockets) = FakeTransport::new();
		assert!(EventSubClient::with_parts(&cfg, Arc::new(FakeApi::default()), transport).is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn connect_subscribe_and_list() {
		let (client, api, mut sockets) = client();
		let _primary = connect(&client, &mut sockets).await;

		client.subscribe(&login("foo")).await.expect("subscribe");
		client.subscribe(&login("bar")).await.expect("subscribe");
		client.unsubscribe(&login("bar")).await.expect("unsubscribe");

		assert_eq!(client.active_channels().await.expect("channels"), vec![login("foo")]);
		assert_eq!(client.state().await.expect("state"), SessionState::Ready);
		assert_eq!(api.sessions_for("foo"), vec!["sess-1".to_string()]);
	}

	#[tokio::test(start_paused = true)]
	async fn callback_receives_chat_and_can_be_replaced() {
		let (client, _api, mut sockets) = client();
		let primary = connect(&client, &mut sockets).await;

		let first = Arc::new(Mutex::new(Vec::<String>::new()));
		let sink = first.clone();
		client.on_chat_message(move |channel, tags, text| {
			sink.lock().push(format!("{channel}|{}|{text}", tags.username));
		});
		primary
			.send_text(fixtures::chat_message("m1", "foo", "bar", "!pb baz"))
			.await;

		for _ in 0..100 {
			if !first.lock().is_empty() {
				break;
			}
			sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(*first.lock(), vec!["foo|bar|!pb baz".to_string()]);

		let second = Arc::new(Mutex::new(0usize));
		let counter = second.clone();
		client.on_chat_message(move |_, _, _| *counter.lock() += 1);
		primary
			.send_text(fixtures::chat_message("m2", "foo", "bar", "again"))
			.await;

		for _ in 0..100 {
			if *second.lock() == 1 {
				break;
			}
			sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(*second.lock(), 1);
		assert_eq!(first.lock().len(), 1);
	}

	#[tokio::test]
	async fn send_resolves_broadcaster_and_posts() {
		let (client, api, _sockets) = client();
		client.send(&login("foo"), "hello chat").await.expect("send");
		assert_eq!(
			api.sent(),
			vec![(api.user_id_for("foo"), "hello chat".to_string())]
		);

		api.forget_user("ghost");
		let err = client.send(&login("ghost"), "hi").await.expect_err("unknown");
		assert!(matches!(err, EventSubError::UnknownChannel(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn fatal_errors_are_broadcast_to_every_receiver() {
		let (client, _api, mut sockets) = client();
		let primary = connect(&client, &mut sockets).await;
		let mut a = client.errors();
		let mut b = client.errors();

		primary.close(4001, "client sent inbound traffic").await;

		let expected = FatalError::UnrecoverableClose {
			code: 4001,
			reason: "client sent inbound traffic".to_string(),
		};
		assert_eq!(a.recv().await.expect("a"), expected);
		assert_eq!(b.recv().await.expect("b"), expected);

		let err = client.connect().await.expect_err("closed");
		assert!(matches!(err, EventSubError::Closed));
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_is_idempotent() {
		let (client, _api, mut sockets) = client();
		let _primary = connect(&client, &mut sockets).await;

		client.shutdown().await;
		client.shutdown().await;
		assert!(matches!(client.state().await, Err(EventSubError::Closed)));
		assert!(matches!(
			client.subscribe(&login("foo")).await,
			Err(EventSubError::Closed)
		));
	}
}
