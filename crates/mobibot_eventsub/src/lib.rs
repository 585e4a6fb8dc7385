#![forbid(unsafe_code)]

//! Twitch EventSub session and subscription manager.
//!
//! [`EventSubClient`] owns one WebSocket session to the EventSub endpoint,
//! keeps a set of channels subscribed to `channel.chat.message`, and recovers
//! from dropped sockets and service-initiated migrations by replaying that set
//! on every new `session_welcome`.

mod auth;
mod client;
mod error;
mod eventsub;
mod helix;
mod reconnect;
mod registry;
mod session;
mod transport;

use std::fmt;

pub use auth::{TokenManager, TokenValidation};
pub use client::{
	DEFAULT_EVENTSUB_WS_URL, DEFAULT_HELIX_BASE_URL, DEFAULT_OAUTH_BASE_URL, EventSubClient, EventSubConfig,
};
pub use error::{EventSubError, FatalError};
pub use helix::{ControlApi, HelixClient, RemoteSubscription};
pub use reconnect::{CloseClass, ReconnectPolicy, classify_close_code};
pub use reqwest::StatusCode;
pub use session::SessionState;
pub use transport::{
	BoxFuture, SocketCommand, SocketEvent, SocketHandle, SocketId, Transport, TungsteniteTransport, TwitchWs, WsConnector,
};

/// EventSub subscription type for chat messages.
pub const CHAT_MESSAGE_SUBSCRIPTION: &str = "channel.chat.message";

/// Chatter metadata passed to the chat-message callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTags {
	pub username: String,
}

/// Single chat-message callback: `(channel, tags, text)`.
pub type ChatMessageHandler = std::sync::Arc<dyn Fn(&str, &ChatTags, &str) + Send + Sync>;

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
