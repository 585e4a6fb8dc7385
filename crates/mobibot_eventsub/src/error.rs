#![forbid(unsafe_code)]

use mobibot_domain::ChannelLogin;
use thiserror::Error;

/// Errors that end the session. Broadcast on [`crate::EventSubClient::errors`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalError {
	#[error("eventsub socket closed with unrecoverable code {code}: {reason}")]
	UnrecoverableClose { code: u16, reason: String },

	#[error("eventsub socket closed by the service with code {code}: {reason}")]
	ClosedByPeer { code: u16, reason: String },

	#[error("eventsub reconnect gave up after {attempts} failed attempts")]
	ReconnectExhausted { attempts: u32 },

	#[error("eventsub auth failed: {0}")]
	Auth(String),
}

/// Errors returned by [`crate::EventSubClient`] operations.
#[derive(Debug, Error)]
pub enum EventSubError {
	#[error("no live eventsub session")]
	NotReady,

	#[error("a connect is already in progress")]
	ConnectInProgress,

	#[error("eventsub session is closed")]
	Closed,

	#[error("auth failed: {0:#}")]
	Auth(anyhow::Error),

	#[error("unknown channel {0}")]
	UnknownChannel(ChannelLogin),

	#[error("subscription for {channel} rejected (status={status})")]
	SubscriptionRejected { channel: ChannelLogin, status: u16 },

	#[error("unsubscribe for {channel} rejected (status={status})")]
	UnsubscribeRejected { channel: ChannelLogin, status: u16 },

	#[error("helix request failed: {0:#}")]
	Http(anyhow::Error),

	#[error("transport failed: {0:#}")]
	Transport(anyhow::Error),

	#[error(transparent)]
	Fatal(#[from] FatalError),
}

impl EventSubError {
	/// True when the error came from the token lifecycle rather than the session.
	pub fn is_auth(&self) -> bool {
		matches!(self, Self::Auth(_) | Self::Fatal(FatalError::Auth(_)))
	}
}
