#![forbid(unsafe_code)]

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::CHAT_MESSAGE_SUBSCRIPTION;

/// EventSub metadata (present on all WebSocket messages).
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadata {
	pub(crate) message_id: String,
	#[allow(dead_code)]
	pub(crate) message_type: String,
	pub(crate) message_timestamp: String,

	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
	#[allow(dead_code)]
	#[serde(default)]
	pub(crate) subscription_version: Option<String>,
}

/// A lightweight peek struct to cheaply inspect message_type/subscription_type.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeek {
	pub(crate) metadata: EventSubMetadataPeekInner,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeekInner {
	pub(crate) message_type: String,
	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventSubSessionMessage {
	payload: EventSubSessionPayload,
}

#[derive(Debug, Deserialize)]
struct EventSubSessionPayload {
	session: EventSubSession,
}

#[derive(Debug, Deserialize)]
struct EventSubSession {
	id: String,

	#[serde(default)]
	keepalive_timeout_seconds: Option<u64>,

	#[serde(default)]
	reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventSubNotification<TEvent> {
	metadata: EventSubMetadata,
	payload: EventSubNotificationPayload<TEvent>,
}

#[derive(Debug, Deserialize)]
struct EventSubNotificationPayload<TEvent> {
	subscription: EventSubSubscription,
	event: TEvent,
}

#[derive(Debug, Deserialize)]
struct EventSubRevocation {
	payload: EventSubRevocationPayload,
}

#[derive(Debug, Deserialize)]
struct EventSubRevocationPayload {
	subscription: EventSubSubscription,
}

#[derive(Debug, Deserialize)]
struct EventSubSubscription {
	id: String,
	#[serde(default)]
	status: String,
	#[serde(rename = "type")]
	r#type: String,
	#[serde(default)]
	condition: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChannelChatMessageEvent {
	broadcaster_user_login: String,
	chatter_user_login: String,
	message: ChannelChatMessageContent,
}

#[derive(Debug, Deserialize)]
struct ChannelChatMessageContent {
	text: String,
}

/// `session_welcome` details the controller cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WelcomeSession {
	pub(crate) session_id: String,
	pub(crate) keepalive_timeout_seconds: Option<u64>,
}

/// Decoded `channel.chat.message` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChatNotification {
	pub(crate) message_id: String,
	pub(crate) subscription_id: String,
	pub(crate) channel: String,
	pub(crate) chatter: String,
	pub(crate) text: String,
	pub(crate) sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Revocation {
	pub(crate) subscription_id: String,
	pub(crate) subscription_type: String,
	pub(crate) status: String,
	pub(crate) broadcaster_user_id: Option<String>,
}

/// Inbound frames, keyed on `metadata.message_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InboundFrame {
	Welcome(WelcomeSession),
	Keepalive,
	Reconnect { reconnect_url: String },
	ChatMessage(ChatNotification),
	/// A notification for a subscription type this crate does not consume.
	OtherNotification { subscription_type: Option<String> },
	Revocation(Revocation),
	Unknown { message_type: String },
}

/// Convert a `metadata.message_timestamp` RFC3339 timestamp into UTC.
pub(crate) fn parse_message_timestamp(ts: &str) -> anyhow::Result<DateTime<Utc>> {
	let dt = DateTime::parse_from_rfc3339(ts).context("parse EventSub RFC3339 timestamp")?;
	Ok(dt.with_timezone(&Utc))
}

fn parse_session(raw_json: &str, label: &'static str) -> anyhow::Result<EventSubSession> {
	let msg: EventSubSessionMessage = serde_json::from_str(raw_json).with_context(|| format!("parse {label}"))?;
	Ok(msg.payload.session)
}

fn parse_chat_message(raw_json: &str) -> anyhow::Result<ChatNotification> {
	let msg: EventSubNotification<ChannelChatMessageEvent> =
		serde_json::from_str(raw_json).context("parse channel.chat.message notification")?;

	Ok(ChatNotification {
		sent_at: parse_message_timestamp(&msg.metadata.message_timestamp).ok(),
		message_id: msg.metadata.message_id,
		subscription_id: msg.payload.subscription.id,
		channel: msg.payload.event.broadcaster_user_login,
		chatter: msg.payload.event.chatter_user_login,
		text: msg.payload.event.message.text,
	})
}

fn parse_revocation(raw_json: &str) -> anyhow::Result<Revocation> {
	let msg: EventSubRevocation = serde_json::from_str(raw_json).context("parse revocation")?;
	let sub = msg.payload.subscription;

	Ok(Revocation {
		broadcaster_user_id: sub
			.condition
			.get("broadcaster_user_id")
			.and_then(|v| v.as_str())
			.map(str::to_string),
		subscription_id: sub.id,
		subscription_type: sub.r#type,
		status: sub.status,
	})
}

/// Decode one raw text frame. Malformed frames are errors; unknown types are not.
pub(crate) fn decode_frame(raw_json: &str) -> anyhow::Result<InboundFrame> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;

	let frame = match peek.metadata.message_type.as_str() {
		"session_welcome" => {
			let session = parse_session(raw_json, "session_welcome")?;
			InboundFrame::Welcome(WelcomeSession {
				session_id: session.id,
				keepalive_timeout_seconds: session.keepalive_timeout_seconds,
			})
		}
		"session_keepalive" => InboundFrame::Keepalive,
		"session_reconnect" => {
			let session = parse_session(raw_json, "session_reconnect")?;
			let reconnect_url = session
				.reconnect_url
				.filter(|u| !u.is_empty())
				.context("session_reconnect without reconnect_url")?;
			InboundFrame::Reconnect { reconnect_url }
		}
		"notification" if peek.metadata.subscription_type.as_deref() == Some(CHAT_MESSAGE_SUBSCRIPTION) => {
			InboundFrame::ChatMessage(parse_chat_message(raw_json)?)
		}
		"notification" => InboundFrame::OtherNotification {
			subscription_type: peek.metadata.subscription_type,
		},
		"revocation" => InboundFrame::Revocation(parse_revocation(raw_json)?),
		_ => InboundFrame::Unknown {
			message_type: peek.metadata.message_type,
		},
	};

	Ok(frame)
}
