#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use mobibot_domain::ChannelLogin;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::EventSubError;
use crate::helix::{ControlApi, is_auth_error};

pub(crate) fn control_error(err: anyhow::Error) -> EventSubError {
	if is_auth_error(&err) {
		EventSubError::Auth(err)
	} else {
		EventSubError::Http(err)
	}
}

/// Channels believed to hold a live `channel.chat.message` subscription,
/// with the broadcaster id each was subscribed under.
///
/// Pure bookkeeping. The REST calls that feed it are [`subscribe_remote`]
/// and [`unsubscribe_remote`], run off the controller loop.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
	active: BTreeMap<ChannelLogin, String>,
}

impl SubscriptionRegistry {
	pub(crate) fn channels(&self) -> Vec<ChannelLogin> {
		self.active.keys().cloned().collect()
	}

	pub(crate) fn contains(&self, channel: &ChannelLogin) -> bool {
		self.active.contains_key(channel)
	}

	pub(crate) fn broadcaster_id(&self, channel: &ChannelLogin) -> Option<String> {
		self.active.get(channel).cloned()
	}

	pub(crate) fn insert(&mut self, channel: ChannelLogin, broadcaster_id: String) {
		self.active.insert(channel, broadcaster_id);
	}

	pub(crate) fn remove(&mut self, channel: &ChannelLogin) -> Option<String> {
		self.active.remove(channel)
	}

	/// Empty the set, returning what it held. Start of a replay.
	pub(crate) fn take_all(&mut self) -> Vec<ChannelLogin> {
		std::mem::take(&mut self.active).into_keys().collect()
	}

	/// Forget the channel subscribed under `broadcaster_id`, if any.
	pub(crate) fn remove_by_broadcaster_id(&mut self, broadcaster_id: &str) -> Option<ChannelLogin> {
		let channel = self
			.active
			.iter()
			.find(|(_, id)| id.as_str() == broadcaster_id)
			.map(|(channel, _)| channel.clone())?;
		self.active.remove(&channel);
		Some(channel)
	}
}

/// Create a chat subscription for `channel` on `session_id`.
///
/// Returns the broadcaster id; 202 and 409 both count as subscribed.
pub(crate) async fn subscribe_remote(
	api: &dyn ControlApi,
	session_id: &str,
	channel: &ChannelLogin,
) -> Result<String, EventSubError> {
	let broadcaster_id = api
		.resolve_user_id(channel)
		.await
		.map_err(control_error)?
		.ok_or_else(|| EventSubError::UnknownChannel(channel.clone()))?;

	let status = api
		.create_chat_message_subscription(session_id, &broadcaster_id)
		.await
		.map_err(control_error)?;

	match status {
		StatusCode::ACCEPTED => {
			info!(%channel, %broadcaster_id, %session_id, "subscribed to chat");
		}
		StatusCode::CONFLICT => {
			info!(%channel, %broadcaster_id, %session_id, "chat subscription already exists");
		}
		other => {
			warn!(%channel, status = %other, "chat subscription rejected");
			metrics::counter!("mobibot_eventsub_subscriptions_rejected_total").increment(1);
			return Err(EventSubError::SubscriptionRejected {
				channel: channel.clone(),
				status: other.as_u16(),
			});
		}
	}

	metrics::counter!("mobibot_eventsub_subscriptions_created_total").increment(1);
	Ok(broadcaster_id)
}

/// Delete the remote chat subscription for `channel`.
///
/// `known_id` is the broadcaster id the channel was subscribed under, used when
/// the login no longer resolves. No remote subscription is not an error.
pub(crate) async fn unsubscribe_remote(
	api: &dyn ControlApi,
	channel: &ChannelLogin,
	known_id: Option<String>,
) -> Result<(), EventSubError> {
	let (resolved, remote) =
		tokio::try_join!(api.resolve_user_id(channel), api.list_enabled_subscriptions()).map_err(control_error)?;

	let Some(broadcaster_id) = resolved.or(known_id) else {
		debug!(%channel, "unknown channel; nothing to delete");
		return Ok(());
	};

	let Some(sub) = remote.iter().find(|s| s.is_chat_message_for(&broadcaster_id)) else {
		debug!(%channel, %broadcaster_id, "no remote subscription; nothing to delete");
		return Ok(());
	};

	let status = api.delete_subscription(&sub.id).await.map_err(control_error)?;
	match status {
		StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
			info!(%channel, subscription_id = %sub.id, "unsubscribed from chat");
			Ok(())
		}
		other => {
			warn!(%channel, status = %other, "chat unsubscribe rejected");
			Err(EventSubError::UnsubscribeRejected {
				channel: channel.clone(),
				status: other.as_u16(),
			})
		}
	}
}
