#![forbid(unsafe_code)]

use mobibot_domain::{ChannelLogin, McName};
use tracing::{error, warn};

use super::{Command, CommandContext, CommandError, Invocation};

/// Log a failed write and turn it into a chat-facing message.
fn write_failed(channel: &ChannelLogin, action: &str, e: impl std::fmt::Display, message: String) -> CommandError {
	error!(%channel, action, error = %e, "command write failed");
	CommandError::User(message)
}

fn mc_name_arg(invocation: &Invocation, command: &str) -> Result<McName, CommandError> {
	let raw = invocation
		.arg(0)
		.ok_or_else(|| CommandError::User(format!("⚠️ Please provide your Minecraft username after !{command}.")))?;
	McName::new(raw).map_err(|_| CommandError::User(format!("⚠️ {raw} is not a valid Minecraft username.")))
}

pub struct PingCommand;

#[async_trait::async_trait]
impl Command for PingCommand {
	fn name(&self) -> &'static str {
		"ping"
	}

	async fn handle(&self, _ctx: &CommandContext<'_>, _invocation: &Invocation) -> Result<Option<String>, CommandError> {
		Ok(Some("pong!".to_string()))
	}
}

pub struct HelpCommand;

#[async_trait::async_trait]
impl Command for HelpCommand {
	fn name(&self) -> &'static str {
		"help"
	}

	fn aliases(&self) -> &'static [&'static str] {
		&["docs", "documentation", "commands"]
	}

	async fn handle(&self, ctx: &CommandContext<'_>, _invocation: &Invocation) -> Result<Option<String>, CommandError> {
		Ok(Some(format!("Documentation is available at {}", ctx.services.docs_url)))
	}
}

/// `!join <mcname>`: bring the bot into the chatter's own channel.
pub struct JoinCommand;

#[async_trait::async_trait]
impl Command for JoinCommand {
	fn name(&self) -> &'static str {
		"join"
	}

	async fn handle(&self, ctx: &CommandContext<'_>, invocation: &Invocation) -> Result<Option<String>, CommandError> {
		let mc_name = mc_name_arg(invocation, "join")?;
		let Some(channel) = ctx.requester_channel() else {
			return Ok(None);
		};
		let store = &ctx.services.store;

		if let Some(existing) = store.get_channel(&channel).await?
			&& existing.subscribed
		{
			return Err(CommandError::User(format!(
				"⚠️ {channel} already joined. Use !link to update your Minecraft username, or !leave to remove Mobibot from your channel."
			)));
		}

		store.upsert_channel(&channel, Some(&mc_name)).await.map_err(|e| {
			write_failed(
				&channel,
				"join",
				e,
				format!("⚠️ Could not join {channel} due to a database error."),
			)
		})?;

		if let Err(e) = ctx.services.chat.subscribe(&channel).await {
			warn!(%channel, error = %e, "join: chat subscription failed");
			return Err(CommandError::User(format!("⚠️ Could not join {channel}'s chat.")));
		}

		store.set_subscribed(&channel, true).await.map_err(|e| {
			write_failed(
				&channel,
				"join",
				e,
				format!("⚠️ Could not join {channel} due to a database error."),
			)
		})?;

		Ok(Some(format!(
			"✅ Mobibot joined {channel} with Minecraft username: {mc_name}"
		)))
	}
}

/// `!leave`: remove the bot from the chatter's own channel.
pub struct LeaveCommand;

#[async_trait::async_trait]
impl Command for LeaveCommand {
	fn name(&self) -> &'static str {
		"leave"
	}

	async fn handle(&self, ctx: &CommandContext<'_>, _invocation: &Invocation) -> Result<Option<String>, CommandError> {
		let Some(channel) = ctx.requester_channel() else {
			return Ok(None);
		};
		if channel == ctx.services.hq_channel {
			return Err(CommandError::User("⚠️ Cannot leave the HQ channel.".to_string()));
		}

		let store = &ctx.services.store;
		let Some(existing) = store.get_channel(&channel).await? else {
			return Ok(None);
		};

		if existing.subscribed
			&& let Err(e) = ctx.services.chat.unsubscribe(&channel).await
		{
			warn!(%channel, error = %e, "leave: chat unsubscribe failed");
			return Err(CommandError::User(format!(
				"⚠️ Could not leave {channel} due to an error."
			)));
		}

		let removed = store.remove_channel(&channel).await.map_err(|e| {
			write_failed(
				&channel,
				"leave",
				e,
				format!("⚠️ Could not leave {channel} due to an error."),
			)
		})?;

		if !removed {
			warn!(%channel, "leave: unsubscribed but channel was already gone from the store");
			return Ok(None);
		}
		Ok(Some(format!("❌ Mobibot left {channel}")))
	}
}

/// `!link <mcname>`: set the Minecraft name for the chatter's channel.
pub struct LinkCommand;

#[async_trait::async_trait]
impl Command for LinkCommand {
	fn name(&self) -> &'static str {
		"link"
	}

	async fn handle(&self, ctx: &CommandContext<'_>, invocation: &Invocation) -> Result<Option<String>, CommandError> {
		let mc_name = mc_name_arg(invocation, "link")?;
		let Some(channel) = ctx.requester_channel() else {
			return Ok(None);
		};

		let row = ctx
			.services
			.store
			.upsert_channel(&channel, Some(&mc_name))
			.await
			.map_err(|e| {
				write_failed(
					&channel,
					"link",
					e,
					"⚠️ Could not link Minecraft username due to a database error.".to_string(),
				)
			})?;

		let hint = if row.subscribed {
			""
		} else {
			". Please use !join if you want Mobibot to join your chat"
		};
		Ok(Some(format!("✅ Linked Minecraft username {mc_name} to {channel}{hint}")))
	}
}

/// `!unlink`: clear the Minecraft name for the chatter's channel.
pub struct UnlinkCommand;

#[async_trait::async_trait]
impl Command for UnlinkCommand {
	fn name(&self) -> &'static str {
		"unlink"
	}

	async fn handle(&self, ctx: &CommandContext<'_>, _invocation: &Invocation) -> Result<Option<String>, CommandError> {
		let Some(channel) = ctx.requester_channel() else {
			return Ok(None);
		};
		let store = &ctx.services.store;

		let Some(mc_name) = store.get_mc_name(&channel).await? else {
			return Err(CommandError::User(format!(
				"⚠️ No linked Minecraft username to {channel}"
			)));
		};

		let row = store.upsert_channel(&channel, None).await.map_err(|e| {
			write_failed(
				&channel,
				"unlink",
				e,
				"⚠️ Could not unlink Minecraft username due to a database error.".to_string(),
			)
		})?;

		let hint = if row.subscribed {
			". Please use !leave if you want Mobibot to leave your chat"
		} else {
			""
		};
		Ok(Some(format!("❌ Unlinked {mc_name} for {channel}{hint}")))
	}
}
