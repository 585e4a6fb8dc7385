#![forbid(unsafe_code)]

use std::sync::Arc;

use mobibot_domain::ChannelLogin;
use mobibot_eventsub::{ChatTags, EventSubClient, EventSubError};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::bot::store::ChannelStore;

mod builtin;

pub use builtin::{HelpCommand, JoinCommand, LeaveCommand, LinkCommand, PingCommand, UnlinkCommand};

#[derive(Debug, Error)]
pub enum CommandError {
	/// Sent back to chat as-is.
	#[error("{0}")]
	User(String),

	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
	/// `!cmd`: about the channel's linked player.
	Bang,
	/// `+cmd`: about the chatter (or a named player).
	Plus,
}

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
	pub prefix: Prefix,
	/// Lowercased.
	pub name: String,
	/// Whitespace-separated, case preserved.
	pub args: Vec<String>,
}

impl Invocation {
	/// `None` unless `text` starts with `!` or `+` followed by a name.
	pub fn parse(text: &str) -> Option<Self> {
		let text = text.trim();
		let prefix = match text.chars().next()? {
			'!' => Prefix::Bang,
			'+' => Prefix::Plus,
			_ => return None,
		};

		let mut parts = text[1..].split_whitespace();
		let name = parts.next()?.to_lowercase();
		Some(Self {
			prefix,
			name,
			args: parts.map(str::to_string).collect(),
		})
	}

	pub fn arg(&self, i: usize) -> Option<&str> {
		self.args.get(i).map(String::as_str)
	}
}

/// Subscription control the join/leave commands need.
#[async_trait::async_trait]
pub trait ChatControl: Send + Sync {
	async fn subscribe(&self, channel: &ChannelLogin) -> Result<(), EventSubError>;
	async fn unsubscribe(&self, channel: &ChannelLogin) -> Result<(), EventSubError>;
}

#[async_trait::async_trait]
impl ChatControl for EventSubClient {
	async fn subscribe(&self, channel: &ChannelLogin) -> Result<(), EventSubError> {
		EventSubClient::subscribe(self, channel).await
	}

	async fn unsubscribe(&self, channel: &ChannelLogin) -> Result<(), EventSubError> {
		EventSubClient::unsubscribe(self, channel).await
	}
}

/// Shared by every command invocation.
pub struct Services {
	pub store: Arc<dyn ChannelStore>,
	pub chat: Arc<dyn ChatControl>,
	pub hq_channel: ChannelLogin,
	pub docs_url: String,
}

pub struct CommandContext<'a> {
	pub services: &'a Services,
	/// Channel the message was posted in.
	pub channel: &'a ChannelLogin,
	/// Login of the chatter.
	pub chatter: &'a str,
}

impl CommandContext<'_> {
	/// The chatter's own channel, which join/leave/link act on.
	pub fn requester_channel(&self) -> Option<ChannelLogin> {
		ChannelLogin::new(self.chatter).ok()
	}
}

#[async_trait::async_trait]
pub trait Command: Send + Sync {
	fn name(&self) -> &'static str;

	fn aliases(&self) -> &'static [&'static str] {
		&[]
	}

	/// `Ok(Some(reply))` is sent to the channel the command came from.
	async fn handle(&self, ctx: &CommandContext<'_>, invocation: &Invocation) -> Result<Option<String>, CommandError>;
}

pub struct CommandRouter {
	services: Services,
	commands: Vec<Box<dyn Command>>,
}

impl CommandRouter {
	/// Router with the built-in commands.
	pub fn new(services: Services) -> Self {
		Self {
			services,
			commands: Vec::new(),
		}
		.with_command(PingCommand)
		.with_command(HelpCommand)
		.with_command(JoinCommand)
		.with_command(LeaveCommand)
		.with_command(LinkCommand)
		.with_command(UnlinkCommand)
	}

	pub fn with_command(mut self, command: impl Command + 'static) -> Self {
		self.commands.push(Box::new(command));
		self
	}

	/// First command whose name or alias is `name`.
	pub fn find(&self, name: &str) -> Option<&dyn Command> {
		self.commands
			.iter()
			.find(|c| c.name() == name || c.aliases().iter().any(|a| *a == name))
			.map(|c| c.as_ref())
	}

	/// Handle one chat line. Returns the reply to post, if any.
	pub async fn dispatch(&self, channel: &ChannelLogin, tags: &ChatTags, text: &str) -> Option<String> {
		let invocation = Invocation::parse(text)?;
		let Some(command) = self.find(&invocation.name) else {
			debug!(%channel, command = %invocation.name, "unknown command");
			return None;
		};

		metrics::counter!("mobibot_commands_total").increment(1);
		let ctx = CommandContext {
			services: &self.services,
			channel,
			chatter: &tags.username,
		};

		match command.handle(&ctx, &invocation).await {
			Ok(reply) => {
				info!(%channel, chatter = %tags.username, command = command.name(), "command handled");
				reply
			}
			Err(CommandError::User(message)) => {
				debug!(%channel, command = command.name(), %message, "command refused");
				Some(message)
			}
			Err(CommandError::Internal(e)) => {
				error!(%channel, command = command.name(), error = ?e, "command failed");
				metrics::counter!("mobibot_command_failures_total").increment(1);
				None
			}
		}
	}
}
