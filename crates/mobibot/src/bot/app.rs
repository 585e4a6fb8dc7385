#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, anyhow};
use mobibot_domain::ChannelLogin;
use mobibot_eventsub::{ChatTags, EventSubClient};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::bot::commands::{CommandRouter, Services};
use crate::bot::store::ChannelStore;
use crate::config::BotSettings;

/// A chat message queued for the command router.
#[derive(Debug, Clone)]
struct ChatLine {
	channel: ChannelLogin,
	tags: ChatTags,
	text: String,
}

/// One run of the bot on top of a single [`EventSubClient`].
pub struct App {
	client: EventSubClient,
	store: Arc<dyn ChannelStore>,
	settings: BotSettings,
}

impl App {
	pub fn new(client: EventSubClient, store: Arc<dyn ChannelStore>, settings: BotSettings) -> Self {
		Self {
			client,
			store,
			settings,
		}
	}

	/// Connect, join every stored channel and answer commands.
	///
	/// Returns `Ok` when `shutdown` flips to true and `Err` when the session
	/// reports a fatal error.
	pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
		let mut errors = self.client.errors();

		let (lines_tx, lines_rx) = mpsc::channel(self.settings.command_queue_capacity.max(1));
		self.client.on_chat_message(move |channel, tags, text| {
			let Ok(channel) = ChannelLogin::new(channel) else {
				debug!(%channel, "chat line from unparseable channel dropped");
				return;
			};
			let line = ChatLine {
				channel,
				tags: tags.clone(),
				text: text.to_string(),
			};
			if let Err(mpsc::error::TrySendError::Full(line)) = lines_tx.try_send(line) {
				metrics::counter!("mobibot_chat_lines_dropped_total").increment(1);
				warn!(channel = %line.channel, "command queue full; chat line dropped");
			}
		});

		let router = CommandRouter::new(Services {
			store: self.store.clone(),
			chat: Arc::new(self.client.clone()),
			hq_channel: self.settings.hq_channel.clone(),
			docs_url: self.settings.docs_url.clone(),
		});
		let router_task = tokio::spawn(route_chat(router, self.client.clone(), lines_rx));

		let result = self.serve(&mut errors, &mut shutdown).await;
		router_task.abort();
		self.client.shutdown().await;
		result
	}

	async fn serve(
		&self,
		errors: &mut broadcast::Receiver<mobibot_eventsub::FatalError>,
		shutdown: &mut watch::Receiver<bool>,
	) -> anyhow::Result<()> {
		if *shutdown.borrow() {
			return Ok(());
		}

		tokio::select! {
			res = self.client.connect() => res.context("eventsub connect")?,
			_ = wait_for_shutdown(shutdown) => {
				info!("shutdown requested before the session was ready");
				return Ok(());
			}
		}
		info!("eventsub session ready");

		self.join_stored_channels().await?;

		loop {
			tokio::select! {
				err = errors.recv() => match err {
					Ok(fatal) => return Err(anyhow!(fatal)),
					Err(broadcast::error::RecvError::Lagged(n)) => {
						warn!(skipped = n, "fatal error receiver lagged");
					}
					Err(broadcast::error::RecvError::Closed) => {
						return Err(anyhow!("eventsub session ended"));
					}
				},
				_ = wait_for_shutdown(shutdown) => {
					info!("shutdown requested");
					return Ok(());
				}
			}
		}
	}

	/// Make sure HQ is stored, then subscribe every stored channel.
	async fn join_stored_channels(&self) -> anyhow::Result<()> {
		let hq = &self.settings.hq_channel;
		let existing = self.store.get_channel(hq).await.context("load hq channel")?;

		if existing.as_ref().and_then(|r| r.mc_name.as_ref()).is_none() {
			self.store
				.upsert_channel(hq, Some(&self.settings.hq_mc_name))
				.await
				.context("store hq channel")?;
		}
		if !existing.is_some_and(|r| r.subscribed) {
			self.store.set_subscribed(hq, true).await.context("mark hq subscribed")?;
		}

		let channels = self.store.list_channels().await.context("list stored channels")?;
		let mut joined = 0usize;
		for channel in &channels {
			match self.client.subscribe(channel).await {
				Ok(()) => joined += 1,
				Err(e) => warn!(%channel, error = %e, "failed to join stored channel"),
			}
		}
		info!(joined, stored = channels.len(), "joined stored channels");
		Ok(())
	}
}

/// Resolves once the flag is true or the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
	let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn route_chat(router: CommandRouter, client: EventSubClient, mut lines: mpsc::Receiver<ChatLine>) {
	while let Some(line) = lines.recv().await {
		let Some(reply) = router.dispatch(&line.channel, &line.tags, &line.text).await else {
			continue;
		};
		if let Err(e) = client.send(&line.channel, &reply).await {
			warn!(channel = %line.channel, error = %e, "failed to send command reply");
		}
	}
}
