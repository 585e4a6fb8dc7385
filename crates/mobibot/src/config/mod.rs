#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use mobibot_domain::{ChannelLogin, McName};
use mobibot_eventsub::{
	DEFAULT_EVENTSUB_WS_URL, DEFAULT_HELIX_BASE_URL, DEFAULT_OAUTH_BASE_URL, EventSubConfig, ReconnectPolicy,
	SecretString,
};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_HQ_CHANNEL: &str = "mobiusspeedruns";
pub const DEFAULT_HQ_MC_NAME: &str = "Inverted_Mobius";
pub const DEFAULT_DOCS_URL: &str = "https://github.com/Mobius-Speedruns/Mobibot/wiki";
const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 256;

/// Default config path: `~/.mobibot/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".mobibot").join("config.toml"))
}

/// Load the bot config from TOML, then apply process env overrides.
pub fn load_bot_config_from_path(path: &Path) -> anyhow::Result<BotConfig> {
	load_bot_config_with_env(path, |key| std::env::var(key).ok())
}

/// Same as [`load_bot_config_from_path`] with an explicit env lookup.
pub fn load_bot_config_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<BotConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = BotConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg, env)?;
	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct BotConfig {
	pub twitch: TwitchSettings,
	pub bot: BotSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	pub refresh_token: Option<SecretString>,
	/// Twitch user id of the bot account.
	pub bot_user_id: Option<String>,

	pub eventsub_ws_url: Option<String>,
	pub helix_base_url: Option<String>,
	pub oauth_base_url: Option<String>,

	pub request_timeout: Option<Duration>,
	pub reconnect_base_delay: Option<Duration>,
	pub reconnect_max_delay: Option<Duration>,
	pub max_reconnect_attempts: Option<u32>,

	/// login -> broadcaster id.
	pub broadcaster_id_overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct BotSettings {
	/// Channel that is always joined and cannot be left.
	pub hq_channel: ChannelLogin,
	pub hq_mc_name: McName,
	pub docs_url: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Chat messages queued for the command router before new ones are dropped.
	pub command_queue_capacity: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// `sqlite:` or `postgres:` URL. Without one, channels live in memory.
	pub database_url: Option<String>,
}

impl TwitchSettings {
	/// Build the EventSub client config. Fails when a credential is missing.
	pub fn to_eventsub_config(&self) -> anyhow::Result<EventSubConfig> {
		let client_id = self
			.client_id
			.clone()
			.ok_or_else(|| anyhow!("twitch client_id is not configured"))?;
		let client_secret = self
			.client_secret
			.clone()
			.ok_or_else(|| anyhow!("twitch client_secret is not configured"))?;
		let refresh_token = self
			.refresh_token
			.clone()
			.ok_or_else(|| anyhow!("twitch refresh_token is not configured"))?;
		let bot_user_id = self
			.bot_user_id
			.clone()
			.ok_or_else(|| anyhow!("twitch bot_user_id is not configured"))?;

		let mut cfg = EventSubConfig::new(client_id, client_secret, refresh_token, bot_user_id);
		cfg.eventsub_ws_url = self
			.eventsub_ws_url
			.clone()
			.unwrap_or_else(|| DEFAULT_EVENTSUB_WS_URL.to_string());
		cfg.helix_base_url = self
			.helix_base_url
			.clone()
			.unwrap_or_else(|| DEFAULT_HELIX_BASE_URL.to_string());
		cfg.oauth_base_url = self
			.oauth_base_url
			.clone()
			.unwrap_or_else(|| DEFAULT_OAUTH_BASE_URL.to_string());
		if let Some(timeout) = self.request_timeout {
			cfg.request_timeout = timeout;
		}

		let defaults = ReconnectPolicy::default();
		cfg.reconnect = ReconnectPolicy {
			base_delay: self.reconnect_base_delay.unwrap_or(defaults.base_delay),
			max_delay: self.reconnect_max_delay.unwrap_or(defaults.max_delay),
			max_attempts: self.max_reconnect_attempts.unwrap_or(defaults.max_attempts),
		};

		for (login, id) in &self.broadcaster_id_overrides {
			match ChannelLogin::new(login) {
				Ok(login) => cfg.broadcaster_id_overrides.push((login, id.clone())),
				Err(e) => warn!(%login, error = %e, "twitch config: ignoring invalid broadcaster override"),
			}
		}

		Ok(cfg)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	bot: FileBotSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	refresh_token: Option<String>,
	bot_user_id: Option<String>,
	eventsub_ws_url: Option<String>,
	helix_base_url: Option<String>,
	oauth_base_url: Option<String>,

	request_timeout_secs: Option<u64>,
	reconnect_base_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	max_reconnect_attempts: Option<u32>,

	#[serde(default)]
	broadcaster_id_overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBotSettings {
	hq_channel: Option<String>,
	hq_mc_name: Option<String>,
	docs_url: Option<String>,
	metrics_bind: Option<String>,
	command_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl BotConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let twitch = TwitchSettings {
			client_id: non_blank(file.twitch.client_id),
			client_secret: non_blank(file.twitch.client_secret).map(SecretString::new),
			refresh_token: non_blank(file.twitch.refresh_token).map(SecretString::new),
			bot_user_id: non_blank(file.twitch.bot_user_id),
			eventsub_ws_url: non_blank(file.twitch.eventsub_ws_url),
			helix_base_url: non_blank(file.twitch.helix_base_url),
			oauth_base_url: non_blank(file.twitch.oauth_base_url),
			request_timeout: file
				.twitch
				.request_timeout_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs),
			reconnect_base_delay: file.twitch.reconnect_base_delay_ms.map(Duration::from_millis),
			reconnect_max_delay: file.twitch.reconnect_max_delay_ms.map(Duration::from_millis),
			max_reconnect_attempts: file.twitch.max_reconnect_attempts.filter(|v| *v > 0),
			broadcaster_id_overrides: file.twitch.broadcaster_id_overrides,
		};

		let bot = BotSettings {
			hq_channel: ChannelLogin::new(non_blank(file.bot.hq_channel).as_deref().unwrap_or(DEFAULT_HQ_CHANNEL))
				.context("bot.hq_channel")?,
			hq_mc_name: McName::new(non_blank(file.bot.hq_mc_name).as_deref().unwrap_or(DEFAULT_HQ_MC_NAME))
				.context("bot.hq_mc_name")?,
			docs_url: non_blank(file.bot.docs_url).unwrap_or_else(|| DEFAULT_DOCS_URL.to_string()),
			metrics_bind: non_blank(file.bot.metrics_bind),
			command_queue_capacity: file
				.bot
				.command_queue_capacity
				.filter(|v| *v > 0)
				.unwrap_or(DEFAULT_COMMAND_QUEUE_CAPACITY),
		};

		Ok(Self {
			twitch,
			bot,
			persistence: PersistenceSettings {
				database_url: non_blank(file.persistence.database_url),
			},
		})
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// First non-blank value among `keys`, with the key that supplied it.
fn first_env<'k>(env: &impl Fn(&str) -> Option<String>, keys: &[&'k str]) -> Option<(&'k str, String)> {
	keys.iter()
		.find_map(|key| non_blank(env(key)).map(|v| (*key, v)))
}

fn apply_env_overrides(cfg: &mut BotConfig, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
	if let Some((key, v)) = first_env(&env, &["MOBIBOT_TWITCH_CLIENT_ID", "CLIENT_ID"]) {
		cfg.twitch.client_id = Some(v);
		info!(env = key, "twitch config: client_id overridden by env");
	}

	if let Some((key, v)) = first_env(&env, &["MOBIBOT_TWITCH_CLIENT_SECRET", "CLIENT_SECRET"]) {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!(env = key, "twitch config: client_secret overridden by env");
	}

	if let Some((key, v)) = first_env(&env, &["MOBIBOT_TWITCH_REFRESH_TOKEN", "REFRESH_TOKEN"]) {
		cfg.twitch.refresh_token = Some(SecretString::new(v));
		info!(env = key, "twitch config: refresh_token overridden by env");
	}

	if let Some((key, v)) = first_env(&env, &["MOBIBOT_TWITCH_BOT_ID", "BOT_ID"]) {
		cfg.twitch.bot_user_id = Some(v);
		info!(env = key, "twitch config: bot_user_id overridden by env");
	}

	if let Some((key, v)) = first_env(&env, &["MOBIBOT_TWITCH_EVENTSUB_WS_URL"]) {
		cfg.twitch.eventsub_ws_url = Some(v);
		info!(env = key, "twitch config: eventsub_ws_url overridden by env");
	}

	if let Some((key, v)) = first_env(&env, &["MOBIBOT_TWITCH_MAX_RECONNECT_ATTEMPTS"]) {
		match v.parse::<u32>() {
			Ok(attempts) if attempts > 0 => {
				cfg.twitch.max_reconnect_attempts = Some(attempts);
				info!(env = key, attempts, "twitch config: max_reconnect_attempts overridden by env");
			}
			_ => warn!(env = key, value = %v, "twitch config: ignoring invalid max_reconnect_attempts"),
		}
	}

	if let Some((key, v)) = first_env(&env, &["MOBIBOT_DATABASE_URL", "PG_CONNECTION"]) {
		cfg.persistence.database_url = Some(v);
		info!(env = key, "persistence: database_url overridden by env");
	}

	if let Some((key, v)) = first_env(&env, &["MOBIBOT_HQ_CHANNEL"]) {
		cfg.bot.hq_channel = ChannelLogin::new(&v).with_context(|| format!("{key}={v:?}"))?;
		info!(env = key, hq_channel = %cfg.bot.hq_channel, "bot config: hq_channel overridden by env");
	}

	if let Some((key, v)) = first_env(&env, &["MOBIBOT_METRICS_BIND"]) {
		cfg.bot.metrics_bind = Some(v);
		info!(env = key, "bot config: metrics_bind overridden by env");
	}

	if let (Some(base), Some(max)) = (cfg.twitch.reconnect_base_delay, cfg.twitch.reconnect_max_delay)
		&& base > max
	{
		warn!(
			base_ms = base.as_millis(),
			max_ms = max.as_millis(),
			"twitch config: reconnect_base_delay > reconnect_max_delay; swapping"
		);
		cfg.twitch.reconnect_base_delay = Some(max);
		cfg.twitch.reconnect_max_delay = Some(base);
	}

	Ok(())
}
