#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use mobibot_domain::{ChannelLogin, McName};
use parking_lot::Mutex;

/// A joined or linked channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
	pub name: ChannelLogin,
	pub mc_name: Option<McName>,
	/// True when the bot should sit in this channel's chat.
	pub subscribed: bool,
}

/// Channel ↔ Minecraft name links and the set of channels to join at startup.
#[async_trait::async_trait]
pub trait ChannelStore: Send + Sync {
	/// Subscribed channels, oldest first.
	async fn list_channels(&self) -> anyhow::Result<Vec<ChannelLogin>>;

	async fn get_channel(&self, channel: &ChannelLogin) -> anyhow::Result<Option<ChannelRecord>>;

	async fn get_mc_name(&self, channel: &ChannelLogin) -> anyhow::Result<Option<McName>> {
		Ok(self.get_channel(channel).await?.and_then(|r| r.mc_name))
	}

	/// Create the row or replace its Minecraft name. New rows start unsubscribed.
	async fn upsert_channel(&self, channel: &ChannelLogin, mc_name: Option<&McName>) -> anyhow::Result<ChannelRecord>;

	/// Returns false when the channel has no row.
	async fn set_subscribed(&self, channel: &ChannelLogin, subscribed: bool) -> anyhow::Result<bool>;

	/// Returns false when nothing was removed.
	async fn remove_channel(&self, channel: &ChannelLogin) -> anyhow::Result<bool>;
}

/// Used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryChannelStore {
	rows: Mutex<Vec<ChannelRecord>>,
}

#[async_trait::async_trait]
impl ChannelStore for MemoryChannelStore {
	async fn list_channels(&self) -> anyhow::Result<Vec<ChannelLogin>> {
		Ok(self
			.rows
			.lock()
			.iter()
			.filter(|r| r.subscribed)
			.map(|r| r.name.clone())
			.collect())
	}

	async fn get_channel(&self, channel: &ChannelLogin) -> anyhow::Result<Option<ChannelRecord>> {
		Ok(self.rows.lock().iter().find(|r| &r.name == channel).cloned())
	}

	async fn upsert_channel(&self, channel: &ChannelLogin, mc_name: Option<&McName>) -> anyhow::Result<ChannelRecord> {
		let mut rows = self.rows.lock();
		if let Some(row) = rows.iter_mut().find(|r| &r.name == channel) {
			row.mc_name = mc_name.cloned();
			return Ok(row.clone());
		}

		let row = ChannelRecord {
			name: channel.clone(),
			mc_name: mc_name.cloned(),
			subscribed: false,
		};
		rows.push(row.clone());
		Ok(row)
	}

	async fn set_subscribed(&self, channel: &ChannelLogin, subscribed: bool) -> anyhow::Result<bool> {
		let mut rows = self.rows.lock();
		let Some(row) = rows.iter_mut().find(|r| &r.name == channel) else {
			return Ok(false);
		};
		row.subscribed = subscribed;
		Ok(true)
	}

	async fn remove_channel(&self, channel: &ChannelLogin) -> anyhow::Result<bool> {
		let mut rows = self.rows.lock();
		let before = rows.len();
		rows.retain(|r| &r.name != channel);
		Ok(rows.len() != before)
	}
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// `channels` table in SQLite or Postgres. Migrations run on connect.
#[derive(Clone)]
pub struct SqlChannelStore {
	backend: SqlBackend,
}

type ChannelRow = (String, Option<String>, bool);

fn record_from_row((name, mc_name, subscribed): ChannelRow) -> anyhow::Result<ChannelRecord> {
	Ok(ChannelRecord {
		name: ChannelLogin::new(&name).with_context(|| format!("stored channel name {name:?}"))?,
		mc_name: mc_name
			.filter(|s| !s.trim().is_empty())
			.map(|s| McName::new(&s).with_context(|| format!("stored mc_name {s:?}")))
			.transpose()?,
		subscribed,
	})
}

impl SqlChannelStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

#[async_trait::async_trait]
impl ChannelStore for SqlChannelStore {
	async fn list_channels(&self) -> anyhow::Result<Vec<ChannelLogin>> {
		let names: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT name FROM channels WHERE subscribed = ? ORDER BY id ASC")
				.bind(true)
				.fetch_all(pool)
				.await
				.context("list channels (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT name FROM channels WHERE subscribed = $1 ORDER BY id ASC")
				.bind(true)
				.fetch_all(pool)
				.await
				.context("list channels (postgres)")?,
		};

		names
			.into_iter()
			.map(|(name,)| ChannelLogin::new(&name).with_context(|| format!("stored channel name {name:?}")))
			.collect()
	}

	async fn get_channel(&self, channel: &ChannelLogin) -> anyhow::Result<Option<ChannelRecord>> {
		let row: Option<ChannelRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT name, mc_name, subscribed FROM channels WHERE name = ?")
				.bind(channel.as_str())
				.fetch_optional(pool)
				.await
				.context("get channel (sqlite)")?,
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT name, mc_name, subscribed FROM channels WHERE name = $1")
					.bind(channel.as_str())
					.fetch_optional(pool)
					.await
					.context("get channel (postgres)")?
			}
		};

		row.map(record_from_row).transpose()
	}

	async fn upsert_channel(&self, channel: &ChannelLogin, mc_name: Option<&McName>) -> anyhow::Result<ChannelRecord> {
		let mc_name = mc_name.map(McName::as_str);
		let row: ChannelRow = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"INSERT INTO channels (name, mc_name, subscribed, created_at, updated_at) \
				VALUES (?, ?, 0, strftime('%s','now'), strftime('%s','now')) \
				ON CONFLICT (name) DO UPDATE SET mc_name = excluded.mc_name, updated_at = excluded.updated_at \
				RETURNING name, mc_name, subscribed",
			)
			.bind(channel.as_str())
			.bind(mc_name)
			.fetch_one(pool)
			.await
			.context("upsert channel (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"INSERT INTO channels (name, mc_name, subscribed, created_at, updated_at) \
				VALUES ($1, $2, FALSE, NOW(), NOW()) \
				ON CONFLICT (name) DO UPDATE SET mc_name = EXCLUDED.mc_name, updated_at = NOW() \
				RETURNING name, mc_name, subscribed",
			)
			.bind(channel.as_str())
			.bind(mc_name)
			.fetch_one(pool)
			.await
			.context("upsert channel (postgres)")?,
		};

		record_from_row(row)
	}

	async fn set_subscribed(&self, channel: &ChannelLogin, subscribed: bool) -> anyhow::Result<bool> {
		let result = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(
				"UPDATE channels SET subscribed = ?, updated_at = strftime('%s','now') WHERE name = ?",
			)
			.bind(subscribed)
			.bind(channel.as_str())
			.execute(pool)
			.await
			.context("set subscribed (sqlite)")?
			.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("UPDATE channels SET subscribed = $1, updated_at = NOW() WHERE name = $2")
				.bind(subscribed)
				.bind(channel.as_str())
				.execute(pool)
				.await
				.context("set subscribed (postgres)")?
				.rows_affected(),
		};

		Ok(result > 0)
	}

	async fn remove_channel(&self, channel: &ChannelLogin) -> anyhow::Result<bool> {
		let removed = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM channels WHERE name = ?")
				.bind(channel.as_str())
				.execute(pool)
				.await
				.context("remove channel (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM channels WHERE name = $1")
				.bind(channel.as_str())
				.execute(pool)
				.await
				.context("remove channel (postgres)")?
				.rows_affected(),
		};

		Ok(removed > 0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn login(s: &str) -> ChannelLogin {
		ChannelLogin::new(s).expect("valid login")
	}

	fn mc(s: &str) -> McName {
		McName::new(s).expect("valid mc name")
	}

	async fn exercise(store: &dyn ChannelStore) {
		assert!(store.list_channels().await.expect("list").is_empty());
		assert!(store.get_channel(&login("foo")).await.expect("get").is_none());

		let row = store.upsert_channel(&login("foo"), Some(&mc("Foo_MC"))).await.expect("upsert");
		assert_eq!(
			row,
			ChannelRecord {
				name: login("foo"),
				mc_name: Some(mc("Foo_MC")),
				subscribed: false,
			}
		);
		// linked but not joined
		assert!(store.list_channels().await.expect("list").is_empty());

		store.upsert_channel(&login("bar"), None).await.expect("upsert");
		assert!(store.set_subscribed(&login("bar"), true).await.expect("subscribe"));
		assert!(store.set_subscribed(&login("foo"), true).await.expect("subscribe"));
		assert!(!store.set_subscribed(&login("ghost"), true).await.expect("missing"));
		assert_eq!(store.list_channels().await.expect("list"), vec![login("foo"), login("bar")]);

		let row = store.upsert_channel(&login("foo"), None).await.expect("unlink");
		assert!(row.subscribed, "upsert keeps the subscribed flag");
		assert_eq!(store.get_mc_name(&login("foo")).await.expect("mc"), None);

		assert!(store.remove_channel(&login("foo")).await.expect("remove"));
		assert!(!store.remove_channel(&login("foo")).await.expect("remove again"));
		assert_eq!(store.list_channels().await.expect("list"), vec![login("bar")]);
	}

	#[tokio::test]
	async fn memory_store_semantics() {
		exercise(&MemoryChannelStore::default()).await;
	}

	#[tokio::test]
	async fn sqlite_store_semantics() {
		let dir = tempfile::tempdir().expect("temp dir");
		let url = format!("sqlite://{}?mode=rwc", dir.path().join("mobibot.db").display());
		let store = SqlChannelStore::connect(&url).await.expect("connect sqlite");
		exercise(&store).await;

		// migrations are idempotent across reconnects
		let again = SqlChannelStore::connect(&url).await.expect("reconnect");
		assert_eq!(again.list_channels().await.expect("list"), vec![login("bar")]);
	}

	#[tokio::test]
	async fn unsupported_url_is_rejected() {
		let Err(err) = SqlChannelStore::connect("mysql://localhost/db").await else {
			panic!("mysql should be rejected");
		};
		assert!(err.to_string().contains("unsupported database_url"));
	}
}
