#![forbid(unsafe_code)]

mod bot;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use mobibot_eventsub::EventSubClient;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bot::app::App;
use crate::bot::store::{ChannelStore, MemoryChannelStore, SqlChannelStore};
use crate::bot::supervisor::run_with_backoff;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: mobibot [--config path/to/config.toml]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.mobibot/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,mobibot=debug,mobibot_eventsub=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("mobibot");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn open_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn ChannelStore>> {
	match database_url {
		Some(url) => {
			let store = SqlChannelStore::connect(url).await?;
			info!("channel store: sql");
			Ok(Arc::new(store))
		}
		None => {
			warn!("no database_url configured; joined channels will not survive a restart");
			Ok(Arc::new(MemoryChannelStore::default()))
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let bot_cfg = crate::config::load_bot_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded bot config (toml + env overrides)");

	init_metrics(bot_cfg.bot.metrics_bind.as_deref());

	let eventsub_cfg = bot_cfg.twitch.to_eventsub_config()?;
	let store = open_store(bot_cfg.persistence.database_url.as_deref()).await?;

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!(error = %e, "failed to listen for ctrl-c");
			return;
		}
		info!("ctrl-c received; shutting down");
		let _ = shutdown_tx.send(true);
	});

	info!(hq = %bot_cfg.bot.hq_channel, "mobibot starting");
	run_with_backoff(shutdown_rx, |attempt, shutdown| {
		let eventsub_cfg = eventsub_cfg.clone();
		let store = store.clone();
		let settings = bot_cfg.bot.clone();
		async move {
			info!(attempt, "starting eventsub session");
			let client = EventSubClient::new(eventsub_cfg)?;
			App::new(client, store, settings).run(shutdown).await
		}
	})
	.await;

	Ok(())
}
