#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::tungstenite::protocol::frame::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::{debug, warn};
use url::Url;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<TwitchWs>> + Send + Sync>;

/// Close code surfaced when the socket dies without a close frame.
pub(crate) const ABNORMAL_CLOSE: u16 = 1006;

const EVENT_BUFFER: usize = 256;
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one opened socket. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

impl SocketId {
	fn next() -> Self {
		Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for SocketId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ws#{}", self.0)
	}
}

/// Events surfaced by an open socket, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
	Open,
	Message(String),
	Close { code: u16, reason: String },
	Error(String),
}

/// Controller → socket requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketCommand {
	/// Switch the watchdog from the welcome timeout to the negotiated keepalive.
	SetKeepaliveTimeout(Duration),
	/// Send a close frame with this code and stop.
	Close(u16),
}

/// One managed WebSocket. Dropping the handle closes the socket.
#[derive(Debug)]
pub struct SocketHandle {
	id: SocketId,
	events: mpsc::Receiver<SocketEvent>,
	commands: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketHandle {
	pub fn new(events: mpsc::Receiver<SocketEvent>, commands: mpsc::UnboundedSender<SocketCommand>) -> Self {
		Self {
			id: SocketId::next(),
			events,
			commands,
		}
	}

	pub fn id(&self) -> SocketId {
		self.id
	}

	/// Next event; `None` once the socket task is gone.
	pub async fn recv(&mut self) -> Option<SocketEvent> {
		self.events.recv().await
	}

	pub fn set_keepalive_timeout(&self, keepalive: Duration) {
		let _ = self.commands.send(SocketCommand::SetKeepaliveTimeout(keepalive));
	}

	pub fn close(&self, code: u16) {
		let _ = self.commands.send(SocketCommand::Close(code));
	}
}

/// Opens sockets. Never reconnects on its own.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
	async fn open(&self, url: &Url) -> anyhow::Result<SocketHandle>;
}

/// `tokio-tungstenite` transport with an inactivity watchdog per socket.
#[derive(Clone)]
pub struct TungsteniteTransport {
	connector: WsConnector,
	welcome_timeout: Duration,
	keepalive_grace: Duration,
}

impl fmt::Debug for TungsteniteTransport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TungsteniteTransport")
			.field("welcome_timeout", &self.welcome_timeout)
			.field("keepalive_grace", &self.keepalive_grace)
			.finish_non_exhaustive()
	}
}

async fn connect_eventsub_ws(url: Url) -> anyhow::Result<TwitchWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to eventsub ws")?;
	Ok(ws)
}

impl TungsteniteTransport {
	pub fn new(welcome_timeout: Duration, keepalive_grace: Duration) -> Self {
		Self {
			connector: Arc::new(|url: Url| {
				Box::pin(async move { connect_eventsub_ws(url).await }) as BoxFuture<'static, anyhow::Result<TwitchWs>>
			}),
			welcome_timeout,
			keepalive_grace,
		}
	}

	/// Replace how sockets are dialed (proxies, custom TLS).
	pub fn with_connector(mut self, connector: WsConnector) -> Self {
		self.connector = connector;
		self
	}
}

#[async_trait::async_trait]
impl Transport for TungsteniteTransport {
	async fn open(&self, url: &Url) -> anyhow::Result<SocketHandle> {
		let ws = (self.connector)(url.clone()).await?;

		let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let handle = SocketHandle::new(events_rx, commands_tx);

		events_tx.send(SocketEvent::Open).await.context("queue open event")?;
		metrics::counter!("mobibot_eventsub_sockets_opened_total").increment(1);
		debug!(socket = %handle.id(), %url, "eventsub socket open");

		let driver = SocketDriver {
			id: handle.id(),
			ws,
			events: events_tx,
			commands: commands_rx,
			limit: self.welcome_timeout,
			keepalive_grace: self.keepalive_grace,
		};
		tokio::spawn(driver.run());

		Ok(handle)
	}
}

struct SocketDriver {
	id: SocketId,
	ws: TwitchWs,
	events: mpsc::Sender<SocketEvent>,
	commands: mpsc::UnboundedReceiver<SocketCommand>,
	limit: Duration,
	keepalive_grace: Duration,
}

impl SocketDriver {
	/// False once nobody is listening any more.
	async fn emit(&self, event: SocketEvent) -> bool {
		self.events.send(event).await.is_ok()
	}

	async fn close_quietly(&mut self, code: Option<u16>) {
		let frame = code.map(|code| CloseFrame {
			code: CloseCode::from(code),
			reason: Utf8Bytes::from_static(""),
		});
		let _ = timeout(CLOSE_FLUSH_TIMEOUT, self.ws.close(frame)).await;
	}

	async fn run(mut self) {
		let mut last_activity = Instant::now();

		loop {
			let deadline = last_activity + self.limit;

			tokio::select! {
				cmd = self.commands.recv() => match cmd {
					Some(SocketCommand::SetKeepaliveTimeout(keepalive)) => {
						self.limit = keepalive + self.keepalive_grace;
						debug!(socket = %self.id, limit = ?self.limit, "watchdog armed with session keepalive");
					}
					Some(SocketCommand::Close(code)) => {
						debug!(socket = %self.id, code, "closing eventsub socket");
						self.close_quietly(Some(code)).await;
						let _ = self.emit(SocketEvent::Close { code, reason: "closed by client".to_string() }).await;
						return;
					}
					None => {
						self.close_quietly(Some(1000)).await;
						return;
					}
				},

				msg = self.ws.next() => {
					let Some(msg) = msg else {
						let _ = self.emit(SocketEvent::Close { code: ABNORMAL_CLOSE, reason: "stream ended".to_string() }).await;
						return;
					};

					let msg = match msg {
						Ok(m) => m,
						Err(e) => {
							warn!(socket = %self.id, error = ?e, "eventsub ws read error");
							if self.emit(SocketEvent::Error(e.to_string())).await {
								let _ = self.emit(SocketEvent::Close { code: ABNORMAL_CLOSE, reason: "read error".to_string() }).await;
							}
							return;
						}
					};

					last_activity = Instant::now();

					match msg {
						Message::Text(t) => {
							if !self.emit(SocketEvent::Message(t.as_str().to_owned())).await {
								self.close_quietly(Some(1000)).await;
								return;
							}
						}
						Message::Ping(p) => {
							let _ = self.ws.send(Message::Pong(p)).await;
						}
						Message::Close(frame) => {
							let (code, reason) = match frame {
								Some(f) => (u16::from(f.code), f.reason.as_str().to_owned()),
								None => (ABNORMAL_CLOSE, "close without status".to_string()),
							};
							debug!(socket = %self.id, code, %reason, "eventsub ws closed by peer");
							let _ = self.emit(SocketEvent::Close { code, reason }).await;
							return;
						}
						Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
					}
				}

				_ = sleep_until(deadline) => {
					warn!(socket = %self.id, limit = ?self.limit, "keepalive watchdog triggered");
					metrics::counter!("mobibot_eventsub_watchdog_timeouts_total").increment(1);
					self.close_quietly(None).await;
					let _ = self.emit(SocketEvent::Close { code: ABNORMAL_CLOSE, reason: "keepalive timeout".to_string() }).await;
					return;
				}
			}
		}
	}
}
