#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use mobibot_domain::ChannelLogin;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::eventsub::{ChatNotification, InboundFrame, Revocation, WelcomeSession, decode_frame};
use crate::helix::ControlApi;
use crate::reconnect::{Decision, ReconnectController, ReconnectPolicy};
use crate::registry::{SubscriptionRegistry, subscribe_remote, unsubscribe_remote};
use crate::transport::{ABNORMAL_CLOSE, BoxFuture, SocketEvent, SocketHandle, SocketId, Transport};
use crate::{CHAT_MESSAGE_SUBSCRIPTION, ChatMessageHandler, ChatTags, EventSubError, FatalError};

#[cfg(test)]
pub(crate) mod testing;

/// Used when a welcome omits `keepalive_timeout_seconds`.
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

/// Notification ids remembered for duplicate suppression.
const RECENT_MESSAGE_IDS: usize = 512;

pub(crate) type HandlerSlot = Arc<RwLock<Option<ChatMessageHandler>>>;

type Reply<T> = oneshot::Sender<Result<T, EventSubError>>;

/// Lifecycle of the EventSub session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Disconnected,
	Connecting,
	AwaitingWelcome,
	Ready,
	Migrating,
	Closed,
}

/// Facade → controller requests.
#[derive(Debug)]
pub(crate) enum SessionControl {
	Connect { resp: Reply<()> },
	Subscribe { channel: ChannelLogin, resp: Reply<()> },
	Unsubscribe { channel: ChannelLogin, resp: Reply<()> },
	ActiveChannels { resp: oneshot::Sender<Vec<ChannelLogin>> },
	State { resp: oneshot::Sender<SessionState> },
	Shutdown { resp: oneshot::Sender<()> },
}

#[derive(Debug)]
struct Session {
	id: String,
	created_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
	Primary,
	Migration,
}

/// Bounded memory of notification ids; EventSub may redeliver.
#[derive(Debug, Default)]
struct RecentIds {
	order: VecDeque<String>,
	seen: HashSet<String>,
}

impl RecentIds {
	/// False if `id` was already seen.
	fn insert(&mut self, id: &str) -> bool {
		if self.seen.contains(id) {
			return false;
		}
		if self.order.len() >= RECENT_MESSAGE_IDS
			&& let Some(oldest) = self.order.pop_front()
		{
			self.seen.remove(&oldest);
		}
		self.order.push_back(id.to_string());
		self.seen.insert(id.to_string());
		true
	}
}

/// Completion of REST work started by the controller.
#[derive(Debug)]
enum RestDone {
	Subscribe {
		channel: ChannelLogin,
		session_id: String,
		op: u64,
		result: Result<String, EventSubError>,
		resp: Reply<()>,
	},
	Replay {
		channel: ChannelLogin,
		session_id: String,
		result: Result<String, EventSubError>,
	},
	Unsubscribe {
		channel: ChannelLogin,
		op: u64,
		result: Result<(), EventSubError>,
		resp: Option<Reply<()>>,
	},
}

/// Resubscribes still in flight for the current session.
#[derive(Debug)]
struct Replay {
	session_id: String,
	op: u64,
	remaining: BTreeSet<ChannelLogin>,
	restored: usize,
	dropped: usize,
}

/// Orders overlapping subscribe and unsubscribe calls for the same channel.
///
/// Every call gets a sequence number; a completion only applies if no later
/// call for that channel went out in the meantime.
#[derive(Debug, Default)]
struct OpLog {
	next: u64,
	subscribed: HashMap<ChannelLogin, u64>,
	unsubscribed: HashMap<ChannelLogin, u64>,
}

impl OpLog {
	fn bump(&mut self) -> u64 {
		self.next += 1;
		self.next
	}

	fn subscribe(&mut self, channel: &ChannelLogin) -> u64 {
		let op = self.bump();
		self.subscribed.insert(channel.clone(), op);
		op
	}

	fn unsubscribe(&mut self, channel: &ChannelLogin) -> u64 {
		let op = self.bump();
		self.unsubscribed.insert(channel.clone(), op);
		op
	}

	fn unsubscribed_since(&self, channel: &ChannelLogin, op: u64) -> bool {
		self.unsubscribed.get(channel).is_some_and(|&u| u > op)
	}

	fn subscribed_since(&self, channel: &ChannelLogin, op: u64) -> bool {
		self.subscribed.get(channel).is_some_and(|&s| s > op)
	}

	fn clear(&mut self) {
		self.subscribed.clear();
		self.unsubscribed.clear();
	}
}

async fn next_event(socket: &mut Option<SocketHandle>) -> (SocketId, SocketEvent) {
	match socket {
		Some(s) => {
			let id = s.id();
			let ev = s.recv().await.unwrap_or(SocketEvent::Close {
				code: ABNORMAL_CLOSE,
				reason: "socket task ended".to_string(),
			});
			(id, ev)
		}
		None => std::future::pending().await,
	}
}

async fn sleep_until_opt(deadline: Option<Instant>) {
	match deadline {
		Some(d) => sleep_until(d).await,
		None => std::future::pending().await,
	}
}

/// Owns every piece of session state. Runs as a single task; see [`SessionController::run`].
pub(crate) struct SessionController {
	api: Arc<dyn ControlApi>,
	transport: Arc<dyn Transport>,
	primary_url: Url,

	state: SessionState,
	session: Option<Session>,
	primary: Option<SocketHandle>,
	migration: Option<SocketHandle>,

	registry: SubscriptionRegistry,
	replay: Option<Replay>,
	pending: FuturesUnordered<BoxFuture<'static, RestDone>>,
	ops: OpLog,
	reconnect: ReconnectController,
	ready: Option<Reply<()>>,

	handler: HandlerSlot,
	fatal_tx: broadcast::Sender<FatalError>,
	recent: RecentIds,
}

impl SessionController {
	pub(crate) fn new(
		api: Arc<dyn ControlApi>,
		transport: Arc<dyn Transport>,
		primary_url: Url,
		policy: ReconnectPolicy,
		handler: HandlerSlot,
		fatal_tx: broadcast::Sender<FatalError>,
	) -> Self {
		Self {
			api,
			transport,
			primary_url,
			state: SessionState::Disconnected,
			session: None,
			primary: None,
			migration: None,
			registry: SubscriptionRegistry::default(),
			replay: None,
			pending: FuturesUnordered::new(),
			ops: OpLog::default(),
			reconnect: ReconnectController::new(policy),
			ready: None,
			handler,
			fatal_tx,
			recent: RecentIds::default(),
		}
	}

	pub(crate) async fn run(mut self, mut control_rx: mpsc::Receiver<SessionControl>) {
		loop {
			let reconnect_at = self.reconnect.deadline();

			tokio::select! {
				cmd = control_rx.recv() => {
					let Some(cmd) = cmd else {
						debug!("all eventsub client handles dropped; stopping session");
						self.teardown();
						break;
					};
					self.handle_control(cmd).await;
				}

				(id, ev) = next_event(&mut self.primary) => {
					self.on_socket_event(Origin::Primary, id, ev).await;
				}

				(id, ev) = next_event(&mut self.migration) => {
					self.on_socket_event(Origin::Migration, id, ev).await;
				}

				_ = sleep_until_opt(reconnect_at) => {
					self.start_reconnect_attempt().await;
				}

				Some(done) = self.pending.next(), if !self.pending.is_empty() => {
					self.on_rest_done(done);
					if self.pending.is_empty() {
						self.ops.clear();
					}
				}
			}

			if self.state == SessionState::Closed {
				break;
			}
		}

		info!("eventsub session controller stopped");
	}

	async fn handle_control(&mut self, cmd: SessionControl) {
		match cmd {
			SessionControl::Connect { resp } => self.on_connect(resp).await,

			SessionControl::Subscribe { channel, resp } => {
				let session_id = match (self.state, &self.session) {
					(SessionState::Ready | SessionState::Migrating, Some(session)) => session.id.clone(),
					_ => {
						let _ = resp.send(Err(EventSubError::NotReady));
						return;
					}
				};
				if self.registry.contains(&channel) {
					debug!(%channel, "channel already subscribed");
					let _ = resp.send(Ok(()));
					return;
				}
				let op = self.ops.subscribe(&channel);
				self.spawn_subscribe(channel, session_id, op, resp);
			}

			SessionControl::Unsubscribe { channel, resp } => {
				let op = self.ops.unsubscribe(&channel);
				self.spawn_unsubscribe(channel, op, Some(resp));
			}

			SessionControl::ActiveChannels { resp } => {
				let _ = resp.send(self.active_channels());
			}

			SessionControl::State { resp } => {
				let _ = resp.send(self.state);
			}

			SessionControl::Shutdown { resp } => {
				info!("eventsub session shutting down");
				self.teardown();
				let _ = resp.send(());
			}
		}
	}

	fn spawn_subscribe(&mut self, channel: ChannelLogin, session_id: String, op: u64, resp: Reply<()>) {
		let api = self.api.clone();
		self.pending.push(Box::pin(async move {
			let result = subscribe_remote(&*api, &session_id, &channel).await;
			RestDone::Subscribe {
				channel,
				session_id,
				op,
				result,
				resp,
			}
		}));
	}

	fn spawn_replay(&mut self, channel: ChannelLogin, session_id: String) {
		let api = self.api.clone();
		self.pending.push(Box::pin(async move {
			let result = subscribe_remote(&*api, &session_id, &channel).await;
			RestDone::Replay {
				channel,
				session_id,
				result,
			}
		}));
	}

	fn spawn_unsubscribe(&mut self, channel: ChannelLogin, op: u64, resp: Option<Reply<()>>) {
		let api = self.api.clone();
		let known_id = self.registry.broadcaster_id(&channel);
		self.pending.push(Box::pin(async move {
			let result = unsubscribe_remote(&*api, &channel, known_id).await;
			RestDone::Unsubscribe {
				channel,
				op,
				result,
				resp,
			}
		}));
	}

	/// Registry plus channels whose resubscribe has not finished yet.
	fn active_channels(&self) -> Vec<ChannelLogin> {
		let mut channels: BTreeSet<ChannelLogin> = self.registry.channels().into_iter().collect();
		if let Some(replay) = &self.replay {
			channels.extend(
				replay
					.remaining
					.iter()
					.filter(|c| !self.ops.unsubscribed_since(c, replay.op))
					.cloned(),
			);
		}
		channels.into_iter().collect()
	}

	fn on_rest_done(&mut self, done: RestDone) {
		match done {
			RestDone::Subscribe {
				channel,
				session_id,
				op,
				result,
				resp,
			} => self.on_subscribe_done(channel, session_id, op, result, resp),

			RestDone::Replay {
				channel,
				session_id,
				result,
			} => self.on_replay_done(channel, &session_id, result),

			RestDone::Unsubscribe {
				channel,
				op,
				result,
				resp,
			} => {
				match &result {
					Ok(()) if !self.ops.subscribed_since(&channel, op) => {
						self.registry.remove(&channel);
					}
					Ok(()) => debug!(%channel, "channel resubscribed while unsubscribing; keeping it"),
					Err(e) if resp.is_none() => warn!(%channel, error = %e, "cleanup unsubscribe failed"),
					Err(_) => {}
				}
				if let Some(resp) = resp {
					let _ = resp.send(result);
				}
			}
		}
	}

	fn on_subscribe_done(
		&mut self,
		channel: ChannelLogin,
		session_id: String,
		op: u64,
		result: Result<String, EventSubError>,
		resp: Reply<()>,
	) {
		let broadcaster_id = match result {
			Ok(id) => id,
			Err(e) => {
				let _ = resp.send(Err(e));
				return;
			}
		};

		if self.ops.unsubscribed_since(&channel, op) {
			debug!(%channel, "channel unsubscribed while subscribing; deleting again");
			let cleanup = self.ops.unsubscribe(&channel);
			self.spawn_unsubscribe(channel, cleanup, None);
			let _ = resp.send(Ok(()));
			return;
		}

		match &self.session {
			Some(current) if current.id != session_id => {
				debug!(%channel, stale = %session_id, current = %current.id, "subscribed on a replaced session; resubscribing");
				let current = current.id.clone();
				self.spawn_subscribe(channel, current, op, resp);
			}
			// Without a session the next welcome replays it.
			_ => {
				self.registry.insert(channel, broadcaster_id);
				let _ = resp.send(Ok(()));
			}
		}
	}

	fn on_replay_done(&mut self, channel: ChannelLogin, session_id: &str, result: Result<String, EventSubError>) {
		let Some(replay) = self.replay.as_mut().filter(|r| r.session_id == session_id) else {
			debug!(%channel, %session_id, "ignoring resubscribe result for a replaced session");
			return;
		};
		replay.remaining.remove(&channel);
		let superseded = self.ops.unsubscribed_since(&channel, replay.op);

		match result {
			Ok(_) if superseded => {
				debug!(%channel, "channel unsubscribed while resubscribing; deleting again");
				let cleanup = self.ops.unsubscribe(&channel);
				self.spawn_unsubscribe(channel, cleanup, None);
			}
			Ok(broadcaster_id) => {
				replay.restored += 1;
				self.registry.insert(channel, broadcaster_id);
			}
			Err(e) if superseded => debug!(%channel, error = %e, "resubscribe of an unsubscribed channel failed"),
			Err(e) => {
				warn!(%channel, error = %e, "resubscribe failed; dropping channel");
				metrics::counter!("mobibot_eventsub_resubscribe_failures_total").increment(1);
				replay.dropped += 1;
			}
		}

		self.finish_replay_if_done();
	}

	/// Resolve a pending connect once every resubscribe has landed.
	fn finish_replay_if_done(&mut self) {
		if self.replay.as_ref().is_some_and(|r| !r.remaining.is_empty()) {
			return;
		}
		if let Some(replay) = self.replay.take()
			&& (replay.restored > 0 || replay.dropped > 0)
		{
			info!(
				session_id = %replay.session_id,
				restored = replay.restored,
				dropped = replay.dropped,
				"replayed channel subscriptions"
			);
		}
		if let Some(ready) = self.ready.take() {
			let _ = ready.send(Ok(()));
		}
	}

	async fn on_connect(&mut self, resp: Reply<()>) {
		match self.state {
			SessionState::Ready | SessionState::Migrating if self.replay.is_none() => {
				let _ = resp.send(Ok(()));
			}
			SessionState::Closed => {
				let _ = resp.send(Err(EventSubError::Closed));
			}
			// Still waiting on a welcome or on its replay.
			SessionState::Connecting | SessionState::AwaitingWelcome | SessionState::Ready | SessionState::Migrating => {
				if self.ready.is_some() {
					let _ = resp.send(Err(EventSubError::ConnectInProgress));
				} else {
					self.ready = Some(resp);
				}
			}
			SessionState::Disconnected => {
				self.state = SessionState::Connecting;
				match self.open_primary().await {
					Ok(()) => self.ready = Some(resp),
					Err(e) => {
						warn!(error = %e, "eventsub connect failed");
						self.state = SessionState::Disconnected;
						let _ = resp.send(Err(e));
					}
				}
			}
		}
	}

	/// Refresh auth and open a socket to the primary endpoint.
	async fn open_primary(&mut self) -> Result<(), EventSubError> {
		self.api.prepare_auth().await.map_err(EventSubError::Auth)?;
		let handle = self
			.transport
			.open(&self.primary_url)
			.await
			.map_err(EventSubError::Transport)?;

		debug!(socket = %handle.id(), url = %self.primary_url, "eventsub socket opened; awaiting welcome");
		self.primary = Some(handle);
		self.state = SessionState::AwaitingWelcome;
		Ok(())
	}

	async fn on_socket_event(&mut self, origin: Origin, id: SocketId, ev: SocketEvent) {
		match ev {
			SocketEvent::Open => debug!(socket = %id, ?origin, "socket open"),
			SocketEvent::Message(raw) => self.on_frame(origin, &raw).await,
			SocketEvent::Error(e) => warn!(socket = %id, ?origin, error = %e, "socket error"),
			SocketEvent::Close { code, reason } => match origin {
				Origin::Primary => {
					self.primary = None;
					self.on_primary_closed(id, code, &reason).await;
				}
				Origin::Migration => {
					self.migration = None;
					self.on_migration_closed(id, code, &reason).await;
				}
			},
		}
	}

	async fn on_frame(&mut self, origin: Origin, raw: &str) {
		let frame = match decode_frame(raw) {
			Ok(frame) => frame,
			Err(e) => {
				warn!(?origin, error = ?e, "dropping malformed eventsub frame");
				metrics::counter!("mobibot_eventsub_malformed_frames_total").increment(1);
				return;
			}
		};

		match frame {
			InboundFrame::Welcome(welcome) => self.on_welcome(origin, welcome).await,
			InboundFrame::Keepalive => {}
			InboundFrame::Reconnect { reconnect_url } => match origin {
				Origin::Primary => self.on_reconnect_requested(&reconnect_url).await,
				Origin::Migration => warn!("ignoring session_reconnect on migration socket"),
			},
			InboundFrame::ChatMessage(chat) => self.dispatch_chat(chat),
			InboundFrame::OtherNotification { subscription_type } => {
				debug!(?subscription_type, "ignoring notification");
			}
			InboundFrame::Revocation(revocation) => self.on_revocation(revocation),
			InboundFrame::Unknown { message_type } => {
				debug!(%message_type, "ignoring unknown eventsub message type");
			}
		}
	}

	async fn on_welcome(&mut self, origin: Origin, welcome: WelcomeSession) {
		if origin == Origin::Migration {
			if let Some(old) = self.primary.take() {
				old.close(1000);
			}
			self.primary = self.migration.take();
			metrics::counter!("mobibot_eventsub_migrations_total").increment(1);
		}

		let keepalive = welcome
			.keepalive_timeout_seconds
			.map(Duration::from_secs)
			.unwrap_or(DEFAULT_KEEPALIVE);
		if let Some(primary) = &self.primary {
			primary.set_keepalive_timeout(keepalive);
		}

		if let Some(previous) = &self.session {
			debug!(previous = %previous.id, age = ?previous.created_at.elapsed(), "replacing session");
		}
		let session_id = welcome.session_id;
		self.session = Some(Session {
			id: session_id.clone(),
			created_at: Instant::now(),
		});
		self.reconnect.succeeded();
		self.state = SessionState::Ready;
		info!(%session_id, ?keepalive, ?origin, "eventsub session welcomed");

		// Clear, then resubscribe everything on the new session. Channels a
		// previous replay had not finished are carried over.
		let mut snapshot: BTreeSet<ChannelLogin> = self.registry.take_all().into_iter().collect();
		if let Some(previous) = self.replay.take() {
			snapshot.extend(
				previous
					.remaining
					.into_iter()
					.filter(|c| !self.ops.unsubscribed_since(c, previous.op)),
			);
		}

		let op = self.ops.bump();
		for channel in &snapshot {
			self.spawn_replay(channel.clone(), session_id.clone());
		}
		self.replay = Some(Replay {
			session_id,
			op,
			remaining: snapshot,
			restored: 0,
			dropped: 0,
		});
		self.finish_replay_if_done();
	}

	async fn on_reconnect_requested(&mut self, reconnect_url: &str) {
		if self.migration.is_some() {
			debug!("session_reconnect while already migrating; ignoring");
			return;
		}

		let url = match Url::parse(reconnect_url) {
			Ok(url) => url,
			Err(e) => {
				warn!(%reconnect_url, error = %e, "invalid reconnect_url; staying on current socket");
				return;
			}
		};

		info!("received session_reconnect; opening migration socket");
		match self.transport.open(&url).await {
			Ok(handle) => {
				self.migration = Some(handle);
				self.state = SessionState::Migrating;
			}
			Err(e) => {
				warn!(error = ?e, "failed to open migration socket; staying on current socket");
			}
		}
	}

	async fn on_primary_closed(&mut self, id: SocketId, code: u16, reason: &str) {
		if self.migration.is_some() {
			info!(socket = %id, code, %reason, "primary closed during migration; waiting for migration welcome");
			return;
		}

		self.session = None;
		metrics::counter!("mobibot_eventsub_socket_closes_total").increment(1);

		match self.reconnect.on_close(code, reason) {
			Decision::Ignored => debug!(socket = %id, code, "close during reconnect backoff ignored"),
			Decision::Scheduled { attempt, delay } => {
				warn!(socket = %id, code, %reason, attempt, ?delay, "eventsub socket closed; reconnecting");
				self.state = SessionState::Connecting;
			}
			Decision::Fatal(err) => self.escalate(err),
		}
	}

	async fn on_migration_closed(&mut self, id: SocketId, code: u16, reason: &str) {
		if self.primary.is_some() {
			warn!(socket = %id, code, %reason, "migration socket closed before welcome; continuing on primary");
			if self.state == SessionState::Migrating {
				self.state = SessionState::Ready;
			}
			return;
		}

		// Both sockets are gone; treat it like losing the primary.
		self.on_primary_closed(id, code, reason).await;
	}

	async fn start_reconnect_attempt(&mut self) {
		let Some(attempt) = self.reconnect.begin_attempt() else {
			return;
		};
		info!(attempt, "eventsub reconnect attempt");

		if let Some(old) = self.primary.take() {
			old.close(1000);
		}
		self.state = SessionState::Connecting;

		if let Err(e) = self.open_primary().await {
			warn!(attempt, error = %e, "eventsub reconnect attempt failed");
			match self.reconnect.attempt_failed() {
				Decision::Scheduled { attempt, delay } => {
					debug!(attempt, ?delay, "next reconnect attempt scheduled");
				}
				Decision::Fatal(err) => self.escalate(err),
				Decision::Ignored => {}
			}
		}
	}

	fn dispatch_chat(&mut self, chat: ChatNotification) {
		if !self.recent.insert(&chat.message_id) {
			debug!(message_id = %chat.message_id, "duplicate notification dropped");
			return;
		}
		metrics::counter!("mobibot_eventsub_chat_messages_total").increment(1);

		let handler = self.handler.read().clone();
		let Some(handler) = handler else {
			debug!(channel = %chat.channel, "no chat handler registered");
			return;
		};

		let tags = ChatTags {
			username: chat.chatter,
		};
		handler(&chat.channel, &tags, &chat.text);
	}

	fn on_revocation(&mut self, revocation: Revocation) {
		warn!(
			subscription_id = %revocation.subscription_id,
			subscription_type = %revocation.subscription_type,
			status = %revocation.status,
			"eventsub subscription revoked"
		);
		metrics::counter!("mobibot_eventsub_revocations_total").increment(1);

		if revocation.subscription_type == CHAT_MESSAGE_SUBSCRIPTION
			&& let Some(broadcaster_id) = &revocation.broadcaster_user_id
			&& let Some(channel) = self.registry.remove_by_broadcaster_id(broadcaster_id)
		{
			warn!(%channel, "channel dropped after revocation");
		}
	}

	fn escalate(&mut self, err: FatalError) {
		error!(error = %err, "eventsub session failed");
		metrics::counter!("mobibot_eventsub_fatal_errors_total").increment(1);

		let _ = self.fatal_tx.send(err.clone());
		if let Some(ready) = self.ready.take() {
			let _ = ready.send(Err(EventSubError::Fatal(err)));
		}
		self.teardown();
	}

	fn teardown(&mut self) {
		for socket in [self.primary.take(), self.migration.take()].into_iter().flatten() {
			socket.close(1000);
		}
		// In-flight REST work is dropped; its callers see `Closed`.
		self.pending = FuturesUnordered::new();
		self.replay = None;
		if let Some(ready) = self.ready.take() {
			let _ = ready.send(Err(EventSubError::Closed));
		}
		self.session = None;
		self.state = SessionState::Closed;
	}
}
