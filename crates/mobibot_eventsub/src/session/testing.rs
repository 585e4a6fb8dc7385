#![forbid(unsafe_code)]

//! In-memory control plane and transport for controller tests.

use std::collections::HashMap;
use std::sync::Arc;

use mobibot_domain::ChannelLogin;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::{Semaphore, mpsc};
use url::Url;

use crate::helix::{ControlApi, RemoteSubscription};
use crate::transport::{SocketCommand, SocketEvent, SocketHandle, Transport};
use crate::CHAT_MESSAGE_SUBSCRIPTION;

#[derive(Debug, Default)]
struct FakeApiState {
	unknown_users: Vec<String>,
	create_status: HashMap<String, StatusCode>,
	delete_status: Option<StatusCode>,
	creates: Vec<(String, String)>,
	remote: Vec<RemoteSubscription>,
	deleted: Vec<String>,
	sent: Vec<(String, String)>,
	prepare_calls: usize,
	fail_auth: bool,
	next_sub: u32,
	create_gate: Option<Arc<Semaphore>>,
}

/// Behaves like Helix: ids are `id-<login>`, creates answer 202 unless overridden.
#[derive(Debug, Default)]
pub(crate) struct FakeApi {
	state: Mutex<FakeApiState>,
}

impl FakeApi {
	pub(crate) fn user_id_for(&self, login: &str) -> String {
		format!("id-{login}")
	}

	pub(crate) fn forget_user(&self, login: &str) {
		self.state.lock().unknown_users.push(login.to_string());
	}

	pub(crate) fn set_create_status(&self, login: &str, status: StatusCode) {
		let id = self.user_id_for(login);
		self.state.lock().create_status.insert(id, status);
	}

	pub(crate) fn set_delete_status(&self, status: StatusCode) {
		self.state.lock().delete_status = Some(status);
	}

	pub(crate) fn set_fail_auth(&self, fail: bool) {
		self.state.lock().fail_auth = fail;
	}

	/// Park every create call until the returned gate gets a permit.
	pub(crate) fn hold_creates(&self) -> Arc<Semaphore> {
		let gate = Arc::new(Semaphore::new(0));
		self.state.lock().create_gate = Some(gate.clone());
		gate
	}

	pub(crate) fn drop_remote(&self, login: &str) {
		let id = self.user_id_for(login);
		self.state.lock().remote.retain(|s| !s.is_chat_message_for(&id));
	}

	pub(crate) fn subscription_id_for(&self, login: &str) -> Option<String> {
		let id = self.user_id_for(login);
		self.state
			.lock()
			.remote
			.iter()
			.find(|s| s.is_chat_message_for(&id))
			.map(|s| s.id.clone())
	}

	/// Session ids of every create call for `login`, in order.
	pub(crate) fn sessions_for(&self, login: &str) -> Vec<String> {
		let id = self.user_id_for(login);
		self.state
			.lock()
			.creates
			.iter()
			.filter(|(_, b)| *b == id)
			.map(|(s, _)| s.clone())
			.collect()
	}

	pub(crate) fn created_for(&self, login: &str) -> usize {
		self.sessions_for(login).len()
	}

	pub(crate) fn deleted(&self) -> Vec<String> {
		self.state.lock().deleted.clone()
	}

	pub(crate) fn sent(&self) -> Vec<(String, String)> {
		self.state.lock().sent.clone()
	}

	pub(crate) fn prepare_calls(&self) -> usize {
		self.state.lock().prepare_calls
	}
}

#[async_trait::async_trait]
impl ControlApi for FakeApi {
	async fn prepare_auth(&self) -> anyhow::Result<()> {
		let mut state = self.state.lock();
		state.prepare_calls += 1;
		if state.fail_auth {
			anyhow::bail!("twitch refresh token failed: status=400 body=invalid refresh token");
		}
		Ok(())
	}

	async fn resolve_user_id(&self, login: &ChannelLogin) -> anyhow::Result<Option<String>> {
		let state = self.state.lock();
		if state.unknown_users.iter().any(|u| u == login.as_str()) {
			return Ok(None);
		}
		Ok(Some(self.user_id_for(login.as_str())))
	}

	async fn create_chat_message_subscription(
		&self,
		session_id: &str,
		broadcaster_user_id: &str,
	) -> anyhow::Result<StatusCode> {
		let gate = self.state.lock().create_gate.clone();
		if let Some(gate) = gate {
			gate.acquire().await.expect("gate open").forget();
		}

		let mut state = self.state.lock();
		state
			.creates
			.push((session_id.to_string(), broadcaster_user_id.to_string()));

		let status = state
			.create_status
			.get(broadcaster_user_id)
			.copied()
			.unwrap_or(StatusCode::ACCEPTED);

		let exists = state.remote.iter().any(|s| s.is_chat_message_for(broadcaster_user_id));
		if (status == StatusCode::ACCEPTED || status == StatusCode::CONFLICT) && !exists {
			state.next_sub += 1;
			let id = format!("sub-{}", state.next_sub);
			state.remote.push(RemoteSubscription {
				id,
				status: "enabled".to_string(),
				kind: CHAT_MESSAGE_SUBSCRIPTION.to_string(),
				condition: json!({ "broadcaster_user_id": broadcaster_user_id, "user_id": "bot-1" }),
				transport: Some(json!({ "method": "websocket", "session_id": session_id })),
			});
		}
		Ok(status)
	}

	async fn list_enabled_subscriptions(&self) -> anyhow::Result<Vec<RemoteSubscription>> {
		Ok(self.state.lock().remote.clone())
	}

	async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<StatusCode> {
		let mut state = self.state.lock();
		state.deleted.push(subscription_id.to_string());
		let status = state.delete_status.unwrap_or(StatusCode::NO_CONTENT);
		if status == StatusCode::NO_CONTENT {
			state.remote.retain(|s| s.id != subscription_id);
		}
		Ok(status)
	}

	async fn send_chat_message(&self, broadcaster_id: &str, message: &str) -> anyhow::Result<()> {
		self.state
			.lock()
			.sent
			.push((broadcaster_id.to_string(), message.to_string()));
		Ok(())
	}
}

/// Test side of a socket opened through [`FakeTransport`].
pub(crate) struct FakeSocket {
	pub(crate) url: Url,
	events: mpsc::Sender<SocketEvent>,
	commands: mpsc::UnboundedReceiver<SocketCommand>,
}

impl FakeSocket {
	pub(crate) async fn send_text(&self, raw: String) {
		self.events
			.send(SocketEvent::Message(raw))
			.await
			.expect("controller listening");
	}

	pub(crate) async fn close(&self, code: u16, reason: &str) {
		let _ = self
			.events
			.send(SocketEvent::Close {
				code,
				reason: reason.to_string(),
			})
			.await;
	}

	/// Commands the controller has sent so far.
	pub(crate) fn drain_commands(&mut self) -> Vec<SocketCommand> {
		let mut out = Vec::new();
		while let Ok(cmd) = self.commands.try_recv() {
			out.push(cmd);
		}
		out
	}

	/// True once the controller dropped its handle.
	pub(crate) fn is_released(&self) -> bool {
		self.events.is_closed()
	}
}

#[derive(Debug, Default)]
struct FakeTransportState {
	fail_opens: u32,
	opened: usize,
}

/// Hands each opened socket to the test through a channel.
pub(crate) struct FakeTransport {
	sockets: mpsc::UnboundedSender<FakeSocket>,
	state: Mutex<FakeTransportState>,
}

impl FakeTransport {
	pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeSocket>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(
			Arc::new(Self {
				sockets: tx,
				state: Mutex::new(FakeTransportState::default()),
			}),
			rx,
		)
	}

	/// Make the next `n` opens fail.
	pub(crate) fn fail_next_opens(&self, n: u32) {
		self.state.lock().fail_opens = n;
	}

	pub(crate) fn opened(&self) -> usize {
		self.state.lock().opened
	}
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
	async fn open(&self, url: &Url) -> anyhow::Result<SocketHandle> {
		{
			let mut state = self.state.lock();
			if state.fail_opens > 0 {
				state.fail_opens -= 1;
				anyhow::bail!("connect_async to eventsub ws: connection refused");
			}
			state.opened += 1;
		}

		let (events_tx, events_rx) = mpsc::channel(64);
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		events_tx.try_send(SocketEvent::Open)?;

		let _ = self.sockets.send(FakeSocket {
			url: url.clone(),
			events: events_tx,
			commands: commands_rx,
		});
		Ok(SocketHandle::new(events_rx, commands_tx))
	}
}
