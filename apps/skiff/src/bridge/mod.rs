//! The connection lifecycle manager: owns the socket, the heartbeat ticker,
//! the reconnect timer and the pending-request tracker, and routes frames
//! between the wire and the embedder.
//!
//! One driver task per bridge. Commands arrive over a channel, events leave
//! over a channel; the socket and every timer are owned exclusively by the
//! driver, so no locking is needed and "clear the old one before creating a
//! new one" is enforced in one place.

pub mod machine;
pub mod socket;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, Sleep, interval, sleep};
use url::Url;

use skiff_proto::{
    ApiRequest, DeliverAction, HEARTBEAT_INTERVAL_MS, HeartbeatEvent, InboundContent, InboundFrame,
    LifecycleEvent,
};

use crate::config::Config;
use crate::identity::{IdentityResolver, Session};
use crate::pending::PendingTracker;
use crate::translate::{DisplayRecord, ForwardTranscript, RecordBody, SenderKind, Translator};

pub use machine::{ConnectionState, Effect, LinkEvent, LinkMachine, MAX_RECONNECT_ATTEMPTS};
pub use socket::{Socket, SocketConnector, SocketError, WsConnector};

/// Everything the embedder observes.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    StateChanged(ConnectionState),
    /// Human-readable status note (connection progress, auth results, ...).
    Notice(String),
    Record(DisplayRecord),
    /// Structured expansion of a forwarded bundle, for a detail view.
    ForwardDetail(ForwardTranscript),
    /// A sent message is now awaiting its reply.
    ReplyPending { local_id: i64 },
    /// The oldest awaited reply arrived.
    ReplyResolved { local_id: i64 },
    /// No reply within the staleness window; informational only.
    ReplyStale { local_id: i64 },
}

#[derive(Debug)]
enum Command {
    Connect,
    SendText(String),
    LoginAdmin { account: String, password: String },
    Logout,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub bot_id: String,
    pub bot_name: String,
    pub ws_url: Url,
}

impl From<&Config> for BridgeSettings {
    fn from(config: &Config) -> Self {
        Self {
            bot_id: config.bot_id.clone(),
            bot_name: config.bot_name.clone(),
            ws_url: config.ws_url.clone(),
        }
    }
}

/// Handle to a running bridge. Dropping it tears the driver task down; use
/// [`Bridge::shutdown`] for an orderly stop.
pub struct Bridge {
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl Bridge {
    pub fn spawn(
        settings: BridgeSettings,
        resolver: IdentityResolver,
        connector: Arc<dyn SocketConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();

        let translator = Translator::new(settings.bot_id.clone(), settings.bot_name.clone());
        let driver = Driver {
            settings,
            resolver,
            connector,
            machine: LinkMachine::new(),
            translator,
            pending: PendingTracker::new(),
            session: None,
            socket: None,
            heartbeat: None,
            reconnect: None,
            events: event_tx,
            expiry_tx,
        };
        let task = tokio::spawn(driver.run(command_rx, expiry_rx));

        (
            Self {
                commands: command_tx,
                task: Some(task),
            },
            event_rx,
        )
    }

    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.commands.send(Command::SendText(text.into()));
    }

    pub fn login_admin(&self, account: impl Into<String>, password: impl Into<String>) {
        let _ = self.commands.send(Command::LoginAdmin {
            account: account.into(),
            password: password.into(),
        });
    }

    pub fn logout(&self) {
        let _ = self.commands.send(Command::Logout);
    }

    /// Orderly stop: the driver closes the socket and cancels every timer
    /// before the task finishes.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Driver {
    settings: BridgeSettings,
    resolver: IdentityResolver,
    connector: Arc<dyn SocketConnector>,
    machine: LinkMachine,
    translator: Translator,
    pending: PendingTracker,
    session: Option<Session>,
    socket: Option<Box<dyn Socket>>,
    heartbeat: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    expiry_tx: mpsc::UnboundedSender<i64>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut expiries: mpsc::UnboundedReceiver<i64>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(local_id) = expiries.recv() => self.handle_expiry(local_id),
                frame = await_frame(&mut self.socket) => {
                    match frame {
                        Some(Ok(text)) => self.handle_inbound(text).await,
                        Some(Err(err)) => {
                            tracing::warn!(target: "skiff::bridge", error = %err, "socket error");
                            self.notice("connection error");
                            self.apply(LinkEvent::TransportError).await;
                        }
                        None => {
                            self.socket = None;
                            self.notice("connection closed");
                            self.apply(LinkEvent::Closed).await;
                        }
                    }
                }
                _ = await_tick(&mut self.heartbeat) => {
                    self.send_heartbeat().await;
                }
                _ = await_deadline(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.apply(LinkEvent::ReconnectDue).await;
                }
            }
        }
        self.teardown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.request_connect().await,
            Command::SendText(text) => self.send_text(text).await,
            Command::LoginAdmin { account, password } => {
                self.login_admin(&account, &password).await;
            }
            Command::Logout => self.logout().await,
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// Resolve an identity on first use, then drive the machine.
    async fn request_connect(&mut self) {
        if self.session.is_none() {
            match self.resolver.resolve().await {
                Ok(resolved) => {
                    for notice in resolved.notices {
                        self.notice(notice);
                    }
                    self.session = Some(resolved.session);
                }
                Err(err) => {
                    tracing::warn!(target: "skiff::bridge", error = %err, "identity resolution failed");
                    self.notice(format!("session bootstrap failed: {err}"));
                    return;
                }
            }
        }
        self.apply(LinkEvent::ConnectRequested).await;
    }

    async fn send_text(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        if self.machine.state() != ConnectionState::Online {
            self.notice("not connected; message not sent");
            // Recovery nudge. A pending backoff timer is left alone.
            if matches!(
                self.machine.state(),
                ConnectionState::Disconnected | ConnectionState::Errored
            ) {
                self.request_connect().await;
            }
            return;
        }
        let Some(session) = self.session.clone() else {
            self.notice("no session; message not sent");
            return;
        };

        let (local_id, event) = self.translator.outgoing_text(&session, &text, now_secs());
        self.emit(BridgeEvent::Record(DisplayRecord {
            sender: SenderKind::User,
            body: RecordBody::Text(text),
        }));
        self.pending.insert(local_id, self.expiry_tx.clone());
        self.emit(BridgeEvent::ReplyPending { local_id });

        if let Err(err) = self.send_frame(&event).await {
            self.transport_broken(&err).await;
        }
    }

    async fn login_admin(&mut self, account: &str, password: &str) {
        match self.resolver.login_admin(account, password).await {
            Ok(resolved) => {
                for notice in resolved.notices {
                    self.notice(notice);
                }
                self.session = Some(resolved.session);
                self.apply(LinkEvent::ConnectRequested).await;
            }
            Err(err) => self.notice(format!("admin login failed: {err}")),
        }
    }

    async fn logout(&mut self) {
        if let Err(err) = self.resolver.logout() {
            self.notice(format!("logout failed: {err}"));
        } else {
            self.notice("logged out of admin mode");
        }
        match self.resolver.resolve().await {
            Ok(resolved) => {
                for notice in resolved.notices {
                    self.notice(notice);
                }
                self.session = Some(resolved.session);
            }
            Err(err) => {
                self.notice(format!("session bootstrap failed: {err}"));
                self.session = None;
            }
        }
    }

    fn handle_expiry(&mut self, local_id: i64) {
        if self.pending.expire(local_id) {
            self.emit(BridgeEvent::ReplyStale { local_id });
            self.notice("service busy; replies may take longer, feel free to resend");
        }
    }

    async fn handle_inbound(&mut self, raw: String) {
        let frame = match InboundFrame::classify(&raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(target: "skiff::bridge", error = %err, "dropping malformed frame");
                return;
            }
        };
        if frame.is_empty() {
            tracing::debug!(target: "skiff::bridge", frame = %raw, "ignoring unrecognized frame");
            return;
        }
        if let Some(request) = frame.request {
            self.answer_api(request).await;
        }
        match frame.content {
            Some(InboundContent::HeartbeatAck) => {
                tracing::debug!(target: "skiff::bridge", "heartbeat acknowledged");
            }
            Some(InboundContent::Deliver(DeliverAction::Message(segments))) => {
                self.resolve_oldest_pending();
                for record in self.translator.deliver_message(&segments) {
                    self.emit(BridgeEvent::Record(record));
                }
            }
            Some(InboundContent::Deliver(DeliverAction::Forward(nodes))) => {
                self.resolve_oldest_pending();
                let (preview, transcript) = self.translator.deliver_forward(&nodes);
                self.emit(BridgeEvent::Record(preview));
                self.emit(BridgeEvent::ForwardDetail(transcript));
            }
            Some(InboundContent::Message(event)) => {
                self.resolve_oldest_pending();
                let record = self.translator.deliver_event(&event.segments);
                self.emit(BridgeEvent::Record(record));
            }
            None => {}
        }
    }

    async fn answer_api(&mut self, request: ApiRequest) {
        tracing::debug!(target: "skiff::bridge", action = %request.action, "answering backend api call");
        let response = self.translator.answer_api(&request, self.session.as_ref());
        if let Err(err) = self.send_frame(&response).await {
            self.transport_broken(&err).await;
        }
    }

    fn resolve_oldest_pending(&mut self) {
        if let Some(local_id) = self.pending.resolve_oldest() {
            self.emit(BridgeEvent::ReplyResolved { local_id });
        }
    }

    async fn send_heartbeat(&mut self) {
        let frame = HeartbeatEvent::new(self.settings.bot_id.clone(), now_secs());
        if let Err(err) = self.send_frame(&frame).await {
            tracing::warn!(target: "skiff::bridge", error = %err, "heartbeat send failed");
            self.transport_broken(&err).await;
        }
    }

    async fn send_frame<T: Serialize>(&mut self, frame: &T) -> Result<(), SocketError> {
        let text = serde_json::to_string(frame).map_err(|err| SocketError::Send(err.to_string()))?;
        match self.socket.as_mut() {
            Some(socket) => socket.send(text).await,
            None => Err(SocketError::Send("no live socket".to_string())),
        }
    }

    /// A failed send means the transport is gone: emulate the error-then-close
    /// order a real socket delivers.
    async fn transport_broken(&mut self, err: &SocketError) {
        self.notice(format!("connection error: {err}"));
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
        self.apply(LinkEvent::TransportError).await;
        self.apply(LinkEvent::Closed).await;
    }

    /// Feed one event through the machine and interpret the effects. Effects
    /// can produce follow-up events (a connect attempt resolving either way),
    /// processed breadth-first to keep this non-recursive.
    async fn apply(&mut self, event: LinkEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let before = self.machine.state();
            let effects = self.machine.handle(event);
            let after = self.machine.state();
            if before != after {
                self.emit(BridgeEvent::StateChanged(after));
            }
            for effect in effects {
                queue.extend(self.run_effect(effect).await);
            }
        }
    }

    async fn run_effect(&mut self, effect: Effect) -> Vec<LinkEvent> {
        match effect {
            Effect::OpenSocket => {
                // Invariant: at most one live socket per bridge.
                if let Some(mut stale) = self.socket.take() {
                    stale.close().await;
                }
                self.notice("connecting to backend...");
                match self.connector.connect(&self.settings.ws_url).await {
                    Ok(socket) => {
                        self.socket = Some(socket);
                        self.notice("connection established");
                        vec![LinkEvent::Opened]
                    }
                    Err(err) => {
                        tracing::warn!(target: "skiff::bridge", error = %err, "connect failed");
                        self.notice(format!("connection failed: {err}"));
                        vec![LinkEvent::Closed]
                    }
                }
            }
            Effect::SendHandshake => {
                let frame = LifecycleEvent::connect(self.settings.bot_id.clone(), now_secs());
                match self.send_frame(&frame).await {
                    Ok(()) => Vec::new(),
                    Err(err) => {
                        self.notice(format!("connection error: {err}"));
                        if let Some(mut socket) = self.socket.take() {
                            socket.close().await;
                        }
                        vec![LinkEvent::TransportError, LinkEvent::Closed]
                    }
                }
            }
            Effect::StartHeartbeat => {
                // First tick fires immediately for a fast liveness signal.
                self.heartbeat = Some(interval(std::time::Duration::from_millis(
                    HEARTBEAT_INTERVAL_MS,
                )));
                Vec::new()
            }
            Effect::StopHeartbeat => {
                self.heartbeat = None;
                Vec::new()
            }
            Effect::ClearPending => {
                self.pending.clear();
                Vec::new()
            }
            Effect::ScheduleReconnect { attempt, delay } => {
                self.reconnect = Some(Box::pin(sleep(delay)));
                self.notice(format!(
                    "retrying in {}s (attempt {attempt}/{MAX_RECONNECT_ATTEMPTS})",
                    delay.as_secs()
                ));
                Vec::new()
            }
            Effect::CancelReconnect => {
                self.reconnect = None;
                Vec::new()
            }
            Effect::ReportExhausted => {
                self.notice("reconnect attempts exhausted; reconnect manually to retry");
                Vec::new()
            }
        }
    }

    async fn teardown(&mut self) {
        self.heartbeat = None;
        self.reconnect = None;
        self.pending.clear();
        if let Some(mut socket) = self.socket.take() {
            socket.close().await;
        }
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    fn notice(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!(target: "skiff::bridge", "{text}");
        let _ = self.events.send(BridgeEvent::Notice(text));
    }
}

async fn await_frame(
    socket: &mut Option<Box<dyn Socket>>,
) -> Option<Result<String, SocketError>> {
    match socket.as_mut() {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}

async fn await_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn await_deadline(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

fn now_secs() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
