//! Client session controller -- owns the client side of the scope protocol.
//!
//! One drive loop per session drains application commands and transport
//! events; it is the only writer of the registry, allocator, and promise
//! correlator. Scope activation is driven entirely by the server's system
//! frames; the client marks the dictated channels used so a duplicate
//! assignment is caught as a protocol desync.

use bytes::Bytes;
use scopewire_protocol::{
    decode_value, encode_value, response_hash, signal_hash, Channel, DisconnectReason,
    FrameReader, FrameWriter, ScopeId, SystemFrame, REASON_AUTH_REJECTED, REASON_REDIRECT,
    REASON_SHUTDOWN,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::channel_alloc::ChannelAllocator;
use crate::config::SessionConfig;
use crate::dispatch::{DispatchOutcome, Outbox, SendTarget, SignalContext};
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::peer::PeerId;
use crate::promise::{PromiseCorrelator, PromiseOutcome, ResolveOutcome};
use crate::registry::ScopeRegistry;
use crate::scope::{Scope, ScopeRuntime, ScopeState};
use crate::transport::{TransportCmd, TransportEvent, TransportHandle};

pub type UpdateFn = Box<dyn FnOnce(&mut SignalContext<'_>) -> Result<(), SessionError> + Send>;

pub enum ClientCommand {
    Connect {
        host: String,
        port: u16,
    },
    Disconnect,
    Redirect {
        host: String,
        port: u16,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    Send {
        channel: Channel,
        signal: String,
        payload: Vec<u8>,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    Call {
        channel: Channel,
        signal: String,
        payload: Vec<u8>,
        ack: oneshot::Sender<Result<oneshot::Receiver<PromiseOutcome>, SessionError>>,
    },
    UpdateScope {
        channel: Channel,
        f: UpdateFn,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Offline,
    Connecting,
    Connected,
}

/// Builds a client session: registered scopes start inactive and wait for
/// the server's Enter instructions.
pub struct ClientBuilder {
    config: SessionConfig,
    credentials: Vec<u8>,
    scopes: Vec<Box<dyn ScopeRuntime>>,
}

impl ClientBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            credentials: Vec::new(),
            scopes: Vec::new(),
        }
    }

    /// Credential blob presented to the server's authentication gate.
    pub fn credentials(mut self, credentials: Vec<u8>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn scope<S: ScopeState>(mut self, scope: Scope<S>) -> Self {
        self.scopes.push(scope.boxed());
        self
    }

    pub fn build(self) -> Result<(SessionController, ClientHandle), SessionError> {
        let allocator = ChannelAllocator::new(self.config.channel.floor, self.config.channel.capacity)?;
        let mut registry = ScopeRegistry::new();
        for scope in self.scopes {
            registry.register(scope)?;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.queue.command_depth);
        let (event_tx, _) = broadcast::channel(self.config.queue.event_capacity);

        let controller = SessionController {
            config: self.config,
            credentials: self.credentials,
            registry,
            allocator,
            correlator: PromiseCorrelator::new(),
            outbox: Outbox::new(),
            cmd_rx,
            event_tx: event_tx.clone(),
            transport_tx: None,
            state: ConnState::Offline,
            redirect_target: None,
            user_disconnect: false,
            pending_reason: None,
            reconnect_deadline: None,
            last_endpoint: None,
        };
        let handle = ClientHandle { cmd_tx, event_tx };
        Ok((controller, handle))
    }
}

/// The client drive loop state. Run it with a transport:
/// `tokio::spawn(controller.run(transport))`.
pub struct SessionController {
    config: SessionConfig,
    credentials: Vec<u8>,
    registry: ScopeRegistry,
    allocator: ChannelAllocator,
    correlator: PromiseCorrelator,
    outbox: Outbox,
    cmd_rx: mpsc::Receiver<ClientCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
    transport_tx: Option<mpsc::Sender<TransportCmd>>,
    state: ConnState,
    /// Target of a redirect in flight; doubles as the "redirecting" flag
    /// that suppresses normal disconnect handling.
    redirect_target: Option<(String, u16)>,
    /// The application asked to disconnect; auto-reconnect stays quiet.
    user_disconnect: bool,
    /// Reason taken from a wire-level Disconnect frame, preferred over the
    /// transport's generic close reason.
    pending_reason: Option<DisconnectReason>,
    reconnect_deadline: Option<Instant>,
    last_endpoint: Option<(String, u16)>,
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionController {
    pub async fn run(mut self, transport: TransportHandle) {
        let TransportHandle {
            cmd_tx,
            mut event_rx,
        } = transport;
        self.transport_tx = Some(cmd_tx);

        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = maybe_cmd else { break };
                    if !self.on_command(cmd).await {
                        break;
                    }
                }
                maybe_event = event_rx.recv() => {
                    let Some(event) = maybe_event else { break };
                    self.on_transport_event(event).await;
                }
                _ = sleep_until_or_never(self.reconnect_deadline) => {
                    self.reconnect_deadline = None;
                    if let Some((host, port)) = self.last_endpoint.clone() {
                        tracing::info!(host, port, "session: reconnecting");
                        self.begin_connect(host, port).await;
                    }
                }
            }
        }
        tracing::debug!(
            outstanding = self.correlator.outstanding(),
            "session: client drive loop ended"
        );
        self.correlator.cancel_all();
    }

    async fn to_transport(&self, cmd: TransportCmd) {
        if let Some(tx) = &self.transport_tx {
            if tx.send(cmd).await.is_err() {
                tracing::warn!("session: transport task is gone");
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn begin_connect(&mut self, host: String, port: u16) {
        self.state = ConnState::Connecting;
        self.last_endpoint = Some((host.clone(), port));
        self.to_transport(TransportCmd::Connect {
            host,
            port,
            credentials: self.credentials.clone(),
        })
        .await;
    }

    fn schedule_reconnect(&mut self) {
        use rand::Rng;
        let jitter = if self.config.reconnect.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.reconnect.jitter_ms)
        };
        let delay = std::time::Duration::from_millis(self.config.reconnect.delay_ms + jitter);
        self.reconnect_deadline = Some(Instant::now() + delay);
        tracing::info!(delay_ms = delay.as_millis() as u64, "session: reconnect scheduled");
    }

    /// Returns false when the loop should stop.
    async fn on_command(&mut self, cmd: ClientCommand) -> bool {
        match cmd {
            ClientCommand::Connect { host, port } => {
                if self.state != ConnState::Offline {
                    tracing::warn!("session: connect ignored, not offline");
                } else {
                    self.user_disconnect = false;
                    self.begin_connect(host, port).await;
                }
            }
            ClientCommand::Disconnect => {
                self.user_disconnect = true;
                self.reconnect_deadline = None;
                if self.state != ConnState::Offline {
                    let frame = SystemFrame::Disconnect {
                        reason: REASON_SHUTDOWN,
                    }
                    .encode(self.allocator.system_channel());
                    self.to_transport(TransportCmd::Send {
                        peer: PeerId::HOST,
                        frame,
                    })
                    .await;
                    self.to_transport(TransportCmd::Disconnect {
                        reason: REASON_SHUTDOWN,
                    })
                    .await;
                }
            }
            ClientCommand::Redirect { host, port, ack } => {
                let result = self.start_redirect(host, port).await;
                let _ = ack.send(result);
            }
            ClientCommand::Send {
                channel,
                signal,
                payload,
                ack,
            } => {
                let _ = ack.send(self.send_one_way(channel, &signal, payload).await);
            }
            ClientCommand::Call {
                channel,
                signal,
                payload,
                ack,
            } => {
                let _ = ack.send(self.send_two_way(channel, &signal, payload).await);
            }
            ClientCommand::UpdateScope { channel, f, ack } => {
                let result = self.update_scope(channel, f);
                let _ = ack.send(result);
                self.flush(channel).await;
            }
            ClientCommand::Shutdown => return false,
        }
        true
    }

    async fn start_redirect(&mut self, host: String, port: u16) -> Result<(), SessionError> {
        if self.redirect_target.is_some() {
            return Err(SessionError::AlreadyRedirecting);
        }
        tracing::info!(host, port, "session: redirecting");
        self.emit(SessionEvent::Redirecting {
            host: host.clone(),
            port: port as u32,
        });
        self.redirect_target = Some((host.clone(), port));
        self.reconnect_deadline = None;
        if self.state == ConnState::Offline {
            self.begin_connect(host, port).await;
        } else {
            // The disconnect handler continues the redirect.
            self.to_transport(TransportCmd::Disconnect {
                reason: REASON_REDIRECT,
            })
            .await;
        }
        Ok(())
    }

    async fn send_one_way(
        &mut self,
        channel: Channel,
        signal: &str,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        if self.state != ConnState::Connected {
            return Err(SessionError::NotConnected);
        }
        if self.registry.active(channel).is_none() {
            return Err(SessionError::UnboundChannel(channel));
        }
        let mut w = FrameWriter::new();
        w.u16(channel).u32(signal_hash(signal)).raw(&payload);
        self.to_transport(TransportCmd::Send {
            peer: PeerId::HOST,
            frame: w.freeze(),
        })
        .await;
        Ok(())
    }

    async fn send_two_way(
        &mut self,
        channel: Channel,
        signal: &str,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<PromiseOutcome>, SessionError> {
        if self.state != ConnState::Connected {
            return Err(SessionError::NotConnected);
        }
        if self.registry.active(channel).is_none() {
            return Err(SessionError::UnboundChannel(channel));
        }
        let (promise_id, rx) = self
            .correlator
            .enqueue(PeerId::HOST, response_hash(signal));
        let mut w = FrameWriter::new();
        w.u16(channel)
            .u32(signal_hash(signal))
            .u32(promise_id)
            .raw(&payload);
        self.to_transport(TransportCmd::Send {
            peer: PeerId::HOST,
            frame: w.freeze(),
        })
        .await;
        Ok(rx)
    }

    fn update_scope(&mut self, channel: Channel, f: UpdateFn) -> Result<(), SessionError> {
        let Self {
            registry, outbox, ..
        } = self;
        let scope = registry
            .active_mut(channel)
            .ok_or(SessionError::UnboundChannel(channel))?;
        scope.update(channel, Some(PeerId::HOST), outbox, f)
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.state = ConnState::Connected;
                let was_redirect = self.redirect_target.take().is_some();
                if was_redirect {
                    // Auto-reconnect re-arms now that the redirect landed.
                    tracing::info!("session: redirect complete");
                }
                self.emit(SessionEvent::Connected);
            }
            TransportEvent::ConnectFailed => {
                self.state = ConnState::Offline;
                self.emit(SessionEvent::ConnectFailed);
                if self.redirect_target.take().is_some() {
                    tracing::warn!("session: redirect target unreachable");
                } else if self.config.reconnect.auto && !self.user_disconnect {
                    self.schedule_reconnect();
                }
            }
            TransportEvent::Disconnected { reason } => {
                let reason = self.pending_reason.take().unwrap_or(reason);
                self.on_disconnected(reason).await;
            }
            TransportEvent::Received { frame, .. } => {
                self.on_frame(frame).await;
            }
            TransportEvent::PeerConnected { .. } | TransportEvent::PeerDisconnected { .. } => {
                tracing::debug!("session: server-side transport event ignored");
            }
        }
    }

    async fn on_disconnected(&mut self, reason: DisconnectReason) {
        self.state = ConnState::Offline;

        // Every active scope goes back to inactive.
        for channel in self.registry.active_channels() {
            if let Ok(scope_id) = self.registry.exit(channel, &mut self.outbox) {
                self.allocator.deallocate(channel);
                self.emit(SessionEvent::ScopeExited { scope_id, channel });
            }
        }
        // Exit hooks cannot talk to a dead connection.
        self.outbox.drain();

        let cancelled = self.correlator.cancel_all();
        tracing::info!(reason, cancelled, "session: disconnected");
        self.emit(SessionEvent::Disconnected { reason });

        if let Some((host, port)) = self.redirect_target.clone() {
            self.begin_connect(host, port).await;
        } else if self.config.reconnect.auto
            && !self.user_disconnect
            && reason != REASON_AUTH_REJECTED
        {
            self.schedule_reconnect();
        }
    }

    async fn on_frame(&mut self, frame: Bytes) {
        let mut r = FrameReader::new(frame);
        let channel = match r.u16() {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!("session: frame without channel header: {e}");
                return;
            }
        };
        if self.allocator.is_system(channel) {
            match SystemFrame::decode(&mut r) {
                Ok(frame) => self.on_system_frame(frame).await,
                Err(e) => tracing::warn!("session: bad system frame: {e}"),
            }
        } else {
            self.on_scope_frame(channel, &mut r);
            self.flush(channel).await;
        }
    }

    async fn on_system_frame(&mut self, frame: SystemFrame) {
        match frame {
            SystemFrame::Enter {
                channel,
                scope_id,
                snapshot,
            } => {
                self.enter_scope(scope_id, channel, snapshot);
                self.flush(channel).await;
            }
            SystemFrame::Exit { channel } => match self.registry.exit(channel, &mut self.outbox) {
                Ok(scope_id) => {
                    self.allocator.deallocate(channel);
                    self.emit(SessionEvent::ScopeExited { scope_id, channel });
                    self.flush(channel).await;
                }
                Err(e) => tracing::warn!(channel, "session: exit dropped: {e}"),
            },
            SystemFrame::Switch {
                prev_channel,
                new_channel,
                scope_id,
                snapshot,
            } => {
                // Exit first, then enter; the server relies on this order.
                match self.registry.exit(prev_channel, &mut self.outbox) {
                    Ok(exited) => {
                        self.allocator.deallocate(prev_channel);
                        self.emit(SessionEvent::ScopeExited {
                            scope_id: exited,
                            channel: prev_channel,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(prev_channel, "session: switch dropped: {e}");
                        return;
                    }
                }
                self.enter_scope(scope_id, new_channel, snapshot);
                self.flush(new_channel).await;
            }
            SystemFrame::Disconnect { reason } => {
                tracing::debug!(reason, "session: disconnect notice");
                self.pending_reason = Some(reason);
            }
            SystemFrame::Redirect { host, port } => {
                if let Err(e) = self.start_redirect(host, port as u16).await {
                    tracing::warn!("session: server redirect dropped: {e}");
                }
            }
        }
    }

    fn enter_scope(&mut self, scope_id: ScopeId, channel: Channel, snapshot: Bytes) {
        if let Err(e) = self.allocator.allocate_manual(channel) {
            tracing::warn!(channel, scope_id, "session: enter dropped: {e}");
            return;
        }
        let mut snapshot = FrameReader::new(snapshot);
        match self
            .registry
            .enter(scope_id, channel, &mut snapshot, &mut self.outbox)
        {
            Ok(changed) => {
                tracing::info!(scope_id, channel, "session: scope entered");
                self.emit(SessionEvent::ScopeEntered { scope_id, channel });
                for var_id in changed {
                    self.emit(SessionEvent::VariableChanged { channel, var_id });
                }
            }
            Err(e) => {
                self.allocator.deallocate(channel);
                tracing::warn!(channel, scope_id, "session: enter dropped: {e}");
            }
        }
    }

    fn on_scope_frame(&mut self, channel: Channel, r: &mut FrameReader) {
        let Self {
            registry,
            outbox,
            correlator,
            ..
        } = self;
        let Some(scope) = registry.active_mut(channel) else {
            tracing::warn!(
                channel,
                "session: {}",
                SessionError::UnboundChannel(channel)
            );
            return;
        };
        match scope.dispatch(channel, PeerId::HOST, Some(PeerId::HOST), outbox, r) {
            Ok(DispatchOutcome::Handled) => {}
            Ok(DispatchOutcome::VarChanged(var_id)) => {
                self.emit(SessionEvent::VariableChanged { channel, var_id });
            }
            Ok(DispatchOutcome::Unbound { hash }) => {
                match correlator.try_resolve(PeerId::HOST, hash, r) {
                    Ok(ResolveOutcome::Resolved) => {}
                    Ok(ResolveOutcome::UnknownPromise(id)) => {
                        tracing::warn!(
                            channel,
                            "session: {}",
                            SessionError::UnknownPromise {
                                peer: PeerId::HOST,
                                id
                            }
                        );
                    }
                    Ok(ResolveOutcome::NotAResponse) => {
                        tracing::warn!(
                            channel,
                            "session: {}",
                            SessionError::UnboundSignal { channel, hash }
                        );
                    }
                    Err(e) => tracing::warn!(channel, "session: response dropped: {e}"),
                }
            }
            Err(e) => tracing::warn!(channel, "session: dispatch failed: {e}"),
        }
    }

    /// Push owner-side variable diffs for `channel`, then drain the outbox.
    async fn flush(&mut self, channel: Channel) {
        if let Some(scope) = self.registry.active_mut(channel) {
            for op in scope.take_var_ops() {
                let mut w = FrameWriter::new();
                w.u16(channel)
                    .u32(scopewire_protocol::VAR_OP_SIGNAL)
                    .raw(&op);
                self.outbox.queue(SendTarget::Members(channel), w.freeze());
            }
        }
        // Both send targets collapse onto the single remote endpoint.
        for (_, frame) in self.outbox.drain() {
            if self.state != ConnState::Connected {
                tracing::debug!("session: outbound frame dropped while offline");
                continue;
            }
            self.to_transport(TransportCmd::Send {
                peer: PeerId::HOST,
                frame,
            })
            .await;
        }
    }
}

/// Cloneable application-side handle onto a running client session.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<ClientCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl ClientHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    async fn command(&self, cmd: ClientCommand) -> Result<(), SessionError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SessionError::EngineClosed)
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<(), SessionError> {
        self.command(ClientCommand::Connect {
            host: host.to_string(),
            port,
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.command(ClientCommand::Disconnect).await
    }

    /// Refuses with `AlreadyRedirecting` while a redirect is in flight.
    pub async fn redirect(&self, host: &str, port: u16) -> Result<(), SessionError> {
        let (ack, ack_rx) = oneshot::channel();
        self.command(ClientCommand::Redirect {
            host: host.to_string(),
            port,
            ack,
        })
        .await?;
        ack_rx.await.map_err(|_| SessionError::EngineClosed)?
    }

    /// One-way signal to the scope active on `channel`.
    pub async fn send<A: Serialize>(
        &self,
        channel: Channel,
        signal: &str,
        args: &A,
    ) -> Result<(), SessionError> {
        let (ack, ack_rx) = oneshot::channel();
        self.command(ClientCommand::Send {
            channel,
            signal: signal.to_string(),
            payload: encode_value(args)?,
            ack,
        })
        .await?;
        ack_rx.await.map_err(|_| SessionError::EngineClosed)?
    }

    /// Two-way call: resolves with the remote handler's return value, or
    /// `PromiseCancelled` if the connection drops first. No timeout.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        channel: Channel,
        signal: &str,
        args: &A,
    ) -> Result<R, SessionError> {
        let (ack, ack_rx) = oneshot::channel();
        self.command(ClientCommand::Call {
            channel,
            signal: signal.to_string(),
            payload: encode_value(args)?,
            ack,
        })
        .await?;
        let rx = ack_rx.await.map_err(|_| SessionError::EngineClosed)??;
        match rx.await {
            Ok(PromiseOutcome::Resolved(payload)) => Ok(decode_value(&payload)?),
            Ok(PromiseOutcome::Cancelled) => Err(SessionError::PromiseCancelled),
            Err(_) => Err(SessionError::EngineClosed),
        }
    }

    /// Run a closure against an active scope's context (variable mutation,
    /// sends) on the drive loop.
    pub async fn update_scope(
        &self,
        channel: Channel,
        f: impl FnOnce(&mut SignalContext<'_>) -> Result<(), SessionError> + Send + 'static,
    ) -> Result<(), SessionError> {
        let (ack, ack_rx) = oneshot::channel();
        self.command(ClientCommand::UpdateScope {
            channel,
            f: Box::new(f),
            ack,
        })
        .await?;
        ack_rx.await.map_err(|_| SessionError::EngineClosed)?
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.command(ClientCommand::Shutdown).await
    }
}
