//! Server peer manager -- scope membership, authentication gate, and the
//! server side of the scope protocol.
//!
//! Every registered scope is activated at build time (fixed channel or
//! allocator grant) and stays active for the server's lifetime; peers are
//! admitted into member sets and told which channel maps to which scope
//! type via Enter/Exit/Switch control frames. One drive loop owns all of
//! it, single-writer.

use std::collections::HashMap;

use bytes::Bytes;
use scopewire_protocol::{
    decode_value, encode_value, response_hash, signal_hash, Channel, DisconnectReason,
    FrameReader, FrameWriter, ScopeId, SystemFrame, REASON_AUTH_REJECTED, REASON_SHUTDOWN,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::channel_alloc::ChannelAllocator;
use crate::client::UpdateFn;
use crate::config::SessionConfig;
use crate::dispatch::{DispatchOutcome, Outbox, SendTarget};
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::peer::{Peer, PeerId};
use crate::promise::{PromiseCorrelator, PromiseOutcome, ResolveOutcome};
use crate::registry::ScopeRegistry;
use crate::scope::{Scope, ScopeRuntime, ScopeState};
use crate::transport::{TransportCmd, TransportEvent, TransportHandle};

/// Pass/fail gate over a connecting peer's credential blob.
pub type AuthGate = Box<dyn Fn(PeerId, &[u8]) -> bool + Send + Sync>;

pub enum ServerCommand {
    AddPeer {
        channel: Channel,
        peer: PeerId,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    RemovePeer {
        channel: Channel,
        peer: PeerId,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    SwitchPeer {
        peer: PeerId,
        from: Channel,
        to: Channel,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    Send {
        channel: Channel,
        peer: Option<PeerId>,
        signal: String,
        payload: Vec<u8>,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    Broadcast {
        channel: Channel,
        signal: String,
        payload: Vec<u8>,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    Call {
        peer: PeerId,
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
    DisconnectPeer {
        peer: PeerId,
        reason: DisconnectReason,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    RedirectPeer {
        peer: PeerId,
        host: String,
        port: u16,
        /// Redirect back to this same host: suppress departure announcements
        /// for the short disconnect window.
        to_self: bool,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown,
}

/// Builds a server session. Setup errors (duplicate scopes, taken channels,
/// missing default scope) are fatal here, before anything runs.
pub struct ServerBuilder {
    config: SessionConfig,
    scopes: Vec<(Box<dyn ScopeRuntime>, Option<Channel>)>,
    default_scope: Option<ScopeId>,
    auth: AuthGate,
}

impl ServerBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            scopes: Vec::new(),
            default_scope: None,
            auth: Box::new(|_, _| true),
        }
    }

    pub fn scope<S: ScopeState>(mut self, scope: Scope<S>) -> Self {
        self.scopes.push((scope.boxed(), None));
        self
    }

    /// Register a scope bound to a fixed, externally-agreed channel.
    pub fn scope_on_channel<S: ScopeState>(mut self, scope: Scope<S>, channel: Channel) -> Self {
        self.scopes.push((scope.boxed(), Some(channel)));
        self
    }

    /// Every successfully-authenticated peer is auto-added to this scope.
    pub fn default_scope(mut self, scope_id: ScopeId) -> Self {
        self.default_scope = Some(scope_id);
        self
    }

    pub fn auth_gate(mut self, f: impl Fn(PeerId, &[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.auth = Box::new(f);
        self
    }

    pub fn build(self) -> Result<(PeerManager, ServerHandle), SessionError> {
        let mut allocator =
            ChannelAllocator::new(self.config.channel.floor, self.config.channel.capacity)?;
        let mut registry = ScopeRegistry::new();
        let mut members: HashMap<Channel, Vec<PeerId>> = HashMap::new();
        let mut outbox = Outbox::new();

        for (scope, manual) in self.scopes {
            let scope_id = scope.scope_id();
            registry.register(scope)?;
            let channel = match manual {
                Some(channel) => {
                    allocator.allocate_manual(channel)?;
                    channel
                }
                None => allocator.allocate()?,
            };
            registry.enter(scope_id, channel, &mut FrameReader::new(Bytes::new()), &mut outbox)?;
            members.insert(channel, Vec::new());
            tracing::info!(scope_id, channel, "server: scope activated");
        }
        // Enter hooks ran with no members; their sends have nowhere to go.
        outbox.drain();

        let default_channel = self
            .default_scope
            .and_then(|id| registry.channel_of(id))
            .ok_or(SessionError::DefaultScopeRequired)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.queue.command_depth);
        let (event_tx, _) = broadcast::channel(self.config.queue.event_capacity);

        let manager = PeerManager {
            registry,
            allocator,
            correlator: PromiseCorrelator::new(),
            outbox,
            peers: HashMap::new(),
            members,
            last_sender: HashMap::new(),
            default_channel,
            auth: self.auth,
            cmd_rx,
            event_tx: event_tx.clone(),
            transport_tx: None,
        };
        let handle = ServerHandle { cmd_tx, event_tx };
        Ok((manager, handle))
    }
}

/// The server drive loop state. Run it with a transport:
/// `tokio::spawn(manager.run(transport))`.
pub struct PeerManager {
    registry: ScopeRegistry,
    allocator: ChannelAllocator,
    correlator: PromiseCorrelator,
    outbox: Outbox,
    peers: HashMap<PeerId, Peer>,
    members: HashMap<Channel, Vec<PeerId>>,
    /// Sender of the last inbound signal per scope; defaults reply-style
    /// sends.
    last_sender: HashMap<Channel, PeerId>,
    default_channel: Channel,
    auth: AuthGate,
    cmd_rx: mpsc::Receiver<ServerCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
    transport_tx: Option<mpsc::Sender<TransportCmd>>,
}

impl PeerManager {
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
            }
        }
        tracing::info!(
            peers = self.peers.len(),
            outstanding = self.correlator.outstanding(),
            "server: drive loop ended"
        );
        self.correlator.cancel_all();
    }

    async fn to_transport(&self, cmd: TransportCmd) {
        if let Some(tx) = &self.transport_tx {
            if tx.send(cmd).await.is_err() {
                tracing::warn!("server: transport task is gone");
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn system_channel(&self) -> Channel {
        self.allocator.system_channel()
    }

    /// Returns false when the loop should stop.
    async fn on_command(&mut self, cmd: ServerCommand) -> bool {
        match cmd {
            ServerCommand::AddPeer { channel, peer, ack } => {
                let result = self.add_peer(channel, peer, true);
                let _ = ack.send(result);
                self.flush(channel).await;
            }
            ServerCommand::RemovePeer { channel, peer, ack } => {
                let result = self.remove_peer(channel, peer, true);
                let _ = ack.send(result);
                self.flush(channel).await;
            }
            ServerCommand::SwitchPeer {
                peer,
                from,
                to,
                ack,
            } => {
                let result = self.switch_peer(peer, from, to);
                let _ = ack.send(result);
                self.flush(to).await;
            }
            ServerCommand::Send {
                channel,
                peer,
                signal,
                payload,
                ack,
            } => {
                let _ = ack.send(self.send_one_way(channel, peer, &signal, payload).await);
            }
            ServerCommand::Broadcast {
                channel,
                signal,
                payload,
                ack,
            } => {
                let _ = ack.send(self.broadcast(channel, &signal, payload).await);
            }
            ServerCommand::Call {
                peer,
                channel,
                signal,
                payload,
                ack,
            } => {
                let _ = ack.send(self.send_two_way(peer, channel, &signal, payload).await);
            }
            ServerCommand::UpdateScope { channel, f, ack } => {
                let result = self.update_scope(channel, f);
                let _ = ack.send(result);
                self.flush(channel).await;
            }
            ServerCommand::DisconnectPeer { peer, reason, ack } => {
                let result = self.disconnect_peer(peer, reason).await;
                let _ = ack.send(result);
            }
            ServerCommand::RedirectPeer {
                peer,
                host,
                port,
                to_self,
                ack,
            } => {
                let result = self.redirect_peer(peer, &host, port, to_self).await;
                let _ = ack.send(result);
            }
            ServerCommand::Shutdown => {
                self.shutdown().await;
                return false;
            }
        }
        true
    }

    fn add_peer(
        &mut self,
        channel: Channel,
        peer: PeerId,
        announce: bool,
    ) -> Result<(), SessionError> {
        if !self.peers.contains_key(&peer) {
            return Err(SessionError::UnknownPeer(peer));
        }
        let Some(scope) = self.registry.active(channel) else {
            return Err(SessionError::UnboundChannel(channel));
        };
        let scope_id = scope.scope_id();
        let snapshot = scope.snapshot()?;

        let members = self.members.entry(channel).or_default();
        if members.contains(&peer) {
            tracing::debug!(channel, %peer, "server: peer already a member");
            return Ok(());
        }
        members.push(peer);

        if announce {
            let frame = SystemFrame::Enter {
                channel,
                scope_id,
                snapshot,
            }
            .encode(self.system_channel());
            self.outbox.queue(SendTarget::Peer(peer), frame);
        }
        tracing::info!(channel, scope_id, %peer, "server: peer joined scope");
        self.emit(SessionEvent::PeerJoined { channel, peer });
        Ok(())
    }

    fn remove_peer(
        &mut self,
        channel: Channel,
        peer: PeerId,
        announce: bool,
    ) -> Result<(), SessionError> {
        let Some(members) = self.members.get_mut(&channel) else {
            return Err(SessionError::UnboundChannel(channel));
        };
        let Some(position) = members.iter().position(|m| *m == peer) else {
            return Ok(());
        };
        members.remove(position);

        if announce && self.peers.contains_key(&peer) {
            let frame = SystemFrame::Exit { channel }.encode(self.system_channel());
            self.outbox.queue(SendTarget::Peer(peer), frame);
        }
        tracing::info!(channel, %peer, "server: peer left scope");
        self.emit(SessionEvent::PeerLeft { channel, peer });
        Ok(())
    }

    /// Hand a peer over from one scope to another with a single Switch
    /// instruction, preserving the exit-then-enter order on the peer.
    fn switch_peer(
        &mut self,
        peer: PeerId,
        from: Channel,
        to: Channel,
    ) -> Result<(), SessionError> {
        if !self.peers.contains_key(&peer) {
            return Err(SessionError::UnknownPeer(peer));
        }
        let Some(target) = self.registry.active(to) else {
            return Err(SessionError::UnboundChannel(to));
        };
        let scope_id = target.scope_id();
        let snapshot = target.snapshot()?;
        if self.registry.active(from).is_none() {
            return Err(SessionError::UnboundChannel(from));
        }

        if let Some(members) = self.members.get_mut(&from) {
            members.retain(|m| *m != peer);
        }
        self.emit(SessionEvent::PeerLeft {
            channel: from,
            peer,
        });
        self.members.entry(to).or_default().push(peer);

        let frame = SystemFrame::Switch {
            prev_channel: from,
            new_channel: to,
            scope_id,
            snapshot,
        }
        .encode(self.system_channel());
        self.outbox.queue(SendTarget::Peer(peer), frame);

        tracing::info!(from, to, scope_id, %peer, "server: peer switched scope");
        self.emit(SessionEvent::PeerJoined { channel: to, peer });
        Ok(())
    }

    async fn send_one_way(
        &mut self,
        channel: Channel,
        peer: Option<PeerId>,
        signal: &str,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        if self.registry.active(channel).is_none() {
            return Err(SessionError::UnboundChannel(channel));
        }
        // Reply-style default: whoever sent the last inbound signal here.
        let target = peer
            .or_else(|| self.last_sender.get(&channel).copied())
            .ok_or(SessionError::NoReplyTarget)?;
        if !self.peers.contains_key(&target) {
            return Err(SessionError::UnknownPeer(target));
        }
        let mut w = FrameWriter::new();
        w.u16(channel).u32(signal_hash(signal)).raw(&payload);
        self.to_transport(TransportCmd::Send {
            peer: target,
            frame: w.freeze(),
        })
        .await;
        Ok(())
    }

    async fn broadcast(
        &mut self,
        channel: Channel,
        signal: &str,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        if self.registry.active(channel).is_none() {
            return Err(SessionError::UnboundChannel(channel));
        }
        let mut w = FrameWriter::new();
        w.u16(channel).u32(signal_hash(signal)).raw(&payload);
        self.outbox.queue(SendTarget::Members(channel), w.freeze());
        self.flush(channel).await;
        Ok(())
    }

    async fn send_two_way(
        &mut self,
        peer: PeerId,
        channel: Channel,
        signal: &str,
        payload: Vec<u8>,
    ) -> Result<oneshot::Receiver<PromiseOutcome>, SessionError> {
        if !self.peers.contains_key(&peer) {
            return Err(SessionError::UnknownPeer(peer));
        }
        if self.registry.active(channel).is_none() {
            return Err(SessionError::UnboundChannel(channel));
        }
        let (promise_id, rx) = self.correlator.enqueue(peer, response_hash(signal));
        let mut w = FrameWriter::new();
        w.u16(channel)
            .u32(signal_hash(signal))
            .u32(promise_id)
            .raw(&payload);
        self.to_transport(TransportCmd::Send {
            peer,
            frame: w.freeze(),
        })
        .await;
        Ok(rx)
    }

    fn update_scope(&mut self, channel: Channel, f: UpdateFn) -> Result<(), SessionError> {
        let reply_to = self.last_sender.get(&channel).copied();
        let Self {
            registry, outbox, ..
        } = self;
        let scope = registry
            .active_mut(channel)
            .ok_or(SessionError::UnboundChannel(channel))?;
        scope.update(channel, reply_to, outbox, f)
    }

    async fn disconnect_peer(
        &mut self,
        peer: PeerId,
        reason: DisconnectReason,
    ) -> Result<(), SessionError> {
        if !self.peers.contains_key(&peer) {
            return Err(SessionError::UnknownPeer(peer));
        }
        let frame = SystemFrame::Disconnect { reason }.encode(self.system_channel());
        self.to_transport(TransportCmd::Send { peer, frame }).await;
        self.to_transport(TransportCmd::DisconnectPeer { peer, reason })
            .await;
        Ok(())
    }

    async fn redirect_peer(
        &mut self,
        peer: PeerId,
        host: &str,
        port: u16,
        to_self: bool,
    ) -> Result<(), SessionError> {
        let Some(record) = self.peers.get_mut(&peer) else {
            return Err(SessionError::UnknownPeer(peer));
        };
        record.soft_disconnect = to_self;
        let frame = SystemFrame::Redirect {
            host: host.to_string(),
            port: port as u32,
        }
        .encode(self.system_channel());
        self.to_transport(TransportCmd::Send { peer, frame }).await;
        tracing::info!(%peer, host, port, to_self, "server: peer redirected");
        Ok(())
    }

    async fn shutdown(&mut self) {
        tracing::info!(peers = self.peers.len(), "server: shutting down");
        let peer_ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in peer_ids {
            if let Some(record) = self.peers.get_mut(&peer) {
                record.send_exit_on_disconnect = false;
            }
            let frame = SystemFrame::Disconnect {
                reason: REASON_SHUTDOWN,
            }
            .encode(self.system_channel());
            self.to_transport(TransportCmd::Send { peer, frame }).await;
            self.to_transport(TransportCmd::DisconnectPeer {
                peer,
                reason: REASON_SHUTDOWN,
            })
            .await;
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected { peer, credentials } => {
                self.on_peer_connected(peer, credentials).await;
            }
            TransportEvent::PeerDisconnected { peer } => {
                self.on_peer_disconnected(peer).await;
            }
            TransportEvent::Received { peer, frame } => {
                self.on_frame(peer, frame).await;
            }
            TransportEvent::Connected
            | TransportEvent::ConnectFailed
            | TransportEvent::Disconnected { .. } => {
                tracing::debug!("server: client-side transport event ignored");
            }
        }
    }

    async fn on_peer_connected(&mut self, peer: PeerId, credentials: Bytes) {
        let mut record = Peer::new(peer);
        if !(self.auth)(peer, &credentials) {
            tracing::warn!(%peer, "server: authentication rejected");
            self.peers.insert(peer, record);
            self.emit(SessionEvent::AuthRejected { peer });
            let _ = self.disconnect_peer(peer, REASON_AUTH_REJECTED).await;
            return;
        }
        record.authenticated = true;
        self.peers.insert(peer, record);
        tracing::info!(%peer, "server: peer authenticated");

        // Every authenticated peer lands in the default scope.
        if let Err(e) = self.add_peer(self.default_channel, peer, true) {
            tracing::warn!(%peer, "server: default scope admission failed: {e}");
        }
        self.flush(self.default_channel).await;
    }

    async fn on_peer_disconnected(&mut self, peer: PeerId) {
        let Some(record) = self.peers.remove(&peer) else {
            return;
        };
        let announce = record.send_exit_on_disconnect && !record.soft_disconnect;

        let affected: Vec<Channel> = self
            .members
            .iter()
            .filter(|(_, members)| members.contains(&peer))
            .map(|(channel, _)| *channel)
            .collect();
        for channel in affected {
            if let Some(members) = self.members.get_mut(&channel) {
                members.retain(|m| *m != peer);
            }
            if announce {
                // Attempted best-effort; the transport may already be gone.
                let frame = SystemFrame::Exit { channel }.encode(self.system_channel());
                self.to_transport(TransportCmd::Send { peer, frame }).await;
            }
            if !record.soft_disconnect {
                self.emit(SessionEvent::PeerLeft { channel, peer });
            }
        }

        self.last_sender.retain(|_, sender| *sender != peer);
        let cancelled = self.correlator.cancel_peer(peer);
        tracing::info!(%peer, cancelled, soft = record.soft_disconnect, "server: peer disconnected");
    }

    async fn on_frame(&mut self, peer: PeerId, frame: Bytes) {
        let mut r = FrameReader::new(frame);
        let channel = match r.u16() {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(%peer, "server: frame without channel header: {e}");
                return;
            }
        };
        if self.allocator.is_system(channel) {
            match SystemFrame::decode(&mut r) {
                Ok(SystemFrame::Disconnect { reason }) => {
                    tracing::debug!(%peer, reason, "server: peer announced disconnect");
                }
                Ok(other) => {
                    tracing::warn!(%peer, ?other, "server: unexpected system frame from peer");
                }
                Err(e) => tracing::warn!(%peer, "server: bad system frame: {e}"),
            }
            return;
        }

        if !self.peers.get(&peer).is_some_and(|p| p.authenticated) {
            tracing::warn!(%peer, channel, "server: frame from unauthenticated peer dropped");
            return;
        }
        self.last_sender.insert(channel, peer);
        self.on_scope_frame(peer, channel, &mut r);
        self.flush(channel).await;
    }

    fn on_scope_frame(&mut self, peer: PeerId, channel: Channel, r: &mut FrameReader) {
        let Self {
            registry,
            outbox,
            correlator,
            ..
        } = self;
        let Some(scope) = registry.active_mut(channel) else {
            tracing::warn!(
                %peer,
                channel,
                "server: {}",
                SessionError::UnboundChannel(channel)
            );
            return;
        };
        match scope.dispatch(channel, peer, Some(peer), outbox, r) {
            Ok(DispatchOutcome::Handled) => {}
            Ok(DispatchOutcome::VarChanged(var_id)) => {
                self.emit(SessionEvent::VariableChanged { channel, var_id });
            }
            Ok(DispatchOutcome::Unbound { hash }) => {
                match correlator.try_resolve(peer, hash, r) {
                    Ok(ResolveOutcome::Resolved) => {}
                    Ok(ResolveOutcome::UnknownPromise(id)) => {
                        tracing::warn!(
                            channel,
                            "server: {}",
                            SessionError::UnknownPromise { peer, id }
                        );
                    }
                    Ok(ResolveOutcome::NotAResponse) => {
                        tracing::warn!(
                            %peer,
                            channel,
                            "server: {}",
                            SessionError::UnboundSignal { channel, hash }
                        );
                    }
                    Err(e) => tracing::warn!(%peer, channel, "server: response dropped: {e}"),
                }
            }
            Err(e) => tracing::warn!(%peer, channel, "server: dispatch failed: {e}"),
        }
    }

    /// Push owner-side variable diffs for `channel`, then drain the outbox,
    /// expanding member targets to the current member sets.
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
        for (target, frame) in self.outbox.drain() {
            match target {
                SendTarget::Peer(peer) => {
                    self.to_transport(TransportCmd::Send { peer, frame }).await;
                }
                SendTarget::Members(member_channel) => {
                    let peers = self
                        .members
                        .get(&member_channel)
                        .cloned()
                        .unwrap_or_default();
                    match peers.len() {
                        0 => {}
                        1 => {
                            self.to_transport(TransportCmd::Send {
                                peer: peers[0],
                                frame,
                            })
                            .await;
                        }
                        _ => {
                            self.to_transport(TransportCmd::SendMany { peers, frame }).await;
                        }
                    }
                }
            }
        }
    }
}

/// Cloneable application-side handle onto a running server session.
#[derive(Clone)]
pub struct ServerHandle {
    cmd_tx: mpsc::Sender<ServerCommand>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl ServerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    async fn command(&self, cmd: ServerCommand) -> Result<(), SessionError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SessionError::EngineClosed)
    }

    async fn acked<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> ServerCommand,
    ) -> Result<T, SessionError> {
        let (ack, ack_rx) = oneshot::channel();
        self.command(build(ack)).await?;
        ack_rx.await.map_err(|_| SessionError::EngineClosed)?
    }

    /// Admit a connected peer into a scope, announcing it with an Enter
    /// frame plus the full variable snapshot.
    pub async fn add_peer(&self, channel: Channel, peer: PeerId) -> Result<(), SessionError> {
        self.acked(|ack| ServerCommand::AddPeer { channel, peer, ack })
            .await
    }

    pub async fn remove_peer(&self, channel: Channel, peer: PeerId) -> Result<(), SessionError> {
        self.acked(|ack| ServerCommand::RemovePeer { channel, peer, ack })
            .await
    }

    /// Hand a peer over between scopes with a single Switch instruction.
    pub async fn switch_peer(
        &self,
        peer: PeerId,
        from: Channel,
        to: Channel,
    ) -> Result<(), SessionError> {
        self.acked(|ack| ServerCommand::SwitchPeer {
            peer,
            from,
            to,
            ack,
        })
        .await
    }

    /// One-way signal. With `peer` unset it goes reply-style to whoever
    /// sent the last inbound signal on this scope.
    pub async fn send<A: Serialize>(
        &self,
        channel: Channel,
        peer: Option<PeerId>,
        signal: &str,
        args: &A,
    ) -> Result<(), SessionError> {
        let payload = encode_value(args)?;
        self.acked(|ack| ServerCommand::Send {
            channel,
            peer,
            signal: signal.to_string(),
            payload,
            ack,
        })
        .await
    }

    pub async fn broadcast<A: Serialize>(
        &self,
        channel: Channel,
        signal: &str,
        args: &A,
    ) -> Result<(), SessionError> {
        let payload = encode_value(args)?;
        self.acked(|ack| ServerCommand::Broadcast {
            channel,
            signal: signal.to_string(),
            payload,
            ack,
        })
        .await
    }

    /// Two-way call to one peer. No timeout: resolves on response, cancels
    /// on that peer's disconnect.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        peer: PeerId,
        channel: Channel,
        signal: &str,
        args: &A,
    ) -> Result<R, SessionError> {
        let payload = encode_value(args)?;
        let rx = self
            .acked(|ack| ServerCommand::Call {
                peer,
                channel,
                signal: signal.to_string(),
                payload,
                ack,
            })
            .await?;
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
        f: impl FnOnce(&mut crate::dispatch::SignalContext<'_>) -> Result<(), SessionError>
            + Send
            + 'static,
    ) -> Result<(), SessionError> {
        self.acked(|ack| ServerCommand::UpdateScope {
            channel,
            f: Box::new(f),
            ack,
        })
        .await
    }

    pub async fn disconnect_peer(
        &self,
        peer: PeerId,
        reason: DisconnectReason,
    ) -> Result<(), SessionError> {
        self.acked(|ack| ServerCommand::DisconnectPeer { peer, reason, ack })
            .await
    }

    /// Tell a peer to reconnect elsewhere. `to_self` marks the redirect as
    /// targeting this same host so the brief disconnect is not announced.
    pub async fn redirect_peer(
        &self,
        peer: PeerId,
        host: &str,
        port: u16,
        to_self: bool,
    ) -> Result<(), SessionError> {
        self.acked(|ack| ServerCommand::RedirectPeer {
            peer,
            host: host.to_string(),
            port,
            to_self,
            ack,
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.command(ServerCommand::Shutdown).await
    }
}
