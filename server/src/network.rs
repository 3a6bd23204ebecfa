//! Cluster process: the run loop, dispatch execution and the server handle
//!
//! One task owns the local registries and every session. Transport events,
//! peer messages, handle commands and the results of async work all arrive
//! as [`ServerMessage`]s on a single channel. Anything that needs the
//! coordination store runs in a spawned task and posts its result back, so
//! state read after a store call is always re-validated in the loop.

use crate::allocator::{allocate_process_id, IdAllocator};
use crate::auth::AuthPolicy;
use crate::config::ServerConfig;
use crate::dispatch::{after_lookup, resolve_local, Origin, Resolution, Target};
use crate::entity::{NetworkEntity, Room, RoomId, Snapshot, User, UserId};
use crate::error::{Error, HandlerError, Result};
use crate::handler::{HandlerResult, Handlers, Outbox, Reply, Request, Sender};
use crate::link::{accept_peers, PeerLink, PeerMessage, PROCESS_MAP};
use crate::registry::LocalRegistries;
use crate::routing::RoutingTable;
use crate::session::{ConnectionId, Outbound, SessionState};
use crate::session_manager::SessionManager;
use crate::store::SharedStore;
use crate::transport::accept_clients;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{debug, info, warn};
use serde_json::{json, Value};
use shared::{is_reserved, EntityId, Envelope, ProcessId, Response, ScopeKind, AUTHENTICATE, STATE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

/// Events processed by the run loop
pub enum ServerMessage {
    /// A transport connection completed its handshake
    Opened {
        connection_id: ConnectionId,
        addr: Option<SocketAddr>,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Frame {
        connection_id: ConnectionId,
        text: String,
    },
    Closed {
        connection_id: ConnectionId,
    },
    /// Outcome of an authentication attempt: the user id and whether the
    /// allocator minted it
    Authenticated {
        connection_id: ConnectionId,
        result: Result<(UserId, bool)>,
    },
    /// Routing table answer for a message that missed locally
    Routed {
        envelope: Envelope,
        sender: Sender,
        kind: ScopeKind,
        id: EntityId,
        owner: Result<Option<ProcessId>>,
    },
    /// A reply produced on this process for one of its own connections
    Respond {
        connection_id: ConnectionId,
        response: Response,
    },
    Peer(PeerMessage),
    Command(Command),
}

/// Requests from a [`ServerHandle`], each acknowledged by the loop
pub enum Command {
    InsertRoom {
        room: Room,
        ack: oneshot::Sender<()>,
    },
    RemoveRoom {
        id: RoomId,
        ack: oneshot::Sender<bool>,
    },
    InsertEntity {
        entity: NetworkEntity,
        ack: oneshot::Sender<()>,
    },
    RemoveEntity {
        id: EntityId,
        ack: oneshot::Sender<bool>,
    },
    JoinRoom {
        room: RoomId,
        user: UserId,
        ack: oneshot::Sender<Result<bool>>,
    },
    LeaveRoom {
        room: RoomId,
        user: UserId,
        ack: oneshot::Sender<Result<bool>>,
    },
    PushLocal {
        user: UserId,
        response: Response,
        ack: oneshot::Sender<bool>,
    },
    BroadcastState {
        room: RoomId,
        ack: oneshot::Sender<Result<usize>>,
    },
    DisconnectUser {
        user: UserId,
        ack: oneshot::Sender<bool>,
    },
    Resident {
        kind: ScopeKind,
        id: EntityId,
        ack: oneshot::Sender<bool>,
    },
    Stats {
        ack: oneshot::Sender<ServerStats>,
    },
    Shutdown,
}

/// Counts of what one process currently holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: usize,
    pub users: usize,
    pub rooms: usize,
    pub entities: usize,
}

/// Cloneable access to a running server, for handlers and other tasks
#[derive(Clone)]
pub struct ServerHandle {
    process_id: ProcessId,
    tx: mpsc::UnboundedSender<ServerMessage>,
    allocator: IdAllocator,
    routing: RoutingTable,
    link: PeerLink,
}

impl ServerHandle {
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    async fn command<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(ServerMessage::Command(build(ack)))
            .map_err(|_| Error::ShuttingDown)?;
        done.await.map_err(|_| Error::ShuttingDown)
    }

    /// Allocates a room id, registers its route and makes it resident here
    pub async fn create_room(&self, handlers: Handlers) -> Result<RoomId> {
        let id = self.allocator.allocate(ScopeKind::Room).await?;
        let room = Room::new(id, handlers);
        self.command(|ack| Command::InsertRoom { room, ack }).await?;
        info!("Created room {} on process {}", id, self.process_id);
        Ok(id)
    }

    pub async fn destroy_room(&self, id: RoomId) -> Result<bool> {
        let removed = self.command(|ack| Command::RemoveRoom { id, ack }).await?;
        if removed {
            self.routing.deregister(ScopeKind::Room, id).await?;
            info!("Destroyed room {} on process {}", id, self.process_id);
        }
        Ok(removed)
    }

    pub async fn create_network_entity(
        &self,
        room: Option<RoomId>,
        handlers: Handlers,
        source: impl Snapshot + 'static,
    ) -> Result<EntityId> {
        let id = self.allocator.allocate(ScopeKind::NetworkEntity).await?;
        let entity = NetworkEntity::new(id, room, handlers, source);
        self.command(|ack| Command::InsertEntity { entity, ack }).await?;
        Ok(id)
    }

    pub async fn destroy_network_entity(&self, id: EntityId) -> Result<bool> {
        let removed = self.command(|ack| Command::RemoveEntity { id, ack }).await?;
        if removed {
            self.routing.deregister(ScopeKind::NetworkEntity, id).await?;
        }
        Ok(removed)
    }

    /// Adds a user (resident anywhere) to a room resident on this process
    pub async fn join_room(&self, room: RoomId, user: UserId) -> Result<bool> {
        self.command(|ack| Command::JoinRoom { room, user, ack }).await?
    }

    pub async fn leave_room(&self, room: RoomId, user: UserId) -> Result<bool> {
        self.command(|ack| Command::LeaveRoom { room, user, ack }).await?
    }

    /// Pushes `{name, data}` to a user, through the link if it lives on
    /// another process. Returns false if no process owns the user.
    pub async fn send_to_user(&self, user: UserId, name: impl Into<String>, data: Value) -> Result<bool> {
        let response = Response::push(name, data);
        let pushed = self
            .command(|ack| Command::PushLocal {
                user,
                response: response.clone(),
                ack,
            })
            .await?;
        if pushed {
            return Ok(true);
        }
        deliver_remote(&self.routing, &self.link, self.process_id, user, response).await
    }

    /// Sends the snapshots of the room's entities to every member; returns
    /// the number of members addressed
    pub async fn broadcast_state(&self, room: RoomId) -> Result<usize> {
        self.command(|ack| Command::BroadcastState { room, ack }).await?
    }

    pub async fn disconnect_user(&self, user: UserId) -> Result<bool> {
        self.command(|ack| Command::DisconnectUser { user, ack }).await
    }

    /// Owner of an entity; answered without the store when it is resident
    pub async fn locate(&self, kind: ScopeKind, id: EntityId) -> Result<Option<ProcessId>> {
        if self.command(|ack| Command::Resident { kind, id, ack }).await? {
            return Ok(Some(self.process_id));
        }
        self.routing.lookup(kind, id).await
    }

    pub async fn stats(&self) -> Result<ServerStats> {
        self.command(|ack| Command::Stats { ack }).await
    }

    pub fn shutdown(&self) -> Result<()> {
        self.tx
            .send(ServerMessage::Command(Command::Shutdown))
            .map_err(|_| Error::ShuttingDown)
    }
}

async fn deliver_remote(
    routing: &RoutingTable,
    link: &PeerLink,
    process_id: ProcessId,
    user: UserId,
    response: Response,
) -> Result<bool> {
    match routing.lookup(ScopeKind::User, user).await? {
        Some(owner) if owner != process_id => {
            link.send(
                owner,
                PeerMessage::Deliver {
                    user_id: user,
                    response,
                },
            );
            Ok(true)
        }
        _ => {
            debug!("No process owns user {}, dropping '{}'", user, response.name);
            Ok(false)
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    if is_reserved(name) || name == AUTHENTICATE {
        return Err(Error::ReservedName(name.to_string()));
    }
    Ok(())
}

/// One process of the cluster
pub struct Server {
    process_id: ProcessId,
    config: ServerConfig,
    store: SharedStore,
    allocator: IdAllocator,
    routing: RoutingTable,
    link: PeerLink,
    outbox: Outbox,
    handle: ServerHandle,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    listener: Option<TcpListener>,
    peer_listener: Option<TcpListener>,

    registries: LocalRegistries,
    sessions: SessionManager,
    globals: Handlers,
    server_handlers: Handlers,
    user_handlers: Handlers,
    auth_policy: Option<Arc<dyn AuthPolicy>>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    /// Joins the cluster: validates `config`, mints the process id, binds
    /// the peer listener and publishes its address. `listener` must already
    /// be listening for client connections.
    pub async fn new(config: ServerConfig, store: SharedStore, listener: TcpListener) -> Result<Self> {
        config.validate()?;
        let peer_bind = config
            .peer_addr
            .ok_or_else(|| Error::Configuration("peer link address is required".into()))?;
        let local_addr = listener.local_addr()?;

        let process_id = allocate_process_id(&store).await?;
        let peer_listener = TcpListener::bind(peer_bind).await?;
        let peer_addr = peer_listener.local_addr()?;

        let link = PeerLink::new(process_id, store.clone());
        link.publish(peer_addr).await?;

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let allocator = IdAllocator::new(store.clone(), process_id);
        let routing = RoutingTable::new(store.clone());
        let outbox = Outbox::new(process_id, server_tx.clone(), link.clone());
        let handle = ServerHandle {
            process_id,
            tx: server_tx.clone(),
            allocator: allocator.clone(),
            routing: routing.clone(),
            link: link.clone(),
        };
        let sessions = SessionManager::new(
            config.max_connections,
            config.max_pending_replies,
            config.reply_timeout,
        );

        info!(
            "Process {} accepting clients on {} and peers on {}",
            process_id, local_addr, peer_addr
        );

        Ok(Server {
            process_id,
            config,
            store,
            allocator,
            routing,
            link,
            outbox,
            handle,
            local_addr,
            peer_addr,
            listener: Some(listener),
            peer_listener: Some(peer_listener),
            registries: LocalRegistries::new(),
            sessions,
            globals: Handlers::new(),
            server_handlers: Handlers::new(),
            user_handlers: Handlers::new(),
            auth_policy: None,
            server_tx,
            server_rx,
        })
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn link(&self) -> PeerLink {
        self.link.clone()
    }

    /// Registers a global handler; it pre-empts scope routing for `name`
    pub fn on<F>(&mut self, name: impl Into<String>, f: F) -> Result<&mut Self>
    where
        F: Fn(Request) -> HandlerResult + Send + Sync + 'static,
    {
        let name = name.into();
        check_name(&name)?;
        self.globals.insert(name, f);
        Ok(self)
    }

    /// Registers a handler for `server`-scoped messages
    pub fn on_server<F>(&mut self, name: impl Into<String>, f: F) -> Result<&mut Self>
    where
        F: Fn(Request) -> HandlerResult + Send + Sync + 'static,
    {
        let name = name.into();
        check_name(&name)?;
        self.server_handlers.insert(name, f);
        Ok(self)
    }

    /// Registers a handler for `user`-scoped messages to local users
    pub fn on_user<F>(&mut self, name: impl Into<String>, f: F) -> Result<&mut Self>
    where
        F: Fn(Request) -> HandlerResult + Send + Sync + 'static,
    {
        let name = name.into();
        check_name(&name)?;
        self.user_handlers.insert(name, f);
        Ok(self)
    }

    pub fn set_auth_policy(&mut self, policy: impl AuthPolicy + 'static) -> &mut Self {
        self.auth_policy = Some(Arc::new(policy));
        self
    }

    /// Main loop: runs until [`ServerHandle::shutdown`]
    pub async fn run(&mut self) -> Result<()> {
        let (Some(listener), Some(peer_listener)) = (self.listener.take(), self.peer_listener.take())
        else {
            return Err(Error::Configuration("server has already run".into()));
        };

        let clients = tokio::spawn(accept_clients(listener, self.server_tx.clone()));
        let peers = tokio::spawn(accept_peers(peer_listener, self.server_tx.clone()));
        let mut sweep = interval(self.config.sweep_interval);

        info!("Process {} started", self.process_id);

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(message) => {
                            if !self.handle_message(message) {
                                break;
                            }
                        }
                        None => break,
                    }
                },

                _ = sweep.tick() => self.sweep(),
            }
        }

        clients.abort();
        peers.abort();
        self.close_all();

        let field = self.process_id.to_string();
        if let Err(e) = self.store.remove_field(PROCESS_MAP, &field).await {
            warn!("Failed to withdraw process {}: {}", self.process_id, e);
        }
        info!("Process {} stopped", self.process_id);
        Ok(())
    }

    /// Returns false when the loop should stop
    fn handle_message(&mut self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::Opened {
                connection_id,
                addr,
                outbound,
            } => self.open_connection(connection_id, addr, outbound),
            ServerMessage::Frame {
                connection_id,
                text,
            } => self.handle_frame(connection_id, &text),
            ServerMessage::Closed { connection_id } => self.close_connection(connection_id),
            ServerMessage::Authenticated {
                connection_id,
                result,
            } => self.complete_authentication(connection_id, result),
            ServerMessage::Routed {
                envelope,
                sender,
                kind,
                id,
                owner,
            } => self.finish_lookup(envelope, sender, kind, id, owner),
            ServerMessage::Respond {
                connection_id,
                response,
            } => self.respond(connection_id, response),
            ServerMessage::Peer(message) => self.handle_peer(message),
            ServerMessage::Command(command) => return self.handle_command(command),
        }
        true
    }

    fn open_connection(
        &mut self,
        connection_id: ConnectionId,
        addr: Option<SocketAddr>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) {
        if let Err(e) = self.sessions.add_session(connection_id, addr, outbound.clone()) {
            warn!("Refusing connection {} from {:?}: {}", connection_id, addr, e);
            if let Ok(text) = Response::error("error", e.to_string(), None).encode() {
                let _ = outbound.send(Outbound::Text(text));
            }
            let _ = outbound.send(Outbound::Close);
        }
    }

    fn handle_frame(&mut self, connection_id: ConnectionId, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping unparseable frame from connection {}: {}", connection_id, e);
                return;
            }
        };

        let deadline = self.sessions.slot_deadline();
        let Some(session) = self.sessions.get_mut(connection_id) else {
            debug!("Frame for unknown connection {}", connection_id);
            return;
        };

        if let Err(e) = session.admit(&envelope) {
            session.reject(&envelope, &e);
            return;
        }

        if envelope.name == AUTHENTICATE {
            self.begin_authentication(connection_id, envelope);
            return;
        }

        let Some(user_id) = session.user_id() else {
            return;
        };

        if let Some(id) = envelope.correlation_id {
            if let Err(e) = session.open_slot(id, &envelope.name, deadline) {
                session.reject(&envelope, &e);
                return;
            }
        }

        let sender = Sender {
            user_id,
            process_id: self.process_id,
            connection_id,
        };
        self.dispatch(envelope, sender, Origin::Local);
    }

    fn begin_authentication(&mut self, connection_id: ConnectionId, envelope: Envelope) {
        let Some(session) = self.sessions.get_mut(connection_id) else {
            return;
        };
        if let Err(e) = session.begin_authentication(envelope.correlation_id) {
            session.reject(&envelope, &e);
            return;
        }

        let process_id = self.process_id;
        let attempt: BoxFuture<'static, Result<(UserId, bool)>> = match &self.auth_policy {
            Some(policy) => {
                let verdict = policy.authenticate(envelope.data);
                let routing = self.routing.clone();
                async move {
                    match verdict.await {
                        Ok(user_id) => routing
                            .register(ScopeKind::User, user_id, process_id)
                            .await
                            .map(|()| (user_id, false)),
                        Err(reason) => Err(Error::AuthenticationFailed(reason)),
                    }
                }
                .boxed()
            }
            None => {
                let allocator = self.allocator.clone();
                async move { allocator.allocate(ScopeKind::User).await.map(|id| (id, true)) }.boxed()
            }
        };

        let tx = self.server_tx.clone();
        tokio::spawn(async move {
            let result = attempt.await;
            let _ = tx.send(ServerMessage::Authenticated {
                connection_id,
                result,
            });
        });
    }

    fn complete_authentication(&mut self, connection_id: ConnectionId, result: Result<(UserId, bool)>) {
        let session = match self.sessions.get_mut(connection_id) {
            Some(session) if session.state() == SessionState::Authenticating => session,
            _ => {
                debug!("Connection {} closed before authentication finished", connection_id);
                if let Ok((user_id, true)) = result {
                    self.spawn_deregister(ScopeKind::User, user_id);
                }
                return;
            }
        };

        let registries = &mut self.registries;
        let outcome = result.and_then(|(user_id, minted)| {
            let user = User {
                id: user_id,
                connection_id,
                minted,
            };
            if registries.insert_user(user) {
                Ok(user_id)
            } else {
                Err(Error::AuthenticationFailed(format!(
                    "user {} is already connected",
                    user_id
                )))
            }
        });

        match outcome {
            Ok(user_id) => {
                if let Some(Some(id)) = session.complete_authentication(user_id) {
                    session.send(&Response::ok(AUTHENTICATE, json!({ "userId": user_id }), Some(id)));
                }
                info!(
                    "Connection {} authenticated as user {} on process {}",
                    connection_id, user_id, self.process_id
                );
            }
            Err(e) => {
                warn!("Authentication failed for connection {}: {}", connection_id, e);
                let correlation_id = session.auth_correlation();
                session.send(&Response::error(AUTHENTICATE, e.to_string(), correlation_id));
                session.close();
                self.sessions.remove_session(connection_id);
            }
        }
    }

    fn close_connection(&mut self, connection_id: ConnectionId) {
        let Some(mut session) = self.sessions.remove_session(connection_id) else {
            return;
        };
        if let Some(user_id) = session.close() {
            self.release_user(user_id);
        }
    }

    fn close_all(&mut self) {
        for connection_id in self.sessions.connection_ids() {
            self.close_connection(connection_id);
        }
    }

    fn release_user(&mut self, user_id: UserId) {
        let Some(user) = self.registries.remove_user(user_id) else {
            return;
        };
        info!("User {} left process {}", user.id, self.process_id);
        if user.minted {
            self.spawn_deregister(ScopeKind::User, user.id);
        }
    }

    fn spawn_deregister(&self, kind: ScopeKind, id: EntityId) {
        let routing = self.routing.clone();
        tokio::spawn(async move {
            if let Err(e) = routing.deregister(kind, id).await {
                warn!("Failed to deregister {} {}: {}", kind, id, e);
            }
        });
    }

    fn dispatch(&mut self, envelope: Envelope, sender: Sender, origin: Origin) {
        match resolve_local(&envelope, &self.globals, &self.registries, origin) {
            Ok(Resolution::Resolved(target)) => self.execute(target, envelope, sender, origin),
            Ok(Resolution::Lookup { kind, id }) => self.spawn_lookup(envelope, sender, kind, id),
            Ok(Resolution::NotFound(reason)) => self.drop_message(&envelope, &sender, origin, &reason),
            Err(e) => self.reply_error(&envelope, sender, &e),
        }
    }

    fn spawn_lookup(&self, envelope: Envelope, sender: Sender, kind: ScopeKind, id: EntityId) {
        let routing = self.routing.clone();
        let tx = self.server_tx.clone();
        tokio::spawn(async move {
            let owner = routing.lookup(kind, id).await;
            let _ = tx.send(ServerMessage::Routed {
                envelope,
                sender,
                kind,
                id,
                owner,
            });
        });
    }

    fn finish_lookup(
        &mut self,
        envelope: Envelope,
        sender: Sender,
        kind: ScopeKind,
        id: EntityId,
        owner: Result<Option<ProcessId>>,
    ) {
        let owner = match owner {
            Ok(owner) => owner,
            Err(e) => {
                warn!("Routing lookup for {} {} failed: {}", kind, id, e);
                self.reply_error(&envelope, sender, &e);
                return;
            }
        };

        match after_lookup(kind, id, owner, self.process_id, &self.registries) {
            Resolution::Resolved(target) => self.execute(target, envelope, sender, Origin::Local),
            Resolution::NotFound(reason) => self.drop_message(&envelope, &sender, Origin::Local, &reason),
            Resolution::Lookup { .. } => {
                self.drop_message(&envelope, &sender, Origin::Local, "unresolved after lookup")
            }
        }
    }

    fn execute(&mut self, target: Target, envelope: Envelope, sender: Sender, origin: Origin) {
        let label = target.to_string();
        let handler = match target {
            Target::GlobalHandler(handler) => Some(handler),
            Target::SelfProcess => self.server_handlers.get(&envelope.name).cloned(),
            Target::LocalUser(_) => self.user_handlers.get(&envelope.name).cloned(),
            Target::LocalRoom(id) => self
                .registries
                .room(id)
                .and_then(|room| room.handlers().get(&envelope.name))
                .cloned(),
            Target::LocalNetworkEntity(id) => self
                .registries
                .entity(id)
                .and_then(|entity| entity.handlers().get(&envelope.name))
                .cloned(),
            Target::RemoteProcess(process) => {
                self.link.forward(process, envelope, sender);
                return;
            }
        };

        let Some(handler) = handler else {
            let reason = format!("no handler for '{}' on {}", envelope.name, label);
            self.drop_message(&envelope, &sender, origin, &reason);
            return;
        };

        let reply_name = envelope.name.clone();
        let reply = Reply::new(
            envelope.name.clone(),
            envelope.correlation_id,
            sender,
            self.outbox.clone(),
        );
        let request = Request {
            name: envelope.name,
            scope: envelope.scope,
            data: envelope.data,
            sender,
            reply: reply.clone(),
            server: self.handle.clone(),
        };

        if let Err(e) = handler.invoke(request) {
            if reply.is_sent() {
                warn!("Handler for '{}' on {} failed after replying: {}", reply_name, label, e);
            } else {
                reply.send(Err(e));
            }
        }
    }

    fn reply_error(&self, envelope: &Envelope, sender: Sender, error: &Error) {
        let reply = Reply::new(
            envelope.name.clone(),
            envelope.correlation_id,
            sender,
            self.outbox.clone(),
        );
        reply.send(Err(HandlerError::new(error.to_string())));
    }

    /// Target not found: nothing is sent back. A local slot is released so
    /// it does not count against the cap until it times out.
    fn drop_message(&mut self, envelope: &Envelope, sender: &Sender, origin: Origin, reason: &str) {
        debug!(
            "Dropping '{}' from user {}: {}",
            envelope.name,
            sender.user_id,
            Error::TargetNotFound(reason.to_string())
        );
        if origin != Origin::Local {
            return;
        }
        if let (Some(id), Some(session)) = (
            envelope.correlation_id,
            self.sessions.get_mut(sender.connection_id),
        ) {
            session.release_slot(id);
        }
    }

    fn respond(&mut self, connection_id: ConnectionId, response: Response) {
        match self.sessions.get_mut(connection_id) {
            Some(session) => {
                session.complete_slot(&response);
            }
            None => debug!(
                "Connection {} is gone, dropping reply '{}'",
                connection_id, response.name
            ),
        }
    }

    fn handle_peer(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::Forward { envelope, sender } => {
                debug!(
                    "Process {} received '{}' from process {}",
                    self.process_id, envelope.name, sender.process_id
                );
                self.dispatch(envelope, sender, Origin::Peer);
            }
            PeerMessage::Reply {
                connection_id,
                response,
            } => self.respond(connection_id, response),
            PeerMessage::Deliver { user_id, response } => {
                if !self.push_local(user_id, &response) {
                    debug!(
                        "User {} is not on process {}, dropping '{}'",
                        user_id, self.process_id, response.name
                    );
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::InsertRoom { room, ack } => {
                self.registries.insert_room(room);
                let _ = ack.send(());
            }
            Command::RemoveRoom { id, ack } => {
                let _ = ack.send(self.registries.remove_room(id).is_some());
            }
            Command::InsertEntity { entity, ack } => {
                self.register_entity(entity);
                let _ = ack.send(());
            }
            Command::RemoveEntity { id, ack } => {
                let _ = ack.send(self.registries.remove_entity(id).is_some());
            }
            Command::JoinRoom { room, user, ack } => {
                let result = self
                    .registries
                    .room_mut(room)
                    .map(|r| r.join(user))
                    .ok_or_else(|| Error::TargetNotFound(format!("room {}", room)));
                let _ = ack.send(result);
            }
            Command::LeaveRoom { room, user, ack } => {
                let result = self
                    .registries
                    .room_mut(room)
                    .map(|r| r.leave(user))
                    .ok_or_else(|| Error::TargetNotFound(format!("room {}", room)));
                let _ = ack.send(result);
            }
            Command::PushLocal {
                user,
                response,
                ack,
            } => {
                let _ = ack.send(self.push_local(user, &response));
            }
            Command::BroadcastState { room, ack } => {
                let _ = ack.send(self.broadcast_state(room));
            }
            Command::DisconnectUser { user, ack } => {
                let connection_id = self.registries.user(user).map(|u| u.connection_id);
                if let Some(connection_id) = connection_id {
                    self.close_connection(connection_id);
                }
                let _ = ack.send(connection_id.is_some());
            }
            Command::Resident { kind, id, ack } => {
                let _ = ack.send(self.registries.contains(kind, id));
            }
            Command::Stats { ack } => {
                let _ = ack.send(self.stats());
            }
            Command::Shutdown => {
                info!("Process {} shutting down", self.process_id);
                return false;
            }
        }
        true
    }

    /// Registers an entity and sends its first snapshot to the room it
    /// joins
    fn register_entity(&mut self, entity: NetworkEntity) {
        let update = Response::push(
            STATE,
            json!({ "entities": [{ "id": entity.id, "state": entity.snapshot() }] }),
        );
        let room = entity.room();
        debug!("Registered networkEntity {} in room {:?}", entity.id, room);
        self.registries.insert_entity(entity);

        if let Some(room) = room {
            self.push_to_members(room, &update);
        }
    }

    fn broadcast_state(&self, room: RoomId) -> Result<usize> {
        if self.registries.room(room).is_none() {
            return Err(Error::TargetNotFound(format!("room {}", room)));
        }

        let entities: Vec<Value> = self
            .registries
            .entities_in_room(room)
            .into_iter()
            .map(|entity| json!({ "id": entity.id, "state": entity.snapshot() }))
            .collect();
        let update = Response::push(STATE, json!({ "entities": entities }));
        Ok(self.push_to_members(room, &update))
    }

    fn push_to_members(&self, room: RoomId, response: &Response) -> usize {
        let members: Vec<UserId> = self
            .registries
            .room(room)
            .map(|room| room.members().collect())
            .unwrap_or_default();

        for member in &members {
            self.push_to_user(*member, response.clone());
        }
        members.len()
    }

    fn push_to_user(&self, user: UserId, response: Response) {
        if self.push_local(user, &response) {
            return;
        }

        let routing = self.routing.clone();
        let link = self.link.clone();
        let process_id = self.process_id;
        tokio::spawn(async move {
            if let Err(e) = deliver_remote(&routing, &link, process_id, user, response).await {
                warn!("Failed to push to user {}: {}", user, e);
            }
        });
    }

    fn push_local(&self, user: UserId, response: &Response) -> bool {
        self.registries
            .user(user)
            .and_then(|user| self.sessions.get(user.connection_id))
            .map(|session| session.send(response))
            .unwrap_or(false)
    }

    fn sweep(&mut self) {
        let expired = self.sessions.expire_pending(Instant::now());
        if expired > 0 {
            debug!("Process {} timed out {} pending replies", self.process_id, expired);
        }
    }

    fn stats(&self) -> ServerStats {
        ServerStats {
            connections: self.sessions.len(),
            users: self.registries.user_count(),
            rooms: self.registries.room_count(),
            entities: self.registries.entity_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::routes_key;
    use crate::store::MemoryStore;
    use shared::Scope;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> ServerConfig {
        ServerConfig::default().with_peer_addr("127.0.0.1:0".parse().unwrap())
    }

    async fn create_test_server(store: &MemoryStore, config: ServerConfig) -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Server::new(config, Arc::new(store.clone()), listener).await.unwrap()
    }

    fn open(server: &mut Server, connection_id: ConnectionId) -> mpsc::UnboundedReceiver<Outbound> {
        let (outbound, rx) = mpsc::unbounded_channel();
        server.handle_message(ServerMessage::Opened {
            connection_id,
            addr: None,
            outbound,
        });
        rx
    }

    fn frame(server: &mut Server, connection_id: ConnectionId, envelope: Envelope) {
        server.handle_message(ServerMessage::Frame {
            connection_id,
            text: envelope.encode().unwrap(),
        });
    }

    /// Processes the next event posted back by a spawned task
    async fn pump(server: &mut Server) {
        let message = timeout(Duration::from_secs(2), server.server_rx.recv())
            .await
            .expect("no event posted to the loop")
            .unwrap();
        server.handle_message(message);
    }

    fn next_response(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Response {
        match rx.try_recv() {
            Ok(Outbound::Text(text)) => Response::parse(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    async fn authenticate(
        server: &mut Server,
        connection_id: ConnectionId,
    ) -> (mpsc::UnboundedReceiver<Outbound>, UserId) {
        let mut rx = open(server, connection_id);
        frame(
            server,
            connection_id,
            Envelope::new(AUTHENTICATE, json!({})).with_correlation(1),
        );
        pump(server).await;

        let response = next_response(&mut rx);
        assert!(!response.is_error(), "authentication failed: {:?}", response);
        let user_id = response.data["userId"].as_u64().unwrap();
        (rx, user_id)
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_store_access() {
        let store = MemoryStore::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let result = Server::new(ServerConfig::default(), Arc::new(store.clone()), listener).await;

        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(store.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_new_publishes_process_record() {
        let store = MemoryStore::new();
        let server = create_test_server(&store, test_config()).await;

        let published = store
            .get_field_now(PROCESS_MAP, &server.process_id().to_string())
            .unwrap();
        assert_eq!(published, Some(server.peer_addr().to_string()));
    }

    #[tokio::test]
    async fn test_auto_assigned_user_is_routed() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;

        let (_rx, user_id) = authenticate(&mut server, 1).await;

        assert_eq!(server.stats().users, 1);
        let route = store
            .get_field_now(&routes_key(ScopeKind::User), &user_id.to_string())
            .unwrap();
        assert_eq!(route, Some(server.process_id().to_string()));
    }

    #[tokio::test]
    async fn test_messages_rejected_before_authentication() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        let mut rx = open(&mut server, 1);

        frame(&mut server, 1, Envelope::new("fire", json!(null)).with_correlation(3));

        let response = next_response(&mut rx);
        assert_eq!(response.id, Some(3));
        assert_eq!(response.error_message(), Some("not authenticated"));
    }

    #[tokio::test]
    async fn test_correlated_success_and_error_replies() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        server
            .on("echo", |request: Request| {
                request.reply.ok(request.data.clone());
                Ok(())
            })
            .unwrap()
            .on("fail", |_| Err("boom".into()))
            .unwrap();
        let (mut rx, _) = authenticate(&mut server, 1).await;

        frame(&mut server, 1, Envelope::new("echo", json!({"r": 1})).with_correlation(7));
        pump(&mut server).await;
        assert_eq!(next_response(&mut rx), Response::ok("echo", json!({"r": 1}), Some(7)));

        frame(&mut server, 1, Envelope::new("fail", json!(null)).with_correlation(7));
        pump(&mut server).await;
        let response = next_response(&mut rx);
        assert_eq!(response.id, Some(7));
        assert_eq!(response.error_message(), Some("boom"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_uncorrelated_success_sends_nothing() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        server
            .on("echo", |request: Request| {
                request.reply.ok(json!(true));
                Ok(())
            })
            .unwrap();
        let (mut rx, _) = authenticate(&mut server, 1).await;

        frame(&mut server, 1, Envelope::new("echo", json!(null)));

        assert!(server.server_rx.try_recv().is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error_reply() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        server.on("explode", |_| panic!("bad state")).unwrap();
        let (mut rx, _) = authenticate(&mut server, 1).await;

        frame(&mut server, 1, Envelope::new("explode", json!(null)).with_correlation(2));
        pump(&mut server).await;

        let response = next_response(&mut rx);
        assert_eq!(response.error_message(), Some("handler panicked: bad state"));
    }

    #[tokio::test]
    async fn test_reserved_names_cannot_be_registered_or_sent() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        assert!(matches!(server.on("destroy", |_| Ok(())), Err(Error::ReservedName(_))));
        assert!(server.on_server(AUTHENTICATE, |_| Ok(())).is_err());

        let (mut rx, _) = authenticate(&mut server, 1).await;
        frame(
            &mut server,
            1,
            Envelope::new("destroy", json!(null))
                .with_scope(Scope::server())
                .with_correlation(4),
        );

        let response = next_response(&mut rx);
        assert_eq!(response.error_message(), Some("reserved message name: destroy"));
        assert_eq!(server.sessions.get(1).unwrap().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_policy_failure_closes_connection() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        server.set_auth_policy(|_payload: Value| async { Err::<UserId, _>("denied".to_string()) });

        let mut rx = open(&mut server, 1);
        frame(&mut server, 1, Envelope::new(AUTHENTICATE, json!({"token": "x"})));
        pump(&mut server).await;

        let response = next_response(&mut rx);
        assert_eq!(response.name, AUTHENTICATE);
        assert_eq!(response.error_message(), Some("authentication failed: denied"));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert_eq!(server.stats().connections, 0);
    }

    #[tokio::test]
    async fn test_policy_user_already_connected_fails() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        server.set_auth_policy(|_payload: Value| async { Ok::<UserId, String>(500) });

        let (_first, user_id) = authenticate(&mut server, 1).await;
        assert_eq!(user_id, 500);

        let mut rx = open(&mut server, 2);
        frame(&mut server, 2, Envelope::new(AUTHENTICATE, json!({})).with_correlation(1));
        pump(&mut server).await;

        assert!(next_response(&mut rx).is_error());
        assert_eq!(server.stats().users, 1);
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        server.on("slow", |_| Ok(())).unwrap();
        let (mut rx, _) = authenticate(&mut server, 1).await;

        frame(&mut server, 1, Envelope::new("slow", json!(null)).with_correlation(9));
        assert!(rx.try_recv().is_err());

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(server.sessions.expire_pending(later), 1);

        let response = next_response(&mut rx);
        assert_eq!(response.id, Some(9));
        assert_eq!(response.error_message(), Some("request timed out"));
    }

    #[tokio::test]
    async fn test_slot_cap_rejects_excess_requests() {
        let store = MemoryStore::new();
        let config = ServerConfig {
            max_pending_replies: 1,
            ..test_config()
        };
        let mut server = create_test_server(&store, config).await;
        server.on("slow", |_| Ok(())).unwrap();
        let (mut rx, _) = authenticate(&mut server, 1).await;

        frame(&mut server, 1, Envelope::new("slow", json!(null)).with_correlation(1));
        frame(&mut server, 1, Envelope::new("slow", json!(null)).with_correlation(2));

        let response = next_response(&mut rx);
        assert_eq!(response.id, Some(2));
        assert_eq!(response.error_message(), Some("too many pending replies (limit 1)"));
    }

    #[tokio::test]
    async fn test_remote_room_is_forwarded_once() {
        let store = MemoryStore::new();
        let mut owner = create_test_server(&store, test_config()).await;
        let mut server = create_test_server(&store, test_config()).await;

        let room = owner.allocator.allocate(ScopeKind::Room).await.unwrap();
        owner.registries.insert_room(Room::new(room, Handlers::new()));

        let (_rx, _) = authenticate(&mut server, 1).await;
        frame(
            &mut server,
            1,
            Envelope::new("fire", json!(null)).with_scope(Scope::room(room)),
        );
        pump(&mut server).await;

        assert_eq!(server.link().forwarded(), 1);
        assert_eq!(owner.link().forwarded(), 0);
    }

    #[tokio::test]
    async fn test_peer_messages_are_never_reforwarded() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        let sender = Sender {
            user_id: 1,
            process_id: 99,
            connection_id: 1,
        };

        server.handle_message(ServerMessage::Peer(PeerMessage::Forward {
            envelope: Envelope::new("fire", json!(null)).with_scope(Scope::room(42)),
            sender,
        }));

        assert_eq!(server.link().forwarded(), 0);
        assert!(server.server_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_removes_user_and_route() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        let (_rx, user_id) = authenticate(&mut server, 1).await;

        server.handle_message(ServerMessage::Closed { connection_id: 1 });
        assert_eq!(server.stats(), ServerStats::default());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let route = store
            .get_field_now(&routes_key(ScopeKind::User), &user_id.to_string())
            .unwrap();
        assert_eq!(route, None);
    }

    #[tokio::test]
    async fn test_broadcast_state_reaches_members() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        let (mut rx, user_id) = authenticate(&mut server, 1).await;

        let mut room = Room::new(3, Handlers::new());
        room.join(user_id);
        server.registries.insert_room(room);
        server.register_entity(NetworkEntity::new(8, Some(3), Handlers::new(), || json!({"hp": 4})));

        let spawned = next_response(&mut rx);
        assert_eq!(spawned.name, STATE);

        assert_eq!(server.broadcast_state(3).unwrap(), 1);
        let update = next_response(&mut rx);
        assert_eq!(update.id, None);
        assert_eq!(update.data, json!({"entities": [{"id": 8, "state": {"hp": 4}}]}));

        assert!(matches!(server.broadcast_state(4), Err(Error::TargetNotFound(_))));
    }

    #[tokio::test]
    async fn test_connections_beyond_capacity_are_refused() {
        let store = MemoryStore::new();
        let config = ServerConfig {
            max_connections: 1,
            ..test_config()
        };
        let mut server = create_test_server(&store, config).await;

        let _first = open(&mut server, 1);
        let mut rx = open(&mut server, 2);

        assert_eq!(next_response(&mut rx).error_message(), Some("server is at capacity"));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert_eq!(server.stats().connections, 1);
    }

    #[tokio::test]
    async fn test_uncorrelated_handler_error_sends_nothing() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        server.on("fail", |_| Err("boom".into())).unwrap();
        let (mut rx, _) = authenticate(&mut server, 1).await;

        frame(&mut server, 1, Envelope::new("fail", json!(null)));

        assert!(server.server_rx.try_recv().is_err());
        assert!(rx.try_recv().is_err());
        assert_eq!(server.stats().connections, 1);
    }

    #[tokio::test]
    async fn test_error_after_reply_keeps_the_first_reply() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        server
            .on("twice", |request: Request| {
                request.reply.ok(json!(1));
                Err("late failure".into())
            })
            .unwrap();
        let (mut rx, _) = authenticate(&mut server, 1).await;

        frame(&mut server, 1, Envelope::new("twice", json!(null)).with_correlation(4));
        pump(&mut server).await;

        assert_eq!(next_response(&mut rx), Response::ok("twice", json!(1), Some(4)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_store_outage_during_lookup_is_an_error_reply() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        let (mut rx, _) = authenticate(&mut server, 1).await;

        store.set_available(false);
        frame(
            &mut server,
            1,
            Envelope::new("fire", json!(null))
                .with_scope(Scope::room(42))
                .with_correlation(5),
        );
        pump(&mut server).await;
        pump(&mut server).await;

        let response = next_response(&mut rx);
        assert_eq!(response.name, "fire");
        assert_eq!(response.id, Some(5));
        assert_eq!(
            response.error_message(),
            Some("coordination store unavailable: store offline")
        );
        assert_eq!(server.link().forwarded(), 0);
    }

    #[tokio::test]
    async fn test_stale_route_to_stopped_process_fails_closed() {
        let store = MemoryStore::new();
        let mut server = create_test_server(&store, test_config()).await;
        let (mut rx, _) = authenticate(&mut server, 1).await;

        // Process 999 published an address and then stopped listening
        let gone = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gone_addr = gone.local_addr().unwrap();
        drop(gone);
        store
            .set_field_now(PROCESS_MAP, "999", &gone_addr.to_string())
            .unwrap();
        store
            .set_field_now(&routes_key(ScopeKind::Room), "77", "999")
            .unwrap();

        frame(
            &mut server,
            1,
            Envelope::new("fire", json!(null))
                .with_scope(Scope::room(77))
                .with_correlation(5),
        );
        pump(&mut server).await;
        assert_eq!(server.link().forwarded(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(server.server_rx.try_recv().is_err());
        assert_eq!(server.link().forwarded(), 1);
        assert_eq!(server.sessions.get(1).unwrap().pending_count(), 1);

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(server.sessions.expire_pending(later), 1);
        let response = next_response(&mut rx);
        assert_eq!(response.id, Some(5));
        assert_eq!(response.error_message(), Some("request timed out"));
    }
}
