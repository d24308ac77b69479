use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{CommandRegistry, Dispatch, HandlerFuture};
use crate::config::MasterConfig;
use crate::error::ChatError;
use crate::protocol::{
    CONNECTION_APPROVED, NO_ROOMS, READY_FOR_CONNECTION, SERVER_NOT_EXIST, TRY_LATER, format_address,
    split_command,
};
use crate::session::Session;
use crate::store::{Store, StoreError};
use crate::supervisor::Supervisor;
use crate::types::RoomAddress;
use crate::validate;

pub const GREETING: &str = "Type /help to list available commands";
pub const UNKNOWN_COMMAND: &str = "This command does not exist";
pub const CONNECT_USAGE: &str = "Usage: /connect <server name>";
pub const NAME_PROMPT: &str = "Choose a server name";
pub const NAME_INVALID: &str = "This server name is not available,\ntry another name";
pub const NAME_TAKEN: &str = "A server with this name already exists,\ntry another name";
pub const HOST_PROMPT: &str = "Choose the server host";
pub const PORT_PROMPT: &str = "Choose the server port";
pub const ADDRESS_INVALID: &str = "This host and port are already taken or invalid";
pub const CREATED: &str = "Server created";

/// The lobby: room discovery, room creation and the handoff to room
/// servers.
pub struct Master {
    config: MasterConfig,
    store: Arc<dyn Store>,
    supervisor: Supervisor,
    commands: CommandRegistry<Master, Session>,
}

impl Master {
    pub fn new(config: MasterConfig, store: Arc<dyn Store>, supervisor: Supervisor) -> Result<Self, ChatError> {
        let commands = CommandRegistry::new()
            .with("/help", help)?
            .with("/server_list", server_list)?
            .with("/connect", connect)?
            .with("/start_server", start_server)?;

        Ok(Self {
            config,
            store,
            supervisor,
            commands,
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), ChatError> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept lobby connections until `shutdown` fires. Each client runs in
    /// its own task and that task ends as soon as the client is handed off.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ChatError> {
        info!(addr = %listener.local_addr()?, "master listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let master = Arc::clone(&self);
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = master.handle_client(stream, peer, cancel).await {
                    debug!(%peer, error = %e, "lobby task ended with error");
                }
            });
        }

        info!("master stopped");
        Ok(())
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) -> Result<(), ChatError> {
        let mut session = Session::accept(stream)?;
        let id = session.id();
        debug!(%id, %peer, "lobby connection accepted");
        session.send(GREETING).await?;

        while session.is_alive() {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = session.recv() => frame?,
            };
            let Some(frame) = frame else { break };

            let (token, args) = split_command(&frame);
            match self.commands.dispatch(self, &mut session, token, args).await {
                Ok(Dispatch::Handled) => {}
                Ok(Dispatch::UnknownCommand) => session.send(UNKNOWN_COMMAND).await?,
                Err(ChatError::Store(e)) => {
                    warn!(%id, error = %e, "store failure");
                    session.send(TRY_LATER).await?;
                }
                Err(e) if e.is_recoverable() => warn!(%id, command = token, error = %e, "command failed"),
                Err(e) => return Err(e),
            }
        }

        debug!(%id, %peer, "lobby connection closed");
        Ok(())
    }

    async fn connect(&self, session: &mut Session, args: &str) -> Result<(), ChatError> {
        let name = args.trim();
        if name.is_empty() {
            return session.send(CONNECT_USAGE).await;
        }

        let Some(stored) = self.store.get_room_address(name).await? else {
            debug!(id = %session.id(), room = name, "connect to unknown room");
            return session.send(SERVER_NOT_EXIST).await;
        };

        session.send(CONNECTION_APPROVED).await?;
        match session.recv().await?.as_deref().map(str::trim) {
            Some(READY_FOR_CONNECTION) => {}
            Some(other) => {
                return Err(ChatError::Protocol(format!(
                    "expected {READY_FOR_CONNECTION}, got {other:?}"
                )));
            }
            None => return Ok(()),
        }

        let addr = RoomAddress::new(validate::canonical_host(&stored.host), stored.port);
        let addr = match self.supervisor.ensure_running(name, &addr).await {
            Ok(addr) => addr,
            Err(e) => {
                session.send(TRY_LATER).await?;
                return Err(e);
            }
        };

        session.send(&format_address(&addr)).await?;
        session.close().await;
        info!(id = %session.id(), peer = %session.peer(), room = name, %addr, "client handed off");
        Ok(())
    }

    async fn start_server(&self, session: &mut Session) -> Result<(), ChatError> {
        let mut name = session.prompt(NAME_PROMPT).await?;
        loop {
            if !validate::room_name(&name) {
                name = session.prompt(NAME_INVALID).await?;
            } else if self.store.room_exists(&name).await? {
                name = session.prompt(NAME_TAKEN).await?;
            } else {
                break;
            }
        }

        let addr = loop {
            let host = session.prompt(HOST_PROMPT).await?;
            let port = session.prompt(PORT_PROMPT).await?;
            let (host, port) = (host.trim(), validate::port(&port));
            let Some(port) = port.filter(|_| validate::host(host)) else {
                session.send(ADDRESS_INVALID).await?;
                continue;
            };

            let addr = RoomAddress::new(validate::canonical_host(host), port);
            match self.store.put_room(&name, &addr).await {
                Ok(()) => break addr,
                Err(StoreError::AddressTaken(_)) => session.send(ADDRESS_INVALID).await?,
                Err(StoreError::NameTaken(_)) => {
                    debug!(id = %session.id(), room = %name, "lost registration race");
                    return session
                        .send(&format!("Server {name} already exists"))
                        .await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!(id = %session.id(), room = %name, %addr, "room registered");
        session.send(CREATED).await?;

        if let Err(e) = self.supervisor.ensure_running(&name, &addr).await {
            session.send(TRY_LATER).await?;
            return Err(e);
        }
        Ok(())
    }
}

// ── Commands ────────────────────────────────────────────────────────

fn help<'a>(master: &'a Master, session: &'a mut Session, _args: &'a str) -> HandlerFuture<'a> {
    Box::pin(async move {
        let tokens: Vec<&str> = master.commands.tokens().collect();
        session
            .send(&format!("Available commands:\n{}", tokens.join("\n")))
            .await
    })
}

fn server_list<'a>(master: &'a Master, session: &'a mut Session, _args: &'a str) -> HandlerFuture<'a> {
    Box::pin(async move {
        let rooms = master.store.list_rooms().await?;
        let body = if rooms.is_empty() {
            NO_ROOMS.to_string()
        } else {
            rooms.join("\n")
        };
        session.send(&format!("Server list:\n{body}")).await
    })
}

fn connect<'a>(master: &'a Master, session: &'a mut Session, args: &'a str) -> HandlerFuture<'a> {
    Box::pin(master.connect(session, args))
}

fn start_server<'a>(master: &'a Master, session: &'a mut Session, _args: &'a str) -> HandlerFuture<'a> {
    Box::pin(master.start_server(session))
}
