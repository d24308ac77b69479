use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::command::{CommandRegistry, Dispatch, HandlerFuture};
use crate::config::RoomConfig;
use crate::error::ChatError;
use crate::protocol::split_command;
use crate::session::{ActiveSession, Outbox, Session};
use crate::store::Store;
use crate::table::{ConnectionTable, Member, Target};
use crate::types::{RoomAddress, SessionId};
use crate::validate::Validator;

pub const WHISPER_USAGE: &str = "Usage: /whisper <username> <message>";

pub fn joined_notice(username: &str) -> String {
    format!("User connected: {username}")
}

pub fn chat_line(username: &str, text: &str) -> String {
    format!("{username}: {text}")
}

pub fn whisper_line(sender: &str, text: &str) -> String {
    format!("{sender} whispers to you: {text}")
}

/// One named chat room: authenticated sessions, broadcast and whisper
/// routing.
///
/// Runs in its own process (or isolated task) and shares nothing with other
/// rooms except the store.
pub struct RoomServer {
    name: String,
    addr: RoomAddress,
    store: Arc<dyn Store>,
    validator: Validator,
    table: Mutex<ConnectionTable>,
    commands: CommandRegistry<RoomServer, ActiveSession>,
}

impl RoomServer {
    pub fn new(config: &RoomConfig, store: Arc<dyn Store>, validator: Validator) -> Result<Self, ChatError> {
        let commands = CommandRegistry::new()
            .with("/help", help)?
            .with("/users_online", users_online)?
            .with("/whisper", whisper)?;

        Ok(Self {
            name: config.name.clone(),
            addr: config.address(),
            store,
            validator,
            table: Mutex::new(ConnectionTable::new()),
            commands,
        })
    }

    pub async fn online(&self) -> Vec<String> {
        self.table.lock().await.usernames()
    }

    /// Accept connections until `shutdown` fires. Each connection runs in
    /// its own task; a failing connection never stops the accept loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ChatError> {
        info!(room = %self.name, addr = %listener.local_addr()?, "room listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(room = %self.name, error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let room = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = room.handle_client(stream, peer).await {
                    debug!(room = %room.name, %peer, error = %e, "client task ended with error");
                }
            });
        }

        info!(room = %self.name, "room stopped");
        Ok(())
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ChatError> {
        let session = Session::accept(stream)?;
        let id = session.id();
        debug!(room = %self.name, %id, %peer, "connection accepted");

        let Some(session) = auth::authenticate(session, &*self.store, &self.validator).await? else {
            info!(room = %self.name, %id, %peer, "authentication not completed");
            return Ok(());
        };

        let (mut active, outbox) = session.activate();
        if let Err(e) = self.join(&active, outbox).await {
            info!(room = %self.name, %id, error = %e, "join refused");
            active.finish().await;
            return Ok(());
        }

        let cancel = active.cancel_token();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = active.recv() => frame,
            };
            match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = self.on_frame(&mut active, &frame).await {
                        warn!(room = %self.name, %id, error = %e, "dropping session");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(room = %self.name, %id, error = %e, "read failed");
                    break;
                }
            }
        }

        self.leave(id).await;
        Ok(())
    }

    async fn join(&self, session: &ActiveSession, outbox: Outbox) -> Result<(), ChatError> {
        let username = session.username().to_string();
        let mut table = self.table.lock().await;

        if table.find(&username).is_some() {
            let _ = outbox.send(format!("User {username} is already online"));
            return Err(ChatError::UserAlreadyOnline(username));
        }

        let welcome = format!(
            "You are connected to server {} ({})\nList available commands: /help",
            self.name, self.addr
        );
        let _ = outbox.send(welcome);
        table.insert(
            session.id(),
            Member {
                username: username.clone(),
                outbox,
                cancel: session.cancel_token(),
            },
        )?;
        info!(room = %self.name, id = %session.id(), peer = %session.peer(), %username, "user joined");
        table.route(session.id(), Target::All, joined_notice(&username));
        Ok(())
    }

    /// Disconnect path; safe to call more than once.
    async fn leave(&self, id: SessionId) {
        if let Some(username) = self.table.lock().await.leave(id) {
            info!(room = %self.name, %id, %username, "user left");
        }
    }

    async fn send(&self, from: SessionId, target: Target, text: String) {
        let evicted = self.table.lock().await.route(from, target, text);
        for username in evicted {
            info!(room = %self.name, %username, "user evicted");
        }
    }

    async fn on_frame(&self, session: &mut ActiveSession, frame: &str) -> Result<(), ChatError> {
        if frame.trim().is_empty() {
            return Ok(());
        }

        let (token, args) = split_command(frame);
        match self.commands.dispatch(self, session, token, args).await {
            Ok(Dispatch::Handled) => Ok(()),
            Ok(Dispatch::UnknownCommand) => {
                let line = chat_line(session.username(), frame);
                self.send(session.id(), Target::All, line).await;
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                let reply = match &e {
                    ChatError::UnknownUser(name) => format!("User {name} is not online"),
                    ChatError::Parse(usage) => usage.clone(),
                    other => other.to_string(),
                };
                self.send(session.id(), Target::One(session.id()), reply).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Bind the configured address and serve until `shutdown` fires.
pub async fn run(
    config: RoomConfig,
    store: Arc<dyn Store>,
    validator: Validator,
    shutdown: CancellationToken,
) -> Result<(), ChatError> {
    let listener = TcpListener::bind(config.bind_addr()).await.map_err(|e| {
        error!(room = %config.name, addr = %config.bind_addr(), error = %e, "bind failed");
        e
    })?;
    let room = Arc::new(RoomServer::new(&config, store, validator)?);
    room.serve(listener, shutdown).await
}

// ── Commands ────────────────────────────────────────────────────────

fn help<'a>(room: &'a RoomServer, session: &'a mut ActiveSession, _args: &'a str) -> HandlerFuture<'a> {
    Box::pin(async move {
        let tokens: Vec<&str> = room.commands.tokens().collect();
        let text = format!("Available commands:\n{}", tokens.join("\n"));
        room.send(session.id(), Target::One(session.id()), text).await;
        Ok(())
    })
}

fn users_online<'a>(room: &'a RoomServer, session: &'a mut ActiveSession, _args: &'a str) -> HandlerFuture<'a> {
    Box::pin(async move {
        let names = room.online().await;
        let text = format!("Users online:\n{}", names.join("\n"));
        room.send(session.id(), Target::One(session.id()), text).await;
        Ok(())
    })
}

/// `/whisper <username> <message>`: everything after the recipient is the
/// payload, whitespace included.
fn whisper<'a>(room: &'a RoomServer, session: &'a mut ActiveSession, args: &'a str) -> HandlerFuture<'a> {
    Box::pin(async move {
        let (recipient, message) = split_command(args);
        if recipient.is_empty() || message.is_empty() {
            return Err(ChatError::Parse(WHISPER_USAGE.to_string()));
        }

        let mut table = room.table.lock().await;
        let Some(target) = table.find(recipient) else {
            return Err(ChatError::UnknownUser(recipient.to_string()));
        };
        let evicted = table.route(session.id(), Target::One(target), whisper_line(session.username(), message));
        drop(table);

        for username in evicted {
            info!(room = %room.name, %username, "user evicted");
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::store::MemoryStore;

    struct Client {
        stream: TcpStream,
        seen: String,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                seen: String::new(),
            }
        }

        /// Read until `needle` shows up; returns everything read so far.
        async fn expect(&mut self, needle: &str) -> String {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while !self.seen.contains(needle) {
                let mut buf = [0u8; 1024];
                let n = tokio::time::timeout_at(deadline, self.stream.read(&mut buf))
                    .await
                    .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, saw {:?}", self.seen))
                    .unwrap();
                assert!(n > 0, "closed while waiting for {needle:?}, saw {:?}", self.seen);
                self.seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            std::mem::take(&mut self.seen)
        }

        /// Everything that arrives within a short quiet period.
        async fn idle(&mut self) -> String {
            let mut buf = [0u8; 1024];
            while let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(150), self.stream.read(&mut buf)).await {
                if n == 0 {
                    break;
                }
                self.seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            std::mem::take(&mut self.seen)
        }

        async fn say(&mut self, text: &str) {
            self.stream.write_all(text.as_bytes()).await.unwrap();
            // Keep separate writes from coalescing into one server read.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        async fn login(addr: SocketAddr, username: &str, password: &str) -> Self {
            let mut client = Self::connect(addr).await;
            client.expect(auth::USERNAME_PROMPT).await;
            client.say(username).await;
            client.expect("password").await;
            client.say(password).await;
            client.expect("List available commands: /help").await;
            client
        }
    }

    async fn start_room() -> (Arc<RoomServer>, SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = RoomConfig::builder("alpha").port(addr.port()).build();
        let room = Arc::new(RoomServer::new(&config, Arc::new(MemoryStore::new()), Validator::default()).unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&room).serve(listener, shutdown.clone()));
        (room, addr, shutdown)
    }

    async fn wait_online(room: &RoomServer, count: usize) {
        for _ in 0..100 {
            if room.online().await.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} users online, have {:?}", room.online().await);
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_sender() {
        let (room, addr, _shutdown) = start_room().await;
        let mut alice = Client::login(addr, "alice01", "Secret1").await;
        let mut bob = Client::login(addr, "bob001", "Secret2").await;
        let mut carol = Client::login(addr, "carol01", "Secret3").await;
        wait_online(&room, 3).await;
        alice.idle().await;
        bob.idle().await;

        bob.say("hello room").await;

        alice.expect("bob001: hello room").await;
        carol.expect("bob001: hello room").await;
        assert!(!bob.idle().await.contains("hello room"));
    }

    #[tokio::test]
    async fn whisper_reaches_only_the_recipient() {
        let (room, addr, _shutdown) = start_room().await;
        let mut alice = Client::login(addr, "alice01", "Secret1").await;
        let mut bob = Client::login(addr, "bob001", "Secret2").await;
        let mut carol = Client::login(addr, "carol01", "Secret3").await;
        wait_online(&room, 3).await;
        carol.idle().await;

        alice.say("/whisper bob001 hi  there").await;

        bob.expect("alice01 whispers to you: hi  there").await;
        assert!(!carol.idle().await.contains("whispers"));
        assert!(!alice.idle().await.contains("whispers"));
    }

    #[tokio::test]
    async fn whisper_to_offline_user_is_reported_to_sender() {
        let (_room, addr, _shutdown) = start_room().await;
        let mut alice = Client::login(addr, "alice01", "Secret1").await;

        alice.say("/whisper nobody1 hello").await;
        alice.expect("User nobody1 is not online").await;

        alice.say("/whisper").await;
        alice.expect(WHISPER_USAGE).await;

        // The session survives both failures.
        alice.say("/users_online").await;
        alice.expect("Users online:\nalice01").await;
    }

    #[tokio::test]
    async fn help_and_users_online_reply_to_sender_only() {
        let (room, addr, _shutdown) = start_room().await;
        let mut bob = Client::login(addr, "bob001", "Secret2").await;
        let mut alice = Client::login(addr, "alice01", "Secret1").await;
        wait_online(&room, 2).await;
        bob.idle().await;

        alice.say("/help").await;
        alice.expect("Available commands:\n/help\n/users_online\n/whisper").await;
        alice.say("/users_online").await;
        alice.expect("Users online:\nalice01\nbob001").await;

        assert!(!bob.idle().await.contains("commands"));
    }

    #[tokio::test]
    async fn unknown_slash_command_is_chat() {
        let (room, addr, _shutdown) = start_room().await;
        let mut alice = Client::login(addr, "alice01", "Secret1").await;
        let mut bob = Client::login(addr, "bob001", "Secret2").await;
        wait_online(&room, 2).await;
        bob.idle().await;

        alice.say("/shrug ok").await;
        bob.expect("alice01: /shrug ok").await;
    }

    #[tokio::test]
    async fn join_and_departure_are_announced_once() {
        let (room, addr, _shutdown) = start_room().await;
        let mut alice = Client::login(addr, "alice01", "Secret1").await;
        let bob = Client::login(addr, "bob001", "Secret2").await;
        alice.expect(&joined_notice("bob001")).await;
        wait_online(&room, 2).await;

        drop(bob);
        alice.expect("User bob001 disconnected").await;
        wait_online(&room, 1).await;
        assert!(!alice.idle().await.contains("disconnected"));
    }

    #[tokio::test]
    async fn returning_user_logs_in_without_registering() {
        let (room, addr, _shutdown) = start_room().await;
        let alice = Client::login(addr, "alice01", "Secret1").await;
        wait_online(&room, 1).await;
        drop(alice);
        wait_online(&room, 0).await;

        let mut again = Client::connect(addr).await;
        again.expect(auth::USERNAME_PROMPT).await;
        again.say("alice01").await;
        let prompt = again.expect(auth::PASSWORD_PROMPT).await;
        assert!(!prompt.contains("new here"));
        again.say("Secret1").await;
        again.expect("List available commands").await;
    }

    #[tokio::test]
    async fn second_login_for_online_user_is_refused() {
        let (room, addr, _shutdown) = start_room().await;
        let mut alice = Client::login(addr, "alice01", "Secret1").await;
        wait_online(&room, 1).await;

        let mut twin = Client::connect(addr).await;
        twin.expect(auth::USERNAME_PROMPT).await;
        twin.say("alice01").await;
        twin.expect(auth::PASSWORD_PROMPT).await;
        twin.say("Secret1").await;
        twin.expect("User alice01 is already online").await;

        assert_eq!(room.online().await, vec!["alice01"]);
        alice.say("/users_online").await;
        alice.expect("Users online:\nalice01").await;
    }
}
