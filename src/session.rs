use std::marker::PhantomData;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ChatError;
use crate::protocol::{MAX_FRAME, decode_frame};
use crate::types::SessionId;

/// Typestate: encode the session lifecycle as types.
///
/// Session<Unauthenticated> → Session<Authenticated> → ActiveSession
///
/// Lobby sessions never leave `Unauthenticated`. Room sessions become
/// `Authenticated` once the credential exchange succeeds, and `ActiveSession`
/// once their writer half has been handed to a fan-in writer task.
pub struct Unauthenticated;

/// Marker type: the peer proved its identity.
pub struct Authenticated;

/// Queue of outbound frames for one session. Sends never wait for the
/// socket; a send error means the writer task has already gone away.
pub type Outbox = mpsc::UnboundedSender<String>;

/// One accepted socket with direct, in-line reads and writes.
pub struct Session<S = Unauthenticated> {
    id: SessionId,
    peer: SocketAddr,
    username: Option<String>,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    alive: bool,
    _state: PhantomData<S>,
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<String>, ChatError> {
    let mut buf = [0u8; MAX_FRAME];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(decode_frame(&buf[..n])))
}

impl<S> Session<S> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// False once the peer closed, an I/O call failed, or `close` ran.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Read one frame; `None` when the peer closed the connection.
    pub async fn recv(&mut self) -> Result<Option<String>, ChatError> {
        match read_frame(&mut self.reader).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                self.alive = false;
                Ok(None)
            }
            Err(e) => {
                self.alive = false;
                Err(e)
            }
        }
    }

    pub async fn send(&mut self, text: &str) -> Result<(), ChatError> {
        if let Err(e) = self.writer.write_all(text.as_bytes()).await {
            self.alive = false;
            return Err(e.into());
        }
        Ok(())
    }

    /// Send a prompt and wait for the answer. A peer close while waiting
    /// is reported as `Disconnected`.
    pub async fn prompt(&mut self, text: &str) -> Result<String, ChatError> {
        self.send(text).await?;
        self.recv().await?.ok_or(ChatError::Disconnected)
    }

    /// Shut down the write side. The read side closes when the session is
    /// dropped.
    pub async fn close(&mut self) {
        self.alive = false;
        if let Err(e) = self.writer.shutdown().await {
            debug!(session = %self.id, error = %e, "shutdown failed");
        }
    }
}

impl Session<Unauthenticated> {
    pub fn accept(stream: TcpStream) -> Result<Self, ChatError> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            id: SessionId::next(),
            peer,
            username: None,
            reader,
            writer,
            alive: true,
            _state: PhantomData,
        })
    }

    /// Bind an identity. Consumes self: the unauthenticated session cannot
    /// be used after this.
    pub fn authenticated(self, username: String) -> Session<Authenticated> {
        Session {
            id: self.id,
            peer: self.peer,
            username: Some(username),
            reader: self.reader,
            writer: self.writer,
            alive: self.alive,
            _state: PhantomData,
        }
    }
}

impl Session<Authenticated> {
    /// Move the writer half into a fan-in writer task.
    ///
    /// Returns the read side plus the outbox feeding the writer. The writer
    /// stops when every `Outbox` clone is dropped, or on the first failed
    /// write, in which case it cancels the session so its reader stops too.
    pub fn activate(self) -> (ActiveSession, Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let writer = spawn_writer(self.id, self.writer, rx, cancel.clone());
        let active = ActiveSession {
            id: self.id,
            peer: self.peer,
            username: self.username.unwrap_or_default(),
            reader: self.reader,
            cancel,
            writer,
        };
        (active, tx)
    }
}

fn spawn_writer(
    id: SessionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = writer.write_all(text.as_bytes()).await {
                debug!(session = %id, error = %e, "write failed");
                cancel.cancel();
                return;
            }
        }
        let _ = writer.shutdown().await;
    })
}

/// An authenticated room session whose outbound traffic goes through its
/// writer task.
pub struct ActiveSession {
    id: SessionId,
    peer: SocketAddr,
    username: String,
    reader: OwnedReadHalf,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
}

impl ActiveSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Cancelled when the owning server evicts this session or its writer
    /// fails.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn recv(&mut self) -> Result<Option<String>, ChatError> {
        read_frame(&mut self.reader).await
    }

    /// Wait for the writer task to flush what it has queued.
    pub async fn finish(self) {
        let _ = self.writer.await;
    }
}
