use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::ChatError;
use crate::protocol::{
    CONNECTION_APPROVED, MAX_FRAME, READY_FOR_CONNECTION, SERVER_NOT_EXIST, decode_frame, parse_address,
    split_command,
};
use crate::types::RoomAddress;

pub const CONFIRM_DISCONNECT: &str = "You sent an empty message, do you want to disconnect? [YES/NO]";
pub const NO_SUCH_SERVER: &str = "This server does not exist";

/// What the receive duty should do with an incoming frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Reaction {
    Show(String),
    Reply(&'static str),
    Redirect(RoomAddress),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Phase {
    #[default]
    Idle,
    Requested,
    Approved,
}

/// Client side of the handoff protocol.
///
/// Tracks whether a `/connect` is in flight, answers the approval sentinel
/// and recognises the address reply that ends the lobby connection.
#[derive(Debug, Default)]
pub struct Handoff {
    phase: Phase,
}

impl Handoff {
    /// Note a line the user is about to send.
    pub fn on_input(&mut self, line: &str) {
        let (token, room) = split_command(line);
        if token == "/connect" && !room.trim().is_empty() {
            self.phase = Phase::Requested;
        }
    }

    /// React to one frame. A sentinel may share a read with text the server
    /// sent just before it (the lobby greeting), so it is matched at the end
    /// of the frame and the leading text is shown.
    pub fn on_frame(&mut self, frame: &str) -> Vec<Reaction> {
        match self.phase {
            Phase::Requested => {
                if let Some(before) = strip_sentinel(frame, CONNECTION_APPROVED) {
                    self.phase = Phase::Approved;
                    return after(before, Reaction::Reply(READY_FOR_CONNECTION));
                }
                if let Some(before) = strip_sentinel(frame, SERVER_NOT_EXIST) {
                    self.phase = Phase::Idle;
                    return after(before, Reaction::Show(NO_SUCH_SERVER.to_string()));
                }
                // Still waiting on the lobby's answer.
                vec![Reaction::Show(frame.to_string())]
            }
            Phase::Approved => {
                self.phase = Phase::Idle;
                match parse_address(frame.trim()) {
                    Some(addr) => vec![Reaction::Redirect(addr)],
                    None => vec![Reaction::Show(frame.to_string())],
                }
            }
            Phase::Idle => vec![Reaction::Show(frame.to_string())],
        }
    }
}

fn strip_sentinel<'a>(frame: &'a str, sentinel: &str) -> Option<&'a str> {
    frame.trim_end().strip_suffix(sentinel).map(str::trim_end)
}

fn after(before: &str, reaction: Reaction) -> Vec<Reaction> {
    if before.is_empty() {
        vec![reaction]
    } else {
        vec![Reaction::Show(before.to_string()), reaction]
    }
}

enum Exit {
    Quit,
    Closed,
    Redirect(RoomAddress),
}

/// Interactive client: user lines in, server frames out, following master
/// → room redirects.
pub struct Client<I, O> {
    input: Lines<I>,
    output: O,
}

async fn show<O: AsyncWrite + Unpin>(output: &mut O, text: &str) -> Result<(), ChatError> {
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

impl<I, O> Client<I, O>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    pub fn new(input: I, output: O) -> Self {
        Self {
            input: input.lines(),
            output,
        }
    }

    pub fn into_output(self) -> O {
        self.output
    }

    /// Connect to `addr` and keep following redirects until the user quits
    /// or the server hangs up.
    pub async fn run(&mut self, addr: &str) -> Result<(), ChatError> {
        let mut target = addr.to_string();
        loop {
            match self.connection(&target).await? {
                Exit::Redirect(room) => {
                    info!(%room, "redirected");
                    target = room.socket_addr();
                }
                Exit::Quit | Exit::Closed => return Ok(()),
            }
        }
    }

    /// One connection: the receive and send duties race on a single task.
    /// Both `read` and `next_line` are cancel-safe, so losing a race never
    /// drops data.
    async fn connection(&mut self, addr: &str) -> Result<Exit, ChatError> {
        let Self { input, output } = self;
        let stream = TcpStream::connect(addr).await?;
        debug!(%addr, "connected");
        let (mut reader, mut writer) = stream.into_split();

        let mut handoff = Handoff::default();
        let mut confirming = false;
        let mut buf = [0u8; MAX_FRAME];

        let exit = 'conn: loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        break Exit::Closed;
                    }
                    for reaction in handoff.on_frame(&decode_frame(&buf[..n])) {
                        match reaction {
                            Reaction::Show(text) => show(output, &text).await?,
                            Reaction::Reply(text) => writer.write_all(text.as_bytes()).await?,
                            Reaction::Redirect(room) => break 'conn Exit::Redirect(room),
                        }
                    }
                }
                line = input.next_line() => {
                    let Some(line) = line? else {
                        break Exit::Quit;
                    };
                    if confirming {
                        confirming = false;
                        if line.trim() == "YES" {
                            break Exit::Quit;
                        }
                        continue;
                    }
                    if line.is_empty() {
                        confirming = true;
                        show(output, CONFIRM_DISCONNECT).await?;
                        continue;
                    }
                    handoff.on_input(&line);
                    writer.write_all(line.as_bytes()).await?;
                }
            }
        };

        let _ = writer.shutdown().await;
        show(output, "Connection closed").await?;
        Ok(exit)
    }
}
