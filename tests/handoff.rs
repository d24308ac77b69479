use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use lobbychat::client::CONFIRM_DISCONNECT;
use lobbychat::master::{CREATED, GREETING, HOST_PROMPT, NAME_PROMPT, NAME_TAKEN, PORT_PROMPT};
use lobbychat::protocol::{CONNECTION_APPROVED, READY_FOR_CONNECTION, SERVER_NOT_EXIST};
use lobbychat::supervisor::WorkerHandle;
use lobbychat::{
    ChatError, Client, Launcher, Master, MasterConfig, MemoryStore, RoomAddress, Store, Supervisor, TaskLauncher,
    Validator,
};

/// Wraps the in-process launcher and counts how many rooms it started.
struct CountingLauncher {
    inner: TaskLauncher,
    starts: Arc<AtomicUsize>,
}

impl Launcher for CountingLauncher {
    fn start(&self, name: &str, addr: &RoomAddress) -> Result<Box<dyn WorkerHandle>, ChatError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.inner.start(name, addr)
    }
}

struct Harness {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    starts: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let shutdown = CancellationToken::new();
    let starts = Arc::new(AtomicUsize::new(0));
    let launcher = CountingLauncher {
        inner: TaskLauncher::new(store.clone(), Validator::default(), shutdown.clone()),
        starts: starts.clone(),
    };
    let supervisor = Supervisor::new(Box::new(launcher), Duration::from_millis(30));
    let master = Arc::new(Master::new(MasterConfig::builder().build(), store.clone(), supervisor).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(master.serve(listener, shutdown.clone()));

    Harness {
        addr,
        store,
        starts,
        shutdown,
    }
}

async fn free_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap().port()
}

/// A raw protocol client that accumulates what it reads.
struct Peer {
    stream: TcpStream,
    seen: String,
}

impl Peer {
    async fn connect(addr: impl tokio::net::ToSocketAddrs) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            seen: String::new(),
        }
    }

    async fn lobby(addr: SocketAddr) -> Self {
        let mut peer = Self::connect(addr).await;
        peer.expect(GREETING).await;
        peer
    }

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

    async fn quiet(&mut self) -> String {
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
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Run the full handoff and return the address the master disclosed.
    async fn handoff(mut self, room: &str) -> RoomAddress {
        self.say(&format!("/connect {room}")).await;
        self.expect(CONNECTION_APPROVED).await;
        self.stream.write_all(READY_FOR_CONNECTION.as_bytes()).await.unwrap();
        let mut reply = String::new();
        self.stream.read_to_string(&mut reply).await.unwrap();
        lobbychat::protocol::parse_address(&reply).unwrap_or_else(|| panic!("not an address: {reply:?}"))
    }

    async fn join_room(addr: &RoomAddress, username: &str, password: &str) -> Self {
        let mut peer = Self::connect(addr.socket_addr()).await;
        peer.expect("Enter username").await;
        peer.say(username).await;
        peer.expect("password").await;
        peer.say(password).await;
        peer.expect("/help").await;
        peer
    }
}

#[tokio::test]
async fn connect_register_and_whisper() {
    let h = harness().await;
    let port = free_port().await;
    h.store
        .put_room("alpha", &RoomAddress::new("127.0.0.1", port))
        .await
        .unwrap();

    let addr = Peer::lobby(h.addr).await.handoff("alpha").await;
    assert_eq!(addr, RoomAddress::new("127.0.0.1", port));

    let mut bob = Peer::join_room(&addr, "bob01x", "Secret2").await;

    let mut alice = Peer::connect(addr.socket_addr()).await;
    alice.expect("Enter username").await;
    alice.say("alice01").await;
    alice.expect("choose a password").await;
    alice.say("Secret1").await;
    alice.expect("/help").await;

    let addr2 = Peer::lobby(h.addr).await.handoff("alpha").await;
    let mut carol = Peer::join_room(&addr2, "carol01", "Secret3").await;
    bob.quiet().await;
    alice.quiet().await;

    alice.say("/whisper bob01x hi").await;
    bob.expect("alice01 whispers to you: hi").await;
    assert!(!carol.quiet().await.contains("whispers"));

    assert_eq!(h.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_room_never_discloses_an_address() {
    let h = harness().await;
    let mut client = Peer::lobby(h.addr).await;

    client.say("/connect missing-room").await;
    assert_eq!(client.expect(SERVER_NOT_EXIST).await, SERVER_NOT_EXIST);

    client.say("/server_list").await;
    client.expect("no rooms available").await;
    assert_eq!(h.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_connects_share_one_worker() {
    let h = harness().await;
    let port = free_port().await;
    h.store
        .put_room("alpha", &RoomAddress::new("127.0.0.1", port))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let addr = h.addr;
        tasks.push(tokio::spawn(async move {
            Peer::lobby(addr).await.handoff("alpha").await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), RoomAddress::new("127.0.0.1", port));
    }
    assert_eq!(h.starts.load(Ordering::SeqCst), 1);
}

async fn begin_start_server(addr: SocketAddr, name: &str) -> Peer {
    let mut peer = Peer::lobby(addr).await;
    peer.say("/start_server").await;
    peer.expect(NAME_PROMPT).await;
    peer.say(name).await;
    peer.expect(HOST_PROMPT).await;
    peer
}

#[tokio::test]
async fn distinct_names_each_register_once() {
    let h = harness().await;

    for name in ["alpha", "beta", "gamma"] {
        let port = free_port().await;
        let mut peer = begin_start_server(h.addr, name).await;
        peer.say("localhost").await;
        peer.expect(PORT_PROMPT).await;
        peer.say(&port.to_string()).await;
        peer.expect(CREATED).await;
    }
    // The worker starts after the confirmation is sent.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.store.list_rooms().await.unwrap(), vec!["alpha", "beta", "gamma"]);
    assert_eq!(h.starts.load(Ordering::SeqCst), 3);

    let mut late = Peer::lobby(h.addr).await;
    late.say("/start_server").await;
    late.expect(NAME_PROMPT).await;
    late.say("beta").await;
    late.expect(NAME_TAKEN).await;
}

#[tokio::test]
async fn racing_start_server_for_one_name_registers_once() {
    let h = harness().await;
    let first_port = free_port().await;
    let second_port = free_port().await;

    // Both callers pass the name check before either persists.
    let mut first = begin_start_server(h.addr, "alpha").await;
    let mut second = begin_start_server(h.addr, "alpha").await;

    first.say("127.0.0.1").await;
    first.expect(PORT_PROMPT).await;
    first.say(&first_port.to_string()).await;
    first.expect(CREATED).await;

    second.say("127.0.0.1").await;
    second.expect(PORT_PROMPT).await;
    second.say(&second_port.to_string()).await;
    second.expect("Server alpha already exists").await;

    assert_eq!(h.store.list_rooms().await.unwrap(), vec!["alpha"]);
    assert_eq!(
        h.store.get_room_address("alpha").await.unwrap(),
        Some(RoomAddress::new("127.0.0.1", first_port))
    );
}

/// The terminal side of a `Client`: typed lines in, rendered text out.
struct Terminal {
    keyboard: DuplexStream,
    screen: DuplexStream,
    seen: String,
}

impl Terminal {
    async fn expect(&mut self, needle: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.seen.contains(needle) {
            let mut buf = [0u8; 1024];
            let n = tokio::time::timeout_at(deadline, self.screen.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, saw {:?}", self.seen))
                .unwrap();
            assert!(n > 0, "screen closed while waiting for {needle:?}, saw {:?}", self.seen);
            self.seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        self.seen.clear();
    }

    async fn type_line(&mut self, line: &str) {
        self.keyboard.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    }
}

async fn client_joins_room(typed_ahead: bool) {
    let h = harness().await;
    let port = free_port().await;
    h.store
        .put_room("alpha", &RoomAddress::new("127.0.0.1", port))
        .await
        .unwrap();

    let (keyboard, input) = tokio::io::duplex(1024);
    let (output, screen) = tokio::io::duplex(64 * 1024);
    let mut terminal = Terminal {
        keyboard,
        screen,
        seen: String::new(),
    };
    if typed_ahead {
        terminal.type_line("/connect alpha").await;
    }

    let master = h.addr.to_string();
    let client = tokio::spawn(async move {
        let mut client = Client::new(BufReader::new(input), output);
        client.run(&master).await
    });

    terminal.expect(GREETING).await;
    if !typed_ahead {
        terminal.type_line("/connect alpha").await;
    }
    terminal.expect("Enter username").await;
    terminal.type_line("alice01").await;
    terminal.expect("choose a password").await;
    terminal.type_line("Secret1").await;
    terminal.expect("You are connected to server alpha").await;

    terminal.type_line("").await;
    terminal.expect(CONFIRM_DISCONNECT).await;
    terminal.type_line("YES").await;
    tokio::time::timeout(Duration::from_secs(5), client)
        .await
        .expect("client did not exit")
        .unwrap()
        .unwrap();
    assert_eq!(h.store.get_password("alice01").await.unwrap().as_deref(), Some("Secret1"));
}

#[tokio::test]
async fn client_follows_handoff_into_room() {
    client_joins_room(false).await;
}

#[tokio::test]
async fn client_with_connect_typed_ahead_still_hands_off() {
    client_joins_room(true).await;
}
