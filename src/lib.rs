//! Two-tier text chat: a lobby (master) server that lists, creates and hands
//! out rooms, and per-room chat servers that authenticate users and route
//! broadcast and whisper traffic.
//!
//! A client talks to the master first. `/connect <room>` makes the master
//! ensure the room's server is running, send its address and hang up; the
//! client then reconnects to the room directly.

pub mod auth;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod master;
pub mod protocol;
pub mod room;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod table;
pub mod types;
pub mod validate;

pub use client::Client;
pub use config::{MasterConfig, RoomConfig, WorkerKind};
pub use error::ChatError;
pub use master::Master;
pub use room::RoomServer;
pub use store::{MemoryStore, SqliteStore, Store, StoreError};
pub use supervisor::{Launcher, ProcessLauncher, Supervisor, TaskLauncher};
pub use types::{RoomAddress, SessionId};
pub use validate::Validator;
