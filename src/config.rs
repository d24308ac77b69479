use std::time::Duration;

use clap::ValueEnum;

use crate::types::RoomAddress;

/// How the master runs room servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum WorkerKind {
    /// One OS process per room (re-executes this binary).
    #[default]
    Process,
    /// One isolated tokio task per room inside the master process.
    Task,
}

/// Master server configuration.
///
/// Built with the builder so the CLI and tests only spell out what they
/// change.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub worker: WorkerKind,
    /// How long a freshly started room gets before its liveness is checked.
    pub startup_grace: Duration,
}

pub struct MasterConfigBuilder {
    host: String,
    port: u16,
    worker: WorkerKind,
    startup_grace: Duration,
}

impl MasterConfig {
    pub fn builder() -> MasterConfigBuilder {
        MasterConfigBuilder {
            host: "127.0.0.1".to_string(),
            port: 8000,
            worker: WorkerKind::Process,
            startup_grace: Duration::from_millis(200),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl MasterConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn worker(mut self, worker: WorkerKind) -> Self {
        self.worker = worker;
        self
    }

    pub fn startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn build(self) -> MasterConfig {
        MasterConfig {
            host: self.host,
            port: self.port,
            worker: self.worker,
            startup_grace: self.startup_grace,
        }
    }
}

/// Room server configuration: a name and the address it binds.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

pub struct RoomConfigBuilder {
    name: String,
    host: String,
    port: u16,
}

impl RoomConfig {
    pub fn builder(name: impl Into<String>) -> RoomConfigBuilder {
        RoomConfigBuilder {
            name: name.into(),
            host: "127.0.0.1".to_string(),
            port: 9000,
        }
    }

    pub fn address(&self) -> RoomAddress {
        RoomAddress::new(self.host.clone(), self.port)
    }

    pub fn bind_addr(&self) -> String {
        self.address().socket_addr()
    }
}

impl RoomConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(self, addr: &RoomAddress) -> Self {
        self.host(addr.host.clone()).port(addr.port)
    }

    pub fn build(self) -> RoomConfig {
        RoomConfig {
            name: self.name,
            host: self.host,
            port: self.port,
        }
    }
}
