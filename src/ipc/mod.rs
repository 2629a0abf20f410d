// IPC module - Communication between client and daemon

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{
    AppOutcome, Command, LogOptions, ProcessInfo, Request, Response, ResponseData,
};
pub use server::IpcServer;

/// Default socket path for daemon communication
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/shepherd.sock";
