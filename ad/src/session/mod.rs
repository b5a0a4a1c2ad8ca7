//! Session daemons, their control protocol, and the attach client

pub mod client;
pub mod daemon;
pub mod fanout;
pub mod protocol;

pub use client::{EventStream, SessionClient};
pub use daemon::{DaemonConfig, create_session, read_daemon_config, run_session, start_detached};
pub use fanout::EventHub;
pub use protocol::{ClientMessage, ProtocolError, ServerMessage, SpawnRequest};
