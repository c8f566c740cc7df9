//! 远程控制：心跳协议、传输与通道

mod channel;
mod protocol;
mod transport;

pub use channel::{backoff_delay, ChannelConfig, ChannelError, RemoteChannel};
pub use protocol::{Command, CommandDefaults, HeartbeatRequest, HeartbeatResponse};
pub use transport::{retry_fixed, HeartbeatTransport, HttpTransport, TransportError};
