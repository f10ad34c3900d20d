// ローカルのTCP/UDPトラフィックを、リモートエージェントへのトンネルストリームで転送する
// TCPは接続ごとに1本、UDPはソケットごとに1本のストリームを使う

pub mod adapter;
pub mod bridge;
mod client;
mod config;
pub mod error;
pub mod protocol;
mod server;
pub mod tcp;
pub mod transport;
mod tunnel;
pub mod udp;

// パブリックAPI
pub use config::{AgentConfig, Config, ForwardConfig, ForwardProtocol};
pub use error::{ProtocolError, TunnelError};
pub use protocol::{Protocol, TunnelMessage};
pub use server::{run_agent, serve_agent};
pub use tcp::handle_tcp_connection;
pub use transport::{TcpConnector, TunnelConnector, TunnelStream};
pub use tunnel::{start_forwarding, start_forwarding_with, Forwarder};
pub use udp::handle_udp_socket;
