use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::adapter::byte_adapter;
use crate::bridge::{bridge, Endpoint};
use crate::transport::{open_stream, TunnelConnector};

/// TCP接続の識別子
pub fn tcp_stream_id(local: SocketAddr, remote: SocketAddr) -> String {
    format!("tcp-{}-{}", local, remote)
}

/// 受け付けたTCP接続を1本のトンネルストリームにつなぐ
///
/// ストリームを開けなかった場合は接続を閉じて終わる。
/// どちらかの側が閉じるかエラーになるまで戻らない。接続は必ず閉じられる。
pub async fn handle_tcp_connection(
    ctx: &CancellationToken,
    connector: &dyn TunnelConnector,
    conn: TcpStream,
    guest_addr: &str,
    open_timeout: Duration,
) {
    let id = match (conn.local_addr(), conn.peer_addr()) {
        (Ok(local), Ok(remote)) => tcp_stream_id(local, remote),
        (Err(e), _) | (_, Err(e)) => {
            error!("Could not read addresses of tcp connection: {}", e);
            return;
        }
    };

    let stream = match open_stream(ctx, connector, open_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Could not open tcp tunnel for id {}: {}", id, e);
            return;
        }
    };

    debug!("Tcp tunnel opened: {} -> {}", id, guest_addr);

    let (tunnel_read, tunnel_write) = byte_adapter(stream, id.as_str(), guest_addr);
    let (conn_read, conn_write) = conn.into_split();

    bridge(
        "tcp tunnel",
        Endpoint::new(guest_addr, tunnel_read, tunnel_write),
        Endpoint::new(id, conn_read, conn_write),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::protocol::{Protocol, TunnelMessage};
    use crate::transport::{memory, MessageSink, MessageSource, TunnelStream};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const GUEST: &str = "10.0.0.1:22";

    /// ローカル接続を作り、サーバー側をハンドラに渡す
    async fn spawn_handler(
        connector: Arc<dyn TunnelConnector>,
    ) -> (TcpStream, SocketAddr, SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(server_addr).await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let handle = tokio::spawn(async move {
            let ctx = CancellationToken::new();
            handle_tcp_connection(
                &ctx,
                connector.as_ref(),
                accepted,
                GUEST,
                Duration::from_secs(5),
            )
            .await
        });
        (client, server_addr, client_addr, handle)
    }

    #[test]
    fn test_tcp_stream_id() {
        let local: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:22".parse().unwrap();
        assert_eq!(tcp_stream_id(local, remote), "tcp-127.0.0.1:5000-127.0.0.1:22");
    }

    #[tokio::test]
    async fn test_local_bytes_become_one_message() {
        let (stream, (mut remote_sink, mut remote_source)) = memory::pair(8);
        let connector = Arc::new(memory::Connector::new([stream]));
        let (mut client, server_addr, client_addr, handle) = spawn_handler(connector).await;

        client.write_all(b"SSH-2.0").await.unwrap();
        let msg = remote_source.recv().await.unwrap().unwrap();
        assert_eq!(msg.id, tcp_stream_id(server_addr, client_addr));
        assert_eq!(msg.protocol, Protocol::Stream);
        assert_eq!(msg.guest_addr, GUEST);
        assert_eq!(&msg.data[..], b"SSH-2.0");

        remote_sink
            .send(TunnelMessage::stream(
                msg.id.as_str(),
                GUEST,
                Bytes::from_static(b"SSH-2.0-guest"),
            ))
            .await
            .unwrap();
        let mut buf = [0u8; 13];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-guest");

        // ローカル側を閉じるとハンドラが終わり、ストリームも閉じる
        drop(client);
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(remote_source.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_end_of_tunnel_closes_local_connection() {
        let (stream, (remote_sink, _remote_source)) = memory::pair(8);
        let connector = Arc::new(memory::Connector::new([stream]));
        let (mut client, _, _, handle) = spawn_handler(connector).await;

        drop(remote_sink);
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_open_failure_closes_local_connection() {
        let connector = Arc::new(memory::Connector::default());
        let (mut client, _, _, handle) = spawn_handler(connector).await;

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    struct PendingConnector;

    #[async_trait]
    impl TunnelConnector for PendingConnector {
        async fn open_stream(&self) -> Result<TunnelStream> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancelled_open_abandons_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let ctx = CancellationToken::new();
        let child = ctx.clone();
        let handle = tokio::spawn(async move {
            handle_tcp_connection(
                &child,
                &PendingConnector,
                accepted,
                GUEST,
                Duration::from_secs(60),
            )
            .await
        });

        ctx.cancel();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
