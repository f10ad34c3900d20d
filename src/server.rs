use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TunnelError;
use crate::protocol::{Protocol, TunnelMessage};
use crate::transport::{framed_tcp, MessageSink, MessageSource};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// 返信がないUDPセッションを閉じるまでの時間
const UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(60);
/// ゲストから読む1回分の大きさ。クライアントの読み込みバッファより小さくする
const STREAM_CHUNK_SIZE: usize = 32 * 1024;
const SESSION_QUEUE: usize = 64;

/// エージェントを実行
pub async fn run_agent(bind_addr: String, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    info!("Agent listening on {}", bind_addr);
    serve_agent(listener, shutdown_rx).await
}

/// 待ち受け済みのリスナーでトンネル接続を受け付ける
pub async fn serve_agent(
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("New tunnel stream from {}", addr);
                        tokio::spawn(async move {
                            let result = handle_session(stream, addr, UDP_SESSION_TIMEOUT).await;
                            if let Err(e) = result {
                                error!("Tunnel stream error from {}: {:#}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Agent shutdown requested");
                return Ok(());
            }
        }
    }
}

/// IDごとの転送先
enum Route {
    Stream {
        writer: OwnedWriteHalf,
        task: JoinHandle<()>,
    },
    Datagram {
        socket: Arc<UdpSocket>,
        task: JoinHandle<()>,
    },
}

impl Route {
    fn is_finished(&self) -> bool {
        match self {
            Route::Stream { task, .. } | Route::Datagram { task, .. } => task.is_finished(),
        }
    }
}

impl Drop for Route {
    fn drop(&mut self) {
        match self {
            Route::Stream { task, .. } | Route::Datagram { task, .. } => task.abort(),
        }
    }
}

/// 終わったUDPセッションの通知
type Expired = (String, Arc<UdpSocket>);

/// 1本のトンネルストリームを処理
async fn handle_session(stream: TcpStream, addr: SocketAddr, udp_idle: Duration) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut sink, mut source) = framed_tcp(stream);

    // 送信はこのタスクだけが行う
    let (tx, mut rx) = mpsc::channel::<TunnelMessage>(SESSION_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                debug!("Failed to write to tunnel stream: {}", e);
                break;
            }
        }
    });

    // 読みかけのフレームを捨てないよう、受信も専用のタスクで行う
    let (in_tx, mut in_rx) = mpsc::channel::<Result<TunnelMessage, TunnelError>>(SESSION_QUEUE);
    let reader = tokio::spawn(async move {
        loop {
            let msg = match source.recv().await {
                Ok(Some(msg)) => Ok(msg),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let failed = msg.is_err();
            if in_tx.send(msg).await.is_err() || failed {
                break;
            }
        }
    });

    // TCPのゲストが閉じたらストリームごと終える
    let ended = CancellationToken::new();
    let mut routes: HashMap<String, Route> = HashMap::new();
    let (expired_tx, mut expired_rx) = mpsc::unbounded_channel::<Expired>();

    let result = loop {
        let msg = tokio::select! {
            msg = in_rx.recv() => msg,
            Some((id, socket)) = expired_rx.recv() => {
                // 同じIDで作り直したセッションは残す
                let current = matches!(
                    routes.get(&id),
                    Some(Route::Datagram { socket: s, .. }) if Arc::ptr_eq(s, &socket)
                );
                if current {
                    routes.remove(&id);
                    debug!("Udp session {} removed", id);
                }
                continue;
            }
            _ = ended.cancelled() => break Ok(()),
        };
        let msg = match msg {
            Some(Ok(msg)) => msg,
            None => break Ok(()),
            Some(Err(e)) => break Err(e).context("Failed to read tunnel message"),
        };

        match msg.protocol {
            Protocol::Stream => {
                if let Err(e) = route_stream(&mut routes, msg, &tx, &ended).await {
                    warn!("Tcp tunnel from {}: {:#}", addr, e);
                    break Ok(());
                }
            }
            Protocol::Datagram => {
                let routed = route_datagram(&mut routes, msg, &tx, &expired_tx, udp_idle).await;
                if let Err(e) = routed {
                    warn!("Udp tunnel from {}: {:#}", addr, e);
                }
            }
        }
    };

    // ゲスト側を閉じ、残りの送信を書き切ってから終わる
    reader.abort();
    drop(routes);
    drop(tx);
    let _ = writer.await;
    debug!("Tunnel stream from {} closed", addr);
    result
}

async fn route_stream(
    routes: &mut HashMap<String, Route>,
    msg: TunnelMessage,
    tx: &mpsc::Sender<TunnelMessage>,
    ended: &CancellationToken,
) -> Result<()> {
    if !routes.contains_key(&msg.id) {
        let target = timeout(CONNECT_TIMEOUT, TcpStream::connect(&msg.guest_addr))
            .await
            .with_context(|| format!("Timeout connecting to {}", msg.guest_addr))?
            .with_context(|| format!("Failed to connect to {}", msg.guest_addr))?;
        target.set_nodelay(true)?;
        info!("Tcp {} -> {}", msg.id, msg.guest_addr);

        let (reader, writer) = target.into_split();
        let task = tokio::spawn(stream_replies(
            reader,
            msg.id.clone(),
            msg.guest_addr.clone(),
            tx.clone(),
            ended.clone(),
        ));
        routes.insert(msg.id.clone(), Route::Stream { writer, task });
    }

    match routes.get_mut(&msg.id) {
        Some(Route::Stream { writer, .. }) => {
            if !msg.data.is_empty() {
                writer
                    .write_all(&msg.data)
                    .await
                    .with_context(|| format!("Failed to write to {}", msg.guest_addr))?;
            }
            Ok(())
        }
        _ => anyhow::bail!("Id {} is already used by a udp tunnel", msg.id),
    }
}

/// ゲスト → トンネル（TCP）
async fn stream_replies(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    id: String,
    guest_addr: String,
    tx: mpsc::Sender<TunnelMessage>,
    ended: CancellationToken,
) {
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let msg = TunnelMessage::stream(
                    id.as_str(),
                    guest_addr.as_str(),
                    Bytes::copy_from_slice(&buf[..n]),
                );
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Failed to read from {}: {}", guest_addr, e);
                break;
            }
        }
    }
    debug!("Guest {} closed for {}", guest_addr, id);
    ended.cancel();
}

async fn route_datagram(
    routes: &mut HashMap<String, Route>,
    msg: TunnelMessage,
    tx: &mpsc::Sender<TunnelMessage>,
    expired_tx: &mpsc::UnboundedSender<Expired>,
    idle: Duration,
) -> Result<()> {
    let peer = msg
        .udp_target_addr
        .clone()
        .with_context(|| format!("Datagram {} has no peer address", msg.id))?;

    if routes.get(&msg.id).map_or(false, |r| r.is_finished()) {
        routes.remove(&msg.id);
    }

    if !routes.contains_key(&msg.id) {
        let guest = lookup_host(&msg.guest_addr)
            .await
            .with_context(|| format!("Failed to resolve {}", msg.guest_addr))?
            .next()
            .with_context(|| format!("No address for {}", msg.guest_addr))?;
        let bind_addr: SocketAddr = if guest.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket
            .connect(guest)
            .await
            .with_context(|| format!("Failed to connect udp to {}", guest))?;
        debug!("Udp {} -> {}", msg.id, guest);

        let socket = Arc::new(socket);
        let task = tokio::spawn(datagram_replies(
            socket.clone(),
            msg.id.clone(),
            msg.guest_addr.clone(),
            peer,
            tx.clone(),
            expired_tx.clone(),
            idle,
        ));
        routes.insert(msg.id.clone(), Route::Datagram { socket, task });
    }

    match routes.get(&msg.id) {
        Some(Route::Datagram { socket, .. }) => {
            if !msg.data.is_empty() {
                socket
                    .send(&msg.data)
                    .await
                    .with_context(|| format!("Failed to send datagram to {}", msg.guest_addr))?;
            }
            Ok(())
        }
        _ => anyhow::bail!("Id {} is already used by a tcp tunnel", msg.id),
    }
}

/// ゲスト → トンネル（UDP）
async fn datagram_replies(
    socket: Arc<UdpSocket>,
    id: String,
    guest_addr: String,
    peer: String,
    tx: mpsc::Sender<TunnelMessage>,
    expired_tx: mpsc::UnboundedSender<Expired>,
    idle: Duration,
) {
    let mut buf = vec![0u8; crate::udp::UDP_BUF_SIZE];
    loop {
        let n = match timeout(idle, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("Failed to receive from {}: {}", guest_addr, e);
                break;
            }
            Err(_) => {
                debug!("Udp session {} idle, closing", id);
                break;
            }
        };
        let msg = TunnelMessage::datagram(
            id.as_str(),
            guest_addr.as_str(),
            peer.as_str(),
            Bytes::copy_from_slice(&buf[..n]),
        );
        if tx.send(msg).await.is_err() {
            break;
        }
    }
    // ソケットはセッションのループで閉じる
    let _ = expired_tx.send((id, socket));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::byte_adapter;
    use crate::transport::{TcpConnector, TunnelConnector};

    async fn spawn_agent() -> (SocketAddr, broadcast::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(serve_agent(listener, shutdown_rx));
        (addr, shutdown_tx)
    }

    /// 1回だけ受け付けて、受け取ったものを返すTCPサーバー
    async fn spawn_tcp_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = stream.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_through_agent() {
        let (agent, _shutdown) = spawn_agent().await;
        let echo = spawn_tcp_echo().await;

        let connector = TcpConnector::new(agent.to_string(), None);
        let stream = connector.open_stream().await.unwrap();
        let (mut reader, mut writer) = byte_adapter(stream, "tcp-test", echo.to_string());

        writer.write(b"ping").await.unwrap();
        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        while got.len() < 4 {
            let n = reader.read(&mut buf).await.unwrap();
            assert!(!reader.is_closed());
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"ping");
    }

    #[tokio::test]
    async fn test_guest_close_ends_stream() {
        let (agent, _shutdown) = spawn_agent().await;

        // 挨拶を受け取ったら返事をして閉じるゲスト
        let guest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let guest_addr = guest.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = guest.accept().await.unwrap();
            let mut hello = [0u8; 2];
            stream.read_exact(&mut hello).await.unwrap();
            stream.write_all(b"bye").await.unwrap();
        });

        let connector = TcpConnector::new(agent.to_string(), None);
        let stream = connector.open_stream().await.unwrap();
        let (mut reader, mut writer) = byte_adapter(stream, "tcp-bye", guest_addr.to_string());
        writer.write(b"hi").await.unwrap();

        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        loop {
            let n = timeout(Duration::from_secs(5), reader.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if reader.is_closed() {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        // 閉じる前のデータは失われない
        assert_eq!(got, b"bye");
    }

    #[tokio::test]
    async fn test_datagrams_through_agent() {
        let (agent, _shutdown) = spawn_agent().await;

        let guest = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let guest_addr = guest.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let (n, from) = guest.recv_from(&mut buf).await.unwrap();
                guest.send_to(&buf[..n], from).await.unwrap();
            }
        });

        let connector = TcpConnector::new(agent.to_string(), None);
        let (mut sink, mut source) = connector.open_stream().await.unwrap().into_split();

        for (id, peer) in [("udp-x-a", "127.0.0.1:7001"), ("udp-x-b", "127.0.0.1:7002")] {
            sink.send(TunnelMessage::datagram(
                id,
                guest_addr.to_string(),
                peer,
                Bytes::from(id.as_bytes().to_vec()),
            ))
            .await
            .unwrap();
        }

        let mut replies = HashMap::new();
        for _ in 0..2 {
            let msg = timeout(Duration::from_secs(5), source.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(msg.protocol, Protocol::Datagram);
            replies.insert(msg.id.clone(), msg);
        }
        assert_eq!(
            replies["udp-x-a"].udp_target_addr.as_deref(),
            Some("127.0.0.1:7001")
        );
        assert_eq!(&replies["udp-x-a"].data[..], b"udp-x-a");
        assert_eq!(
            replies["udp-x-b"].udp_target_addr.as_deref(),
            Some("127.0.0.1:7002")
        );
    }

    #[tokio::test]
    async fn test_idle_datagram_session_releases_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, addr) = listener.accept().await.unwrap();
            let _ = handle_session(stream, addr, Duration::from_millis(500)).await;
        });

        // 受け取るだけで返事をしないゲスト
        let guest = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let guest_addr = guest.local_addr().unwrap();

        let connector = TcpConnector::new(agent.to_string(), None);
        let (mut sink, _source) = connector.open_stream().await.unwrap().into_split();
        sink.send(TunnelMessage::datagram(
            "udp-idle",
            guest_addr.to_string(),
            "127.0.0.1:7001",
            Bytes::from_static(b"hello"),
        ))
        .await
        .unwrap();

        let mut buf = [0u8; 64];
        let (_, from) = timeout(Duration::from_secs(5), guest.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let port = from.port();
        assert!(UdpSocket::bind(("0.0.0.0", port)).await.is_err());

        // ストリームが開いたままでも、期限が切れたらポートは解放される
        timeout(Duration::from_secs(5), async {
            while UdpSocket::bind(("0.0.0.0", port)).await.is_err() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_guest_ends_stream() {
        let (agent, _shutdown) = spawn_agent().await;
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let unused_addr = unused.local_addr().unwrap();
        drop(unused);

        let connector = TcpConnector::new(agent.to_string(), None);
        let (mut sink, mut source) = connector.open_stream().await.unwrap().into_split();
        sink.send(TunnelMessage::stream(
            "tcp-nowhere",
            unused_addr.to_string(),
            Bytes::from_static(b"hello"),
        ))
        .await
        .unwrap();

        let end = timeout(Duration::from_secs(5), source.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(end.is_none());
    }
}
