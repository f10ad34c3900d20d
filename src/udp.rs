use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::{ProtocolError, Result, TunnelError};
use crate::protocol::TunnelMessage;
use crate::transport::{open_stream, MessageSink, MessageSource, TunnelConnector};

/// 受信バッファ。最大のUDPペイロードが収まる大きさ
pub const UDP_BUF_SIZE: usize = 65535;

/// 読み込み後のソケットの状態
#[derive(Debug)]
pub enum ReadStatus {
    /// 引き続き読める
    Open,
    /// これ以上データは来ない（エラーではない）
    Closed,
    Failed(io::Error),
}

/// 1回の `recv_from` の結果
///
/// データグラムと終端の通知が同時に来ることがある。
/// その場合はデータグラムを先に処理してから `status` を見る。
#[derive(Debug)]
pub struct PacketRead {
    /// 受信したバイト数と送信元
    pub datagram: Option<(usize, SocketAddr)>,
    pub status: ReadStatus,
}

/// アドレス付きで読み書きするパケットソケット
#[async_trait]
pub trait PacketSocket: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    async fn recv_from(&self, buf: &mut [u8]) -> PacketRead;

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl PacketSocket for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> PacketRead {
        match UdpSocket::recv_from(self, buf).await {
            Ok((n, peer)) => PacketRead {
                datagram: Some((n, peer)),
                status: ReadStatus::Open,
            },
            Err(e) => PacketRead {
                datagram: None,
                status: ReadStatus::Failed(e),
            },
        }
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }
}

/// UDPソケットの識別子
pub fn udp_socket_id(local: SocketAddr) -> String {
    format!("udp-{}", local)
}

/// ソケット上のピアごとの識別子
pub fn udp_peer_id(socket_id: &str, peer: SocketAddr) -> String {
    format!("{}-{}", socket_id, peer)
}

/// ローカルのUDPソケット1つを1本のトンネルストリームにつなぐ
///
/// 何人のピアから届いても同じストリームで送り、IDと送信元アドレスで区別する。
/// ソケットが閉じるか、ストリームが終わるか、どちらかが失敗したら戻る。
/// エラーはログに出すだけ。
pub async fn handle_udp_socket<S: PacketSocket>(
    ctx: &CancellationToken,
    connector: &dyn TunnelConnector,
    socket: S,
    guest_addr: &str,
    open_timeout: Duration,
) {
    let id = match socket.local_addr() {
        Ok(local) => udp_socket_id(local),
        Err(e) => {
            error!("Could not read address of udp socket: {}", e);
            return;
        }
    };

    let stream = match open_stream(ctx, connector, open_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Could not open udp tunnel for id {}: {}", id, e);
            return;
        }
    };

    debug!("Udp tunnel opened: {} -> {}", id, guest_addr);

    let (mut sink, mut source) = stream.into_split();
    // 片方が終わったらもう片方も止める
    let stop = CancellationToken::new();

    let (outbound, inbound) = tokio::join!(
        until_stopped(
            &stop,
            forward_outbound(&socket, sink.as_mut(), &id, guest_addr)
        ),
        until_stopped(&stop, forward_inbound(&socket, source.as_mut())),
    );

    if let Err(e) = outbound.and(inbound) {
        debug!("Error in udp tunnel for id {}: {}", id, e);
    } else {
        debug!("Udp tunnel closed: {}", id);
    }
}

async fn until_stopped(
    stop: &CancellationToken,
    task: impl Future<Output = Result<()>>,
) -> Result<()> {
    let result = tokio::select! {
        result = task => result,
        _ = stop.cancelled() => return Ok(()),
    };
    stop.cancel();
    result
}

/// ローカル → トンネル
async fn forward_outbound<S: PacketSocket>(
    socket: &S,
    sink: &mut dyn MessageSink,
    socket_id: &str,
    guest_addr: &str,
) -> Result<()> {
    let mut buf = vec![0u8; UDP_BUF_SIZE];

    loop {
        let read = socket.recv_from(&mut buf).await;

        if let Some((n, peer)) = read.datagram {
            if n > 0 {
                // IDはアドレスから決まるので、ピアの一覧は持たない
                let id = udp_peer_id(socket_id, peer);
                trace!("Udp {} -> tunnel: {} bytes", id, n);
                let msg = TunnelMessage::datagram(
                    id,
                    guest_addr,
                    peer.to_string(),
                    Bytes::copy_from_slice(&buf[..n]),
                );
                sink.send(msg).await?;
            }
        }

        match read.status {
            ReadStatus::Open => {}
            ReadStatus::Closed => return Ok(()),
            ReadStatus::Failed(e) => return Err(TunnelError::Local(e)),
        }
    }
}

/// トンネル → ローカル
async fn forward_inbound<S: PacketSocket>(
    socket: &S,
    source: &mut dyn MessageSource,
) -> Result<()> {
    while let Some(msg) = source.recv().await? {
        let target = match msg.udp_target_addr {
            Some(target) => target,
            None => return Err(ProtocolError::MissingPeerAddr { id: msg.id }.into()),
        };
        // 毎回解決する。名前で指定されたピアも許す
        let peer = resolve_peer(&target).await?;
        if msg.data.is_empty() {
            continue;
        }
        trace!("Udp tunnel -> {}: {} bytes", peer, msg.data.len());
        socket
            .send_to(&msg.data, peer)
            .await
            .map_err(TunnelError::Local)?;
    }
    Ok(())
}

async fn resolve_peer(addr: &str) -> Result<SocketAddr> {
    let mut addrs = lookup_host(addr)
        .await
        .map_err(|source| ProtocolError::InvalidPeerAddr {
            addr: addr.to_string(),
            source,
        })?;
    addrs.next().ok_or_else(|| {
        ProtocolError::InvalidPeerAddr {
            addr: addr.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no address found"),
        }
        .into()
    })
}
