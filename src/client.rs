use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ForwardConfig, ForwardProtocol};
use crate::tcp::handle_tcp_connection;
use crate::transport::TunnelConnector;
use crate::udp::handle_udp_socket;

/// UDPソケットを開き直すまでの間隔
const RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// acceptが失敗したときの待ち時間
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// 待ち受けを開始済みの転送ルール
pub enum BoundForward {
    Tcp {
        listener: TcpListener,
        guest: String,
    },
    Udp {
        socket: UdpSocket,
        listen: SocketAddr,
        guest: String,
    },
}

impl BoundForward {
    /// 実際に待ち受けているアドレス
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            BoundForward::Tcp { listener, .. } => Ok(listener.local_addr()?),
            BoundForward::Udp { socket, .. } => Ok(socket.local_addr()?),
        }
    }
}

/// すべての転送ルールで待ち受けを開始
pub async fn bind_forwards(forwards: &[ForwardConfig]) -> Result<Vec<BoundForward>> {
    let mut bound = Vec::with_capacity(forwards.len());
    for forward in forwards {
        let b = match forward.protocol {
            ForwardProtocol::Tcp => {
                let listener = TcpListener::bind(forward.listen)
                    .await
                    .with_context(|| format!("Failed to bind tcp {}", forward.listen))?;
                BoundForward::Tcp {
                    listener,
                    guest: forward.guest.clone(),
                }
            }
            ForwardProtocol::Udp => {
                let socket = UdpSocket::bind(forward.listen)
                    .await
                    .with_context(|| format!("Failed to bind udp {}", forward.listen))?;
                // ポート0で指定された場合も、開き直すときは同じポートを使う
                let listen = socket.local_addr()?;
                BoundForward::Udp {
                    socket,
                    listen,
                    guest: forward.guest.clone(),
                }
            }
        };
        info!(
            "Forwarding {} {} -> {}",
            forward.protocol.as_str(),
            b.local_addr()?,
            forward.guest
        );
        bound.push(b);
    }
    Ok(bound)
}

/// 転送を実行（メインループ）
///
/// `ctx` がキャンセルされるまで戻らない。
pub async fn run_forwarder(
    connector: Arc<dyn TunnelConnector>,
    forwards: Vec<BoundForward>,
    open_timeout: Duration,
    ctx: CancellationToken,
) -> Result<()> {
    let mut handles = Vec::with_capacity(forwards.len());
    for forward in forwards {
        let connector = connector.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            match forward {
                BoundForward::Tcp { listener, guest } => {
                    run_tcp_forward(listener, guest, connector, open_timeout, ctx).await
                }
                BoundForward::Udp {
                    socket,
                    listen,
                    guest,
                } => run_udp_forward(socket, listen, guest, connector, open_timeout, ctx).await,
            }
        }));
    }

    for handle in handles {
        handle.await.context("Forward task panicked")?;
    }
    info!("Forwarder stopped");
    Ok(())
}

/// TCP接続を受け付け、接続ごとにトンネルを張る
async fn run_tcp_forward(
    listener: TcpListener,
    guest: String,
    connector: Arc<dyn TunnelConnector>,
    open_timeout: Duration,
    ctx: CancellationToken,
) {
    let guest: Arc<str> = guest.into();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((conn, addr)) => {
                        debug!("New tcp connection from {}", addr);
                        let connector = connector.clone();
                        let guest = guest.clone();
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_tcp_connection(
                                &ctx,
                                connector.as_ref(),
                                conn,
                                &guest,
                                open_timeout,
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    }
                }
            }
            _ = ctx.cancelled() => {
                debug!("Tcp forward to {} stopped", guest);
                return;
            }
        }
    }
}

/// UDPソケットをトンネルにつなぐ。トンネルが終わったらソケットを開き直す
async fn run_udp_forward(
    socket: UdpSocket,
    listen: SocketAddr,
    guest: String,
    connector: Arc<dyn TunnelConnector>,
    open_timeout: Duration,
    ctx: CancellationToken,
) {
    let mut socket = Some(socket);
    loop {
        let current = match socket.take() {
            Some(s) => Some(s),
            None => match UdpSocket::bind(listen).await {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to rebind udp {}: {}", listen, e);
                    None
                }
            },
        };

        if let Some(current) = current {
            tokio::select! {
                _ = handle_udp_socket(&ctx, connector.as_ref(), current, &guest, open_timeout) => {}
                _ = ctx.cancelled() => {
                    debug!("Udp forward on {} stopped", listen);
                    return;
                }
            }
            warn!(
                "Udp tunnel on {} ended, reopening in {:?}...",
                listen, RETRY_INTERVAL
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            _ = ctx.cancelled() => return,
        }
    }
}
