use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client;
use crate::config::Config;
use crate::transport::{TcpConnector, TunnelConnector};

/// 実行中のポート転送
pub struct Forwarder {
    agent_addr: String,
    local_addrs: Vec<SocketAddr>,
    ctx: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl Forwarder {
    /// 実際に待ち受けているアドレス（設定の順）
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// エージェントのアドレスを取得
    pub fn agent_addr(&self) -> &str {
        &self.agent_addr
    }

    /// 転送を止める
    ///
    /// 待ち受けを止め、開きかけのストリームも中断する。
    /// 転送中の接続はそれぞれのソケットかストリームが閉じるまで続く。
    pub async fn shutdown(self) -> Result<()> {
        self.ctx.cancel();
        self.handle.await??;
        Ok(())
    }
}

/// 転送を開始（メインAPI）
///
/// すべての転送ルールで待ち受けを始めてから戻る。
///
/// # 例
/// ```no_run
/// use portfwd::{start_forwarding, Config};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = Config::from_str(r#"
///         [agent]
///         addr = "10.0.0.1:2333"
///         [[forwards]]
///         protocol = "tcp"
///         listen = "127.0.0.1:2222"
///         guest = "127.0.0.1:22"
///     "#)?;
///     let forwarder = start_forwarding(&config).await?;
///
///     tokio::signal::ctrl_c().await?;
///
///     forwarder.shutdown().await?;
///     Ok(())
/// }
/// ```
pub async fn start_forwarding(config: &Config) -> Result<Forwarder> {
    let connector = Arc::new(TcpConnector::new(
        config.agent.addr.clone(),
        config.agent.keepalive(),
    ));
    start_forwarding_with(connector, config).await
}

/// 任意のトンネル実装で転送を開始
pub async fn start_forwarding_with(
    connector: Arc<dyn TunnelConnector>,
    config: &Config,
) -> Result<Forwarder> {
    let bound = client::bind_forwards(&config.forwards).await?;
    let local_addrs = bound
        .iter()
        .map(|b| b.local_addr())
        .collect::<Result<Vec<_>>>()?;

    let ctx = CancellationToken::new();
    let handle = tokio::spawn(client::run_forwarder(
        connector,
        bound,
        config.agent.open_timeout(),
        ctx.clone(),
    ));

    Ok(Forwarder {
        agent_addr: config.agent.addr.clone(),
        local_addrs,
        ctx,
        handle,
    })
}
