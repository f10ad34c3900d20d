use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = "portfwd")]
#[clap(about = "Forward local TCP/UDP ports through a tunnel agent", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 転送モード: 設定ファイルの転送ルールで待ち受ける
    Forward {
        /// 設定ファイル (TOML)
        #[clap(short, long)]
        config: PathBuf,
    },

    /// エージェントモード: トンネルストリームを受け付け、ゲストへ中継する
    Agent {
        /// バインドアドレス (例: 0.0.0.0:2333)
        #[clap(default_value = "0.0.0.0:2333")]
        bind_addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // ロギング設定
    #[cfg(feature = "console")]
    console_subscriber::init();

    #[cfg(not(feature = "console"))]
    {
        let is_atty = atty::is(atty::Stream::Stdout);
        let level = "info";
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from(level)),
            )
            .with_ansi(is_atty)
            .init();
    }

    // 接続数が多くなるのでファイルディスクリプタの上限を上げる
    if let Some(limit) = fdlimit::raise_fd_limit() {
        debug!("File descriptor limit raised to {}", limit);
    }

    let cli = Cli::parse();

    // Ctrl+Cハンドラー
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            panic!("Failed to listen for ctrl-c signal: {:?}", e);
        }
        let _ = shutdown_tx.send(());
    });

    match cli.command {
        Commands::Forward { config } => {
            let config = portfwd::Config::from_file(&config).await?;
            let forwarder = portfwd::start_forwarding(&config).await?;
            info!(
                "Forwarding {} port(s) through {}",
                forwarder.local_addrs().len(),
                forwarder.agent_addr()
            );

            // シャットダウン待機
            let mut rx = shutdown_rx;
            let _ = rx.recv().await;

            info!("Shutting down...");
            forwarder.shutdown().await?;
        }
        Commands::Agent { bind_addr } => {
            portfwd::run_agent(bind_addr, shutdown_rx).await?;
        }
    }

    Ok(())
}
