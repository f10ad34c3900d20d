//! トンネルストリームの抽象
//!
//! ハンドラはここのトレイトだけに依存する。実装はエージェントへのTCP接続
//! （[`TcpConnector`]）と、テスト用のインメモリ実装（[`memory`]）。

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};
use crate::protocol::TunnelMessage;

/// メッセージの送信側
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, msg: TunnelMessage) -> Result<()>;
}

/// メッセージの受信側
///
/// `Ok(None)` はストリームの終了。エラー時にメッセージが返ることはない。
#[async_trait]
pub trait MessageSource: Send {
    async fn recv(&mut self) -> Result<Option<TunnelMessage>>;
}

/// 確立されたトンネルストリーム
///
/// 送信と受信を別タスクから同時に使えるよう、最初から分割して持つ。
pub struct TunnelStream {
    pub sink: Box<dyn MessageSink>,
    pub source: Box<dyn MessageSource>,
}

impl TunnelStream {
    pub fn new(sink: impl MessageSink + 'static, source: impl MessageSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }

    pub fn into_split(self) -> (Box<dyn MessageSink>, Box<dyn MessageSource>) {
        (self.sink, self.source)
    }
}

/// トンネルストリームを開く
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn open_stream(&self) -> Result<TunnelStream>;
}

/// 長さ付きフレームでメッセージを書き出す
pub struct FramedSink<W> {
    writer: W,
}

impl<W> FramedSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for FramedSink<W> {
    async fn send(&mut self, msg: TunnelMessage) -> Result<()> {
        msg.write_to(&mut self.writer).await
    }
}

/// 長さ付きフレームからメッセージを読み出す
pub struct FramedSource<R> {
    reader: R,
}

impl<R> FramedSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageSource for FramedSource<R> {
    async fn recv(&mut self) -> Result<Option<TunnelMessage>> {
        TunnelMessage::read_from(&mut self.reader).await
    }
}

/// TCP接続をフレーム化されたトンネルストリームとして扱う
pub fn framed_tcp(
    stream: TcpStream,
) -> (FramedSink<OwnedWriteHalf>, FramedSource<OwnedReadHalf>) {
    let (read, write) = stream.into_split();
    (FramedSink::new(write), FramedSource::new(read))
}

/// ストリームごとにエージェントへ新しいTCP接続を張る
pub struct TcpConnector {
    agent_addr: String,
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(agent_addr: impl Into<String>, keepalive: Option<Duration>) -> Self {
        Self {
            agent_addr: agent_addr.into(),
            keepalive,
        }
    }
}

#[async_trait]
impl TunnelConnector for TcpConnector {
    async fn open_stream(&self) -> Result<TunnelStream> {
        debug!("Connecting to agent: {}", self.agent_addr);

        let stream = TcpStream::connect(&self.agent_addr)
            .await
            .map_err(TunnelError::StreamOpen)?;
        stream.set_nodelay(true).map_err(TunnelError::StreamOpen)?;
        if let Some(keepalive) = self.keepalive {
            if let Err(e) = set_tcp_keepalive(&stream, keepalive) {
                warn!("Failed to set TCP keepalive: {}", e);
            }
        }

        let (sink, source) = framed_tcp(stream);
        Ok(TunnelStream::new(sink, source))
    }
}

/// キャンセルとタイムアウトを考慮してストリームを開く
pub async fn open_stream(
    ctx: &CancellationToken,
    connector: &dyn TunnelConnector,
    open_timeout: Duration,
) -> Result<TunnelStream> {
    tokio::select! {
        _ = ctx.cancelled() => Err(TunnelError::StreamOpen(io::Error::new(
            io::ErrorKind::Interrupted,
            "cancelled before the tunnel stream was opened",
        ))),
        result = timeout(open_timeout, connector.open_stream()) => match result {
            Ok(result) => result,
            Err(_) => Err(TunnelError::StreamOpen(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out after {:?}", open_timeout),
            ))),
        },
    }
}

/// TCPキープアライブを設定
pub fn set_tcp_keepalive(stream: &TcpStream, interval: Duration) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(interval)
        .with_interval(interval);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// プロセス内でつながったトンネルストリーム
pub mod memory {
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use super::{MessageSink, MessageSource, TunnelConnector, TunnelStream};
    use crate::error::{Result, TunnelError};
    use crate::protocol::TunnelMessage;

    pub struct MemorySink {
        tx: mpsc::Sender<TunnelMessage>,
    }

    pub struct MemorySource {
        rx: mpsc::Receiver<TunnelMessage>,
    }

    #[async_trait]
    impl MessageSink for MemorySink {
        async fn send(&mut self, msg: TunnelMessage) -> Result<()> {
            self.tx.send(msg).await.map_err(|_| TunnelError::closed())
        }
    }

    #[async_trait]
    impl MessageSource for MemorySource {
        async fn recv(&mut self) -> Result<Option<TunnelMessage>> {
            Ok(self.rx.recv().await)
        }
    }

    /// 双方向のストリームを作る
    ///
    /// 1つ目がハンドラ側、2つ目がリモート側。どちらかのsinkをdropすると
    /// 反対側のsourceはストリーム終了を受け取る。
    pub fn pair(capacity: usize) -> (TunnelStream, (MemorySink, MemorySource)) {
        let (to_remote, from_local) = mpsc::channel(capacity);
        let (to_local, from_remote) = mpsc::channel(capacity);

        let local = TunnelStream::new(
            MemorySink { tx: to_remote },
            MemorySource { rx: from_remote },
        );
        let remote = (MemorySink { tx: to_local }, MemorySource { rx: from_local });
        (local, remote)
    }

    /// 用意しておいたストリームを順に返すコネクタ
    #[derive(Default)]
    pub struct Connector {
        streams: Mutex<VecDeque<TunnelStream>>,
    }

    impl Connector {
        pub fn new(streams: impl IntoIterator<Item = TunnelStream>) -> Self {
            Self {
                streams: Mutex::new(streams.into_iter().collect()),
            }
        }

        pub fn push(&self, stream: TunnelStream) {
            if let Ok(mut streams) = self.streams.lock() {
                streams.push_back(stream);
            }
        }
    }

    #[async_trait]
    impl TunnelConnector for Connector {
        async fn open_stream(&self) -> Result<TunnelStream> {
            let next = self.streams.lock().ok().and_then(|mut s| s.pop_front());
            next.ok_or_else(|| {
                TunnelError::StreamOpen(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "no tunnel stream available",
                ))
            })
        }
    }
}
