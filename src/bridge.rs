use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::adapter::{TunnelReader, TunnelWriter};
use crate::error::{Result, TunnelError};

/// 1回のコピーで使うバッファサイズ
pub const BRIDGE_BUF_SIZE: usize = 64 * 1024;

/// 1回の読み込みの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    /// nバイト読めた
    Data(usize),
    /// 何も読めなかったが終端ではない（空メッセージ）
    Idle,
    /// これ以上データは来ない
    End,
}

/// ブリッジの読み込み側
#[async_trait]
pub trait ByteSource: Send {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ReadEvent>;
}

/// ブリッジの書き込み側
#[async_trait]
pub trait ByteSink: Send {
    /// `buf` の先頭から書けた分のバイト数を返す
    async fn write_chunk(&mut self, buf: &[u8]) -> Result<usize>;

    /// 書き込み側を閉じる
    async fn close(&mut self);
}

/// ブリッジの片側
pub struct Endpoint<R, W> {
    pub name: String,
    pub reader: R,
    pub writer: W,
}

impl<R, W> Endpoint<R, W> {
    pub fn new(name: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
        }
    }
}

/// 2つのエンドポイント間でバイト列を双方向にコピーする
///
/// どちらかの方向が終端またはエラーになった時点で両方向を止め、
/// 両方の書き込み側を閉じる。
pub async fn bridge<AR, AW, BR, BW>(name: &str, a: Endpoint<AR, AW>, b: Endpoint<BR, BW>)
where
    AR: ByteSource,
    AW: ByteSink,
    BR: ByteSource,
    BW: ByteSink,
{
    let Endpoint {
        name: a_name,
        reader: mut a_reader,
        writer: mut a_writer,
    } = a;
    let Endpoint {
        name: b_name,
        reader: mut b_reader,
        writer: mut b_writer,
    } = b;

    tokio::select! {
        result = copy(&mut a_reader, &mut b_writer) => {
            match result {
                Ok(bytes) => debug!("{}: {} -> {}: {} bytes", name, a_name, b_name, bytes),
                Err(e) => debug!("{}: {} -> {} error: {}", name, a_name, b_name, e),
            }
        }
        result = copy(&mut b_reader, &mut a_writer) => {
            match result {
                Ok(bytes) => debug!("{}: {} -> {}: {} bytes", name, b_name, a_name, bytes),
                Err(e) => debug!("{}: {} -> {} error: {}", name, b_name, a_name, e),
            }
        }
    }

    a_writer.close().await;
    b_writer.close().await;
    debug!("{}: {} <-> {} closed", name, a_name, b_name);
}

/// 1方向のコピー。読んだ分を全部書いてから次を読む
async fn copy<R, W>(from: &mut R, to: &mut W) -> Result<u64>
where
    R: ByteSource + ?Sized,
    W: ByteSink + ?Sized,
{
    let mut buf = vec![0u8; BRIDGE_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match from.read_chunk(&mut buf).await? {
            ReadEvent::Data(n) => n,
            ReadEvent::Idle => continue,
            ReadEvent::End => return Ok(total),
        };

        let mut written = 0;
        while written < n {
            let w = to.write_chunk(&buf[written..n]).await?;
            if w == 0 {
                return Err(TunnelError::Local(io::ErrorKind::WriteZero.into()));
            }
            written += w;
        }
        total += n as u64;
    }
}

#[async_trait]
impl ByteSource for TunnelReader {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ReadEvent> {
        let n = self.read(buf).await?;
        Ok(match n {
            0 if self.is_closed() => ReadEvent::End,
            0 => ReadEvent::Idle,
            n => ReadEvent::Data(n),
        })
    }
}

#[async_trait]
impl ByteSink for TunnelWriter {
    async fn write_chunk(&mut self, buf: &[u8]) -> Result<usize> {
        self.write(buf).await
    }

    // ストリーム自体はdropで閉じる
    async fn close(&mut self) {}
}

async fn read_io<R: AsyncRead + Unpin + Send>(reader: &mut R, buf: &mut [u8]) -> Result<ReadEvent> {
    match reader.read(buf).await.map_err(TunnelError::Local)? {
        0 => Ok(ReadEvent::End),
        n => Ok(ReadEvent::Data(n)),
    }
}

async fn write_io<W: AsyncWrite + Unpin + Send>(writer: &mut W, buf: &[u8]) -> Result<usize> {
    writer.write_all(buf).await.map_err(TunnelError::Local)?;
    Ok(buf.len())
}

#[async_trait]
impl ByteSource for OwnedReadHalf {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ReadEvent> {
        read_io(self, buf).await
    }
}

#[async_trait]
impl ByteSink for OwnedWriteHalf {
    async fn write_chunk(&mut self, buf: &[u8]) -> Result<usize> {
        write_io(self, buf).await
    }

    async fn close(&mut self) {
        let _ = self.shutdown().await;
    }
}

#[async_trait]
impl<T: AsyncRead + Send> ByteSource for ReadHalf<T> {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<ReadEvent> {
        read_io(self, buf).await
    }
}

#[async_trait]
impl<T: AsyncWrite + Send> ByteSink for WriteHalf<T> {
    async fn write_chunk(&mut self, buf: &[u8]) -> Result<usize> {
        write_io(self, buf).await
    }

    async fn close(&mut self) {
        let _ = self.shutdown().await;
    }
}
