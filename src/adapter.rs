use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::protocol::TunnelMessage;
use crate::transport::{MessageSink, MessageSource, TunnelStream};

/// 1本のトンネルストリームを、1つのIDと宛先を持つバイト列の読み書き口として見せる
///
/// 読み側と書き側は別タスクから使えるよう分割されている。
pub fn byte_adapter(
    stream: TunnelStream,
    id: impl Into<String>,
    guest_addr: impl Into<String>,
) -> (TunnelReader, TunnelWriter) {
    let (sink, source) = stream.into_split();
    let reader = TunnelReader {
        source,
        closed: false,
    };
    let writer = TunnelWriter {
        sink,
        id: id.into(),
        guest_addr: guest_addr.into(),
    };
    (reader, writer)
}

/// トンネルからの受信をバイト列として読む
pub struct TunnelReader {
    source: Box<dyn MessageSource>,
    closed: bool,
}

impl TunnelReader {
    /// 次のメッセージのペイロードを `buf` に読み込む
    ///
    /// ストリーム終了時は `Ok(0)` を返し、以降も `Ok(0)` を返し続ける。
    /// 空のペイロードも `Ok(0)` だが、この場合 [`is_closed`](Self::is_closed) は `false`。
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Ok(0);
        }

        let msg = match self.source.recv().await? {
            Some(msg) => msg,
            None => {
                self.closed = true;
                return Ok(0);
            }
        };

        let len = msg.data.len();
        if len > buf.len() {
            return Err(ProtocolError::BufferTooSmall {
                payload: len,
                buffer: buf.len(),
            }
            .into());
        }
        buf[..len].copy_from_slice(&msg.data);
        Ok(len)
    }

    /// ストリームの終了を受け取ったか
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// バイト列をトンネルメッセージとして送る
pub struct TunnelWriter {
    sink: Box<dyn MessageSink>,
    id: String,
    guest_addr: String,
}

impl TunnelWriter {
    /// `buf` を1つのメッセージとして送信する。空なら何も送らない
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let msg = TunnelMessage::stream(
            self.id.as_str(),
            self.guest_addr.as_str(),
            Bytes::copy_from_slice(buf),
        );
        self.sink.send(msg).await?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelError;
    use crate::protocol::Protocol;
    use crate::transport::memory;

    #[tokio::test]
    async fn test_write_sends_one_message() {
        let (stream, (_remote_sink, mut remote_source)) = memory::pair(4);
        let (_reader, mut writer) = byte_adapter(stream, "tcp-a-b", "10.0.0.1:22");

        assert_eq!(writer.write(b"SSH-2.0").await.unwrap(), 7);

        let msg = remote_source.recv().await.unwrap().unwrap();
        assert_eq!(msg.id, "tcp-a-b");
        assert_eq!(msg.protocol, Protocol::Stream);
        assert_eq!(msg.guest_addr, "10.0.0.1:22");
        assert_eq!(&msg.data[..], b"SSH-2.0");
        assert_eq!(msg.udp_target_addr, None);
    }

    #[tokio::test]
    async fn test_empty_write_sends_nothing() {
        let (stream, (_remote_sink, mut remote_source)) = memory::pair(4);
        let (_reader, mut writer) = byte_adapter(stream, "id", "addr");

        assert_eq!(writer.write(b"").await.unwrap(), 0);
        writer.write(b"x").await.unwrap();

        // 最初に届くのは "x"
        let msg = remote_source.recv().await.unwrap().unwrap();
        assert_eq!(&msg.data[..], b"x");
    }

    #[tokio::test]
    async fn test_read_payload() {
        let (stream, (mut remote_sink, _remote_source)) = memory::pair(4);
        let (mut reader, _writer) = byte_adapter(stream, "id", "addr");

        remote_sink
            .send(TunnelMessage::stream("id", "addr", Bytes::from_static(b"hello")))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_empty_message_is_not_end() {
        let (stream, (mut remote_sink, _remote_source)) = memory::pair(4);
        let (mut reader, _writer) = byte_adapter(stream, "id", "addr");

        remote_sink
            .send(TunnelMessage::stream("id", "addr", Bytes::new()))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert!(!reader.is_closed());
    }

    #[tokio::test]
    async fn test_end_of_stream_is_clean_and_repeatable() {
        let (stream, (remote_sink, _remote_source)) = memory::pair(4);
        let (mut reader, _writer) = byte_adapter(stream, "id", "addr");
        drop(remote_sink);

        let mut buf = [0u8; 16];
        for _ in 0..3 {
            assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
            assert!(reader.is_closed());
        }
    }

    #[tokio::test]
    async fn test_buffer_too_small() {
        let (stream, (mut remote_sink, _remote_source)) = memory::pair(4);
        let (mut reader, _writer) = byte_adapter(stream, "id", "addr");

        remote_sink
            .send(TunnelMessage::stream("id", "addr", Bytes::from_static(b"too long")))
            .await
            .unwrap();

        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Protocol(ProtocolError::BufferTooSmall {
                payload: 8,
                buffer: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_write_after_remote_gone_fails() {
        let (stream, remote) = memory::pair(4);
        let (_reader, mut writer) = byte_adapter(stream, "id", "addr");
        drop(remote);

        let err = writer.write(b"data").await.unwrap_err();
        assert!(matches!(err, TunnelError::Transport(_)));
    }
}
