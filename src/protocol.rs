use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result, TunnelError};

/// 1フレームの最大サイズ（DoS対策）
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// メッセージが運ぶ通信の種類
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// TCP相当のバイトストリーム
    Stream,
    /// UDPデータグラム
    Datagram,
}

/// トンネルストリーム上でやり取りされるメッセージ
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TunnelMessage {
    /// 論理コネクションの識別子
    pub id: String,
    pub protocol: Protocol,
    /// リモート側の宛先アドレス
    pub guest_addr: String,
    pub data: Bytes,
    /// データグラムの送信元（返信先）ピアアドレス。Datagramのみ
    pub udp_target_addr: Option<String>,
}

impl TunnelMessage {
    pub fn stream(id: impl Into<String>, guest_addr: impl Into<String>, data: Bytes) -> Self {
        Self {
            id: id.into(),
            protocol: Protocol::Stream,
            guest_addr: guest_addr.into(),
            data,
            udp_target_addr: None,
        }
    }

    pub fn datagram(
        id: impl Into<String>,
        guest_addr: impl Into<String>,
        peer: impl Into<String>,
        data: Bytes,
    ) -> Self {
        Self {
            id: id.into(),
            protocol: Protocol::Datagram,
            guest_addr: guest_addr.into(),
            data,
            udp_target_addr: Some(peer.into()),
        }
    }

    /// メッセージを送信
    /// フォーマット: [length: u32 little-endian][bincode data]
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let data =
            bincode::serialize(self).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if data.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::MessageTooLarge(data.len()).into());
        }

        writer
            .write_u32_le(data.len() as u32)
            .await
            .map_err(TunnelError::Transport)?;
        writer
            .write_all(&data)
            .await
            .map_err(TunnelError::Transport)?;
        writer.flush().await.map_err(TunnelError::Transport)?;

        Ok(())
    }

    /// メッセージを受信
    ///
    /// フレーム境界でのEOFはストリーム終了として `Ok(None)` を返す。
    /// フレームの途中でのEOFはトランスポートエラー。
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let mut len_buf = [0u8; 4];
        let n = reader
            .read(&mut len_buf)
            .await
            .map_err(TunnelError::Transport)?;
        if n == 0 {
            return Ok(None);
        }
        reader
            .read_exact(&mut len_buf[n..])
            .await
            .map_err(TunnelError::Transport)?;

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::MessageTooLarge(len).into());
        }

        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(TunnelError::Transport)?;

        let msg =
            bincode::deserialize(&buf).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(Some(msg))
    }
}
