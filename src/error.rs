use std::io;

use thiserror::Error;

/// トンネル処理のエラー
///
/// 終端（ソケットのクローズやストリームの終了）はエラーではない。
/// `Ok(0)` / `Ok(None)` として表現される。
#[derive(Debug, Error)]
pub enum TunnelError {
    /// トンネルストリームを確立できなかった
    #[error("failed to open tunnel stream: {0}")]
    StreamOpen(#[source] io::Error),

    /// 確立済みストリームでの送受信に失敗
    #[error("tunnel transport error: {0}")]
    Transport(#[source] io::Error),

    /// メッセージの形式が不正
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// ローカルソケットの読み書きに失敗
    #[error("local socket error: {0}")]
    Local(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("read buffer too small: payload is {payload} bytes, buffer holds {buffer}")]
    BufferTooSmall { payload: usize, buffer: usize },

    #[error("datagram message {id} has no peer address")]
    MissingPeerAddr { id: String },

    #[error("cannot resolve datagram peer address {addr:?}: {source}")]
    InvalidPeerAddr {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl TunnelError {
    /// 送信側が既に閉じていることを示すトランスポートエラー
    pub(crate) fn closed() -> Self {
        TunnelError::Transport(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "tunnel stream closed",
        ))
    }
}

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;
