use std::io;
use thiserror::Error as ThisError;

/// 框架中大多数函数返回的错误。
///
/// 变体对应不同的处理方式：配置错误在开始服务之前就应暴露出来；
/// 协议错误和传输错误只会终止当前连接，不会影响其他连接；
/// `ServerClosed` 表示接受循环因为关闭信号而退出，而不是因为底层错误。
#[derive(Debug, ThisError)]
pub enum Error {
    /// 非法的注册或构造参数，例如容量为 0 的信号量。
    #[error("invalid configuration: {0}")]
    Config(String),

    /// 请求帧不符合协议格式。连接会被关闭，不会尝试重新同步。
    #[error("protocol error; {0}")]
    Protocol(String),

    /// 读写底层传输失败，包括对端断开。
    #[error(transparent)]
    Io(#[from] io::Error),

    /// 服务器已经开始关闭。
    #[error("server closed")]
    ServerClosed,

    /// 传输已被处理程序接管，框架不能再写入。
    #[error("connection has been hijacked")]
    Hijacked,
}

impl Error {
    /// 如果是协议格式错误，返回 `true`。只有这类错误会在关闭前回复给对端。
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

/// 本 crate 操作的专用 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;
