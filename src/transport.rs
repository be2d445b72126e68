use crate::request::{self, ParseError};
use crate::{Error, Request, Result};

use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

/// 从远程对等方读取请求并写回回复的字节通道。
///
/// 读取时，`Transport` 使用内部缓冲区，直到有足够的字节来解析完整的请求帧。
/// 写入时，字节先进入 `BufWriter`，每个回复结束时刷新到套接字。
///
/// 处理程序接管 (hijack) 之后套接字被移走，之后的读写都返回 `Error::Hijacked`。
#[derive(Debug)]
pub(crate) struct Transport {
    stream: Option<BufWriter<TcpStream>>,
    // 用于读取请求的缓冲区，来自服务器的缓冲区池。
    buffer: BytesMut,
    // 第一次写入失败的错误。一旦设置，之后的写入直接失败而不再触碰套接字。
    werr: Option<(io::ErrorKind, String)>,
}

impl Transport {
    pub(crate) fn new(socket: TcpStream, buffer: BytesMut) -> Self {
        Self {
            stream: Some(BufWriter::new(socket)),
            buffer,
            werr: None,
        }
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.stream.is_none()
    }

    /// 从底层流中读取单个请求。
    ///
    /// # 返回值
    ///
    /// 成功时返回请求。如果对端在请求边界处关闭了连接，返回 `None`。
    /// 格式错误返回 `Error::Protocol`，读取失败或者请求中途断开返回 `Error::Io`。
    pub(crate) async fn read_request(&mut self, remote_addr: SocketAddr) -> Result<Option<Request>> {
        loop {
            if let Some(req) = self.parse_request(remote_addr)? {
                return Ok(Some(req));
            }

            let stream = self.stream.as_mut().ok_or(Error::Hijacked)?;
            // `0` 表示“流结束”
            if 0 != stream.read_buf(&mut self.buffer).await? {
                continue;
            }

            if self.buffer.is_empty() {
                return Ok(None);
            } else {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection reset by peer").into());
            }
        }
    }

    /// 尝试从缓冲区解析一个请求。数据不足时返回 `Ok(None)`。
    fn parse_request(&mut self, remote_addr: SocketAddr) -> Result<Option<Request>> {
        let mut buf = Cursor::new(&self.buffer[..]);

        match Request::check(&mut buf) {
            Ok(()) => {
                let len = request::consumed(&buf);
                buf.set_position(0);
                let req = Request::parse(&mut buf, remote_addr)?;
                self.buffer.advance(len);

                Ok(Some(req))
            }
            Err(ParseError::Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 把 `src` 全部写入套接字并刷新。
    ///
    /// 短写会被重试，直到所有字节写完或者遇到不可恢复的错误。
    pub(crate) async fn write_bytes(&mut self, src: &[u8]) -> Result<usize> {
        if let Some((kind, msg)) = &self.werr {
            return Err(io::Error::new(*kind, msg.clone()).into());
        }
        let stream = self.stream.as_mut().ok_or(Error::Hijacked)?;

        match write_fully(stream, src).await {
            Ok(n) => Ok(n),
            Err(err) => {
                self.werr = Some((err.kind(), err.to_string()));
                Err(err.into())
            }
        }
    }

    /// 交出套接字和尚未消费的缓冲数据。
    pub(crate) fn detach(&mut self) -> Option<(TcpStream, BytesMut)> {
        let stream = self.stream.take()?;
        let buffered = self.buffer.split();
        Some((stream.into_inner(), buffered))
    }

    /// 关闭写方向并释放套接字，返回读缓冲区以便放回池中。
    pub(crate) async fn close(&mut self) -> BytesMut {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        std::mem::take(&mut self.buffer)
    }
}

async fn write_fully(stream: &mut BufWriter<TcpStream>, src: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < src.len() {
        match stream.write(&src[written..]).await {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    stream.flush().await?;

    Ok(written)
}
