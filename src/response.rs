//! 回复的序列化。
//!
//! 四种回复形式，每次调用都会立即刷新到套接字：
//!
//! | 方法     | 编码                                   |
//! |----------|----------------------------------------|
//! | `text`   | `+<msg>\r\n`                           |
//! | `error`  | `-<msg>\r\n`                           |
//! | `binary` | `$<len>\r\n<payload>\r\n`，空负载为 `$-1\r\n` |
//! | `write`  | 原样写出                               |

use crate::transport::Transport;
use crate::{Error, Logger, Request, Result};

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// 空批量字符串和“不存在”使用同一种编码。
///
/// 需要区分两者的调用方应该用 `write` 自行编码 `$0\r\n\r\n`。
const NULL_BULK: &[u8] = b"$-1\r\n";

/// 处理程序写回复的接口。
///
/// 所有方法都返回写入的字节数。返回错误时，回复不保证已经送达对端。
/// 连接上第一次写入失败之后，后续写入都会直接失败。
#[derive(Debug)]
pub struct ResponseWriter {
    transport: Transport,
    /// 当前请求的访问记录信息。
    entry: Option<Entry>,
}

/// 被处理程序接管的传输。
#[derive(Debug)]
pub struct Hijacked {
    pub stream: TcpStream,
    /// 已经从套接字读入、但还没有被解析的字节。
    pub buffered: BytesMut,
}

struct Entry {
    cmd: String,
    args: Vec<Bytes>,
    remote_addr: SocketAddr,
    received_at: Instant,
    logger: Option<Arc<dyn Logger>>,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("cmd", &self.cmd)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl ResponseWriter {
    pub(crate) fn new(transport: Transport) -> Self {
        Self { transport, entry: None }
    }

    pub(crate) fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// 开始为 `req` 写回复，之后的每个回复都会带上它的访问记录。
    pub(crate) fn begin(&mut self, req: &Request) {
        self.entry = Some(Entry {
            cmd: req.cmd().to_string(),
            args: req.args().to_vec(),
            remote_addr: req.remote_addr(),
            received_at: req.received_at(),
            logger: req.logger().cloned(),
        });
    }

    pub(crate) fn end(&mut self) {
        self.entry = None;
    }

    /// 写一个简单字符串回复 `+<msg>\r\n`。
    pub fn text(&mut self, msg: impl fmt::Display) -> impl Future<Output = Result<usize>> + Send + '_ {
        let content = msg.to_string();
        async move {
            let res = self.transport.write_bytes(&encode_text(&content)).await;
            self.record("text", &content);
            res
        }
    }

    /// 写一个错误回复 `-<msg>\r\n`。
    pub fn error(&mut self, msg: impl fmt::Display) -> impl Future<Output = Result<usize>> + Send + '_ {
        let content = msg.to_string();
        async move {
            let res = self.transport.write_bytes(&encode_error(&content)).await;
            self.record("err", &content);
            res
        }
    }

    /// 写一个批量字符串回复。空负载被编码为空批量字符串 `$-1\r\n`。
    pub async fn binary(&mut self, payload: &[u8]) -> Result<usize> {
        let res = self.transport.write_bytes(&encode_bulk(payload)).await;
        if payload.is_empty() {
            self.record("null bulkstr", "null bulk string");
        } else {
            self.record("bulkstr", &String::from_utf8_lossy(payload));
        }
        res
    }

    /// 原样写出 `bytes`，用于框架没有提供的回复类型，例如数组或整数。
    pub async fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let res = self.transport.write_bytes(bytes).await;
        self.record("raw", &format!("{} bytes", bytes.len()));
        res
    }

    /// 接管底层传输。
    ///
    /// 之后框架不会再读写或者关闭这个套接字，连接进入 `Hijacked` 状态，
    /// 在此 `ResponseWriter` 上的写入都会返回 `Error::Hijacked`。
    pub fn hijack(&mut self) -> Result<Hijacked> {
        let (stream, buffered) = self.transport.detach().ok_or(Error::Hijacked)?;
        Ok(Hijacked { stream, buffered })
    }

    pub fn is_hijacked(&self) -> bool {
        self.transport.is_detached()
    }

    fn record(&self, kind: &str, reply: &str) {
        let Some(entry) = &self.entry else {
            return;
        };
        let cost = entry.received_at.elapsed();

        debug!(
            cmd = %entry.cmd,
            args = ?entry.args,
            addr = %entry.remote_addr,
            ?cost,
            kind,
            reply,
            "reply"
        );

        if let Some(logger) = &entry.logger {
            logger.notice(format_args!(
                "redis cmd:{}, arg:{:?}, addr:{}, cost:{:?}, type:{}, reply:{}",
                entry.cmd, entry.args, entry.remote_addr, cost, kind, reply
            ));
        }
    }
}

/// 编码一个简单字符串。
pub fn encode_text(msg: &str) -> Vec<u8> {
    encode_line(b'+', msg)
}

/// 编码一个错误。
pub fn encode_error(msg: &str) -> Vec<u8> {
    encode_line(b'-', msg)
}

/// 编码一个批量字符串，空负载编码为 `$-1\r\n`。
pub fn encode_bulk(payload: &[u8]) -> Vec<u8> {
    if payload.is_empty() {
        return NULL_BULK.to_vec();
    }

    let len = payload.len().to_string();
    let mut bytes = Vec::with_capacity(1 + len.len() + 2 + payload.len() + 2);
    bytes.push(b'$');
    bytes.extend_from_slice(len.as_bytes());
    bytes.extend_from_slice(b"\r\n");
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(b"\r\n");
    bytes
}

fn encode_line(prefix: u8, msg: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + msg.len() + 2);
    bytes.push(prefix);
    bytes.extend_from_slice(msg.as_bytes());
    bytes.extend_from_slice(b"\r\n");
    bytes
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{Context, Shutdown};
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// 创建一个连接到本地套接字的 `ResponseWriter`，返回对端以便读取回复。
    pub(crate) async fn pair(cmd: &str) -> (Context, ResponseWriter, Request, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(local_addr).await.unwrap();
        let (socket, remote_addr) = listener.accept().await.unwrap();

        let ctx = Context::new(1, local_addr, remote_addr, Shutdown::default());
        let writer = ResponseWriter::new(Transport::new(socket, BytesMut::new()));
        let req = Request::new(cmd, vec![], remote_addr);

        (ctx, writer, req, client)
    }

    /// 与 `pair` 相同，但丢弃对端。
    pub(crate) async fn detached(cmd: &str) -> (Context, ResponseWriter, Request) {
        let (ctx, writer, req, _client) = pair(cmd).await;
        (ctx, writer, req)
    }

    async fn read_exact(client: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0; n];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
    }

    impl Logger for Recorder {
        fn debug(&self, _: fmt::Arguments<'_>) {}
        fn info(&self, _: fmt::Arguments<'_>) {}
        fn notice(&self, args: fmt::Arguments<'_>) {
            self.lines.lock().unwrap().push(args.to_string());
        }
        fn warn(&self, _: fmt::Arguments<'_>) {}
        fn error(&self, _: fmt::Arguments<'_>) {}
        fn add_meta(&self, _: &str, _: &str) {}
    }

    #[test]
    fn encodes_simple_and_error_lines() {
        assert_eq!(encode_text("OK"), b"+OK\r\n");
        assert_eq!(encode_error("ERR nope"), b"-ERR nope\r\n");
    }

    #[test]
    fn empty_bulk_is_null() {
        assert_eq!(encode_bulk(b""), b"$-1\r\n");
    }

    #[test]
    fn bulk_length_matches_payload() {
        assert_eq!(encode_bulk(b"hello"), b"$5\r\nhello\r\n");
        let payload = vec![b'x'; 1234];
        let encoded = encode_bulk(&payload);
        assert!(encoded.starts_with(b"$1234\r\n"));
        assert_eq!(encoded.len(), "$1234\r\n".len() + 1234 + 2);
    }

    #[tokio::test]
    async fn replies_report_bytes_written() {
        let (_ctx, mut w, _req, mut client) = pair("GET").await;

        assert_eq!(w.text("OK").await.unwrap(), 5);
        assert_eq!(w.error(format_args!("ERR {}", 42)).await.unwrap(), 9);
        assert_eq!(w.binary(b"abc").await.unwrap(), 9);
        assert_eq!(w.binary(b"").await.unwrap(), 5);
        assert_eq!(w.write(b":1\r\n").await.unwrap(), 4);
        assert_eq!(w.write(b"").await.unwrap(), 0);

        let expected = b"+OK\r\n-ERR 42\r\n$3\r\nabc\r\n$-1\r\n:1\r\n";
        assert_eq!(read_exact(&mut client, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn replies_are_recorded_through_the_request_logger() {
        let (_ctx, mut w, mut req, _client) = pair("get").await;
        let recorder = Arc::new(Recorder::default());
        req.set_logger(recorder.clone());

        w.begin(&req);
        w.text("OK").await.unwrap();
        w.binary(b"").await.unwrap();
        w.end();
        w.text("not recorded").await.unwrap();

        let lines = recorder.lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("cmd:GET"));
        assert!(lines[0].contains("type:text"));
        assert!(lines[0].contains("reply:OK"));
        assert!(lines[1].contains("type:null bulkstr"));
    }

    #[tokio::test]
    async fn first_write_error_short_circuits_later_writes() {
        let (_ctx, mut w, _req, client) = pair("GET").await;
        drop(client);

        // 对端关闭后，写入最终会因为连接被重置而失败
        let mut first = None;
        for _ in 0..100 {
            if let Err(err) = w.write(&[b'x'; 64 * 1024]).await {
                first = Some(err);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let first = first.expect("write to a closed peer should fail");

        let second = w.text("OK").await.unwrap_err();
        match (first, second) {
            (Error::Io(a), Error::Io(b)) => assert_eq!(a.kind(), b.kind()),
            other => panic!("unexpected errors: {:?}", other),
        }
    }

    #[tokio::test]
    async fn hijack_hands_over_the_socket() {
        let (_ctx, mut w, _req, mut client) = pair("GET").await;

        let Hijacked { mut stream, buffered } = w.hijack().unwrap();
        assert!(buffered.is_empty());
        assert!(w.is_hijacked());
        assert!(matches!(w.text("OK").await, Err(Error::Hijacked)));
        assert!(matches!(w.hijack(), Err(Error::Hijacked)));

        use tokio::io::AsyncWriteExt;
        stream.write_all(b"raw").await.unwrap();
        assert_eq!(read_exact(&mut client, 3).await, b"raw");
    }
}
