//! 请求类型以及从字节缓冲区解析请求帧的工具。
//!
//! 请求帧是一个由批量字符串组成的数组：
//!
//! ```text
//! *<n>\r\n
//! $<len>\r\n<payload>\r\n    (重复 n 次)
//! ```
//!
//! 第一个参数是命令名称。

use crate::Logger;

use bytes::Bytes;
use std::fmt;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;

/// 一个已解析的命令。
pub struct Request {
    /// 大写形式的命令名称。
    cmd: String,
    /// 按接收顺序排列的参数，不含命令名称。
    args: Vec<Bytes>,
    /// 请求被完整读取的时刻。
    received_at: Instant,
    /// 所属连接的对端地址。
    remote_addr: SocketAddr,
    /// 每个请求一个日志实例，由日志工厂在解析后创建。
    logger: Option<Arc<dyn Logger>>,
}

/// 解析时遇到的错误。
#[derive(Debug)]
pub(crate) enum ParseError {
    /// 没有足够的数据来解析整个请求
    Incomplete,
    /// 请求编码无效
    Invalid(String),
}

impl Request {
    /// 直接构造一个请求，主要用于在测试中调用处理程序。
    pub fn new(cmd: impl AsRef<str>, args: Vec<Bytes>, remote_addr: SocketAddr) -> Self {
        Self {
            cmd: cmd.as_ref().to_ascii_uppercase(),
            args,
            received_at: Instant::now(),
            remote_addr,
            logger: None,
        }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// 绑定到此请求的日志实例。如果服务器没有配置日志工厂，则返回 `None`。
    pub fn logger(&self) -> Option<&Arc<dyn Logger>> {
        self.logger.as_ref()
    }

    pub(crate) fn set_logger(&mut self, logger: Arc<dyn Logger>) {
        self.logger = Some(logger);
    }

    /// 检查 `src` 中是否缓冲了一个完整的请求帧。
    ///
    /// 成功时光标停在帧的末尾。除了数据不足之外，格式错误会立即报告，
    /// 不必等待剩余的字节。
    pub(crate) fn check(src: &mut Cursor<&[u8]>) -> Result<(), ParseError> {
        let argc = get_header(src, b'*')?;
        if argc == 0 {
            return Err("empty command".into());
        }

        (0..argc).try_for_each(|_| get_argument(src).map(drop))
    }

    /// 解析一个已经通过 `check` 验证的请求帧。
    pub(crate) fn parse(src: &mut Cursor<&[u8]>, remote_addr: SocketAddr) -> Result<Self, ParseError> {
        let argc = get_header(src, b'*')?;
        if argc == 0 {
            return Err("empty command".into());
        }

        let name = get_argument(src)?;
        let cmd = std::str::from_utf8(name)
            .map_err(|_| ParseError::from("invalid command name"))?
            .to_ascii_uppercase();

        // 必须按顺序读取，参数的顺序就是接收的顺序
        let args = (1..argc)
            .map(|_| get_argument(src).map(Bytes::copy_from_slice))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            cmd,
            args,
            received_at: Instant::now(),
            remote_addr,
            logger: None,
        })
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("cmd", &self.cmd)
            .field("args", &self.args)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl From<String> for ParseError {
    fn from(src: String) -> Self {
        Self::Invalid(src)
    }
}

impl From<&str> for ParseError {
    fn from(src: &str) -> Self {
        src.to_string().into()
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Incomplete => "stream ended early".fmt(fmt),
            Self::Invalid(msg) => msg.fmt(fmt),
        }
    }
}

impl From<ParseError> for crate::Error {
    fn from(src: ParseError) -> Self {
        crate::Error::Protocol(src.to_string())
    }
}

/// 头部行最长的字节数：前缀加上 `u64` 最多 20 位数字
const MAX_HEADER_LEN: usize = 21;

/// 单个参数允许声明的最大长度
const MAX_ARGUMENT_LEN: u64 = 512 * 1024 * 1024;

/// 读取 `<prefix><decimal>\r\n` 形式的头部行
fn get_header(src: &mut Cursor<&[u8]>, prefix: u8) -> Result<u64, ParseError> {
    use atoi::atoi;

    let start = src.position() as usize;
    let buf: &[u8] = *src.get_ref();

    // 前缀不对时不必等待这一行结束
    if let Some(&first) = buf.get(start) {
        if first != prefix {
            return Err(format!("expected `{}`, got `{}`", prefix as char, first.escape_ascii()).into());
        }
    }

    let line = match get_line(src) {
        Err(ParseError::Incomplete) if buf.len() - start >= MAX_HEADER_LEN + 2 => {
            return Err("header line too long".into());
        }
        res => res?,
    };

    // `atoi` 会忽略尾部的非数字字节，所以先确认整行都是数字
    let digits = &line[1..];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(format!("invalid length `{}`", String::from_utf8_lossy(digits)).into());
    }
    atoi::<u64>(digits).ok_or_else(|| "length out of range".into())
}

/// 读取一个 `$<len>\r\n<payload>\r\n` 参数，返回负载
///
/// 负载按声明的长度读取：CRLF 出现在 `len` 之前，或者 `len` 字节之后不是 CRLF，
/// 都是格式错误。只有不足 `len + 2` 字节时才返回 `Incomplete`。
fn get_argument<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ParseError> {
    let len = get_header(src, b'$')?;
    if len > MAX_ARGUMENT_LEN {
        return Err(format!("argument length {} exceeds {}", len, MAX_ARGUMENT_LEN).into());
    }
    let len = len as usize;

    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();
    let rest = &buf[start..];

    if let Some(i) = rest.windows(2).take(len).position(|w| w == b"\r\n") {
        return Err(format!("declared length {} does not match payload length {}", len, i).into());
    }
    if rest.len() < len + 2 {
        return Err(ParseError::Incomplete);
    }
    if &rest[len..len + 2] != b"\r\n" {
        return Err(format!("payload is longer than declared length {}", len).into());
    }

    src.set_position((start + len + 2) as u64);
    Ok(&rest[..len])
}

/// 查找一行，不含结尾的 `\r\n`
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ParseError> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    if buf.len() < 2 || start > buf.len() - 2 {
        return Err(ParseError::Incomplete);
    }

    (start..buf.len() - 1)
        .find(|&i| buf[i] == b'\r' && buf[i + 1] == b'\n')
        .map(|i| {
            src.set_position((i + 2) as u64);
            &buf[start..i]
        })
        .ok_or(ParseError::Incomplete)
}

/// 已经消费的字节数。
pub(crate) fn consumed(src: &Cursor<&[u8]>) -> usize {
    src.position() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn parse(input: &[u8]) -> Result<Request, ParseError> {
        let mut cursor = Cursor::new(input);
        Request::check(&mut cursor)?;
        let len = consumed(&cursor);
        assert_eq!(len, input.len());
        cursor.set_position(0);
        Request::parse(&mut cursor, addr())
    }

    #[test]
    fn parses_command_and_arguments_in_order() {
        let req = parse(b"*3\r\n$3\r\nset\r\n$3\r\nkey\r\n$5\r\nvalue\r\n").unwrap();
        assert_eq!(req.cmd(), "SET");
        assert_eq!(req.args(), &[Bytes::from("key"), Bytes::from("value")]);
        assert_eq!(req.remote_addr(), addr());
        assert!(req.logger().is_none());
    }

    #[test]
    fn arguments_keep_their_case() {
        let req = parse(b"*2\r\n$3\r\nGeT\r\n$5\r\nHeLLo\r\n").unwrap();
        assert_eq!(req.cmd(), "GET");
        assert_eq!(req.args(), &[Bytes::from("HeLLo")]);
    }

    #[test]
    fn single_command_has_no_arguments() {
        let req = parse(b"*1\r\n$4\r\nping\r\n").unwrap();
        assert_eq!(req.cmd(), "PING");
        assert!(req.args().is_empty());
    }

    #[test]
    fn empty_argument_is_allowed() {
        let req = parse(b"*2\r\n$4\r\necho\r\n$0\r\n\r\n").unwrap();
        assert_eq!(req.args(), &[Bytes::new()]);
    }

    #[test]
    fn partial_frames_are_incomplete() {
        let full = b"*2\r\n$4\r\necho\r\n$5\r\nhello\r\n";
        for end in 0..full.len() {
            let mut cursor = Cursor::new(&full[..end]);
            assert!(
                matches!(Request::check(&mut cursor), Err(ParseError::Incomplete)),
                "prefix of {} bytes should be incomplete",
                end
            );
        }
    }

    #[test]
    fn check_stops_at_frame_boundary() {
        let input = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n";
        let mut cursor = Cursor::new(&input[..]);
        Request::check(&mut cursor).unwrap();
        assert_eq!(consumed(&cursor), input.len() / 2);
    }

    #[test]
    fn header_must_start_with_star() {
        assert!(matches!(parse(b"+PING\r\n"), Err(ParseError::Invalid(_))));
        assert!(matches!(parse(b"PING\r\n"), Err(ParseError::Invalid(_))));
        assert!(matches!(parse(b"\r\n"), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn argument_count_must_be_a_non_negative_integer() {
        assert!(matches!(parse(b"*x\r\n"), Err(ParseError::Invalid(_))));
        assert!(matches!(parse(b"*-1\r\n"), Err(ParseError::Invalid(_))));
        assert!(matches!(parse(b"*\r\n"), Err(ParseError::Invalid(_))));
        assert!(matches!(parse(b"*0\r\n"), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn argument_must_start_with_dollar() {
        assert!(matches!(parse(b"*1\r\n+PING\r\n"), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn declared_length_must_match_payload() {
        assert!(matches!(parse(b"*1\r\n$3\r\nPING\r\n"), Err(ParseError::Invalid(_))));
        assert!(matches!(parse(b"*1\r\n$5\r\nPING\r\n"), Err(ParseError::Invalid(_))));
        // 负载中的 CRLF 会截断这一行
        assert!(matches!(parse(b"*1\r\n$4\r\nP\r\nG\r\n"), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn overlong_payload_fails_without_waiting_for_crlf() {
        let mut input = b"*1\r\n$3\r\n".to_vec();
        input.extend_from_slice(&[b'A'; 4096]);
        let mut cursor = Cursor::new(&input[..]);
        assert!(matches!(Request::check(&mut cursor), Err(ParseError::Invalid(_))));

        // 刚好多出一个字节也足以判定
        let mut cursor = Cursor::new(&b"*1\r\n$3\r\nAAAA\r"[..]);
        assert!(matches!(Request::check(&mut cursor), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn short_payload_waits_for_declared_length() {
        let mut cursor = Cursor::new(&b"*1\r\n$3\r\nAB"[..]);
        assert!(matches!(Request::check(&mut cursor), Err(ParseError::Incomplete)));
        let mut cursor = Cursor::new(&b"*1\r\n$3\r\nABC\r"[..]);
        assert!(matches!(Request::check(&mut cursor), Err(ParseError::Incomplete)));
    }

    #[test]
    fn oversized_headers_are_rejected() {
        let mut input = b"*1\r\n$".to_vec();
        input.extend_from_slice(&[b'9'; 64]);
        let mut cursor = Cursor::new(&input[..]);
        assert!(matches!(Request::check(&mut cursor), Err(ParseError::Invalid(_))));

        assert!(matches!(parse(b"*1\r\n$536870913\r\n"), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn non_utf8_command_name_is_rejected() {
        assert!(matches!(parse(b"*1\r\n$2\r\n\xff\xfe\r\n"), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn binary_arguments_are_preserved() {
        let req = parse(b"*2\r\n$3\r\nSET\r\n$3\r\n\x00\xff\x01\r\n").unwrap();
        assert_eq!(&req.args()[0][..], &[0x00, 0xff, 0x01]);
    }

    #[test]
    fn parse_error_converts_to_protocol_error() {
        let err: crate::Error = ParseError::from("bad").into();
        assert!(err.is_protocol());
    }
}
