//! 每个连接的状态机与服务循环。

use crate::response::{encode_error, ResponseWriter};
use crate::server::Shared;
use crate::transport::Transport;
use crate::{Context, Result, Shutdown};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

/// 连接的生命周期状态。
///
/// 状态沿着 `New -> Active <-> Idle -> Closed` 或者 `New/Active -> Hijacked` 单调推进。
/// `Closed` 和 `Hijacked` 是终止状态，被接管的连接不会再进入 `Closed`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnState {
    /// 刚被接受，还没有读取任何请求。
    New = 0,
    /// 已经读取了一个请求，正在处理。
    Active = 1,
    /// 处理完一个请求，等待下一个。
    Idle = 2,
    /// 处理程序接管了底层传输。
    Hijacked = 3,
    /// 连接已关闭。
    Closed = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Active,
            2 => Self::Idle,
            3 => Self::Hijacked,
            _ => Self::Closed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Hijacked | Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Hijacked => "hijacked",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

/// 可以在不加锁的情况下读取的连接状态。
///
/// 状态和最后一次转换的 unix 时间（秒）被打包进同一个原子整数：`(secs << 8) | state`。
#[derive(Debug)]
pub(crate) struct ConnStatus {
    id: u64,
    remote_addr: SocketAddr,
    packed: AtomicU64,
}

/// 某一时刻的连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnSnapshot {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub state: ConnState,
    /// 进入当前状态的 unix 时间（秒）。
    pub since: u64,
}

impl ConnSnapshot {
    /// 处于当前状态的时长。
    pub fn age(&self) -> Duration {
        Duration::from_secs(unix_now().saturating_sub(self.since))
    }
}

impl ConnStatus {
    pub(crate) fn new(id: u64, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            remote_addr,
            packed: AtomicU64::new(pack(ConnState::New, unix_now())),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// 记录一次状态转换。当前已经是终止状态时忽略，返回 `false`。
    pub(crate) fn store(&self, state: ConnState) -> bool {
        let next = pack(state, unix_now());
        self.packed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let (cur, _) = unpack(cur);
                (!cur.is_terminal()).then_some(next)
            })
            .is_ok()
    }

    pub(crate) fn load(&self) -> (ConnState, u64) {
        unpack(self.packed.load(Ordering::Acquire))
    }

    pub(crate) fn snapshot(&self) -> ConnSnapshot {
        let (state, since) = self.load();
        ConnSnapshot {
            id: self.id,
            remote_addr: self.remote_addr,
            state,
            since,
        }
    }
}

fn pack(state: ConnState, secs: u64) -> u64 {
    (secs << 8) | state as u64
}

fn unpack(packed: u64) -> (ConnState, u64) {
    (ConnState::from_u8((packed & 0xff) as u8), packed >> 8)
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 一个被接受的连接。
///
/// 从传输读取请求，通过服务器的根处理程序分发，直到对端断开、协议出错、
/// 处理程序接管传输**或**收到关闭通知。
#[derive(Debug)]
pub(crate) struct Connection {
    shared: Arc<Shared>,
    status: Arc<ConnStatus>,
    ctx: Context,
    /// 服务器根信号的子信号，连接拆除时也会触发。
    shutdown: Shutdown,
    writer: ResponseWriter,
}

impl Connection {
    pub(crate) fn new(shared: Arc<Shared>, socket: TcpStream, status: Arc<ConnStatus>, local_addr: SocketAddr) -> Self {
        let shutdown = shared.done().child();
        let ctx = Context::new(status.id(), local_addr, status.remote_addr(), shutdown.clone());
        let writer = ResponseWriter::new(Transport::new(socket, shared.pool().get()));

        Self {
            shared,
            status,
            ctx,
            shutdown,
            writer,
        }
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.status.remote_addr()
    }

    pub(crate) fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub(crate) fn set_state(&self, state: ConnState) -> bool {
        self.shared.set_conn_state(&self.status, state)
    }

    /// 处理连接上的请求。
    ///
    /// 没有实现流水线：一个请求的所有回复写完之后才会读取下一个请求。
    ///
    /// 协议错误会先回复给对端，然后作为 `Err` 返回。
    #[instrument(skip(self), fields(id = self.status.id(), remote = %self.status.remote_addr()))]
    pub(crate) async fn serve(&mut self) -> Result<()> {
        let remote_addr = self.remote_addr();

        while !self.shutdown.is_shutdown() {
            // 在读取请求时，也监听关闭信号。
            let res = tokio::select! {
                res = self.writer.transport_mut().read_request(remote_addr) => res,
                _ = self.shutdown.recv() => return Ok(()),
            };

            let mut req = match res {
                Ok(Some(req)) => req,
                // 对端关闭了套接字
                Ok(None) => return Ok(()),
                Err(err) => {
                    if err.is_protocol() {
                        debug!(cause = %err, "协议错误");
                        let _ = self.writer.transport_mut().write_bytes(&encode_error(&format!("ERR {}", err))).await;
                    }
                    return Err(err);
                }
            };

            if let Some(factory) = self.shared.logger_factory() {
                req.set_logger(factory());
            }
            debug!(?req);

            self.set_state(ConnState::Active);
            self.writer.begin(&req);
            self.shared.handler().serve(&self.ctx, &mut self.writer, &req).await;
            self.writer.end();

            if self.writer.is_hijacked() {
                return Ok(());
            }
            self.set_state(ConnState::Idle);
        }

        Ok(())
    }

    /// 写一行错误回复，忽略失败。用于拒绝连接和内部错误。
    pub(crate) async fn reply_error(&mut self, msg: &str) {
        if self.writer.is_hijacked() {
            return;
        }
        let _ = self.writer.transport_mut().write_bytes(&encode_error(msg)).await;
    }

    /// 拆除连接。
    ///
    /// 被接管的连接只记录 `Hijacked` 状态，不触碰套接字；其他连接关闭套接字，
    /// 归还读缓冲区并进入 `Closed`。
    pub(crate) async fn close(mut self) {
        self.shutdown.trigger();

        if self.writer.is_hijacked() {
            self.set_state(ConnState::Hijacked);
            return;
        }

        let buffer = self.writer.transport_mut().close().await;
        self.shared.pool().put(buffer);
        self.set_state(ConnState::Closed);
    }
}
