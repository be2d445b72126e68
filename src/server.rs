//! RESP 服务器。
//!
//! `Server` 监听入站连接，为每个连接生成一个任务，把解析出的请求交给根处理程序。
//! 提供 `run` 函数，在给定的 future 完成时优雅地关闭服务器。

use crate::connection::{ConnSnapshot, ConnState, ConnStatus, Connection};
use crate::logger::LoggerFactory;
use crate::pool::BufferPool;
use crate::{BoxHandler, Error, Handler, Result, Semaphore, ServeMux, Shutdown, DEFAULT_ADDR};

use futures::future::{self, FutureExt};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

/// 优雅关闭时检查活动连接的最长间隔。
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 读缓冲区的初始大小。
pub const READ_BUFFER_SIZE: usize = 4 * 1024;

/// 超过准入限制时回复给对端的错误。
const LIMIT_EXCEEDED: &str = "ERR connection limit exceeded";

/// 处理程序 panic 时回复给对端的错误。
const INTERNAL_FAILURE: &str = "ERR internal failure";

/// 接受失败后的首次退避时间。
const MIN_BACKOFF: Duration = Duration::from_millis(5);

/// 接受失败后的最大退避时间。
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// 处理程序 panic 时调用，参数是包含 panic 信息和调用栈的格式化消息。
pub type PanicHook = Arc<dyn Fn(&str) + Send + Sync>;

/// 连接每次状态转换时调用。仅用于观测。
pub type ConnStateHook = Arc<dyn Fn(SocketAddr, ConnState) + Send + Sync>;

/// RESP 服务器句柄。
///
/// 克隆是浅拷贝。一个 `Server` 可以同时在多个监听器上服务。
#[derive(Debug, Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

/// 构建 `Server`。所有配置在 `build` 之后都不可变。
#[must_use]
pub struct Builder {
    addr: Option<String>,
    handler: Option<BoxHandler>,
    semaphore: Semaphore,
    panic_hook: Option<PanicHook>,
    logger_factory: Option<LoggerFactory>,
    conn_state: Option<ConnStateHook>,
}

/// 所有连接共享的服务器状态。
pub(crate) struct Shared {
    addr: String,
    handler: BoxHandler,
    semaphore: Semaphore,
    panic_hook: Option<PanicHook>,
    logger_factory: Option<LoggerFactory>,
    conn_state: Option<ConnStateHook>,
    /// 一旦设置，不再接受新的监听器和连接。
    in_shutdown: AtomicBool,
    /// 服务器的根关闭信号。每个连接持有它的一个子信号。
    done: Shutdown,
    pool: BufferPool,
    next_id: AtomicU64,
    /// 这是一个 `std::sync::Mutex`，持有锁期间没有异步操作，临界区也很小。
    tracked: Mutex<Tracked>,
}

#[derive(Default)]
struct Tracked {
    listeners: HashMap<u64, SocketAddr>,
    conns: HashMap<u64, Arc<ConnStatus>>,
    on_shutdown: Vec<Box<dyn FnOnce() + Send>>,
}

/// 监听器退出服务时从跟踪集合中移除。
struct ListenerGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.shared.tracked.lock().unwrap().listeners.remove(&self.id);
    }
}

impl Builder {
    fn new() -> Self {
        Self {
            addr: None,
            handler: None,
            semaphore: Semaphore::default(),
            panic_hook: None,
            logger_factory: None,
            conn_state: None,
        }
    }

    /// 监听地址，默认为 `DEFAULT_ADDR`。
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// 根处理程序，通常是一个 `ServeMux`。没有设置时使用空的 `ServeMux`，
    /// 所有命令都会得到“不支持的命令”回复。
    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// 准入控制。默认是容量为 `DEFAULT_MAX_CONNECTIONS` 的非阻塞信号量。
    pub fn semaphore(mut self, semaphore: Semaphore) -> Self {
        self.semaphore = semaphore;
        self
    }

    /// 处理程序 panic 时调用。
    pub fn panic_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.panic_hook = Some(Arc::new(hook));
        self
    }

    /// 每个请求调用一次以创建新的日志实例。
    pub fn logger_factory(mut self, factory: LoggerFactory) -> Self {
        self.logger_factory = Some(factory);
        self
    }

    /// 观测连接状态转换。
    pub fn conn_state(mut self, hook: impl Fn(SocketAddr, ConnState) + Send + Sync + 'static) -> Self {
        self.conn_state = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Server {
        let addr = match self.addr {
            Some(addr) if !addr.is_empty() => addr,
            _ => DEFAULT_ADDR.to_string(),
        };
        let handler = self.handler.unwrap_or_else(|| Arc::new(ServeMux::new()));
        install_panic_trace();

        Server {
            shared: Arc::new(Shared {
                addr,
                handler,
                semaphore: self.semaphore,
                panic_hook: self.panic_hook,
                logger_factory: self.logger_factory,
                conn_state: self.conn_state,
                in_shutdown: AtomicBool::new(false),
                done: Shutdown::default(),
                pool: BufferPool::new(READ_BUFFER_SIZE, 256),
                next_id: AtomicU64::new(1),
                tracked: Mutex::new(Tracked::default()),
            }),
        }
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("addr", &self.addr)
            .field("semaphore", &self.semaphore)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// 绑定配置的地址并开始服务。
    ///
    /// 只会在出错时返回。关闭时返回 `Error::ServerClosed`。
    pub async fn listen_and_serve(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(Error::ServerClosed);
        }

        let listener = TcpListener::bind(&self.shared.addr).await?;
        self.serve(listener).await
    }

    /// 接受来自 `listener` 的连接。对于每个入站连接，生成一个任务来处理该连接。
    ///
    /// # 错误
    ///
    /// 只会在出错时返回。服务器关闭时返回 `Error::ServerClosed`；
    /// 不可恢复的接受错误原样返回。
    ///
    /// 瞬态错误（例如进程打开的文件数达到上限）会随着时间的推移而解决，
    /// 这里使用指数退避重试：从 5 毫秒开始，每次失败加倍，最多 1 秒，成功接受后重置。
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let _guard = match self.shared.track_listener(local_addr) {
            Some(id) => ListenerGuard {
                shared: self.shared.clone(),
                id,
            },
            None => return Err(Error::ServerClosed),
        };

        info!(%local_addr, "接受入站连接");

        let mut backoff = Duration::ZERO;
        loop {
            let res = tokio::select! {
                res = listener.accept() => res,
                _ = self.shared.done.recv() => return Err(Error::ServerClosed),
            };

            match res {
                Ok((socket, remote_addr)) => {
                    backoff = Duration::ZERO;
                    self.spawn_connection(socket, remote_addr, local_addr);
                }
                Err(err) => {
                    if self.is_shutting_down() {
                        return Err(Error::ServerClosed);
                    }
                    if !is_transient(&err) {
                        error!(cause = %err, "接受失败");
                        return Err(err.into());
                    }

                    backoff = next_backoff(backoff);
                    warn!(cause = %err, ?backoff, "接受失败，稍后重试");
                    tokio::select! {
                        _ = time::sleep(backoff) => {}
                        _ = self.shared.done.recv() => return Err(Error::ServerClosed),
                    }
                }
            }
        }
    }

    /// 创建连接状态并生成任务。接受循环从不等待连接处理完成。
    fn spawn_connection(&self, socket: TcpStream, remote_addr: SocketAddr, local_addr: SocketAddr) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let status = Arc::new(ConnStatus::new(id, remote_addr));
        let conn = Connection::new(self.shared.clone(), socket, status, local_addr);

        if !conn.set_state(ConnState::New) {
            // 已经开始关闭，丢弃套接字
            return;
        }

        tokio::spawn(serve_connection(self.shared.clone(), conn));
    }

    /// 优雅地关闭服务器。
    ///
    /// 停止所有接受循环，通知所有连接，运行通过 `register_on_shutdown` 注册的回调，
    /// 然后等待所有连接结束。空闲连接会立即关闭；正在处理请求的连接在处理程序返回后关闭。
    ///
    /// 处理程序可能永远不返回，调用者可以用 `tokio::time::timeout` 限制等待时间。
    pub async fn shutdown(&self) {
        self.shared.in_shutdown.store(true, Ordering::SeqCst);
        self.shared.done.trigger();

        let hooks = std::mem::take(&mut self.shared.tracked.lock().unwrap().on_shutdown);
        for hook in hooks {
            hook();
        }

        let mut interval = Duration::from_millis(1);
        loop {
            if self.shared.is_drained() {
                info!("所有连接已关闭");
                return;
            }
            time::sleep(interval).await;
            interval = (interval * 2).min(SHUTDOWN_POLL_INTERVAL);
        }
    }

    /// 注册一个在 `shutdown` 开始时调用的回调。
    pub fn register_on_shutdown(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.tracked.lock().unwrap().on_shutdown.push(Box::new(f));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// 当前正在服务的监听地址。
    pub fn listeners(&self) -> Vec<SocketAddr> {
        self.shared.tracked.lock().unwrap().listeners.values().copied().collect()
    }

    /// 所有未结束连接的状态，按连接编号排序。
    pub fn connections(&self) -> Vec<ConnSnapshot> {
        let mut snapshots: Vec<_> = self
            .shared
            .tracked
            .lock()
            .unwrap()
            .conns
            .values()
            .map(|status| status.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// 在同一状态停留超过 `max_age` 的连接。
    pub fn stale_connections(&self, max_age: Duration) -> Vec<ConnSnapshot> {
        self.connections()
            .into_iter()
            .filter(|s| s.age() > max_age)
            .collect()
    }
}

impl Shared {
    pub(crate) fn done(&self) -> &Shutdown {
        &self.done
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn handler(&self) -> &BoxHandler {
        &self.handler
    }

    pub(crate) fn logger_factory(&self) -> Option<&LoggerFactory> {
        self.logger_factory.as_ref()
    }

    fn is_shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::SeqCst)
    }

    fn is_drained(&self) -> bool {
        let tracked = self.tracked.lock().unwrap();
        tracked.conns.is_empty() && tracked.listeners.is_empty()
    }

    fn track_listener(&self, addr: SocketAddr) -> Option<u64> {
        let mut tracked = self.tracked.lock().unwrap();
        if self.is_shutting_down() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracked.listeners.insert(id, addr);
        Some(id)
    }

    /// 记录连接状态转换，并维护活动连接集合。
    ///
    /// 进入 `New` 时加入集合，进入 `Hijacked` 或 `Closed` 时移出。开始关闭后拒绝新的连接，
    /// 返回 `false`。
    pub(crate) fn set_conn_state(&self, status: &Arc<ConnStatus>, state: ConnState) -> bool {
        match state {
            ConnState::New => {
                let mut tracked = self.tracked.lock().unwrap();
                if self.is_shutting_down() {
                    return false;
                }
                tracked.conns.insert(status.id(), status.clone());
            }
            ConnState::Hijacked | ConnState::Closed => {
                self.tracked.lock().unwrap().conns.remove(&status.id());
            }
            ConnState::Active | ConnState::Idle => {}
        }

        if !status.store(state) {
            return false;
        }
        if let Some(hook) = &self.conn_state {
            // 观测钩子的 panic 不能拖垮接受循环或者跳过连接的拆除
            let observed = panic::catch_unwind(AssertUnwindSafe(|| hook(status.remote_addr(), state)));
            if let Err(payload) = observed {
                error!(remote = %status.remote_addr(), %state, panic = %panic_message(&*payload), "状态钩子 panic");
            }
        }
        true
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("addr", &self.addr)
            .field("semaphore", &self.semaphore)
            .field("in_shutdown", &self.in_shutdown)
            .finish_non_exhaustive()
    }
}

/// 连接任务的入口。
///
/// 先通过准入控制，然后在故障边界内运行服务循环。无论以哪种方式结束，
/// 许可都只归还一次，连接都会被拆除。
async fn serve_connection(shared: Arc<Shared>, mut conn: Connection) {
    let Some(permit) = shared.semaphore.acquire(conn.shutdown()).await else {
        debug!(remote = %conn.remote_addr(), "连接数超过限制，拒绝连接");
        conn.reply_error(LIMIT_EXCEEDED).await;
        conn.close().await;
        return;
    };

    let res = {
        let serving = AssertUnwindSafe(conn.serve()).catch_unwind();
        tokio::pin!(serving);
        future::poll_fn(|cx| traced(|| serving.as_mut().poll(cx))).await
    };

    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(cause = %err, "连接错误"),
        Err(payload) => {
            let trace = take_panic_trace().unwrap_or_else(Backtrace::force_capture);
            let report = format!(
                "panic serving {}: {}\n{}",
                conn.remote_addr(),
                panic_message(&*payload),
                trace
            );
            error!(remote = %conn.remote_addr(), panic = %panic_message(&*payload), "处理程序 panic");
            if let Some(hook) = &shared.panic_hook {
                hook(&report);
            }
            conn.reply_error(INTERNAL_FAILURE).await;
        }
    }

    drop(permit);
    conn.close().await;
}

thread_local! {
    /// 当前线程是否正在轮询某个连接的服务循环。
    static TRACING_PANICS: Cell<bool> = const { Cell::new(false) };
    /// 服务循环中最近一次 panic 发生时的调用栈。
    static PANIC_TRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// 安装一次进程级的 panic 钩子，在 panic 现场记录调用栈，然后交给之前的钩子。
///
/// 栈展开之后再捕获只能看到恢复处的帧，所以必须在钩子里捕获。
/// 只有在 `traced` 内部发生的 panic 才会被记录。
fn install_panic_trace() {
    static INSTALL: Once = Once::new();

    INSTALL.call_once(|| {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if TRACING_PANICS.with(Cell::get) {
                PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            }
            prev(info);
        }));
    });
}

/// 在记录 panic 调用栈的情况下运行 `f`。
///
/// `catch_unwind` 在同一次 `poll` 中、同一个线程上拦截 panic，
/// 所以线程局部变量足以把调用栈交给恢复处。
fn traced<T>(f: impl FnOnce() -> T) -> T {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take());
    let prev = TRACING_PANICS.with(|armed| armed.replace(true));
    let out = f();
    TRACING_PANICS.with(|armed| armed.set(prev));
    out
}

fn take_panic_trace() -> Option<Backtrace> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// 对于可以通过重试恢复的接受错误，返回 `true`。
fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }

    // ENFILE / EMFILE：文件描述符耗尽，其他连接关闭后会恢复
    cfg!(unix) && matches!(err.raw_os_error(), Some(23) | Some(24))
}

/// 下一次退避时间：从 5 毫秒开始加倍，最多 1 秒。
fn next_backoff(prev: Duration) -> Duration {
    if prev.is_zero() {
        MIN_BACKOFF
    } else {
        (prev * 2).min(MAX_BACKOFF)
    }
}

/// 运行服务器，直到 `shutdown` future 完成。
///
/// `tokio::signal::ctrl_c()` 可以用作 `shutdown` 参数。这将监听 SIGINT 信号。
/// 信号到达后停止接受新连接，并等待所有活动连接结束。
pub async fn run(server: Server, listener: TcpListener, shutdown: impl Future) {
    tokio::select! {
        res = server.serve(listener) => {
            // 处理单个连接时遇到的错误不会冒泡到此点。
            match res {
                Err(Error::ServerClosed) | Ok(()) => {}
                Err(err) => error!(cause = %err, "接受失败"),
            }
        }
        _ = shutdown => {
            info!("正在关闭");
        }
    }

    server.shutdown().await;
}

/// 使用 `handler` 在 `addr` 上服务，直到出错。
pub async fn listen_and_serve(addr: impl Into<String>, handler: impl Handler) -> Result<()> {
    Server::builder().addr(addr).handler(handler).build().listen_and_serve().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn backoff_doubles_from_five_millis_up_to_one_second() {
        let mut backoff = Duration::ZERO;
        let mut seen = Vec::new();
        for _ in 0..10 {
            backoff = next_backoff(backoff);
            seen.push(backoff.as_millis());
        }
        assert_eq!(seen, vec![5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]);
    }

    #[test]
    fn transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        if cfg!(unix) {
            assert!(is_transient(&io::Error::from_raw_os_error(24)));
        }
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }

    #[test]
    fn empty_addr_falls_back_to_default() {
        let server = Server::builder().addr("").build();
        assert_eq!(server.addr(), DEFAULT_ADDR);
        assert!(!server.is_shutting_down());
        assert!(server.connections().is_empty());
    }

    #[tokio::test]
    async fn serve_after_shutdown_is_refused() {
        let server = Server::builder().build();
        server.shutdown().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(server.serve(listener).await, Err(Error::ServerClosed)));
        assert!(matches!(server.listen_and_serve().await, Err(Error::ServerClosed)));
    }

    #[inline(never)]
    fn deeply_nested_failure() {
        panic!("nested failure");
    }

    #[tokio::test]
    async fn panic_report_names_the_panicking_function() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let hook_reports = reports.clone();
        let server = Server::builder()
            .handler(crate::HandlerFunc::new(|_ctx, _w, _req| {
                Box::pin(async move {
                    deeply_nested_failure();
                })
            }))
            .panic_hook(move |report| hook_reports.lock().unwrap().push(report.to_string()))
            .build();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"*1\r\n$4\r\nBOOM\r\n").await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "-ERR internal failure\r\n");

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("nested failure"));
        assert!(reports[0].contains("deeply_nested_failure"), "{}", reports[0]);
    }

    #[tokio::test]
    async fn panicking_state_hook_does_not_stop_accepting() {
        let server = Server::builder()
            .conn_state(|_addr, state| {
                if state == ConnState::New {
                    panic!("observer failure");
                }
            })
            .build();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        for _ in 0..2 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
            let expected = b"-ERR unsupported command 'PING'\r\n";
            let mut reply = vec![0; expected.len()];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply[..], &expected[..]);
        }
        assert!(!serving.is_finished());
    }

    #[tokio::test]
    async fn shutdown_runs_registered_hooks_once() {
        let server = Server::builder().build();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server.register_on_shutdown(move || tx.send(()).unwrap());

        server.shutdown().await;
        server.shutdown().await;

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
