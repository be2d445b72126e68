//! 一个用于构建 Redis 协议 (RESP) 服务器的框架。
//!
//! 框架负责接受 TCP 连接、解析请求、按命令名称分发以及写回复，
//! 命令的语义完全由使用者注册的处理程序决定。
//!
//! ```no_run
//! use resp_server::{Server, ServeMux};
//!
//! # async fn doc() -> resp_server::Result<()> {
//! let mut mux = ServeMux::new();
//! mux.handle_func(
//!     "ping",
//!     |_ctx, w, _req| {
//!         Box::pin(async move {
//!             let _ = w.text("PONG").await;
//!         })
//!     },
//!     [],
//! );
//!
//! Server::builder().addr("127.0.0.1:6379").handler(mux).build().listen_and_serve().await
//! # }
//! ```

mod error;
pub use error::{Error, Result};

mod request;
pub use request::Request;

mod logger;
pub use logger::{Logger, LoggerFactory, TracingLogger};

mod shutdown;
pub use shutdown::Shutdown;

mod pool;

mod semaphore;
pub use semaphore::{Permit, Policy, Semaphore, DEFAULT_MAX_CONNECTIONS, DEFAULT_WAIT};

mod context;
pub use context::Context;

mod handler;
pub use handler::{handler_fn, not_found, BoxHandler, Handler, HandlerFunc};

mod middleware;
pub use middleware::{chain, BoxMiddleware, Middleware};

mod mux;
pub use mux::ServeMux;

mod transport;

mod response;
pub use response::{encode_bulk, encode_error, encode_text, Hijacked, ResponseWriter};

mod connection;
pub use connection::{ConnSnapshot, ConnState};

pub mod server;
pub use server::{listen_and_serve, run, Builder, Server};

/// 服务器监听的默认端口。
pub const DEFAULT_PORT: u16 = 6379;

/// 未指定地址时的监听地址。
pub const DEFAULT_ADDR: &str = "0.0.0.0:6379";
