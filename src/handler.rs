use crate::{Context, Request, ResponseWriter};

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// 处理单个请求。
///
/// 回复通过 `ResponseWriter` 写回对端。处理程序返回之前，同一连接上的下一个请求不会被读取。
pub trait Handler: Send + Sync + 'static {
    fn serve<'a>(&'a self, ctx: &'a Context, w: &'a mut ResponseWriter, req: &'a Request) -> BoxFuture<'a, ()>;
}

/// 共享的处理程序句柄，分发表和中间件都以它为单位。
pub type BoxHandler = Arc<dyn Handler>;

/// 把普通函数或闭包适配为 `Handler`。
///
/// ```
/// use resp_server::{HandlerFunc, Handler};
///
/// let ping = HandlerFunc::new(|_ctx, w, _req| {
///     Box::pin(async move {
///         let _ = w.text("PONG").await;
///     })
/// });
/// # let _: &dyn Handler = &ping;
/// ```
pub struct HandlerFunc<F> {
    f: F,
}

impl<F> HandlerFunc<F>
where
    F: for<'a> Fn(&'a Context, &'a mut ResponseWriter, &'a Request) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Handler for HandlerFunc<F>
where
    F: for<'a> Fn(&'a Context, &'a mut ResponseWriter, &'a Request) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    fn serve<'a>(&'a self, ctx: &'a Context, w: &'a mut ResponseWriter, req: &'a Request) -> BoxFuture<'a, ()> {
        (self.f)(ctx, w, req)
    }
}

impl<F> fmt::Debug for HandlerFunc<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFunc").finish_non_exhaustive()
    }
}

/// 用闭包构造一个 `BoxHandler`。
pub fn handler_fn<F>(f: F) -> BoxHandler
where
    F: for<'a> Fn(&'a Context, &'a mut ResponseWriter, &'a Request) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(HandlerFunc::new(f))
}

/// 未注册命令的默认处理程序。
pub fn not_found() -> BoxHandler {
    handler_fn(|_ctx, w, req| {
        Box::pin(async move {
            let msg = format!("ERR unsupported command '{}'", req.cmd());
            let _ = w.error(msg).await;
        })
    })
}
