use crate::BoxHandler;

use std::sync::Arc;

/// 包装一个处理程序，返回新的处理程序。
///
/// 任何 `Fn(BoxHandler) -> BoxHandler` 都是中间件。
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: BoxHandler) -> BoxHandler;
}

impl<F> Middleware for F
where
    F: Fn(BoxHandler) -> BoxHandler + Send + Sync,
{
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        self(next)
    }
}

/// 共享的中间件句柄。
pub type BoxMiddleware = Arc<dyn Middleware>;

/// 把 `middleware` 依次套在 `handler` 外面。
///
/// 列表中的第一个中间件在最外层：它最先看到请求，最后看到处理结果。
pub fn chain<I>(handler: BoxHandler, middleware: I) -> BoxHandler
where
    I: IntoIterator<Item = BoxMiddleware>,
    I::IntoIter: DoubleEndedIterator,
{
    middleware.into_iter().rev().fold(handler, |next, m| m.wrap(next))
}
