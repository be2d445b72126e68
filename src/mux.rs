//! 命令分发表。

use crate::handler::{not_found, HandlerFunc};
use crate::middleware::{chain, BoxMiddleware};
use crate::{BoxHandler, Context, Handler, Request, ResponseWriter};

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 从大写命令名称到处理程序的映射。
///
/// 注册应在开始服务之前完成。之后 `ServeMux` 被放进 `Arc` 里只读共享，
/// 并发查找不需要加锁。
pub struct ServeMux {
    routes: HashMap<String, BoxHandler>,
    not_found: BoxHandler,
}

impl ServeMux {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            not_found: not_found(),
        }
    }

    /// 在 `name` 下注册 `handler`。命令名称不区分大小写。
    ///
    /// # Panics
    ///
    /// 如果 `name` 为空，或者同名（不区分大小写）的命令已经注册，则会 panic。
    /// 路由错误是编程错误，应在启动时暴露。
    pub fn handle(&mut self, name: &str, handler: impl Handler) -> &mut Self {
        self.handle_arc(name, Arc::new(handler))
    }

    /// 与 `handle` 相同，但接收一个已共享的处理程序。
    ///
    /// # Panics
    ///
    /// 与 `handle` 相同。
    pub fn handle_arc(&mut self, name: &str, handler: BoxHandler) -> &mut Self {
        if name.is_empty() {
            panic!("invalid command name: empty");
        }

        let name = name.to_ascii_uppercase();
        if self.routes.contains_key(&name) {
            panic!("multiple registrations for {}", name);
        }

        self.routes.insert(name, handler);
        self
    }

    /// 用 `middleware` 包装 `f` 之后注册。第一个中间件在最外层。
    ///
    /// # Panics
    ///
    /// 与 `handle` 相同。
    pub fn handle_func<F, I>(&mut self, name: &str, f: F, middleware: I) -> &mut Self
    where
        F: for<'a> Fn(&'a Context, &'a mut ResponseWriter, &'a Request) -> BoxFuture<'a, ()> + Send + Sync + 'static,
        I: IntoIterator<Item = BoxMiddleware>,
        I::IntoIter: DoubleEndedIterator,
    {
        let handler = chain(Arc::new(HandlerFunc::new(f)), middleware);
        self.handle_arc(name, handler)
    }

    /// 替换未注册命令的处理程序。
    pub fn not_found(&mut self, handler: impl Handler) -> &mut Self {
        self.not_found = Arc::new(handler);
        self
    }

    /// 查找处理 `cmd` 的处理程序，未注册时返回默认的处理程序。
    pub fn route(&self, cmd: &str) -> &BoxHandler {
        self.routes.get(cmd).unwrap_or(&self.not_found)
    }

    /// 已注册的命令名称，按字母排序。
    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for ServeMux {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for ServeMux {
    fn serve<'a>(&'a self, ctx: &'a Context, w: &'a mut ResponseWriter, req: &'a Request) -> BoxFuture<'a, ()> {
        self.route(req.cmd()).serve(ctx, w, req)
    }
}

impl fmt::Debug for ServeMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServeMux").field("commands", &self.commands()).finish()
    }
}
