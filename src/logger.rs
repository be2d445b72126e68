//! 调用方提供的结构化日志接口。
//!
//! 服务器在每个请求被读取后调用一次日志工厂，得到一个新的 `Logger` 实例。
//! 处理程序可以通过 `add_meta` 附加只属于该请求的元数据，不会影响其他请求。

use std::fmt;
use std::sync::{Arc, Mutex};

/// 分级日志能力。
pub trait Logger: Send + Sync {
    fn debug(&self, args: fmt::Arguments<'_>);
    fn info(&self, args: fmt::Arguments<'_>);
    fn notice(&self, args: fmt::Arguments<'_>);
    fn warn(&self, args: fmt::Arguments<'_>);
    fn error(&self, args: fmt::Arguments<'_>);

    /// 附加一个键值对，此实例之后输出的每一行都会带上它。
    fn add_meta(&self, key: &str, value: &str);
}

/// 每个请求调用一次，用于创建新的日志实例。
pub type LoggerFactory = Arc<dyn Fn() -> Arc<dyn Logger> + Send + Sync>;

/// 把日志转发给 `tracing` 的 `Logger` 实现。
///
/// `tracing` 没有 notice 级别，notice 以 info 级别输出。
#[derive(Debug, Default)]
pub struct TracingLogger {
    meta: Mutex<Vec<(String, String)>>,
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回一个为每个请求创建 `TracingLogger` 的工厂。
    pub fn factory() -> LoggerFactory {
        Arc::new(|| Arc::new(TracingLogger::new()) as Arc<dyn Logger>)
    }

    fn prefix(&self) -> String {
        let meta = self.meta.lock().unwrap();
        meta.iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Logger for TracingLogger {
    fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!(meta = %self.prefix(), "{}", args);
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!(meta = %self.prefix(), "{}", args);
    }

    fn notice(&self, args: fmt::Arguments<'_>) {
        tracing::info!(meta = %self.prefix(), "{}", args);
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!(meta = %self.prefix(), "{}", args);
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!(meta = %self.prefix(), "{}", args);
    }

    fn add_meta(&self, key: &str, value: &str) {
        let mut meta = self.meta.lock().unwrap();
        match meta.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => meta.push((key.to_string(), value.to_string())),
        }
    }
}
