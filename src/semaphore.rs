//! 连接准入控制。
//!
//! 使用 `Semaphore` 限制同时被服务的连接数。每个连接在开始服务前获取一个许可，
//! 许可在连接结束时被丢弃，从而自动归还给信号量。

use crate::{Error, Result, Shutdown};

use std::sync::Arc;
use tokio::sync::{self, OwnedSemaphorePermit};
use tokio::time::{self, Duration};

/// 阻塞策略下默认的最长等待时间。
pub const DEFAULT_WAIT: Duration = Duration::from_millis(100);

/// 没有配置准入控制时允许同时服务的最大连接数。
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// 获取许可失败时的处理方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// 拿不到许可就立即拒绝连接。
    NonBlocking,
    /// 最多等待 `wait`，超时后拒绝连接。
    Blocking { wait: Duration },
}

/// 带策略的计数信号量。
///
/// 克隆是浅拷贝，所有克隆共享同一组许可。
#[derive(Debug, Clone)]
pub struct Semaphore {
    permits: Arc<sync::Semaphore>,
    capacity: usize,
    policy: Policy,
}

/// 一个已授予的许可。丢弃时归还给信号量。
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Semaphore {
    /// 创建一个拥有 `capacity` 个许可的非阻塞信号量。
    ///
    /// # 错误
    ///
    /// `capacity` 为 0 或超过 tokio 信号量支持的上限时返回 `Error::Config`。
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("semaphore capacity must be at least 1".into()));
        }
        if capacity > sync::Semaphore::MAX_PERMITS {
            return Err(Error::Config(format!(
                "semaphore capacity must not exceed {}",
                sync::Semaphore::MAX_PERMITS
            )));
        }

        Ok(Self {
            permits: Arc::new(sync::Semaphore::new(capacity)),
            capacity,
            policy: Policy::NonBlocking,
        })
    }

    /// 切换到阻塞策略。`wait` 为零时使用 `DEFAULT_WAIT`。
    pub fn blocking(mut self, wait: Duration) -> Self {
        let wait = if wait.is_zero() { DEFAULT_WAIT } else { wait };
        self.policy = Policy::Blocking { wait };
        self
    }

    /// 切换到非阻塞策略。
    pub fn non_blocking(mut self) -> Self {
        self.policy = Policy::NonBlocking;
        self
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// 立即尝试获取一个许可。
    pub fn try_acquire(&self) -> Option<Permit> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    /// 按照配置的策略获取一个许可。
    ///
    /// 阻塞策略下，超时或者 `shutdown` 先触发都会返回 `None`。
    pub async fn acquire(&self, shutdown: &Shutdown) -> Option<Permit> {
        let wait = match self.policy {
            Policy::NonBlocking => return self.try_acquire(),
            Policy::Blocking { wait } => wait,
        };

        tokio::select! {
            res = time::timeout(wait, self.permits.clone().acquire_owned()) => {
                // 我们从不关闭信号量，`acquire_owned` 只可能超时
                match res {
                    Ok(Ok(permit)) => Some(Permit { _permit: permit }),
                    _ => None,
                }
            }
            _ = shutdown.recv() => None,
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self {
            permits: Arc::new(sync::Semaphore::new(DEFAULT_MAX_CONNECTIONS)),
            capacity: DEFAULT_MAX_CONNECTIONS,
            policy: Policy::NonBlocking,
        }
    }
}
