use tokio_util::sync::CancellationToken;

/// 监听关闭信号。
///
/// 服务器持有根令牌，每个连接持有一个子令牌。根令牌被取消时所有连接都会收到信号，
/// 连接自己的拆除只取消它自己的子令牌。
///
/// 调用者可以查询关闭信号是否已被接收，或者等待它。
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// 派生一个子信号：父信号触发时它也会触发，反之不然。
    pub(crate) fn child(&self) -> Self {
        Self::new(self.token.child_token())
    }

    /// 如果关闭信号已被接收，则返回 `true`。
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 接收关闭通知，必要时等待。
    pub async fn recv(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn trigger(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_follows_parent_but_not_the_other_way() {
        let root = Shutdown::default();
        let a = root.child();
        let b = root.child();

        a.trigger();
        a.recv().await;
        assert!(!root.is_shutdown());
        assert!(!b.is_shutdown());

        root.trigger();
        b.recv().await;
        assert!(b.is_shutdown());
    }
}
