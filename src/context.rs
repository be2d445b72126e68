use crate::Shutdown;

use std::net::SocketAddr;

/// 传递给处理程序的连接级上下文。
///
/// `shutdown` 派生自服务器的根信号，在服务器关闭或者该连接自己拆除时触发。
#[derive(Debug, Clone)]
pub struct Context {
    conn_id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    shutdown: Shutdown,
}

impl Context {
    pub(crate) fn new(conn_id: u64, local_addr: SocketAddr, remote_addr: SocketAddr, shutdown: Shutdown) -> Self {
        Self {
            conn_id,
            local_addr,
            remote_addr,
            shutdown,
        }
    }

    /// 服务器内唯一的连接编号。
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// 接受此连接的监听地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// 等待直到此上下文被取消。长时间运行的处理程序可以用它配合 `select!` 提前退出。
    pub async fn cancelled(&self) {
        self.shutdown.recv().await
    }
}
