use bytes::BytesMut;
use std::sync::Mutex;

/// 连接读缓冲区的对象池。
///
/// 纯粹是分配上的优化：缓冲区在放回池中之前会被清空，所以从池中取出的缓冲区
/// 永远不会带有上一个连接的数据。
#[derive(Debug)]
pub(crate) struct BufferPool {
    /// 新缓冲区的初始容量。归还的缓冲区至少保留这么多容量。
    size: usize,
    /// 池中最多保留的空闲缓冲区数量。
    max_idle: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub(crate) fn new(size: usize, max_idle: usize) -> Self {
        Self {
            size,
            max_idle,
            free: Mutex::new(Vec::new()),
        }
    }

    /// 取出一个空的缓冲区，池为空时新分配一个。
    pub(crate) fn get(&self) -> BytesMut {
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.size))
    }

    /// 重置缓冲区并归还给池。
    ///
    /// `advance` 之后 `capacity` 只从当前偏移量算起。对于空的、唯一持有的缓冲区，
    /// `reserve` 会把已消费的空间收回来，而不是重新分配。
    pub(crate) fn put(&self, mut buf: BytesMut) {
        buf.clear();
        buf.reserve(self.size);

        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    #[test]
    fn returned_buffers_are_reset() {
        let pool = BufferPool::new(64, 4);
        let mut buf = pool.get();
        buf.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        pool.put(buf);
        assert_eq!(pool.idle(), 1);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 64);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn pool_keeps_at_most_max_idle() {
        let pool = BufferPool::new(16, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.get()).collect();
        for buf in bufs {
            pool.put(buf);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn consumed_buffers_are_reused() {
        let pool = BufferPool::new(64, 4);
        let mut buf = pool.get();
        buf.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        buf.advance(buf.len());
        assert!(buf.capacity() < 64);

        pool.put(buf);
        assert_eq!(pool.idle(), 1);
        assert!(pool.get().capacity() >= 64);
    }

    #[test]
    fn small_buffers_are_topped_up() {
        let pool = BufferPool::new(1024, 2);
        pool.put(BytesMut::with_capacity(8));
        assert_eq!(pool.idle(), 1);
        assert!(pool.get().capacity() >= 1024);
    }
}
