//! Packet buffer pool shared by the hot path and the writer worker.

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

/// Dataroom of a freshly created buffer. Buffers grow if a packet is larger.
pub const BUFFER_SIZE: usize = 2048;

/// A bounded pool of packet buffers.
///
/// Allocation is all-or-nothing and never blocks. An exhausted pool is a
/// transient condition: buffers come back once the writer has written them.
pub struct PacketPool {
    bufs: ArrayQueue<BytesMut>,
}

impl PacketPool {
    pub fn new(capacity: usize) -> Self {
        let bufs = ArrayQueue::new(capacity.max(1));
        for _ in 0..capacity.max(1) {
            let _ = bufs.push(BytesMut::with_capacity(BUFFER_SIZE));
        }
        Self { bufs }
    }

    /// Take `count` buffers, or none at all.
    #[must_use]
    pub fn alloc(&self, count: usize) -> Option<Vec<BytesMut>> {
        let mut ret = Vec::with_capacity(count);
        while ret.len() < count {
            match self.bufs.pop() {
                Some(b) => ret.push(b),
                None => {
                    for b in ret {
                        self.free(b);
                    }
                    return None;
                }
            }
        }
        Some(ret)
    }

    /// Return a buffer to the pool.
    pub fn free(&self, mut buf: BytesMut) {
        buf.clear();
        // Full means the buffer did not come from here; let it drop.
        let _ = self.bufs.push(buf);
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.bufs.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bufs.capacity()
    }
}
