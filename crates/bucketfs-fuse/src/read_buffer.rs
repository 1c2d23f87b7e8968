//! One read-ahead window: a byte range of an object fetched in the background.

use std::sync::Arc;

use tracing::debug;

use crate::buffer::AsyncBuffer;
use crate::error::{FsError, Result};
use crate::mbuf::MBuf;
use crate::pool::BufferPool;
use crate::store::ObjectStore;
use crate::ticket::Ticket;

pub struct ReadAheadWindow {
    offset: u64,
    size: u64,
    buf: AsyncBuffer,
}

impl ReadAheadWindow {
    /// Schedules a fetch of `key[offset..offset + size]`.
    ///
    /// Returns `None` without waiting when the pool cannot supply the memory.
    ///
    /// The fetch itself waits for a `restorers` permit before opening.
    pub fn try_new(
        pool: &Arc<BufferPool>,
        store: Arc<dyn ObjectStore>,
        restorers: &Ticket,
        key: String,
        offset: u64,
        size: u64,
    ) -> Option<Self> {
        let blocks = pool.try_request(size)?;
        let restorers = restorers.clone();
        let open = Box::pin(async move {
            let _permit = restorers.take().await;
            debug!("readahead fetch key={} offset={} size={}", key, offset, size);
            store
                .get(&key, Some(offset..offset + size))
                .await
                .map_err(FsError::from)
        });
        Some(Self {
            offset,
            size,
            buf: AsyncBuffer::new(MBuf::from_blocks(blocks), open),
        })
    }

    /// Offset the next read must start at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.size
    }

    /// Fills `dst` from the window, stopping early only when the window runs dry.
    ///
    /// Windows are consumed strictly in order, so a read at any offset other
    /// than [`offset`](Self::offset) is a bug and aborts.
    pub async fn read(&mut self, offset: u64, dst: &mut [u8]) -> Result<usize> {
        if offset != self.offset {
            panic!(
                "read-ahead window expected offset {} got {}, {} left",
                self.offset, offset, self.size
            );
        }

        let mut n = 0;
        while n < dst.len() {
            match self.buf.read(&mut dst[n..]).await {
                Ok(0) => break,
                Ok(m) => n += m,
                Err(e) if n == 0 => return Err(e),
                Err(_) => break,
            }
        }

        if n as u64 > self.size {
            panic!("read-ahead window read {} bytes, only {} available", n, self.size);
        }
        self.offset += n as u64;
        self.size -= n as u64;
        Ok(n)
    }

    pub async fn close(&mut self) {
        self.buf.close().await;
    }
}
