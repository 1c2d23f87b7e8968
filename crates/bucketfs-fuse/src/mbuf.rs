//! A read/write cursor spanning several pooled blocks.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::pool::{Block, BufferPool};

/// Presents a list of pooled blocks as one contiguous byte stream.
///
/// The write cursor (`wbuf`, `wp`) always stays at or ahead of the read
/// cursor (`rbuf`, `rp`).
pub struct MBuf {
    blocks: Vec<Block>,
    rbuf: usize,
    rp: usize,
    wbuf: usize,
    wp: usize,
}

impl MBuf {
    /// Reserves blocks for `size` bytes. With `block` unset this fails
    /// instead of waiting for memory.
    pub async fn init(pool: &Arc<BufferPool>, size: u64, block: bool) -> Option<MBuf> {
        let blocks = pool.request_multiple(size, block).await?;
        Some(Self::from_blocks(blocks))
    }

    pub fn from_blocks(blocks: Vec<Block>) -> MBuf {
        MBuf {
            blocks,
            rbuf: 0,
            rp: 0,
            wbuf: 0,
            wp: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    fn written(&self) -> usize {
        self.blocks[..self.wbuf].iter().map(|b| b.len()).sum::<usize>() + self.wp
    }

    fn consumed(&self) -> usize {
        self.blocks[..self.rbuf].iter().map(|b| b.len()).sum::<usize>() + self.rp
    }

    /// Bytes written but not yet read.
    pub fn buffered(&self) -> usize {
        if self.blocks.is_empty() {
            return 0;
        }
        self.written() - self.consumed()
    }

    pub fn is_full(&self) -> bool {
        match self.blocks.last() {
            Some(last) => self.wbuf + 1 == self.blocks.len() && self.wp == last.len(),
            None => true,
        }
    }

    /// Copies buffered bytes into `dst`. Returns 0 once everything written
    /// so far has been read.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut n = 0;
        while n < dst.len() && self.rbuf < self.blocks.len() {
            let limit = if self.rbuf == self.wbuf {
                self.wp
            } else {
                self.blocks[self.rbuf].len()
            };
            if self.rp == limit {
                if self.rbuf == self.wbuf {
                    break;
                }
                self.rbuf += 1;
                self.rp = 0;
                continue;
            }
            let len = (limit - self.rp).min(dst.len() - n);
            dst[n..n + len].copy_from_slice(&self.blocks[self.rbuf][self.rp..self.rp + len]);
            self.rp += len;
            n += len;
        }
        n
    }

    fn advance_write(&mut self) -> bool {
        let Some(cur) = self.blocks.get(self.wbuf) else {
            return false;
        };
        if self.wp < cur.len() {
            return true;
        }
        if self.wbuf + 1 < self.blocks.len() {
            self.wbuf += 1;
            self.wp = 0;
            return true;
        }
        false
    }

    /// Copies `src` into free space. Returns how much fit.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let mut n = 0;
        while n < src.len() && self.advance_write() {
            let block = &mut self.blocks[self.wbuf];
            let len = (block.len() - self.wp).min(src.len() - n);
            block[self.wp..self.wp + len].copy_from_slice(&src[n..n + len]);
            self.wp += len;
            n += len;
        }
        n
    }

    /// Performs one read from `reader` into the current block.
    ///
    /// Returns 0 when the buffer is full or the reader is at end of stream.
    pub async fn write_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if !self.advance_write() {
            return Ok(0);
        }
        let wp = self.wp;
        let n = reader.read(&mut self.blocks[self.wbuf][wp..]).await?;
        self.wp += n;
        Ok(n)
    }

    /// Returns every block to the pool.
    pub fn free(&mut self) {
        self.blocks.clear();
        self.rbuf = 0;
        self.rp = 0;
        self.wbuf = 0;
        self.wp = 0;
    }
}
