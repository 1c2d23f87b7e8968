//! Per-open-file read state.
//!
//! Reads start out serial over one ranged stream. Once a handle has read a
//! full read-ahead chunk sequentially it switches to a pipeline of
//! [`ReadAheadWindow`]s. Any read that does not continue where the last one
//! stopped tears the pipeline down and goes back to serial reads.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{FsError, Result};
use crate::fs::BucketFs;
use crate::inode::Inode;
use crate::read_buffer::ReadAheadWindow;
use crate::store::ByteStream;

/// Out-of-order reads after which read-ahead is no longer attempted.
pub const MAX_OOO_READS: u32 = 3;

#[derive(Default)]
struct ReadState {
    stream: Option<ByteStream>,
    read_buf_offset: u64,
    windows: VecDeque<ReadAheadWindow>,
    seq_read_amount: u64,
    num_ooo_read: u32,
}

impl ReadState {
    async fn close_windows(&mut self) {
        while let Some(mut w) = self.windows.pop_front() {
            w.close().await;
        }
    }
}

/// Snapshot of a handle's read state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStats {
    pub offset: u64,
    pub seq_read_amount: u64,
    pub num_ooo_read: u32,
    pub windows: usize,
    pub streaming: bool,
}

pub struct FileHandle {
    inode: Arc<Inode>,
    key: String,
    size: u64,
    state: Mutex<ReadState>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("ino", &self.inode.id())
            .field("key", &self.key)
            .field("size", &self.size)
            .finish()
    }
}

enum Chunk {
    Data(usize),
    Eof,
    StreamLost,
}

impl FileHandle {
    pub fn new(inode: Arc<Inode>, key: String, size: u64) -> Self {
        Self {
            inode,
            key,
            size,
            state: Mutex::new(ReadState::default()),
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub async fn stats(&self) -> ReadStats {
        let st = self.state.lock().await;
        ReadStats {
            offset: st.read_buf_offset,
            seq_read_amount: st.seq_read_amount,
            num_ooo_read: st.num_ooo_read,
            windows: st.windows.len(),
            streaming: st.stream.is_some(),
        }
    }

    /// Reads up to `size` bytes at `offset`. Short only at end of file or
    /// when the remote stream keeps failing.
    pub async fn read_file(&self, fs: &BucketFs, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.inode
            .log_fuse("ReadFile", format_args!("offset={} size={}", offset, size));
        if offset >= self.size {
            return Ok(Vec::new());
        }
        let want = (size as u64).min(self.size - offset) as usize;
        let mut buf = vec![0u8; want];

        let mut st = self.state.lock().await;
        if offset != st.read_buf_offset {
            debug!(
                "out of order read ino={} expected={} got={}",
                self.inode.id(),
                st.read_buf_offset,
                offset
            );
            st.num_ooo_read += 1;
            st.seq_read_amount = 0;
            st.stream = None;
            st.close_windows().await;
            st.read_buf_offset = offset;
        }

        let config = fs.config();
        let mut n = 0;
        let mut pipeline_failed = false;
        let mut stream_retried = false;
        while n < want {
            let eligible = !config.cheap
                && !pipeline_failed
                && st.num_ooo_read < MAX_OOO_READS
                && st.seq_read_amount >= config.readahead_chunk;
            if eligible {
                if let Err(e) = self.read_ahead(fs, &mut st) {
                    debug!("read-ahead unavailable ino={}: {}", self.inode.id(), e);
                    pipeline_failed = true;
                }
            }

            if !st.windows.is_empty() {
                match self.read_from_read_ahead(&mut st, &mut buf[n..]).await {
                    Ok(0) => {
                        // a window ran dry before its end
                        st.close_windows().await;
                        pipeline_failed = true;
                    }
                    Ok(m) => n += m,
                    Err(e) => {
                        debug!("read-ahead failed ino={}: {}", self.inode.id(), e);
                        st.close_windows().await;
                        pipeline_failed = true;
                    }
                }
                continue;
            }

            match self.read_serial(fs, &mut st, &mut buf[n..]).await {
                Ok(Chunk::Data(m)) => n += m,
                Ok(Chunk::Eof) => break,
                Ok(Chunk::StreamLost) if !stream_retried => stream_retried = true,
                Ok(Chunk::StreamLost) => break,
                Err(e) if n == 0 => return Err(e),
                Err(_) => break,
            }
        }

        buf.truncate(n);
        Ok(buf)
    }

    /// Tops the pipeline up to the read-ahead budget.
    ///
    /// Fails only when nothing at all could be scheduled.
    fn read_ahead(&self, fs: &BucketFs, st: &mut ReadState) -> Result<()> {
        let config = fs.config();
        let chunk = config.readahead_chunk.max(1);
        let max = config.max_readahead;

        let mut existing: u64 = st.windows.iter().map(|w| w.remaining()).sum();
        let mut next = st
            .windows
            .back()
            .map_or(st.read_buf_offset, |w| w.offset() + w.remaining());

        while max.saturating_sub(existing) >= chunk && next < self.size {
            let size = (max - existing).min(chunk).min(self.size - next);
            match ReadAheadWindow::try_new(
                fs.pool(),
                Arc::clone(fs.store()),
                fs.restorers(),
                self.key.clone(),
                next,
                size,
            ) {
                Some(w) => {
                    debug!(
                        "read-ahead ino={} offset={} size={}",
                        self.inode.id(),
                        next,
                        size
                    );
                    st.windows.push_back(w);
                    existing += size;
                    next += size;
                }
                None if st.windows.is_empty() => return Err(FsError::OutOfMemory),
                None => break,
            }
        }

        if !st.windows.is_empty() {
            st.stream = None;
        }
        Ok(())
    }

    async fn read_from_read_ahead(&self, st: &mut ReadState, dst: &mut [u8]) -> Result<usize> {
        let offset = st.read_buf_offset;
        let Some(w) = st.windows.front_mut() else {
            return Ok(0);
        };
        let m = w.read(offset, dst).await?;
        if w.remaining() == 0 {
            if let Some(mut done) = st.windows.pop_front() {
                done.close().await;
            }
        }
        st.read_buf_offset += m as u64;
        st.seq_read_amount += m as u64;
        Ok(m)
    }

    async fn read_serial(&self, fs: &BucketFs, st: &mut ReadState, dst: &mut [u8]) -> Result<Chunk> {
        if st.stream.is_none() {
            let range = st.read_buf_offset..self.size;
            debug!("open stream key={} range={:?}", self.key, range);
            st.stream = Some(fs.store().get(&self.key, Some(range)).await?);
        }
        let Some(stream) = st.stream.as_mut() else {
            return Ok(Chunk::Eof);
        };

        match stream.read(dst).await {
            Ok(0) => Ok(Chunk::Eof),
            Ok(m) => {
                st.read_buf_offset += m as u64;
                st.seq_read_amount += m as u64;
                Ok(Chunk::Data(m))
            }
            Err(e) => {
                debug!("stream error key={}: {}", self.key, e);
                st.stream = None;
                Ok(Chunk::StreamLost)
            }
        }
    }

    /// Drops every buffer and stream and gives up the inode's open count.
    pub async fn release(&self) {
        let mut st = self.state.lock().await;
        st.close_windows().await;
        st.stream = None;

        let mut ist = self.inode.lock();
        if ist.file_handles == 0 {
            panic!(
                "released file handle on {:?} with no open handles",
                self.inode.full_name()
            );
        }
        ist.file_handles -= 1;
    }
}
